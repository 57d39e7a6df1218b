//! Spawn point pool.
//!
//! Every slot is in exactly one of `available` or `used`, and every assigned
//! slot is in `used`. Allocation picks uniformly among available slots; once
//! the pool is exhausted a random position inside the fallback area is
//! handed out instead, unowned and never restored.

use std::collections::{BTreeSet, HashMap};

use rand::{rngs::StdRng, Rng, SeedableRng};
use spawn_shared::{
    config::{FallbackArea, SpawnPointDef},
    math::{Quat, Vec3},
    net::ClientId,
};
use tracing::{debug, warn};

/// Index of a static spawn point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct SlotId(pub usize);

/// Where an entity will be materialized.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    pub position: Vec3,
    pub rotation: Quat,
    /// `None` for fallback positions.
    pub slot: Option<SlotId>,
}

pub struct SpawnPointPool {
    slots: Vec<SpawnPointDef>,
    available: BTreeSet<SlotId>,
    used: BTreeSet<SlotId>,
    assignment: HashMap<ClientId, SlotId>,
    fallback: FallbackArea,
    rng: StdRng,
}

impl SpawnPointPool {
    pub fn new(slots: Vec<SpawnPointDef>, fallback: FallbackArea, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut pool = Self {
            slots,
            available: BTreeSet::new(),
            used: BTreeSet::new(),
            assignment: HashMap::new(),
            fallback,
            rng,
        };
        pool.reset_all();
        pool
    }

    /// Takes a random free slot, or a fallback position when none is left.
    pub fn allocate(&mut self) -> Placement {
        let pick = match self.available.len() {
            0 => None,
            n => self.available.iter().nth(self.rng.gen_range(0..n)).copied(),
        };
        let Some(slot) = pick else {
            return self.fallback_placement();
        };
        self.available.remove(&slot);
        self.used.insert(slot);

        let def = &self.slots[slot.0];
        debug!(slot = slot.0, position = ?def.position, "Allocated spawn point");
        Placement {
            position: def.position,
            rotation: def.rotation(),
            slot: Some(slot),
        }
    }

    fn fallback_placement(&mut self) -> Placement {
        let h = self.fallback.half_extent.abs();
        let c = self.fallback.center;
        let position = Vec3::new(
            c.x + self.rng.gen_range(-h..=h),
            c.y,
            c.z + self.rng.gen_range(-h..=h),
        );
        warn!(?position, "Spawn pool exhausted, using fallback position");
        Placement {
            position,
            rotation: Quat::from_yaw_degrees(self.rng.gen_range(0.0..360.0)),
            slot: None,
        }
    }

    /// Records which client owns an allocated slot. Fallback placements are ignored.
    pub fn bind(&mut self, client: ClientId, slot: Option<SlotId>) {
        let Some(slot) = slot else {
            return;
        };
        if let Some(previous) = self.assignment.insert(client, slot) {
            if previous != slot {
                warn!(client_id = ?client, slot = previous.0, "Client rebound, restoring old slot");
                self.restore(previous);
            }
        }
    }

    /// Returns the client's slot to the pool.
    pub fn release(&mut self, client: ClientId) -> Option<SlotId> {
        let slot = self.assignment.remove(&client)?;
        self.restore(slot);
        debug!(client_id = ?client, slot = slot.0, "Released spawn point");
        Some(slot)
    }

    /// Returns an allocated but never bound slot (spawn attempt failed).
    pub fn restore(&mut self, slot: SlotId) {
        self.used.remove(&slot);
        if self.available.contains(&slot) {
            warn!(slot = slot.0, "Slot already available, ignoring double release");
            return;
        }
        if slot.0 < self.slots.len() {
            self.available.insert(slot);
        }
    }

    /// Forgets every assignment and makes all slots available again.
    pub fn reset_all(&mut self) {
        self.used.clear();
        self.assignment.clear();
        self.available = (0..self.slots.len()).map(SlotId).collect();
    }

    pub fn slot_of(&self, client: ClientId) -> Option<SlotId> {
        self.assignment.get(&client).copied()
    }

    pub fn available_count(&self) -> usize {
        self.available.len()
    }

    pub fn used_count(&self) -> usize {
        self.used.len()
    }

    pub fn total(&self) -> usize {
        self.slots.len()
    }
}
