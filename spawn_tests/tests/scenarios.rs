//! End-to-end spawn scenarios driven through the orchestrator with an
//! in-memory session and a synthetic clock.

use std::collections::BTreeSet;

use rand::{rngs::StdRng, Rng, SeedableRng};
use spawn_server::{LifecycleState, SpawnSession};
use spawn_shared::{
    config::TriggerMode,
    event::{SessionEvent, SpawnSignal},
    net::{ClientId, ExternalId},
};
use spawn_tests::{init_tracing, spawn_config, FlakyFactory, Sim};

#[test]
fn two_ready_clients_take_distinct_points() {
    init_tracing();
    let mut sim = Sim::new(spawn_config(3, TriggerMode::Scene));
    sim.connect(1, 0);
    sim.connect(2, 0);
    sim.init(0).unwrap();

    sim.scene_loaded(&[1, 2], &[], 100);
    sim.advance(600);

    assert_eq!(sim.state(1), LifecycleState::Spawned);
    assert_eq!(sim.state(2), LifecycleState::Spawned);
    let a = sim.orch.pool().slot_of(ClientId(1)).unwrap();
    let b = sim.orch.pool().slot_of(ClientId(2)).unwrap();
    assert_ne!(a, b);
    assert_eq!(sim.orch.pool().available_count(), 1);
    assert_eq!(sim.finished_count(), 1);
}

#[test]
fn pool_exhaustion_falls_back_without_ownership() {
    let mut sim = Sim::new(spawn_config(1, TriggerMode::Scene));
    sim.connect(1, 0);
    sim.connect(2, 0);
    sim.init(0).unwrap();

    sim.scene_loaded(&[1, 2], &[], 0);
    sim.advance(500);

    assert!(sim.is_spawned(1));
    assert!(sim.is_spawned(2));
    let slots: Vec<_> = [1, 2]
        .iter()
        .map(|id| sim.orch.pool().slot_of(ClientId(*id)))
        .collect();
    assert_eq!(slots.iter().filter(|s| s.is_some()).count(), 1);
    assert_eq!(sim.orch.pool().used_count(), 1);

    // The fallback client still got a concrete position.
    let positions: Vec<_> = sim
        .signals
        .iter()
        .filter_map(|s| match s {
            SpawnSignal::PlayerSpawned { position, .. } => Some(*position),
            _ => None,
        })
        .collect();
    assert_eq!(positions.len(), 2);
    assert!(positions.iter().all(|p| p.x.is_finite() && p.z.is_finite()));
}

#[test]
fn disconnect_during_delay_leaks_nothing() {
    let mut sim = Sim::new(spawn_config(3, TriggerMode::Scene));
    let before = sim.orch.pool().available_count();
    sim.connect(1, 0);
    sim.connect(2, 0);
    sim.init(0).unwrap();
    sim.scene_loaded(&[1, 2], &[], 100);

    sim.disconnect(2, 300);
    sim.advance(600);

    assert!(sim.is_spawned(1));
    assert!(!sim.is_spawned(2));
    assert_eq!(sim.spawned_signals_for(2), 0);
    assert_eq!(sim.orch.factory().world().len(), 1);

    sim.disconnect(1, 700);
    sim.advance(5_000);
    assert_eq!(sim.orch.pool().available_count(), before);
    assert!(sim.orch.factory().world().is_empty());
}

#[test]
fn silent_scene_client_is_promoted_by_sweep() {
    let mut sim = Sim::new(spawn_config(3, TriggerMode::Scene));
    sim.connect(1, 0);
    sim.init(0).unwrap();
    sim.scene_loaded(&[1], &[], 100);
    sim.advance(600);
    assert!(sim.is_spawned(1));

    // Joins after the load and never acknowledges it.
    sim.connect(2, 1_000);
    sim.advance(6_500);
    assert_eq!(sim.state(2), LifecycleState::WaitingForScene);

    sim.advance(8_000);
    assert_eq!(sim.state(2), LifecycleState::Spawned);
}

#[test]
fn stuck_connection_client_is_force_spawned() {
    let mut config = spawn_config(3, TriggerMode::Connection);
    // Keep the watchdog out of the way so only the sweep can recover.
    config.watchdog_grace_seconds = 60.0;
    let mut sim = Sim::with_factory(config, FlakyFactory::new(1));
    sim.init(0).unwrap();

    sim.connect(1, 100);
    sim.advance(600);
    assert_eq!(sim.state(1), LifecycleState::Connected);

    sim.advance(5_500);
    assert_eq!(sim.state(1), LifecycleState::Connected);

    sim.advance(6_000);
    assert_eq!(sim.state(1), LifecycleState::Spawned);
    assert_eq!(sim.orch.factory().calls, 2);
}

#[test]
fn kick_removes_exactly_the_resolved_connection() {
    let mut sim = Sim::new(spawn_config(4, TriggerMode::Scene));
    sim.connect_as(1, "alice", 0);
    sim.connect_as(2, "bob", 0);
    sim.connect_as(3, "carol", 0);
    sim.init(0).unwrap();
    sim.scene_loaded(&[1, 2, 3], &[], 100);
    sim.advance(600);
    assert_eq!(sim.orch.spawned_count(), 3);

    sim.event(SessionEvent::MembershipPlayerKicked(ExternalId::new("bob")), 700);

    assert_eq!(sim.session.disconnects(), &[(ClientId(2), "kicked".to_string())]);
    assert_eq!(sim.state(2), LifecycleState::Disconnected);
    assert_eq!(sim.state(1), LifecycleState::Spawned);
    assert_eq!(sim.state(3), LifecycleState::Spawned);
    assert_eq!(sim.orch.factory().world().len(), 2);
    assert_eq!(sim.orch.pool().used_count(), 2);
    let despawned: Vec<_> = sim
        .signals
        .iter()
        .filter_map(|s| match s {
            SpawnSignal::PlayerDespawned { client, .. } => Some(*client),
            _ => None,
        })
        .collect();
    assert_eq!(despawned, vec![ClientId(2)]);
}

#[test]
fn unknown_kick_target_changes_nothing() {
    let mut sim = Sim::new(spawn_config(2, TriggerMode::Scene));
    sim.connect_as(1, "alice", 0);
    sim.init(0).unwrap();
    sim.scene_loaded(&[1], &[], 0);
    sim.advance(500);

    sim.event(SessionEvent::MembershipPlayerKicked(ExternalId::new("mallory")), 600);
    assert!(sim.session.disconnects().is_empty());
    assert!(sim.is_spawned(1));
}

#[test]
fn n_ready_clients_within_pool_size_all_spawn_once() {
    for n in 1..=6u32 {
        let mut sim = Sim::new(spawn_config(6, TriggerMode::Scene));
        for id in 1..=n {
            sim.connect(id, 0);
        }
        sim.init(0).unwrap();
        let ids: Vec<u32> = (1..=n).collect();
        sim.scene_loaded(&ids, &[], 0);
        sim.advance(30_000);

        assert_eq!(sim.orch.spawned_count(), n as usize, "n={n}");
        for id in 1..=n {
            assert_eq!(sim.spawned_signals_for(id), 1, "n={n} id={id}");
        }
        assert_eq!(sim.finished_count(), 1, "n={n}");
        assert!(matches!(sim.signals.last(), Some(SpawnSignal::FinishedSpawning)));
    }
}

#[test]
fn session_removed_cleans_everything() {
    let mut sim = Sim::new(spawn_config(3, TriggerMode::Connection));
    sim.init(0).unwrap();
    sim.connect(1, 0);
    sim.connect(2, 0);
    sim.advance(500);
    assert_eq!(sim.orch.spawned_count(), 2);

    sim.event(SessionEvent::MembershipSessionRemoved, 600);
    assert_eq!(sim.orch.spawned_count(), 0);
    assert!(sim.orch.factory().world().is_empty());
    assert_eq!(sim.orch.pool().available_count(), 3);
    assert!(sim.orch.tracker().is_empty());

    // Repeating it is a no-op.
    sim.event(SessionEvent::MembershipSessionRemoved, 700);
    assert!(sim.orch.factory().world().is_empty());
}

#[test]
fn reconnect_during_delay_waits_for_fresh_acknowledgement() {
    let mut sim = Sim::new(spawn_config(3, TriggerMode::Scene));
    sim.connect(1, 0);
    sim.init(0).unwrap();
    sim.scene_loaded(&[1], &[], 0);

    sim.disconnect(1, 100);
    sim.connect(1, 200);
    sim.advance(1_000);
    assert_eq!(sim.state(1), LifecycleState::WaitingForScene);

    sim.scene_synced(1, 1_000);
    sim.advance(1_500);
    assert_eq!(sim.state(1), LifecycleState::Spawned);
    assert_eq!(sim.spawned_signals_for(1), 1);
}

/// Random connect/leave/ready/kick churn; checks pool and signal invariants
/// after every step.
#[test]
fn random_churn_keeps_invariants() {
    const MAX_ID: u32 = 8;

    for seed in 0..16u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut config = spawn_config(4, TriggerMode::Scene);
        config.rng_seed = Some(seed);
        let mut sim = Sim::new(config);
        sim.init(0).unwrap();

        let mut ms = 0u64;
        let mut scene_loaded = false;
        for step in 0..300 {
            let id = rng.gen_range(1..=MAX_ID);
            let connected = sim.session.is_connected(ClientId(id));
            match rng.gen_range(0..6) {
                0 if !connected => sim.connect_as(id, &format!("p{id}"), ms),
                1 if connected => sim.disconnect(id, ms),
                2 if connected => sim.scene_synced(id, ms),
                3 if !scene_loaded => {
                    let ids: Vec<u32> = sim
                        .session
                        .connected_clients()
                        .iter()
                        .map(|c| c.0)
                        .collect();
                    sim.scene_loaded(&ids, &[], ms);
                    scene_loaded = true;
                }
                4 => {
                    ms += rng.gen_range(0..1_500);
                    sim.advance(ms);
                }
                5 => sim.event(
                    SessionEvent::MembershipPlayerKicked(ExternalId::new(format!("p{id}"))),
                    ms,
                ),
                _ => {}
            }
            check_invariants(&sim, MAX_ID, seed, step);
        }

        // Everyone still connected converges to spawned.
        if !scene_loaded {
            sim.scene_loaded(&[], &[], ms);
        }
        ms += 30_000;
        sim.advance(ms);
        check_invariants(&sim, MAX_ID, seed, usize::MAX);
        for id in sim.session.connected_clients() {
            assert_eq!(
                sim.orch.get_state(id),
                LifecycleState::Spawned,
                "seed={seed} id={id}"
            );
        }
    }
}

fn check_invariants(sim: &Sim, max_id: u32, seed: u64, step: usize) {
    let pool = sim.orch.pool();
    assert_eq!(
        pool.used_count() + pool.available_count(),
        pool.total(),
        "seed={seed} step={step}"
    );

    let mut slots = BTreeSet::new();
    let mut owned = 0;
    for id in (1..=max_id).map(ClientId) {
        if let Some(slot) = pool.slot_of(id) {
            assert!(slots.insert(slot), "slot shared, seed={seed} step={step}");
            owned += 1;
        }
        if sim.orch.spawned_entity(id).is_some() {
            assert!(sim.session.is_connected(id), "ghost spawn, seed={seed} step={step}");
        }
    }
    assert_eq!(owned, pool.used_count(), "seed={seed} step={step}");
    assert_eq!(
        sim.orch.factory().world().len(),
        sim.orch.spawned_count(),
        "seed={seed} step={step}"
    );
    assert!(sim.finished_count() <= 1, "seed={seed} step={step}");
}
