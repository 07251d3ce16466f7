//! Recovery tests: transaction-log replay and reloading a persisted world.
//!
//! Both paths must land on the same world state hash as the engine that
//! originally ran the ticks.

use std::sync::Arc;

use cardinal_engine::prelude::*;
use rand::Rng;

// -- Components and messages --------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
struct Position {
    x: i64,
    y: i64,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
struct Loot(u32);

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct Spawn {
    x: i64,
    y: i64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct Despawn {
    target: EntityId,
}

/// Every engine built here has identical registrations, so logs and stores
/// produced by one can be consumed by another.
fn build(mut engine: Engine) -> (Engine, MessageType<Spawn, EntityId>, MessageType<Despawn, ()>) {
    engine.register_component::<Position>("Position").unwrap();
    engine.register_component::<Loot>("Loot").unwrap();
    let spawn = engine.register_message::<Spawn, EntityId>("spawn").unwrap();
    let despawn = engine.register_message::<Despawn, ()>("despawn").unwrap();

    engine
        .register_system("spawning", move |ctx| {
            spawn.each(ctx, |ctx, tx| {
                // Seeded per tick, so replays roll the same loot.
                let loot = ctx.rng().gen_range(0..100);
                let id = ctx.world_mut().create(
                    ComponentBundle::new()
                        .with(Position { x: tx.msg.x, y: tx.msg.y })
                        .with(Loot(loot)),
                )?;
                Ok(id)
            });
            Ok(())
        })
        .unwrap();
    engine
        .register_system("despawning", move |ctx| {
            despawn.each(ctx, |ctx, tx| {
                ctx.world_mut().remove(tx.msg.target)?;
                Ok(())
            });
            Ok(())
        })
        .unwrap();
    engine
        .register_system("drift", |ctx| {
            let tick = ctx.current_tick() as i64;
            for e in ctx.world().entity_ids() {
                ctx.world_mut()
                    .update_component::<Position, _>(e, |p| p.x += tick)?;
            }
            Ok(())
        })
        .unwrap();
    (engine, spawn, despawn)
}

fn memory_engine() -> (Engine, MessageType<Spawn, EntityId>, MessageType<Despawn, ()>) {
    build(Engine::new(EngineConfig::default()).unwrap())
}

fn kv_engine(kv: &MemoryKv) -> (Engine, MessageType<Spawn, EntityId>, MessageType<Despawn, ()>) {
    let store = KvColumnStore::new(Arc::new(kv.clone()), "world-1");
    build(Engine::with_store(EngineConfig::default(), Box::new(store)).unwrap())
}

/// Run a fixed scenario of spawns, idle ticks and despawns.
fn play(engine: &mut Engine, spawn: MessageType<Spawn, EntityId>, despawn: MessageType<Despawn, ()>) {
    let pool = engine.pool();
    for i in 0..5 {
        spawn.add_to_pool(&pool, &Spawn { x: i, y: -i }, None).unwrap();
    }
    engine.tick_at(1_000).unwrap();
    engine.tick_at(2_000).unwrap();
    engine.tick_at(3_000).unwrap();

    let mut ids = engine.world().entity_ids();
    ids.sort();
    despawn.add_to_pool(&pool, &Despawn { target: ids[1] }, None).unwrap();
    spawn.add_to_pool(&pool, &Spawn { x: 9, y: 9 }, None).unwrap();
    engine.tick_at(4_000).unwrap();
    engine.tick_at(5_000).unwrap();
}

// -- 1. Transaction log replay ------------------------------------------------

#[test]
fn replayed_log_reaches_the_same_state() {
    let (mut live, spawn, despawn) = memory_engine();
    live.start().unwrap();
    live.record_transactions();
    play(&mut live, spawn, despawn);

    let log = live.take_tx_log().unwrap();
    assert_eq!(log.batches.len(), 5);
    assert_eq!(log.transaction_count(), 7);

    let (mut restored, _, _) = memory_engine();
    restored.start().unwrap();
    assert_eq!(restored.recover(&log).unwrap(), 5);

    assert_eq!(restored.current_tick(), live.current_tick());
    assert_eq!(
        restored.world().state_hash().unwrap(),
        live.world().state_hash().unwrap()
    );
    restored.world().check_consistency().unwrap();
}

#[test]
fn log_survives_serialization() {
    let (mut live, spawn, despawn) = memory_engine();
    live.start().unwrap();
    live.record_transactions();
    play(&mut live, spawn, despawn);

    let text = live.tx_log().unwrap().to_json().unwrap();
    let log = TxLog::from_json(&text).unwrap();

    let (mut restored, _, _) = memory_engine();
    restored.start().unwrap();
    restored.recover(&log).unwrap();
    assert_eq!(
        restored.world().state_hash().unwrap(),
        live.world().state_hash().unwrap()
    );
}

#[test]
fn receipts_are_rebuilt_during_recovery() {
    let (mut live, spawn, despawn) = memory_engine();
    live.start().unwrap();
    live.record_transactions();
    play(&mut live, spawn, despawn);

    let (mut restored, _, _) = memory_engine();
    restored.start().unwrap();
    restored.recover(live.tx_log().unwrap()).unwrap();

    for tick in 0..5 {
        assert_eq!(
            restored.get_receipts_for_tick(tick).unwrap(),
            live.get_receipts_for_tick(tick).unwrap()
        );
    }
}

// -- 2. Persisted world reload --------------------------------------------------

#[test]
fn kv_backed_world_reloads_on_start() {
    let kv = MemoryKv::new();
    let (mut live, spawn, despawn) = kv_engine(&kv);
    assert_eq!(live.start().unwrap(), None);
    play(&mut live, spawn, despawn);
    let hash = live.world().state_hash().unwrap();
    drop(live);

    let (mut reloaded, spawn, _) = kv_engine(&kv);
    assert_eq!(reloaded.start().unwrap(), Some(5));
    assert_eq!(reloaded.current_tick(), 5);
    assert_eq!(reloaded.world().state_hash().unwrap(), hash);
    reloaded.world().check_consistency().unwrap();

    // The reloaded engine keeps ticking from where it left off.
    spawn
        .add_to_pool(&reloaded.pool(), &Spawn { x: 0, y: 0 }, None)
        .unwrap();
    let report = reloaded.tick_at(6_000).unwrap();
    assert_eq!(report.tick, 5);
    assert_eq!(reloaded.get_receipts_for_tick(5).unwrap().len(), 1);
}

#[test]
fn storage_outage_fails_the_tick() {
    let kv = MemoryKv::new();
    let (mut engine, spawn, _) = kv_engine(&kv);
    engine.start().unwrap();
    engine.tick_at(1_000).unwrap();
    let before = engine.world().state_hash().unwrap();

    kv.set_available(false);
    spawn
        .add_to_pool(&engine.pool(), &Spawn { x: 1, y: 1 }, None)
        .unwrap();
    let err = engine.tick_at(2_000).unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(engine.current_tick(), 1);
    assert_eq!(engine.pool().count_pending(), 1);
    assert_eq!(engine.world().entity_count(), 0);

    kv.set_available(true);
    assert_eq!(engine.world().state_hash().unwrap(), before);
    let report = engine.tick_at(2_000).unwrap();
    assert_eq!(report.tick, 1);
    assert_eq!(engine.world().entity_count(), 1);
}

// -- 3. Interrupted ticks ---------------------------------------------------------

/// A KV-backed engine whose last system fails on tick 1, after the spawns of
/// that tick have already been applied in memory.
fn jammed_engine(kv: &MemoryKv) -> (Engine, MessageType<Spawn, EntityId>) {
    let (mut engine, spawn, _) = kv_engine(kv);
    engine
        .register_system("jam", |ctx| {
            if ctx.current_tick() == 1 {
                anyhow::bail!("disk full");
            }
            Ok(())
        })
        .unwrap();
    (engine, spawn)
}

#[test]
fn failed_tick_writes_never_reach_the_store() {
    let kv = MemoryKv::new();
    let (mut engine, spawn) = jammed_engine(&kv);
    engine.start().unwrap();
    engine.tick_at(1_000).unwrap();
    spawn
        .add_to_pool(&engine.pool(), &Spawn { x: 7, y: 7 }, None)
        .unwrap();
    assert!(engine.tick_at(2_000).is_err());
    assert_eq!(engine.world().entity_count(), 0);
    drop(engine);

    // A plain world over the same keys sees only the committed tick.
    let mut world = World::with_store(Box::new(KvColumnStore::new(Arc::new(kv.clone()), "world-1")));
    world.register_component::<Position>("Position").unwrap();
    world.register_component::<Loot>("Loot").unwrap();
    assert_eq!(world.load().unwrap(), Some(1));
    assert_eq!(world.entity_count(), 0);
    assert_eq!(world.pending_tick().unwrap().map(|(tick, _)| tick), Some(1));
}

#[test]
fn interrupted_tick_is_resumed_on_start() {
    let kv = MemoryKv::new();
    let (mut engine, spawn) = jammed_engine(&kv);
    engine.start().unwrap();
    engine.tick_at(1_000).unwrap();
    let hash = spawn
        .add_to_pool(&engine.pool(), &Spawn { x: 7, y: 7 }, None)
        .unwrap();
    assert!(engine.tick_at(2_000).is_err());
    drop(engine);

    let (mut resumed, _, _) = kv_engine(&kv);
    assert_eq!(resumed.start().unwrap(), Some(2));
    assert_eq!(resumed.current_tick(), 2);
    assert_eq!(resumed.world().entity_count(), 1);
    let receipts = resumed.get_receipts_for_tick(1).unwrap();
    assert_eq!(receipts.len(), 1);
    assert_eq!(receipts[0].tx_hash, hash);
    assert!(resumed.world().pending_tick().unwrap().is_none());

    // Same inputs on a store that never failed.
    let clean_kv = MemoryKv::new();
    let (mut clean, spawn, _) = kv_engine(&clean_kv);
    clean.start().unwrap();
    clean.tick_at(1_000).unwrap();
    spawn
        .add_to_pool(&clean.pool(), &Spawn { x: 7, y: 7 }, None)
        .unwrap();
    clean.tick_at(2_000).unwrap();
    assert_eq!(
        resumed.world().state_hash().unwrap(),
        clean.world().state_hash().unwrap()
    );
}
