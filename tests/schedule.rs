use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use keel::*;

#[derive(Clone, Copy, Debug, PartialEq)]
struct Position(f32);

#[derive(Clone, Copy, Debug, PartialEq)]
struct Velocity(f32);

const UPDATE: ScheduleId = ScheduleId("update");
const MAIN: ScheduleId = ScheduleId("main");
const LATE: ScheduleId = ScheduleId("late");

fn world_with_bodies(count: usize) -> World {
    let mut world = World::new();
    for _ in 0..count {
        let e = world.create_entity();
        world.add(e, Position(0.0));
        world.add(e, Velocity(0.0));
    }
    world
}

struct NudgePositions;

impl System for NudgePositions {
    fn access(&self) -> AccessPolicy {
        AccessPolicy::new().query::<&mut Position>()
    }

    fn run(&mut self, ctx: &mut SystemContext) {
        for position in ctx.query::<&mut Position>().iter() {
            position.0 += 1.0;
        }
    }
}

struct NudgeVelocities;

impl System for NudgeVelocities {
    fn access(&self) -> AccessPolicy {
        AccessPolicy::new().query::<&mut Velocity>()
    }

    fn run(&mut self, ctx: &mut SystemContext) {
        for velocity in ctx.query::<&mut Velocity>().iter() {
            velocity.0 += 2.0;
        }
    }
}

/// Writes Position; conflicts with `CopyPositionToVelocity`.
struct AdvancePositions;

impl System for AdvancePositions {
    fn access(&self) -> AccessPolicy {
        AccessPolicy::new().query::<&mut Position>()
    }

    fn run(&mut self, ctx: &mut SystemContext) {
        for position in ctx.query::<&mut Position>().iter() {
            position.0 += 1.0;
        }
    }
}

/// Reads Position, writes Velocity; must observe same-tick position writes.
struct CopyPositionToVelocity;

impl System for CopyPositionToVelocity {
    fn access(&self) -> AccessPolicy {
        AccessPolicy::new().query::<(&Position, &mut Velocity)>()
    }

    fn run(&mut self, ctx: &mut SystemContext) {
        for (position, velocity) in ctx.query::<(&Position, &mut Velocity)>().iter() {
            velocity.0 = position.0;
        }
    }
}

#[test]
fn non_conflicting_systems_share_a_schedule() {
    let mut world = world_with_bodies(16);
    let mut scheduler = Scheduler::new();
    scheduler.add_schedule(UPDATE, Stage::Update);
    scheduler.add_system(UPDATE, NudgePositions);
    scheduler.add_system(UPDATE, NudgeVelocities);
    scheduler.build_all_graphs(&mut world);

    let pool = TaskPool::new(4);
    for tick in 1..=1000u64 {
        scheduler.run_tick(&mut world, &pool);
        assert_eq!(scheduler.execution_count::<NudgePositions>(UPDATE), Some(tick));
        assert_eq!(scheduler.execution_count::<NudgeVelocities>(UPDATE), Some(tick));
    }

    let mut query = world.query::<(&Position, &Velocity)>();
    for (position, velocity) in query.iter() {
        assert_eq!(position.0, 1000.0);
        assert_eq!(velocity.0, 2000.0);
    }
}

#[test]
fn conflicting_systems_serialize_in_registration_order() {
    let mut world = world_with_bodies(16);
    let mut scheduler = Scheduler::new();
    scheduler.add_schedule(UPDATE, Stage::Update);
    scheduler.add_system(UPDATE, AdvancePositions);
    scheduler.add_system(UPDATE, CopyPositionToVelocity);
    scheduler.build_all_graphs(&mut world);

    let pool = TaskPool::new(4);
    for _ in 0..1000 {
        scheduler.run_tick(&mut world, &pool);
    }

    // The reader saw the writer's output within every tick; with the order
    // reversed it would trail by one.
    let mut query = world.query::<(&Position, &Velocity)>();
    for (position, velocity) in query.iter() {
        assert_eq!(position.0, 1000.0);
        assert_eq!(velocity.0, 1000.0);
    }
}

struct Spawner {
    spawned: Arc<Mutex<Option<Entity>>>,
    visible_during_update: Arc<AtomicBool>,
}

impl System for Spawner {
    fn run(&mut self, ctx: &mut SystemContext) {
        let mut spawned = self.spawned.lock().unwrap();
        if spawned.is_none() {
            let entity = {
                let mut commands = ctx.spawn();
                commands.add(Position(1.0));
                commands.entity()
            };
            self.visible_during_update
                .store(ctx.world().has::<Position>(entity), Ordering::Relaxed);
            *spawned = Some(entity);
        }
    }
}

struct SpawnChecker {
    spawned: Arc<Mutex<Option<Entity>>>,
    visible_later: Arc<AtomicBool>,
}

impl System for SpawnChecker {
    fn run(&mut self, ctx: &mut SystemContext) {
        if let Some(entity) = *self.spawned.lock().unwrap() {
            let world = ctx.world();
            let ok = world.is_valid(entity)
                && world
                    .try_get::<Position>(entity)
                    .is_some_and(|p| *p == Position(1.0));
            self.visible_later.store(ok, Ordering::Relaxed);
        }
    }
}

#[test]
fn commands_defer_to_the_next_schedule_boundary() {
    let spawned = Arc::new(Mutex::new(None));
    let visible_during_update = Arc::new(AtomicBool::new(true));
    let visible_later = Arc::new(AtomicBool::new(false));

    let mut world = World::new();
    let mut scheduler = Scheduler::new();
    scheduler.add_schedule(UPDATE, Stage::Update);
    scheduler.add_schedule(LATE, Stage::Cleanup);
    scheduler.add_system(
        UPDATE,
        Spawner {
            spawned: Arc::clone(&spawned),
            visible_during_update: Arc::clone(&visible_during_update),
        },
    );
    scheduler.add_system(
        LATE,
        SpawnChecker {
            spawned: Arc::clone(&spawned),
            visible_later: Arc::clone(&visible_later),
        },
    );
    scheduler.build_all_graphs(&mut world);

    let pool = TaskPool::new(2);
    scheduler.run_tick(&mut world, &pool);

    // Invisible inside the spawning system's own update, visible one
    // schedule boundary later.
    assert!(!visible_during_update.load(Ordering::Relaxed));
    assert!(visible_later.load(Ordering::Relaxed));

    let entity = spawned.lock().unwrap().expect("spawned");
    assert_eq!(*world.get::<Position>(entity).unwrap(), Position(1.0));
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct Ping(u32);

struct SendPing;

impl System for SendPing {
    fn run(&mut self, ctx: &mut SystemContext) {
        ctx.send(Ping(1));
    }
}

struct CountPings {
    seen: Arc<AtomicU32>,
}

impl System for CountPings {
    fn run(&mut self, ctx: &mut SystemContext) {
        self.seen
            .store(ctx.read_events::<Ping>().len() as u32, Ordering::Relaxed);
    }
}

#[test]
fn main_stage_events_are_visible_within_the_schedule() {
    let seen = Arc::new(AtomicU32::new(0));

    let mut world = World::new();
    world.add_event::<Ping>();
    let mut scheduler = Scheduler::new();
    scheduler.add_schedule(MAIN, Stage::Main);
    scheduler.add_system(MAIN, SendPing);
    scheduler.add_system(MAIN, CountPings { seen: Arc::clone(&seen) });
    scheduler.build_all_graphs(&mut world);

    let pool = TaskPool::new(2);
    scheduler.run_tick(&mut world, &pool);
    assert_eq!(seen.load(Ordering::Relaxed), 1);
}

#[test]
fn parallel_stage_events_wait_for_the_schedule_boundary() {
    let seen_same_schedule = Arc::new(AtomicU32::new(u32::MAX));
    let seen_next_schedule = Arc::new(AtomicU32::new(u32::MAX));

    let mut world = World::new();
    world.add_event::<Ping>();
    let mut scheduler = Scheduler::new();
    scheduler.add_schedule(UPDATE, Stage::Update);
    scheduler.add_schedule(LATE, Stage::Cleanup);
    scheduler.add_system(UPDATE, SendPing);
    scheduler.add_system(
        UPDATE,
        CountPings {
            seen: Arc::clone(&seen_same_schedule),
        },
    );
    scheduler.register_ordering::<CountPings>(UPDATE, SystemOrdering::new().after::<SendPing>());
    scheduler.add_system(
        LATE,
        CountPings {
            seen: Arc::clone(&seen_next_schedule),
        },
    );
    scheduler.build_all_graphs(&mut world);

    let pool = TaskPool::new(2);
    scheduler.run_tick(&mut world, &pool);

    // Ordered after the sender but still blind to its events; the next
    // schedule sees them.
    assert_eq!(seen_same_schedule.load(Ordering::Relaxed), 0);
    assert_eq!(seen_next_schedule.load(Ordering::Relaxed), 1);
}

struct RecordOrder {
    label: &'static str,
    log: Arc<Mutex<Vec<&'static str>>>,
}

struct FirstRecorder(RecordOrder);
struct SecondRecorder(RecordOrder);
struct ThirdRecorder(RecordOrder);

impl System for FirstRecorder {
    fn run(&mut self, _ctx: &mut SystemContext) {
        self.0.log.lock().unwrap().push(self.0.label);
    }
}

impl System for SecondRecorder {
    fn run(&mut self, _ctx: &mut SystemContext) {
        self.0.log.lock().unwrap().push(self.0.label);
    }
}

impl System for ThirdRecorder {
    fn run(&mut self, _ctx: &mut SystemContext) {
        self.0.log.lock().unwrap().push(self.0.label);
    }
}

#[test]
fn explicit_ordering_constrains_independent_systems() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let recorder = |label| RecordOrder {
        label,
        log: Arc::clone(&log),
    };

    let mut world = World::new();
    let mut scheduler = Scheduler::new();
    scheduler.add_schedule(UPDATE, Stage::Update);
    scheduler.add_system(UPDATE, ThirdRecorder(recorder("third")));
    scheduler.add_system(UPDATE, SecondRecorder(recorder("second")));
    scheduler.add_system(UPDATE, FirstRecorder(recorder("first")));
    scheduler.register_ordering::<FirstRecorder>(
        UPDATE,
        SystemOrdering::new().before::<SecondRecorder>().before::<ThirdRecorder>(),
    );
    scheduler.register_ordering::<ThirdRecorder>(
        UPDATE,
        SystemOrdering::new().after::<SecondRecorder>(),
    );
    scheduler.build_all_graphs(&mut world);

    let pool = TaskPool::new(4);
    for _ in 0..50 {
        scheduler.run_tick(&mut world, &pool);
    }

    let log = log.lock().unwrap();
    for tick in log.chunks(3) {
        assert_eq!(tick, ["first", "second", "third"]);
    }
}

#[test]
fn set_ordering_applies_across_members() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let recorder = |label| RecordOrder {
        label,
        log: Arc::clone(&log),
    };
    const INPUT: SystemSetId = SystemSetId("input");
    const LOGIC: SystemSetId = SystemSetId("logic");

    let mut world = World::new();
    let mut scheduler = Scheduler::new();
    scheduler.add_schedule(UPDATE, Stage::Update);
    scheduler.add_system_to_set(LOGIC, UPDATE, SecondRecorder(recorder("logic")));
    scheduler.add_system_to_set(INPUT, UPDATE, FirstRecorder(recorder("input")));
    scheduler.declare_set_before(INPUT, LOGIC);
    scheduler.build_all_graphs(&mut world);

    let pool = TaskPool::new(4);
    for _ in 0..50 {
        scheduler.run_tick(&mut world, &pool);
    }

    let log = log.lock().unwrap();
    for tick in log.chunks(2) {
        assert_eq!(tick, ["input", "logic"]);
    }
}

#[test]
fn ordering_on_absent_systems_is_ignored() {
    let mut world = world_with_bodies(4);
    let mut scheduler = Scheduler::new();
    scheduler.add_schedule(UPDATE, Stage::Update);
    scheduler.add_system(UPDATE, NudgePositions);
    // Neither of these is registered in the schedule.
    scheduler.register_ordering::<NudgeVelocities>(
        UPDATE,
        SystemOrdering::new().before::<NudgePositions>(),
    );
    scheduler.register_ordering::<NudgePositions>(
        UPDATE,
        SystemOrdering::new().after::<CopyPositionToVelocity>(),
    );
    scheduler.build_all_graphs(&mut world);

    let pool = TaskPool::new(2);
    scheduler.run_tick(&mut world, &pool);
    assert_eq!(scheduler.execution_count::<NudgePositions>(UPDATE), Some(1));
}

#[test]
fn schedule_constraint_cycle_is_reported_but_the_tick_completes() {
    const A: ScheduleId = ScheduleId("a");
    const B: ScheduleId = ScheduleId("b");
    const C: ScheduleId = ScheduleId("c");

    let log = Arc::new(Mutex::new(Vec::new()));
    let recorder = |label| RecordOrder {
        label,
        log: Arc::clone(&log),
    };

    let mut world = World::new();
    let mut scheduler = Scheduler::new();
    scheduler.add_schedule(A, Stage::Update);
    scheduler.add_schedule(B, Stage::Update);
    scheduler.add_schedule(C, Stage::Update);
    scheduler.set_schedule_constraint(A, &[B], &[]);
    scheduler.set_schedule_constraint(B, &[C], &[]);
    scheduler.set_schedule_constraint(C, &[A], &[]);
    scheduler.add_system(A, FirstRecorder(recorder("a")));
    scheduler.add_system(B, SecondRecorder(recorder("b")));
    scheduler.add_system(C, ThirdRecorder(recorder("c")));

    scheduler.build_all_graphs(&mut world);

    // Every schedule appears exactly once despite the cycle.
    let order = scheduler.schedule_order();
    assert_eq!(order.len(), 3);
    for id in [A, B, C] {
        assert_eq!(order.iter().filter(|&&o| o == id).count(), 1);
    }

    let pool = TaskPool::new(2);
    scheduler.run_tick(&mut world, &pool);
    assert_eq!(log.lock().unwrap().len(), 3);
}

#[test]
fn stages_partition_the_tick() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let recorder = |label| RecordOrder {
        label,
        log: Arc::clone(&log),
    };

    let mut world = World::new();
    let mut scheduler = Scheduler::new();
    // Created out of stage order on purpose.
    scheduler.add_schedule(LATE, Stage::Cleanup);
    scheduler.add_schedule(UPDATE, Stage::Update);
    scheduler.add_schedule(MAIN, Stage::Main);
    scheduler.add_system(LATE, ThirdRecorder(recorder("cleanup")));
    scheduler.add_system(UPDATE, SecondRecorder(recorder("update")));
    scheduler.add_system(MAIN, FirstRecorder(recorder("main")));
    scheduler.build_all_graphs(&mut world);

    let pool = TaskPool::new(2);
    scheduler.run_tick(&mut world, &pool);
    assert_eq!(*log.lock().unwrap(), vec!["main", "update", "cleanup"]);
}

#[test]
fn registry_queries() {
    let mut world = World::new();
    let mut scheduler = Scheduler::new();
    scheduler.add_schedule(UPDATE, Stage::Update);
    scheduler.add_system(UPDATE, NudgePositions);

    assert_eq!(scheduler.system_count(), 1);
    assert!(scheduler.contains_system::<NudgePositions>(UPDATE));
    assert!(!scheduler.contains_system::<NudgeVelocities>(UPDATE));

    scheduler.clear();
    assert_eq!(scheduler.system_count(), 0);
    assert!(!scheduler.contains_system::<NudgePositions>(UPDATE));

    scheduler.add_schedule(UPDATE, Stage::Update);
    scheduler.add_system(UPDATE, NudgePositions);
    scheduler.build_all_graphs(&mut world);
    let pool = TaskPool::new(1);
    scheduler.run_tick(&mut world, &pool);
    assert_eq!(scheduler.execution_count::<NudgePositions>(UPDATE), Some(1));
}
