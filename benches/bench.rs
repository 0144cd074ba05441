use bencher::{benchmark_group, benchmark_main, Bencher};

use keel::alloc::{FrameAllocator, PoolAllocator, RawAllocator, MIN_ALIGN};
use keel::*;

#[derive(Clone, Copy)]
struct Position(f32);

#[derive(Clone, Copy)]
struct Velocity(f32);

fn create_entities(b: &mut Bencher) {
    b.iter(|| {
        let mut world = World::new();
        for _ in 0..1000 {
            let e = world.create_entity();
            world.add(e, Position(0.0));
            world.add(e, Velocity(1.0));
        }
        world
    });
}

fn iterate_query(b: &mut Bencher) {
    let mut world = World::new();
    for i in 0..10_000 {
        let e = world.create_entity();
        world.add(e, Position(i as f32));
        if i % 2 == 0 {
            world.add(e, Velocity(1.0));
        }
    }

    b.iter(|| {
        let mut query = world.query::<(&mut Position, &Velocity)>();
        for (position, velocity) in query.iter() {
            position.0 += velocity.0;
        }
    });
}

struct Movement;

impl System for Movement {
    fn access(&self) -> AccessPolicy {
        AccessPolicy::new().query::<(&mut Position, &Velocity)>()
    }

    fn run(&mut self, ctx: &mut SystemContext) {
        for (position, velocity) in ctx.query::<(&mut Position, &Velocity)>().iter() {
            position.0 += velocity.0;
        }
    }
}

struct Decay;

impl System for Decay {
    fn access(&self) -> AccessPolicy {
        AccessPolicy::new().query::<&mut Velocity>()
    }

    fn run(&mut self, ctx: &mut SystemContext) {
        for velocity in ctx.query::<&mut Velocity>().iter() {
            velocity.0 *= 0.99;
        }
    }
}

fn tick_two_systems(b: &mut Bencher) {
    let mut world = World::new();
    for i in 0..10_000 {
        let e = world.create_entity();
        world.add(e, Position(i as f32));
        world.add(e, Velocity(1.0));
    }

    let mut scheduler = Scheduler::new();
    scheduler.add_schedule(ScheduleId("update"), Stage::Update);
    scheduler.add_system(ScheduleId("update"), Movement);
    scheduler.add_system(ScheduleId("update"), Decay);
    scheduler.build_all_graphs(&mut world);
    let pool = TaskPool::new(4);

    b.iter(|| {
        scheduler.run_tick(&mut world, &pool);
    });
}

fn frame_allocations(b: &mut Bencher) {
    let mut frame = FrameAllocator::new(1 << 20);
    b.iter(|| {
        for _ in 0..1000 {
            let _ = frame.allocate(64, MIN_ALIGN);
        }
        frame.reset();
    });
}

fn pool_churn(b: &mut Bencher) {
    let pool = PoolAllocator::new(64, 1024);
    b.iter(|| {
        for _ in 0..1000 {
            let block = pool.allocate(64, MIN_ALIGN).unwrap();
            unsafe { pool.deallocate(block.ptr, block.size) };
        }
    });
}

benchmark_group!(
    benches,
    create_entities,
    iterate_query,
    tick_two_systems,
    frame_allocations,
    pool_churn
);
benchmark_main!(benches);
