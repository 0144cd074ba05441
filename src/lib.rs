//! A data-oriented simulation core
//!
//! keel provides the three pieces a frame-driven engine loop is built from:
//! an entity-component-system [`World`], a [`Scheduler`] that extracts
//! parallelism from declarative [`AccessPolicy`] descriptions, and a family
//! of fixed-discipline allocators under [`alloc`].
//!
//! Systems read the world concurrently through typed queries and defer
//! structural changes through per-system command buffers, which the
//! scheduler drains at phase boundaries:
//!
//! ```
//! # use keel::*;
//! struct Movement;
//!
//! impl System for Movement {
//!     fn access(&self) -> AccessPolicy {
//!         AccessPolicy::new().query::<(&mut Position, &Velocity)>()
//!     }
//!
//!     fn run(&mut self, ctx: &mut SystemContext) {
//!         for (pos, vel) in ctx.world().query::<(&mut Position, &Velocity)>().iter() {
//!             pos.0 += vel.0;
//!         }
//!     }
//! }
//!
//! #[derive(Clone, Copy)] struct Position(f32);
//! #[derive(Clone, Copy)] struct Velocity(f32);
//!
//! let mut world = World::new();
//! let e = world.create_entity();
//! world.add(e, Position(0.0));
//! world.add(e, Velocity(1.0));
//!
//! let mut scheduler = Scheduler::new();
//! scheduler.add_schedule(ScheduleId("update"), Stage::Update);
//! scheduler.add_system(ScheduleId("update"), Movement);
//! scheduler.build_all_graphs(&mut world);
//!
//! let pool = TaskPool::new(2);
//! scheduler.run_tick(&mut world, &pool);
//! assert_eq!(world.get::<Position>(e).unwrap().0, 1.0);
//! ```

#![warn(missing_docs)]

/// Reports a broken caller contract.
///
/// Debug builds stop immediately; release builds log at error level and the
/// caller continues with its documented fallback (usually skipping the
/// operation).
macro_rules! contract_violation {
    ($($arg:tt)+) => {{
        if cfg!(debug_assertions) {
            panic!($($arg)+);
        }
        tracing::error!($($arg)+);
    }};
}

pub mod alloc;

mod access;
mod borrow;
mod command;
mod components;
mod entities;
mod events;
mod local;
mod query;
mod resources;
mod schedule;
mod scheduler;
mod sparse;
mod system;
mod tasks;
mod world;

pub use access::{AccessPolicy, QueryDescriptor, ResourceSet};
pub use borrow::{Ref, RefMut};
pub use command::{Bundle, Command, ComponentSet, EntityCommands};
pub use entities::{Entity, NoSuchEntity};
pub use events::{Event, EventQueue};
pub use local::SystemLocalStorage;
pub use query::{QueryBuilder, QueryIter, QueryParam, QuerySpec, WithEntity};
pub use resources::{Res, ResMut, Resource};
pub use schedule::{Schedule, ScheduleId, Stage, SystemOrdering, SystemSetId};
pub use scheduler::Scheduler;
pub use sparse::SparseSet;
pub use system::{System, SystemContext};
pub use tasks::{TaskGraph, TaskHandle, TaskId, TaskPool};
pub use world::{Component, ComponentError, World};
