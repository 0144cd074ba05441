use core::any::TypeId;

use crate::access::AccessPolicy;
use crate::alloc::FrameAllocator;
use crate::command::{Command, EntityCommands};
use crate::entities::Entity;
use crate::events::Event;
use crate::local::SystemLocalStorage;
use crate::query::{QueryBuilder, QuerySpec};
use crate::tasks::{TaskGraph, TaskPool};
use crate::world::World;

/// A unit of simulation logic, invoked once per tick per schedule it
/// belongs to.
///
/// [`access`](System::access) declares the system's component and resource
/// footprint; the scheduler derives the execution graph from it, so the
/// declaration must cover everything [`run`](System::run) touches. Getting
/// it wrong is caught at runtime by the storage borrow flags.
pub trait System: Send + Sync + 'static {
    /// The data this system reads and writes.
    fn access(&self) -> AccessPolicy {
        AccessPolicy::new()
    }

    /// Advances the system by one tick.
    fn run(&mut self, ctx: &mut SystemContext);
}

/// Everything a running system may touch: the shared world, its private
/// command log and event queue, frame scratch, and nested parallelism.
pub struct SystemContext<'a> {
    world: &'a World,
    local: &'a mut SystemLocalStorage,
    pool: Option<&'a TaskPool>,
    name: &'static str,
}

impl<'a> SystemContext<'a> {
    pub(crate) fn new(
        world: &'a World,
        local: &'a mut SystemLocalStorage,
        pool: Option<&'a TaskPool>,
        name: &'static str,
    ) -> Self {
        Self {
            world,
            local,
            pool,
            name,
        }
    }

    /// The world, readable for the full system invocation.
    pub fn world(&self) -> &'a World {
        self.world
    }

    /// Shorthand for [`World::query`].
    pub fn query<Q: QuerySpec>(&self) -> QueryBuilder<'a, Q> {
        self.world.query()
    }

    /// The system's display name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Opens a command buffer for a freshly reserved entity.
    ///
    /// The entity does not exist yet; it materializes at the next phase
    /// boundary, together with the buffered components.
    pub fn spawn(&mut self) -> EntityCommands<'_> {
        let entity = self.world.reserve_entity();
        let mut commands = self.local.command_buffer(entity);
        commands.record_create();
        commands
    }

    /// Opens a command buffer targeting an existing entity.
    pub fn entity(&mut self, entity: Entity) -> EntityCommands<'_> {
        self.local.command_buffer(entity)
    }

    /// Queues an arbitrary closure to run against the world at the next
    /// phase boundary.
    pub fn defer(&mut self, f: impl FnOnce(&mut World) + Send + Sync + 'static) {
        self.local.push_command(Command::Run(Box::new(f)));
    }

    /// Sends an event into the system's private queue. It becomes visible
    /// in the world at the phase boundary: after this system for main-stage
    /// schedules, after the whole schedule otherwise.
    pub fn send<E: Event>(&mut self, event: E) {
        self.local.events_mut().send(event);
    }

    /// Bulk form of [`send`](SystemContext::send); no-op for empty slices.
    pub fn send_bulk<E: Event>(&mut self, events: &[E]) {
        self.local.events_mut().send_bulk(events);
    }

    /// Events currently in the world's queue.
    pub fn read_events<E: Event>(&self) -> &'a [E] {
        self.world.read_events::<E>()
    }

    /// Frame-scoped scratch allocator, reset after the system's commands
    /// are drained.
    pub fn scratch(&self) -> &FrameAllocator {
        self.local.scratch()
    }

    /// Runs a nested task graph, donating this thread until it completes.
    /// Without a worker pool (main-stage execution may run before one
    /// exists) the tasks run inline on the caller.
    pub fn run_graph(&self, graph: TaskGraph) {
        match self.pool {
            Some(pool) => pool.co_run(graph),
            None => run_inline(graph),
        }
    }
}

/// Sequential fallback for nested graphs when no pool is available. Runs
/// tasks in dependency order on the calling thread.
fn run_inline(graph: TaskGraph) {
    TaskPool::new(1).co_run(graph);
}

/// A registered system plus everything the scheduler tracks about it.
pub(crate) struct SystemStorage {
    pub system: Box<dyn System>,
    pub type_id: TypeId,
    pub name: &'static str,
    pub policy: AccessPolicy,
    pub execution_count: u64,
    pub local: SystemLocalStorage,
}

impl SystemStorage {
    pub fn new<S: System>(system: S) -> Self {
        let policy = system.access();
        Self {
            system: Box::new(system),
            type_id: TypeId::of::<S>(),
            name: core::any::type_name::<S>(),
            policy,
            execution_count: 0,
            local: SystemLocalStorage::default(),
        }
    }
}
