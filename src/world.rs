use core::any::TypeId;

use thiserror::Error;

use crate::borrow::{Ref, RefMut};
use crate::command::Command;
use crate::components::{ComponentCell, ComponentRegistry};
use crate::entities::{Entities, Entity, NoSuchEntity};
use crate::events::{Event, EventQueue};
use crate::query::{QueryBuilder, QuerySpec};
use crate::resources::{Res, ResMut, Resource, Resources};
use crate::sparse::SparseSet;

pub use crate::components::Component;

/// Errors that arise when accessing a component of a specific entity
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum ComponentError {
    /// The entity was already destroyed or never existed
    #[error("no such entity")]
    NoSuchEntity,
    /// The entity exists but does not carry the component
    #[error("missing component {0}")]
    MissingComponent(&'static str),
}

impl From<NoSuchEntity> for ComponentError {
    fn from(_: NoSuchEntity) -> Self {
        ComponentError::NoSuchEntity
    }
}

/// Simulation state: entities, their components, singleton resources, the
/// event log, and the pending-command queue.
///
/// Structural changes go through `&mut World` between schedules. While a
/// schedule runs, systems share the world immutably; value access is
/// arbitrated by per-storage borrow flags backing the declared access
/// policies, and structural changes are deferred through command buffers.
pub struct World {
    entities: Entities,
    components: ComponentRegistry,
    resources: Resources,
    events: EventQueue,
    pending: Vec<Command>,
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl World {
    /// Create an empty world
    pub fn new() -> Self {
        Self {
            entities: Entities::default(),
            components: ComponentRegistry::default(),
            resources: Resources::default(),
            events: EventQueue::new(),
            pending: Vec::new(),
        }
    }

    // --- entities ---------------------------------------------------------

    /// Creates an entity, reusing the most recently freed slot if any.
    pub fn create_entity(&mut self) -> Entity {
        self.entities.flush_reserved();
        self.entities.create()
    }

    /// Creates `count` entities at once. `count == 0` writes nothing and
    /// advances no counters.
    pub fn create_entities(&mut self, count: usize, out: &mut impl Extend<Entity>) {
        self.entities.flush_reserved();
        self.entities.create_many(count, out);
    }

    /// Reserves an entity handle without materializing it. Thread-safe; the
    /// handle becomes valid once [`flush_reserved`](World::flush_reserved)
    /// runs (the scheduler does this before applying commands).
    pub fn reserve_entity(&self) -> Entity {
        self.entities.reserve()
    }

    /// Materializes every reserved handle.
    pub fn flush_reserved(&mut self) {
        self.entities.flush_reserved();
    }

    /// Destroys `entity` and removes its components from every storage.
    /// Destroying a stale handle is a contract violation.
    pub fn destroy(&mut self, entity: Entity) {
        if !self.entities.is_valid(entity) {
            contract_violation!("destroy: entity {entity:?} is not alive");
            return;
        }
        self.components.remove_entity(entity);
        self.entities.destroy(entity);
    }

    /// Destroys `entity` if it is alive; returns whether anything happened.
    pub fn try_destroy(&mut self, entity: Entity) -> bool {
        if !self.entities.is_valid(entity) {
            return false;
        }
        self.components.remove_entity(entity);
        self.entities.try_destroy(entity)
    }

    /// Destroys a batch of entities. Each stale handle is a contract
    /// violation and is skipped; the rest of the batch still dies.
    pub fn destroy_many(&mut self, entities: impl IntoIterator<Item = Entity>) {
        for entity in entities {
            self.destroy(entity);
        }
    }

    /// Whether `entity` is alive. May be called concurrently with queries.
    pub fn is_valid(&self, entity: Entity) -> bool {
        self.entities.is_valid(entity)
    }

    /// Number of live entities.
    pub fn entity_count(&self) -> usize {
        self.entities.count()
    }

    /// Grows entity bookkeeping capacity ahead of time.
    pub fn reserve_capacity(&mut self, additional: usize) {
        self.entities.reserve_capacity(additional);
    }

    // --- components -------------------------------------------------------

    /// Attaches `value` to `entity`, overwriting any present `T`. Targeting
    /// a dead entity is a contract violation.
    pub fn add<T: Component>(&mut self, entity: Entity, value: T) {
        if !self.entities.is_valid(entity) {
            contract_violation!(
                "add<{}>: entity {entity:?} is not alive",
                core::any::type_name::<T>()
            );
            return;
        }
        self.components
            .column_mut_or_insert::<T>()
            .insert(entity, value);
    }

    /// Attaches `value` unless the entity is dead or already carries a `T`.
    /// Returns whether the value was stored.
    pub fn try_add<T: Component>(&mut self, entity: Entity, value: T) -> bool {
        if !self.entities.is_valid(entity) || self.has::<T>(entity) {
            return false;
        }
        self.components
            .column_mut_or_insert::<T>()
            .insert(entity, value);
        true
    }

    /// Detaches and returns `entity`'s `T`. A dead entity or an absent
    /// component is a contract violation; `None` is returned either way.
    pub fn remove<T: Component>(&mut self, entity: Entity) -> Option<T> {
        if !self.entities.is_valid(entity) {
            contract_violation!(
                "remove<{}>: entity {entity:?} is not alive",
                core::any::type_name::<T>()
            );
            return None;
        }
        let removed = self
            .components
            .column_mut::<T>()
            .and_then(|column| column.remove(entity));
        if removed.is_none() {
            contract_violation!(
                "remove<{}>: entity {entity:?} does not carry the component",
                core::any::type_name::<T>()
            );
        }
        removed
    }

    /// Detaches and returns `entity`'s `T` if present; otherwise a no-op.
    pub fn try_remove<T: Component>(&mut self, entity: Entity) -> Option<T> {
        if !self.entities.is_valid(entity) {
            return None;
        }
        self.components
            .column_mut::<T>()
            .and_then(|column| column.remove(entity))
    }

    /// Removes every component of a live entity; the entity itself stays.
    pub fn clear_components(&mut self, entity: Entity) {
        if !self.entities.is_valid(entity) {
            contract_violation!("clear_components: entity {entity:?} is not alive");
            return;
        }
        self.components.remove_entity(entity);
    }

    /// Whether `entity` carries a `T`.
    pub fn has<T: Component>(&self, entity: Entity) -> bool {
        self.components
            .cell_of::<T>()
            .is_some_and(|cell| cell.contains(entity))
    }

    /// Borrows `entity`'s `T`.
    ///
    /// Panics if the storage is uniquely borrowed by a running query; the
    /// access policies of concurrent systems must not overlap.
    pub fn get<T: Component>(&self, entity: Entity) -> Result<Ref<'_, T>, ComponentError> {
        if !self.entities.is_valid(entity) {
            return Err(ComponentError::NoSuchEntity);
        }
        let cell = self
            .components
            .cell_of::<T>()
            .ok_or(ComponentError::MissingComponent(core::any::type_name::<T>()))?;
        assert!(
            cell.acquire_read(),
            "component {} is uniquely borrowed; check the access policies",
            core::any::type_name::<T>()
        );
        // Holding the shared borrow keeps writers out until the guard drops.
        let value = unsafe { (*cell.data().cast::<SparseSet<T>>()).get(entity) };
        match value {
            Some(value) => Ok(Ref::new(cell.borrow_flag(), value)),
            None => {
                cell.release_read();
                Err(ComponentError::MissingComponent(core::any::type_name::<T>()))
            }
        }
    }

    /// Uniquely borrows `entity`'s `T`.
    ///
    /// Panics if the storage is borrowed at all by a running query.
    pub fn get_mut<T: Component>(&self, entity: Entity) -> Result<RefMut<'_, T>, ComponentError> {
        if !self.entities.is_valid(entity) {
            return Err(ComponentError::NoSuchEntity);
        }
        let cell = self
            .components
            .cell_of::<T>()
            .ok_or(ComponentError::MissingComponent(core::any::type_name::<T>()))?;
        assert!(
            cell.acquire_write(),
            "component {} is already borrowed; check the access policies",
            core::any::type_name::<T>()
        );
        let value = unsafe {
            (*cell.data().cast::<SparseSet<T>>())
                .get_raw(entity)
                .map(|ptr| &mut *ptr)
        };
        match value {
            Some(value) => Ok(RefMut::new(cell.borrow_flag(), value)),
            None => {
                cell.release_write();
                Err(ComponentError::MissingComponent(core::any::type_name::<T>()))
            }
        }
    }

    /// Borrows `entity`'s `T`, or `None` when dead or absent.
    pub fn try_get<T: Component>(&self, entity: Entity) -> Option<Ref<'_, T>> {
        self.get(entity).ok()
    }

    /// Prepares a query over the component storages.
    pub fn query<Q: QuerySpec>(&self) -> QueryBuilder<'_, Q> {
        QueryBuilder::new(self)
    }

    pub(crate) fn component_cell(&self, id: TypeId) -> Option<&ComponentCell> {
        self.components.cell(id)
    }

    // --- resources --------------------------------------------------------

    /// Stores `value` as the singleton of its type, returning the value it
    /// replaced.
    pub fn insert_resource<R: Resource>(&mut self, value: R) -> Option<R> {
        self.resources.insert(value)
    }

    /// Stores the resource produced by `init` unless one is already
    /// present. Returns whether an insertion happened.
    pub fn emplace_resource<R: Resource>(&mut self, init: impl FnOnce() -> R) -> bool {
        self.resources.try_insert_with(init)
    }

    /// Stores `value` unless a resource of the type is already present.
    pub fn try_insert_resource<R: Resource>(&mut self, value: R) -> bool {
        self.resources.try_insert_with(|| value)
    }

    /// Removes and returns the singleton of the type.
    pub fn remove_resource<R: Resource>(&mut self) -> Option<R> {
        self.resources.remove::<R>()
    }

    /// Whether a resource of the type is present.
    pub fn contains_resource<R: Resource>(&self) -> bool {
        self.resources.contains::<R>()
    }

    /// Shared borrow of the resource. Reading a missing resource panics;
    /// use [`try_read_resource`](World::try_read_resource) to probe.
    pub fn read_resource<R: Resource>(&self) -> Res<'_, R> {
        self.resources.read()
    }

    /// Shared borrow of the resource, or `None` when absent.
    pub fn try_read_resource<R: Resource>(&self) -> Option<Res<'_, R>> {
        self.resources.try_read()
    }

    /// Unique borrow of the resource. Writing a missing resource panics.
    pub fn write_resource<R: Resource>(&self) -> ResMut<'_, R> {
        self.resources.write()
    }

    /// Unique borrow of the resource, or `None` when absent.
    pub fn try_write_resource<R: Resource>(&self) -> Option<ResMut<'_, R>> {
        self.resources.try_write()
    }

    /// Plain mutable access through exclusive world access.
    pub fn resource_mut<R: Resource>(&mut self) -> Option<&mut R> {
        self.resources.get_mut()
    }

    // --- events -----------------------------------------------------------

    /// Registers an event type so early reads are well-defined.
    pub fn add_event<E: Event>(&mut self) {
        self.events.register::<E>();
    }

    /// Appends an event to the world's queue directly. Systems should send
    /// through their context instead; those events become visible at the
    /// phase boundary.
    pub fn send<E: Event>(&mut self, event: E) {
        self.events.send(event);
    }

    /// Appends a contiguous run of events.
    pub fn send_bulk<E: Event>(&mut self, events: &[E]) {
        self.events.send_bulk(events);
    }

    /// Every event of the type currently in the world's queue.
    pub fn read_events<E: Event>(&self) -> &[E] {
        self.events.read::<E>()
    }

    /// Truncates one event type.
    pub fn clear_event<E: Event>(&mut self) {
        self.events.clear::<E>();
    }

    /// Truncates every event type.
    pub fn clear_events(&mut self) {
        self.events.clear_all();
    }

    // --- scheduler plumbing ----------------------------------------------

    /// Appends a system's command log to the pending queue.
    pub fn merge_commands(&mut self, log: &mut Vec<Command>) {
        self.pending.append(log);
    }

    /// Queues a single command.
    pub fn push_command(&mut self, command: Command) {
        self.pending.push(command);
    }

    /// Appends another queue's events onto the world's, draining it.
    pub fn merge_event_queue(&mut self, queue: &mut EventQueue) {
        self.events.merge(queue);
    }

    /// Materializes reserved entities, then applies every pending command
    /// in FIFO order. Commands queued while applying run at the next
    /// boundary.
    pub fn apply_commands(&mut self) {
        self.entities.flush_reserved();
        let pending = core::mem::take(&mut self.pending);
        for command in pending {
            command.apply(self);
        }
    }

    /// Number of commands waiting for the next boundary.
    pub fn pending_command_count(&self) -> usize {
        self.pending.len()
    }

    /// Destroys all entities, components, resources, events and pending
    /// commands.
    pub fn clear(&mut self) {
        self.entities.clear();
        self.components.clear();
        self.resources.clear();
        self.events.clear_all();
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy, Debug, PartialEq)]
    struct Position(f32, f32, f32);

    #[derive(Clone, Copy, Debug, PartialEq)]
    struct Velocity(f32);

    #[test]
    fn world_is_shareable_across_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<World>();
    }

    #[test]
    fn add_remove_roundtrip_leaves_no_trace() {
        let mut world = World::new();
        let e = world.create_entity();

        world.add(e, Position(1.0, 2.0, 3.0));
        assert!(world.has::<Position>(e));
        assert_eq!(world.remove::<Position>(e), Some(Position(1.0, 2.0, 3.0)));
        assert!(!world.has::<Position>(e));
        assert_eq!(world.try_get::<Position>(e).map(|p| *p), None);
    }

    #[test]
    fn try_add_does_not_overwrite() {
        let mut world = World::new();
        let e = world.create_entity();
        world.add(e, Velocity(1.0));
        assert!(!world.try_add(e, Velocity(2.0)));
        assert_eq!(*world.get::<Velocity>(e).unwrap(), Velocity(1.0));
    }

    #[test]
    fn destroy_cascades_through_storages() {
        let mut world = World::new();
        let e = world.create_entity();
        world.add(e, Position(0.0, 0.0, 0.0));
        world.add(e, Velocity(1.0));

        world.destroy(e);
        assert!(!world.is_valid(e));
        assert!(!world.has::<Position>(e));
        assert!(!world.has::<Velocity>(e));
        assert_eq!(world.entity_count(), 0);

        // The slot is recycled with a fresh generation; the stale handle
        // still reads as dead.
        let recycled = world.create_entity();
        assert_eq!(recycled.index(), e.index());
        assert_ne!(recycled.generation(), e.generation());
        assert!(!world.is_valid(e));
    }

    #[test]
    fn get_mut_writes_through() {
        let mut world = World::new();
        let e = world.create_entity();
        world.add(e, Velocity(1.0));
        world.get_mut::<Velocity>(e).unwrap().0 = 5.0;
        assert_eq!(world.get::<Velocity>(e).unwrap().0, 5.0);
    }

    #[test]
    fn queries_join_on_the_smallest_storage() {
        let mut world = World::new();
        for i in 0..10 {
            let e = world.create_entity();
            world.add(e, Position(i as f32, 0.0, 0.0));
            if i % 2 == 0 {
                world.add(e, Velocity(i as f32));
            }
        }

        let mut query = world.query::<(&Position, &Velocity)>();
        let matched: Vec<f32> = query.iter().map(|(p, _)| p.0).collect();
        assert_eq!(matched.len(), 5);
    }

    #[test]
    fn query_filters() {
        let mut world = World::new();
        struct Frozen;
        for i in 0..6 {
            let e = world.create_entity();
            world.add(e, Position(i as f32, 0.0, 0.0));
            if i < 2 {
                world.add(e, Frozen);
            }
        }

        let mut query = world.query::<&Position>().without::<Frozen>();
        assert_eq!(query.iter().count(), 4);

        let mut query = world.query::<&Position>().with::<Frozen>();
        assert_eq!(query.iter().count(), 2);
    }

    #[test]
    fn query_adapters_are_lazy() {
        let mut world = World::new();
        for i in 0..100 {
            let e = world.create_entity();
            world.add(e, Position(i as f32, 0.0, 0.0));
        }

        let mut evaluated = 0;
        let mut query = world.query::<&Position>();
        let taken: Vec<&Position> = query
            .iter()
            .filter(|_| {
                evaluated += 1;
                true
            })
            .take(3)
            .collect();
        assert_eq!(taken.len(), 3);
        assert_eq!(evaluated, 3);

        let mut query = world.query::<&Position>();
        assert_eq!(query.iter().take(0).count(), 0);
    }

    #[test]
    fn with_entity_yields_owning_handles() {
        let mut world = World::new();
        let e = world.create_entity();
        world.add(e, Velocity(3.0));

        let mut query = world.query::<&Velocity>();
        let pairs: Vec<_> = query.iter().with_entity().collect();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].0, e);
        assert_eq!(*pairs[0].1, Velocity(3.0));
    }

    #[test]
    fn mutation_through_queries() {
        let mut world = World::new();
        for _ in 0..4 {
            let e = world.create_entity();
            world.add(e, Position(0.0, 0.0, 0.0));
            world.add(e, Velocity(2.0));
        }

        let mut query = world.query::<(&mut Position, &Velocity)>();
        for (position, velocity) in query.iter() {
            position.0 += velocity.0;
        }
        drop(query);

        let mut query = world.query::<&Position>();
        assert!(query.iter().all(|p| p.0 == 2.0));
    }

    #[test]
    fn resources_roundtrip() {
        struct Gravity(f32);
        impl Resource for Gravity {}

        let mut world = World::new();
        assert!(world.try_insert_resource(Gravity(-9.81)));
        assert!(!world.try_insert_resource(Gravity(0.0)));
        assert_eq!(world.read_resource::<Gravity>().0, -9.81);

        world.write_resource::<Gravity>().0 = -1.62;
        assert_eq!(world.remove_resource::<Gravity>().map(|g| g.0), Some(-1.62));
    }

    #[test]
    fn deferred_commands_apply_at_the_boundary() {
        let mut world = World::new();
        let reserved = world.reserve_entity();
        assert!(!world.is_valid(reserved));

        world.push_command(Command::Create { entity: reserved });
        let mut storage = crate::SystemLocalStorage::default();
        {
            let mut commands = storage.command_buffer(reserved);
            commands.add(Position(1.0, 2.0, 3.0));
        }
        let mut log = storage.drain_commands();
        world.merge_commands(&mut log);

        assert!(!world.has::<Position>(reserved));
        world.apply_commands();
        assert!(world.is_valid(reserved));
        assert_eq!(
            *world.get::<Position>(reserved).unwrap(),
            Position(1.0, 2.0, 3.0)
        );
    }
}
