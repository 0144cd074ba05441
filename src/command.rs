use allocator_api2::vec::Vec as AllocVec;

use crate::alloc::{AllocatorAdapter, FrameAllocator};
use crate::components::Component;
use crate::entities::Entity;
use crate::world::World;

/// Erased component payload of an add command; applies itself with either
/// strict or idempotent semantics.
type ErasedInsert = Box<dyn FnOnce(&mut World, Entity, bool) + Send + Sync>;

/// Removal thunk; monomorphized per component type, so no allocation.
type RemoveFn = fn(&mut World, Entity, bool);

/// A deferred structural change, applied at a phase boundary.
///
/// The `strict` flag selects between the asserting command forms and their
/// idempotent `try` counterparts.
pub enum Command {
    /// Materializes an entity a reservation already named.
    Create {
        /// The reserved handle.
        entity: Entity,
    },
    /// Destroys an entity and everything attached to it.
    Destroy {
        /// Target handle.
        entity: Entity,
        /// Whether destroying a stale handle is a contract violation.
        strict: bool,
    },
    /// Attaches one or more components.
    Add {
        /// Target handle.
        entity: Entity,
        /// Applies the captured value(s).
        insert: ErasedInsert,
        /// Whether a dead target is a contract violation.
        strict: bool,
    },
    /// Detaches one or more components.
    Remove {
        /// Target handle.
        entity: Entity,
        /// Removal thunk for the named types.
        remove: RemoveFn,
        /// Component type names, for diagnostics.
        components: &'static str,
        /// Whether an absent component is a contract violation.
        strict: bool,
    },
    /// Detaches every component of a live entity.
    ClearComponents {
        /// Target handle.
        entity: Entity,
    },
    /// An arbitrary closure over the world.
    Run(Box<dyn FnOnce(&mut World) + Send + Sync>),
}

impl Command {
    /// Applies the change. Reserved entities must have been flushed first;
    /// the world's command pump does this before draining.
    pub fn apply(self, world: &mut World) {
        match self {
            Command::Create { entity } => {
                if !world.is_valid(entity) {
                    contract_violation!(
                        "create command for {entity:?} found no flushed reservation"
                    );
                }
            }
            Command::Destroy { entity, strict } => {
                if strict {
                    world.destroy(entity);
                } else {
                    world.try_destroy(entity);
                }
            }
            Command::Add {
                entity,
                insert,
                strict,
            } => insert(world, entity, strict),
            Command::Remove {
                entity,
                remove,
                strict,
                ..
            } => remove(world, entity, strict),
            Command::ClearComponents { entity } => world.clear_components(entity),
            Command::Run(f) => f(world),
        }
    }
}

impl core::fmt::Debug for Command {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Command::Create { entity } => write!(f, "Create({entity:?})"),
            Command::Destroy { entity, strict } => write!(f, "Destroy({entity:?}, strict: {strict})"),
            Command::Add { entity, strict, .. } => write!(f, "Add({entity:?}, strict: {strict})"),
            Command::Remove {
                entity,
                components,
                strict,
                ..
            } => write!(f, "Remove<{components}>({entity:?}, strict: {strict})"),
            Command::ClearComponents { entity } => write!(f, "ClearComponents({entity:?})"),
            Command::Run(_) => write!(f, "Run"),
        }
    }
}

/// Tuple of component values for the n-ary add commands.
pub trait Bundle: Send + Sync + 'static {
    #[doc(hidden)]
    fn add_to(self, world: &mut World, entity: Entity, strict: bool);
}

macro_rules! bundle_tuple {
    ($($name:ident),+) => {
        #[allow(non_snake_case)]
        impl<$($name: Component),+> Bundle for ($($name,)+) {
            fn add_to(self, world: &mut World, entity: Entity, strict: bool) {
                let ($($name,)+) = self;
                $(
                    if strict {
                        world.add(entity, $name);
                    } else {
                        world.try_add(entity, $name);
                    }
                )+
            }
        }
    };
}

bundle_tuple!(A, B);
bundle_tuple!(A, B, C);
bundle_tuple!(A, B, C, D);
bundle_tuple!(A, B, C, D, E);
bundle_tuple!(A, B, C, D, E, F);

/// Tuple of component types for the n-ary remove commands.
pub trait ComponentSet: 'static {
    #[doc(hidden)]
    fn remove_from(world: &mut World, entity: Entity, strict: bool);
}

macro_rules! component_set_tuple {
    ($($name:ident),+) => {
        impl<$($name: Component),+> ComponentSet for ($($name,)+) {
            fn remove_from(world: &mut World, entity: Entity, strict: bool) {
                $(
                    if strict {
                        world.remove::<$name>(entity);
                    } else {
                        world.try_remove::<$name>(entity);
                    }
                )+
            }
        }
    };
}

component_set_tuple!(A, B);
component_set_tuple!(A, B, C);
component_set_tuple!(A, B, C, D);
component_set_tuple!(A, B, C, D, E);
component_set_tuple!(A, B, C, D, E, F);

fn remove_one<T: Component>(world: &mut World, entity: Entity, strict: bool) {
    if strict {
        world.remove::<T>(entity);
    } else {
        world.try_remove::<T>(entity);
    }
}

/// Command buffer aimed at one entity.
///
/// Obtained from [`SystemContext::spawn`](crate::SystemContext::spawn) (a
/// fresh reservation) or
/// [`SystemContext::entity`](crate::SystemContext::entity) (an existing
/// handle). Recorded commands live in frame-allocator scratch until
/// [`flush`](EntityCommands::flush) moves them into the system's command
/// log; dropping the buffer flushes automatically.
pub struct EntityCommands<'a> {
    entity: Entity,
    buffer: AllocVec<Command, AllocatorAdapter<'a, FrameAllocator>>,
    log: &'a mut Vec<Command>,
}

impl<'a> EntityCommands<'a> {
    pub(crate) fn new(
        entity: Entity,
        scratch: &'a FrameAllocator,
        log: &'a mut Vec<Command>,
    ) -> Self {
        Self {
            entity,
            buffer: AllocVec::new_in(AllocatorAdapter::new(scratch)),
            log,
        }
    }

    /// The targeted handle; for spawns, this is the reserved entity.
    pub fn entity(&self) -> Entity {
        self.entity
    }

    /// Records that this buffer materializes a reservation.
    pub(crate) fn record_create(&mut self) {
        self.buffer.push(Command::Create {
            entity: self.entity,
        });
    }

    /// Queues destruction. Applying to a stale handle is a contract
    /// violation.
    pub fn destroy(&mut self) {
        self.buffer.push(Command::Destroy {
            entity: self.entity,
            strict: true,
        });
    }

    /// Queues destruction; a stale handle at apply time is a no-op.
    pub fn try_destroy(&mut self) {
        self.buffer.push(Command::Destroy {
            entity: self.entity,
            strict: false,
        });
    }

    /// Queues a component insert, overwriting any present value.
    pub fn add<T: Component>(&mut self, value: T) {
        let mut value = Some(value);
        self.buffer.push(Command::Add {
            entity: self.entity,
            insert: Box::new(move |world, entity, strict| {
                let value = value.take().expect("command applied once");
                if strict {
                    world.add(entity, value);
                } else {
                    world.try_add(entity, value);
                }
            }),
            strict: true,
        });
    }

    /// Queues a component insert that is a no-op when the entity is dead or
    /// already carries the component.
    pub fn try_add<T: Component>(&mut self, value: T) {
        let mut value = Some(value);
        self.buffer.push(Command::Add {
            entity: self.entity,
            insert: Box::new(move |world, entity, strict| {
                let value = value.take().expect("command applied once");
                if strict {
                    world.add(entity, value);
                } else {
                    world.try_add(entity, value);
                }
            }),
            strict: false,
        });
    }

    /// Queues several component inserts at once.
    pub fn add_many<B: Bundle>(&mut self, bundle: B) {
        let mut bundle = Some(bundle);
        self.buffer.push(Command::Add {
            entity: self.entity,
            insert: Box::new(move |world, entity, strict| {
                bundle
                    .take()
                    .expect("command applied once")
                    .add_to(world, entity, strict)
            }),
            strict: true,
        });
    }

    /// Queues several idempotent component inserts at once.
    pub fn try_add_many<B: Bundle>(&mut self, bundle: B) {
        let mut bundle = Some(bundle);
        self.buffer.push(Command::Add {
            entity: self.entity,
            insert: Box::new(move |world, entity, strict| {
                bundle
                    .take()
                    .expect("command applied once")
                    .add_to(world, entity, strict)
            }),
            strict: false,
        });
    }

    /// Queues a component removal. An absent component at apply time is a
    /// contract violation.
    pub fn remove<T: Component>(&mut self) {
        self.buffer.push(Command::Remove {
            entity: self.entity,
            remove: remove_one::<T>,
            components: core::any::type_name::<T>(),
            strict: true,
        });
    }

    /// Queues a component removal that is a no-op when absent.
    pub fn try_remove<T: Component>(&mut self) {
        self.buffer.push(Command::Remove {
            entity: self.entity,
            remove: remove_one::<T>,
            components: core::any::type_name::<T>(),
            strict: false,
        });
    }

    /// Queues removal of several component types.
    pub fn remove_many<S: ComponentSet>(&mut self) {
        self.buffer.push(Command::Remove {
            entity: self.entity,
            remove: S::remove_from,
            components: core::any::type_name::<S>(),
            strict: true,
        });
    }

    /// Queues idempotent removal of several component types.
    pub fn try_remove_many<S: ComponentSet>(&mut self) {
        self.buffer.push(Command::Remove {
            entity: self.entity,
            remove: S::remove_from,
            components: core::any::type_name::<S>(),
            strict: false,
        });
    }

    /// Queues removal of every component on the entity.
    pub fn clear(&mut self) {
        self.buffer.push(Command::ClearComponents {
            entity: self.entity,
        });
    }

    /// Number of queued commands.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether nothing has been queued.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Moves the queued commands into the system's command log. Called
    /// automatically when the buffer drops.
    pub fn flush(&mut self) {
        self.log.extend(self.buffer.drain(..));
    }
}

impl Drop for EntityCommands<'_> {
    fn drop(&mut self) {
        self.flush();
    }
}
