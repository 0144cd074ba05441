use core::any::{Any, TypeId};
use core::cell::UnsafeCell;

use hashbrown::HashMap;

use crate::borrow::{AtomicBorrow, Ref, RefMut};

/// Singleton-per-type world state.
///
/// A resource that provides its own synchronization (atomics or an internal
/// lock) may override [`thread_safe`](Resource::thread_safe); such types are
/// excluded from scheduling conflict analysis and admit concurrent access.
pub trait Resource: Send + Sync + 'static {
    /// Whether the type synchronizes itself internally.
    fn thread_safe() -> bool
    where
        Self: Sized,
    {
        false
    }
}

/// Shared borrow of a resource.
pub type Res<'a, T> = Ref<'a, T>;
/// Unique borrow of a resource.
pub type ResMut<'a, T> = RefMut<'a, T>;

struct ResourceCell {
    borrow: AtomicBorrow,
    value: UnsafeCell<Box<dyn Any + Send + Sync>>,
}

// Access through `&self` goes through the borrow flag; structural changes
// require `&mut self`.
unsafe impl Send for ResourceCell {}
unsafe impl Sync for ResourceCell {}

/// Type-erased singleton storage.
#[derive(Default)]
pub(crate) struct Resources {
    cells: HashMap<TypeId, ResourceCell>,
}

impl Resources {
    /// Inserts `value`, returning the previously stored value of the type.
    pub fn insert<R: Resource>(&mut self, value: R) -> Option<R> {
        let old = self.remove::<R>();
        self.cells.insert(
            TypeId::of::<R>(),
            ResourceCell {
                borrow: AtomicBorrow::new(),
                value: UnsafeCell::new(Box::new(value)),
            },
        );
        old
    }

    /// Inserts the value produced by `init` unless the type is already
    /// present. Returns whether an insertion happened.
    pub fn try_insert_with<R: Resource>(&mut self, init: impl FnOnce() -> R) -> bool {
        if self.contains::<R>() {
            return false;
        }
        self.insert(init());
        true
    }

    /// Removes and returns the stored value of the type.
    pub fn remove<R: Resource>(&mut self) -> Option<R> {
        let cell = self.cells.remove(&TypeId::of::<R>())?;
        let value = cell.value.into_inner().downcast::<R>().ok()?;
        Some(*value)
    }

    pub fn contains<R: Resource>(&self) -> bool {
        self.cells.contains_key(&TypeId::of::<R>())
    }

    /// Shared borrow, or `None` when the resource was never inserted.
    ///
    /// Panics if the resource is currently borrowed uniquely; the access
    /// policies of concurrently running systems must not overlap.
    pub fn try_read<R: Resource>(&self) -> Option<Res<'_, R>> {
        let cell = self.cells.get(&TypeId::of::<R>())?;
        assert!(
            cell.borrow.borrow(),
            "resource {} is already borrowed uniquely; check the access policies",
            core::any::type_name::<R>()
        );
        let value = unsafe { (*cell.value.get()).downcast_ref::<R>() }
            .expect("resource cell is keyed by its value type");
        Some(Ref::new(&cell.borrow, value))
    }

    /// Shared borrow. Reading a missing resource is a contract violation.
    pub fn read<R: Resource>(&self) -> Res<'_, R> {
        self.try_read().unwrap_or_else(|| {
            panic!(
                "resource {} was read but never inserted",
                core::any::type_name::<R>()
            )
        })
    }

    /// Unique borrow, or `None` when the resource was never inserted.
    ///
    /// Panics if the resource is currently borrowed at all.
    pub fn try_write<R: Resource>(&self) -> Option<ResMut<'_, R>> {
        let cell = self.cells.get(&TypeId::of::<R>())?;
        assert!(
            cell.borrow.borrow_mut(),
            "resource {} is already borrowed; check the access policies",
            core::any::type_name::<R>()
        );
        let value = unsafe { (*cell.value.get()).downcast_mut::<R>() }
            .expect("resource cell is keyed by its value type");
        Some(RefMut::new(&cell.borrow, value))
    }

    /// Unique borrow. Writing a missing resource is a contract violation.
    pub fn write<R: Resource>(&self) -> ResMut<'_, R> {
        self.try_write().unwrap_or_else(|| {
            panic!(
                "resource {} was written but never inserted",
                core::any::type_name::<R>()
            )
        })
    }

    /// Fast-path unique access through exclusive world access; no borrow
    /// flags involved.
    pub fn get_mut<R: Resource>(&mut self) -> Option<&mut R> {
        self.cells
            .get_mut(&TypeId::of::<R>())
            .and_then(|cell| cell.value.get_mut().downcast_mut())
    }

    pub fn clear(&mut self) {
        self.cells.clear();
    }
}
