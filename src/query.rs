use core::any::TypeId;
use core::marker::PhantomData;

use smallvec::SmallVec;

use crate::access::QueryDescriptor;
use crate::components::{Component, ComponentCell};
use crate::entities::Entity;
use crate::sparse::SparseSet;
use crate::world::World;

/// Access shape of one query parameter.
#[doc(hidden)]
pub struct ParamInfo {
    pub id: TypeId,
    pub writes: bool,
    pub name: &'static str,
}

/// One parameter of a query: `&T` declares a read, `&mut T` a write.
///
/// # Safety
///
/// `fetch` must be called with a pointer to the `SparseSet` of exactly the
/// component type this parameter names.
pub unsafe trait QueryParam {
    /// What the parameter yields per matched entity.
    type Item<'w>;
    #[doc(hidden)]
    fn info() -> ParamInfo;
    #[doc(hidden)]
    fn describe(descriptor: &mut QueryDescriptor);
    #[doc(hidden)]
    unsafe fn fetch<'w>(column: *mut (), entity: Entity) -> Option<Self::Item<'w>>;
}

unsafe impl<'a, T: Component> QueryParam for &'a T {
    type Item<'w> = &'w T;

    fn info() -> ParamInfo {
        ParamInfo {
            id: TypeId::of::<T>(),
            writes: false,
            name: core::any::type_name::<T>(),
        }
    }

    fn describe(descriptor: &mut QueryDescriptor) {
        descriptor.add_read(TypeId::of::<T>());
    }

    unsafe fn fetch<'w>(column: *mut (), entity: Entity) -> Option<&'w T> {
        (*column.cast::<SparseSet<T>>())
            .get(entity)
            .map(|value| &*(value as *const T))
    }
}

unsafe impl<'a, T: Component> QueryParam for &'a mut T {
    type Item<'w> = &'w mut T;

    fn info() -> ParamInfo {
        ParamInfo {
            id: TypeId::of::<T>(),
            writes: true,
            name: core::any::type_name::<T>(),
        }
    }

    fn describe(descriptor: &mut QueryDescriptor) {
        descriptor.add_write(TypeId::of::<T>());
    }

    unsafe fn fetch<'w>(column: *mut (), entity: Entity) -> Option<&'w mut T> {
        (*column.cast::<SparseSet<T>>())
            .get_raw(entity)
            .map(|value| &mut *value)
    }
}

/// A full query signature: a single [`QueryParam`] or a tuple of them.
///
/// # Safety
///
/// `fetch` must be called with one column pointer per parameter, in
/// declaration order, each pointing at the matching `SparseSet`.
pub unsafe trait QuerySpec {
    /// The tuple yielded per matched entity.
    type Item<'w>;
    #[doc(hidden)]
    fn describe(descriptor: &mut QueryDescriptor);
    #[doc(hidden)]
    fn params(out: &mut SmallVec<[ParamInfo; 8]>);
    #[doc(hidden)]
    unsafe fn fetch<'w>(columns: &[*mut ()], entity: Entity) -> Option<Self::Item<'w>>;
}

unsafe impl<'a, T: Component> QuerySpec for &'a T {
    type Item<'w> = &'w T;

    fn describe(descriptor: &mut QueryDescriptor) {
        <&'a T as QueryParam>::describe(descriptor);
    }

    fn params(out: &mut SmallVec<[ParamInfo; 8]>) {
        out.push(<&'a T as QueryParam>::info());
    }

    unsafe fn fetch<'w>(columns: &[*mut ()], entity: Entity) -> Option<Self::Item<'w>> {
        <&'a T as QueryParam>::fetch(columns[0], entity)
    }
}

unsafe impl<'a, T: Component> QuerySpec for &'a mut T {
    type Item<'w> = &'w mut T;

    fn describe(descriptor: &mut QueryDescriptor) {
        <&'a mut T as QueryParam>::describe(descriptor);
    }

    fn params(out: &mut SmallVec<[ParamInfo; 8]>) {
        out.push(<&'a mut T as QueryParam>::info());
    }

    unsafe fn fetch<'w>(columns: &[*mut ()], entity: Entity) -> Option<Self::Item<'w>> {
        <&'a mut T as QueryParam>::fetch(columns[0], entity)
    }
}

macro_rules! query_spec_tuple {
    ($($name:ident => $index:tt),*) => {
        unsafe impl<$($name: QueryParam),*> QuerySpec for ($($name,)*) {
            type Item<'w> = ($($name::Item<'w>,)*);

            fn describe(descriptor: &mut QueryDescriptor) {
                $($name::describe(descriptor);)*
            }

            fn params(out: &mut SmallVec<[ParamInfo; 8]>) {
                $(out.push($name::info());)*
            }

            unsafe fn fetch<'w>(columns: &[*mut ()], entity: Entity) -> Option<Self::Item<'w>> {
                Some(($($name::fetch(columns[$index], entity)?,)*))
            }
        }
    };
}

query_spec_tuple!(A => 0);
query_spec_tuple!(A => 0, B => 1);
query_spec_tuple!(A => 0, B => 1, C => 2);
query_spec_tuple!(A => 0, B => 1, C => 2, D => 3);
query_spec_tuple!(A => 0, B => 1, C => 2, D => 3, E => 4);
query_spec_tuple!(A => 0, B => 1, C => 2, D => 3, E => 4, F => 5);
query_spec_tuple!(A => 0, B => 1, C => 2, D => 3, E => 4, F => 5, G => 6);
query_spec_tuple!(A => 0, B => 1, C => 2, D => 3, E => 4, F => 5, G => 6, H => 7);

/// A prepared query over the world.
///
/// Holds the storage borrows its parameters need; they are taken on first
/// iteration and released when the builder drops, so items may be used for
/// as long as the builder lives. Filters narrow the match set without
/// touching component values:
///
/// ```
/// # use keel::*;
/// # #[derive(Clone, Copy)] struct Position(f32); struct Frozen;
/// # let mut world = World::new();
/// let mut query = world.query::<&Position>().without::<Frozen>();
/// for position in query.iter() {
///     // every entity with a Position and no Frozen tag
/// }
/// ```
///
/// [`iter`](QueryBuilder::iter) returns an ordinary lazy [`Iterator`], so
/// the whole adapter vocabulary (`filter`, `map`, `take`, `skip`,
/// `enumerate`, `step_by`, `inspect`, ...) applies, and any `Extend`
/// collection can act as a sink.
pub struct QueryBuilder<'w, Q: QuerySpec> {
    world: &'w World,
    with: SmallVec<[TypeId; 4]>,
    without: SmallVec<[TypeId; 4]>,
    borrows: SmallVec<[(&'w ComponentCell, bool); 8]>,
    acquired: bool,
    _marker: PhantomData<fn() -> Q>,
}

impl<'w, Q: QuerySpec> QueryBuilder<'w, Q> {
    pub(crate) fn new(world: &'w World) -> Self {
        Self {
            world,
            with: SmallVec::new(),
            without: SmallVec::new(),
            borrows: SmallVec::new(),
            acquired: false,
            _marker: PhantomData,
        }
    }

    /// Only match entities that also carry a `T`, without fetching it.
    pub fn with<T: Component>(mut self) -> Self {
        debug_assert!(!self.acquired, "filters must be added before iterating");
        self.with.push(TypeId::of::<T>());
        self
    }

    /// Only match entities that do not carry a `T`.
    pub fn without<T: Component>(mut self) -> Self {
        debug_assert!(!self.acquired, "filters must be added before iterating");
        self.without.push(TypeId::of::<T>());
        self
    }

    fn acquire(&mut self) {
        if self.acquired {
            return;
        }
        self.acquired = true;

        let mut params = SmallVec::new();
        Q::params(&mut params);
        for info in &params {
            // A parameter whose storage was never registered simply matches
            // nothing; there is no borrow to take.
            let Some(cell) = self.world.component_cell(info.id) else {
                continue;
            };
            let ok = if info.writes {
                cell.acquire_write()
            } else {
                cell.acquire_read()
            };
            assert!(
                ok,
                "query conflicts with an existing borrow of {}; check the access policies",
                info.name
            );
            self.borrows.push((cell, info.writes));
        }
    }

    /// Materializes the query. The engine walks the smallest participating
    /// column and probes the remaining sparse sets per entity.
    pub fn iter(&mut self) -> QueryIter<'_, Q> {
        self.acquire();

        let mut params = SmallVec::<[ParamInfo; 8]>::new();
        Q::params(&mut params);

        let mut missing = false;
        let mut columns = SmallVec::new();
        let mut driver: Option<&ComponentCell> = None;
        let consider = |cell: &'w ComponentCell, driver: &mut Option<&'w ComponentCell>| {
            if driver.map_or(true, |current| cell.len() < current.len()) {
                *driver = Some(cell);
            }
        };

        for info in &params {
            match self.world.component_cell(info.id) {
                Some(cell) => {
                    columns.push(cell.data());
                    consider(cell, &mut driver);
                }
                None => missing = true,
            }
        }

        let mut with = SmallVec::new();
        for &id in &self.with {
            match self.world.component_cell(id) {
                Some(cell) => {
                    with.push(cell);
                    consider(cell, &mut driver);
                }
                None => missing = true,
            }
        }

        // An absent `without` storage excludes nothing.
        let without: SmallVec<[&ComponentCell; 4]> = self
            .without
            .iter()
            .filter_map(|&id| self.world.component_cell(id))
            .collect();

        let entities: &[Entity] = if missing {
            &[]
        } else {
            driver.map_or(&[], |cell| cell.dense_entities())
        };

        QueryIter {
            entities: entities.iter(),
            columns,
            with,
            without,
            _marker: PhantomData,
        }
    }
}

impl<Q: QuerySpec> Drop for QueryBuilder<'_, Q> {
    fn drop(&mut self) {
        for &(cell, writes) in &self.borrows {
            if writes {
                cell.release_write();
            } else {
                cell.release_read();
            }
        }
    }
}

impl<'q, 'w, Q: QuerySpec> IntoIterator for &'q mut QueryBuilder<'w, Q> {
    type Item = Q::Item<'q>;
    type IntoIter = QueryIter<'q, Q>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Lazy iterator over a query's matches in dense storage order.
pub struct QueryIter<'q, Q: QuerySpec> {
    entities: core::slice::Iter<'q, Entity>,
    columns: SmallVec<[*mut (); 8]>,
    with: SmallVec<[&'q ComponentCell; 4]>,
    without: SmallVec<[&'q ComponentCell; 4]>,
    _marker: PhantomData<fn() -> Q>,
}

impl<'q, Q: QuerySpec> QueryIter<'q, Q> {
    fn next_with(&mut self) -> Option<(Entity, Q::Item<'q>)> {
        loop {
            let entity = *self.entities.next()?;
            if !self.with.iter().all(|cell| cell.contains(entity)) {
                continue;
            }
            if self.without.iter().any(|cell| cell.contains(entity)) {
                continue;
            }
            // The entity may be absent from a non-driving column; skip it.
            if let Some(item) = unsafe { Q::fetch(&self.columns, entity) } {
                return Some((entity, item));
            }
        }
    }

    /// Prepends the owning entity handle to each item.
    pub fn with_entity(self) -> WithEntity<'q, Q> {
        WithEntity { inner: self }
    }
}

impl<'q, Q: QuerySpec> Iterator for QueryIter<'q, Q> {
    type Item = Q::Item<'q>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_with().map(|(_, item)| item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.entities.len()))
    }
}

/// Query iterator yielding `(entity, item)` pairs.
pub struct WithEntity<'q, Q: QuerySpec> {
    inner: QueryIter<'q, Q>,
}

impl<'q, Q: QuerySpec> Iterator for WithEntity<'q, Q> {
    type Item = (Entity, Q::Item<'q>);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next_with()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}
