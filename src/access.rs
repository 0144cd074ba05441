use core::any::TypeId;

use smallvec::SmallVec;

use crate::query::QuerySpec;
use crate::resources::Resource;

type TypeList = SmallVec<[TypeId; 8]>;

fn insert_sorted(list: &mut TypeList, id: TypeId) {
    if let Err(position) = list.binary_search(&id) {
        list.insert(position, id);
    }
}

/// Merge-walk over two sorted lists.
fn intersects(lhs: &[TypeId], rhs: &[TypeId]) -> bool {
    let (mut i, mut j) = (0, 0);
    while i < lhs.len() && j < rhs.len() {
        match lhs[i].cmp(&rhs[j]) {
            core::cmp::Ordering::Less => i += 1,
            core::cmp::Ordering::Greater => j += 1,
            core::cmp::Ordering::Equal => return true,
        }
    }
    false
}

/// Component footprint of a single query: which types it reads and which it
/// writes, each kept sorted for cheap intersection.
#[derive(Clone, Debug, Default)]
pub struct QueryDescriptor {
    reads: TypeList,
    writes: TypeList,
}

impl QueryDescriptor {
    pub(crate) fn add_read(&mut self, id: TypeId) {
        insert_sorted(&mut self.reads, id);
    }

    pub(crate) fn add_write(&mut self, id: TypeId) {
        insert_sorted(&mut self.writes, id);
    }

    fn conflicts_with(&self, other: &QueryDescriptor) -> bool {
        intersects(&self.writes, &other.writes)
            || intersects(&self.writes, &other.reads)
            || intersects(&self.reads, &other.writes)
    }
}

/// Tuple of resource types accepted by
/// [`AccessPolicy::read_resources`]/[`AccessPolicy::write_resources`].
pub trait ResourceSet {
    #[doc(hidden)]
    fn for_each(f: &mut impl FnMut(TypeId, bool, &'static str));
}

impl<R: Resource> ResourceSet for R {
    fn for_each(f: &mut impl FnMut(TypeId, bool, &'static str)) {
        f(
            TypeId::of::<R>(),
            R::thread_safe(),
            core::any::type_name::<R>(),
        );
    }
}

macro_rules! resource_set_tuple {
    ($($name:ident),*) => {
        impl<$($name: Resource),*> ResourceSet for ($($name,)*) {
            fn for_each(_f: &mut impl FnMut(TypeId, bool, &'static str)) {
                $(<$name as ResourceSet>::for_each(_f);)*
            }
        }
    };
}

resource_set_tuple!();
resource_set_tuple!(A, B);
resource_set_tuple!(A, B, C);
resource_set_tuple!(A, B, C, D);
resource_set_tuple!(A, B, C, D, E);
resource_set_tuple!(A, B, C, D, E, F);

/// Declares the data a system touches, driving conflict analysis.
///
/// Built once at system registration:
///
/// ```
/// # use keel::{AccessPolicy, Resource};
/// # #[derive(Clone, Copy)] struct Transform; struct SpriteRenderer;
/// # struct Camera; impl Resource for Camera {}
/// # struct RenderQueue; impl Resource for RenderQueue {}
/// let policy = AccessPolicy::new()
///     .query::<(&mut Transform, &SpriteRenderer)>()
///     .read_resources::<Camera>()
///     .write_resources::<RenderQueue>();
/// ```
///
/// Two policies conflict when any of their queries overlap on a component
/// with a writer involved, or when their resource sets overlap the same
/// way. Thread-safe resources never participate.
#[derive(Clone, Debug, Default)]
pub struct AccessPolicy {
    queries: SmallVec<[QueryDescriptor; 4]>,
    read_resources: TypeList,
    write_resources: TypeList,
}

impl AccessPolicy {
    /// An empty policy; conflicts with nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares one query over component types. Mutable references count as
    /// writes, shared references as reads.
    pub fn query<Q: QuerySpec>(mut self) -> Self {
        let mut descriptor = QueryDescriptor::default();
        Q::describe(&mut descriptor);
        self.queries.push(descriptor);
        self
    }

    /// Declares read access to resource types. Thread-safe resources are
    /// dropped from the policy with a diagnostic.
    pub fn read_resources<R: ResourceSet>(mut self) -> Self {
        R::for_each(&mut |id, thread_safe, name| {
            if thread_safe {
                tracing::info!(
                    resource = name,
                    "thread-safe resource ignored in read_resources"
                );
            } else {
                insert_sorted(&mut self.read_resources, id);
            }
        });
        self
    }

    /// Declares write access to resource types. Thread-safe resources are
    /// dropped from the policy with a diagnostic.
    pub fn write_resources<R: ResourceSet>(mut self) -> Self {
        R::for_each(&mut |id, thread_safe, name| {
            if thread_safe {
                tracing::info!(
                    resource = name,
                    "thread-safe resource ignored in write_resources"
                );
            } else {
                insert_sorted(&mut self.write_resources, id);
            }
        });
        self
    }

    /// Whether any queries are declared.
    pub fn has_queries(&self) -> bool {
        !self.queries.is_empty()
    }

    /// Whether any resource access is declared.
    pub fn has_resources(&self) -> bool {
        !self.read_resources.is_empty() || !self.write_resources.is_empty()
    }

    /// Whether some query of `self` and some query of `other` overlap on a
    /// component with at least one writer.
    pub fn has_query_conflict(&self, other: &AccessPolicy) -> bool {
        if !self.has_queries() || !other.has_queries() {
            return false;
        }
        self.queries.iter().any(|mine| {
            other
                .queries
                .iter()
                .any(|theirs| mine.conflicts_with(theirs))
        })
    }

    /// Whether the resource sets overlap with at least one writer.
    pub fn has_resource_conflict(&self, other: &AccessPolicy) -> bool {
        if !self.has_resources() || !other.has_resources() {
            return false;
        }
        intersects(&self.write_resources, &other.write_resources)
            || intersects(&self.write_resources, &other.read_resources)
            || intersects(&self.read_resources, &other.write_resources)
    }

    /// Disjunction of the query and resource conflict tests.
    pub fn conflicts_with(&self, other: &AccessPolicy) -> bool {
        self.has_query_conflict(other) || self.has_resource_conflict(other)
    }
}
