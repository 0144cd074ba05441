use core::any::TypeId;
use core::fmt;

use bit_set::BitSet;
use hashbrown::HashMap;
use tracing::{debug, error, trace, warn};

use crate::system::{System, SystemContext, SystemStorage};
use crate::tasks::{TaskGraph, TaskPool};
use crate::world::World;

/// Names a schedule.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ScheduleId(pub &'static str);

impl fmt::Display for ScheduleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Names a system set.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SystemSetId(pub &'static str);

impl fmt::Display for SystemSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Outer phases partitioning the schedules of a tick.
///
/// Every schedule of one stage runs before any schedule of the next.
/// [`Main`](Stage::Main) is special: its schedules execute sequentially on
/// the calling thread, and each system's events merge into the world
/// immediately, so later systems in the same schedule observe them.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub enum Stage {
    /// One-time and early-tick work.
    Startup,
    /// Sequential, same-phase event visibility (input propagation).
    Main,
    /// The bulk of the simulation; parallel.
    Update,
    /// End-of-tick work; parallel.
    Cleanup,
}

impl Stage {
    pub(crate) const ALL: [Stage; 4] = [Stage::Startup, Stage::Main, Stage::Update, Stage::Cleanup];
}

/// Explicit before/after constraints of one system within one schedule.
#[derive(Clone, Default)]
pub struct SystemOrdering {
    pub(crate) before: Vec<TypeId>,
    pub(crate) after: Vec<TypeId>,
}

impl SystemOrdering {
    /// An empty ordering.
    pub fn new() -> Self {
        Self::default()
    }

    /// The constrained system must run before `S`.
    pub fn before<S: System>(mut self) -> Self {
        self.before.push(TypeId::of::<S>());
        self
    }

    /// The constrained system must run after `S`.
    pub fn after<S: System>(mut self) -> Self {
        self.after.push(TypeId::of::<S>());
        self
    }
}

/// Membership and ordering of a named system set.
#[derive(Default)]
pub(crate) struct SystemSetInfo {
    pub members: Vec<TypeId>,
    pub before_sets: Vec<SystemSetId>,
    pub after_sets: Vec<SystemSetId>,
}

/// Raw pointer wrappers so system tasks can be handed to the worker pool.
///
/// The executor blocks on the graph's completion before returning, so the
/// pointees outlive every task; conflict edges rule out data races on the
/// storage slots.
struct SharedPtr<T>(*const T);
unsafe impl<T: Sync> Send for SharedPtr<T> {}

struct SharedMutPtr<T>(*mut T);
unsafe impl<T: Send> Send for SharedMutPtr<T> {}

/// A named group of systems with its own execution graph.
pub struct Schedule {
    id: ScheduleId,
    stage: Stage,
    /// Indices into the scheduler's storage vector, in registration order.
    pub(crate) system_indices: Vec<usize>,
    orderings: HashMap<TypeId, SystemOrdering>,
    /// Frozen dependency edges between local system indices.
    edges: Vec<(usize, usize)>,
    graph_built: bool,
    /// Set when graph construction found an ordering cycle; the schedule
    /// then degrades to sequential registration order.
    fallback_sequential: bool,
}

impl Schedule {
    pub(crate) fn new(id: ScheduleId, stage: Stage) -> Self {
        Self {
            id,
            stage,
            system_indices: Vec::new(),
            orderings: HashMap::new(),
            edges: Vec::new(),
            graph_built: false,
            fallback_sequential: false,
        }
    }

    /// The schedule's name.
    pub fn id(&self) -> ScheduleId {
        self.id
    }

    /// The stage this schedule belongs to.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Number of systems registered here.
    pub fn system_count(&self) -> usize {
        self.system_indices.len()
    }

    pub(crate) fn invalidate(&mut self) {
        self.graph_built = false;
        self.fallback_sequential = false;
        self.edges.clear();
    }

    pub(crate) fn register_ordering(&mut self, system: TypeId, ordering: SystemOrdering) {
        let entry = self.orderings.entry(system).or_default();
        entry.before.extend(ordering.before);
        entry.after.extend(ordering.after);
        self.invalidate();
    }

    pub(crate) fn contains(&self, type_id: TypeId, storages: &[SystemStorage]) -> bool {
        self.system_indices
            .iter()
            .any(|&index| storages[index].type_id == type_id)
    }

    /// Builds the frozen edge list: explicit orderings, set-derived
    /// orderings, then access-policy conflicts with the registration-order
    /// tiebreak.
    pub(crate) fn build_execution_graph(
        &mut self,
        storages: &[SystemStorage],
        sets: &HashMap<SystemSetId, SystemSetInfo>,
    ) {
        let count = self.system_indices.len();
        self.edges.clear();
        self.fallback_sequential = false;
        if count == 0 {
            self.graph_built = true;
            return;
        }

        let mut by_type: HashMap<TypeId, usize> = HashMap::with_capacity(count);
        for (local, &storage_index) in self.system_indices.iter().enumerate() {
            by_type.insert(storages[storage_index].type_id, local);
        }

        let mut edges = Vec::new();
        let mut seen = BitSet::with_capacity(count * count);
        let mut add_edge = |edges: &mut Vec<(usize, usize)>, from: usize, to: usize| {
            if from != to && seen.insert(from * count + to) {
                edges.push((from, to));
            }
        };

        // Explicit per-system orderings registered for this schedule.
        for (&system_id, ordering) in &self.orderings {
            let Some(&local) = by_type.get(&system_id) else {
                warn!(
                    schedule = self.id.0,
                    "a system with ordering constraints is not in this schedule"
                );
                continue;
            };
            let name = storages[self.system_indices[local]].name;

            for target in &ordering.before {
                if let Some(&target_local) = by_type.get(target) {
                    trace!(
                        schedule = self.id.0,
                        system = name,
                        before = storages[self.system_indices[target_local]].name,
                        "explicit ordering"
                    );
                    add_edge(&mut edges, local, target_local);
                } else {
                    warn!(
                        schedule = self.id.0,
                        system = name,
                        "before constraint names a system absent from this schedule"
                    );
                }
            }
            for target in &ordering.after {
                if let Some(&target_local) = by_type.get(target) {
                    trace!(
                        schedule = self.id.0,
                        system = name,
                        after = storages[self.system_indices[target_local]].name,
                        "explicit ordering"
                    );
                    add_edge(&mut edges, target_local, local);
                } else {
                    warn!(
                        schedule = self.id.0,
                        system = name,
                        "after constraint names a system absent from this schedule"
                    );
                }
            }
        }

        // Set-derived orderings, recorded back as explicit orderings so
        // diagnostics show where the edges came from.
        let mut recorded: Vec<(TypeId, TypeId)> = Vec::new();
        for info in sets.values() {
            if info.members.is_empty() {
                continue;
            }
            for other_id in &info.before_sets {
                let Some(other) = sets.get(other_id) else {
                    continue;
                };
                for &member in &info.members {
                    let Some(&from) = by_type.get(&member) else {
                        continue;
                    };
                    for &other_member in &other.members {
                        let Some(&to) = by_type.get(&other_member) else {
                            continue;
                        };
                        add_edge(&mut edges, from, to);
                        recorded.push((member, other_member));
                    }
                }
            }
            for other_id in &info.after_sets {
                let Some(other) = sets.get(other_id) else {
                    continue;
                };
                for &member in &info.members {
                    let Some(&to) = by_type.get(&member) else {
                        continue;
                    };
                    for &other_member in &other.members {
                        let Some(&from) = by_type.get(&other_member) else {
                            continue;
                        };
                        add_edge(&mut edges, from, to);
                        recorded.push((other_member, member));
                    }
                }
            }
        }
        for (before, after) in recorded {
            let entry = self.orderings.entry(before).or_default();
            if !entry.before.contains(&after) {
                entry.before.push(after);
            }
        }

        // Data dependencies. The `i < j` asymmetry makes the earlier
        // registration run first when either order would be correct.
        for i in 0..count {
            for j in (i + 1)..count {
                let a = &storages[self.system_indices[i]];
                let b = &storages[self.system_indices[j]];
                if a.policy.conflicts_with(&b.policy) {
                    trace!(
                        schedule = self.id.0,
                        before = a.name,
                        after = b.name,
                        "data-conflict ordering"
                    );
                    add_edge(&mut edges, i, j);
                }
            }
        }

        // The task pool would never finish a cyclic graph; detect the cycle
        // here and degrade instead of deadlocking the tick.
        if has_cycle(count, &edges) {
            error!(
                schedule = self.id.0,
                "ordering cycle among systems; the schedule will run sequentially in registration order"
            );
            self.fallback_sequential = true;
            self.edges.clear();
        } else {
            self.edges = edges;
        }

        self.graph_built = true;
        debug!(
            schedule = self.id.0,
            systems = count,
            edges = self.edges.len(),
            "built execution graph"
        );
    }

    /// Runs the schedule: sequentially on the caller for the main stage
    /// (and cycle fallback), through the worker pool otherwise. Local event
    /// queues merge into the world per system (main) or after the whole
    /// schedule (parallel).
    pub(crate) fn execute(
        &self,
        world: &mut World,
        pool: &TaskPool,
        storages: &mut [SystemStorage],
    ) {
        if !self.graph_built {
            contract_violation!(
                "schedule {} executed before build_all_graphs; running sequentially",
                self.id.0
            );
        }

        let sequential =
            self.stage == Stage::Main || self.fallback_sequential || !self.graph_built;

        if sequential {
            for &index in &self.system_indices {
                {
                    let storage = &mut storages[index];
                    let SystemStorage {
                        system,
                        local,
                        name,
                        execution_count,
                        ..
                    } = storage;
                    let mut ctx = SystemContext::new(world, local, Some(pool), *name);
                    system.run(&mut ctx);
                    *execution_count += 1;
                }
                if self.stage == Stage::Main {
                    let local = &mut storages[index].local;
                    if !local.events().is_empty() {
                        world.merge_event_queue(local.events_mut());
                    }
                }
            }
            if self.stage != Stage::Main {
                self.merge_all_events(world, storages);
            }
            return;
        }

        let mut graph = TaskGraph::new();
        let mut tasks = Vec::with_capacity(self.system_indices.len());
        for &index in &self.system_indices {
            let name = storages[index].name;
            let storage_ptr = SharedMutPtr(&mut storages[index] as *mut SystemStorage);
            let world_ptr = SharedPtr(&*world as *const World);
            let pool_ptr = SharedPtr(pool as *const TaskPool);
            tasks.push(graph.add_task(name, move || {
                // The executor waits on the graph before touching any of
                // these again; each storage slot belongs to exactly one
                // task.
                // Rebind whole wrappers first so the closure captures the
                // `Send` wrapper types rather than their raw-pointer field
                // (Rust 2021 disjoint closure capture would otherwise grab
                // just the field, which is not `Send`).
                let (storage_ptr, world_ptr, pool_ptr) = (storage_ptr, world_ptr, pool_ptr);
                let storage = unsafe { &mut *storage_ptr.0 };
                let world = unsafe { &*world_ptr.0 };
                let pool = unsafe { &*pool_ptr.0 };
                let SystemStorage {
                    system,
                    local,
                    name,
                    execution_count,
                    ..
                } = storage;
                let mut ctx = SystemContext::new(world, local, Some(pool), *name);
                system.run(&mut ctx);
                *execution_count += 1;
            }));
        }
        for &(from, to) in &self.edges {
            graph.add_edge(tasks[from], tasks[to]);
        }

        pool.submit(graph).wait();
        self.merge_all_events(world, storages);
    }

    fn merge_all_events(&self, world: &mut World, storages: &mut [SystemStorage]) {
        for &index in &self.system_indices {
            let local = &mut storages[index].local;
            if !local.events().is_empty() {
                world.merge_event_queue(local.events_mut());
            }
        }
    }
}

fn has_cycle(count: usize, edges: &[(usize, usize)]) -> bool {
    let mut indegree = vec![0usize; count];
    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); count];
    for &(from, to) in edges {
        adjacency[from].push(to);
        indegree[to] += 1;
    }

    let mut queue: Vec<usize> = (0..count).filter(|&i| indegree[i] == 0).collect();
    let mut visited = 0;
    while let Some(node) = queue.pop() {
        visited += 1;
        for &next in &adjacency[node] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                queue.push(next);
            }
        }
    }
    visited != count
}
