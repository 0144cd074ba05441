use core::any::TypeId;

use hashbrown::HashMap;
use tracing::{debug, error, warn};

use crate::schedule::{Schedule, ScheduleId, Stage, SystemOrdering, SystemSetId, SystemSetInfo};
use crate::system::{System, SystemStorage};
use crate::tasks::TaskPool;
use crate::world::World;

#[derive(Default)]
struct ScheduleConstraint {
    before: Vec<ScheduleId>,
    after: Vec<ScheduleId>,
}

/// Owns every schedule and system registration and drives them each tick.
///
/// Schedules are ordered by stage first, then by explicit inter-schedule
/// constraints; systems inside a schedule are ordered by the execution
/// graph their access policies and constraints produce.
#[derive(Default)]
pub struct Scheduler {
    schedules: HashMap<ScheduleId, Schedule>,
    /// Schedule creation order; keeps graph building and ties in the
    /// topological sort deterministic.
    insertion: Vec<ScheduleId>,
    storages: Vec<SystemStorage>,
    sets: HashMap<SystemSetId, SystemSetInfo>,
    constraints: HashMap<ScheduleId, ScheduleConstraint>,
    schedule_order: Vec<ScheduleId>,
    built: bool,
}

impl Scheduler {
    /// Creates a scheduler with no schedules.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a schedule in `stage`. Creating an existing schedule again
    /// is a no-op with a warning.
    pub fn add_schedule(&mut self, id: ScheduleId, stage: Stage) {
        if self.schedules.contains_key(&id) {
            warn!(schedule = id.0, "schedule already exists");
            return;
        }
        self.schedules.insert(id, Schedule::new(id, stage));
        self.insertion.push(id);
        self.built = false;
    }

    /// Registers `system` in `schedule`. A schedule that does not exist yet
    /// is created in the [`Update`](Stage::Update) stage with a warning.
    pub fn add_system<S: System>(&mut self, schedule: ScheduleId, system: S) {
        if !self.schedules.contains_key(&schedule) {
            warn!(
                schedule = schedule.0,
                "implicitly creating schedule in the update stage"
            );
            self.add_schedule(schedule, Stage::Update);
        }

        let index = self.storages.len();
        self.storages.push(SystemStorage::new(system));
        let entry = self.schedules.get_mut(&schedule).expect("just ensured");
        entry.system_indices.push(index);
        entry.invalidate();
        self.built = false;
    }

    /// Registers `system` in `schedule` and adds it to `set`.
    pub fn add_system_to_set<S: System>(
        &mut self,
        set: SystemSetId,
        schedule: ScheduleId,
        system: S,
    ) {
        self.add_system(schedule, system);
        self.sets
            .entry(set)
            .or_default()
            .members
            .push(TypeId::of::<S>());
    }

    /// Attaches explicit before/after constraints to `S` within `schedule`.
    pub fn register_ordering<S: System>(&mut self, schedule: ScheduleId, ordering: SystemOrdering) {
        let Some(entry) = self.schedules.get_mut(&schedule) else {
            warn!(
                schedule = schedule.0,
                "ordering registered for a schedule that does not exist"
            );
            return;
        };
        entry.register_ordering(TypeId::of::<S>(), ordering);
        self.built = false;
    }

    /// Every member of `a` runs before every member of `b`, per schedule
    /// where both have members.
    pub fn declare_set_before(&mut self, a: SystemSetId, b: SystemSetId) {
        self.sets.entry(a).or_default().before_sets.push(b);
        self.built = false;
    }

    /// Every member of `a` runs after every member of `b`.
    pub fn declare_set_after(&mut self, a: SystemSetId, b: SystemSetId) {
        self.sets.entry(a).or_default().after_sets.push(b);
        self.built = false;
    }

    /// Declares inter-schedule ordering constraints.
    pub fn set_schedule_constraint(
        &mut self,
        schedule: ScheduleId,
        before: &[ScheduleId],
        after: &[ScheduleId],
    ) {
        let entry = self.constraints.entry(schedule).or_default();
        entry.before.extend_from_slice(before);
        entry.after.extend_from_slice(after);
        self.built = false;
    }

    /// Total number of registered systems across all schedules.
    pub fn system_count(&self) -> usize {
        self.storages.len()
    }

    /// Whether `S` is registered in `schedule`.
    pub fn contains_system<S: System>(&self, schedule: ScheduleId) -> bool {
        self.schedules
            .get(&schedule)
            .is_some_and(|s| s.contains(TypeId::of::<S>(), &self.storages))
    }

    /// Execution count of `S` in `schedule`, if registered.
    pub fn execution_count<S: System>(&self, schedule: ScheduleId) -> Option<u64> {
        let schedule = self.schedules.get(&schedule)?;
        schedule
            .system_indices
            .iter()
            .map(|&index| &self.storages[index])
            .find(|storage| storage.type_id == TypeId::of::<S>())
            .map(|storage| storage.execution_count)
    }

    /// The topological schedule order of the last
    /// [`build_all_graphs`](Scheduler::build_all_graphs).
    pub fn schedule_order(&self) -> &[ScheduleId] {
        &self.schedule_order
    }

    /// Drops every schedule, system and set.
    pub fn clear(&mut self) {
        self.schedules.clear();
        self.insertion.clear();
        self.storages.clear();
        self.sets.clear();
        self.constraints.clear();
        self.schedule_order.clear();
        self.built = false;
    }

    /// Orders the schedules (stage partition plus explicit constraints,
    /// Kahn's algorithm) and builds every schedule's execution graph.
    ///
    /// A constraint cycle is reported as an error; the schedules trapped in
    /// it are appended in creation order so the tick still runs.
    pub fn build_all_graphs(&mut self, _world: &mut World) {
        self.schedule_order = self.sort_schedules();

        for id in &self.insertion {
            let schedule = self.schedules.get_mut(id).expect("insertion tracks schedules");
            schedule.build_execution_graph(&self.storages, &self.sets);
        }
        self.built = true;
        debug!(
            schedules = self.schedule_order.len(),
            systems = self.storages.len(),
            "built all execution graphs"
        );
    }

    fn sort_schedules(&self) -> Vec<ScheduleId> {
        let ids = &self.insertion;
        let position: HashMap<ScheduleId, usize> =
            ids.iter().enumerate().map(|(i, &id)| (id, i)).collect();

        let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); ids.len()];
        let mut indegree = vec![0usize; ids.len()];
        let add_edge = |adjacency: &mut Vec<Vec<usize>>,
                        indegree: &mut Vec<usize>,
                        from: usize,
                        to: usize| {
            if from != to && !adjacency[from].contains(&to) {
                adjacency[from].push(to);
                indegree[to] += 1;
            }
        };

        // Stage partitioning: every schedule of one stage precedes every
        // schedule of the next populated stage.
        let mut by_stage: Vec<Vec<usize>> = vec![Vec::new(); Stage::ALL.len()];
        for (index, id) in ids.iter().enumerate() {
            let stage = self.schedules[id].stage();
            let slot = Stage::ALL.iter().position(|&s| s == stage).expect("known stage");
            by_stage[slot].push(index);
        }
        let populated: Vec<&Vec<usize>> = by_stage.iter().filter(|g| !g.is_empty()).collect();
        for pair in populated.windows(2) {
            for &from in pair[0] {
                for &to in pair[1] {
                    add_edge(&mut adjacency, &mut indegree, from, to);
                }
            }
        }

        // Explicit inter-schedule constraints; unknown targets are ignored.
        for (&id, constraint) in &self.constraints {
            let Some(&from) = position.get(&id) else {
                warn!(schedule = id.0, "constraint on unknown schedule");
                continue;
            };
            for target in &constraint.before {
                match position.get(target) {
                    Some(&to) => add_edge(&mut adjacency, &mut indegree, from, to),
                    None => warn!(
                        schedule = id.0,
                        target = target.0,
                        "before constraint names an unknown schedule"
                    ),
                }
            }
            for target in &constraint.after {
                match position.get(target) {
                    Some(&to) => add_edge(&mut adjacency, &mut indegree, to, from),
                    None => warn!(
                        schedule = id.0,
                        target = target.0,
                        "after constraint names an unknown schedule"
                    ),
                }
            }
        }

        // Kahn's algorithm, seeded in creation order for determinism.
        let mut queue: std::collections::VecDeque<usize> =
            (0..ids.len()).filter(|&i| indegree[i] == 0).collect();
        let mut order = Vec::with_capacity(ids.len());
        while let Some(index) = queue.pop_front() {
            order.push(ids[index]);
            for &next in &adjacency[index] {
                indegree[next] -= 1;
                if indegree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if order.len() != ids.len() {
            error!("schedule constraint cycle detected; appending the remaining schedules in creation order");
            for &id in ids {
                if !order.contains(&id) {
                    order.push(id);
                }
            }
        }

        order
    }

    /// Runs one tick: every schedule in topological order, applying pending
    /// commands before each schedule and draining each system's command log
    /// after its schedule completes. The world's event queue is truncated
    /// at the start of the tick, so events live from the moment their
    /// schedule merges them until the next tick begins.
    pub fn run_tick(&mut self, world: &mut World, workers: &TaskPool) {
        if !self.built {
            contract_violation!("run_tick before build_all_graphs; building now");
            self.build_all_graphs(world);
        }

        world.clear_events();

        for id in self.schedule_order.clone() {
            // Commands accumulated by the previous schedule (or the
            // previous tick, for the first one).
            world.apply_commands();

            let schedule = self.schedules.get_mut(&id).expect("ordered ids exist");
            schedule.execute(world, workers, &mut self.storages);

            for &index in &schedule.system_indices {
                let local = &mut self.storages[index].local;
                let mut log = local.drain_commands();
                world.merge_commands(&mut log);
                local.reset_scratch();
            }
        }
    }
}
