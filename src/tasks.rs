use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::cell::Cell;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use parking_lot::{Condvar, Mutex};

/// Identifies a task within the [`TaskGraph`] it was added to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskId(usize);

struct GraphNode {
    name: String,
    func: Option<Box<dyn FnOnce() + Send>>,
    dependents: Vec<usize>,
    dependencies: usize,
}

/// A DAG of named closures for the worker pool.
///
/// Edges express happens-before: a task does not start until every
/// predecessor has finished. The graph is consumed by
/// [`TaskPool::submit`].
#[derive(Default)]
pub struct TaskGraph {
    nodes: Vec<GraphNode>,
}

impl TaskGraph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a task. Tasks without incoming edges start immediately on
    /// submission.
    pub fn add_task(&mut self, name: impl Into<String>, f: impl FnOnce() + Send + 'static) -> TaskId {
        self.nodes.push(GraphNode {
            name: name.into(),
            func: Some(Box::new(f)),
            dependents: Vec::new(),
            dependencies: 0,
        });
        TaskId(self.nodes.len() - 1)
    }

    /// Declares that `before` must finish before `after` starts.
    pub fn add_edge(&mut self, before: TaskId, after: TaskId) {
        self.nodes[before.0].dependents.push(after.0);
        self.nodes[after.0].dependencies += 1;
    }

    /// Number of tasks.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph holds no tasks.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

struct ExecNode {
    name: String,
    func: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    remaining: AtomicUsize,
    dependents: Vec<usize>,
}

struct GraphState {
    nodes: Vec<ExecNode>,
    pending: AtomicUsize,
    panic: Mutex<Option<(String, Box<dyn core::any::Any + Send>)>>,
    done: Mutex<bool>,
    done_cv: Condvar,
}

type Unit = (Arc<GraphState>, usize);

struct PoolShared {
    injector: Injector<Unit>,
    stealers: Vec<Stealer<Unit>>,
    sleep_lock: Mutex<()>,
    wake: Condvar,
    shutdown: AtomicBool,
    /// Tasks sitting in some queue; gates worker sleep.
    queued: AtomicUsize,
}

thread_local! {
    static WORKER_INDEX: Cell<Option<usize>> = const { Cell::new(None) };
}

fn find_task(shared: &PoolShared, local: Option<&Worker<Unit>>) -> Option<Unit> {
    if let Some(local) = local {
        if let Some(unit) = local.pop() {
            shared.queued.fetch_sub(1, Ordering::AcqRel);
            return Some(unit);
        }
    }
    loop {
        let stolen = match local {
            Some(local) => shared.injector.steal_batch_and_pop(local),
            None => shared.injector.steal(),
        };
        match stolen {
            Steal::Success(unit) => {
                shared.queued.fetch_sub(1, Ordering::AcqRel);
                return Some(unit);
            }
            Steal::Retry => continue,
            Steal::Empty => break,
        }
    }
    loop {
        let mut retry = false;
        for stealer in &shared.stealers {
            match stealer.steal() {
                Steal::Success(unit) => {
                    shared.queued.fetch_sub(1, Ordering::AcqRel);
                    return Some(unit);
                }
                Steal::Retry => retry = true,
                Steal::Empty => {}
            }
        }
        if !retry {
            return None;
        }
    }
}

fn push_task(shared: &PoolShared, local: Option<&Worker<Unit>>, unit: Unit) {
    shared.queued.fetch_add(1, Ordering::AcqRel);
    match local {
        Some(local) => local.push(unit),
        None => shared.injector.push(unit),
    }
    let _guard = shared.sleep_lock.lock();
    shared.wake.notify_one();
}

fn run_unit(shared: &PoolShared, local: Option<&Worker<Unit>>, (state, index): Unit) {
    let node = &state.nodes[index];

    if let Some(func) = node.func.lock().take() {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(func)) {
            let mut slot = state.panic.lock();
            if slot.is_none() {
                *slot = Some((node.name.clone(), payload));
            }
        }
    }

    for &dependent in &node.dependents {
        if state.nodes[dependent].remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            push_task(shared, local, (Arc::clone(&state), dependent));
        }
    }

    if state.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
        let mut done = state.done.lock();
        *done = true;
        state.done_cv.notify_all();
    }
}

fn worker_main(shared: Arc<PoolShared>, local: Worker<Unit>, index: usize) {
    WORKER_INDEX.with(|cell| cell.set(Some(index)));
    loop {
        if let Some(unit) = find_task(&shared, Some(&local)) {
            run_unit(&shared, Some(&local), unit);
            continue;
        }
        let mut guard = shared.sleep_lock.lock();
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        if shared.queued.load(Ordering::Acquire) == 0 {
            shared.wake.wait(&mut guard);
        }
    }
    WORKER_INDEX.with(|cell| cell.set(None));
}

/// Completion future of a submitted [`TaskGraph`].
#[must_use = "wait on the handle to observe completion and panics"]
pub struct TaskHandle {
    state: Arc<GraphState>,
    shared: Arc<PoolShared>,
}

impl TaskHandle {
    /// Whether every task has finished.
    pub fn is_complete(&self) -> bool {
        self.state.pending.load(Ordering::Acquire) == 0
    }

    /// Blocks until the graph completes.
    ///
    /// When called on a worker thread (or any thread, via stealing) the
    /// caller donates itself to the pool instead of idling. A panic from
    /// any task is logged with the task's name and re-raised here.
    pub fn wait(self) {
        loop {
            if self.is_complete() {
                break;
            }
            match find_task(&self.shared, None) {
                Some(unit) => run_unit(&self.shared, None, unit),
                None => {
                    let mut done = self.state.done.lock();
                    if *done {
                        break;
                    }
                    // Re-check the queues periodically; tasks spawned by
                    // running tasks may become stealable.
                    let _ = self
                        .state
                        .done_cv
                        .wait_for(&mut done, Duration::from_millis(1));
                }
            }
        }

        if let Some((name, payload)) = self.state.panic.lock().take() {
            tracing::error!(task = %name, "task panicked");
            resume_unwind(payload);
        }
    }
}

/// Work-stealing pool of worker threads executing task DAGs.
pub struct TaskPool {
    shared: Arc<PoolShared>,
    threads: Vec<JoinHandle<()>>,
}

impl TaskPool {
    /// Spawns `worker_count` workers (at least one).
    pub fn new(worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        let workers: Vec<Worker<Unit>> = (0..worker_count).map(|_| Worker::new_fifo()).collect();
        let stealers = workers.iter().map(Worker::stealer).collect();

        let shared = Arc::new(PoolShared {
            injector: Injector::new(),
            stealers,
            sleep_lock: Mutex::new(()),
            wake: Condvar::new(),
            shutdown: AtomicBool::new(false),
            queued: AtomicUsize::new(0),
        });

        let threads = workers
            .into_iter()
            .enumerate()
            .map(|(index, local)| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("keel-worker-{index}"))
                    .spawn(move || worker_main(shared, local, index))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self { shared, threads }
    }

    /// Number of worker threads.
    pub fn worker_count(&self) -> usize {
        self.threads.len()
    }

    /// Enqueues a task DAG and returns its completion handle.
    pub fn submit(&self, graph: TaskGraph) -> TaskHandle {
        let nodes: Vec<ExecNode> = graph
            .nodes
            .into_iter()
            .map(|node| ExecNode {
                name: node.name,
                func: Mutex::new(node.func),
                remaining: AtomicUsize::new(node.dependencies),
                dependents: node.dependents,
            })
            .collect();

        let pending = nodes.len();
        let state = Arc::new(GraphState {
            nodes,
            pending: AtomicUsize::new(pending),
            panic: Mutex::new(None),
            done: Mutex::new(pending == 0),
            done_cv: Condvar::new(),
        });

        let mut ready = 0;
        for (index, node) in state.nodes.iter().enumerate() {
            if node.remaining.load(Ordering::Relaxed) == 0 {
                self.shared.queued.fetch_add(1, Ordering::AcqRel);
                self.shared.injector.push((Arc::clone(&state), index));
                ready += 1;
            }
        }
        if ready > 0 {
            let _guard = self.shared.sleep_lock.lock();
            self.shared.wake.notify_all();
        }

        TaskHandle {
            state,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Blocks until `handle` completes; see [`TaskHandle::wait`].
    pub fn wait(&self, handle: TaskHandle) {
        handle.wait();
    }

    /// Submits `graph` and cooperatively waits for it, donating the calling
    /// thread to the pool in the meantime.
    pub fn co_run(&self, graph: TaskGraph) {
        self.submit(graph).wait();
    }

    /// Index of the current worker thread, if this is one.
    pub fn current_worker_id() -> Option<usize> {
        WORKER_INDEX.with(Cell::get)
    }

    /// Whether the calling thread belongs to a pool.
    pub fn is_worker_thread() -> bool {
        Self::current_worker_id().is_some()
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        {
            let _guard = self.shared.sleep_lock.lock();
            self.shared.wake.notify_all();
        }
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn empty_graph_completes_immediately() {
        let pool = TaskPool::new(2);
        pool.submit(TaskGraph::new()).wait();
    }

    #[test]
    fn edges_impose_happens_before() {
        let pool = TaskPool::new(4);
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut graph = TaskGraph::new();
        let record = |label: &'static str| {
            let order = Arc::clone(&order);
            move || order.lock().push(label)
        };
        let a = graph.add_task("a", record("a"));
        let b = graph.add_task("b", record("b"));
        let c = graph.add_task("c", record("c"));
        graph.add_edge(a, b);
        graph.add_edge(b, c);

        pool.submit(graph).wait();
        assert_eq!(*order.lock(), vec!["a", "b", "c"]);
    }

    #[test]
    fn independent_tasks_all_run() {
        let pool = TaskPool::new(4);
        let counter = Arc::new(AtomicU32::new(0));

        let mut graph = TaskGraph::new();
        for i in 0..64 {
            let counter = Arc::clone(&counter);
            graph.add_task(format!("task-{i}"), move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        pool.submit(graph).wait();
        assert_eq!(counter.load(Ordering::Relaxed), 64);
    }

    #[test]
    fn diamond_dependencies() {
        let pool = TaskPool::new(4);
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut graph = TaskGraph::new();
        let record = |label: &'static str| {
            let log = Arc::clone(&log);
            move || log.lock().push(label)
        };
        let top = graph.add_task("top", record("top"));
        let left = graph.add_task("left", record("left"));
        let right = graph.add_task("right", record("right"));
        let bottom = graph.add_task("bottom", record("bottom"));
        graph.add_edge(top, left);
        graph.add_edge(top, right);
        graph.add_edge(left, bottom);
        graph.add_edge(right, bottom);

        pool.submit(graph).wait();
        let log = log.lock();
        assert_eq!(log.first(), Some(&"top"));
        assert_eq!(log.last(), Some(&"bottom"));
        assert_eq!(log.len(), 4);
    }

    #[test]
    #[should_panic(expected = "boom")]
    fn panics_propagate_at_the_join_point() {
        let pool = TaskPool::new(2);
        let mut graph = TaskGraph::new();
        graph.add_task("exploder", || panic!("boom"));
        pool.submit(graph).wait();
    }

    #[test]
    fn nested_graphs_via_cooperative_wait() {
        let pool = Arc::new(TaskPool::new(2));
        let counter = Arc::new(AtomicU32::new(0));

        let mut outer = TaskGraph::new();
        {
            let pool = Arc::clone(&pool);
            let counter = Arc::clone(&counter);
            outer.add_task("outer", move || {
                assert!(TaskPool::is_worker_thread());
                let mut inner = TaskGraph::new();
                for _ in 0..8 {
                    let counter = Arc::clone(&counter);
                    inner.add_task("inner", move || {
                        counter.fetch_add(1, Ordering::Relaxed);
                    });
                }
                pool.co_run(inner);
            });
        }
        pool.submit(outer).wait();
        assert_eq!(counter.load(Ordering::Relaxed), 8);
    }
}
