//! Shared worker pool and per-caller task queues.
//!
//! A [`TaskPool`] owns a set of worker threads and one FIFO of pending work. Callers submit
//! work through a [`MulticoreLauncher`], which only ever sees the completions of tasks it
//! pushed itself. Workers are started when the first launcher attaches to a pool and retire
//! once the last one is released.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

type Job = Box<dyn FnOnce() + Send>;

type TaskFn<R> = dyn Fn(&LauncherHandle<R>, usize) -> anyhow::Result<R> + Send + Sync;

struct Shared {
    state: Mutex<PoolState>,
    wake: Condvar,
}

struct PoolState {
    desired: usize,
    live: usize,
    spawned: usize,
    attached: usize,
    next_launcher: u64,
    pending: VecDeque<Job>,
    launchers: HashMap<u64, LauncherSlot>,
}

#[derive(Default)]
struct LauncherSlot {
    outstanding: usize,
    finished: VecDeque<Box<dyn Any + Send>>,
}

/// Handle to a pool of worker threads. Cloning is cheap and refers to the same pool.
#[derive(Clone)]
pub struct TaskPool {
    shared: Arc<Shared>,
}

impl TaskPool {
    /// Process-wide pool sized to the number of cores, created on first use.
    pub fn global() -> &'static TaskPool {
        static GLOBAL: OnceLock<TaskPool> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            let threads = thread::available_parallelism().map_or(1, |n| n.get());
            TaskPool::new(threads)
        })
    }

    pub fn new(threads: usize) -> Self {
        TaskPool {
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState {
                    desired: threads.max(1),
                    live: 0,
                    spawned: 0,
                    attached: 0,
                    next_launcher: 0,
                    pending: VecDeque::new(),
                    launchers: HashMap::new(),
                }),
                wake: Condvar::new(),
            }),
        }
    }

    pub fn num_threads(&self) -> usize {
        self.shared.state.lock().desired
    }

    /// Worker threads currently alive.
    pub fn live_threads(&self) -> usize {
        self.shared.state.lock().live
    }

    /// Changes the desired worker count. While launchers are attached this blocks until the
    /// live count matches, or until the last launcher detaches and the workers retire.
    /// Must not be called from inside a task.
    pub fn set_num_threads(&self, threads: usize) {
        let mut state = self.shared.state.lock();
        state.desired = threads.max(1);
        if state.attached == 0 {
            return;
        }
        self.spawn_missing(&mut state);
        self.shared.wake.notify_all();
        while state.live != state.desired && state.attached > 0 {
            self.shared.wake.wait(&mut state);
        }
        tracing::debug!(threads = state.desired, "worker count changed");
    }

    fn attach(&self) -> u64 {
        let mut state = self.shared.state.lock();
        let id = state.next_launcher;
        state.next_launcher += 1;
        state.launchers.insert(id, LauncherSlot::default());
        state.attached += 1;
        self.spawn_missing(&mut state);
        id
    }

    fn detach(&self, id: u64) {
        let mut state = self.shared.state.lock();
        state.launchers.remove(&id);
        state.attached -= 1;
        self.shared.wake.notify_all();
    }

    fn spawn_missing(&self, state: &mut MutexGuard<'_, PoolState>) {
        while state.live < state.desired {
            state.live += 1;
            state.spawned += 1;
            let shared = self.shared.clone();
            let spawned = thread::Builder::new()
                .name(format!("recon-worker-{}", state.spawned))
                .spawn(move || worker_loop(shared));
            if let Err(e) = spawned {
                fatal(format_args!("failed to start worker thread: {e}"));
            }
        }
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let job = {
            let mut state = shared.state.lock();
            loop {
                let idle = state.attached == 0 && state.pending.is_empty();
                if state.live > state.desired || idle {
                    state.live -= 1;
                    shared.wake.notify_all();
                    return;
                }
                if let Some(job) = state.pending.pop_front() {
                    break job;
                }
                shared.wake.wait(&mut state);
            }
        };
        job();
    }
}

fn fatal(message: std::fmt::Arguments<'_>) -> ! {
    tracing::error!("{message}");
    eprintln!("fatal: {message}");
    std::process::abort()
}

/// A finished unit of work.
#[derive(Debug)]
pub struct Task<R> {
    pub index: usize,
    pub result: R,
}

/// Cloneable reference to a launcher, handed to running tasks so they can push more work
/// onto the launcher they came from.
pub struct LauncherHandle<R> {
    shared: Arc<Shared>,
    id: u64,
    _result: PhantomData<fn() -> R>,
}

impl<R> Clone for LauncherHandle<R> {
    fn clone(&self) -> Self {
        LauncherHandle {
            shared: self.shared.clone(),
            id: self.id,
            _result: PhantomData,
        }
    }
}

impl<R: Send + 'static> LauncherHandle<R> {
    /// Enqueues `count` tasks calling `f` with indices `first..first + count`.
    pub fn push<F>(&self, f: F, first: usize, count: usize) -> &Self
    where
        F: Fn(&LauncherHandle<R>, usize) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        if count == 0 {
            return self;
        }

        let func: Arc<TaskFn<R>> = Arc::new(f);
        let jobs = (first..first + count).map(|index| {
            let handle = self.clone();
            let func = func.clone();
            Box::new(move || handle.run(&*func, index)) as Job
        });

        let mut state = self.shared.state.lock();
        let Some(slot) = state.launchers.get_mut(&self.id) else {
            panic!("push on a launcher that was already released");
        };
        slot.outstanding += count;
        state.pending.extend(jobs);
        self.shared.wake.notify_all();
        self
    }

    fn run(&self, func: &TaskFn<R>, index: usize) {
        let result = match panic::catch_unwind(AssertUnwindSafe(|| func(self, index))) {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => fatal(format_args!("task {index} failed: {e:#}")),
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_default();
                fatal(format_args!("task {index} panicked: {message}"))
            }
        };

        let mut state = self.shared.state.lock();
        if let Some(slot) = state.launchers.get_mut(&self.id) {
            slot.finished.push_back(Box::new(Task { index, result }));
        }
        self.shared.wake.notify_all();
    }

    /// Pushed but not yet popped.
    pub fn num_tasks(&self) -> usize {
        let state = self.shared.state.lock();
        state.launchers.get(&self.id).map_or(0, |s| s.outstanding)
    }

    /// Poppable without blocking.
    pub fn num_finished(&self) -> usize {
        let state = self.shared.state.lock();
        state.launchers.get(&self.id).map_or(0, |s| s.finished.len())
    }
}

/// Caller-owned task queue backed by a [`TaskPool`].
pub struct MulticoreLauncher<R: Send + 'static> {
    pool: TaskPool,
    handle: LauncherHandle<R>,
}

impl<R: Send + 'static> MulticoreLauncher<R> {
    pub fn new() -> Self {
        Self::with_pool(TaskPool::global())
    }

    pub fn with_pool(pool: &TaskPool) -> Self {
        let id = pool.attach();
        MulticoreLauncher {
            pool: pool.clone(),
            handle: LauncherHandle {
                shared: pool.shared.clone(),
                id,
                _result: PhantomData,
            },
        }
    }

    pub fn handle(&self) -> &LauncherHandle<R> {
        &self.handle
    }

    pub fn push<F>(&self, f: F, first: usize, count: usize) -> &Self
    where
        F: Fn(&LauncherHandle<R>, usize) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        self.handle.push(f, first, count);
        self
    }

    pub fn num_tasks(&self) -> usize {
        self.handle.num_tasks()
    }

    pub fn num_finished(&self) -> usize {
        self.handle.num_finished()
    }

    /// Blocks until one of this launcher's tasks has finished and returns the oldest one.
    ///
    /// Panics when nothing is outstanding.
    pub fn pop(&self) -> Task<R> {
        let shared = &self.handle.shared;
        let mut state = shared.state.lock();
        loop {
            let Some(slot) = state.launchers.get_mut(&self.handle.id) else {
                unreachable!("launcher slot exists while the launcher is alive");
            };
            if let Some(task) = slot.finished.pop_front() {
                slot.outstanding -= 1;
                return match task.downcast::<Task<R>>() {
                    Ok(task) => *task,
                    Err(_) => unreachable!("launcher slots only hold their own result type"),
                };
            }
            assert!(slot.outstanding > 0, "pop() called with no outstanding tasks");
            shared.wake.wait(&mut state);
        }
    }

    /// Pops until nothing is outstanding. With a label, prints percentage progress to
    /// stderr at most ten times per second.
    pub fn pop_all(&self, label: Option<&str>) -> Vec<Task<R>> {
        let mut done = Vec::with_capacity(self.num_tasks());
        let mut last_report: Option<Instant> = None;

        loop {
            let remaining = self.num_tasks();
            if remaining == 0 {
                break;
            }

            if let Some(label) = label
                && last_report.is_none_or(|t| t.elapsed() >= PROGRESS_INTERVAL)
            {
                let percent = 100.0 * done.len() as f64 / (done.len() + remaining) as f64;
                eprint!("\r{label} {percent:.0}%   ");
                let _ = std::io::stderr().flush();
                last_report = Some(Instant::now());
            }

            done.push(self.pop());
        }

        if let Some(label) = label {
            eprintln!("\r{label} 100%   ");
        }
        done
    }
}

impl<R: Send + 'static> Default for MulticoreLauncher<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Send + 'static> Drop for MulticoreLauncher<R> {
    fn drop(&mut self) {
        while self.num_tasks() > 0 {
            self.pop();
        }
        self.pool.detach(self.handle.id);
    }
}
