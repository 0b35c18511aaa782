// Copyright 2024 The dedupv1d Authors.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Named periodic tasks driven by one scheduling thread and executed on a
//! shared worker pool (§4.1). One dedicated OS thread inspects the task
//! table on an interval bounded by the shortest registered task's period;
//! ready tasks are submitted to the pool rather than run inline, so a slow
//! callback never blocks the next tick.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use base::info;
use base::Event;
use base::WorkerThread;
use dashmap::DashMap;
use sync::Mutex;

const DEFAULT_TICK: Duration = Duration::from_secs(1);

type Job = Box<dyn FnOnce() + Send + 'static>;
type Callback = Box<dyn FnMut(ScheduleContext) + Send>;

/// Passed to every task invocation; `abort` is set on a final, best-effort
/// invocation issued while the task is still in flight at shutdown (§4.1:
/// "callback decides whether to honor quickly").
#[derive(Copy, Clone, Debug, Default)]
pub struct ScheduleContext {
    pub abort: bool,
}

#[derive(thiserror::Error, Debug)]
pub enum SchedulerError {
    #[error("a task named {0:?} is already scheduled")]
    DuplicateTask(String),
}

/// A fixed pool of long-lived OS threads draining a shared job queue —
/// the "shared worker pool" the scheduler submits ready tasks to (§4.1,
/// §5), distinct from a `Volume`'s own `WorkerThread`s.
pub struct WorkerPool {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Arc<WorkerPool> {
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = Vec::with_capacity(size);
        for idx in 0..size.max(1) {
            let rx = rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("dedupv1-pool{}", idx))
                .spawn(move || loop {
                    let job = rx.lock().recv();
                    match job {
                        Ok(job) => job(),
                        Err(_) => break,
                    }
                })
                .expect("failed to spawn worker pool thread");
            workers.push(handle);
        }
        Arc::new(WorkerPool {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        })
    }

    pub fn submit(&self, job: Job) {
        if let Some(tx) = self.sender.lock().as_ref() {
            let _ = tx.send(job);
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.sender.lock().take();
        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

struct ScheduledTask {
    name: String,
    interval: Duration,
    max_concurrency: usize,
    in_flight: AtomicUsize,
    last_exec: Mutex<Instant>,
    callback: Mutex<Callback>,
}

/// `Start(pool)` / `Run()` / `Submit` / `Remove` / `IsScheduled` / `Stop`
/// (§4.1). State is volatile; callers re-submit tasks after a restart.
pub struct Scheduler {
    tasks: DashMap<String, Arc<ScheduledTask>>,
    pool: Mutex<Option<Arc<WorkerPool>>>,
    thread: Mutex<Option<WorkerThread<()>>>,
    abort: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new() -> Arc<Scheduler> {
        Arc::new(Scheduler {
            tasks: DashMap::new(),
            pool: Mutex::new(None),
            thread: Mutex::new(None),
            abort: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn start(&self, pool: Arc<WorkerPool>) {
        *self.pool.lock() = Some(pool);
    }

    /// Launches the scheduling loop on its own OS thread.
    pub fn run(self: &Arc<Self>) {
        let scheduler = self.clone();
        let worker = WorkerThread::start("dedupv1-scheduler", move |kill_evt: Event| {
            while !kill_evt.wait_timeout(scheduler.tick()) {}
        });
        *self.thread.lock() = Some(worker);
    }

    /// Submits every ready task to the pool, returning the wait bound for
    /// the next tick (the shortest registered interval, or a 1s default).
    fn tick(&self) -> Duration {
        let now = Instant::now();
        let mut next_wait = DEFAULT_TICK;
        for entry in self.tasks.iter() {
            let task = entry.value().clone();
            next_wait = next_wait.min(task.interval);
            let mut last = task.last_exec.lock();
            if now.duration_since(*last) < task.interval {
                continue;
            }
            if task.in_flight.load(Ordering::Acquire) >= task.max_concurrency {
                continue;
            }
            *last = now;
            drop(last);
            task.in_flight.fetch_add(1, Ordering::AcqRel);

            let abort = self.abort.load(Ordering::Acquire);
            let pool = self.pool.lock().clone();
            if let Some(pool) = pool {
                let task = task.clone();
                pool.submit(Box::new(move || {
                    (task.callback.lock())(ScheduleContext { abort });
                    task.in_flight.fetch_sub(1, Ordering::AcqRel);
                }));
            } else {
                task.in_flight.fetch_sub(1, Ordering::AcqRel);
            }
        }
        next_wait
    }

    /// Fails if `name` is already scheduled (§4.1).
    pub fn submit(
        &self,
        name: impl Into<String>,
        interval_seconds: u64,
        max_concurrency: usize,
        callback: Callback,
    ) -> Result<(), SchedulerError> {
        let name = name.into();
        if self.tasks.contains_key(&name) {
            return Err(SchedulerError::DuplicateTask(name));
        }
        let interval = Duration::from_secs(interval_seconds);
        info!("scheduler: task {:?} submitted (interval={}s)", name, interval_seconds);
        self.tasks.insert(
            name.clone(),
            Arc::new(ScheduledTask {
                name,
                interval,
                max_concurrency: max_concurrency.max(1),
                in_flight: AtomicUsize::new(0),
                last_exec: Mutex::new(now_minus(interval)),
                callback: Mutex::new(callback),
            }),
        );
        Ok(())
    }

    pub fn remove(&self, name: &str) -> bool {
        self.tasks.remove(name).is_some()
    }

    pub fn is_scheduled(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Signals the scheduling thread to exit and asks every task currently
    /// in flight to abort. Does not wait for the pool itself to drain;
    /// callers own the `WorkerPool`'s lifetime.
    pub fn stop(&self) {
        self.abort.store(true, Ordering::Release);
        for entry in self.tasks.iter() {
            if entry.value().in_flight.load(Ordering::Acquire) > 0 {
                let task = entry.value().clone();
                info!("scheduler: aborting in-flight task {:?}", task.name);
                (task.callback.lock())(ScheduleContext { abort: true });
            }
        }
        if let Some(thread) = self.thread.lock().take() {
            thread.stop();
        }
    }
}

fn now_minus(d: Duration) -> Instant {
    Instant::now().checked_sub(d).unwrap_or_else(Instant::now)
}
