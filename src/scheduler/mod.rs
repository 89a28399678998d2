// Scheduler - fixed worker pool with affinity flags
//
// Tasks sit in one FIFO queue. A worker takes the oldest task it is allowed
// to run: tasks without affinity go to anyone, flagged tasks only to workers
// sharing one of the flags. `wait_for_queued_tasks` is the frame barrier.

pub mod worker;

pub use worker::{Worker, WorkerStatus};

use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use bitflags::bitflags;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

bitflags! {
    /// Task categories a worker specialises in.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct WorkerFlags: u32 {
        const RENDERING = 1 << 0;
        const RESOURCE = 1 << 1;
        const LOGGING = 1 << 2;
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Task {
    affinity: WorkerFlags,
    job: Job,
}

#[derive(Default)]
struct QueueState {
    tasks: VecDeque<Task>,
    /// Queued plus running
    outstanding: usize,
    shutdown: bool,
}

impl QueueState {
    fn take_for(&mut self, flags: WorkerFlags) -> Option<Task> {
        let position = self
            .tasks
            .iter()
            .position(|task| task.affinity.is_empty() || task.affinity.intersects(flags))?;
        self.tasks.remove(position)
    }
}

#[derive(Default)]
struct Shared {
    state: Mutex<QueueState>,
    task_available: Condvar,
    all_done: Condvar,
}

pub struct Scheduler {
    shared: Arc<Shared>,
    worker_flags: Vec<WorkerFlags>,
    workers: Mutex<Vec<Worker>>,
}

impl Scheduler {
    /// Spawn the pool. Specialised workers come first (rendering, resource,
    /// logging), the rest take only unflagged tasks.
    pub fn new(config: &SchedulerConfig) -> Result<Self> {
        let count = config.worker_count();
        if config.specialised_workers() > count {
            return Err(Error::InvalidConfig(format!(
                "{} specialised workers do not fit in a pool of {}",
                config.specialised_workers(),
                count
            )));
        }

        let worker_flags: Vec<WorkerFlags> = std::iter::empty()
            .chain(std::iter::repeat(WorkerFlags::RENDERING).take(config.rendering_workers))
            .chain(std::iter::repeat(WorkerFlags::RESOURCE).take(config.resource_workers))
            .chain(std::iter::repeat(WorkerFlags::LOGGING).take(config.logging_workers))
            .chain(std::iter::repeat(WorkerFlags::empty()))
            .take(count)
            .collect();

        let shared = Arc::new(Shared::default());
        let mut workers = Vec::with_capacity(count);
        for (index, &flags) in worker_flags.iter().enumerate() {
            let label = format!("worker-{}{}", index, flag_suffix(flags));
            let thread_shared = shared.clone();
            let worker = Worker::spawn(Some(label), flags, move |status| {
                worker_main(&thread_shared, flags, status)
            });
            match worker {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    // Stop whatever already started before giving up
                    shared.state.lock().shutdown = true;
                    shared.task_available.notify_all();
                    return Err(e);
                }
            }
        }

        log::info!(
            "Scheduler started with {} workers ({} rendering, {} resource, {} logging)",
            count,
            config.rendering_workers,
            config.resource_workers,
            config.logging_workers
        );

        Ok(Self {
            shared,
            worker_flags,
            workers: Mutex::new(workers),
        })
    }

    /// Queue a task any worker may run.
    pub fn schedule_task<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_task_with(WorkerFlags::empty(), task)
    }

    /// Queue a task for workers carrying one of `affinity`'s flags.
    pub fn schedule_task_with<F>(&self, affinity: WorkerFlags, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if !affinity.is_empty() && self.workers_with(affinity) == 0 {
            return Err(Error::NoEligibleWorker(format!("{:?}", affinity)));
        }

        let mut state = self.shared.state.lock();
        if state.shutdown {
            return Err(Error::SchedulerShutdown);
        }
        state.tasks.push_back(Task {
            affinity,
            job: Box::new(task),
        });
        state.outstanding += 1;
        drop(state);

        // Every sleeper re-checks; a single wakeup could land on a worker
        // that may not take this task
        self.shared.task_available.notify_all();
        Ok(())
    }

    /// Block until every task scheduled so far has finished.
    ///
    /// Must not be called from inside a task.
    pub fn wait_for_queued_tasks(&self) {
        let mut state = self.shared.state.lock();
        while state.outstanding > 0 {
            self.shared.all_done.wait(&mut state);
        }
    }

    /// Let the queue drain, then join every worker. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.shutdown && self.workers.lock().is_empty() {
                return;
            }
            state.shutdown = true;
        }
        self.shared.task_available.notify_all();

        let workers: Vec<Worker> = std::mem::take(&mut *self.workers.lock());
        let count = workers.len();
        for mut worker in workers {
            if !worker.join() {
                log::warn!("Worker {:?} did not exit cleanly", worker.label());
            }
        }
        log::info!("Scheduler shut down ({} workers joined)", count);
    }

    pub fn worker_count(&self) -> usize {
        self.worker_flags.len()
    }

    /// Workers carrying at least one of `flags`.
    pub fn workers_with(&self, flags: WorkerFlags) -> usize {
        self.worker_flags
            .iter()
            .filter(|worker| worker.intersects(flags))
            .count()
    }

    /// Workers that are running and not in the middle of a task.
    pub fn available_workers(&self) -> usize {
        self.workers
            .lock()
            .iter()
            .filter(|worker| worker.is_available())
            .count()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_main(shared: &Shared, flags: WorkerFlags, status: &WorkerStatus) {
    loop {
        let task = {
            let mut state = shared.state.lock();
            loop {
                if let Some(task) = state.take_for(flags) {
                    break task;
                }
                if state.shutdown {
                    return;
                }
                shared.task_available.wait(&mut state);
            }
        };

        status.set_busy(true);
        // A panicking task must still count as finished or the barrier hangs
        if panic::catch_unwind(AssertUnwindSafe(task.job)).is_err() {
            log::error!(
                "Task with affinity {:?} panicked on {:?}",
                task.affinity,
                std::thread::current().name()
            );
        }
        status.set_busy(false);

        let mut state = shared.state.lock();
        state.outstanding -= 1;
        if state.outstanding == 0 {
            shared.all_done.notify_all();
        }
    }
}

fn flag_suffix(flags: WorkerFlags) -> &'static str {
    if flags.contains(WorkerFlags::RENDERING) {
        "-rendering"
    } else if flags.contains(WorkerFlags::RESOURCE) {
        "-resource"
    } else if flags.contains(WorkerFlags::LOGGING) {
        "-logging"
    } else {
        ""
    }
}
