// Worker - one OS thread and its lifetime
//
// No task logic lives here; the scheduler hands in the thread body.

use super::WorkerFlags;
use crate::error::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Shared between a worker and its thread body.
#[derive(Debug, Default)]
pub struct WorkerStatus {
    busy: AtomicBool,
}

impl WorkerStatus {
    pub fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::Release);
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

pub struct Worker {
    label: Option<String>,
    flags: WorkerFlags,
    status: Arc<WorkerStatus>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Start a thread running `body`. The thread is named after `label`.
    pub fn spawn<F>(label: Option<String>, flags: WorkerFlags, body: F) -> Result<Self>
    where
        F: FnOnce(&WorkerStatus) + Send + 'static,
    {
        let status = Arc::new(WorkerStatus::default());
        let thread_status = status.clone();

        let mut builder = thread::Builder::new();
        if let Some(label) = &label {
            builder = builder.name(label.clone());
        }
        let handle = builder.spawn(move || body(&thread_status)).map_err(|e| {
            log::error!("Failed to spawn worker {:?}: {}", label, e);
            e
        })?;

        Ok(Self {
            label,
            flags,
            status,
            handle: Some(handle),
        })
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    #[inline]
    pub fn flags(&self) -> WorkerFlags {
        self.flags
    }

    /// Running and not in the middle of a task.
    pub fn is_available(&self) -> bool {
        match &self.handle {
            Some(handle) => !handle.is_finished() && !self.status.is_busy(),
            None => false,
        }
    }

    /// Still owns its thread (neither joined nor detached).
    pub fn is_joinable(&self) -> bool {
        self.handle.is_some()
    }

    /// Wait for the thread to exit. Returns false if it panicked or was
    /// already joined or detached.
    pub fn join(&mut self) -> bool {
        let Some(handle) = self.handle.take() else {
            return false;
        };
        match handle.join() {
            Ok(()) => true,
            Err(_) => {
                log::error!("Worker {:?} panicked", self.label);
                false
            }
        }
    }

    /// Let the thread run on without an owner.
    pub fn detach(&mut self) {
        if self.handle.take().is_some() {
            log::debug!("Detached worker {:?}", self.label);
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if self.is_joinable() {
            self.join();
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("label", &self.label)
            .field("flags", &self.flags)
            .field("joinable", &self.is_joinable())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn thread_carries_the_label() {
        let (tx, rx) = mpsc::channel();
        let mut worker = Worker::spawn(Some("test-worker".into()), WorkerFlags::RENDERING, move |_| {
            tx.send(thread::current().name().map(str::to_owned)).unwrap();
        })
        .unwrap();

        assert_eq!(rx.recv().unwrap().as_deref(), Some("test-worker"));
        assert_eq!(worker.label(), Some("test-worker"));
        assert_eq!(worker.flags(), WorkerFlags::RENDERING);
        assert!(worker.join());
        assert!(!worker.is_joinable());
        assert!(!worker.join());
    }

    #[test]
    fn busy_worker_is_not_available() {
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel();
        let mut worker = Worker::spawn(None, WorkerFlags::empty(), move |status| {
            status.set_busy(true);
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            status.set_busy(false);
        })
        .unwrap();

        started_rx.recv().unwrap();
        assert!(!worker.is_available());
        release_tx.send(()).unwrap();
        assert!(worker.join());
        assert!(!worker.is_available());
    }

    #[test]
    fn join_reports_panics() {
        let mut worker = Worker::spawn(None, WorkerFlags::empty(), |_| panic!("boom")).unwrap();
        assert!(!worker.join());
    }

    #[test]
    fn detached_worker_is_not_joinable() {
        let mut worker = Worker::spawn(None, WorkerFlags::empty(), |_| {
            thread::sleep(Duration::from_millis(10));
        })
        .unwrap();
        worker.detach();
        assert!(!worker.is_joinable());
        assert!(!worker.join());
    }
}
