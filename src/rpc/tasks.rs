//! Background task accounting.
//!
//! A [`TaskGroup`] counts outstanding background work (the send loop and every
//! dispatched inbound call). Shutdown first [`stop`](TaskGroup::stop)s the
//! group so nothing new starts, then [`wait`](TaskGroup::wait)s for the count
//! to drain. Waiting must happen with the connection lock released.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

#[derive(Debug, Default)]
struct TaskState {
    running: usize,
    stopped: bool,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<TaskState>,
    idle: Condvar,
}

/// Counter of in-flight background tasks.
#[derive(Debug, Clone, Default)]
pub(crate) struct TaskGroup {
    inner: Arc<Inner>,
}

/// Marks one running task. Dropping it ends the task.
#[derive(Debug)]
#[must_use = "dropping the guard ends the task immediately"]
pub(crate) struct TaskGuard {
    inner: Arc<Inner>,
}

impl TaskGroup {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Starts a task, unless the group is stopped.
    pub(crate) fn try_start(&self) -> Option<TaskGuard> {
        let mut state = self.inner.state.lock();
        if state.stopped {
            return None;
        }
        state.running += 1;
        Some(TaskGuard {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Refuses all further tasks.
    pub(crate) fn stop(&self) {
        self.inner.state.lock().stopped = true;
    }

    /// Blocks until every started task has ended.
    pub(crate) fn wait(&self) {
        let mut state = self.inner.state.lock();
        while state.running > 0 {
            self.inner.idle.wait(&mut state);
        }
    }

    pub(crate) fn running(&self) -> usize {
        self.inner.state.lock().running
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.running -= 1;
        if state.running == 0 {
            self.inner.idle.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn stop_refuses_new_tasks_and_wait_drains() {
        let group = TaskGroup::new();
        let a = group.try_start().expect("group open");
        let b = group.try_start().expect("group open");
        assert_eq!(group.running(), 2);
        group.stop();
        assert!(group.try_start().is_none());

        let waiter = {
            let group = group.clone();
            std::thread::spawn(move || group.wait())
        };
        drop(a);
        std::thread::sleep(Duration::from_millis(10));
        assert!(!waiter.is_finished());
        drop(b);
        waiter.join().expect("waiter panicked");
        assert_eq!(group.running(), 0);
    }
}
