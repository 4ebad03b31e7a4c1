//! Task runners bound to the control and I/O threads.
//!
//! Every cross-thread call in the custom-scheme subsystem is a posted task.
//! `ThreadTaskRunner` owns a real OS thread; `ManualTaskRunner` queues tasks
//! until the owner drains them, which lets tests interleave both sides.

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use pd_core::BrowserError;
use pd_core::BrowserResult;
use pd_core::ThreadRole;
use std::collections::VecDeque;
use std::thread;
use std::thread::JoinHandle;
use std::thread::ThreadId;

/// Unit of work posted to another thread.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Queue of tasks executed in posting order on one logical thread.
pub trait TaskRunner: Send + Sync {
    fn role(&self) -> ThreadRole;

    fn post_task(&self, task: Task) -> BrowserResult<()>;

    fn runs_tasks_on_current_thread(&self) -> bool;
}

/// Task runner backed by a dedicated, named OS thread.
pub struct ThreadTaskRunner {
    role: ThreadRole,
    sender: Mutex<Option<Sender<Task>>>,
    thread_id: ThreadId,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadTaskRunner {
    pub fn spawn(role: ThreadRole) -> BrowserResult<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded::<Task>();
        let join = thread::Builder::new()
            .name(role.thread_name())
            .spawn(move || {
                for task in receiver.iter() {
                    task();
                }
            })
            .map_err(|error| {
                BrowserError::new(
                    "ipc.thread_spawn_failed",
                    format!("failed to spawn {} thread: {error}", role.as_str()),
                )
            })?;

        Ok(Self {
            role,
            thread_id: join.thread().id(),
            sender: Mutex::new(Some(sender)),
            join: Mutex::new(Some(join)),
        })
    }

    /// Stops accepting tasks, lets queued ones finish, and joins the thread.
    pub fn shutdown(&self) -> BrowserResult<()> {
        self.sender.lock().take();

        if thread::current().id() == self.thread_id {
            return Ok(());
        }

        let join = self.join.lock().take();
        match join {
            Some(join) => join.join().map_err(|_| {
                BrowserError::new(
                    "ipc.thread_panicked",
                    format!("{} thread panicked before shutdown", self.role.as_str()),
                )
            }),
            None => Ok(()),
        }
    }
}

impl TaskRunner for ThreadTaskRunner {
    fn role(&self) -> ThreadRole {
        self.role
    }

    fn post_task(&self, task: Task) -> BrowserResult<()> {
        let sender = self.sender.lock();
        let sender = sender.as_ref().ok_or_else(|| {
            BrowserError::new(
                "ipc.runner_stopped",
                format!("{} task runner has been shut down", self.role.as_str()),
            )
        })?;

        sender.send(task).map_err(|_| {
            BrowserError::new(
                "ipc.runner_stopped",
                format!("{} thread is no longer receiving tasks", self.role.as_str()),
            )
        })
    }

    fn runs_tasks_on_current_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }
}

impl Drop for ThreadTaskRunner {
    fn drop(&mut self) {
        self.sender.get_mut().take();
    }
}

/// Task runner drained explicitly by its owner.
pub struct ManualTaskRunner {
    role: ThreadRole,
    queue: Mutex<VecDeque<Task>>,
}

impl ManualTaskRunner {
    pub fn new(role: ThreadRole) -> Self {
        Self {
            role,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Runs queued tasks, including ones posted while draining.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0_usize;
        loop {
            // The lock is released before the task runs so tasks may post.
            let next = self.queue.lock().pop_front();
            match next {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }
}

impl TaskRunner for ManualTaskRunner {
    fn role(&self) -> ThreadRole {
        self.role
    }

    fn post_task(&self, task: Task) -> BrowserResult<()> {
        self.queue.lock().push_back(task);
        Ok(())
    }

    fn runs_tasks_on_current_thread(&self) -> bool {
        true
    }
}

/// Drains several manual runners until none of them has work left.
pub fn drain_until_idle(runners: &[&ManualTaskRunner]) -> usize {
    let mut total = 0_usize;
    loop {
        let ran: usize = runners.iter().map(|runner| runner.run_until_idle()).sum();
        if ran == 0 {
            return total;
        }
        total += ran;
    }
}
