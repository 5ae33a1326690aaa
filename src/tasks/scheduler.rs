//! Fixed-size worker pool with dependency gating.
//!
//! Workers execute `start` + `run`. Tasks that must be ended on the owning
//! thread are handed back through a completion queue that
//! [`Scheduler::update`] drains; tasks flagged `no_finish` are ended on the
//! worker so their dependents are released without waiting for the owner.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use super::task::{Begin, Gate, Schedulable, Task, TaskError, TaskHandle, TaskStatus};

/// Errors that can occur while creating the worker pool.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Scheduler needs at least one worker")]
    NoWorkers,
    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// A task paired with the generation it had when it was submitted.
type Submission = (Arc<dyn Schedulable>, u64);

enum WorkerMessage {
    Run(Submission),
    Shutdown,
}

struct Shared {
    jobs: Sender<WorkerMessage>,
    completed: Sender<Arc<dyn Schedulable>>,
    waiting: Mutex<Vec<Submission>>,
    in_flight: AtomicUsize,
}

impl Shared {
    fn dispatch(&self, submission: Submission) {
        if self.jobs.send(WorkerMessage::Run(submission)).is_err() {
            log::error!("Worker pool is gone, dropping task");
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Dispatch every waiting task whose dependency resolved and cancel the
    /// ones whose strict dependency can never succeed. Repeats until stable
    /// since a cancellation can resolve other dependencies.
    fn release_waiting(&self) {
        loop {
            let mut ready = Vec::new();
            let mut changed = false;
            {
                let mut waiting = self.waiting.lock();
                let mut i = 0;
                while i < waiting.len() {
                    let (task, generation) = &waiting[i];
                    let control = task.control();
                    if control.generation() != *generation
                        || control.status() != TaskStatus::Waiting
                    {
                        // Cancelled, and possibly reset, by its owner while parked.
                        waiting.swap_remove(i);
                        self.in_flight.fetch_sub(1, Ordering::AcqRel);
                        changed = true;
                        continue;
                    }
                    match control.gate() {
                        Gate::Pending => i += 1,
                        Gate::Ready => ready.push(waiting.swap_remove(i)),
                        Gate::Blocked => {
                            let (task, generation) = waiting.swap_remove(i);
                            log::debug!(
                                "Cancelling '{}', its dependency stopped without success",
                                task.name()
                            );
                            task.control().cancel_waiting(generation);
                            self.in_flight.fetch_sub(1, Ordering::AcqRel);
                            changed = true;
                        }
                    }
                }
            }

            for submission in ready {
                self.dispatch(submission);
            }

            if !changed {
                break;
            }
        }
    }
}

/// Worker pool that runs tasks off the owning thread.
pub struct Scheduler {
    shared: Arc<Shared>,
    completed: Receiver<Arc<dyn Schedulable>>,
    workers: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Spawn `workers` threads.
    pub fn new(workers: usize) -> Result<Self, SchedulerError> {
        if workers == 0 {
            return Err(SchedulerError::NoWorkers);
        }

        let (jobs_tx, jobs_rx) = unbounded();
        let (completed_tx, completed_rx) = unbounded();
        let shared = Arc::new(Shared {
            jobs: jobs_tx,
            completed: completed_tx,
            waiting: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
        });

        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let rx = jobs_rx.clone();
            let shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("fourier-worker-{}", i))
                .spawn(move || worker_loop(rx, shared))?;
            handles.push(handle);
        }
        log::debug!("Spawned {} scheduler workers", workers);

        Ok(Self {
            shared,
            completed: completed_rx,
            workers: handles,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Number of submitted tasks that have not reached a terminal state.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight() == 0
    }

    /// Submit a task for immediate dispatch.
    pub fn run<T: Task>(&self, task: &TaskHandle<T>) -> Result<(), TaskError> {
        Self::check_submittable(task)?;
        self.shared.in_flight.fetch_add(1, Ordering::AcqRel);
        self.shared
            .dispatch((task.schedulable(), task.control().generation()));
        Ok(())
    }

    /// Submit a task that waits on the dependency declared with
    /// [`TaskHandle::wait_on`]. Without a dependency this is [`Scheduler::run`].
    pub fn add_waiting<T: Task>(&self, task: &TaskHandle<T>) -> Result<(), TaskError> {
        if !task.control().has_dependency() {
            return self.run(task);
        }
        Self::check_submittable(task)?;
        task.control().set_status(TaskStatus::Waiting);
        self.shared.in_flight.fetch_add(1, Ordering::AcqRel);
        self.shared
            .waiting
            .lock()
            .push((task.schedulable(), task.control().generation()));
        self.shared.release_waiting();
        Ok(())
    }

    /// Finish tasks handed back by the workers. Must be called from the
    /// thread that owns the resources the tasks publish to.
    pub fn update(&self) {
        while let Ok(task) = self.completed.try_recv() {
            self.finish(task);
        }
        self.shared.release_waiting();
    }

    /// Pump [`Scheduler::update`] until nothing is in flight or `timeout`
    /// expires. Returns true when idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.update();
            if self.is_idle() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let slice = (deadline - now).min(Duration::from_millis(1));
            match self.completed.recv_timeout(slice) {
                Ok(task) => self.finish(task),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return self.is_idle(),
            }
        }
    }

    fn finish(&self, task: Arc<dyn Schedulable>) {
        if let Err(err) = task.end() {
            log::error!("Failed to end task '{}': {}", task.name(), err);
        }
        self.shared.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    fn check_submittable<T: Task>(task: &TaskHandle<T>) -> Result<(), TaskError> {
        match task.status() {
            TaskStatus::Created => Ok(()),
            status => Err(TaskError::NotSubmittable {
                name: task.name(),
                status,
            }),
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for _ in 0..self.workers.len() {
            let _ = self.shared.jobs.send(WorkerMessage::Shutdown);
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                log::error!("Scheduler worker panicked during shutdown");
            }
        }
        log::debug!("Scheduler workers stopped");
    }
}

fn worker_loop(jobs: Receiver<WorkerMessage>, shared: Arc<Shared>) {
    while let Ok(message) = jobs.recv() {
        let (task, generation) = match message {
            WorkerMessage::Run(submission) => submission,
            WorkerMessage::Shutdown => break,
        };

        let started = match task.begin(generation) {
            Begin::Started => true,
            Begin::Stale => {
                log::debug!("Dropping stale submission of '{}'", task.name());
                false
            }
            Begin::Cancelled | Begin::NotStartable(TaskStatus::Cancelled) => false,
            Begin::NotStartable(status) => {
                log::error!("Task '{}' can not start from {:?}", task.name(), status);
                false
            }
        };
        if !started {
            shared.in_flight.fetch_sub(1, Ordering::AcqRel);
            shared.release_waiting();
            continue;
        }

        match task.run() {
            TaskStatus::Ran if task.control().no_finish() => {
                if let Err(err) = task.end() {
                    log::error!("Failed to end task '{}': {}", task.name(), err);
                }
                shared.in_flight.fetch_sub(1, Ordering::AcqRel);
            }
            TaskStatus::Ran => {
                if shared.completed.send(task).is_err() {
                    shared.in_flight.fetch_sub(1, Ordering::AcqRel);
                }
            }
            _ => {
                shared.in_flight.fetch_sub(1, Ordering::AcqRel);
            }
        }

        shared.release_waiting();
    }
}
