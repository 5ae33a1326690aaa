//! Reusable, cancellable units of work.
//!
//! A task is created once and reset every frame instead of being reallocated.
//! Its lifecycle is tracked by a [`TaskControl`] shared between the owning
//! thread, the scheduler and the worker that runs it:
//!
//! ```text
//! Created ──start──▶ Running ──run──▶ Ran ──end──▶ Done
//!    │                  │
//!    ├──▶ Waiting ──────┘   (wait_on + Scheduler::add_waiting)
//!    └──────────────────────▶ Cancelled / Failed
//! ```

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    /// Freshly created or reset; may be submitted.
    Created,
    /// Registered with the scheduler, gated on a dependency.
    Waiting,
    /// `start()` has been called and the work is executing.
    Running,
    /// The work finished; `end()` has not been called yet.
    Ran,
    /// `end()` has completed.
    Done,
    /// Stopped before reaching `Done`.
    Cancelled,
    /// The work returned an error or panicked.
    Failed,
}

impl TaskStatus {
    /// Terminal states: the task will not make further progress until reset.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Cancelled | TaskStatus::Failed)
    }

    /// In flight: submitted and not yet terminal.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            TaskStatus::Waiting | TaskStatus::Running | TaskStatus::Ran
        )
    }

    /// The work is no longer executing, whatever the outcome.
    pub fn has_stopped_running(self) -> bool {
        matches!(
            self,
            TaskStatus::Ran | TaskStatus::Done | TaskStatus::Cancelled | TaskStatus::Failed
        )
    }

    /// The work completed without cancellation or failure.
    pub fn succeeded(self) -> bool {
        matches!(self, TaskStatus::Ran | TaskStatus::Done)
    }
}

/// Errors raised by task lifecycle operations and task work.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task '{name}' can not start from state {status:?}")]
    NotStartable { name: String, status: TaskStatus },
    #[error("Task '{name}' can not be submitted from state {status:?}, reset it first")]
    NotSubmittable { name: String, status: TaskStatus },
    #[error("Task '{name}' can not be reset while {status:?}")]
    ResetWhileActive { name: String, status: TaskStatus },
    #[error("Task '{name}' has no work to end in state {status:?}")]
    NotEndable { name: String, status: TaskStatus },
    #[error("Task '{name}' panicked: {message}")]
    Panicked { name: String, message: String },
    /// Returned by work that observed cancellation and stopped without
    /// committing anything.
    #[error("Task was cancelled")]
    Cancelled,
    #[error(transparent)]
    Work(Box<dyn std::error::Error + Send + Sync>),
}

impl TaskError {
    /// Wrap an error produced by task work.
    pub fn work<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        TaskError::Work(Box::new(err))
    }
}

/// Cooperative cancellation signal polled by long running work.
pub trait CancelToken {
    fn is_cancelled(&self) -> bool;
}

impl CancelToken for AtomicBool {
    fn is_cancelled(&self) -> bool {
        self.load(Ordering::Acquire)
    }
}

/// A token that is never cancelled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverCancel;

impl CancelToken for NeverCancel {
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// The unit of work a [`TaskHandle`] drives.
///
/// `run` executes on a worker in multithreaded mode. `end` always executes on
/// the thread that owns the scheduler (or inline in synchronous mode), which
/// makes it the place to publish results to single-writer resources.
pub trait Task: Send + 'static {
    fn name(&self) -> &str;

    fn start(&mut self) {}

    fn run(&mut self, ctx: &RunContext<'_>) -> Result<(), TaskError>;

    fn end(&mut self) {}
}

/// What a running task can see about itself.
pub struct RunContext<'a> {
    control: &'a TaskControl,
    dependency: Option<TaskStatus>,
}

impl RunContext<'_> {
    /// Status of the task this one waited on, if any, at the moment it started.
    pub fn dependency_status(&self) -> Option<TaskStatus> {
        self.dependency
    }

    /// True when there is no dependency or the dependency completed its work.
    pub fn dependency_succeeded(&self) -> bool {
        self.dependency.map_or(true, TaskStatus::succeeded)
    }
}

#[cfg(test)]
impl<'a> RunContext<'a> {
    pub(crate) fn new(control: &'a TaskControl, dependency: Option<TaskStatus>) -> Self {
        Self {
            control,
            dependency,
        }
    }
}

impl CancelToken for RunContext<'_> {
    fn is_cancelled(&self) -> bool {
        self.control.is_cancelled()
    }
}

/// Result of gating a task on its dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Gate {
    Pending,
    Ready,
    Blocked,
}

/// Shared lifecycle state of a task.
pub struct TaskControl {
    status: Mutex<TaskStatus>,
    cancelled: AtomicBool,
    run_on_stop_waiting: AtomicBool,
    no_finish: AtomicBool,
    generation: AtomicU64,
    dependency: Mutex<Option<Arc<dyn Schedulable>>>,
    error: Mutex<Option<String>>,
}

impl TaskControl {
    fn new() -> Self {
        Self {
            status: Mutex::new(TaskStatus::Created),
            cancelled: AtomicBool::new(false),
            run_on_stop_waiting: AtomicBool::new(false),
            no_finish: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            dependency: Mutex::new(None),
            error: Mutex::new(None),
        }
    }

    pub fn status(&self) -> TaskStatus {
        *self.status.lock()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn run_on_stop_waiting(&self) -> bool {
        self.run_on_stop_waiting.load(Ordering::Acquire)
    }

    pub fn no_finish(&self) -> bool {
        self.no_finish.load(Ordering::Acquire)
    }

    /// Bumped on every reset. Submissions made before a reset are stale.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Message of the failure that stopped this task, if any.
    pub fn error(&self) -> Option<String> {
        self.error.lock().clone()
    }

    pub(crate) fn set_status(&self, status: TaskStatus) {
        *self.status.lock() = status;
    }

    /// Move from `from` to `to` only if the task is currently in `from`.
    pub(crate) fn transition(&self, from: TaskStatus, to: TaskStatus) -> bool {
        let mut status = self.status.lock();
        if *status == from {
            *status = to;
            true
        } else {
            false
        }
    }

    /// Cancel a parked submission unless the task was reset since.
    pub(crate) fn cancel_waiting(&self, generation: u64) -> bool {
        let mut status = self.status.lock();
        if self.generation() == generation && *status == TaskStatus::Waiting {
            *status = TaskStatus::Cancelled;
            true
        } else {
            false
        }
    }

    pub(crate) fn has_dependency(&self) -> bool {
        self.dependency.lock().is_some()
    }

    pub(crate) fn dependency_status(&self) -> Option<TaskStatus> {
        self.dependency
            .lock()
            .as_ref()
            .map(|dep| dep.control().status())
    }

    pub(crate) fn gate(&self) -> Gate {
        match self.dependency_status() {
            None => Gate::Ready,
            Some(TaskStatus::Done) => Gate::Ready,
            Some(status) if self.run_on_stop_waiting() && status.has_stopped_running() => {
                Gate::Ready
            }
            Some(status) if status.is_terminal() => Gate::Blocked,
            Some(_) => Gate::Pending,
        }
    }

    fn fail(&self, message: String) {
        *self.error.lock() = Some(message);
        self.set_status(TaskStatus::Failed);
    }
}

/// Outcome of trying to start a task for a given submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Begin {
    Started,
    /// The task was reset after this submission was made.
    Stale,
    Cancelled,
    NotStartable(TaskStatus),
}

/// Object-safe view of a task used by the scheduler.
pub(crate) trait Schedulable: Send + Sync {
    fn name(&self) -> String;

    fn control(&self) -> &TaskControl;

    /// Move a `Created` or `Waiting` task to `Running`, provided it has not
    /// been reset since `generation` was read.
    fn begin(&self, generation: u64) -> Begin;

    fn run(&self) -> TaskStatus;

    fn end(&self) -> Result<(), TaskError>;
}

struct TaskCell<T> {
    control: TaskControl,
    work: Mutex<T>,
}

impl<T: Task> Schedulable for TaskCell<T> {
    fn name(&self) -> String {
        self.work.lock().name().to_string()
    }

    fn control(&self) -> &TaskControl {
        &self.control
    }

    fn begin(&self, generation: u64) -> Begin {
        let outcome = {
            let mut status = self.control.status.lock();
            if self.control.generation() != generation {
                return Begin::Stale;
            }
            match *status {
                TaskStatus::Created | TaskStatus::Waiting if self.control.is_cancelled() => {
                    *status = TaskStatus::Cancelled;
                    Begin::Cancelled
                }
                TaskStatus::Created | TaskStatus::Waiting => {
                    *status = TaskStatus::Running;
                    Begin::Started
                }
                other => Begin::NotStartable(other),
            }
        };
        if outcome == Begin::Started {
            self.work.lock().start();
        }
        outcome
    }

    /// Execute the work and record the outcome. Panics are contained here so
    /// a misbehaving task can not take a worker thread down with it.
    fn run(&self) -> TaskStatus {
        if self.control.status() != TaskStatus::Running {
            return self.control.status();
        }
        if self.control.is_cancelled() {
            self.control.set_status(TaskStatus::Cancelled);
            return TaskStatus::Cancelled;
        }

        let ctx = RunContext {
            control: &self.control,
            dependency: self.control.dependency_status(),
        };

        let mut work = self.work.lock();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| work.run(&ctx)));
        let name = work.name().to_string();
        drop(work);

        match outcome {
            // Work that completes is past the cancellation point.
            Ok(Ok(())) => {
                self.control.transition(TaskStatus::Running, TaskStatus::Ran);
            }
            Ok(Err(TaskError::Cancelled)) => {
                log::debug!("Task '{}' stopped on cancellation", name);
                self.control.set_status(TaskStatus::Cancelled);
            }
            Ok(Err(err)) => {
                log::error!("Task '{}' failed: {}", name, err);
                self.control.fail(err.to_string());
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                log::error!("Task '{}' panicked: {}", name, message);
                self.control.fail(
                    TaskError::Panicked {
                        name: name.clone(),
                        message,
                    }
                    .to_string(),
                );
            }
        }

        self.control.status()
    }

    fn end(&self) -> Result<(), TaskError> {
        match self.control.status() {
            TaskStatus::Ran => {
                self.work.lock().end();
                self.control.transition(TaskStatus::Ran, TaskStatus::Done);
                Ok(())
            }
            // Stopped tasks have nothing to publish.
            TaskStatus::Cancelled | TaskStatus::Failed => Ok(()),
            other => Err(TaskError::NotEndable {
                name: self.name(),
                status: other,
            }),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Owning handle to a pooled task.
///
/// Cloning the handle shares the same task.
pub struct TaskHandle<T> {
    cell: Arc<TaskCell<T>>,
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T: Task> TaskHandle<T> {
    pub fn new(work: T) -> Self {
        Self {
            cell: Arc::new(TaskCell {
                control: TaskControl::new(),
                work: Mutex::new(work),
            }),
        }
    }

    pub fn name(&self) -> String {
        self.cell.name()
    }

    pub fn control(&self) -> &TaskControl {
        &self.cell.control
    }

    pub fn status(&self) -> TaskStatus {
        self.cell.control.status()
    }

    pub fn is_done(&self) -> bool {
        self.status() == TaskStatus::Done
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cell.control.is_cancelled()
    }

    /// Lock the work for inspection or reconfiguration.
    ///
    /// Blocks while the task is running on a worker.
    pub fn work(&self) -> MutexGuard<'_, T> {
        self.cell.work.lock()
    }

    /// Declare that this task must not run before `other` has finished.
    pub fn wait_on<U: Task>(&self, other: &TaskHandle<U>) {
        let dep: Arc<dyn Schedulable> = other.cell.clone();
        *self.cell.control.dependency.lock() = Some(dep);
    }

    /// Proceed once the dependency stops for any reason instead of only
    /// after it completes successfully.
    pub fn set_run_on_stop_waiting(&self, relaxed: bool) {
        self.cell
            .control
            .run_on_stop_waiting
            .store(relaxed, Ordering::Release);
    }

    /// End the task on the worker as soon as its work completes instead of
    /// handing it back to the owning thread.
    pub fn set_no_finish(&self, no_finish: bool) {
        self.cell.control.no_finish.store(no_finish, Ordering::Release);
    }

    /// Request cancellation. Tasks that have not started stop immediately;
    /// running tasks observe the flag at their next poll. A task whose work
    /// already completed (`Ran`) still ends and publishes.
    pub fn cancel(&self) {
        let control = &self.cell.control;
        control.cancelled.store(true, Ordering::Release);
        let mut status = control.status.lock();
        if matches!(*status, TaskStatus::Created | TaskStatus::Waiting) {
            *status = TaskStatus::Cancelled;
        }
    }

    /// Return the task to `Created` so it can be submitted again.
    pub fn reset(&self) -> Result<(), TaskError> {
        let control = &self.cell.control;
        {
            let mut status = control.status.lock();
            if !status.is_active() {
                control.generation.fetch_add(1, Ordering::AcqRel);
                *status = TaskStatus::Created;
            } else {
                let active = *status;
                drop(status);
                return Err(TaskError::ResetWhileActive {
                    name: self.name(),
                    status: active,
                });
            }
        }
        control.cancelled.store(false, Ordering::Release);
        control.run_on_stop_waiting.store(false, Ordering::Release);
        control.no_finish.store(false, Ordering::Release);
        *control.dependency.lock() = None;
        *control.error.lock() = None;
        Ok(())
    }

    pub fn start(&self) -> Result<(), TaskError> {
        let control = &self.cell.control;
        let status = match self.cell.begin(control.generation()) {
            Begin::Started => return Ok(()),
            Begin::Cancelled => TaskStatus::Cancelled,
            Begin::Stale => control.status(),
            Begin::NotStartable(status) => status,
        };
        Err(TaskError::NotStartable {
            name: self.name(),
            status,
        })
    }

    pub fn run(&self) -> TaskStatus {
        self.cell.run()
    }

    pub fn end(&self) -> Result<(), TaskError> {
        self.cell.end()
    }

    /// Run the whole lifecycle inline on the calling thread.
    ///
    /// A strict dependency that stopped without success cancels the task
    /// without running it.
    pub fn execute(&self) -> Result<TaskStatus, TaskError> {
        if self.cell.control.gate() == Gate::Blocked {
            self.cancel();
            return Ok(self.status());
        }
        if self.is_cancelled() {
            self.cell.control.set_status(TaskStatus::Cancelled);
            return Ok(TaskStatus::Cancelled);
        }
        self.start()?;
        self.run();
        self.end()?;
        Ok(self.status())
    }

    pub(crate) fn schedulable(&self) -> Arc<dyn Schedulable> {
        self.cell.clone()
    }
}
