//! Displacement buffer orchestration.
//!
//! [`DisplacementBufferCpu`] owns the slots, the pooled init and Fourier tasks
//! and the displacement channels, and drives one frame at a time either inline
//! or through a [`Scheduler`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};

use super::condition::{InitSpectrumTask, SpectrumCondition};
use super::displacements::DisplacementChannels;
use super::fourier::{Cell, FourierCpu, FourierError, READ, WRITE};
use super::fourier_task::FourierTask;
use super::slot::{BufferSlot, SlotStorage};
use super::surface::{ImageSurface, SurfaceHandle};
use crate::tasks::{Scheduler, TaskError, TaskHandle, TaskStatus};

/// Most slots a displacement buffer can hold: heights plus two pairs of
/// horizontal displacements.
pub const MAX_BUFFERS: usize = 3;

/// Errors raised while driving a spectrum buffer.
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("Buffer count must be between 1 and {max}, got {got}")]
    InvalidBufferCount { got: usize, max: usize },
    #[error("Can not run while tasks from the previous run are still pending")]
    TasksPending,
    #[error("Task '{0}' reports done right after being reset")]
    TaskAlreadyDone(String),
    #[error("Spectrum initialization failed: {0}")]
    InitFailed(String),
    #[error("Fourier task for slot {slot} failed: {message}")]
    TaskFailed { slot: usize, message: String },
    #[error("Task error: {0}")]
    Task(#[from] TaskError),
    #[error("Fourier error: {0}")]
    Fourier(#[from] FourierError),
}

/// How a buffer executes its tasks.
#[derive(Clone)]
pub enum ExecutionMode {
    /// Run every task inline on the calling thread, producer first.
    Synchronous,
    /// Dispatch to a worker pool. The owning thread must pump the scheduler.
    Scheduled(Arc<Scheduler>),
}

impl ExecutionMode {
    pub fn is_multithreaded(&self) -> bool {
        matches!(self, ExecutionMode::Scheduled(_))
    }
}

impl std::fmt::Debug for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Synchronous => write!(f, "Synchronous"),
            ExecutionMode::Scheduled(scheduler) => {
                write!(f, "Scheduled({} workers)", scheduler.worker_count())
            }
        }
    }
}

/// Which slots an enable/disable call applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotSelector {
    All,
    Index(usize),
}

impl From<usize> for SlotSelector {
    fn from(index: usize) -> Self {
        SlotSelector::Index(index)
    }
}

/// Common interface of CPU spectrum buffers.
pub trait SpectrumBuffer {
    /// Start a frame for `condition` at `time`.
    fn run(
        &mut self,
        condition: Arc<dyn SpectrumCondition>,
        time: f32,
    ) -> Result<(), BufferError>;

    /// True when no task issued by the last run is still in flight.
    fn is_done(&self) -> bool;

    /// Finish tasks handed back by the workers. No-op in synchronous mode.
    fn update(&self);

    /// Request cancellation of every task of the current run.
    fn cancel(&self);

    fn size(&self) -> usize;

    fn num_buffers(&self) -> usize;

    fn enabled_buffer_count(&self) -> usize;

    fn is_enabled_buffer(&self, index: usize) -> bool;

    fn enable_buffer(&mut self, selector: SlotSelector);

    fn disable_buffer(&mut self, selector: SlotSelector);

    /// Output surface of a slot, or the shared blank surface.
    fn texture(&self, index: usize) -> SurfaceHandle;

    fn time(&self) -> f32;

    fn has_run(&self) -> bool;

    fn been_sampled(&self) -> bool;

    fn mark_sampled(&mut self);
}

/// CPU buffer that turns a wave spectrum into displacement channels.
pub struct DisplacementBufferCpu {
    size: usize,
    fourier: Arc<FourierCpu>,
    slots: Vec<BufferSlot>,
    tasks: Vec<Option<TaskHandle<FourierTask>>>,
    init: Option<TaskHandle<InitSpectrumTask>>,
    displacements: Arc<Mutex<DisplacementChannels>>,
    blank: SurfaceHandle,
    mode: ExecutionMode,
    time: f32,
    has_run: bool,
    been_sampled: bool,
}

impl DisplacementBufferCpu {
    /// Create `num_buffers` slots of `size` x `size` cells.
    pub fn new(size: usize, num_buffers: usize, mode: ExecutionMode) -> Result<Self, BufferError> {
        if num_buffers == 0 || num_buffers > MAX_BUFFERS {
            return Err(BufferError::InvalidBufferCount {
                got: num_buffers,
                max: MAX_BUFFERS,
            });
        }
        let fourier = Arc::new(FourierCpu::new(size)?);

        Ok(Self {
            size,
            fourier,
            slots: (0..num_buffers).map(|_| BufferSlot::new(size)).collect(),
            tasks: (0..num_buffers).map(|_| None).collect(),
            init: None,
            displacements: Arc::new(Mutex::new(DisplacementChannels::new(size))),
            blank: ImageSurface::blank().shared(),
            mode,
            time: 0.0,
            has_run: false,
            been_sampled: false,
        })
    }

    pub fn mode(&self) -> &ExecutionMode {
        &self.mode
    }

    /// Grid count of the last run.
    pub fn num_grids(&self) -> usize {
        self.displacements.lock().num_grids()
    }

    /// Lock the displacement channels.
    ///
    /// Blocks while a Fourier task is redistributing into them.
    pub fn displacements(&self) -> MutexGuard<'_, DisplacementChannels> {
        self.displacements.lock()
    }

    /// Status of the Fourier task of a slot, if one was ever created.
    pub fn task_status(&self, index: usize) -> Option<TaskStatus> {
        self.tasks.get(index)?.as_ref().map(TaskHandle::status)
    }

    /// Status of the init task, if a run has been issued.
    pub fn init_status(&self) -> Option<TaskStatus> {
        self.init.as_ref().map(TaskHandle::status)
    }

    /// The storage array the FFT output is left in for slot `index`.
    ///
    /// Returns `None` for disabled or out-of-range slots. Blocks while the
    /// slot's task is running. The guard holds the slot's storage lock, and
    /// ending a Fourier task takes the same lock, so drop it before calling
    /// [`SpectrumBuffer::update`] or [`DisplacementBufferCpu::wait`] on this
    /// thread. Use [`DisplacementBufferCpu::read_buffer_copy`] to keep the
    /// data across those calls.
    pub fn read_buffer(&self, index: usize) -> Option<MappedMutexGuard<'_, [Cell]>> {
        self.storage_role(index, READ)
    }

    /// Copy of [`DisplacementBufferCpu::read_buffer`] that releases the
    /// storage lock before returning.
    pub fn read_buffer_copy(&self, index: usize) -> Option<Vec<Cell>> {
        self.read_buffer(index).map(|cells| cells.to_vec())
    }

    /// The scratch array of slot `index`, with the same rules as
    /// [`DisplacementBufferCpu::read_buffer`].
    pub fn write_buffer(&self, index: usize) -> Option<MappedMutexGuard<'_, [Cell]>> {
        self.storage_role(index, WRITE)
    }

    fn storage_role(&self, index: usize, role: usize) -> Option<MappedMutexGuard<'_, [Cell]>> {
        let slot = self.slots.get(index).filter(|slot| slot.is_enabled())?;
        Some(MutexGuard::map(slot.storage.lock(), |storage| {
            storage.data[role].as_mut_slice()
        }))
    }

    /// Check the outcome of the last finished run.
    ///
    /// Returns the first failure: a failed init task, then failed Fourier
    /// tasks in slot order.
    pub fn frame_result(&self) -> Result<(), BufferError> {
        if !self.is_done() {
            return Err(BufferError::TasksPending);
        }
        if let Some(init) = &self.init {
            if init.status() == TaskStatus::Failed {
                return Err(BufferError::InitFailed(
                    init.control().error().unwrap_or_default(),
                ));
            }
        }
        for (slot, task) in self.tasks.iter().enumerate() {
            let Some(task) = task else { continue };
            if task.status() == TaskStatus::Failed {
                return Err(BufferError::TaskFailed {
                    slot,
                    message: task.control().error().unwrap_or_default(),
                });
            }
        }
        Ok(())
    }

    /// Pump until the run completes or `timeout` expires. Returns true when
    /// done.
    pub fn wait(&self, timeout: Duration) -> bool {
        let scheduler = match &self.mode {
            ExecutionMode::Synchronous => return self.is_done(),
            ExecutionMode::Scheduled(scheduler) => scheduler,
        };
        let deadline = Instant::now() + timeout;
        loop {
            scheduler.update();
            if self.is_done() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            scheduler.wait_idle((deadline - now).min(Duration::from_millis(1)));
        }
    }

    fn prepare_init(
        &mut self,
        condition: Arc<dyn SpectrumCondition>,
        slots: Vec<(usize, Arc<Mutex<SlotStorage>>)>,
        time: f32,
    ) -> Result<TaskHandle<InitSpectrumTask>, BufferError> {
        let task = match self.init.clone() {
            Some(task) => {
                task.reset()?;
                task.work().prepare(condition, slots, time);
                task
            }
            None => {
                let task = TaskHandle::new(InitSpectrumTask::new(condition, slots, self.size, time));
                self.init = Some(task.clone());
                task
            }
        };
        if task.is_done() {
            return Err(BufferError::TaskAlreadyDone(task.name()));
        }
        Ok(task)
    }

    fn prepare_fourier(
        &mut self,
        index: usize,
        num_grids: usize,
    ) -> Result<TaskHandle<FourierTask>, BufferError> {
        let task = match self.tasks[index].clone() {
            Some(task) => {
                task.reset()?;
                task.work().prepare(num_grids);
                task
            }
            None => {
                let slot = &self.slots[index];
                let task = TaskHandle::new(FourierTask::new(
                    index,
                    num_grids,
                    Arc::clone(&self.fourier),
                    Arc::clone(&slot.storage),
                    Arc::clone(&slot.map),
                    Arc::clone(&self.displacements),
                ));
                self.tasks[index] = Some(task.clone());
                task
            }
        };
        if task.is_done() {
            return Err(BufferError::TaskAlreadyDone(task.name()));
        }
        Ok(task)
    }
}

impl SpectrumBuffer for DisplacementBufferCpu {
    fn run(
        &mut self,
        condition: Arc<dyn SpectrumCondition>,
        time: f32,
    ) -> Result<(), BufferError> {
        if !self.is_done() {
            return Err(BufferError::TasksPending);
        }

        self.time = time;
        self.has_run = true;
        self.been_sampled = false;

        let enabled: Vec<usize> = (0..self.slots.len())
            .filter(|&i| self.slots[i].is_enabled())
            .collect();
        if enabled.is_empty() {
            return Ok(());
        }

        let num_grids = condition.num_grids();
        {
            let mut displacements = self.displacements.lock();
            displacements.clear();
            displacements.set_num_grids(num_grids);
        }

        // The init task is reset before any dependent is registered so a
        // dependent never sees last frame's Done.
        let storage = enabled
            .iter()
            .map(|&i| (i, Arc::clone(&self.slots[i].storage)))
            .collect();
        let init = self.prepare_init(condition, storage, time)?;

        let mut tasks = Vec::with_capacity(enabled.len());
        for &index in &enabled {
            let task = self.prepare_fourier(index, num_grids)?;
            task.wait_on(&init);
            task.set_run_on_stop_waiting(true);
            tasks.push(task);
        }

        match &self.mode {
            ExecutionMode::Synchronous => {
                init.execute()?;
                for task in &tasks {
                    task.execute()?;
                }
            }
            ExecutionMode::Scheduled(scheduler) => {
                for task in &tasks {
                    scheduler.add_waiting(task)?;
                }
                init.set_no_finish(true);
                scheduler.run(&init)?;
            }
        }

        log::debug!(
            "Issued run at t={} for {} slot(s), {} grid(s)",
            time,
            tasks.len(),
            num_grids
        );
        Ok(())
    }

    fn is_done(&self) -> bool {
        let init_done = self
            .init
            .as_ref()
            .map_or(true, |task| !task.status().is_active());
        init_done
            && self
                .tasks
                .iter()
                .flatten()
                .all(|task| !task.status().is_active())
    }

    fn update(&self) {
        if let ExecutionMode::Scheduled(scheduler) = &self.mode {
            scheduler.update();
        }
    }

    fn cancel(&self) {
        if let Some(init) = &self.init {
            init.cancel();
        }
        for task in self.tasks.iter().flatten() {
            task.cancel();
        }
        self.update();
    }

    fn size(&self) -> usize {
        self.size
    }

    fn num_buffers(&self) -> usize {
        self.slots.len()
    }

    fn enabled_buffer_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_enabled()).count()
    }

    fn is_enabled_buffer(&self, index: usize) -> bool {
        self.slots.get(index).is_some_and(BufferSlot::is_enabled)
    }

    fn enable_buffer(&mut self, selector: SlotSelector) {
        set_disabled(&mut self.slots, selector, false);
    }

    fn disable_buffer(&mut self, selector: SlotSelector) {
        set_disabled(&mut self.slots, selector, true);
    }

    fn texture(&self, index: usize) -> SurfaceHandle {
        match self.slots.get(index) {
            Some(slot) if slot.is_enabled() => Arc::clone(&slot.map),
            _ => Arc::clone(&self.blank),
        }
    }

    fn time(&self) -> f32 {
        self.time
    }

    fn has_run(&self) -> bool {
        self.has_run
    }

    fn been_sampled(&self) -> bool {
        self.been_sampled
    }

    fn mark_sampled(&mut self) {
        self.been_sampled = true;
    }
}

fn set_disabled(slots: &mut [BufferSlot], selector: SlotSelector, disabled: bool) {
    match selector {
        SlotSelector::All => {
            for slot in slots.iter_mut() {
                slot.disabled = disabled;
            }
            log::debug!("Set disabled={} on all {} slots", disabled, slots.len());
        }
        SlotSelector::Index(index) => {
            if let Some(slot) = slots.get_mut(index) {
                slot.disabled = disabled;
                log::debug!("Set disabled={} on slot {}", disabled, index);
            }
        }
    }
}
