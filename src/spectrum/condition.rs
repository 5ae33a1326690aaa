//! Spectrum initialization contract and the task that runs it.

use std::sync::Arc;

use parking_lot::Mutex;

use super::fourier::{Cell, Packing, READ};
use super::slot::SlotStorage;
use crate::tasks::{CancelToken, RunContext, Task, TaskError};

/// Errors reported by a spectrum condition.
#[derive(Debug, thiserror::Error)]
pub enum SpectrumError {
    #[error("Condition was built for size {expected} but the buffer has size {got}")]
    SizeMismatch { expected: usize, got: usize },
    #[error("Condition has no data for slot {0}")]
    UnknownSlot(usize),
    #[error("Grid count must be between 1 and 4, got {0}")]
    InvalidGridCount(usize),
    #[error("Spectrum initialization failed: {0}")]
    Failed(String),
}

/// Produces the frequency-domain data for one frame.
///
/// Implementations are shared with a worker thread while the init task runs,
/// so they must be `Send + Sync`.
pub trait SpectrumCondition: Send + Sync {
    /// Number of independent displacement grids this condition produces.
    fn num_grids(&self) -> usize;

    /// Packing of the data written for `slot`.
    fn packing(&self, _slot: usize) -> Packing {
        Packing::Double
    }

    /// Write the spectrum for `slot` at `time` into `out` (`size * size` cells).
    fn initialize(
        &self,
        slot: usize,
        time: f32,
        size: usize,
        out: &mut [Cell],
    ) -> Result<(), SpectrumError>;
}

/// Task that fills every enabled slot with its spectrum before the Fourier
/// tasks run.
pub struct InitSpectrumTask {
    condition: Arc<dyn SpectrumCondition>,
    slots: Vec<(usize, Arc<Mutex<SlotStorage>>)>,
    size: usize,
    time: f32,
}

impl InitSpectrumTask {
    pub fn new(
        condition: Arc<dyn SpectrumCondition>,
        slots: Vec<(usize, Arc<Mutex<SlotStorage>>)>,
        size: usize,
        time: f32,
    ) -> Self {
        Self {
            condition,
            slots,
            size,
            time,
        }
    }

    /// Reconfigure a pooled task for the next frame.
    pub fn prepare(
        &mut self,
        condition: Arc<dyn SpectrumCondition>,
        slots: Vec<(usize, Arc<Mutex<SlotStorage>>)>,
        time: f32,
    ) {
        self.condition = condition;
        self.slots = slots;
        self.time = time;
    }

    pub fn num_grids(&self) -> usize {
        self.condition.num_grids()
    }

    pub fn time(&self) -> f32 {
        self.time
    }
}

impl Task for InitSpectrumTask {
    fn name(&self) -> &str {
        "init-spectrum"
    }

    fn run(&mut self, ctx: &RunContext<'_>) -> Result<(), TaskError> {
        for (index, storage) in &self.slots {
            if ctx.is_cancelled() {
                return Err(TaskError::Cancelled);
            }
            let mut storage = storage.lock();
            storage.packing = self.condition.packing(*index);
            self.condition
                .initialize(*index, self.time, self.size, &mut storage.data[READ])
                .map_err(TaskError::work)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::{TaskHandle, TaskStatus};

    struct Fill(f32);

    impl SpectrumCondition for Fill {
        fn num_grids(&self) -> usize {
            2
        }

        fn packing(&self, slot: usize) -> Packing {
            if slot == 0 {
                Packing::Single
            } else {
                Packing::Double
            }
        }

        fn initialize(
            &self,
            slot: usize,
            time: f32,
            _size: usize,
            out: &mut [Cell],
        ) -> Result<(), SpectrumError> {
            if slot > 1 {
                return Err(SpectrumError::UnknownSlot(slot));
            }
            out.fill([self.0 + time, slot as f32, 0.0, 0.0]);
            Ok(())
        }
    }

    fn storage(size: usize) -> Arc<Mutex<SlotStorage>> {
        Arc::new(Mutex::new(SlotStorage::new(size)))
    }

    #[test]
    fn test_init_fills_read_role_of_each_slot() {
        let slots = vec![(0, storage(2)), (1, storage(2))];
        let task = TaskHandle::new(InitSpectrumTask::new(
            Arc::new(Fill(1.0)),
            slots.clone(),
            2,
            0.5,
        ));

        assert_eq!(task.execute().unwrap(), TaskStatus::Done);
        for (index, storage) in &slots {
            let storage = storage.lock();
            assert!(storage.data[READ]
                .iter()
                .all(|c| *c == [1.5, *index as f32, 0.0, 0.0]));
        }
        assert_eq!(slots[0].1.lock().packing, Packing::Single);
        assert_eq!(slots[1].1.lock().packing, Packing::Double);
    }

    #[test]
    fn test_condition_error_fails_task() {
        let task = TaskHandle::new(InitSpectrumTask::new(
            Arc::new(Fill(0.0)),
            vec![(2, storage(2))],
            2,
            0.0,
        ));

        assert_eq!(task.execute().unwrap(), TaskStatus::Failed);
        let error = task.control().error().unwrap();
        assert!(error.contains("slot 2"), "Unexpected error: {}", error);
    }
}
