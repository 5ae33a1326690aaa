//! Per-slot Fourier task: transform one slot, then sort the results into the
//! displacement channels and the slot's output surface.
//!
//! The packing that suits the FFT is not the packing that suits sampling, so
//! after the transform each cell is unpacked into an RGBA result and routed:
//!
//! | grids | slot 0 (assign) | slot 1 (add)            | slot 2 (add)            |
//! |-------|-----------------|-------------------------|-------------------------|
//! | 1     | ch0.y = r       | ch0.x += r, ch0.z += g  |                         |
//! | 2     | ch0/1.y = r/g   | ch0 += (r, g), ch1 += (b, a) on x/z |             |
//! | 3     | ch0..3.y = rgba | ch0 += (r, g), ch1 += (b, a) on x/z | ch2 += (r, g) on x/z |
//! | 4     | ch0..3.y = rgba | ch0 += (r, g), ch1 += (b, a) on x/z | ch2 += (r, g), ch3 += (b, a) on x/z |
//!
//! Any other grid count zeroes the results and leaves the channels alone.

use std::sync::Arc;

use parking_lot::Mutex;

use super::displacements::{DisplacementChannels, CHANNELS};
use super::fourier::{Cell, FourierCpu, FourierError, Transform, READ, WRITE};
use super::slot::SlotStorage;
use super::surface::{Pixel, SurfaceHandle};
use crate::tasks::{CancelToken, RunContext, Task, TaskError};

/// One write from a result lane into a channel component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Route {
    channel: usize,
    component: usize,
    lane: usize,
    accumulate: bool,
}

const fn set(channel: usize, lane: usize) -> Route {
    Route {
        channel,
        component: 1,
        lane,
        accumulate: false,
    }
}

const fn add(channel: usize, component: usize, lane: usize) -> Route {
    Route {
        channel,
        component,
        lane,
        accumulate: true,
    }
}

const HEIGHT_1: &[Route] = &[set(0, 0)];
const HEIGHT_2: &[Route] = &[set(0, 0), set(1, 1)];
const HEIGHT_4: &[Route] = &[set(0, 0), set(1, 1), set(2, 2), set(3, 3)];
const CHOPPY_01_SINGLE: &[Route] = &[add(0, 0, 0), add(0, 2, 1)];
const CHOPPY_01: &[Route] = &[add(0, 0, 0), add(0, 2, 1), add(1, 0, 2), add(1, 2, 3)];
const CHOPPY_23_SINGLE: &[Route] = &[add(2, 0, 0), add(2, 2, 1)];
const CHOPPY_23: &[Route] = &[add(2, 0, 0), add(2, 2, 1), add(3, 0, 2), add(3, 2, 3)];

fn routes(index: usize, num_grids: usize) -> &'static [Route] {
    match (index, num_grids) {
        (0, 1) => HEIGHT_1,
        (0, 2) => HEIGHT_2,
        (0, 3 | 4) => HEIGHT_4,
        (1, 1) => CHOPPY_01_SINGLE,
        (1, 2..=4) => CHOPPY_01,
        (2, 3) => CHOPPY_23_SINGLE,
        (2, 4) => CHOPPY_23,
        _ => &[],
    }
}

/// Unpack a transformed cell into a result pixel for a grid count.
fn unpack(cell: &Cell, num_grids: usize) -> Pixel {
    match num_grids {
        1 => [cell[0], cell[1], 0.0, 0.0],
        2..=4 => *cell,
        _ => [0.0; 4],
    }
}

/// Repack transformed `data` into `results` and route it into `displacements`
/// according to the slot `index` and `num_grids`.
pub fn process_data(
    index: usize,
    num_grids: usize,
    results: &mut [Pixel],
    data: &[Cell],
    displacements: &mut DisplacementChannels,
) {
    let routes = routes(index, num_grids);

    for (j, (result, cell)) in results.iter_mut().zip(data).enumerate() {
        *result = unpack(cell, num_grids);

        let idx = j * CHANNELS;
        for route in routes {
            let Some(channel) = displacements.data_mut(route.channel) else {
                continue;
            };
            let Some(target) = channel.get_mut(idx + route.component) else {
                continue;
            };
            let value = result[route.lane];
            if route.accumulate {
                *target += value;
            } else {
                *target = value;
            }
        }
    }
}

/// Runs the FFT over one slot and redistributes the output.
pub struct FourierTask {
    name: String,
    index: usize,
    num_grids: usize,
    fourier: Arc<FourierCpu>,
    storage: Arc<Mutex<SlotStorage>>,
    map: SurfaceHandle,
    displacements: Arc<Mutex<DisplacementChannels>>,
}

impl FourierTask {
    pub fn new(
        index: usize,
        num_grids: usize,
        fourier: Arc<FourierCpu>,
        storage: Arc<Mutex<SlotStorage>>,
        map: SurfaceHandle,
        displacements: Arc<Mutex<DisplacementChannels>>,
    ) -> Self {
        Self {
            name: format!("fourier-{}", index),
            index,
            num_grids,
            fourier,
            storage,
            map,
            displacements,
        }
    }

    /// Reconfigure a pooled task for the next frame.
    pub fn prepare(&mut self, num_grids: usize) {
        self.num_grids = num_grids;
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn num_grids(&self) -> usize {
        self.num_grids
    }
}

impl Task for FourierTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&mut self, ctx: &RunContext<'_>) -> Result<(), TaskError> {
        let mut storage = self.storage.lock();
        let SlotStorage {
            data,
            results,
            packing,
        } = &mut *storage;

        if !ctx.dependency_succeeded() {
            // The spectrum for this frame was never produced; publish zeros
            // rather than transforming last frame's output again.
            log::warn!(
                "Slot {} proceeding without spectrum data (init {:?}), publishing zeros",
                self.index,
                ctx.dependency_status()
            );
            results.fill([0.0; 4]);
            return Ok(());
        }

        let read = match self
            .fourier
            .transform(*packing, data, WRITE, ctx)
            .map_err(TaskError::work)?
        {
            Transform::Complete(read) => read,
            Transform::Cancelled => return Err(TaskError::Cancelled),
        };

        if read != READ {
            return Err(TaskError::work(FourierError::ReadIndexMismatch {
                expected: READ,
                actual: read,
            }));
        }

        let mut displacements = self.displacements.lock();
        // Last chance to stop before anything shared is written.
        if ctx.is_cancelled() {
            return Err(TaskError::Cancelled);
        }
        process_data(
            self.index,
            self.num_grids,
            results,
            &data[read],
            &mut displacements,
        );
        Ok(())
    }

    fn end(&mut self) {
        let storage = self.storage.lock();
        self.map.write().publish(&storage.results);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spectrum::displacements::MAX_GRIDS;
    use crate::spectrum::surface::ImageSurface;
    use crate::tasks::{TaskHandle, TaskStatus};

    const SIZE: usize = 2;

    fn cells(value: Cell) -> Vec<Cell> {
        vec![value; SIZE * SIZE]
    }

    fn filled(value: f32) -> DisplacementChannels {
        let mut channels = DisplacementChannels::new(SIZE);
        for c in 0..MAX_GRIDS {
            channels.data_mut(c).unwrap().fill(value);
        }
        channels
    }

    /// Component `comp` of cell 0 in `channel`.
    fn comp(channels: &DisplacementChannels, channel: usize, comp: usize) -> f32 {
        channels.get(channel, 0, 0).unwrap()[comp]
    }

    fn run(
        index: usize,
        num_grids: usize,
        value: Cell,
        channels: &mut DisplacementChannels,
    ) -> Vec<Pixel> {
        let mut results = vec![[9.0; 4]; SIZE * SIZE];
        process_data(index, num_grids, &mut results, &cells(value), channels);
        results
    }

    #[test]
    fn test_one_grid() {
        let mut channels = filled(10.0);
        let results = run(0, 1, [1.0, 2.0, 3.0, 4.0], &mut channels);
        assert_eq!(results[0], [1.0, 2.0, 0.0, 0.0]);
        assert_eq!(channels.get(0, 0, 0), Some([10.0, 1.0, 10.0, 10.0]));
        for c in 1..MAX_GRIDS {
            assert_eq!(channels.get(c, 0, 0), Some([10.0; 4]), "channel {}", c);
        }

        run(1, 1, [5.0, 6.0, 7.0, 8.0], &mut channels);
        assert_eq!(channels.get(0, 0, 0), Some([15.0, 1.0, 16.0, 10.0]));
        for c in 1..MAX_GRIDS {
            assert_eq!(channels.get(c, 0, 0), Some([10.0; 4]), "channel {}", c);
        }

        let before = channels.clone();
        run(2, 1, [5.0, 6.0, 7.0, 8.0], &mut channels);
        assert_eq!(channels, before, "Slot 2 has no routes for one grid");
    }

    #[test]
    fn test_two_grids_scenario() {
        let mut channels = DisplacementChannels::new(SIZE);
        let results = run(0, 2, [1.0, 2.0, 3.0, 4.0], &mut channels);
        assert_eq!(results[0], [1.0, 2.0, 3.0, 4.0]);
        assert_eq!(comp(&channels, 0, 1), 1.0);
        assert_eq!(comp(&channels, 1, 1), 2.0);

        // Prior values must be added to, not overwritten.
        channels.data_mut(0).unwrap()[0] = 100.0;
        run(1, 2, [5.0, 6.0, 7.0, 8.0], &mut channels);
        assert_eq!(comp(&channels, 0, 0), 105.0);
        assert_eq!(comp(&channels, 0, 2), 6.0);
        assert_eq!(comp(&channels, 1, 0), 7.0);
        assert_eq!(comp(&channels, 1, 2), 8.0);
        assert_eq!(comp(&channels, 0, 1), 1.0, "Heights are left alone by slot 1");
        assert_eq!(channels.get(2, 0, 0), Some([0.0; 4]));
        assert_eq!(channels.get(3, 0, 0), Some([0.0; 4]));
    }

    #[test]
    fn test_three_grids() {
        let mut channels = filled(1.0);
        run(0, 3, [1.0, 2.0, 3.0, 4.0], &mut channels);
        for (c, want) in [1.0, 2.0, 3.0, 4.0].into_iter().enumerate() {
            assert_eq!(channels.get(c, 0, 0), Some([1.0, want, 1.0, 1.0]));
        }

        run(1, 3, [5.0, 6.0, 7.0, 8.0], &mut channels);
        assert_eq!(channels.get(0, 0, 0), Some([6.0, 1.0, 7.0, 1.0]));
        assert_eq!(channels.get(1, 0, 0), Some([8.0, 2.0, 9.0, 1.0]));
        assert_eq!(channels.get(2, 0, 0), Some([1.0, 3.0, 1.0, 1.0]));

        run(2, 3, [10.0, 20.0, 30.0, 40.0], &mut channels);
        assert_eq!(channels.get(2, 0, 0), Some([11.0, 3.0, 21.0, 1.0]));
        assert_eq!(
            channels.get(3, 0, 0),
            Some([1.0, 4.0, 1.0, 1.0]),
            "Slot 2 only fills channel 2 for three grids"
        );
    }

    #[test]
    fn test_four_grids() {
        let mut channels = DisplacementChannels::new(SIZE);
        run(0, 4, [1.0, 2.0, 3.0, 4.0], &mut channels);
        run(1, 4, [5.0, 6.0, 7.0, 8.0], &mut channels);
        run(2, 4, [10.0, 20.0, 30.0, 40.0], &mut channels);

        assert_eq!(channels.get(0, 0, 0), Some([5.0, 1.0, 6.0, 0.0]));
        assert_eq!(channels.get(1, 0, 0), Some([7.0, 2.0, 8.0, 0.0]));
        assert_eq!(channels.get(2, 0, 0), Some([10.0, 3.0, 20.0, 0.0]));
        assert_eq!(channels.get(3, 0, 0), Some([30.0, 4.0, 40.0, 0.0]));
    }

    #[test]
    fn test_every_cell_is_routed() {
        let mut channels = DisplacementChannels::new(SIZE);
        let data: Vec<Cell> = (0..SIZE * SIZE).map(|i| [i as f32, 0.0, 0.0, 0.0]).collect();
        let mut results = vec![[0.0; 4]; SIZE * SIZE];
        process_data(0, 1, &mut results, &data, &mut channels);

        for y in 0..SIZE {
            for x in 0..SIZE {
                let j = x + y * SIZE;
                assert_eq!(channels.get(0, x, y).unwrap()[1], j as f32);
                assert_eq!(results[j][0], j as f32);
            }
        }
    }

    #[test]
    fn test_unsupported_grid_counts_zero_results() {
        for num_grids in [0, 5, 17] {
            for index in 0..3 {
                let mut channels = filled(3.0);
                let before = channels.clone();
                let results = run(index, num_grids, [1.0, 2.0, 3.0, 4.0], &mut channels);
                assert!(
                    results.iter().all(|r| *r == [0.0; 4]),
                    "grids {} slot {} should zero results",
                    num_grids,
                    index
                );
                assert_eq!(channels, before);
            }
        }
    }

    fn slot_task(index: usize, num_grids: usize) -> (TaskHandle<FourierTask>, SurfaceHandle) {
        let mut storage = SlotStorage::new(SIZE);
        storage.data[READ][0] = [1.0, 0.0, 0.0, 0.0];
        let map = ImageSurface::new(SIZE).shared();
        let task = FourierTask::new(
            index,
            num_grids,
            Arc::new(FourierCpu::new(SIZE).unwrap()),
            Arc::new(Mutex::new(storage)),
            Arc::clone(&map),
            Arc::new(Mutex::new(filled(2.0))),
        );
        (TaskHandle::new(task), map)
    }

    #[test]
    fn test_cancelled_transform_commits_nothing() {
        let (task, map) = slot_task(1, 2);
        assert_eq!(task.work().index(), 1);
        let before = task.work().displacements.lock().clone();

        task.cancel();
        let ctx = RunContext::new(task.control(), None);
        let outcome = task.work().run(&ctx);
        assert!(matches!(outcome, Err(TaskError::Cancelled)));

        let work = task.work();
        assert_eq!(*work.displacements.lock(), before);
        assert!(work.storage.lock().results.iter().all(|r| *r == [0.0; 4]));
        drop(work);
        assert!(map.read().pixels().iter().all(|p| *p == [0.0; 4]));
    }

    #[test]
    fn test_cancel_while_running_leaves_channels() {
        let (task, map) = slot_task(0, 1);
        let before = task.work().displacements.lock().clone();

        task.start().unwrap();
        task.cancel();
        assert_eq!(task.run(), TaskStatus::Cancelled);
        task.end().unwrap();

        assert_eq!(task.status(), TaskStatus::Cancelled);
        assert_eq!(*task.work().displacements.lock(), before);
        assert!(map.read().pixels().iter().all(|p| *p == [0.0; 4]));
    }

    #[test]
    fn test_completed_run_publishes_what_it_redistributed() {
        let (task, map) = slot_task(0, 1);
        assert_eq!(task.execute().unwrap(), TaskStatus::Done);

        let work = task.work();
        let channels = work.displacements.lock();
        let surface = map.read();
        for y in 0..SIZE {
            for x in 0..SIZE {
                assert_eq!(channels.get(0, x, y).unwrap()[1], 1.0);
                assert_eq!(surface.pixel(x, y).unwrap()[0], 1.0);
            }
        }
    }
}
