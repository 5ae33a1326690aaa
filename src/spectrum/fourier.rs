//! 2D FFT over ping-pong storage using RustFFT.
//!
//! Each grid cell is a [`Cell`] of four floats holding one complex number in
//! `xy` (single packed) or two independent complex numbers in `xy` and `zw`
//! (double packed). The transform alternates between the two storage arrays:
//! a row pass reads one array and writes the other, then a column pass writes
//! back. Starting with [`WRITE`] as the first destination the result always
//! lands in [`READ`].

use std::sync::Arc;

use rustfft::num_complex::Complex32;
use rustfft::{Fft, FftDirection, FftPlanner};
use serde::{Deserialize, Serialize};

use crate::tasks::CancelToken;

/// Storage role written by the first pass.
pub const WRITE: usize = 0;
/// Storage role holding the transform input and, afterwards, its output.
pub const READ: usize = 1;

/// One packed grid cell: `[x, y, z, w]`.
pub type Cell = [f32; 4];

/// Errors raised by the CPU Fourier engine.
#[derive(Debug, thiserror::Error)]
pub enum FourierError {
    #[error("Fourier size must be a non-zero power of 2, got {0}")]
    InvalidSize(usize),
    #[error("Storage length mismatch: expected {expected} cells but got {got}")]
    StorageMismatch { expected: usize, got: usize },
    #[error("Storage role index must be 0 or 1, got {0}")]
    InvalidRole(usize),
    #[error("Fourier transform did not end in the read buffer at index {expected}, got {actual}")]
    ReadIndexMismatch { expected: usize, actual: usize },
}

/// How many complex numbers a [`Cell`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Packing {
    Single,
    Double,
}

impl Packing {
    /// Number of complex lanes per cell.
    pub fn lanes(self) -> usize {
        match self {
            Packing::Single => 1,
            Packing::Double => 2,
        }
    }
}

/// Outcome of [`FourierCpu::transform`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    /// All passes ran; the output is in the contained role.
    Complete(usize),
    /// The token was cancelled between passes; storage holds partial data.
    Cancelled,
}

/// Number of passes a transform performs: one over rows, one over columns.
const PASSES: usize = 2;

/// CPU 2D FFT engine for square grids.
///
/// Plans are built once; each call allocates its own line and scratch buffers
/// so one engine can be shared between worker threads.
pub struct FourierCpu {
    size: usize,
    direction: FftDirection,
    fft: Arc<dyn Fft<f32>>,
}

impl FourierCpu {
    /// Create an inverse (spectrum to spatial) engine for `size` x `size` grids.
    pub fn new(size: usize) -> Result<Self, FourierError> {
        Self::with_direction(size, FftDirection::Inverse)
    }

    pub fn with_direction(size: usize, direction: FftDirection) -> Result<Self, FourierError> {
        if size == 0 || !size.is_power_of_two() {
            return Err(FourierError::InvalidSize(size));
        }

        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft(size, direction);

        Ok(Self {
            size,
            direction,
            fft,
        })
    }

    /// Side length of the grid.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn direction(&self) -> FftDirection {
        self.direction
    }

    /// Number of ping-pong passes per transform.
    pub fn passes(&self) -> usize {
        PASSES
    }

    /// Role index holding the output when the first pass writes to `start`.
    pub fn final_role(&self, start: usize) -> usize {
        (start + PASSES - 1) % 2
    }

    /// Transform `data` in place, unnormalized.
    ///
    /// The first pass reads role `1 - start` and writes role `start`; roles
    /// swap on every pass. `token` is polled after each pass.
    pub fn transform(
        &self,
        packing: Packing,
        data: &mut [Vec<Cell>; 2],
        start: usize,
        token: &dyn CancelToken,
    ) -> Result<Transform, FourierError> {
        if start > 1 {
            return Err(FourierError::InvalidRole(start));
        }
        let expected = self.size * self.size;
        for array in data.iter() {
            if array.len() != expected {
                return Err(FourierError::StorageMismatch {
                    expected,
                    got: array.len(),
                });
            }
        }

        let mut line = vec![Complex32::default(); self.size];
        let mut scratch = vec![Complex32::default(); self.fft.get_inplace_scratch_len()];

        let mut write = start;
        for pass in 0..PASSES {
            let (src, dst) = roles(data, write);
            if pass == 0 {
                self.row_pass(packing, src, dst, &mut line, &mut scratch);
            } else {
                self.column_pass(packing, src, dst, &mut line, &mut scratch);
            }

            if token.is_cancelled() {
                return Ok(Transform::Cancelled);
            }
            if pass + 1 < PASSES {
                write = 1 - write;
            }
        }

        Ok(Transform::Complete(write))
    }

    fn row_pass(
        &self,
        packing: Packing,
        src: &[Cell],
        dst: &mut [Cell],
        line: &mut [Complex32],
        scratch: &mut [Complex32],
    ) {
        let n = self.size;
        for y in 0..n {
            let row = y * n..(y + 1) * n;
            clear_unused_lanes(packing, &mut dst[row.clone()]);
            for lane in 0..packing.lanes() {
                for (c, cell) in line.iter_mut().zip(&src[row.clone()]) {
                    *c = load(cell, lane);
                }
                self.fft.process_with_scratch(line, scratch);
                for (cell, c) in dst[row.clone()].iter_mut().zip(line.iter()) {
                    store(cell, lane, *c);
                }
            }
        }
    }

    fn column_pass(
        &self,
        packing: Packing,
        src: &[Cell],
        dst: &mut [Cell],
        line: &mut [Complex32],
        scratch: &mut [Complex32],
    ) {
        let n = self.size;
        clear_unused_lanes(packing, dst);
        for x in 0..n {
            for lane in 0..packing.lanes() {
                for (y, c) in line.iter_mut().enumerate() {
                    *c = load(&src[x + y * n], lane);
                }
                self.fft.process_with_scratch(line, scratch);
                for (y, c) in line.iter().enumerate() {
                    store(&mut dst[x + y * n], lane, *c);
                }
            }
        }
    }
}

/// Split the storage pair into (read, write) views for a pass writing `write`.
fn roles(data: &mut [Vec<Cell>; 2], write: usize) -> (&[Cell], &mut [Cell]) {
    let [first, second] = data;
    if write == 0 {
        (second.as_slice(), first.as_mut_slice())
    } else {
        (first.as_slice(), second.as_mut_slice())
    }
}

fn clear_unused_lanes(packing: Packing, cells: &mut [Cell]) {
    if packing == Packing::Single {
        for cell in cells {
            cell[2] = 0.0;
            cell[3] = 0.0;
        }
    }
}

#[inline]
fn load(cell: &Cell, lane: usize) -> Complex32 {
    Complex32::new(cell[lane * 2], cell[lane * 2 + 1])
}

#[inline]
fn store(cell: &mut Cell, lane: usize, value: Complex32) {
    cell[lane * 2] = value.re;
    cell[lane * 2 + 1] = value.im;
}
