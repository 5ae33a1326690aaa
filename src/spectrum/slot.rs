//! Per-slot storage: the ping-pong pair, the repacked results and the
//! surface they are published to.

use std::sync::Arc;

use parking_lot::Mutex;

use super::fourier::{Cell, Packing};
use super::surface::{ImageSurface, Pixel, SurfaceHandle};

/// Data a Fourier task borrows for the duration of its run.
#[derive(Debug, Clone)]
pub struct SlotStorage {
    /// Ping-pong arrays addressed by role (`WRITE` / `READ`).
    pub data: [Vec<Cell>; 2],
    /// FFT output repacked into pixels for the surface.
    pub results: Vec<Pixel>,
    pub packing: Packing,
}

impl SlotStorage {
    pub fn new(size: usize) -> Self {
        let cells = size * size;
        Self {
            data: [vec![[0.0; 4]; cells], vec![[0.0; 4]; cells]],
            results: vec![[0.0; 4]; cells],
            packing: Packing::Double,
        }
    }
}

/// One slot of a spectrum buffer.
pub struct BufferSlot {
    pub(crate) storage: Arc<Mutex<SlotStorage>>,
    pub(crate) map: SurfaceHandle,
    pub(crate) disabled: bool,
}

impl BufferSlot {
    pub fn new(size: usize) -> Self {
        Self {
            storage: Arc::new(Mutex::new(SlotStorage::new(size))),
            map: ImageSurface::new(size).shared(),
            disabled: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.disabled
    }
}
