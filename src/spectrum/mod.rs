//! Spectrum buffers: FFT engine, per-slot tasks and displacement output.

pub mod buffer;
pub mod condition;
pub mod displacements;
pub mod fourier;
pub mod fourier_task;
pub mod slot;
pub mod surface;
pub mod synth;

pub use buffer::{
    BufferError, DisplacementBufferCpu, ExecutionMode, SlotSelector, SpectrumBuffer, MAX_BUFFERS,
};
pub use condition::{InitSpectrumTask, SpectrumCondition, SpectrumError};
pub use displacements::{active_channels, DisplacementChannels, CHANNELS, MAX_GRIDS};
pub use fourier::{Cell, FourierCpu, FourierError, Packing, Transform, READ, WRITE};
pub use fourier_task::{process_data, FourierTask};
pub use slot::{BufferSlot, SlotStorage};
pub use surface::{ImageSurface, Pixel, SurfaceHandle};
pub use synth::{ConstantCondition, PhillipsCondition, PhillipsParams};
