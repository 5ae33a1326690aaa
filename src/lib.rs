//! Ocean Fourier Core
//!
//! Multi-threaded CPU pipeline that turns a frequency-domain ocean wave
//! spectrum into time-domain displacement maps once per simulation frame.
//!
//! # Features
//!
//! - Pooled, resettable tasks with strict or relaxed dependency gating
//! - Fixed worker pool with an owner-thread completion queue (crossbeam-channel)
//! - 2D ping-pong FFT over single or double packed grids via RustFFT
//! - Redistribution of FFT output into up to four displacement channels
//! - RGBA float output surfaces exportable through `image`
//! - JSON pipeline configuration via serde

pub mod pipeline;
pub mod spectrum;
pub mod tasks;

// Re-export commonly used types
pub use pipeline::{FrameStats, PipelineConfig, PipelineError, WavePipeline};
pub use spectrum::{
    process_data, BufferError, ConstantCondition, DisplacementBufferCpu, DisplacementChannels,
    ExecutionMode, FourierCpu, FourierError, ImageSurface, Packing, PhillipsCondition,
    PhillipsParams, SlotSelector, SpectrumBuffer, SpectrumCondition, SpectrumError,
    SurfaceHandle,
};
pub use tasks::{Scheduler, SchedulerError, Task, TaskError, TaskHandle, TaskStatus};
