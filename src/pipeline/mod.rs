//! Frame pipeline combining the worker pool and the displacement buffer.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::spectrum::{
    BufferError, DisplacementBufferCpu, ExecutionMode, SpectrumBuffer, SpectrumCondition,
    SpectrumError, CHANNELS, MAX_BUFFERS,
};
use crate::tasks::{Scheduler, SchedulerError};

/// Pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Side length of the FFT grid. Must be a power of two.
    pub fourier_size: usize,
    /// Number of buffer slots (1 to 3).
    pub num_buffers: usize,
    /// Dispatch tasks to a worker pool instead of running them inline.
    pub multithreading: bool,
    pub workers: usize,
    /// How long `run_frame` waits for a frame before cancelling it.
    pub wait_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fourier_size: 64,
            num_buffers: MAX_BUFFERS,
            multithreading: true,
            workers: 4,
            wait_timeout_ms: 5_000,
        }
    }
}

impl PipelineConfig {
    pub fn from_json(json: &str) -> Result<Self, PipelineError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, PipelineError> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.fourier_size < 2 || !self.fourier_size.is_power_of_two() {
            return Err(PipelineError::Config(format!(
                "fourier_size must be a power of 2 of at least 2, got {}",
                self.fourier_size
            )));
        }
        if self.num_buffers == 0 || self.num_buffers > MAX_BUFFERS {
            return Err(PipelineError::Config(format!(
                "num_buffers must be between 1 and {}, got {}",
                MAX_BUFFERS, self.num_buffers
            )));
        }
        if self.multithreading && self.workers == 0 {
            return Err(PipelineError::Config(
                "workers must be at least 1 when multithreading".to_string(),
            ));
        }
        if self.wait_timeout_ms == 0 {
            return Err(PipelineError::Config(
                "wait_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

/// Errors that can occur while running the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Config parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
    #[error("Spectrum error: {0}")]
    Spectrum(#[from] SpectrumError),
    #[error("Frame did not finish within {0:?}")]
    Timeout(Duration),
}

/// Summary of one completed frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameStats {
    pub frame: u64,
    pub time: f32,
    pub num_grids: usize,
    pub enabled_buffers: usize,
    pub elapsed_ms: f64,
    pub multithreaded: bool,
}

/// Owns the worker pool and a displacement buffer and runs frames on them.
pub struct WavePipeline {
    config: PipelineConfig,
    buffer: DisplacementBufferCpu,
    frames: u64,
}

impl WavePipeline {
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;

        let mode = if config.multithreading {
            let scheduler = Scheduler::new(config.workers)?;
            log::info!(
                "Using {} worker threads for {}x{} Fourier transforms",
                config.workers,
                config.fourier_size,
                config.fourier_size
            );
            ExecutionMode::Scheduled(Arc::new(scheduler))
        } else {
            log::info!(
                "Using synchronous {}x{} Fourier transforms",
                config.fourier_size,
                config.fourier_size
            );
            ExecutionMode::Synchronous
        };

        let buffer = DisplacementBufferCpu::new(config.fourier_size, config.num_buffers, mode)?;

        Ok(Self {
            config,
            buffer,
            frames: 0,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn buffer(&self) -> &DisplacementBufferCpu {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut DisplacementBufferCpu {
        &mut self.buffer
    }

    /// Frames completed by [`WavePipeline::run_frame`].
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Start a frame without waiting for it.
    pub fn submit(
        &mut self,
        condition: Arc<dyn SpectrumCondition>,
        time: f32,
    ) -> Result<(), PipelineError> {
        self.buffer.run(condition, time)?;
        Ok(())
    }

    /// Finish handed-back tasks on this thread and report whether the
    /// current frame is complete.
    pub fn poll(&self) -> bool {
        self.buffer.update();
        self.buffer.is_done()
    }

    /// Run a frame to completion.
    ///
    /// A frame that does not finish within the configured timeout is
    /// cancelled and reported as [`PipelineError::Timeout`].
    pub fn run_frame(
        &mut self,
        condition: Arc<dyn SpectrumCondition>,
        time: f32,
    ) -> Result<FrameStats, PipelineError> {
        let started = Instant::now();
        self.submit(condition, time)?;

        let timeout = self.config.wait_timeout();
        if !self.buffer.wait(timeout) {
            log::warn!("Frame at t={} timed out, cancelling", time);
            self.buffer.cancel();
            return Err(PipelineError::Timeout(timeout));
        }
        self.buffer.frame_result()?;

        self.frames += 1;
        let stats = FrameStats {
            frame: self.frames,
            time,
            num_grids: self.buffer.num_grids(),
            enabled_buffers: self.buffer.enabled_buffer_count(),
            elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
            multithreaded: self.buffer.mode().is_multithreaded(),
        };
        log::debug!("Frame {} done in {:.3} ms", stats.frame, stats.elapsed_ms);
        Ok(stats)
    }

    /// Filtered displacement of `channel` at tile coordinates `(u, v)`.
    ///
    /// Marks the buffer as sampled.
    pub fn sample(&mut self, channel: usize, u: f32, v: f32) -> Option<[f32; CHANNELS]> {
        let value = self.buffer.displacements().sample(channel, u, v);
        self.buffer.mark_sampled();
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spectrum::ConstantCondition;
    use std::io::Write;

    fn condition() -> Arc<dyn SpectrumCondition> {
        Arc::new(ConstantCondition::new(2, [1.0, 0.0, 0.0, 0.0]))
    }

    #[test]
    fn test_pipeline_config_default() {
        let config = PipelineConfig::default();
        assert_eq!(config.fourier_size, 64);
        assert_eq!(config.num_buffers, 3);
        assert!(config.multithreading);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_partial_json() {
        let config =
            PipelineConfig::from_json(r#"{"fourier_size": 16, "multithreading": false}"#).unwrap();
        assert_eq!(config.fourier_size, 16);
        assert!(!config.multithreading);
        assert_eq!(config.workers, PipelineConfig::default().workers);
    }

    #[test]
    fn test_config_validation() {
        let bad = [
            PipelineConfig {
                fourier_size: 48,
                ..Default::default()
            },
            PipelineConfig {
                num_buffers: 0,
                ..Default::default()
            },
            PipelineConfig {
                num_buffers: 4,
                ..Default::default()
            },
            PipelineConfig {
                workers: 0,
                ..Default::default()
            },
            PipelineConfig {
                wait_timeout_ms: 0,
                ..Default::default()
            },
        ];
        for config in bad {
            assert!(
                matches!(config.validate(), Err(PipelineError::Config(_))),
                "{:?} should be rejected",
                config
            );
        }

        let sync = PipelineConfig {
            workers: 0,
            multithreading: false,
            ..Default::default()
        };
        assert!(sync.validate().is_ok(), "Workers are unused in synchronous mode");
    }

    #[test]
    fn test_config_parse_error() {
        assert!(matches!(
            PipelineConfig::from_json("{not json"),
            Err(PipelineError::Json(_))
        ));
    }

    #[test]
    fn test_config_load_from_file() {
        let config = PipelineConfig {
            fourier_size: 32,
            num_buffers: 2,
            multithreading: false,
            workers: 1,
            wait_timeout_ms: 250,
        };
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(serde_json::to_string(&config).unwrap().as_bytes())
            .unwrap();

        assert_eq!(PipelineConfig::load(file.path()).unwrap(), config);
        assert!(matches!(
            PipelineConfig::load(file.path().with_extension("missing")),
            Err(PipelineError::Io(_))
        ));
    }

    #[test]
    fn test_run_frame_synchronous() {
        let mut pipeline = WavePipeline::new(PipelineConfig {
            fourier_size: 8,
            multithreading: false,
            ..Default::default()
        })
        .unwrap();

        let stats = pipeline.run_frame(condition(), 0.5).unwrap();
        assert_eq!(stats.frame, 1);
        assert_eq!(stats.num_grids, 2);
        assert_eq!(stats.enabled_buffers, 3);
        assert!(!stats.multithreaded);
        assert!(pipeline.poll());

        // A constant spectrum transforms to an impulse at the origin.
        let origin = pipeline.sample(0, 0.0, 0.0).unwrap();
        assert!((origin[1] - 64.0).abs() < 1e-3, "got {}", origin[1]);
        assert!(pipeline.buffer().been_sampled());
    }

    #[test]
    fn test_submit_and_poll_threaded() {
        let mut pipeline = WavePipeline::new(PipelineConfig {
            fourier_size: 8,
            workers: 2,
            ..Default::default()
        })
        .unwrap();

        pipeline.submit(condition(), 0.0).unwrap();
        assert!(
            !pipeline.buffer().is_done(),
            "Fourier tasks stay pending until polled"
        );

        let deadline = Instant::now() + Duration::from_secs(5);
        while !pipeline.poll() {
            assert!(Instant::now() < deadline, "Frame never completed");
            std::thread::sleep(Duration::from_millis(1));
        }
        pipeline.buffer().frame_result().unwrap();

        let stats = pipeline.run_frame(condition(), 1.0).unwrap();
        assert!(stats.multithreaded);
        assert_eq!(stats.frame, 1, "Only run_frame counts frames");
    }

    #[test]
    fn test_frame_stats_serialize() {
        let stats = FrameStats {
            frame: 3,
            time: 1.5,
            num_grids: 4,
            enabled_buffers: 3,
            elapsed_ms: 0.25,
            multithreaded: true,
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["frame"], 3);
        assert_eq!(json["num_grids"], 4);
        assert_eq!(json["multithreaded"], true);
    }
}
