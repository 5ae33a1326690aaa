//! Example: Run a few frames of a Phillips spectrum and report stats.
//!
//! Run with:
//!     cargo run --example ocean_frames -- [config.json] [heights.png]
//!
//! Set `RUST_LOG=debug` for per-frame logging.

use std::sync::Arc;

use anyhow::Context;
use ocean_fourier::spectrum::{PhillipsCondition, PhillipsParams, SpectrumBuffer};
use ocean_fourier::{PipelineConfig, WavePipeline};

const FRAMES: usize = 30;
const DT: f32 = 1.0 / 30.0;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => PipelineConfig::load(&path).with_context(|| format!("loading {}", path))?,
        None => PipelineConfig::default(),
    };
    let output = args.next();

    println!("Ocean Fourier - Phillips spectrum frames");
    println!("========================================\n");
    println!("{}\n", serde_json::to_string_pretty(&config)?);

    let condition = Arc::new(PhillipsCondition::new(
        config.fourier_size,
        PhillipsParams::default(),
    )?);
    let mut pipeline = WavePipeline::new(config)?;

    let mut total_ms = 0.0;
    for frame in 0..FRAMES {
        let stats = pipeline.run_frame(condition.clone(), frame as f32 * DT)?;
        total_ms += stats.elapsed_ms;
        if frame % 10 == 0 {
            println!("{}", serde_json::to_string(&stats)?);
        }
    }
    println!(
        "\n{} frames, {:.3} ms average",
        FRAMES,
        total_ms / FRAMES as f64
    );

    let probe = pipeline.sample(0, 0.5, 0.5).unwrap_or_default();
    println!("Displacement at tile center: {:?}", probe);

    if let Some(path) = output {
        let surface = pipeline.buffer().texture(0);
        let surface = surface.read();
        let heights = surface
            .to_image()
            .context("surface is too large for an image")?;

        // Normalize the height lane into an 8-bit grayscale image.
        let peak = heights
            .pixels()
            .map(|p| p.0[0].abs())
            .fold(f32::EPSILON, f32::max);
        let gray = image::GrayImage::from_fn(heights.width(), heights.height(), |x, y| {
            let h = heights.get_pixel(x, y).0[0] / peak;
            image::Luma([((h * 0.5 + 0.5) * 255.0).clamp(0.0, 255.0) as u8])
        });
        gray.save(&path).with_context(|| format!("saving {}", path))?;
        println!("Saved height map to {}", path);
    }

    Ok(())
}
