//! Output image surfaces the Fourier results are published to.

use std::sync::Arc;

use image::Rgba32FImage;
use parking_lot::RwLock;

/// One RGBA float pixel.
pub type Pixel = [f32; 4];

/// Shared, lock-protected surface as handed to consumers.
pub type SurfaceHandle = Arc<RwLock<ImageSurface>>;

/// Square RGBA float image.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageSurface {
    size: usize,
    pixels: Vec<Pixel>,
}

impl ImageSurface {
    /// A `size` x `size` surface cleared to zero.
    pub fn new(size: usize) -> Self {
        Self {
            size,
            pixels: vec![[0.0; 4]; size * size],
        }
    }

    /// The 1x1 transparent black surface returned for missing slots.
    pub fn blank() -> Self {
        Self::new(1)
    }

    pub fn shared(self) -> SurfaceHandle {
        Arc::new(RwLock::new(self))
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn pixels(&self) -> &[Pixel] {
        &self.pixels
    }

    pub fn pixel(&self, x: usize, y: usize) -> Option<Pixel> {
        if x >= self.size || y >= self.size {
            return None;
        }
        self.pixels.get(x + y * self.size).copied()
    }

    /// Replace the contents with `results`. Extra results are ignored and
    /// missing ones leave the remaining pixels untouched.
    pub fn publish(&mut self, results: &[Pixel]) {
        let count = results.len().min(self.pixels.len());
        self.pixels[..count].copy_from_slice(&results[..count]);
    }

    /// Raw bytes for uploading to a GPU texture.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.pixels)
    }

    /// Copy into an `image` buffer.
    pub fn to_image(&self) -> Option<Rgba32FImage> {
        let side = u32::try_from(self.size).ok()?;
        let raw: Vec<f32> = bytemuck::cast_slice(&self.pixels).to_vec();
        Rgba32FImage::from_raw(side, side, raw)
    }
}
