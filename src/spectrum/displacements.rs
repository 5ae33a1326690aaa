//! Displacement channels filled by the Fourier tasks and sampled by wave queries.

/// Scalar components stored per grid cell in a channel.
pub const CHANNELS: usize = 4;

/// Maximum number of displacement channels (one per spectrum grid).
pub const MAX_GRIDS: usize = 4;

/// Number of channels in use for a grid count.
pub fn active_channels(num_grids: usize) -> usize {
    match num_grids {
        1 => 1,
        2 => 2,
        3 | 4 => 4,
        _ => 0,
    }
}

/// Fixed set of square displacement channels, each cell holding
/// [`CHANNELS`] interleaved components.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplacementChannels {
    size: usize,
    num_grids: usize,
    channels: Vec<Vec<f32>>,
}

impl DisplacementChannels {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            num_grids: 0,
            channels: vec![vec![0.0; size * size * CHANNELS]; MAX_GRIDS],
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Grid count the channels were last filled for.
    pub fn num_grids(&self) -> usize {
        self.num_grids
    }

    pub fn set_num_grids(&mut self, num_grids: usize) {
        self.num_grids = num_grids;
    }

    pub fn active_channels(&self) -> usize {
        active_channels(self.num_grids)
    }

    /// Zero every channel.
    pub fn clear(&mut self) {
        for channel in &mut self.channels {
            channel.fill(0.0);
        }
    }

    pub fn data(&self, channel: usize) -> Option<&[f32]> {
        self.channels.get(channel).map(Vec::as_slice)
    }

    pub fn data_mut(&mut self, channel: usize) -> Option<&mut [f32]> {
        self.channels.get_mut(channel).map(Vec::as_mut_slice)
    }

    /// Components of one cell.
    pub fn get(&self, channel: usize, x: usize, y: usize) -> Option<[f32; CHANNELS]> {
        if x >= self.size || y >= self.size {
            return None;
        }
        let data = self.channels.get(channel)?;
        let idx = (x + y * self.size) * CHANNELS;
        let mut out = [0.0; CHANNELS];
        out.copy_from_slice(&data[idx..idx + CHANNELS]);
        Some(out)
    }

    /// Bilinearly filtered lookup with wrap-around addressing.
    ///
    /// `u` and `v` are in grid units scaled to `[0, 1)` per tile; values
    /// outside repeat.
    pub fn sample(&self, channel: usize, u: f32, v: f32) -> Option<[f32; CHANNELS]> {
        let data = self.channels.get(channel)?;
        if self.size == 0 {
            return None;
        }
        let n = self.size as f32;
        let fx = (u * n).rem_euclid(n);
        let fy = (v * n).rem_euclid(n);

        let x0 = fx.floor() as usize % self.size;
        let y0 = fy.floor() as usize % self.size;
        let x1 = (x0 + 1) % self.size;
        let y1 = (y0 + 1) % self.size;
        let tx = fx - fx.floor();
        let ty = fy - fy.floor();

        let at = |x: usize, y: usize, c: usize| data[(x + y * self.size) * CHANNELS + c];

        let mut out = [0.0; CHANNELS];
        for (c, value) in out.iter_mut().enumerate() {
            let top = at(x0, y0, c) * (1.0 - tx) + at(x1, y0, c) * tx;
            let bottom = at(x0, y1, c) * (1.0 - tx) + at(x1, y1, c) * tx;
            *value = top * (1.0 - ty) + bottom * ty;
        }
        Some(out)
    }
}
