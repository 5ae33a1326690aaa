//! Synthetic spectrum conditions for testing, benchmarks and demos.
//!
//! [`PhillipsCondition`] builds a seeded Phillips spectrum per grid and
//! evolves it in time, packing heights into slot 0 and horizontal
//! displacements into slots 1 and 2 in the layout the Fourier tasks unpack.

use std::f32::consts::{FRAC_1_SQRT_2, PI};

use rustfft::num_complex::Complex32;
use serde::{Deserialize, Serialize};

use super::condition::{SpectrumCondition, SpectrumError};
use super::displacements::MAX_GRIDS;
use super::fourier::{Cell, Packing};

const GRAVITY: f32 = 9.81;

/// Fills every cell of every slot with the same value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConstantCondition {
    pub num_grids: usize,
    pub value: Cell,
    pub packing: Packing,
}

impl ConstantCondition {
    pub fn new(num_grids: usize, value: Cell) -> Self {
        Self {
            num_grids,
            value,
            packing: Packing::Double,
        }
    }
}

impl SpectrumCondition for ConstantCondition {
    fn num_grids(&self) -> usize {
        self.num_grids
    }

    fn packing(&self, _slot: usize) -> Packing {
        self.packing
    }

    fn initialize(
        &self,
        _slot: usize,
        _time: f32,
        _size: usize,
        out: &mut [Cell],
    ) -> Result<(), SpectrumError> {
        out.fill(self.value);
        Ok(())
    }
}

/// Wind and scale parameters of a Phillips spectrum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhillipsParams {
    /// Wind speed in m/s.
    pub wind_speed: f32,
    /// Wind direction, normalized on use.
    pub wind_dir: [f32; 2],
    pub amplitude: f32,
    /// World size in meters of each grid's tile. One entry per grid.
    pub grid_sizes: Vec<f32>,
    pub seed: u64,
}

impl Default for PhillipsParams {
    fn default() -> Self {
        Self {
            wind_speed: 8.0,
            wind_dir: [1.0, 0.0],
            amplitude: 0.002,
            grid_sizes: vec![1000.0, 250.0, 50.0, 10.0],
            seed: 0x5eed,
        }
    }
}

/// Time-evolved Phillips spectrum over up to four grids.
pub struct PhillipsCondition {
    size: usize,
    params: PhillipsParams,
    /// Initial amplitudes per grid, `size * size` each.
    h0: Vec<Vec<Complex32>>,
    /// Wave vectors per grid, same layout as `h0`.
    k: Vec<Vec<[f32; 2]>>,
}

impl PhillipsCondition {
    pub fn new(size: usize, params: PhillipsParams) -> Result<Self, SpectrumError> {
        let num_grids = params.grid_sizes.len();
        if num_grids == 0 || num_grids > MAX_GRIDS {
            return Err(SpectrumError::InvalidGridCount(num_grids));
        }
        if size < 2 || !size.is_power_of_two() {
            return Err(SpectrumError::Failed(format!(
                "grid size must be a power of 2 of at least 2, got {}",
                size
            )));
        }

        let mut rng = Gaussian::new(params.seed);
        let mut h0 = Vec::with_capacity(num_grids);
        let mut k = Vec::with_capacity(num_grids);
        for &length in &params.grid_sizes {
            let (amplitudes, vectors) = initial_spectrum(size, length, &params, &mut rng);
            h0.push(amplitudes);
            k.push(vectors);
        }

        Ok(Self { size, params, h0, k })
    }

    pub fn params(&self) -> &PhillipsParams {
        &self.params
    }

    /// Height spectrum of `grid` at `time`, conjugate symmetric in `k`.
    fn height(&self, grid: usize, idx: usize, time: f32) -> Complex32 {
        let n = self.size;
        let (x, y) = (idx % n, idx / n);
        let mirrored = (n - x) % n + ((n - y) % n) * n;

        let [kx, ky] = self.k[grid][idx];
        let omega = (GRAVITY * (kx * kx + ky * ky).sqrt()).sqrt();
        let phase = Complex32::from_polar(1.0, omega * time);

        self.h0[grid][idx] * phase + self.h0[grid][mirrored].conj() * phase.conj()
    }

    /// `(Dx, Dz)` horizontal displacement spectra of `grid`.
    fn choppy(&self, grid: usize, idx: usize, time: f32) -> (Complex32, Complex32) {
        let [kx, ky] = self.k[grid][idx];
        let len = (kx * kx + ky * ky).sqrt();
        if len < 1e-6 {
            return (Complex32::new(0.0, 0.0), Complex32::new(0.0, 0.0));
        }
        let h = self.height(grid, idx, time);
        let minus_i = Complex32::new(0.0, -1.0);
        (minus_i * (kx / len) * h, minus_i * (ky / len) * h)
    }

    fn grid_or_zero(&self, grid: usize, f: impl Fn(usize) -> Complex32) -> Complex32 {
        if grid < self.h0.len() {
            f(grid)
        } else {
            Complex32::new(0.0, 0.0)
        }
    }
}

impl SpectrumCondition for PhillipsCondition {
    fn num_grids(&self) -> usize {
        self.h0.len()
    }

    fn packing(&self, slot: usize) -> Packing {
        match (slot, self.h0.len()) {
            (0, 1 | 2) | (1, 1) | (2, 3) => Packing::Single,
            _ => Packing::Double,
        }
    }

    fn initialize(
        &self,
        slot: usize,
        time: f32,
        size: usize,
        out: &mut [Cell],
    ) -> Result<(), SpectrumError> {
        if size != self.size || out.len() != size * size {
            return Err(SpectrumError::SizeMismatch {
                expected: self.size,
                got: size,
            });
        }
        if slot > 2 {
            return Err(SpectrumError::UnknownSlot(slot));
        }

        for (idx, cell) in out.iter_mut().enumerate() {
            let (a, b) = match slot {
                0 => (
                    pack(
                        self.grid_or_zero(0, |g| self.height(g, idx, time)),
                        self.grid_or_zero(1, |g| self.height(g, idx, time)),
                    ),
                    pack(
                        self.grid_or_zero(2, |g| self.height(g, idx, time)),
                        self.grid_or_zero(3, |g| self.height(g, idx, time)),
                    ),
                ),
                _ => {
                    let first = (slot - 1) * 2;
                    let choppy = |grid: usize| {
                        if grid < self.h0.len() {
                            let (dx, dz) = self.choppy(grid, idx, time);
                            pack(dx, dz)
                        } else {
                            Complex32::new(0.0, 0.0)
                        }
                    };
                    (choppy(first), choppy(first + 1))
                }
            };
            *cell = [a.re, a.im, b.re, b.im];
        }
        Ok(())
    }
}

/// Pack two Hermitian spectra into one complex value as `a + i b`, so the
/// inverse transform yields `a` in the real part and `b` in the imaginary.
fn pack(a: Complex32, b: Complex32) -> Complex32 {
    Complex32::new(a.re - b.im, a.im + b.re)
}

/// Frequency index of `i` in FFT order: `0..n/2` then `-n/2..0`.
fn frequency(i: usize, n: usize) -> f32 {
    if i < n / 2 {
        i as f32
    } else {
        i as f32 - n as f32
    }
}

fn initial_spectrum(
    size: usize,
    length: f32,
    params: &PhillipsParams,
    rng: &mut Gaussian,
) -> (Vec<Complex32>, Vec<[f32; 2]>) {
    let dir_len = (params.wind_dir[0].powi(2) + params.wind_dir[1].powi(2))
        .sqrt()
        .max(1e-6);
    let wind = [params.wind_dir[0] / dir_len, params.wind_dir[1] / dir_len];
    let largest = params.wind_speed * params.wind_speed / GRAVITY;
    let damping = largest / 1000.0;

    let mut h0 = Vec::with_capacity(size * size);
    let mut k = Vec::with_capacity(size * size);
    for y in 0..size {
        for x in 0..size {
            let kx = 2.0 * PI * frequency(x, size) / length;
            let ky = 2.0 * PI * frequency(y, size) / length;
            k.push([kx, ky]);

            let (g0, g1) = (rng.sample(), rng.sample());
            // Nyquist row and column have no conjugate partner.
            if x == size / 2 || y == size / 2 {
                h0.push(Complex32::new(0.0, 0.0));
                continue;
            }

            let k2 = kx * kx + ky * ky;
            if k2 < 1e-12 {
                h0.push(Complex32::new(0.0, 0.0));
                continue;
            }
            let k_len = k2.sqrt();
            let cos = (kx * wind[0] + ky * wind[1]) / k_len;
            let phillips = params.amplitude * (-1.0 / (k2 * largest * largest)).exp() / (k2 * k2)
                * cos
                * cos
                * (-k2 * damping * damping).exp();

            h0.push(Complex32::new(g0, g1) * (FRAC_1_SQRT_2 * phillips.sqrt()));
        }
    }
    (h0, k)
}

/// Seeded normal distribution from an LCG and the Box-Muller transform.
struct Gaussian {
    state: u64,
    spare: Option<f32>,
}

impl Gaussian {
    fn new(seed: u64) -> Self {
        Self { state: seed, spare: None }
    }

    fn uniform(&mut self) -> f32 {
        self.state = self
            .state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        // Top 24 bits, shifted into (0, 1].
        ((self.state >> 40) as f32 + 1.0) / (1u64 << 24) as f32
    }

    fn sample(&mut self) -> f32 {
        if let Some(spare) = self.spare.take() {
            return spare;
        }
        let u1 = self.uniform();
        let u2 = self.uniform();
        let r = (-2.0 * u1.ln()).sqrt();
        let theta = 2.0 * PI * u2;
        self.spare = Some(r * theta.sin());
        r * theta.cos()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mirrored(idx: usize, n: usize) -> usize {
        let (x, y) = (idx % n, idx / n);
        (n - x) % n + ((n - y) % n) * n
    }

    #[test]
    fn test_constant_condition() {
        let condition = ConstantCondition::new(3, [1.0, 2.0, 3.0, 4.0]);
        let mut out = vec![[0.0; 4]; 16];
        condition.initialize(1, 0.0, 4, &mut out).unwrap();
        assert!(out.iter().all(|c| *c == [1.0, 2.0, 3.0, 4.0]));
        assert_eq!(condition.num_grids(), 3);
        assert_eq!(condition.packing(2), Packing::Double);
    }

    #[test]
    fn test_gaussian_statistics() {
        let mut rng = Gaussian::new(42);
        let samples: Vec<f32> = (0..20_000).map(|_| rng.sample()).collect();
        let mean = samples.iter().sum::<f32>() / samples.len() as f32;
        let var = samples.iter().map(|s| (s - mean).powi(2)).sum::<f32>() / samples.len() as f32;
        assert!(mean.abs() < 0.05, "mean {}", mean);
        assert!((var - 1.0).abs() < 0.05, "variance {}", var);
        assert!(samples.iter().all(|s| s.is_finite()));
    }

    #[test]
    fn test_invalid_parameters() {
        let params = PhillipsParams {
            grid_sizes: vec![],
            ..Default::default()
        };
        assert!(matches!(
            PhillipsCondition::new(8, params),
            Err(SpectrumError::InvalidGridCount(0))
        ));

        let params = PhillipsParams {
            grid_sizes: vec![1.0; 5],
            ..Default::default()
        };
        assert!(matches!(
            PhillipsCondition::new(8, params),
            Err(SpectrumError::InvalidGridCount(5))
        ));

        assert!(matches!(
            PhillipsCondition::new(12, PhillipsParams::default()),
            Err(SpectrumError::Failed(_))
        ));
    }

    #[test]
    fn test_initialize_checks_size_and_slot() {
        let condition = PhillipsCondition::new(8, PhillipsParams::default()).unwrap();
        let mut out = vec![[0.0; 4]; 16];
        assert!(matches!(
            condition.initialize(0, 0.0, 4, &mut out),
            Err(SpectrumError::SizeMismatch { expected: 8, got: 4 })
        ));

        let mut out = vec![[0.0; 4]; 64];
        assert!(matches!(
            condition.initialize(3, 0.0, 8, &mut out),
            Err(SpectrumError::UnknownSlot(3))
        ));
    }

    #[test]
    fn test_height_spectrum_is_hermitian() {
        let n = 16;
        let params = PhillipsParams {
            grid_sizes: vec![100.0],
            ..Default::default()
        };
        let condition = PhillipsCondition::new(n, params).unwrap();
        assert_eq!(condition.packing(0), Packing::Single);

        let mut out = vec![[0.0; 4]; n * n];
        condition.initialize(0, 3.7, n, &mut out).unwrap();

        let mut nonzero = 0;
        for idx in 0..n * n {
            let a = Complex32::new(out[idx][0], out[idx][1]);
            let m = mirrored(idx, n);
            let b = Complex32::new(out[m][0], out[m][1]);
            assert!((a - b.conj()).norm() < 1e-6, "cell {} is not conjugate to {}", idx, m);
            if a.norm() > 0.0 {
                nonzero += 1;
            }
        }
        assert!(nonzero > 0, "Spectrum should not be empty");
        assert_eq!(out[0], [0.0; 4], "No DC component");
    }

    #[test]
    fn test_seed_controls_spectrum() {
        let a = PhillipsCondition::new(8, PhillipsParams::default()).unwrap();
        let b = PhillipsCondition::new(8, PhillipsParams::default()).unwrap();
        let c = PhillipsCondition::new(
            8,
            PhillipsParams {
                seed: 7,
                ..Default::default()
            },
        )
        .unwrap();

        let fill = |cond: &PhillipsCondition| {
            let mut out = vec![[0.0; 4]; 64];
            cond.initialize(1, 1.0, 8, &mut out).unwrap();
            out
        };
        assert_eq!(fill(&a), fill(&b));
        assert_ne!(fill(&a), fill(&c));
    }

    #[test]
    fn test_packing_per_grid_count() {
        let with = |grids: usize| {
            PhillipsCondition::new(
                8,
                PhillipsParams {
                    grid_sizes: vec![10.0; grids],
                    ..Default::default()
                },
            )
            .unwrap()
        };
        assert_eq!(with(1).packing(1), Packing::Single);
        assert_eq!(with(2).packing(0), Packing::Single);
        assert_eq!(with(2).packing(1), Packing::Double);
        assert_eq!(with(3).packing(0), Packing::Double);
        assert_eq!(with(3).packing(2), Packing::Single);
        assert_eq!(with(4).packing(2), Packing::Double);
    }

    #[test]
    fn test_params_from_json() {
        let params: PhillipsParams =
            serde_json::from_str(r#"{"wind_speed": 12.0, "grid_sizes": [500.0, 50.0]}"#).unwrap();
        assert_eq!(params.wind_speed, 12.0);
        assert_eq!(params.grid_sizes.len(), 2);
        assert_eq!(params.seed, PhillipsParams::default().seed);
    }
}
