//! Magnitude spectrogram rendering
//!
//! Short-time Fourier transform over a Hann window, converted to decibels relative to the
//! loudest bin and written as a grayscale PNG (low frequencies at the bottom).

use std::path::Path;

use image::{GrayImage, ImageFormat, Luma};
use rayon::prelude::*;
use rustfft::FftPlanner;
use rustfft::num_complex::Complex;

use crate::error::{RunnerError, Result};

#[derive(Debug, Clone)]
pub struct SpectrogramConfig {
    pub fft_size: usize,
    pub hop_size: usize,
    /// Dynamic range shown, in dB below the peak.
    pub dynamic_range_db: f32,
}

impl Default for SpectrogramConfig {
    fn default() -> Self {
        Self {
            fft_size: 512,
            hop_size: 128,
            dynamic_range_db: 80.0,
        }
    }
}

/// Frames x bins, in dB.
#[derive(Debug, Clone)]
pub struct Spectrogram {
    pub frames: Vec<Vec<f32>>,
    pub bins: usize,
}

impl Spectrogram {
    pub fn compute(samples: &[f32], config: &SpectrogramConfig) -> Self {
        let n = config.fft_size.max(2);
        let hop = config.hop_size.max(1);
        let bins = n / 2 + 1;

        let padded;
        let samples = if samples.len() < n {
            padded = {
                let mut v = samples.to_vec();
                v.resize(n, 0.0);
                v
            };
            padded.as_slice()
        } else {
            samples
        };

        let window: Vec<f32> = (0..n)
            .map(|i| 0.5 - 0.5 * (2.0 * std::f32::consts::PI * i as f32 / (n - 1) as f32).cos())
            .collect();
        let fft = FftPlanner::<f32>::new().plan_fft_forward(n);

        let starts: Vec<usize> = (0..=samples.len() - n).step_by(hop).collect();
        let frames: Vec<Vec<f32>> = starts
            .par_iter()
            .map(|&start| {
                let mut buffer: Vec<Complex<f32>> = samples[start..start + n]
                    .iter()
                    .zip(&window)
                    .map(|(&s, &w)| Complex::new(s * w, 0.0))
                    .collect();
                fft.process(&mut buffer);
                buffer[..bins]
                    .iter()
                    .map(|c| 20.0 * (c.norm() + 1e-10).log10())
                    .collect::<Vec<f32>>()
            })
            .collect();

        Self { frames, bins }
    }

    pub fn width(&self) -> usize {
        self.frames.len()
    }

    /// Map to 8-bit grayscale, 255 at the peak, 0 at `dynamic_range_db` below it.
    pub fn to_image(&self, dynamic_range_db: f32) -> GrayImage {
        let peak = self.frames
            .iter()
            .flat_map(|f| f.iter().copied())
            .fold(f32::NEG_INFINITY, f32::max);
        let range = dynamic_range_db.max(1.0);
        let height = self.bins as u32;

        GrayImage::from_fn(self.width() as u32, height, |x, y| {
            let bin = (height - 1 - y) as usize;
            let db = self.frames[x as usize][bin];
            let level = ((db - peak + range) / range).clamp(0.0, 1.0);
            Luma([(level * 255.0).round() as u8])
        })
    }

    pub fn save_png<P: AsRef<Path>>(&self, path: P, dynamic_range_db: f32) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.to_image(dynamic_range_db)
            .save_with_format(path, ImageFormat::Png)
            .map_err(|e| {
                RunnerError::io(format!("Failed to write spectrogram {}: {}", path.display(), e))
            })
    }
}
