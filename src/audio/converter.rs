//! Sample-rate conversion for classifier input

use ndarray::{Array1, ArrayView1};

pub struct AudioConverter;

impl AudioConverter {
    /// Resample mono samples using linear interpolation
    pub fn resample(data: ArrayView1<f32>, from_rate: u32, to_rate: u32) -> Array1<f32> {
        if from_rate == to_rate || data.is_empty() || from_rate == 0 {
            return data.to_owned();
        }

        let ratio = to_rate as f64 / from_rate as f64;
        let new_length = (data.len() as f64 * ratio) as usize;
        let old_length = data.len();
        let mut new_data = Array1::zeros(new_length);

        for i in 0..new_length {
            let old_pos = i as f64 / ratio;
            let old_index = old_pos.floor() as usize;
            let fraction = (old_pos - old_index as f64) as f32;

            new_data[i] = if old_index >= old_length - 1 {
                data[old_length - 1]
            } else {
                data[old_index] + (data[old_index + 1] - data[old_index]) * fraction
            };
        }

        new_data
    }
}
