//! WAV audio file processing

use std::path::Path;
use std::fs::File;
use hound::{WavReader, WavWriter, SampleFormat};
use ndarray::{Array1, Array2, Axis, s};
use crate::error::{RunnerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Int16,
    Int24,
    Int32,
    Float32,
}

impl AudioFormat {
    pub fn bytes_per_sample(&self) -> u16 {
        match self {
            AudioFormat::Int16 => 2,
            AudioFormat::Int24 => 3,
            AudioFormat::Int32 | AudioFormat::Float32 => 4,
        }
    }

    pub fn to_sample_format(self) -> SampleFormat {
        match self {
            AudioFormat::Float32 => SampleFormat::Float,
            _ => SampleFormat::Int,
        }
    }

    /// Largest integer sample value; 1.0 for float samples.
    fn full_scale(self) -> f64 {
        match self {
            AudioFormat::Float32 => 1.0,
            _ => ((1i64 << (self.bytes_per_sample() * 8 - 1)) - 1) as f64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AudioHeader {
    pub sample_rate: u32,
    pub channels: u16,
    pub format: AudioFormat,
    pub total_samples: u32,
}

impl AudioHeader {
    pub fn new(sample_rate: u32, channels: u16, format: AudioFormat, total_samples: u32) -> Self {
        Self { sample_rate, channels, format, total_samples }
    }

    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.total_samples as f64 / self.sample_rate as f64
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(RunnerError::classification("Sample rate cannot be 0"));
        }

        if self.channels == 0 || self.channels > 2 {
            return Err(RunnerError::classification("Channel count must be 1 or 2"));
        }

        Ok(())
    }

    pub fn to_wav_spec(&self) -> hound::WavSpec {
        hound::WavSpec {
            channels: self.channels,
            sample_rate: self.sample_rate,
            bits_per_sample: self.format.bytes_per_sample() * 8,
            sample_format: self.format.to_sample_format(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum AudioData {
    Mono(Array1<f32>),
    /// Frames x 2
    Stereo(Array2<f32>),
}

impl AudioData {
    pub fn len(&self) -> usize {
        match self {
            AudioData::Mono(data) => data.len(),
            AudioData::Stereo(data) => data.nrows(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn channels(&self) -> u16 {
        match self {
            AudioData::Mono(_) => 1,
            AudioData::Stereo(_) => 2,
        }
    }

    pub fn to_mono(&self) -> Array1<f32> {
        match self {
            AudioData::Mono(data) => data.clone(),
            AudioData::Stereo(data) => data
                .mean_axis(Axis(1))
                .unwrap_or_else(|| Array1::zeros(0)),
        }
    }

    fn slice_frames(&self, start: usize, end: usize) -> AudioData {
        match self {
            AudioData::Mono(data) => AudioData::Mono(data.slice(s![start..end]).to_owned()),
            AudioData::Stereo(data) => AudioData::Stereo(data.slice(s![start..end, ..]).to_owned()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WavAudio {
    pub header: AudioHeader,
    pub data: AudioData,
}

fn audio_err(context: &str, e: impl std::fmt::Display) -> RunnerError {
    RunnerError::classification(format!("{}: {}", context, e))
}

impl WavAudio {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = File::open(path)
            .map_err(|e| audio_err(&format!("Cannot open audio file {}", path.display()), e))?;

        let mut reader = WavReader::new(file)
            .map_err(|e| audio_err("Cannot create WAV reader", e))?;

        let spec = reader.spec();

        if spec.channels == 0 || spec.channels > 2 {
            return Err(RunnerError::classification("Only mono or stereo audio supported"));
        }

        let encoding = (spec.sample_format, spec.bits_per_sample);
        let (format, samples): (AudioFormat, Vec<f32>) = match encoding {
            (SampleFormat::Int, 16) => {
                let samples = reader.samples::<i16>()
                    .map(|s| s.map(|v| v as f32 / 32767.0))
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|e| audio_err("Failed to read sample", e))?;
                (AudioFormat::Int16, samples)
            }
            (SampleFormat::Int, bits @ (24 | 32)) => {
                let scale = (1i64 << (bits - 1)) as f32;
                let samples = reader.samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|e| audio_err("Failed to read sample", e))?;
                let format = if bits == 24 { AudioFormat::Int24 } else { AudioFormat::Int32 };
                (format, samples)
            }
            (SampleFormat::Float, 32) => {
                let samples = reader.samples::<f32>()
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|e| audio_err("Failed to read sample", e))?;
                (AudioFormat::Float32, samples)
            }
            (format, bits) => {
                return Err(RunnerError::classification(format!(
                    "Unsupported WAV encoding: {:?} {} bit", format, bits
                )));
            }
        };

        let data = if spec.channels == 1 {
            AudioData::Mono(Array1::from(samples))
        } else {
            let frames = samples.len() / 2;
            let mut stereo = Array2::zeros((frames, 2));
            for (i, chunk) in samples.chunks_exact(2).enumerate() {
                stereo[[i, 0]] = chunk[0];
                stereo[[i, 1]] = chunk[1];
            }
            AudioData::Stereo(stereo)
        };

        let header = AudioHeader::new(spec.sample_rate, spec.channels, format, data.len() as u32);
        header.validate()?;

        Ok(WavAudio { header, data })
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = File::create(path)
            .map_err(|e| {
                RunnerError::io(format!("Cannot create output file {}: {}", path.display(), e))
            })?;

        let spec = self.header.to_wav_spec();
        let mut writer = WavWriter::new(file, spec)
            .map_err(|e| RunnerError::io(format!("Cannot create WAV writer: {}", e)))?;

        let samples: Box<dyn Iterator<Item = f32> + '_> = match &self.data {
            AudioData::Mono(data) => Box::new(data.iter().copied()),
            AudioData::Stereo(data) => Box::new(data.iter().copied()),
        };

        for sample in samples {
            let clamped = if sample.is_finite() { sample.clamp(-1.0, 1.0) } else { 0.0 };
            let scale = self.header.format.full_scale();
            let written = match self.header.format {
                AudioFormat::Float32 => writer.write_sample(clamped),
                AudioFormat::Int16 => writer.write_sample((clamped as f64 * scale) as i16),
                AudioFormat::Int24 | AudioFormat::Int32 => {
                    writer.write_sample((clamped as f64 * scale) as i32)
                }
            };
            written.map_err(|e| RunnerError::io(format!("Failed to write sample: {}", e)))?;
        }

        writer.finalize()
            .map_err(|e| RunnerError::io(format!("Failed to finalize WAV writing: {}", e)))?;

        Ok(())
    }

    pub fn new_mono(sample_rate: u32, data: Array1<f32>, format: AudioFormat) -> Self {
        let header = AudioHeader::new(sample_rate, 1, format, data.len() as u32);
        WavAudio { header, data: AudioData::Mono(data) }
    }

    /// Cut `[start_secs, end_secs)` out of the recording, clamped to its bounds.
    pub fn slice_secs(&self, start_secs: f64, end_secs: f64) -> WavAudio {
        let rate = self.sample_rate() as f64;
        let len = self.data.len();
        let start = ((start_secs.max(0.0) * rate) as usize).min(len);
        let end = ((end_secs.max(0.0) * rate) as usize).clamp(start, len);

        let data = self.data.slice_frames(start, end);
        let header = AudioHeader::new(
            self.header.sample_rate,
            self.header.channels,
            self.header.format,
            data.len() as u32,
        );
        WavAudio { header, data }
    }

    pub fn data(&self) -> &AudioData {
        &self.data
    }

    pub fn sample_rate(&self) -> u32 {
        self.header.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.header.channels
    }

    pub fn total_samples(&self) -> u32 {
        self.header.total_samples
    }

    pub fn duration(&self) -> f64 {
        self.header.duration()
    }
}
