//! Audio Module
//!
//! WAV reading/writing, sample-rate conversion and spectrogram rendering.

pub mod wav;
pub mod converter;
pub mod spectrogram;

pub use wav::{WavAudio, AudioFormat, AudioHeader, AudioData};
pub use converter::AudioConverter;
pub use spectrogram::{Spectrogram, SpectrogramConfig};
