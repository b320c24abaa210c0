//! Engine settings supplied by the surrounding application
//!
//! The engine treats these as read-only inputs at `start()` time; persistence
//! and any selection UI belong to the application.

use serde::{Deserialize, Serialize};

/// Default sample rate in Hz
const DEFAULT_SAMPLE_RATE: u32 = 48_000;

/// Default block size in samples (256 samples @ 48kHz = 5.33ms)
const DEFAULT_BUFFER_SIZE: u32 = 256;

/// Audio output selection and stream parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AudioSettings {
    /// Audio API name (None = system default host)
    #[serde(default)]
    pub api: Option<String>,

    /// Output device index within the API (None = default device)
    #[serde(default)]
    pub device: Option<usize>,

    /// Sample rate in Hz
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Preferred block size in samples
    #[serde(default = "default_buffer_size")]
    pub buffer_size: u32,
}

fn default_sample_rate() -> u32 {
    DEFAULT_SAMPLE_RATE
}

fn default_buffer_size() -> u32 {
    DEFAULT_BUFFER_SIZE
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            api: None,
            device: None,
            sample_rate: DEFAULT_SAMPLE_RATE,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// MIDI input selection
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MidiSettings {
    /// Input port index (None = first available port)
    #[serde(default)]
    pub port: Option<usize>,
}

/// Everything the engine reads at `start()` time
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineSettings {
    #[serde(default)]
    pub audio: AudioSettings,

    #[serde(default)]
    pub midi: MidiSettings,
}

impl EngineSettings {
    /// Validate the settings values
    ///
    /// Returns an error message if any value is invalid.
    pub fn validate(&self) -> Result<(), String> {
        if ![32, 64, 128, 256, 512, 1024].contains(&self.audio.buffer_size) {
            return Err(format!(
                "Invalid buffer size: {}. Valid values are 32, 64, 128, 256, 512, 1024",
                self.audio.buffer_size
            ));
        }

        if !(8_000..=192_000).contains(&self.audio.sample_rate) {
            return Err(format!(
                "Invalid sample rate: {}. Must be between 8000 and 192000 Hz",
                self.audio.sample_rate
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = EngineSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.audio.sample_rate, 48_000);
        assert_eq!(settings.audio.buffer_size, 256);
        assert!(settings.midi.port.is_none());
    }

    #[test]
    fn test_rejects_odd_buffer_size() {
        let mut settings = EngineSettings::default();
        settings.audio.buffer_size = 100;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_rejects_out_of_range_sample_rate() {
        let mut settings = EngineSettings::default();
        settings.audio.sample_rate = 1_000_000;
        assert!(settings.validate().is_err());
    }
}
