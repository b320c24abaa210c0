//! Audio engine module
//!
//! Owns the hardware stream, the MIDI input, the scratch buffers, and the
//! hosted plugin's lifecycle.

mod buffers;
mod device;
mod engine;
mod error;
mod midi;
pub mod plugin;

pub use buffers::{deinterleave_stereo, interleave_stereo, BufferSet, CHANNELS, PREROLL_FRAMES};
pub use device::{list_host_apis, list_output_devices, resolve_output_device, AudioDeviceInfo};
pub use engine::{AudioEngine, StreamState};
pub use error::AudioError;
pub use midi::{
    list_midi_inputs, translate, HostClock, MidiPortInfo, MidiQueue, MusicalEvent, RawMidiMessage,
};
