//! Audio plugin hosting module
//!
//! Defines the contract between the engine and a hosted plugin, and loads
//! plugin backends by path and index. CLAP is implemented; VST3 is recognized
//! but rejected.

mod clap_host;

pub use clap_host::{ClapPluginInstance, ClapPluginLoader};

use std::path::Path;

use tracing::info;

use super::error::AudioError;

/// Plugin format types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginFormat {
    /// CLAP plugin format
    Clap,
    /// VST3 plugin format
    Vst3,
}

/// Plugin information
#[derive(Debug, Clone)]
pub struct PluginInfo {
    pub name: String,
    pub vendor: String,
    pub version: String,
    pub format: PluginFormat,
    pub path: String,
    pub uid: String,
}

/// Opaque platform window handle passed through to an embedded plugin UI.
/// The engine never interprets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentWindow(pub usize);

/// The contract a hosted plugin exposes to the engine.
///
/// The engine guarantees: `set_ports` and `activate` are called exactly once
/// per successful stream start, before any `process`; `process_begin` is
/// called once per block before any event injection; all injections for a
/// block happen before that block's `process`; `deactivate` happens before
/// the scratch buffers are released.
pub trait AudioPlugin: Send {
    /// Get plugin information
    fn info(&self) -> &PluginInfo;

    /// Declare the channel layout the engine will process with
    fn set_ports(&mut self, inputs: u32, outputs: u32);

    /// Activate for processing at the negotiated rate and block size
    fn activate(&mut self, sample_rate: f64, max_block_size: u32) -> Result<(), AudioError>;

    /// Deactivate; safe to call when not activated
    fn deactivate(&mut self);

    /// Open the framing for one block of `frame_count` frames
    fn process_begin(&mut self, frame_count: u32);

    /// Inject a note-on at `sample_offset` within the current block
    fn note_on(&mut self, sample_offset: u32, channel: u8, key: u8, velocity: u8);

    /// Inject a note-off at `sample_offset` within the current block
    fn note_off(&mut self, sample_offset: u32, channel: u8, key: u8, velocity: u8);

    /// Inject polyphonic aftertouch at `sample_offset`
    fn note_aftertouch(&mut self, sample_offset: u32, channel: u8, key: u8, pressure: u8);

    /// Inject a control change at `sample_offset`
    fn control_change(&mut self, sample_offset: u32, channel: u8, controller: u8, value: u8);

    /// Inject a 14-bit pitch bend at `sample_offset`
    fn pitch_bend(&mut self, sample_offset: u32, channel: u8, value: u16);

    /// Process one block over planar channel slices. Must complete within
    /// the block's real-time budget.
    fn process(&mut self, inputs: &[&[f32]], outputs: &mut [&mut [f32]]);

    /// Hand over the parent window handle for any embedded UI
    fn set_parent_window(&mut self, parent: ParentWindow);

    /// Non-real-time housekeeping, driven from the control context
    fn idle(&mut self);
}

/// Detect the plugin format from a file path
pub fn detect_format(path: &Path) -> Option<PluginFormat> {
    match path.extension().and_then(|e| e.to_str())? {
        "clap" => Some(PluginFormat::Clap),
        "vst3" => Some(PluginFormat::Vst3),
        #[cfg(target_os = "linux")]
        "so" => Some(PluginFormat::Clap),
        _ => None,
    }
}

/// Load a plugin by path and index and return it ready for activation.
pub fn load_plugin(path: &Path, index: u32) -> Result<Box<dyn AudioPlugin>, AudioError> {
    let format = detect_format(path).ok_or_else(|| {
        AudioError::PluginError(format!("unknown plugin format: {}", path.display()))
    })?;

    match format {
        PluginFormat::Clap => {
            let loader = ClapPluginLoader::new(path)?;
            let plugin = loader.instantiate(index)?;
            info!(name = %plugin.info().name, index, "plugin loaded");
            Ok(Box::new(plugin))
        }
        PluginFormat::Vst3 => Err(AudioError::PluginError(
            "VST3 plugin loading not implemented".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_detection() {
        assert_eq!(
            detect_format(Path::new("/plugins/synth.clap")),
            Some(PluginFormat::Clap)
        );
        assert_eq!(
            detect_format(Path::new("/plugins/synth.vst3")),
            Some(PluginFormat::Vst3)
        );
        assert_eq!(detect_format(Path::new("/plugins/readme.txt")), None);
        assert_eq!(detect_format(Path::new("noextension")), None);
    }

    #[test]
    fn test_load_missing_file_is_reported() {
        let err = load_plugin(Path::new("/nonexistent/missing.clap"), 0).err().unwrap();
        assert!(matches!(err, AudioError::PluginError(_)));
    }

    #[test]
    fn test_vst3_is_rejected() {
        let err = load_plugin(Path::new("/plugins/synth.vst3"), 0).err().unwrap();
        assert!(matches!(err, AudioError::PluginError(_)));
    }
}
