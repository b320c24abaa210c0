//! Engine lifecycle tests
//!
//! These run without audio or MIDI hardware: they exercise the recovery
//! paths, the state machine, and resource accounting through the public API.

use std::path::Path;

use soloist::audio::{AudioEngine, AudioError, StreamState};
use soloist::settings::{AudioSettings, EngineSettings, MidiSettings};

fn settings_with_bogus_audio_api() -> EngineSettings {
    EngineSettings {
        audio: AudioSettings {
            api: Some("no-such-audio-api".into()),
            device: None,
            sample_rate: 48_000,
            buffer_size: 256,
        },
        midi: MidiSettings { port: None },
    }
}

/// Test: a failed start always recovers to Stopped
/// Given an audio API that does not exist
/// When start() is called
/// Then the engine is Stopped with no buffers held
#[test]
fn test_failed_start_recovers_to_stopped() {
    let mut engine = AudioEngine::new(settings_with_bogus_audio_api());
    assert_eq!(engine.state(), StreamState::Stopped);

    engine.start();

    assert_eq!(engine.state(), StreamState::Stopped);
    assert!(!engine.is_running());
    assert!(!engine.buffers_allocated());
}

/// Test: start/stop cycles do not accumulate resources
#[test]
fn test_repeated_failed_starts_leave_no_buffers() {
    let mut engine = AudioEngine::new(settings_with_bogus_audio_api());
    for _ in 0..3 {
        engine.start();
        assert_eq!(engine.state(), StreamState::Stopped);
        assert!(!engine.buffers_allocated());
        engine.stop();
    }
}

/// Test: a nonexistent output device index aborts the start
#[test]
fn test_unknown_device_index_aborts_start() {
    let settings = EngineSettings {
        audio: AudioSettings {
            api: None,
            device: Some(9_999),
            sample_rate: 48_000,
            buffer_size: 256,
        },
        midi: MidiSettings { port: None },
    };
    let mut engine = AudioEngine::new(settings);
    engine.start();
    assert_eq!(engine.state(), StreamState::Stopped);
    assert!(!engine.buffers_allocated());
}

/// Test: stop() when already Stopped is a harmless no-op
#[test]
fn test_stop_when_stopped_is_noop() {
    let mut engine = AudioEngine::new(EngineSettings::default());
    engine.stop();
    engine.stop();
    assert_eq!(engine.state(), StreamState::Stopped);
    assert!(!engine.buffers_allocated());
    assert_eq!(engine.steady_time(), 0);
}

/// Test: loading a missing plugin surfaces an error and keeps no handle
#[test]
fn test_plugin_load_failure_is_reported() {
    let mut engine = AudioEngine::new(EngineSettings::default());
    let err = engine
        .load_plugin(Path::new("/nonexistent/instrument.clap"), 0)
        .unwrap_err();
    assert!(matches!(err, AudioError::PluginError(_)));
    assert!(!engine.has_plugin());
    assert!(engine.plugin_info().is_none());
}

/// Test: unknown plugin extensions are rejected before any loading
#[test]
fn test_unknown_plugin_format_is_rejected() {
    let mut engine = AudioEngine::new(EngineSettings::default());
    let err = engine
        .load_plugin(Path::new("/tmp/not-a-plugin.txt"), 0)
        .unwrap_err();
    assert!(matches!(err, AudioError::PluginError(_)));
}

/// Test: unloading with nothing loaded does not crash
#[test]
fn test_unload_without_plugin_is_noop() {
    let mut engine = AudioEngine::new(EngineSettings::default());
    engine.unload_plugin();
    assert!(!engine.has_plugin());
    assert!(!engine.buffers_allocated());
}

/// Test: idle ticks are safe in every lifecycle state
#[test]
fn test_idle_is_safe_without_stream_or_plugin() {
    let mut engine = AudioEngine::new(settings_with_bogus_audio_api());
    engine.idle();
    engine.start();
    engine.idle();
    engine.stop();
    engine.idle();
}
