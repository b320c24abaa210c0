//! Stream controller and real-time render path
//!
//! Owns the hardware output stream, the MIDI input connection, and the
//! hosted plugin's lifecycle. The control context drives `start`/`stop`;
//! the driver-managed audio thread runs `render_block` once per block and
//! must never block or allocate.

use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::buffers::{self, BufferSet, CHANNELS, PREROLL_FRAMES};
use super::device;
use super::error::AudioError;
use super::midi::{self, HostClock, MidiQueue, MusicalEvent};
use super::plugin::{self, AudioPlugin, ParentWindow, PluginInfo};
use crate::settings::EngineSettings;

/// Lifecycle state of the hardware stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    /// No stream; the initial state and the result of every `stop`
    Stopped,
    /// Stream open, callbacks flowing
    Running,
    /// Stop requested; the callback performs one final block
    Stopping,
}

impl StreamState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => StreamState::Stopped,
            1 => StreamState::Running,
            2 => StreamState::Stopping,
            _ => unreachable!("invalid stream state {}", v),
        }
    }
}

/// What the callback tells the driver after a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockOutcome {
    Continue,
    Halt,
}

/// State shared between the control context and the audio thread.
///
/// Everything here is an atomic, a ring buffer, or a mutex the audio thread
/// only ever `try_lock`s.
pub(crate) struct SharedState {
    state: AtomicU8,
    /// Stream epoch, bumped at every start; a callback holding a stale epoch
    /// goes silent instead of touching freed state.
    generation: AtomicU64,
    /// Monotonic sample counter across blocks
    steady_time: AtomicI64,
    buffers: Mutex<BufferSet>,
    plugin: Mutex<Option<Box<dyn AudioPlugin>>>,
    midi_queue: Arc<MidiQueue>,
    clock: HostClock,
}

impl SharedState {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(StreamState::Stopped as u8),
            generation: AtomicU64::new(0),
            steady_time: AtomicI64::new(0),
            buffers: Mutex::new(BufferSet::new()),
            plugin: Mutex::new(None),
            midi_queue: Arc::new(MidiQueue::default()),
            clock: HostClock::new(),
        }
    }

    fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: StreamState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

fn silence(output: &mut [f32]) {
    output.fill(0.0);
}

fn forward_event(plugin: &mut dyn AudioPlugin, event: MusicalEvent) {
    match event {
        MusicalEvent::NoteOn {
            sample_offset,
            channel,
            key,
            velocity,
        } => plugin.note_on(sample_offset, channel, key, velocity),
        MusicalEvent::NoteOff {
            sample_offset,
            channel,
            key,
            velocity,
        } => plugin.note_off(sample_offset, channel, key, velocity),
        MusicalEvent::NoteAftertouch {
            sample_offset,
            channel,
            key,
            pressure,
        } => plugin.note_aftertouch(sample_offset, channel, key, pressure),
        MusicalEvent::ControlChange {
            sample_offset,
            channel,
            controller,
            value,
        } => plugin.control_change(sample_offset, channel, controller, value),
        MusicalEvent::PitchBend {
            sample_offset,
            channel,
            value,
        } => plugin.pitch_bend(sample_offset, channel, value),
        MusicalEvent::ChannelAftertouch { channel, pressure, .. } => {
            // Decoded but never forwarded; the hosted unit gets no
            // channel-pressure call. Kept as an explicit gap.
            debug!(channel, pressure, "channel aftertouch not forwarded");
        }
    }
}

/// Process one hardware block.
///
/// `output` is the stereo interleaved device buffer; `input`, when present,
/// is a stereo interleaved capture buffer of the same frame count. `nframes`
/// is the block size negotiated at stream open; a mismatch is a
/// driver/configuration contract breach and fatal.
pub(crate) fn render_block(
    shared: &SharedState,
    input: Option<&[f32]>,
    output: &mut [f32],
    nframes: u32,
    sample_rate: f64,
) -> BlockOutcome {
    // A callback delivered between the final block and stream teardown sees
    // Stopped here; keep silent until the driver stops calling.
    if shared.state() == StreamState::Stopped {
        silence(output);
        return BlockOutcome::Halt;
    }

    let frame_count = (output.len() / CHANNELS) as u32;

    let mut buffer_guard = match shared.buffers.try_lock() {
        Some(guard) => guard,
        None => {
            silence(output);
            return BlockOutcome::Continue;
        }
    };
    let mut plugin_guard = match shared.plugin.try_lock() {
        Some(guard) => guard,
        None => {
            silence(output);
            return BlockOutcome::Continue;
        }
    };

    assert!(
        buffer_guard.capacity() >= frame_count as usize,
        "audio callback entered with released or undersized buffers"
    );
    assert_eq!(
        frame_count, nframes,
        "driver delivered an unexpected block size"
    );

    let frames = frame_count as usize;

    if let Some(interleaved) = input {
        let [left, right] = buffer_guard
            .inputs_mut(frames)
            .expect("input scratch channels missing");
        buffers::deinterleave_stereo(interleaved, left, right);
    }

    if let Some(p) = plugin_guard.as_mut() {
        p.process_begin(frame_count);
    }

    // Drain pending MIDI one message at a time and forward in arrival order.
    let now_ms = shared.clock.now_ms();
    while let Some(raw) = shared.midi_queue.pop() {
        let Some(event) = midi::translate(&raw, now_ms, sample_rate, frame_count) else {
            continue;
        };
        match plugin_guard.as_mut() {
            Some(p) => forward_event(p.as_mut(), event),
            None => debug!(?event, "no plugin loaded, event discarded"),
        }
    }

    if let Some(p) = plugin_guard.as_mut() {
        let (inputs, mut outputs) = buffer_guard
            .split_at(frames)
            .expect("scratch channels missing");
        p.process(&inputs, &mut outputs);
    }

    {
        let (_, [out_left, out_right]) = buffer_guard
            .split_at(frames)
            .expect("output scratch channels missing");
        buffers::interleave_stereo(out_left, out_right, output);
    }

    shared
        .steady_time
        .fetch_add(frame_count as i64, Ordering::AcqRel);

    match shared.state() {
        StreamState::Running => BlockOutcome::Continue,
        StreamState::Stopping => {
            shared.set_state(StreamState::Stopped);
            BlockOutcome::Halt
        }
        // stop() forced Stopped while this block was in flight
        StreamState::Stopped => BlockOutcome::Halt,
    }
}

/// The audio/MIDI execution core: one hardware stream, one MIDI input, one
/// hosted plugin.
pub struct AudioEngine {
    settings: EngineSettings,
    shared: Arc<SharedState>,
    stream: Option<cpal::Stream>,
    midi_in: Option<midir::MidiInputConnection<()>>,
    parent_window: Option<ParentWindow>,
    block_size: u32,
    sample_rate: u32,
}

impl AudioEngine {
    /// Create a stopped engine with the given settings
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            settings,
            shared: Arc::new(SharedState::new()),
            stream: None,
            midi_in: None,
            parent_window: None,
            block_size: 0,
            sample_rate: 0,
        }
    }

    pub fn state(&self) -> StreamState {
        self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == StreamState::Running
    }

    /// Samples processed since the last start
    pub fn steady_time(&self) -> i64 {
        self.shared.steady_time.load(Ordering::Acquire)
    }

    /// Whether the scratch channels are currently allocated
    pub fn buffers_allocated(&self) -> bool {
        self.shared.buffers.lock().is_allocated()
    }

    /// Start the MIDI input and the hardware stream.
    ///
    /// MIDI failures are recovered locally (the engine runs without MIDI).
    /// Audio failures force a full `stop`, leaving the engine `Stopped`;
    /// the caller observes failure only through the resulting state.
    ///
    /// # Panics
    ///
    /// Panics if the engine is not `Stopped`; calling `start` twice is a
    /// programming error, not a recoverable condition.
    pub fn start(&mut self) {
        assert_eq!(
            self.state(),
            StreamState::Stopped,
            "start() requires a stopped engine"
        );

        match midi::open_input(
            self.settings.midi.port,
            self.shared.clock,
            self.shared.midi_queue.clone(),
        ) {
            Ok(connection) => self.midi_in = Some(connection),
            Err(e) => warn!(error = %e, "running without MIDI input"),
        }

        if let Err(e) = self.open_stream() {
            warn!(error = %e, "audio stream failed to start, stopping engine");
            self.stop();
        }
    }

    fn open_stream(&mut self) -> Result<(), AudioError> {
        let device = device::resolve_output_device(
            self.settings.audio.api.as_deref(),
            self.settings.audio.device,
        )?;
        let device_name = device.name().unwrap_or_default();

        let sample_rate = self.settings.audio.sample_rate;
        let block_size = self.settings.audio.buffer_size;

        let stream_config = StreamConfig {
            channels: CHANNELS as u16,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Fixed(block_size),
        };

        // The stream may call back immediately after opening, so scratch
        // memory must exist before the true block size is observable.
        self.shared.buffers.lock().allocate(PREROLL_FRAMES);
        self.shared.steady_time.store(0, Ordering::Release);

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let shared = Arc::clone(&self.shared);
        let nframes = block_size;
        let rate = sample_rate as f64;

        let stream = device
            .build_output_stream(
                &stream_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    if shared.generation.load(Ordering::Acquire) != generation {
                        data.fill(0.0);
                        return;
                    }
                    let _ = render_block(&shared, None, data, nframes, rate);
                },
                move |err| error!("audio stream error: {}", err),
                None,
            )
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        self.block_size = block_size;
        self.sample_rate = sample_rate;
        self.shared.set_state(StreamState::Running);

        // Wire the scratch channels into the plugin and bring it up at the
        // negotiated rate before the first block.
        if let Some(p) = self.shared.plugin.lock().as_mut() {
            p.set_ports(CHANNELS as u32, CHANNELS as u32);
            p.activate(rate, block_size)?;
        }

        stream
            .play()
            .map_err(|e| AudioError::StreamError(e.to_string()))?;
        self.stream = Some(stream);

        info!(device = %device_name, sample_rate, block_size, "audio stream running");
        Ok(())
    }

    /// Stop the stream and release every resource.
    ///
    /// Safe from any state: this is also the recovery path for a failed
    /// `start`, and a no-op when already stopped. Always leaves the engine
    /// `Stopped` with the scratch channels released.
    pub fn stop(&mut self) {
        if let Some(p) = self.shared.plugin.lock().as_mut() {
            p.deactivate();
        }

        let _ = self.shared.state.compare_exchange(
            StreamState::Running as u8,
            StreamState::Stopping as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        // Dropping the stream stops callback delivery before any resource
        // below is torn down.
        if let Some(stream) = self.stream.take() {
            drop(stream);
        }

        // Dropping the connection closes the port
        if let Some(midi_in) = self.midi_in.take() {
            drop(midi_in);
        }

        self.shared.buffers.lock().release();
        self.shared.set_state(StreamState::Stopped);
        debug!("engine stopped");
    }

    /// Load a plugin by path and index and hand it the parent window handle.
    pub fn load_plugin(&mut self, path: &Path, index: u32) -> Result<(), AudioError> {
        let mut plugin = plugin::load_plugin(path, index)?;

        if let Some(parent) = self.parent_window {
            plugin.set_parent_window(parent);
        }

        // A plugin loaded into a running stream is brought up at the
        // negotiated rate before it sees its first block.
        if self.state() == StreamState::Running {
            plugin.set_ports(CHANNELS as u32, CHANNELS as u32);
            plugin.activate(self.sample_rate as f64, self.block_size)?;
        }

        *self.shared.plugin.lock() = Some(plugin);
        Ok(())
    }

    /// Unload the hosted plugin, releasing the scratch channels when no
    /// stream holds them.
    pub fn unload_plugin(&mut self) {
        if let Some(mut plugin) = self.shared.plugin.lock().take() {
            plugin.deactivate();
            info!(name = %plugin.info().name, "plugin unloaded");
        }
        if self.state() == StreamState::Stopped {
            self.shared.buffers.lock().release();
        }
    }

    /// Information about the loaded plugin, if any
    pub fn plugin_info(&self) -> Option<PluginInfo> {
        self.shared.plugin.lock().as_ref().map(|p| p.info().clone())
    }

    pub fn has_plugin(&self) -> bool {
        self.shared.plugin.lock().is_some()
    }

    /// Record the parent window handle and forward it to a loaded plugin
    pub fn set_parent_window(&mut self, parent: ParentWindow) {
        self.parent_window = Some(parent);
        if let Some(p) = self.shared.plugin.lock().as_mut() {
            p.set_parent_window(parent);
        }
    }

    /// Non-real-time plugin housekeeping; drive this at ~30 Hz from the
    /// control context.
    pub fn idle(&self) {
        if let Some(p) = self.shared.plugin.lock().as_mut() {
            p.idle();
        }
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        self.stop();
        self.unload_plugin();
    }
}
