//! MIDI input, raw message queue, and translation to sample-accurate events
//!
//! Raw bytes arrive on the midir backend thread at arbitrary wall-clock
//! times. They are stamped against the host clock, queued through a lock-free
//! ring buffer, and drained by the audio callback, which converts each
//! message into a musical event positioned within the current block.

use std::sync::Arc;
use std::time::Instant;

use midir::{Ignore, MidiInput, MidiInputConnection};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use tracing::{debug, info, warn};

use super::error::AudioError;

/// Raw MIDI messages buffered between the input thread and a callback.
const QUEUE_CAPACITY: usize = 512;

// Status nibbles (high 4 bits of the first byte)
const STATUS_NOTE_OFF: u8 = 0x8;
const STATUS_NOTE_ON: u8 = 0x9;
const STATUS_NOTE_AFTERTOUCH: u8 = 0xA;
const STATUS_CONTROL_CHANGE: u8 = 0xB;
const STATUS_CHANNEL_AFTERTOUCH: u8 = 0xD;
const STATUS_PITCH_BEND: u8 = 0xE;

/// Monotonic clock shared by the MIDI input callback and the audio callback.
///
/// midir and cpal timestamps use backend-specific epochs; stamping both sides
/// against one clock keeps message age directly computable.
#[derive(Debug, Clone, Copy)]
pub struct HostClock {
    origin: Instant,
}

impl HostClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Milliseconds since the clock was created.
    pub fn now_ms(&self) -> f64 {
        self.origin.elapsed().as_secs_f64() * 1000.0
    }
}

impl Default for HostClock {
    fn default() -> Self {
        Self::new()
    }
}

/// A raw MIDI message as delivered by the input port: status byte, up to two
/// data bytes, and the host-clock arrival time.
#[derive(Debug, Clone, Copy)]
pub struct RawMidiMessage {
    bytes: [u8; 3],
    len: u8,
    timestamp_ms: f64,
}

impl RawMidiMessage {
    /// Build a message from the input callback's byte slice. Messages longer
    /// than three bytes (sysex) are truncated to the leading bytes; empty
    /// slices yield `None`.
    pub fn from_slice(bytes: &[u8], timestamp_ms: f64) -> Option<Self> {
        if bytes.is_empty() {
            return None;
        }
        let mut buf = [0u8; 3];
        let len = bytes.len().min(3);
        buf[..len].copy_from_slice(&bytes[..len]);
        Some(Self {
            bytes: buf,
            len: len as u8,
            timestamp_ms,
        })
    }

    pub fn status(&self) -> u8 {
        self.bytes[0]
    }

    pub fn data1(&self) -> u8 {
        self.bytes[1]
    }

    pub fn data2(&self) -> u8 {
        self.bytes[2]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn timestamp_ms(&self) -> f64 {
        self.timestamp_ms
    }
}

/// A musical event positioned within the current audio block.
///
/// `sample_offset` is in `[0, frame_count)`; `channel` is the 4-bit MIDI
/// channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MusicalEvent {
    NoteOn {
        sample_offset: u32,
        channel: u8,
        key: u8,
        velocity: u8,
    },
    NoteOff {
        sample_offset: u32,
        channel: u8,
        key: u8,
        velocity: u8,
    },
    NoteAftertouch {
        sample_offset: u32,
        channel: u8,
        key: u8,
        pressure: u8,
    },
    ChannelAftertouch {
        sample_offset: u32,
        channel: u8,
        pressure: u8,
    },
    ControlChange {
        sample_offset: u32,
        channel: u8,
        controller: u8,
        value: u8,
    },
    PitchBend {
        sample_offset: u32,
        channel: u8,
        value: u16,
    },
}

/// Convert a raw message into a musical event positioned within the current
/// block.
///
/// The message's age in samples places it near the end of the block when it
/// arrived recently and at offset 0 when it is a full block old or older.
/// A message cannot be placed further back than one block; that is a design
/// constraint of the one-block timing model, not a precision loss to repair.
///
/// Unrecognized status nibbles are reported and dropped.
pub fn translate(
    msg: &RawMidiMessage,
    now_ms: f64,
    sample_rate: f64,
    frame_count: u32,
) -> Option<MusicalEvent> {
    let event_type = msg.status() >> 4;
    let channel = msg.status() & 0xf;
    let data1 = msg.data1();
    let data2 = msg.data2();

    let delta_ms = (now_ms - msg.timestamp_ms()).max(0.0);
    let delta_samples = (delta_ms * sample_rate / 1000.0).min(frame_count as f64);
    let sample_offset =
        ((frame_count as f64 - delta_samples) as u32).min(frame_count.saturating_sub(1));

    match event_type {
        STATUS_NOTE_ON => Some(MusicalEvent::NoteOn {
            sample_offset,
            channel,
            key: data1,
            velocity: data2,
        }),
        STATUS_NOTE_OFF => Some(MusicalEvent::NoteOff {
            sample_offset,
            channel,
            key: data1,
            velocity: data2,
        }),
        STATUS_NOTE_AFTERTOUCH => Some(MusicalEvent::NoteAftertouch {
            sample_offset,
            channel,
            key: data1,
            pressure: data2,
        }),
        STATUS_CHANNEL_AFTERTOUCH => Some(MusicalEvent::ChannelAftertouch {
            sample_offset,
            channel,
            pressure: data1,
        }),
        STATUS_CONTROL_CHANGE => Some(MusicalEvent::ControlChange {
            sample_offset,
            channel,
            controller: data1,
            value: data2,
        }),
        STATUS_PITCH_BEND => Some(MusicalEvent::PitchBend {
            sample_offset,
            channel,
            value: ((data2 as u16) << 7) | data1 as u16,
        }),
        _ => {
            warn!(event_type, "unknown MIDI event type, dropping message");
            None
        }
    }
}

/// Queue of raw MIDI messages between the input thread and the audio thread.
///
/// The producer side is fed by the midir callback; the consumer side is
/// drained one message at a time by the audio callback. Both ends use
/// `try_lock` so neither thread ever blocks on the other; a contended pop
/// leaves the message for the next block.
pub struct MidiQueue {
    producer: Mutex<ringbuf::HeapProd<RawMidiMessage>>,
    consumer: Mutex<ringbuf::HeapCons<RawMidiMessage>>,
    capacity: usize,
}

impl MidiQueue {
    pub fn new(capacity: usize) -> Self {
        let rb = HeapRb::new(capacity);
        let (producer, consumer) = rb.split();
        Self {
            producer: Mutex::new(producer),
            consumer: Mutex::new(consumer),
            capacity,
        }
    }

    /// Push a message from the input thread. Returns false if the queue is
    /// full or momentarily contended; the message is dropped either way.
    #[inline]
    pub fn push(&self, msg: RawMidiMessage) -> bool {
        if let Some(mut producer) = self.producer.try_lock() {
            if producer.try_push(msg).is_ok() {
                return true;
            }
            debug!(capacity = self.capacity, "MIDI queue full, message dropped");
        }
        false
    }

    /// Pop one pending message without blocking. `None` when the queue is
    /// empty or the consumer lock is contended.
    #[inline]
    pub fn pop(&self) -> Option<RawMidiMessage> {
        self.consumer.try_lock()?.try_pop()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.consumer
            .try_lock()
            .map(|c| c.is_empty())
            .unwrap_or(true)
    }
}

impl Default for MidiQueue {
    fn default() -> Self {
        Self::new(QUEUE_CAPACITY)
    }
}

/// Information about a MIDI input port
#[derive(Debug, Clone, serde::Serialize)]
pub struct MidiPortInfo {
    /// Port index (for connection)
    pub index: usize,
    /// Port name
    pub name: String,
}

/// List available MIDI input ports
pub fn list_midi_inputs() -> Result<Vec<MidiPortInfo>, AudioError> {
    let midi_in =
        MidiInput::new("soloist-enumerate").map_err(|e| AudioError::MidiUnavailable(e.to_string()))?;

    let ports = midi_in.ports();
    let mut infos = Vec::with_capacity(ports.len());
    for (index, port) in ports.iter().enumerate() {
        let name = midi_in
            .port_name(port)
            .unwrap_or_else(|_| format!("Unknown Port {}", index));
        infos.push(MidiPortInfo { index, name });
    }
    Ok(infos)
}

/// Open a MIDI input port and start pumping raw messages into `queue`.
///
/// The returned connection must be kept alive for the port to stay open;
/// dropping it closes the port.
pub fn open_input(
    port_index: Option<usize>,
    clock: HostClock,
    queue: Arc<MidiQueue>,
) -> Result<MidiInputConnection<()>, AudioError> {
    let mut midi_in =
        MidiInput::new("soloist").map_err(|e| AudioError::MidiUnavailable(e.to_string()))?;
    midi_in.ignore(Ignore::None);

    let ports = midi_in.ports();
    if ports.is_empty() {
        return Err(AudioError::MidiUnavailable("no MIDI input ports".into()));
    }
    let index = port_index.unwrap_or(0);
    let port = ports
        .get(index)
        .ok_or_else(|| AudioError::MidiUnavailable(format!("port index {} not found", index)))?;

    let port_name = midi_in
        .port_name(port)
        .unwrap_or_else(|_| format!("Port {}", index));

    let connection = midi_in
        .connect(
            port,
            "soloist-midi-in",
            // The midir timestamp uses a backend-specific epoch; stamp against
            // the host clock so the audio callback can compare directly.
            move |_timestamp, bytes, _| {
                if let Some(msg) = RawMidiMessage::from_slice(bytes, clock.now_ms()) {
                    queue.push(msg);
                }
            },
            (),
        )
        .map_err(|e| AudioError::MidiUnavailable(e.to_string()))?;

    info!(port = %port_name, "MIDI input connected");
    Ok(connection)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(bytes: &[u8], timestamp_ms: f64) -> RawMidiMessage {
        RawMidiMessage::from_slice(bytes, timestamp_ms).unwrap()
    }

    #[test]
    fn test_note_on_with_zero_latency_lands_at_end_of_block() {
        // Channel 1, key 60, velocity 100, arriving exactly "now":
        // the unclamped offset equals the frame count and is pulled back to
        // the last valid sample of the block.
        let msg = raw(&[0x91, 0x3C, 0x64], 100.0);
        let event = translate(&msg, 100.0, 48_000.0, 256).unwrap();
        assert_eq!(
            event,
            MusicalEvent::NoteOn {
                sample_offset: 255,
                channel: 1,
                key: 60,
                velocity: 100,
            }
        );
    }

    #[test]
    fn test_message_older_than_one_block_clamps_to_zero() {
        // 256 frames at 48kHz is ~5.33ms; a 50ms-old message is far older
        // than one block and must land at offset 0, never negative.
        let msg = raw(&[0x90, 0x40, 0x7F], 0.0);
        let event = translate(&msg, 50.0, 48_000.0, 256).unwrap();
        match event {
            MusicalEvent::NoteOn { sample_offset, .. } => assert_eq!(sample_offset, 0),
            other => panic!("expected NoteOn, got {:?}", other),
        }
    }

    #[test]
    fn test_offset_is_always_within_block() {
        let frame_count = 128;
        for age_ms in [0.0, 0.5, 1.0, 2.0, 2.66, 3.0, 10.0, 1000.0] {
            let msg = raw(&[0x90, 0x40, 0x60], 0.0);
            let event = translate(&msg, age_ms, 48_000.0, frame_count).unwrap();
            let offset = match event {
                MusicalEvent::NoteOn { sample_offset, .. } => sample_offset,
                other => panic!("expected NoteOn, got {:?}", other),
            };
            assert!(offset < frame_count, "offset {} at age {}ms", offset, age_ms);
        }
    }

    #[test]
    fn test_future_stamped_message_is_not_past_block_end() {
        // A timestamp ahead of the callback clock clamps the age at zero.
        let msg = raw(&[0x90, 0x40, 0x60], 10.0);
        let event = translate(&msg, 5.0, 48_000.0, 64).unwrap();
        match event {
            MusicalEvent::NoteOn { sample_offset, .. } => assert_eq!(sample_offset, 63),
            other => panic!("expected NoteOn, got {:?}", other),
        }
    }

    #[test]
    fn test_pitch_bend_center() {
        let msg = raw(&[0xE3, 0x00, 0x40], 0.0);
        let event = translate(&msg, 0.0, 48_000.0, 64).unwrap();
        assert_eq!(
            event,
            MusicalEvent::PitchBend {
                sample_offset: 63,
                channel: 3,
                value: 0x2000,
            }
        );
    }

    #[test]
    fn test_note_off_and_aftertouch_decode() {
        let off = translate(&raw(&[0x85, 0x30, 0x10], 0.0), 0.0, 48_000.0, 32).unwrap();
        assert_eq!(
            off,
            MusicalEvent::NoteOff {
                sample_offset: 31,
                channel: 5,
                key: 0x30,
                velocity: 0x10,
            }
        );

        let poly = translate(&raw(&[0xA2, 0x3C, 0x50], 0.0), 0.0, 48_000.0, 32).unwrap();
        assert_eq!(
            poly,
            MusicalEvent::NoteAftertouch {
                sample_offset: 31,
                channel: 2,
                key: 0x3C,
                pressure: 0x50,
            }
        );

        let channel_at = translate(&raw(&[0xD7, 0x22], 0.0), 0.0, 48_000.0, 32).unwrap();
        assert_eq!(
            channel_at,
            MusicalEvent::ChannelAftertouch {
                sample_offset: 31,
                channel: 7,
                pressure: 0x22,
            }
        );
    }

    #[test]
    fn test_control_change_decode() {
        let cc = translate(&raw(&[0xB0, 0x07, 0x65], 0.0), 0.0, 48_000.0, 32).unwrap();
        assert_eq!(
            cc,
            MusicalEvent::ControlChange {
                sample_offset: 31,
                channel: 0,
                controller: 7,
                value: 0x65,
            }
        );
    }

    #[test]
    fn test_unknown_event_type_is_dropped() {
        // Program change (0xC) is not part of the recognized set.
        let msg = raw(&[0xC0, 0x05], 0.0);
        assert!(translate(&msg, 0.0, 48_000.0, 64).is_none());
    }

    #[test]
    fn test_raw_message_truncates_long_input() {
        let msg = RawMidiMessage::from_slice(&[0xF0, 1, 2, 3, 4, 5], 0.0).unwrap();
        assert_eq!(msg.len(), 3);
        assert_eq!(msg.status(), 0xF0);
        assert!(RawMidiMessage::from_slice(&[], 0.0).is_none());
    }

    #[test]
    fn test_queue_preserves_arrival_order() {
        let queue = MidiQueue::new(16);
        assert!(queue.push(raw(&[0x90, 60, 100], 1.0)));
        assert!(queue.push(raw(&[0x80, 60, 0], 2.0)));
        assert!(queue.push(raw(&[0xB0, 1, 64], 3.0)));

        assert_eq!(queue.pop().unwrap().status(), 0x90);
        assert_eq!(queue.pop().unwrap().status(), 0x80);
        assert_eq!(queue.pop().unwrap().status(), 0xB0);
        assert!(queue.pop().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_queue_overflow_drops_new_messages() {
        let queue = MidiQueue::new(2);
        assert!(queue.push(raw(&[0x90, 60, 100], 0.0)));
        assert!(queue.push(raw(&[0x90, 61, 100], 0.0)));
        assert!(!queue.push(raw(&[0x90, 62, 100], 0.0)));

        assert_eq!(queue.pop().unwrap().data1(), 60);
        assert_eq!(queue.pop().unwrap().data1(), 61);
        assert!(queue.pop().is_none());
    }
}
