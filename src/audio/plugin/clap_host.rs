//! CLAP plugin host backend
//!
//! Loads and drives CLAP (CLever Audio Plugin) format plugins.
//! CLAP specification: https://github.com/free-audio/clap

use std::ffi::{c_char, c_void, CStr, CString};
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

use libloading::{Library, Symbol};
use tracing::{debug, info};

use super::{AudioPlugin, ParentWindow, PluginFormat, PluginInfo};
use crate::audio::error::AudioError;

// CLAP C API types (the essentials; full headers carry more fields)

/// CLAP version structure
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ClapVersion {
    pub major: u32,
    pub minor: u32,
    pub revision: u32,
}

/// CLAP plugin descriptor
#[repr(C)]
pub struct ClapPluginDescriptor {
    pub clap_version: ClapVersion,
    pub id: *const c_char,
    pub name: *const c_char,
    pub vendor: *const c_char,
    pub url: *const c_char,
    pub manual_url: *const c_char,
    pub support_url: *const c_char,
    pub version: *const c_char,
    pub description: *const c_char,
    pub features: *const *const c_char,
}

/// CLAP host structure
#[repr(C)]
pub struct ClapHost {
    pub clap_version: ClapVersion,
    pub host_data: *mut c_void,
    pub name: *const c_char,
    pub vendor: *const c_char,
    pub url: *const c_char,
    pub version: *const c_char,
    pub get_extension: Option<extern "C" fn(*const ClapHost, *const c_char) -> *const c_void>,
    pub request_restart: Option<extern "C" fn(*const ClapHost)>,
    pub request_process: Option<extern "C" fn(*const ClapHost)>,
    pub request_callback: Option<extern "C" fn(*const ClapHost)>,
}

/// CLAP plugin structure
#[repr(C)]
pub struct ClapPlugin {
    pub desc: *const ClapPluginDescriptor,
    pub plugin_data: *mut c_void,
    pub init: Option<extern "C" fn(*const ClapPlugin) -> bool>,
    pub destroy: Option<extern "C" fn(*const ClapPlugin)>,
    pub activate: Option<
        extern "C" fn(
            *const ClapPlugin,
            sample_rate: f64,
            min_frames: u32,
            max_frames: u32,
        ) -> bool,
    >,
    pub deactivate: Option<extern "C" fn(*const ClapPlugin)>,
    pub start_processing: Option<extern "C" fn(*const ClapPlugin) -> bool>,
    pub stop_processing: Option<extern "C" fn(*const ClapPlugin)>,
    pub reset: Option<extern "C" fn(*const ClapPlugin)>,
    pub process: Option<extern "C" fn(*const ClapPlugin, *const ClapProcess) -> ClapProcessStatus>,
    pub get_extension: Option<extern "C" fn(*const ClapPlugin, *const c_char) -> *const c_void>,
    pub on_main_thread: Option<extern "C" fn(*const ClapPlugin)>,
}

/// CLAP process status
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClapProcessStatus {
    Error = 0,
    Continue = 1,
    ContinueIfNotQuiet = 2,
    Tail = 3,
    Sleep = 4,
}

/// CLAP process structure
#[repr(C)]
pub struct ClapProcess {
    pub steady_time: i64,
    pub frames_count: u32,
    pub transport: *const c_void,
    pub audio_inputs: *const ClapAudioBuffer,
    pub audio_outputs: *mut ClapAudioBuffer,
    pub audio_inputs_count: u32,
    pub audio_outputs_count: u32,
    pub in_events: *const ClapInputEvents,
    pub out_events: *const ClapOutputEvents,
}

/// CLAP audio buffer
#[repr(C)]
pub struct ClapAudioBuffer {
    pub data32: *mut *mut f32,
    pub data64: *mut *mut f64,
    pub channel_count: u32,
    pub latency: u32,
    pub constant_mask: u64,
}

/// CLAP plugin entry point
#[repr(C)]
pub struct ClapPluginEntry {
    pub clap_version: ClapVersion,
    pub init: Option<extern "C" fn(*const c_char) -> bool>,
    pub deinit: Option<extern "C" fn()>,
    pub get_factory: Option<extern "C" fn(*const c_char) -> *const c_void>,
}

/// CLAP plugin factory
#[repr(C)]
pub struct ClapPluginFactory {
    pub get_plugin_count: Option<extern "C" fn(*const ClapPluginFactory) -> u32>,
    pub get_plugin_descriptor:
        Option<extern "C" fn(*const ClapPluginFactory, u32) -> *const ClapPluginDescriptor>,
    pub create_plugin: Option<
        extern "C" fn(
            *const ClapPluginFactory,
            *const ClapHost,
            *const c_char,
        ) -> *const ClapPlugin,
    >,
}

// Event types from clap/events.h
const CLAP_CORE_EVENT_SPACE_ID: u16 = 0;
const CLAP_EVENT_NOTE_ON: u16 = 0;
const CLAP_EVENT_NOTE_OFF: u16 = 1;
const CLAP_EVENT_MIDI: u16 = 10;

/// CLAP event header
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ClapEventHeader {
    pub size: u32,
    pub time: u32,
    pub space_id: u16,
    pub event_type: u16,
    pub flags: u32,
}

/// CLAP note event (note on/off)
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ClapEventNote {
    pub header: ClapEventHeader,
    pub note_id: i32,
    pub port_index: i16,
    pub channel: i16,
    pub key: i16,
    pub velocity: f64,
}

/// CLAP raw MIDI event
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ClapEventMidi {
    pub header: ClapEventHeader,
    pub port_index: u16,
    pub data: [u8; 3],
}

/// One queued input event, stored in its C layout so the event list can hand
/// out header pointers directly.
#[derive(Clone, Copy)]
enum QueuedEvent {
    Note(ClapEventNote),
    Midi(ClapEventMidi),
}

impl QueuedEvent {
    fn header(&self) -> *const ClapEventHeader {
        match self {
            QueuedEvent::Note(n) => &n.header,
            QueuedEvent::Midi(m) => &m.header,
        }
    }
}

/// CLAP input event list
#[repr(C)]
pub struct ClapInputEvents {
    pub ctx: *mut c_void,
    pub size: Option<extern "C" fn(*const ClapInputEvents) -> u32>,
    pub get: Option<extern "C" fn(*const ClapInputEvents, u32) -> *const ClapEventHeader>,
}

/// CLAP output event list
#[repr(C)]
pub struct ClapOutputEvents {
    pub ctx: *mut c_void,
    pub try_push: Option<extern "C" fn(*const ClapOutputEvents, *const ClapEventHeader) -> bool>,
}

extern "C" fn input_events_size(list: *const ClapInputEvents) -> u32 {
    let events = unsafe { &*((*list).ctx as *const Vec<QueuedEvent>) };
    events.len() as u32
}

extern "C" fn input_events_get(
    list: *const ClapInputEvents,
    index: u32,
) -> *const ClapEventHeader {
    let events = unsafe { &*((*list).ctx as *const Vec<QueuedEvent>) };
    events
        .get(index as usize)
        .map(QueuedEvent::header)
        .unwrap_or(ptr::null())
}

extern "C" fn output_events_try_push(
    _list: *const ClapOutputEvents,
    _event: *const ClapEventHeader,
) -> bool {
    // Plugin output events are accepted and discarded
    true
}

// Factory ID constant
const CLAP_PLUGIN_FACTORY_ID: &[u8] = b"clap.plugin-factory\0";

/// Events queued per block before the plugin saturates
const EVENT_CAPACITY: usize = 1024;

/// CLAP plugin loader
pub struct ClapPluginLoader {
    #[allow(dead_code)]
    library: Library,
    entry: *const ClapPluginEntry,
    factory: *const ClapPluginFactory,
    path: String,
}

impl ClapPluginLoader {
    /// Load a CLAP bundle and resolve its entry and factory
    pub fn new(path: &Path) -> Result<Self, AudioError> {
        let path_str = path.display().to_string();

        let library = unsafe {
            Library::new(path).map_err(|e| {
                AudioError::PluginError(format!("failed to load library {}: {}", path_str, e))
            })?
        };

        let entry: Symbol<*const ClapPluginEntry> = unsafe {
            library
                .get(b"clap_entry")
                .map_err(|e| AudioError::PluginError(format!("failed to find clap_entry: {}", e)))?
        };

        let entry = *entry;
        if entry.is_null() {
            return Err(AudioError::PluginError("clap_entry is null".into()));
        }

        let entry_ref = unsafe { &*entry };
        if let Some(init) = entry_ref.init {
            let path_cstr = CString::new(path_str.as_str())
                .map_err(|_| AudioError::PluginError("invalid path string".into()))?;
            if !init(path_cstr.as_ptr()) {
                return Err(AudioError::PluginError("plugin entry init failed".into()));
            }
        }

        let factory = if let Some(get_factory) = entry_ref.get_factory {
            let factory = get_factory(CLAP_PLUGIN_FACTORY_ID.as_ptr() as *const c_char);
            if factory.is_null() {
                return Err(AudioError::PluginError("failed to get plugin factory".into()));
            }
            factory as *const ClapPluginFactory
        } else {
            return Err(AudioError::PluginError("no get_factory function".into()));
        };

        debug!(path = %path_str, "loaded CLAP bundle");

        Ok(Self {
            library,
            entry,
            factory,
            path: path_str,
        })
    }

    /// Number of plugins in the bundle
    pub fn plugin_count(&self) -> u32 {
        let factory = unsafe { &*self.factory };
        factory
            .get_plugin_count
            .map(|f| f(self.factory))
            .unwrap_or(0)
    }

    /// Descriptor for the plugin at `index`
    pub fn descriptor(&self, index: u32) -> Option<PluginInfo> {
        let factory = unsafe { &*self.factory };
        let get_desc = factory.get_plugin_descriptor?;

        let desc_ptr = get_desc(self.factory, index);
        if desc_ptr.is_null() {
            return None;
        }
        let desc = unsafe { &*desc_ptr };

        let cstr = |ptr: *const c_char| {
            if ptr.is_null() {
                String::new()
            } else {
                unsafe { CStr::from_ptr(ptr) }.to_string_lossy().to_string()
            }
        };

        Some(PluginInfo {
            name: cstr(desc.name),
            vendor: cstr(desc.vendor),
            version: cstr(desc.version),
            format: PluginFormat::Clap,
            path: self.path.clone(),
            uid: cstr(desc.id),
        })
    }

    /// Instantiate the plugin at `index`, consuming the loader so the library
    /// stays mapped for the instance's lifetime.
    pub fn instantiate(self, index: u32) -> Result<ClapPluginInstance, AudioError> {
        let info = self.descriptor(index).ok_or_else(|| {
            AudioError::PluginError(format!("no plugin at index {} in {}", index, self.path))
        })?;

        let factory = unsafe { &*self.factory };
        let create = factory
            .create_plugin
            .ok_or_else(|| AudioError::PluginError("no create_plugin function".into()))?;

        let host = Box::new(create_host());
        let host_ptr = Box::into_raw(host);

        let uid_cstr = CString::new(info.uid.as_str())
            .map_err(|_| AudioError::PluginError("invalid plugin id".into()))?;
        let plugin_ptr = create(self.factory, host_ptr, uid_cstr.as_ptr());
        if plugin_ptr.is_null() {
            unsafe { drop(Box::from_raw(host_ptr)) };
            return Err(AudioError::PluginError(
                "failed to create plugin instance".into(),
            ));
        }

        let plugin = unsafe { &*plugin_ptr };
        if let Some(init) = plugin.init {
            if !init(plugin_ptr) {
                if let Some(destroy) = plugin.destroy {
                    destroy(plugin_ptr);
                }
                unsafe { drop(Box::from_raw(host_ptr)) };
                return Err(AudioError::PluginError("plugin init failed".into()));
            }
        }

        info!(name = %info.name, "instantiated CLAP plugin");

        Ok(ClapPluginInstance {
            plugin: plugin_ptr,
            host: host_ptr,
            info,
            events: Vec::new(),
            frames: 0,
            steady_time: 0,
            in_ports: 1,
            out_ports: 1,
            in_channels: 2,
            out_channels: 2,
            activated: false,
            processing: false,
            parent: None,
            _library: None,
        }
        .with_library(self))
    }
}

impl Drop for ClapPluginLoader {
    fn drop(&mut self) {
        let entry = unsafe { &*self.entry };
        if let Some(deinit) = entry.deinit {
            deinit();
        }
        debug!(path = %self.path, "unloaded CLAP bundle");
    }
}

/// Create the host structure handed to CLAP plugins
fn create_host() -> ClapHost {
    static HOST_NAME: &[u8] = b"soloist\0";
    static HOST_VENDOR: &[u8] = b"soloist\0";
    static HOST_URL: &[u8] = b"https://github.com/soloist-audio/soloist\0";
    static HOST_VERSION: &[u8] = b"0.1.0\0";

    ClapHost {
        clap_version: ClapVersion {
            major: 1,
            minor: 2,
            revision: 0,
        },
        host_data: ptr::null_mut(),
        name: HOST_NAME.as_ptr() as *const c_char,
        vendor: HOST_VENDOR.as_ptr() as *const c_char,
        url: HOST_URL.as_ptr() as *const c_char,
        version: HOST_VERSION.as_ptr() as *const c_char,
        get_extension: Some(host_get_extension),
        request_restart: Some(host_request_restart),
        request_process: Some(host_request_process),
        request_callback: Some(host_request_callback),
    }
}

// One plugin is hosted at a time, so a single flag covers the
// request_callback → on_main_thread handshake.
static CALLBACK_REQUESTED: AtomicBool = AtomicBool::new(false);

fn take_callback_request() -> bool {
    CALLBACK_REQUESTED.swap(false, Ordering::AcqRel)
}

extern "C" fn host_get_extension(
    _host: *const ClapHost,
    _extension_id: *const c_char,
) -> *const c_void {
    // No host extensions offered
    ptr::null()
}

extern "C" fn host_request_restart(_host: *const ClapHost) {
    debug!("plugin requested restart");
}

extern "C" fn host_request_process(_host: *const ClapHost) {
    debug!("plugin requested process");
}

extern "C" fn host_request_callback(_host: *const ClapHost) {
    CALLBACK_REQUESTED.store(true, Ordering::Release);
}

/// A live CLAP plugin instance
pub struct ClapPluginInstance {
    plugin: *const ClapPlugin,
    host: *mut ClapHost,
    info: PluginInfo,
    // Input events for the current block, in C layout
    events: Vec<QueuedEvent>,
    frames: u32,
    steady_time: i64,
    in_ports: u32,
    out_ports: u32,
    in_channels: u32,
    out_channels: u32,
    activated: bool,
    processing: bool,
    parent: Option<ParentWindow>,
    // Keeps the shared library mapped while the plugin pointer is alive
    _library: Option<Box<ClapPluginLoader>>,
}

// SAFETY: the raw plugin pointers are only dereferenced behind the engine's
// locking; CLAP requires the host to serialize audio-thread calls itself.
unsafe impl Send for ClapPluginInstance {}

impl ClapPluginInstance {
    fn with_library(mut self, loader: ClapPluginLoader) -> Self {
        self._library = Some(Box::new(loader));
        self
    }

    /// The parent window handle handed over by the application, if any
    pub fn parent_window(&self) -> Option<ParentWindow> {
        self.parent
    }

    fn push_event(&mut self, event: QueuedEvent) {
        if self.events.len() >= EVENT_CAPACITY {
            debug!("plugin event list full, event dropped");
            return;
        }
        self.events.push(event);
    }

    fn push_note(&mut self, event_type: u16, time: u32, channel: u8, key: u8, velocity: u8) {
        self.push_event(QueuedEvent::Note(ClapEventNote {
            header: ClapEventHeader {
                size: std::mem::size_of::<ClapEventNote>() as u32,
                time,
                space_id: CLAP_CORE_EVENT_SPACE_ID,
                event_type,
                flags: 0,
            },
            note_id: -1,
            port_index: 0,
            channel: channel as i16,
            key: key as i16,
            velocity: velocity as f64 / 127.0,
        }));
    }

    fn push_midi(&mut self, time: u32, data: [u8; 3]) {
        self.push_event(QueuedEvent::Midi(ClapEventMidi {
            header: ClapEventHeader {
                size: std::mem::size_of::<ClapEventMidi>() as u32,
                time,
                space_id: CLAP_CORE_EVENT_SPACE_ID,
                event_type: CLAP_EVENT_MIDI,
                flags: 0,
            },
            port_index: 0,
            data,
        }));
    }
}

impl AudioPlugin for ClapPluginInstance {
    fn info(&self) -> &PluginInfo {
        &self.info
    }

    fn set_ports(&mut self, inputs: u32, outputs: u32) {
        self.in_channels = inputs;
        self.out_channels = outputs;
        self.in_ports = 1;
        self.out_ports = 1;
    }

    fn activate(&mut self, sample_rate: f64, max_block_size: u32) -> Result<(), AudioError> {
        if self.activated {
            return Ok(());
        }

        let plugin = unsafe { &*self.plugin };
        if let Some(activate) = plugin.activate {
            if !activate(self.plugin, sample_rate, 1, max_block_size) {
                return Err(AudioError::PluginError("plugin activation failed".into()));
            }
        }

        if let Some(start) = plugin.start_processing {
            if !start(self.plugin) {
                if let Some(deactivate) = plugin.deactivate {
                    deactivate(self.plugin);
                }
                return Err(AudioError::PluginError(
                    "plugin start_processing failed".into(),
                ));
            }
            self.processing = true;
        }

        self.events.reserve(EVENT_CAPACITY);
        self.steady_time = 0;
        self.activated = true;
        info!(name = %self.info.name, sample_rate, max_block_size, "activated CLAP plugin");
        Ok(())
    }

    fn deactivate(&mut self) {
        if !self.activated {
            return;
        }

        let plugin = unsafe { &*self.plugin };

        if self.processing {
            if let Some(stop) = plugin.stop_processing {
                stop(self.plugin);
            }
            self.processing = false;
        }

        if let Some(deactivate) = plugin.deactivate {
            deactivate(self.plugin);
        }

        self.activated = false;
        info!(name = %self.info.name, "deactivated CLAP plugin");
    }

    fn process_begin(&mut self, frame_count: u32) {
        self.events.clear();
        self.frames = frame_count;
    }

    fn note_on(&mut self, sample_offset: u32, channel: u8, key: u8, velocity: u8) {
        self.push_note(CLAP_EVENT_NOTE_ON, sample_offset, channel, key, velocity);
    }

    fn note_off(&mut self, sample_offset: u32, channel: u8, key: u8, velocity: u8) {
        self.push_note(CLAP_EVENT_NOTE_OFF, sample_offset, channel, key, velocity);
    }

    fn note_aftertouch(&mut self, sample_offset: u32, channel: u8, key: u8, pressure: u8) {
        self.push_midi(sample_offset, [0xA0 | (channel & 0xf), key, pressure]);
    }

    fn control_change(&mut self, sample_offset: u32, channel: u8, controller: u8, value: u8) {
        self.push_midi(sample_offset, [0xB0 | (channel & 0xf), controller, value]);
    }

    fn pitch_bend(&mut self, sample_offset: u32, channel: u8, value: u16) {
        self.push_midi(
            sample_offset,
            [
                0xE0 | (channel & 0xf),
                (value & 0x7f) as u8,
                ((value >> 7) & 0x7f) as u8,
            ],
        );
    }

    fn process(&mut self, inputs: &[&[f32]], outputs: &mut [&mut [f32]]) {
        if !self.activated || !self.processing {
            return;
        }

        let plugin = unsafe { &*self.plugin };
        let process_fn = match plugin.process {
            Some(f) => f,
            None => return,
        };

        if inputs.is_empty() || outputs.is_empty() {
            return;
        }

        // The block was framed by process_begin; a shorter slice wins.
        let frame_count = self
            .frames
            .min(inputs[0].len() as u32)
            .min(outputs[0].len() as u32);
        if frame_count == 0 {
            return;
        }

        let mut input_ptrs: Vec<*mut f32> =
            inputs.iter().map(|ch| ch.as_ptr() as *mut f32).collect();
        let mut output_ptrs: Vec<*mut f32> =
            outputs.iter_mut().map(|ch| ch.as_mut_ptr()).collect();

        let input_buffer = ClapAudioBuffer {
            data32: input_ptrs.as_mut_ptr(),
            data64: ptr::null_mut(),
            channel_count: self.in_channels.min(inputs.len() as u32),
            latency: 0,
            constant_mask: 0,
        };

        let mut output_buffer = ClapAudioBuffer {
            data32: output_ptrs.as_mut_ptr(),
            data64: ptr::null_mut(),
            channel_count: self.out_channels.min(outputs.len() as u32),
            latency: 0,
            constant_mask: 0,
        };

        let in_events = ClapInputEvents {
            ctx: &self.events as *const Vec<QueuedEvent> as *mut c_void,
            size: Some(input_events_size),
            get: Some(input_events_get),
        };
        let out_events = ClapOutputEvents {
            ctx: ptr::null_mut(),
            try_push: Some(output_events_try_push),
        };

        let process = ClapProcess {
            steady_time: self.steady_time,
            frames_count: frame_count,
            transport: ptr::null(),
            audio_inputs: &input_buffer,
            audio_outputs: &mut output_buffer,
            audio_inputs_count: self.in_ports,
            audio_outputs_count: self.out_ports,
            in_events: &in_events,
            out_events: &out_events,
        };

        let _status = process_fn(self.plugin, &process);
        self.steady_time += frame_count as i64;
    }

    fn set_parent_window(&mut self, parent: ParentWindow) {
        // Held for the GUI extension; embedding itself is outside the engine
        self.parent = Some(parent);
        debug!(handle = parent.0, "parent window handle stored");
    }

    fn idle(&mut self) {
        if take_callback_request() {
            let plugin = unsafe { &*self.plugin };
            if let Some(on_main_thread) = plugin.on_main_thread {
                on_main_thread(self.plugin);
            }
        }
    }
}

impl Drop for ClapPluginInstance {
    fn drop(&mut self) {
        self.deactivate();

        let plugin = unsafe { &*self.plugin };
        if let Some(destroy) = plugin.destroy {
            destroy(self.plugin);
        }

        unsafe { drop(Box::from_raw(self.host)) };

        debug!(name = %self.info.name, "destroyed CLAP plugin instance");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_creation() {
        let host = create_host();
        assert!(!host.name.is_null());
        assert!(host.get_extension.is_some());
        assert!(host.request_callback.is_some());
    }

    #[test]
    fn test_callback_request_flag_is_consumed_once() {
        host_request_callback(ptr::null());
        assert!(take_callback_request());
        assert!(!take_callback_request());
    }

    #[test]
    fn test_event_list_vtable_reads_queue() {
        let events = vec![
            QueuedEvent::Midi(ClapEventMidi {
                header: ClapEventHeader {
                    size: std::mem::size_of::<ClapEventMidi>() as u32,
                    time: 7,
                    space_id: CLAP_CORE_EVENT_SPACE_ID,
                    event_type: CLAP_EVENT_MIDI,
                    flags: 0,
                },
                port_index: 0,
                data: [0x90, 60, 100],
            }),
            QueuedEvent::Note(ClapEventNote {
                header: ClapEventHeader {
                    size: std::mem::size_of::<ClapEventNote>() as u32,
                    time: 12,
                    space_id: CLAP_CORE_EVENT_SPACE_ID,
                    event_type: CLAP_EVENT_NOTE_ON,
                    flags: 0,
                },
                note_id: -1,
                port_index: 0,
                channel: 1,
                key: 60,
                velocity: 100.0 / 127.0,
            }),
        ];

        let list = ClapInputEvents {
            ctx: &events as *const Vec<QueuedEvent> as *mut c_void,
            size: Some(input_events_size),
            get: Some(input_events_get),
        };

        assert_eq!(input_events_size(&list), 2);
        let first = unsafe { &*input_events_get(&list, 0) };
        assert_eq!(first.event_type, CLAP_EVENT_MIDI);
        assert_eq!(first.time, 7);
        let second = unsafe { &*input_events_get(&list, 1) };
        assert_eq!(second.event_type, CLAP_EVENT_NOTE_ON);
        assert_eq!(second.time, 12);
        assert!(input_events_get(&list, 2).is_null());
    }
}
