//! Audio device enumeration and resolution
//!
//! The settings provider references an output device as an audio API name
//! plus a device index; both are optional and fall back to the system
//! defaults.

use cpal::traits::{DeviceTrait, HostTrait};

use super::error::AudioError;

/// Information about an audio output device
#[derive(Debug, Clone, serde::Serialize)]
pub struct AudioDeviceInfo {
    /// Index within the host's output device list (for selection)
    pub index: usize,
    /// Display name
    pub name: String,
    /// Audio API this device belongs to
    pub host_api: String,
    /// Supported sample rates (Hz)
    pub supported_sample_rates: Vec<u32>,
    /// Whether this is the default output device
    pub is_default: bool,
}

/// Names of the audio APIs compiled into this build
pub fn list_host_apis() -> Vec<String> {
    cpal::available_hosts()
        .iter()
        .map(|id| id.name().to_string())
        .collect()
}

/// Resolve an audio host by API name, or the system default when `None`.
pub fn resolve_host(api: Option<&str>) -> Result<cpal::Host, AudioError> {
    match api {
        Some(name) => {
            let id = cpal::available_hosts()
                .into_iter()
                .find(|id| id.name().eq_ignore_ascii_case(name))
                .ok_or_else(|| AudioError::DeviceNotFound(format!("audio API {}", name)))?;
            cpal::host_from_id(id).map_err(|e| AudioError::DeviceOpenFailed(e.to_string()))
        }
        None => Ok(cpal::default_host()),
    }
}

/// Resolve an output device by index within the given API, or the default
/// output device when `None`.
pub fn resolve_output_device(
    api: Option<&str>,
    index: Option<usize>,
) -> Result<cpal::Device, AudioError> {
    let host = resolve_host(api)?;
    match index {
        Some(i) => host
            .output_devices()
            .map_err(|e| AudioError::DeviceOpenFailed(e.to_string()))?
            .nth(i)
            .ok_or_else(|| AudioError::DeviceNotFound(format!("output device index {}", i))),
        None => host
            .default_output_device()
            .ok_or_else(|| AudioError::DeviceNotFound("no default output device".into())),
    }
}

/// List available output devices across the default host
pub fn list_output_devices() -> Vec<AudioDeviceInfo> {
    let host = cpal::default_host();
    let host_api = host.id().name().to_string();
    let default_name = host
        .default_output_device()
        .as_ref()
        .and_then(|d| d.name().ok());

    host.output_devices()
        .map(|devices| {
            devices
                .enumerate()
                .filter_map(|(index, device)| {
                    let name = device.name().ok()?;
                    let is_default = default_name.as_ref() == Some(&name);
                    Some(AudioDeviceInfo {
                        index,
                        name,
                        host_api: host_api.clone(),
                        supported_sample_rates: supported_sample_rates(&device),
                        is_default,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Common sample rates the device's output configs can satisfy
fn supported_sample_rates(device: &cpal::Device) -> Vec<u32> {
    let mut rates = Vec::new();
    for config in device.supported_output_configs().into_iter().flatten() {
        for rate in &[44_100u32, 48_000, 96_000, 192_000] {
            if *rate >= config.min_sample_rate().0
                && *rate <= config.max_sample_rate().0
                && !rates.contains(rate)
            {
                rates.push(*rate);
            }
        }
    }
    rates.sort_unstable();
    if rates.is_empty() {
        rates = vec![44_100, 48_000];
    }
    rates
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_devices_does_not_panic() {
        // Actual device availability depends on the system
        let _hosts = list_host_apis();
        let _outputs = list_output_devices();
    }

    #[test]
    fn test_unknown_api_is_reported() {
        let err = resolve_host(Some("no-such-audio-api")).err().unwrap();
        assert!(matches!(err, AudioError::DeviceNotFound(_)));
    }
}
