//! Camera-specific options exposed by CMOS models: gain/offset presets, readout tweaks and
//! fast-mode transfer settings.
//!
//! The driver exchanges option values as small little-endian byte blocks. This module owns
//! the layout of those blocks so nothing else has to.

use tracing::debug;

use super::device::{Device, DeviceError};

/// Option identifiers understood by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CameraOption {
    GoPresetMode = 1,
    GoPresetLow = 2,
    GoPresetMed = 3,
    GoPresetHigh = 4,
    GoCustomGain = 5,
    GoCustomOffset = 6,
    EvenIllumination = 12,
    PadData = 13,
    ExposureSpeed = 14,
    BitSendMode = 15,
}

impl CameraOption {
    pub fn id(self) -> u16 {
        self as u16
    }
}

/// Gain/offset preset. Only `Custom` lets gain and offset be set directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoPreset {
    Custom = 0,
    Low = 1,
    Medium = 2,
    High = 3,
}

impl GoPreset {
    pub fn from_code(code: u8) -> Result<Self, DeviceError> {
        match code {
            0 => Ok(Self::Custom),
            1 => Ok(Self::Low),
            2 => Ok(Self::Medium),
            3 => Ok(Self::High),
            _ => Err(DeviceError::InvalidParameters),
        }
    }
}

/// Adjustable option reported as `[min, max, value]`, each a little-endian `u16`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionRange {
    pub min: u16,
    pub max: u16,
    pub value: u16,
}

impl OptionRange {
    pub const ENCODED_LEN: usize = 6;

    pub fn decode(data: &[u8]) -> Result<Self, DeviceError> {
        let word = |i: usize| {
            data.get(i * 2..i * 2 + 2)
                .map(|b| u16::from_le_bytes([b[0], b[1]]))
                .ok_or(DeviceError::InvalidParameters)
        };
        Ok(Self {
            min: word(0)?,
            max: word(1)?,
            value: word(2)?,
        })
    }

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0; Self::ENCODED_LEN];
        out[0..2].copy_from_slice(&self.min.to_le_bytes());
        out[2..4].copy_from_slice(&self.max.to_le_bytes());
        out[4..6].copy_from_slice(&self.value.to_le_bytes());
        out
    }

    pub fn contains(&self, value: u16) -> bool {
        (self.min..=self.max).contains(&value)
    }
}

/// Setting value for a 2-byte option (preset, gain, offset, speed, send mode)
pub fn encode_word(value: u16) -> [u8; 2] {
    value.to_le_bytes()
}

/// Setting value for a 1-byte on/off option
pub fn encode_flag(enabled: bool) -> [u8; 1] {
    [u8::from(enabled)]
}

/// First byte of an option block, the value for presets, flags and selectors
pub fn decode_first(data: &[u8]) -> Result<u8, DeviceError> {
    data.first().copied().ok_or(DeviceError::InvalidParameters)
}

/// Option values read from a camera on connect. `None` where the camera lacks the option.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CameraOptions {
    pub go_preset: Option<GoPreset>,
    /// Only read while the preset is `Custom`
    pub gain: Option<OptionRange>,
    pub offset: Option<OptionRange>,
    pub pad_data: Option<bool>,
    pub even_illumination: Option<bool>,
    pub exposure_speed: Option<u8>,
    pub bit_send_mode: Option<u8>,
}

impl CameraOptions {
    /// Read every option the camera has. Gain and offset are skipped unless the preset is
    /// `Custom`; unreadable options come back as `None`.
    pub fn read<D: Device + ?Sized>(device: &D) -> Self {
        let go_preset = read_option(device, CameraOption::GoPresetMode, |data| {
            decode_first(data).and_then(GoPreset::from_code)
        });
        let custom = go_preset == Some(GoPreset::Custom);

        Self {
            go_preset,
            gain: custom
                .then(|| read_option(device, CameraOption::GoCustomGain, OptionRange::decode))
                .flatten(),
            offset: custom
                .then(|| read_option(device, CameraOption::GoCustomOffset, OptionRange::decode))
                .flatten(),
            pad_data: read_option(device, CameraOption::PadData, |data| {
                decode_first(data).map(|b| b != 0)
            }),
            even_illumination: read_option(device, CameraOption::EvenIllumination, |data| {
                decode_first(data).map(|b| b != 0)
            }),
            exposure_speed: read_option(device, CameraOption::ExposureSpeed, decode_first),
            bit_send_mode: read_option(device, CameraOption::BitSendMode, decode_first),
        }
    }
}

fn read_option<D, T>(
    device: &D,
    option: CameraOption,
    decode: impl FnOnce(&[u8]) -> Result<T, DeviceError>,
) -> Option<T>
where
    D: Device + ?Sized,
{
    if !device.has_option(option) {
        return None;
    }
    match device.option_data(option).and_then(|data| decode(&data)) {
        Ok(value) => Some(value),
        Err(e) => {
            debug!("Reading {:?} failed: {}", option, e);
            None
        }
    }
}
