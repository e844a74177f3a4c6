use std::fmt;

use crate::error::Capability;

/// A single side of the audio graph a leg operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Playback,
    Capture,
}

impl Device {
    /// Media class the default-nodes plugin keys its defaults by.
    pub const fn media_class(self) -> &'static str {
        match self {
            Self::Playback => "Audio/Sink",
            Self::Capture => "Audio/Source",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Playback => "playback",
            Self::Capture => "capture",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceTarget {
    Playback,
    Capture,
    Both,
}

impl DeviceTarget {
    /// Devices visited by one pass, in order.
    pub const fn legs(self) -> &'static [Device] {
        match self {
            Self::Playback => &[Device::Playback],
            Self::Capture => &[Device::Capture],
            Self::Both => &[Device::Playback, Device::Capture],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeOp {
    Get,
    Mute,
    Unmute,
    ToggleMute,
    SetAbsolute(u32),    // percent
    AdjustRelative(i32), // delta percent
}

/// Volume on the mixer's configured scale, where 1.0 is nominal full volume.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeState {
    pub volume: f64,
    pub mute: bool,
}

impl VolumeState {
    /// `<percent> <on|off>` as printed by a get.
    pub fn report(&self) -> String {
        #[allow(clippy::cast_possible_truncation)]
        let percent = (self.volume * 100.0).round() as i64;
        format!("{} {}", percent, if self.mute { "off" } else { "on" })
    }
}

/// Partial update handed to the mixer; absent keys are left untouched.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct VolumeUpdate {
    pub volume: Option<f64>,
    pub mute: Option<bool>,
}

impl VolumeUpdate {
    pub const fn volume(volume: f64) -> Self {
        Self {
            volume: Some(volume),
            mute: None,
        }
    }

    pub const fn mute(mute: bool) -> Self {
        Self {
            volume: None,
            mute: Some(mute),
        }
    }

    /// What a rejected write of this update means for the diagnostic.
    pub const fn capability(&self) -> Capability {
        if self.mute.is_some() {
            Capability::SetMute
        } else {
            Capability::SetVolume
        }
    }
}

impl VolumeOp {
    /// Update to apply given the freshly read state; `None` for a plain get.
    ///
    /// Relative adjustments are not clamped here: whatever the sum is goes to
    /// the mixer, which decides how to represent it.
    pub fn plan(self, current: VolumeState) -> Option<VolumeUpdate> {
        match self {
            Self::Get => None,
            Self::Mute => Some(VolumeUpdate::mute(true)),
            Self::Unmute => Some(VolumeUpdate::mute(false)),
            Self::ToggleMute => Some(VolumeUpdate::mute(!current.mute)),
            Self::SetAbsolute(percent) => Some(VolumeUpdate::volume(f64::from(percent) / 100.0)),
            Self::AdjustRelative(delta) => Some(VolumeUpdate::volume(
                current.volume + f64::from(delta) / 100.0,
            )),
        }
    }
}
