use std::fmt;
use std::io;

use crate::operations::Device;

/// A control the mixer refused to expose for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    ReadVolumeMute,
    SetMute,
    SetVolume,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ReadVolumeMute => "reading volume/mute",
            Self::SetMute => "setting mute",
            Self::SetVolume => "setting volume",
        })
    }
}

/// Every way a run can end early. None of them are retried.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad command line; carries the usage line to print.
    #[error("{0}")]
    Usage(String),

    #[error("{0}")]
    Init(String),

    #[error("Could not connect to PipeWire")]
    ServiceUnreachable,

    #[error("{0}")]
    ComponentLoad(String),

    #[error("{0}")]
    Activation(String),

    #[error("failed to get node ID of default {device} device")]
    DeviceNotFound { device: Device },

    #[error("{device} device (node {id}) does not support {capability}")]
    CapabilityUnsupported {
        device: Device,
        id: u32,
        capability: Capability,
    },

    #[error("failed to write report: {0}")]
    Output(#[from] io::Error),
}

impl Error {
    /// Process exit code; an unreachable service is distinguishable from
    /// everything else.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::ServiceUnreachable => 2,
            _ => 1,
        }
    }
}
