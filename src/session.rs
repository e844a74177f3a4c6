//! The audio session manager as seen by the volume pipeline.
//!
//! Everything here is asynchronous except component loading: a request is
//! issued and its completion is delivered later, from inside [`SessionCore::iterate`].

use std::fmt;

use crate::error::Error;
use crate::operations::{Device, VolumeState, VolumeUpdate};

pub type Completion<T> = Box<dyn FnOnce(T) + 'static>;

pub const DEFAULT_NODES_COMPONENT: &str = "default-nodes-api";
pub const MIXER_COMPONENT: &str = "mixer-api";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Plugin {
    DefaultNodes,
    Mixer,
}

impl Plugin {
    pub const ALL: [Self; 2] = [Self::DefaultNodes, Self::Mixer];

    pub const fn component(self) -> &'static str {
        match self {
            Self::DefaultNodes => DEFAULT_NODES_COMPONENT,
            Self::Mixer => MIXER_COMPONENT,
        }
    }
}

impl fmt::Display for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.component())
    }
}

/// How raw mixer volumes map to the `0.0..=1.0` range the pipeline works in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scale {
    Linear,
    Cubic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Endpoint,
    Node,
    Client,
}

/// Object kinds a discovery pass should wait for. Only the minimal
/// feature set (id, name, kind) is ever requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInterest {
    pub kinds: Vec<ObjectKind>,
}

impl ObjectInterest {
    /// What default-node resolution needs populated.
    pub fn defaults() -> Self {
        Self {
            kinds: vec![ObjectKind::Endpoint, ObjectKind::Node, ObjectKind::Client],
        }
    }
}

/// Session core plus the default-nodes and mixer plugins.
pub trait SessionCore {
    fn load_component(&mut self, name: &str) -> Result<(), Error>;

    /// Sets the mixer's volume scale. Must happen before any volume traffic.
    fn set_mixer_scale(&mut self, scale: Scale);

    /// Completes with `false` if the service cannot be reached. Once
    /// connected, `on_disconnect` fires if the peer goes away; connecting an
    /// already connected core completes immediately and replaces the handler.
    fn connect(&mut self, done: Completion<bool>, on_disconnect: Box<dyn FnMut() + 'static>);

    fn activate(&mut self, plugin: Plugin, done: Completion<Result<(), String>>);

    /// Starts a fresh discovery pass; `installed` fires once every currently
    /// known object of interest has been delivered.
    fn install_object_manager(&mut self, interest: &ObjectInterest, installed: Completion<()>);

    fn remove_object_manager(&mut self);

    /// Id of the default node for `device`; 0 or `u32::MAX` when there is none.
    fn default_node(&mut self, device: Device, done: Completion<u32>);

    fn get_volume(&mut self, device: Device, id: u32, done: Completion<Option<VolumeState>>);

    fn set_volume(&mut self, device: Device, id: u32, update: VolumeUpdate, done: Completion<bool>);

    /// Round trip to the service; completes after everything issued before it.
    fn sync(&mut self, done: Completion<()>);

    /// Runs one blocking iteration of the event loop. Returns `false` when the
    /// loop can no longer make progress.
    fn iterate(&mut self) -> bool;
}
