use libpulse_binding as pulse;

use std::cell::RefCell;
use std::rc::Rc;

use log::{debug, error, warn};
use pulse::callbacks::ListResult;
use pulse::context::subscribe::InterestMaskSet;
use pulse::context::{Context, FlagSet, State as ContextState};
use pulse::mainloop::standard::{IterateResult, Mainloop};
use pulse::volume::{ChannelVolumes, Volume, VolumeLinear};

use crate::error::Error;
use crate::operations::{Device, VolumeState, VolumeUpdate};
use crate::session::{Completion, ObjectInterest, ObjectKind, Plugin, Scale, SessionCore};

fn volume_to_float(volume: Volume, scale: Scale) -> f64 {
    match scale {
        Scale::Cubic => f64::from(volume.0) / f64::from(Volume::NORMAL.0),
        Scale::Linear => VolumeLinear::from(volume).0,
    }
}

/// Negative values mute, values past the representable maximum saturate.
fn float_to_volume(value: f64, scale: Scale) -> Volume {
    if !value.is_finite() || value <= 0.0 {
        return Volume::MUTED;
    }
    let raw = match scale {
        Scale::Cubic => (value * f64::from(Volume::NORMAL.0)).round(),
        Scale::Linear => f64::from(Volume::from(VolumeLinear(value)).0),
    };
    if raw >= f64::from(Volume::MAX.0) {
        warn!("Value too large: {}, using maximum volume", value);
        return Volume::MAX;
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let raw = raw as u32;
    Volume(raw)
}

fn node_state(volumes: &ChannelVolumes, mute: bool, scale: Scale) -> VolumeState {
    VolumeState {
        volume: volume_to_float(volumes.avg(), scale),
        mute,
    }
}

#[derive(Debug)]
struct NodeEntry {
    device: Device,
    index: u32,
    name: String,
}

/// Objects delivered by one discovery pass.
#[derive(Debug, Default)]
struct Registry {
    nodes: Vec<NodeEntry>,
    clients: usize,
    endpoints: usize,
}

impl Registry {
    fn add_node(&mut self, device: Device, index: u32, name: Option<&str>) {
        let name = name.unwrap_or_default().to_owned();
        debug!("discovered {} node {} ({})", device, index, name);
        self.nodes.push(NodeEntry {
            device,
            index,
            name,
        });
    }

    fn lookup(&self, device: Device, name: &str) -> Option<u32> {
        self.nodes
            .iter()
            .find(|node| node.device == device && node.name == name)
            .map(|node| node.index)
    }
}

/// Fires `installed` once every requested object list has ended.
struct Discovery {
    remaining: usize,
    installed: Option<Completion<()>>,
}

impl Discovery {
    fn list_done(this: &RefCell<Self>) {
        let installed = {
            let mut discovery = this.borrow_mut();
            discovery.remaining = discovery.remaining.saturating_sub(1);
            if discovery.remaining == 0 {
                discovery.installed.take()
            } else {
                None
            }
        };
        if let Some(installed) = installed {
            installed(());
        }
    }
}

/// Keeps the last item of an info-by-index reply and hands it over at the end.
struct Collect<T> {
    value: Option<T>,
    done: Option<Completion<Option<T>>>,
}

impl<T> Collect<T> {
    fn new(done: Completion<Option<T>>) -> Self {
        Self {
            value: None,
            done: Some(done),
        }
    }

    fn item(&mut self, value: T) {
        self.value = Some(value);
    }

    fn end(&mut self) {
        if let Some(done) = self.done.take() {
            done(self.value.take());
        }
    }
}

fn once<T: 'static>(done: Completion<T>) -> impl FnMut(T) + 'static {
    let mut done = Some(done);
    move |value| {
        if let Some(done) = done.take() {
            done(value);
        }
    }
}

fn read_channels(
    context: &Context,
    device: Device,
    id: u32,
    done: Completion<Option<ChannelVolumes>>,
) {
    let mut reader = Collect::new(done);
    let introspect = context.introspect();
    match device {
        Device::Playback => {
            introspect.get_sink_info_by_index(id, move |res| match res {
                ListResult::Item(info) => reader.item(info.volume),
                ListResult::End | ListResult::Error => reader.end(),
            });
        }
        Device::Capture => {
            introspect.get_source_info_by_index(id, move |res| match res {
                ListResult::Item(info) => reader.item(info.volume),
                ListResult::End | ListResult::Error => reader.end(),
            });
        }
    }
}

fn apply_mute(context: &Context, device: Device, id: u32, mute: bool, done: Completion<bool>) {
    let callback: Box<dyn FnMut(bool)> = Box::new(once(done));
    let mut introspect = context.introspect();
    match device {
        Device::Playback => {
            introspect.set_sink_mute_by_index(id, mute, Some(callback));
        }
        Device::Capture => {
            introspect.set_source_mute_by_index(id, mute, Some(callback));
        }
    }
}

/// Sets every channel of the node to `volume`.
fn apply_volume(
    context: &Rc<RefCell<Context>>,
    device: Device,
    id: u32,
    volume: Volume,
    done: Completion<bool>,
) {
    let context_ref = Rc::clone(context);
    let fetched: Completion<Option<ChannelVolumes>> = Box::new(move |channels| {
        let mut channels = match channels {
            Some(channels) => channels,
            None => {
                debug!("{} node {} vanished before its volume could be set", device, id);
                done(false);
                return;
            }
        };
        let count = channels.len();
        channels.set(count, volume);
        let callback: Box<dyn FnMut(bool)> = Box::new(once(done));
        let mut introspect = context_ref.borrow().introspect();
        match device {
            Device::Playback => {
                introspect.set_sink_volume_by_index(id, &channels, Some(callback));
            }
            Device::Capture => {
                introspect.set_source_volume_by_index(id, &channels, Some(callback));
            }
        }
    });
    read_channels(&context.borrow(), device, id, fetched);
}

/// Session core backed by a PulseAudio-protocol server (`pipewire-pulse`).
pub struct PulseCore {
    context: Rc<RefCell<Context>>,
    mainloop: Mainloop,
    server: Option<String>,
    scale: Scale,
    loaded: Vec<Plugin>,
    active: Rc<RefCell<Vec<Plugin>>>,
    registry: Option<Rc<RefCell<Registry>>>,
    pending_connect: Rc<RefCell<Option<Completion<bool>>>>,
    on_disconnect: Rc<RefCell<Option<Box<dyn FnMut()>>>>,
}

impl PulseCore {
    pub fn new(app_name: &str, server: Option<String>) -> Result<Self, Error> {
        let mainloop =
            Mainloop::new().ok_or_else(|| Error::Init("Failed to create mainloop".to_owned()))?;
        let context = Context::new(&mainloop, app_name)
            .ok_or_else(|| Error::Init("Failed to create new context".to_owned()))?;

        Ok(Self {
            context: Rc::new(RefCell::new(context)),
            mainloop,
            server,
            scale: Scale::Cubic,
            loaded: Vec::new(),
            active: Rc::new(RefCell::new(Vec::new())),
            registry: None,
            pending_connect: Rc::new(RefCell::new(None)),
            on_disconnect: Rc::new(RefCell::new(None)),
        })
    }

    fn watch_state(&self) {
        let context_ref = Rc::downgrade(&self.context);
        let pending = Rc::clone(&self.pending_connect);
        let lost = Rc::clone(&self.on_disconnect);
        self.context
            .borrow_mut()
            .set_state_callback(Some(Box::new(move || {
                // Skips the transitions fired from inside `connect` itself.
                let Some(context) = context_ref.upgrade() else {
                    return;
                };
                let state = match context.try_borrow() {
                    Ok(context) => context.get_state(),
                    Err(_) => return,
                };
                debug!("context state {:?}", state);
                match state {
                    ContextState::Ready => {
                        let done = pending.borrow_mut().take();
                        if let Some(done) = done {
                            done(true);
                        }
                    }
                    ContextState::Failed | ContextState::Terminated => {
                        let done = pending.borrow_mut().take();
                        match done {
                            Some(done) => done(false),
                            None => {
                                if let Some(lost) = lost.borrow_mut().as_mut() {
                                    lost();
                                }
                            }
                        }
                    }
                    _ => {}
                }
            })));
    }

    fn activate_default_nodes(&self, done: Completion<Result<(), String>>) {
        let active = Rc::clone(&self.active);
        let mut done = once(done);
        self.context.borrow().introspect().get_server_info(move |info| {
            debug!(
                "{}: active on {:?} {:?}",
                Plugin::DefaultNodes,
                info.server_name,
                info.server_version
            );
            active.borrow_mut().push(Plugin::DefaultNodes);
            done(Ok(()));
        });
    }

    fn activate_mixer(&self, done: Completion<Result<(), String>>) {
        let active = Rc::clone(&self.active);
        let mut done = once(done);
        let mut context = self.context.borrow_mut();
        context.set_subscribe_callback(Some(Box::new(|facility, operation, index| {
            debug!("{}: {:?} {:?} {}", Plugin::Mixer, operation, facility, index);
        })));
        context.subscribe(InterestMaskSet::SINK | InterestMaskSet::SOURCE, move |ok| {
            if ok {
                active.borrow_mut().push(Plugin::Mixer);
                done(Ok(()));
            } else {
                done(Err(format!(
                    "{}: failed to subscribe to volume changes",
                    Plugin::Mixer
                )));
            }
        });
    }
}

impl SessionCore for PulseCore {
    fn load_component(&mut self, name: &str) -> Result<(), Error> {
        let plugin = Plugin::ALL
            .iter()
            .copied()
            .find(|plugin| plugin.component() == name)
            .ok_or_else(|| {
                Error::ComponentLoad(format!("Failed to load component '{}': no such module", name))
            })?;
        if !self.loaded.contains(&plugin) {
            self.loaded.push(plugin);
        }
        debug!("loaded component {}", plugin);
        Ok(())
    }

    fn set_mixer_scale(&mut self, scale: Scale) {
        debug!("{}: using {:?} scale", Plugin::Mixer, scale);
        self.scale = scale;
    }

    fn connect(&mut self, done: Completion<bool>, on_disconnect: Box<dyn FnMut() + 'static>) {
        *self.on_disconnect.borrow_mut() = Some(on_disconnect);
        if self.context.borrow().get_state() == ContextState::Ready {
            done(true);
            return;
        }

        *self.pending_connect.borrow_mut() = Some(done);
        self.watch_state();
        let res = self
            .context
            .borrow_mut()
            .connect(self.server.as_deref(), FlagSet::NOFLAGS, None);
        if let Err(e) = res {
            debug!("connect failed: {}", e);
            let done = self.pending_connect.borrow_mut().take();
            if let Some(done) = done {
                done(false);
            }
        }
    }

    fn activate(&mut self, plugin: Plugin, done: Completion<Result<(), String>>) {
        if self.active.borrow().contains(&plugin) {
            done(Ok(()));
            return;
        }
        if !self.loaded.contains(&plugin) {
            done(Err(format!("{}: component is not loaded", plugin)));
            return;
        }
        match plugin {
            Plugin::DefaultNodes => self.activate_default_nodes(done),
            Plugin::Mixer => self.activate_mixer(done),
        }
    }

    fn install_object_manager(&mut self, interest: &ObjectInterest, installed: Completion<()>) {
        let registry = Rc::new(RefCell::new(Registry::default()));
        self.registry = Some(Rc::clone(&registry));

        let lists: usize = interest
            .kinds
            .iter()
            .map(|kind| match kind {
                ObjectKind::Node => 2,
                ObjectKind::Endpoint | ObjectKind::Client => 1,
            })
            .sum();
        let discovery = Rc::new(RefCell::new(Discovery {
            remaining: lists,
            installed: Some(installed),
        }));
        if lists == 0 {
            Discovery::list_done(&discovery);
            return;
        }

        let introspect = self.context.borrow().introspect();
        for kind in &interest.kinds {
            match kind {
                ObjectKind::Node => {
                    let (reg, disc) = (Rc::clone(&registry), Rc::clone(&discovery));
                    introspect.get_sink_info_list(move |res| match res {
                        ListResult::Item(sink) => {
                            reg.borrow_mut()
                                .add_node(Device::Playback, sink.index, sink.name.as_deref());
                        }
                        ListResult::End => Discovery::list_done(&disc),
                        ListResult::Error => {
                            error!("get_sink_info_list: Got Error");
                            Discovery::list_done(&disc);
                        }
                    });
                    let (reg, disc) = (Rc::clone(&registry), Rc::clone(&discovery));
                    introspect.get_source_info_list(move |res| match res {
                        ListResult::Item(source) => {
                            reg.borrow_mut()
                                .add_node(Device::Capture, source.index, source.name.as_deref());
                        }
                        ListResult::End => Discovery::list_done(&disc),
                        ListResult::Error => {
                            error!("get_source_info_list: Got Error");
                            Discovery::list_done(&disc);
                        }
                    });
                }
                ObjectKind::Client => {
                    let (reg, disc) = (Rc::clone(&registry), Rc::clone(&discovery));
                    introspect.get_client_info_list(move |res| match res {
                        ListResult::Item(_) => reg.borrow_mut().clients += 1,
                        ListResult::End => Discovery::list_done(&disc),
                        ListResult::Error => {
                            error!("get_client_info_list: Got Error");
                            Discovery::list_done(&disc);
                        }
                    });
                }
                ObjectKind::Endpoint => {
                    let (reg, disc) = (Rc::clone(&registry), Rc::clone(&discovery));
                    introspect.get_card_info_list(move |res| match res {
                        ListResult::Item(_) => reg.borrow_mut().endpoints += 1,
                        ListResult::End => Discovery::list_done(&disc),
                        ListResult::Error => {
                            error!("get_card_info_list: Got Error");
                            Discovery::list_done(&disc);
                        }
                    });
                }
            }
        }
    }

    fn remove_object_manager(&mut self) {
        if let Some(registry) = self.registry.take() {
            let registry = registry.borrow();
            debug!(
                "dropping discovery: {} nodes, {} clients, {} endpoints",
                registry.nodes.len(),
                registry.clients,
                registry.endpoints
            );
        }
    }

    fn default_node(&mut self, device: Device, done: Completion<u32>) {
        let registry = self.registry.clone();
        let mut done = once(done);
        self.context.borrow().introspect().get_server_info(move |info| {
            let name = match device {
                Device::Playback => info.default_sink_name.as_deref(),
                Device::Capture => info.default_source_name.as_deref(),
            };
            let id = match (name, &registry) {
                (Some(name), Some(registry)) => registry.borrow().lookup(device, name),
                _ => None,
            };
            debug!(
                "default {} ({}) is {:?} -> {:?}",
                device,
                device.media_class(),
                name,
                id
            );
            done(id.unwrap_or(0));
        });
    }

    fn get_volume(&mut self, device: Device, id: u32, done: Completion<Option<VolumeState>>) {
        let scale = self.scale;
        let mut reader = Collect::new(done);
        let introspect = self.context.borrow().introspect();
        match device {
            Device::Playback => {
                introspect.get_sink_info_by_index(id, move |res| match res {
                    ListResult::Item(sink) => {
                        reader.item(node_state(&sink.volume, sink.mute, scale));
                    }
                    ListResult::End | ListResult::Error => reader.end(),
                });
            }
            Device::Capture => {
                introspect.get_source_info_by_index(id, move |res| match res {
                    ListResult::Item(source) => {
                        reader.item(node_state(&source.volume, source.mute, scale));
                    }
                    ListResult::End | ListResult::Error => reader.end(),
                });
            }
        }
    }

    fn set_volume(
        &mut self,
        device: Device,
        id: u32,
        update: VolumeUpdate,
        done: Completion<bool>,
    ) {
        let scale = self.scale;
        match (update.volume, update.mute) {
            (Some(volume), Some(mute)) => {
                let context_ref = Rc::clone(&self.context);
                let then_mute: Completion<bool> = Box::new(move |ok| {
                    if ok {
                        apply_mute(&context_ref.borrow(), device, id, mute, done);
                    } else {
                        done(false);
                    }
                });
                apply_volume(&self.context, device, id, float_to_volume(volume, scale), then_mute);
            }
            (Some(volume), None) => {
                apply_volume(&self.context, device, id, float_to_volume(volume, scale), done);
            }
            (None, Some(mute)) => apply_mute(&self.context.borrow(), device, id, mute, done),
            (None, None) => done(true),
        }
    }

    fn sync(&mut self, done: Completion<()>) {
        // Replies come back in request order, so any round trip is a barrier.
        let mut done = once(done);
        self.context
            .borrow()
            .introspect()
            .get_server_info(move |_| done(()));
    }

    fn iterate(&mut self) -> bool {
        match self.mainloop.iterate(true) {
            IterateResult::Success(_) => true,
            IterateResult::Quit(_) | IterateResult::Err(_) => {
                error!("iterate state was not success, quitting...");
                false
            }
        }
    }
}

impl Drop for PulseCore {
    fn drop(&mut self) {
        let mut context = self.context.borrow_mut();
        context.set_state_callback(None);
        context.disconnect();
    }
}
