//! One pass of connect → activate → discover → resolve → read → apply → sync,
//! as a state machine fed by backend completions.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::Write;
use std::rc::Rc;

use log::{debug, warn};

use crate::error::{Capability, Error};
use crate::operations::{Device, DeviceTarget, VolumeOp, VolumeState, VolumeUpdate};
use crate::session::{ObjectInterest, Plugin, SessionCore};

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Connect,
    Activate(Plugin),
    InstallObjectManager,
    ResolveDefault(Device),
    ReadVolume(Device, u32),
    WriteVolume(Device, u32, VolumeUpdate),
    Sync,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Connected(bool),
    Activated(Result<(), String>),
    Installed,
    DefaultResolved(u32),
    VolumeRead(Option<VolumeState>),
    VolumeWritten(bool),
    Synced,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Request(Request),
    Print(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Connecting,
    Activating { pending: u8 },
    AwaitingDiscovery,
    ResolvingDevice,
    ReadingState { id: u32 },
    Applying { id: u32, capability: Capability },
    AwaitingBarrier,
    Done,
    Failed,
}

/// How a pass that did not fail came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassEnd {
    Completed,
    Disconnected,
}

/// Plugins that must report ready before discovery starts.
const PENDING_PLUGINS: u8 = 2;

const fn is_valid_node(id: u32) -> bool {
    id != 0 && id != u32::MAX
}

pub struct Pipeline {
    state: State,
    legs: &'static [Device],
    leg: usize,
    operation: VolumeOp,
    discovering: bool,
    disconnected: bool,
    error: Option<Error>,
}

impl Pipeline {
    pub fn new(target: DeviceTarget, operation: VolumeOp) -> Self {
        Self {
            state: State::Connecting,
            legs: target.legs(),
            leg: 0,
            operation,
            discovering: false,
            disconnected: false,
            error: None,
        }
    }

    pub const fn state(&self) -> State {
        self.state
    }

    /// Whether this pass installed a discovery session that needs removing.
    pub const fn discovering(&self) -> bool {
        self.discovering
    }

    pub fn start(&mut self) -> Vec<Action> {
        vec![Action::Request(Request::Connect)]
    }

    pub const fn is_finished(&self) -> bool {
        matches!(self.state, State::Done | State::Failed)
    }

    pub fn finish(self) -> Result<PassEnd, Error> {
        match self.error {
            Some(err) => Err(err),
            None if self.disconnected => Ok(PassEnd::Disconnected),
            None => Ok(PassEnd::Completed),
        }
    }

    fn device(&self) -> Device {
        self.legs[self.leg]
    }

    fn fail(&mut self, err: Error) -> Vec<Action> {
        debug!("pass failed in {:?}: {}", self.state, err);
        self.state = State::Failed;
        self.error = Some(err);
        Vec::new()
    }

    fn resolve(&mut self) -> Vec<Action> {
        self.state = State::ResolvingDevice;
        vec![Action::Request(Request::ResolveDefault(self.device()))]
    }

    fn leg_done(&mut self) -> Vec<Action> {
        if self.leg + 1 < self.legs.len() {
            self.leg += 1;
            self.resolve()
        } else {
            self.state = State::AwaitingBarrier;
            vec![Action::Request(Request::Sync)]
        }
    }

    pub fn handle(&mut self, event: Event) -> Vec<Action> {
        if self.is_finished() {
            debug!("ignoring {:?} after pass ended", event);
            return Vec::new();
        }
        if event == Event::Disconnected {
            warn!("connection to the audio server was lost");
            self.disconnected = true;
            self.state = State::Done;
            return Vec::new();
        }

        match (self.state, event) {
            (State::Connecting, Event::Connected(true)) => {
                self.state = State::Activating {
                    pending: PENDING_PLUGINS,
                };
                Plugin::ALL
                    .iter()
                    .map(|plugin| Action::Request(Request::Activate(*plugin)))
                    .collect()
            }
            (State::Connecting, Event::Connected(false)) => self.fail(Error::ServiceUnreachable),
            (State::Activating { pending }, Event::Activated(Ok(()))) => {
                if pending > 1 {
                    self.state = State::Activating {
                        pending: pending - 1,
                    };
                    Vec::new()
                } else {
                    self.state = State::AwaitingDiscovery;
                    self.discovering = true;
                    vec![Action::Request(Request::InstallObjectManager)]
                }
            }
            (State::Activating { .. }, Event::Activated(Err(message))) => {
                self.fail(Error::Activation(message))
            }
            (State::AwaitingDiscovery, Event::Installed) => self.resolve(),
            (State::ResolvingDevice, Event::DefaultResolved(id)) => {
                if !is_valid_node(id) {
                    let device = self.device();
                    return self.fail(Error::DeviceNotFound { device });
                }
                self.state = State::ReadingState { id };
                vec![Action::Request(Request::ReadVolume(self.device(), id))]
            }
            (State::ReadingState { id }, Event::VolumeRead(None)) => {
                self.fail(Error::CapabilityUnsupported {
                    device: self.device(),
                    id,
                    capability: Capability::ReadVolumeMute,
                })
            }
            (State::ReadingState { id }, Event::VolumeRead(Some(current))) => {
                debug!("{} node {}: {:?}", self.device(), id, current);
                match self.operation.plan(current) {
                    None => {
                        let last = self.leg + 1 == self.legs.len();
                        let separator = if last { '\n' } else { ' ' };
                        let mut actions =
                            vec![Action::Print(format!("{}{}", current.report(), separator))];
                        actions.extend(self.leg_done());
                        actions
                    }
                    Some(update) => {
                        self.state = State::Applying {
                            id,
                            capability: update.capability(),
                        };
                        vec![Action::Request(Request::WriteVolume(self.device(), id, update))]
                    }
                }
            }
            (State::Applying { id, capability }, Event::VolumeWritten(ok)) => {
                if ok {
                    self.leg_done()
                } else {
                    self.fail(Error::CapabilityUnsupported {
                        device: self.device(),
                        id,
                        capability,
                    })
                }
            }
            (State::AwaitingBarrier, Event::Synced) => {
                self.state = State::Done;
                Vec::new()
            }
            (state, event) => {
                warn!("unexpected {:?} while {:?}", event, state);
                Vec::new()
            }
        }
    }
}

type EventQueue = Rc<RefCell<VecDeque<Event>>>;

fn push(events: &EventQueue, event: Event) {
    events.borrow_mut().push_back(event);
}

fn perform<C, W>(
    core: &mut C,
    action: Action,
    events: &EventQueue,
    out: &mut W,
) -> Result<(), Error>
where
    C: SessionCore,
    W: Write,
{
    let request = match action {
        Action::Print(text) => {
            out.write_all(text.as_bytes())?;
            out.flush()?;
            return Ok(());
        }
        Action::Request(request) => request,
    };
    debug!("request {:?}", request);

    let queue = Rc::clone(events);
    match request {
        Request::Connect => {
            let lost = Rc::clone(events);
            core.connect(
                Box::new(move |ok| push(&queue, Event::Connected(ok))),
                Box::new(move || push(&lost, Event::Disconnected)),
            );
        }
        Request::Activate(plugin) => {
            core.activate(plugin, Box::new(move |res| push(&queue, Event::Activated(res))));
        }
        Request::InstallObjectManager => {
            core.install_object_manager(
                &ObjectInterest::defaults(),
                Box::new(move |()| push(&queue, Event::Installed)),
            );
        }
        Request::ResolveDefault(device) => {
            core.default_node(
                device,
                Box::new(move |id| push(&queue, Event::DefaultResolved(id))),
            );
        }
        Request::ReadVolume(device, id) => {
            core.get_volume(
                device,
                id,
                Box::new(move |state| push(&queue, Event::VolumeRead(state))),
            );
        }
        Request::WriteVolume(device, id, update) => {
            core.set_volume(
                device,
                id,
                update,
                Box::new(move |ok| push(&queue, Event::VolumeWritten(ok))),
            );
        }
        Request::Sync => {
            core.sync(Box::new(move |()| push(&queue, Event::Synced)));
        }
    }
    Ok(())
}

/// Drives one pass to its end. The discovery session is torn down before
/// returning; the connection and plugins stay up for later passes.
pub fn run_pass<C, W>(
    core: &mut C,
    target: DeviceTarget,
    operation: VolumeOp,
    out: &mut W,
) -> Result<PassEnd, Error>
where
    C: SessionCore,
    W: Write,
{
    let events: EventQueue = Rc::new(RefCell::new(VecDeque::new()));
    let mut pipeline = Pipeline::new(target, operation);
    let mut actions = pipeline.start();

    let result = loop {
        if let Err(err) = actions
            .drain(..)
            .try_for_each(|action| perform(core, action, &events, out))
        {
            break Err(err);
        }
        if pipeline.is_finished() {
            break Ok(());
        }

        let next = events.borrow_mut().pop_front();
        match next {
            Some(event) => {
                debug!("{:?} -> {:?}", pipeline.state(), event);
                actions = pipeline.handle(event);
            }
            None => {
                if !core.iterate() {
                    actions = pipeline.handle(Event::Disconnected);
                }
            }
        }
    };

    if pipeline.discovering() {
        core.remove_object_manager();
    }
    result.and_then(|()| pipeline.finish())
}

/// The requested pass, then a get pass reporting where things ended up.
///
/// The get pass runs even if the peer went away during the first pass, so a
/// change that never reached the server surfaces as a connection failure.
pub fn run<C, W>(
    core: &mut C,
    target: DeviceTarget,
    operation: VolumeOp,
    out: &mut W,
) -> Result<(), Error>
where
    C: SessionCore,
    W: Write,
{
    if run_pass(core, target, operation, out)? == PassEnd::Disconnected {
        debug!("pass ended by disconnect");
    }
    if operation != VolumeOp::Get {
        run_pass(core, target, VolumeOp::Get, out)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::session::{Completion, Scale};

    const SINK: u32 = 40;
    const SOURCE: u32 = 51;

    #[derive(Default)]
    struct FakeCore {
        unreachable: bool,
        broken_plugin: Option<Plugin>,
        defaults: HashMap<Device, u32>,
        nodes: HashMap<u32, VolumeState>,
        read_only: bool,
        unreadable: bool,
        drop_after: Option<usize>,
        dropped: bool,
        scale: Option<Scale>,
        installs: usize,
        removals: usize,
        writes: Vec<(u32, VolumeUpdate)>,
        activations: Vec<Plugin>,
        pending: VecDeque<Box<dyn FnOnce()>>,
        on_disconnect: Option<Box<dyn FnMut()>>,
        iterations: usize,
    }

    impl FakeCore {
        fn with_nodes(playback: Option<VolumeState>, capture: Option<VolumeState>) -> Self {
            let mut core = Self::default();
            if let Some(state) = playback {
                core.defaults.insert(Device::Playback, SINK);
                core.nodes.insert(SINK, state);
            }
            if let Some(state) = capture {
                core.defaults.insert(Device::Capture, SOURCE);
                core.nodes.insert(SOURCE, state);
            }
            core
        }

        fn later(&mut self, f: impl FnOnce() + 'static) {
            self.pending.push_back(Box::new(f));
        }
    }

    impl SessionCore for FakeCore {
        fn load_component(&mut self, _name: &str) -> Result<(), Error> {
            Ok(())
        }

        fn set_mixer_scale(&mut self, scale: Scale) {
            self.scale = Some(scale);
        }

        fn connect(&mut self, done: Completion<bool>, on_disconnect: Box<dyn FnMut()>) {
            let ok = !self.unreachable && !self.dropped;
            self.on_disconnect = Some(on_disconnect);
            self.later(move || done(ok));
        }

        fn activate(&mut self, plugin: Plugin, done: Completion<Result<(), String>>) {
            self.activations.push(plugin);
            let res = if self.broken_plugin == Some(plugin) {
                Err(format!("{} failed to activate", plugin))
            } else {
                Ok(())
            };
            self.later(move || done(res));
        }

        fn install_object_manager(
            &mut self,
            _interest: &ObjectInterest,
            installed: Completion<()>,
        ) {
            self.installs += 1;
            self.later(move || installed(()));
        }

        fn remove_object_manager(&mut self) {
            self.removals += 1;
        }

        fn default_node(&mut self, device: Device, done: Completion<u32>) {
            let id = self.defaults.get(&device).copied().unwrap_or(0);
            self.later(move || done(id));
        }

        fn get_volume(&mut self, _device: Device, id: u32, done: Completion<Option<VolumeState>>) {
            let state = if self.unreadable {
                None
            } else {
                self.nodes.get(&id).copied()
            };
            self.later(move || done(state));
        }

        fn set_volume(
            &mut self,
            _device: Device,
            id: u32,
            update: VolumeUpdate,
            done: Completion<bool>,
        ) {
            self.writes.push((id, update));
            let ok = !self.read_only;
            if ok {
                if let Some(state) = self.nodes.get_mut(&id) {
                    if let Some(volume) = update.volume {
                        state.volume = volume;
                    }
                    if let Some(mute) = update.mute {
                        state.mute = mute;
                    }
                }
            }
            self.later(move || done(ok));
        }

        fn sync(&mut self, done: Completion<()>) {
            self.later(move || done(()));
        }

        fn iterate(&mut self) -> bool {
            self.iterations += 1;
            if self.drop_after == Some(self.iterations) {
                self.pending.clear();
                self.dropped = true;
                if let Some(lost) = self.on_disconnect.as_mut() {
                    lost();
                }
                return true;
            }
            match self.pending.pop_front() {
                Some(f) => {
                    f();
                    true
                }
                None => false,
            }
        }
    }

    fn state(volume: f64, mute: bool) -> VolumeState {
        VolumeState { volume, mute }
    }

    fn run_with(
        core: &mut FakeCore,
        target: DeviceTarget,
        op: VolumeOp,
    ) -> (Result<(), Error>, String) {
        let mut out = Vec::new();
        let res = run(core, target, op, &mut out);
        (res, String::from_utf8(out).unwrap())
    }

    #[test]
    fn get_playback() {
        let mut core = FakeCore::with_nodes(Some(state(0.37, false)), None);
        let (res, out) = run_with(&mut core, DeviceTarget::Playback, VolumeOp::Get);
        assert!(res.is_ok());
        assert_eq!(out, "37 on\n");
        assert!(core.writes.is_empty());
        assert_eq!(core.installs, 1);
        assert_eq!(core.removals, 1);
    }

    #[test]
    fn both_get_joins_on_one_line() {
        let mut core = FakeCore::with_nodes(Some(state(0.37, false)), Some(state(0.2, true)));
        let (res, out) = run_with(&mut core, DeviceTarget::Both, VolumeOp::Get);
        assert!(res.is_ok());
        assert_eq!(out, "37 on 20 off\n");
    }

    #[test]
    fn relative_raise_then_report() {
        let mut core = FakeCore::with_nodes(None, Some(state(0.8, false)));
        let (res, out) = run_with(&mut core, DeviceTarget::Capture, VolumeOp::AdjustRelative(15));
        assert!(res.is_ok());
        assert_eq!(out, "95 on\n");
        assert_eq!(core.writes.len(), 1);
        let (id, update) = core.writes[0];
        assert_eq!(id, SOURCE);
        assert_eq!(update.mute, None);
        assert!((update.volume.unwrap() - 0.95).abs() < 1e-9);
        assert_eq!(core.installs, 2);
        assert_eq!(core.removals, 2);
    }

    #[test]
    fn absolute_set_round_trips() {
        let mut core = FakeCore::with_nodes(Some(state(0.1, true)), None);
        let (res, out) = run_with(&mut core, DeviceTarget::Playback, VolumeOp::SetAbsolute(50));
        assert!(res.is_ok());
        assert_eq!(out, "50 off\n");
        assert_eq!(core.writes, vec![(SINK, VolumeUpdate::volume(0.5))]);
    }

    #[test]
    fn mute_is_idempotent() {
        let mut core = FakeCore::with_nodes(Some(state(0.6, true)), None);
        let (res, out) = run_with(&mut core, DeviceTarget::Playback, VolumeOp::Mute);
        assert!(res.is_ok());
        assert_eq!(out, "60 off\n");
        assert_eq!(core.writes, vec![(SINK, VolumeUpdate::mute(true))]);
    }

    #[test]
    fn toggle_twice_restores() {
        let mut core = FakeCore::with_nodes(Some(state(0.6, false)), None);
        let (_, first) = run_with(&mut core, DeviceTarget::Playback, VolumeOp::ToggleMute);
        let (_, second) = run_with(&mut core, DeviceTarget::Playback, VolumeOp::ToggleMute);
        assert_eq!(first, "60 off\n");
        assert_eq!(second, "60 on\n");
        assert!(!core.nodes[&SINK].mute);
    }

    #[test]
    fn both_mute_touches_playback_then_capture() {
        let mut core = FakeCore::with_nodes(Some(state(0.3, false)), Some(state(0.7, false)));
        let (res, out) = run_with(&mut core, DeviceTarget::Both, VolumeOp::Mute);
        assert!(res.is_ok());
        assert_eq!(out, "30 off 70 off\n");
        assert_eq!(
            core.writes,
            vec![
                (SINK, VolumeUpdate::mute(true)),
                (SOURCE, VolumeUpdate::mute(true))
            ]
        );
        assert_eq!(
            core.activations,
            vec![
                Plugin::DefaultNodes,
                Plugin::Mixer,
                Plugin::DefaultNodes,
                Plugin::Mixer
            ]
        );
    }

    #[test]
    fn missing_playback_default_stops_both() {
        let mut core = FakeCore::with_nodes(None, Some(state(0.7, false)));
        let (res, out) = run_with(&mut core, DeviceTarget::Both, VolumeOp::Mute);
        match res {
            Err(err @ Error::DeviceNotFound { device: Device::Playback }) => {
                assert_eq!(err.exit_code(), 1);
                assert!(err.to_string().contains("playback"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(out.is_empty());
        assert!(core.writes.is_empty());
    }

    #[test]
    fn second_leg_failure_keeps_first_change() {
        let mut core = FakeCore::with_nodes(Some(state(0.3, false)), None);
        let (res, _) = run_with(&mut core, DeviceTarget::Both, VolumeOp::Mute);
        assert!(matches!(
            res,
            Err(Error::DeviceNotFound {
                device: Device::Capture
            })
        ));
        assert!(core.nodes[&SINK].mute);
    }

    #[test]
    fn max_id_means_no_default() {
        let mut core = FakeCore::with_nodes(Some(state(0.3, false)), None);
        core.defaults.insert(Device::Playback, u32::MAX);
        let (res, _) = run_with(&mut core, DeviceTarget::Playback, VolumeOp::Get);
        assert!(matches!(res, Err(Error::DeviceNotFound { .. })));
    }

    #[test]
    fn unreadable_node() {
        let mut core = FakeCore::with_nodes(Some(state(0.3, false)), None);
        core.unreadable = true;
        let (res, _) = run_with(&mut core, DeviceTarget::Playback, VolumeOp::SetAbsolute(10));
        let err = res.unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("playback device (node {}) does not support reading volume/mute", SINK)
        );
        assert!(core.writes.is_empty());
    }

    #[test]
    fn rejected_write() {
        let mut core = FakeCore::with_nodes(None, Some(state(0.3, false)));
        core.read_only = true;
        let (res, out) = run_with(&mut core, DeviceTarget::Capture, VolumeOp::Unmute);
        let err = res.unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("capture device (node {}) does not support setting mute", SOURCE)
        );
        assert!(out.is_empty());
    }

    #[test]
    fn unreachable_service_exits_with_two() {
        let mut core = FakeCore::with_nodes(Some(state(0.3, false)), None);
        core.unreachable = true;
        let (res, _) = run_with(&mut core, DeviceTarget::Playback, VolumeOp::Get);
        let err = res.unwrap_err();
        assert!(matches!(err, Error::ServiceUnreachable));
        assert_eq!(err.exit_code(), 2);
        assert!(core.activations.is_empty());
        assert_eq!(core.removals, 0);
    }

    #[test]
    fn activation_failure_skips_discovery() {
        let mut core = FakeCore::with_nodes(Some(state(0.3, false)), None);
        core.broken_plugin = Some(Plugin::DefaultNodes);
        let (res, _) = run_with(&mut core, DeviceTarget::Playback, VolumeOp::Mute);
        assert!(matches!(res, Err(Error::Activation(_))));
        assert_eq!(core.installs, 0);
        assert!(core.writes.is_empty());
    }

    #[test]
    fn disconnect_during_change_fails_the_report() {
        let mut core = FakeCore::with_nodes(Some(state(0.3, false)), None);
        // connect, two activations, discovery, then the peer goes away
        // before the default node is resolved
        core.drop_after = Some(5);
        let (res, out) = run_with(&mut core, DeviceTarget::Playback, VolumeOp::Mute);
        let err = res.unwrap_err();
        assert!(matches!(err, Error::ServiceUnreachable));
        assert_eq!(err.exit_code(), 2);
        assert!(out.is_empty());
        assert!(core.writes.is_empty());
        assert_eq!(core.installs, 1);
        assert_eq!(core.removals, 1);
    }

    #[test]
    fn disconnect_during_get_ends_quietly() {
        let mut core = FakeCore::with_nodes(Some(state(0.3, false)), None);
        core.drop_after = Some(4);
        let (res, out) = run_with(&mut core, DeviceTarget::Playback, VolumeOp::Get);
        assert!(res.is_ok());
        assert!(out.is_empty());
        assert_eq!(core.installs, 1);
    }

    #[test]
    fn machine_ignores_events_after_failure() {
        let mut pipeline = Pipeline::new(DeviceTarget::Playback, VolumeOp::Get);
        pipeline.start();
        pipeline.handle(Event::Connected(true));
        pipeline.handle(Event::Activated(Err("nope".into())));
        assert_eq!(pipeline.state(), State::Failed);
        assert!(pipeline.handle(Event::Activated(Ok(()))).is_empty());
        assert_eq!(pipeline.state(), State::Failed);
        assert!(matches!(pipeline.finish(), Err(Error::Activation(_))));
    }

    #[test]
    fn discovery_waits_for_both_plugins() {
        let mut pipeline = Pipeline::new(DeviceTarget::Capture, VolumeOp::Get);
        pipeline.start();
        let actions = pipeline.handle(Event::Connected(true));
        assert_eq!(actions.len(), 2);
        assert!(pipeline.handle(Event::Activated(Ok(()))).is_empty());
        assert_eq!(
            pipeline.handle(Event::Activated(Ok(()))),
            vec![Action::Request(Request::InstallObjectManager)]
        );
        assert_eq!(
            pipeline.handle(Event::Installed),
            vec![Action::Request(Request::ResolveDefault(Device::Capture))]
        );
    }
}
