//! In-memory doubles for the hardware, call-control and trunk protocol
//! surfaces.
//!
//! Every double records what the driver asked of it so tests can assert on
//! the exact sequence of hardware and protocol operations. Events are
//! injected from the test and delivered through the same polling paths the
//! real collaborators use.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::channel::{Channel, ChannelHandle, SignalingFamily, TrunkBinding};
use crate::collaborator::{CallControl, Frame, NewCall};
use crate::config::{ChannelConfig, SpanConfig, TrunkConfig};
use crate::context::DriverContext;
use crate::error::Cause;
use crate::line::{BufferPolicy, GainTable, LineEvent, LineInterface, LineParams, PollInterest, Readiness};
use crate::trunk::group::BearerSlot;
use crate::trunk::{CallRef, ChannelDesignator, SetupRequest, TrunkEngine, TrunkEvent, TrunkGroup, TrunkProtocol};
use crate::types::{
    AppliedConf, CallState, ChannelId, ConfNumber, ConfRequest, Descriptor, EchoCommand, HookCommand, Law, OwnerId,
    SpanId, Tone, TrunkGroupId,
};

/// First descriptor handed out for pseudo channels
pub const PSEUDO_BASE: i32 = 1000;

/// A hardware operation recorded by [`MockLine`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineCall {
    Open(ChannelId),
    OpenPseudo(Descriptor),
    Close(Descriptor),
    SetParams(Descriptor),
    SetLaw(Descriptor, Law),
    SetLinear(Descriptor, bool),
    SetHook(Descriptor, HookCommand),
    SetCadence(Descriptor, Option<Vec<u32>>),
    SetGains(Descriptor),
    SetConf(Descriptor, ConfRequest),
    EchoCancel(Descriptor, EchoCommand),
    PlayTone(Descriptor, Option<Tone>),
    Flush(Descriptor),
    SetBufferPolicy(Descriptor),
    Dial(Descriptor, String),
    Write(Descriptor, Vec<u8>),
}

#[derive(Default)]
struct LineState {
    calls: Vec<LineCall>,
    events: HashMap<Descriptor, VecDeque<LineEvent>>,
    gains: HashMap<Descriptor, GainTable>,
    conf: HashMap<Descriptor, AppliedConf>,
    off_hook: HashSet<Descriptor>,
    next_pseudo: i32,
    next_conf: u32,
    fail_pseudo: bool,
}

/// Scriptable TDM hardware; a channel's descriptor is its channel number
pub struct MockLine {
    state: Mutex<LineState>,
    wake: Notify,
}

impl Default for MockLine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LineState {
                next_pseudo: PSEUDO_BASE,
                next_conf: 1,
                ..Default::default()
            }),
            wake: Notify::new(),
        }
    }

    pub fn calls(&self) -> Vec<LineCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Queue a hardware event on a descriptor and wake any waiter
    pub fn inject(&self, descriptor: Descriptor, event: LineEvent) {
        self.state.lock().events.entry(descriptor).or_default().push_back(event);
        self.wake.notify_waiters();
    }

    /// Events injected but not yet consumed
    pub fn pending_events(&self, descriptor: Descriptor) -> usize {
        self.state.lock().events.get(&descriptor).map_or(0, |q| q.len())
    }

    /// Gain table last loaded on a descriptor
    pub fn gains(&self, descriptor: Descriptor) -> Option<GainTable> {
        self.state.lock().gains.get(&descriptor).cloned()
    }

    pub fn conf(&self, descriptor: Descriptor) -> AppliedConf {
        self.state.lock().conf.get(&descriptor).copied().unwrap_or_default()
    }

    /// Report the line's hook state through [`LineParams::off_hook`]
    pub fn set_off_hook(&self, descriptor: Descriptor, off_hook: bool) {
        let mut state = self.state.lock();
        if off_hook {
            state.off_hook.insert(descriptor);
        } else {
            state.off_hook.remove(&descriptor);
        }
    }

    /// Make pseudo channel allocation fail
    pub fn fail_pseudo(&self, fail: bool) {
        self.state.lock().fail_pseudo = fail;
    }

    /// Bytes written to a descriptor so far
    pub fn written(&self, descriptor: Descriptor) -> Vec<u8> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                LineCall::Write(d, data) if *d == descriptor => Some(data.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    fn record(&self, call: LineCall) {
        self.state.lock().calls.push(call);
    }

    fn pop_event(&self, descriptor: Descriptor) -> Option<LineEvent> {
        self.state.lock().events.get_mut(&descriptor).and_then(|q| q.pop_front())
    }

    fn ready(&self, interests: &[PollInterest]) -> Vec<Readiness> {
        let state = self.state.lock();
        interests
            .iter()
            .filter_map(|interest| {
                let event = state.events.get(&interest.descriptor).is_some_and(|q| !q.is_empty());
                if !event && !interest.writable {
                    return None;
                }
                Some(Readiness {
                    descriptor: interest.descriptor,
                    event,
                    readable: false,
                    writable: interest.writable,
                })
            })
            .collect()
    }
}

#[async_trait]
impl LineInterface for MockLine {
    fn open(&self, channel: ChannelId) -> io::Result<Descriptor> {
        self.record(LineCall::Open(channel));
        Ok(Descriptor(channel.0 as i32))
    }

    fn open_pseudo(&self) -> io::Result<Descriptor> {
        let descriptor = {
            let mut state = self.state.lock();
            if state.fail_pseudo {
                return Err(io::Error::new(io::ErrorKind::Other, "no pseudo channels left"));
            }
            let descriptor = Descriptor(state.next_pseudo);
            state.next_pseudo += 1;
            descriptor
        };
        self.record(LineCall::OpenPseudo(descriptor));
        Ok(descriptor)
    }

    fn close(&self, descriptor: Descriptor) {
        self.record(LineCall::Close(descriptor));
    }

    fn get_params(&self, descriptor: Descriptor) -> io::Result<LineParams> {
        Ok(LineParams {
            off_hook: self.state.lock().off_hook.contains(&descriptor),
            ..LineParams::default()
        })
    }

    fn set_params(&self, descriptor: Descriptor, _params: &LineParams) -> io::Result<()> {
        self.record(LineCall::SetParams(descriptor));
        Ok(())
    }

    fn set_law(&self, descriptor: Descriptor, law: Law) -> io::Result<()> {
        self.record(LineCall::SetLaw(descriptor, law));
        Ok(())
    }

    fn set_linear(&self, descriptor: Descriptor, linear: bool) -> io::Result<()> {
        self.record(LineCall::SetLinear(descriptor, linear));
        Ok(())
    }

    fn set_hook(&self, descriptor: Descriptor, command: HookCommand) -> io::Result<()> {
        self.record(LineCall::SetHook(descriptor, command));
        Ok(())
    }

    fn set_cadence(&self, descriptor: Descriptor, cadence: Option<&[u32]>) -> io::Result<()> {
        self.record(LineCall::SetCadence(descriptor, cadence.map(<[u32]>::to_vec)));
        Ok(())
    }

    fn get_gains(&self, descriptor: Descriptor) -> io::Result<GainTable> {
        self.gains(descriptor)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no gains loaded"))
    }

    fn set_gains(&self, descriptor: Descriptor, gains: &GainTable) -> io::Result<()> {
        let mut state = self.state.lock();
        state.gains.insert(descriptor, gains.clone());
        state.calls.push(LineCall::SetGains(descriptor));
        Ok(())
    }

    fn get_conf(&self, descriptor: Descriptor) -> io::Result<AppliedConf> {
        Ok(self.conf(descriptor))
    }

    fn set_conf(&self, descriptor: Descriptor, request: ConfRequest) -> io::Result<Option<ConfNumber>> {
        let mut state = self.state.lock();
        state.calls.push(LineCall::SetConf(descriptor, request));
        let (applied, number) = match request {
            ConfRequest::Unattached => (AppliedConf::Unattached, None),
            ConfRequest::Monitor(peer) => (AppliedConf::Monitor(peer), None),
            ConfRequest::Join { number, mode } => {
                let number = number.unwrap_or_else(|| {
                    let allocated = ConfNumber(state.next_conf);
                    state.next_conf += 1;
                    allocated
                });
                (AppliedConf::Member { number, mode }, Some(number))
            }
        };
        state.conf.insert(descriptor, applied);
        Ok(number)
    }

    fn echo_cancel(&self, descriptor: Descriptor, command: EchoCommand) -> io::Result<()> {
        self.record(LineCall::EchoCancel(descriptor, command));
        Ok(())
    }

    fn play_tone(&self, descriptor: Descriptor, tone: Option<Tone>) -> io::Result<()> {
        self.record(LineCall::PlayTone(descriptor, tone));
        Ok(())
    }

    fn flush(&self, descriptor: Descriptor) -> io::Result<()> {
        self.record(LineCall::Flush(descriptor));
        Ok(())
    }

    fn set_buffer_policy(&self, descriptor: Descriptor, _policy: BufferPolicy) -> io::Result<()> {
        self.record(LineCall::SetBufferPolicy(descriptor));
        Ok(())
    }

    fn dial(&self, descriptor: Descriptor, dial_string: &str) -> io::Result<()> {
        self.record(LineCall::Dial(descriptor, dial_string.to_string()));
        Ok(())
    }

    fn is_dialing(&self, _descriptor: Descriptor) -> io::Result<bool> {
        Ok(false)
    }

    fn get_event(&self, descriptor: Descriptor) -> io::Result<Option<LineEvent>> {
        Ok(self.pop_event(descriptor))
    }

    fn read(&self, _descriptor: Descriptor, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::ErrorKind::WouldBlock.into())
    }

    fn write(&self, descriptor: Descriptor, data: &[u8]) -> io::Result<usize> {
        self.record(LineCall::Write(descriptor, data.to_vec()));
        Ok(data.len())
    }

    fn modulate_callerid(&self, message: &[u8], _law: Law) -> Bytes {
        let mut tones = b"FSK:".to_vec();
        tones.extend_from_slice(message);
        Bytes::from(tones)
    }

    fn modulate_tdd(&self, text: &str, _law: Law) -> Bytes {
        Bytes::from(format!("TDD:{}", text))
    }

    async fn poll(&self, interests: &[PollInterest], timeout: Duration) -> io::Result<Vec<Readiness>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let ready = self.ready(interests);
            if !ready.is_empty() {
                return Ok(ready);
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(Vec::new()),
            }
        }
    }

    async fn next_event(&self, descriptor: Descriptor, timeout: Duration) -> io::Result<Option<LineEvent>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(event) = self.pop_event(descriptor) {
                return Ok(Some(event));
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }
}

struct ControlState {
    next_owner: u64,
    new_calls: Vec<NewCall>,
    frames: Vec<(OwnerId, Frame)>,
    soft_hangups: Vec<(OwnerId, Cause)>,
    started: Vec<(OwnerId, String, String)>,
    states: Vec<(OwnerId, CallState)>,
    extensions: HashSet<(String, String)>,
    voicemail: HashSet<String>,
    transfers: Vec<(OwnerId, OwnerId)>,
    refuse_calls: bool,
    refuse_pbx: bool,
    transfer_succeeds: bool,
}

/// Call-processing engine double
pub struct MockCallControl {
    state: Mutex<ControlState>,
}

impl Default for MockCallControl {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCallControl {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ControlState {
                next_owner: 1,
                new_calls: Vec::new(),
                frames: Vec::new(),
                soft_hangups: Vec::new(),
                started: Vec::new(),
                states: Vec::new(),
                extensions: HashSet::new(),
                voicemail: HashSet::new(),
                transfers: Vec::new(),
                refuse_calls: false,
                refuse_pbx: false,
                transfer_succeeds: true,
            }),
        }
    }

    pub fn add_extension(&self, context: &str, extension: &str) {
        self.state
            .lock()
            .extensions
            .insert((context.to_string(), extension.to_string()));
    }

    pub fn set_voicemail(&self, mailbox: &str, waiting: bool) {
        let mut state = self.state.lock();
        if waiting {
            state.voicemail.insert(mailbox.to_string());
        } else {
            state.voicemail.remove(mailbox);
        }
    }

    /// Fail every call object allocation
    pub fn refuse_calls(&self, refuse: bool) {
        self.state.lock().refuse_calls = refuse;
    }

    /// Fail every dial plan start
    pub fn refuse_pbx(&self, refuse: bool) {
        self.state.lock().refuse_pbx = refuse;
    }

    pub fn set_transfer_result(&self, succeeds: bool) {
        self.state.lock().transfer_succeeds = succeeds;
    }

    pub fn new_calls(&self) -> Vec<NewCall> {
        self.state.lock().new_calls.clone()
    }

    pub fn frames(&self) -> Vec<(OwnerId, Frame)> {
        self.state.lock().frames.clone()
    }

    pub fn soft_hangups(&self) -> Vec<(OwnerId, Cause)> {
        self.state.lock().soft_hangups.clone()
    }

    /// Dial plan starts as (owner, context, extension)
    pub fn started(&self) -> Vec<(OwnerId, String, String)> {
        self.state.lock().started.clone()
    }

    pub fn states(&self) -> Vec<(OwnerId, CallState)> {
        self.state.lock().states.clone()
    }

    pub fn transfers(&self) -> Vec<(OwnerId, OwnerId)> {
        self.state.lock().transfers.clone()
    }
}

impl CallControl for MockCallControl {
    fn new_call(&self, request: &NewCall) -> Option<OwnerId> {
        let mut state = self.state.lock();
        if state.refuse_calls {
            return None;
        }
        let owner = OwnerId(state.next_owner);
        state.next_owner += 1;
        state.new_calls.push(request.clone());
        Some(owner)
    }

    fn queue_frame(&self, owner: OwnerId, frame: Frame) {
        self.state.lock().frames.push((owner, frame));
    }

    fn soft_hangup(&self, owner: OwnerId, cause: Cause) {
        self.state.lock().soft_hangups.push((owner, cause));
    }

    fn start_pbx(&self, owner: OwnerId, context: &str, extension: &str) -> bool {
        let mut state = self.state.lock();
        if state.refuse_pbx {
            return false;
        }
        state
            .started
            .push((owner, context.to_string(), extension.to_string()));
        true
    }

    fn extension_exists(&self, context: &str, extension: &str, _caller: Option<&str>) -> bool {
        self.state
            .lock()
            .extensions
            .contains(&(context.to_string(), extension.to_string()))
    }

    fn can_match_more(&self, context: &str, extension: &str, _caller: Option<&str>) -> bool {
        self.state
            .lock()
            .extensions
            .iter()
            .any(|(c, e)| c == context && e.len() > extension.len() && e.starts_with(extension))
    }

    fn has_voicemail(&self, mailbox: &str) -> bool {
        self.state.lock().voicemail.contains(mailbox)
    }

    fn attempt_transfer(&self, held: OwnerId, target: OwnerId) -> bool {
        let mut state = self.state.lock();
        state.transfers.push((held, target));
        state.transfer_succeeds
    }

    fn state_changed(&self, owner: OwnerId, state: CallState) {
        self.state.lock().states.push((owner, state));
    }
}

/// A primitive recorded by [`MockTrunkProtocol`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolCall {
    Setup(CallRef, SetupRequest),
    SetupAck(CallRef),
    Proceeding(CallRef),
    Progress(CallRef),
    Alerting(CallRef),
    Answer(CallRef),
    Notify(CallRef, bool),
    Information(CallRef, char),
    Hangup(CallRef, Cause),
    Destroy(CallRef),
    Reset(ChannelDesignator),
}

struct ProtocolState {
    calls: Vec<ProtocolCall>,
    events: VecDeque<TrunkEvent>,
    next_call: u32,
    fail_setup: bool,
}

/// Trunk protocol stack double
pub struct MockTrunkProtocol {
    state: Mutex<ProtocolState>,
    wake: Notify,
}

impl Default for MockTrunkProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTrunkProtocol {
    /// Outbound call references start here
    pub const FIRST_CALL: u32 = 1000;

    pub fn new() -> Self {
        Self {
            state: Mutex::new(ProtocolState {
                calls: Vec::new(),
                events: VecDeque::new(),
                next_call: Self::FIRST_CALL,
                fail_setup: false,
            }),
            wake: Notify::new(),
        }
    }

    pub fn calls(&self) -> Vec<ProtocolCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Queue an event for [`TrunkProtocol::next_event`]
    pub fn push_event(&self, event: TrunkEvent) {
        self.state.lock().events.push_back(event);
        self.wake.notify_waiters();
    }

    pub fn fail_setup(&self, fail: bool) {
        self.state.lock().fail_setup = fail;
    }

    fn record(&self, call: ProtocolCall) -> io::Result<()> {
        self.state.lock().calls.push(call);
        Ok(())
    }
}

#[async_trait]
impl TrunkProtocol for MockTrunkProtocol {
    fn new_call(&self) -> Option<CallRef> {
        let mut state = self.state.lock();
        let call = CallRef(state.next_call);
        state.next_call += 1;
        Some(call)
    }

    fn setup(&self, call: CallRef, request: &SetupRequest) -> io::Result<()> {
        if self.state.lock().fail_setup {
            return Err(io::Error::new(io::ErrorKind::Other, "setup refused"));
        }
        self.record(ProtocolCall::Setup(call, request.clone()))
    }

    fn setup_ack(&self, call: CallRef, _channel: ChannelDesignator, _inband: bool) -> io::Result<()> {
        self.record(ProtocolCall::SetupAck(call))
    }

    fn proceeding(&self, call: CallRef, _channel: ChannelDesignator, _inband: bool) -> io::Result<()> {
        self.record(ProtocolCall::Proceeding(call))
    }

    fn progress(&self, call: CallRef, _channel: ChannelDesignator, _inband: bool) -> io::Result<()> {
        self.record(ProtocolCall::Progress(call))
    }

    fn alerting(&self, call: CallRef, _channel: ChannelDesignator, _inband: bool) -> io::Result<()> {
        self.record(ProtocolCall::Alerting(call))
    }

    fn answer(&self, call: CallRef, _channel: ChannelDesignator) -> io::Result<()> {
        self.record(ProtocolCall::Answer(call))
    }

    fn notify(&self, call: CallRef, _channel: ChannelDesignator, hold: bool) -> io::Result<()> {
        self.record(ProtocolCall::Notify(call, hold))
    }

    fn information(&self, call: CallRef, digit: char) -> io::Result<()> {
        self.record(ProtocolCall::Information(call, digit))
    }

    fn hangup(&self, call: CallRef, cause: Cause) -> io::Result<()> {
        self.record(ProtocolCall::Hangup(call, cause))
    }

    fn destroy_call(&self, call: CallRef) {
        self.state.lock().calls.push(ProtocolCall::Destroy(call));
    }

    fn reset(&self, channel: ChannelDesignator) -> io::Result<()> {
        self.record(ProtocolCall::Reset(channel))
    }

    fn next_timer(&self) -> Option<Duration> {
        None
    }

    async fn next_event(&self, timeout: Duration) -> io::Result<Option<TrunkEvent>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(event) = self.state.lock().events.pop_front() {
                return Ok(Some(event));
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }
}

/// One single-span trunk group wired to doubles, with its D-channel up
pub struct TrunkFixture {
    pub line: Arc<MockLine>,
    pub control: Arc<MockCallControl>,
    pub protocol: Arc<MockTrunkProtocol>,
    pub ctx: Arc<DriverContext>,
    pub engine: Arc<TrunkEngine>,
}

impl TrunkFixture {
    /// Bearers are channels `1..=bearers` on logical span 0
    pub fn new(bearers: u8, configure: impl FnOnce(&mut TrunkConfig)) -> Self {
        let line = Arc::new(MockLine::new());
        let control = Arc::new(MockCallControl::new());
        let protocol = Arc::new(MockTrunkProtocol::new());
        let ctx = Arc::new(DriverContext::new(line.clone(), control.clone(), Default::default()));
        let group_id = TrunkGroupId(1);
        let span = SpanConfig {
            span: SpanId(1),
            logical_span: 0,
            dchannels: vec![ChannelId(24)],
            bearers: (1..=u32::from(bearers)).map(ChannelId).collect(),
            crvs: Vec::new(),
        };
        let mut config = TrunkConfig::new(group_id, vec![span]);
        configure(&mut config);

        let slots = (1..=bearers)
            .map(|offset| {
                let channel_config = ChannelConfig::new(ChannelId(u32::from(offset)), SignalingFamily::Pri);
                let binding = TrunkBinding::new(group_id, 0, offset, None);
                let channel = Channel::new(channel_config, Descriptor(i32::from(offset)), Some(binding));
                BearerSlot {
                    logical_span: 0,
                    offset,
                    handle: Arc::new(ChannelHandle::new(channel)),
                }
            })
            .collect();
        let group = Arc::new(TrunkGroup::new(config, protocol.clone(), slots, Vec::new()));
        let engine = Arc::new(TrunkEngine::new(group, ctx.clone()));
        engine.handle_event(TrunkEvent::DChannelUp { dchannel: 0 });
        Self {
            line,
            control,
            protocol,
            ctx,
            engine,
        }
    }

    /// Bearer record at an offset
    pub fn bearer(&self, offset: u8) -> Arc<ChannelHandle> {
        self.engine
            .group()
            .bearers()
            .iter()
            .find(|slot| slot.offset == offset)
            .map(|slot| slot.handle.clone())
            .unwrap_or_else(|| panic!("no bearer at offset {}", offset))
    }
}
