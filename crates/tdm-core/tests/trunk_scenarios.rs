//! Digital trunk call flows through the driver facade.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rvoip_tdm_core::config::CrvConfig;
use rvoip_tdm_core::testing::{LineCall, MockCallControl, MockLine, MockTrunkProtocol, ProtocolCall};
use rvoip_tdm_core::trunk::{CallRef, ChannelDesignator, DChannelStatus, NumberPlan};
use rvoip_tdm_core::types::Descriptor;
use rvoip_tdm_core::{
    CallState, CallerInfo, Cause, ChannelConfig, ChannelId, Control, DriverConfig, Frame, LegIndex, OwnerId,
    SignalingFamily, SpanConfig, SpanId, TdmDriver, TdmError, TrunkConfig, TrunkEvent, TrunkGroupId, TrunkProtocol,
};

const GROUP: TrunkGroupId = TrunkGroupId(1);
const CRV_CHANNEL: ChannelId = ChannelId(100);

struct Rig {
    line: Arc<MockLine>,
    control: Arc<MockCallControl>,
    protocol: Arc<MockTrunkProtocol>,
    driver: TdmDriver,
}

impl Rig {
    fn new() -> Self {
        let line = Arc::new(MockLine::new());
        let control = Arc::new(MockCallControl::new());
        let protocol = Arc::new(MockTrunkProtocol::new());

        let mut channels: Vec<ChannelConfig> = (1..=3)
            .map(|n| ChannelConfig::new(ChannelId(n), SignalingFamily::Pri))
            .collect();
        channels.push(ChannelConfig::new(CRV_CHANNEL, SignalingFamily::Pri));
        let span = SpanConfig {
            span: SpanId(1),
            logical_span: 0,
            dchannels: vec![ChannelId(24)],
            bearers: (1..=3).map(ChannelId).collect(),
            crvs: vec![CrvConfig {
                crv: 5,
                channel: CRV_CHANNEL,
            }],
        };
        let config = DriverConfig {
            channels,
            trunks: vec![TrunkConfig::new(GROUP, vec![span])],
            ..DriverConfig::default()
        };

        let mut protocols: HashMap<TrunkGroupId, Arc<dyn TrunkProtocol>> = HashMap::new();
        protocols.insert(GROUP, protocol.clone());
        let driver = TdmDriver::new(config, line.clone(), control.clone(), protocols).unwrap();
        Self {
            line,
            control,
            protocol,
            driver,
        }
    }

    fn event(&self, event: TrunkEvent) {
        self.driver.trunk_engine(GROUP).unwrap().handle_event(event);
    }

    fn link_up(&self) -> &Self {
        self.event(TrunkEvent::DChannelUp { dchannel: 0 });
        self
    }

    fn hangups(&self) -> Vec<ProtocolCall> {
        self.protocol
            .calls()
            .into_iter()
            .filter(|c| matches!(c, ProtocolCall::Hangup(..)))
            .collect()
    }
}

fn bearer(offset: u8) -> ChannelDesignator {
    ChannelDesignator::new(0, offset)
}

fn setup(call: u32, channel: Option<ChannelDesignator>, called: &str, flexible: bool) -> TrunkEvent {
    TrunkEvent::Setup {
        call: CallRef(call),
        channel,
        called: called.to_string(),
        caller: CallerInfo {
            number: Some("5552000".into()),
            ..CallerInfo::default()
        },
        complete: true,
        flexible,
    }
}

#[test]
fn test_requests_wait_for_the_link() {
    let rig = Rig::new();
    assert_eq!(rig.driver.trunk_status(GROUP), Some(vec![DChannelStatus::Provisioned]));
    assert!(matches!(rig.driver.request("1"), Err(TdmError::ResourceExhausted(_))));

    rig.link_up();
    assert_eq!(rig.driver.trunk_status(GROUP), Some(vec![DChannelStatus::Up]));
    assert!(rig.driver.request("1").is_ok());
    assert_eq!(rig.driver.trunk_status(TrunkGroupId(9)), None);
}

#[test]
fn test_outbound_call_progresses_and_clears() {
    let rig = Rig::new();
    rig.link_up();
    let owner = rig.driver.request("1").unwrap();
    rig.driver.call(owner, "15551234", &CallerInfo::default()).unwrap();

    let call = CallRef(MockTrunkProtocol::FIRST_CALL);
    let request = match rig.protocol.calls().first() {
        Some(ProtocolCall::Setup(c, request)) if *c == call => request.clone(),
        other => panic!("expected a setup, got {:?}", other),
    };
    assert_eq!(request.channel, bearer(1));
    assert_eq!(request.called, "5551234");
    assert_eq!(request.called_plan, NumberPlan::National);
    assert_eq!(rig.driver.show_channel(ChannelId(1)).unwrap().state, CallState::Dialing);

    rig.event(TrunkEvent::Proceeding { call, channel: bearer(1) });
    assert_eq!(rig.control.frames(), vec![(owner, Frame::Control(Control::Proceeding))]);
    rig.event(TrunkEvent::Alerting { call, channel: bearer(1) });
    assert_eq!(rig.driver.read_frame(owner).unwrap(), Frame::Control(Control::Ringing));
    assert_eq!(rig.driver.show_channel(ChannelId(1)).unwrap().state, CallState::Ringing);

    rig.event(TrunkEvent::Answer { call, channel: bearer(1) });
    assert_eq!(rig.driver.read_frame(owner).unwrap(), Frame::Control(Control::Answer));
    assert_eq!(rig.driver.show_channel(ChannelId(1)).unwrap().state, CallState::Up);

    // Far end releases first; our hangup then completes the clearing
    rig.event(TrunkEvent::Hangup {
        call,
        channel: bearer(1),
        cause: Cause::NormalClearing,
    });
    assert_eq!(rig.control.soft_hangups(), vec![(owner, Cause::NormalClearing)]);
    rig.driver.hangup(owner, Cause::NormalClearing).unwrap();

    assert_eq!(rig.hangups(), vec![ProtocolCall::Hangup(call, Cause::NormalClearing)]);
    let summary = rig.driver.show_channel(ChannelId(1)).unwrap();
    assert_eq!(summary.trunk_call, None);
    assert_eq!(summary.owners, 0);
}

#[test]
fn test_local_hangup_waits_for_release() {
    let rig = Rig::new();
    rig.link_up();
    let owner = rig.driver.request("1").unwrap();
    rig.driver.call(owner, "5551234", &CallerInfo::default()).unwrap();
    let call = CallRef(MockTrunkProtocol::FIRST_CALL);

    rig.driver.hangup(owner, Cause::NormalClearing).unwrap();
    assert_eq!(rig.hangups().len(), 1);
    assert_eq!(rig.driver.show_channel(ChannelId(1)).unwrap().trunk_call, Some(call.0));
    // Still bound to the call, so not offered to new requests
    assert!(rig.driver.request("1").is_err());

    rig.event(TrunkEvent::Hangup {
        call,
        channel: bearer(1),
        cause: Cause::NormalClearing,
    });
    assert_eq!(rig.driver.show_channel(ChannelId(1)).unwrap().trunk_call, None);
    assert!(rig.control.soft_hangups().is_empty());
}

#[test]
fn test_inbound_call_starts_dial_plan() {
    let rig = Rig::new();
    rig.link_up();
    rig.control.add_extension("default", "4000");
    rig.event(setup(7, Some(bearer(2)), "4000", false));

    assert!(rig.protocol.calls().contains(&ProtocolCall::Proceeding(CallRef(7))));
    assert_eq!(
        rig.control.started(),
        vec![(OwnerId(1), "default".to_string(), "4000".to_string())]
    );
    let summary = rig.driver.show_channel(ChannelId(2)).unwrap();
    assert_eq!(summary.state, CallState::Ring);
    assert_eq!(summary.trunk_call, Some(7));

    rig.driver.answer(OwnerId(1)).unwrap();
    assert!(rig.protocol.calls().contains(&ProtocolCall::Answer(CallRef(7))));
    assert_eq!(rig.driver.show_channel(ChannelId(2)).unwrap().state, CallState::Up);
}

#[test]
fn test_inbound_call_to_unknown_number_is_rejected() {
    let rig = Rig::new();
    rig.link_up();
    rig.event(setup(7, Some(bearer(2)), "9999", false));

    assert_eq!(rig.hangups(), vec![ProtocolCall::Hangup(CallRef(7), Cause::Unallocated)]);
    assert!(rig.control.new_calls().is_empty());
    assert_eq!(rig.driver.show_channel(ChannelId(2)).unwrap().trunk_call, None);
}

#[test]
fn test_glare_moves_flexible_setup() {
    let rig = Rig::new();
    rig.link_up();
    rig.control.add_extension("default", "4000");
    let owner = rig.driver.request("1").unwrap();
    rig.driver.call(owner, "5551234", &CallerInfo::default()).unwrap();

    rig.event(setup(7, Some(bearer(1)), "4000", true));
    assert_eq!(rig.driver.show_channel(ChannelId(2)).unwrap().trunk_call, Some(7));
    assert_eq!(
        rig.driver.show_channel(ChannelId(1)).unwrap().trunk_call,
        Some(MockTrunkProtocol::FIRST_CALL)
    );

    rig.event(setup(8, Some(bearer(1)), "4000", false));
    assert!(rig
        .hangups()
        .contains(&ProtocolCall::Hangup(CallRef(8), Cause::RequestedChanUnavailable)));
}

#[test]
fn test_call_reference_record_rides_bearer_until_released() {
    let rig = Rig::new();
    rig.link_up();
    rig.control.add_extension("default", "s");
    let crv_bearer = bearer(2).with_crv(5);
    rig.event(setup(9, Some(crv_bearer), "", false));

    let record = rig.driver.registry().get(CRV_CHANNEL).unwrap();
    assert_eq!(record.lock().physical(), Some(Descriptor(2)));
    let owner = record.lock().owner(LegIndex::Real).unwrap();
    assert_eq!(
        rig.control.started(),
        vec![(owner, "default".to_string(), "s".to_string())]
    );

    // A hangup request signals every leg but keeps the call until we clear it
    rig.event(TrunkEvent::HangupRequest {
        call: CallRef(9),
        channel: crv_bearer,
        cause: Cause::NormalClearing,
    });
    assert_eq!(rig.control.soft_hangups(), vec![(owner, Cause::NormalClearing)]);
    assert_eq!(rig.driver.show_channel(CRV_CHANNEL).unwrap().trunk_call, Some(9));

    rig.driver.hangup(owner, Cause::NormalClearing).unwrap();
    assert_eq!(rig.hangups(), vec![ProtocolCall::Hangup(CallRef(9), Cause::NormalClearing)]);
    assert_eq!(rig.driver.show_channel(CRV_CHANNEL).unwrap().trunk_call, Some(9));
    assert_eq!(record.lock().physical(), Some(Descriptor(2)));

    rig.event(TrunkEvent::HangupAck {
        call: CallRef(9),
        channel: crv_bearer,
    });
    assert_eq!(rig.driver.show_channel(CRV_CHANNEL).unwrap().trunk_call, None);
    assert_ne!(record.lock().physical(), Some(Descriptor(2)));
    // The bearer is free again
    assert!(rig.driver.request("2").is_ok());
}

#[test]
fn test_link_loss_blocks_calls() {
    let rig = Rig::new();
    rig.link_up();
    let owner = rig.driver.request("1").unwrap();

    rig.event(TrunkEvent::DChannelDown { dchannel: 0 });
    assert_eq!(rig.driver.trunk_status(GROUP), Some(vec![DChannelStatus::Down]));
    assert!(matches!(
        rig.driver.call(owner, "5551234", &CallerInfo::default()),
        Err(TdmError::Alarm(ChannelId(1)))
    ));
    assert!(rig.driver.request("2").is_err());
    assert!(rig.driver.show_channel(ChannelId(2)).unwrap().in_alarm);
}

#[test]
fn test_trunk_channels_cannot_be_destroyed() {
    let rig = Rig::new();
    assert!(matches!(
        rig.driver.destroy_channel(ChannelId(1)),
        Err(TdmError::InvalidState(_))
    ));
    assert!(rig.line.calls().iter().all(|c| !matches!(c, LineCall::Close(_))));
}

#[tokio::test(start_paused = true)]
async fn test_engine_task_consumes_protocol_events() {
    let rig = Rig::new();
    rig.driver.start();

    rig.protocol.push_event(TrunkEvent::DChannelUp { dchannel: 0 });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(rig.driver.trunk_status(GROUP), Some(vec![DChannelStatus::Up]));

    rig.driver.shutdown().await;
}
