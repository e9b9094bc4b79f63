//! Conference bus consistency and native bridging through the driver.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use tokio_util::sync::CancellationToken;

use rvoip_tdm_core::channel::Channel;
use rvoip_tdm_core::conference::recompute;
use rvoip_tdm_core::line::GainTable;
use rvoip_tdm_core::testing::{MockCallControl, MockLine};
use rvoip_tdm_core::types::{AppliedConf, Descriptor};
use rvoip_tdm_core::{
    BridgeExit, CallerInfo, Cause, ChannelConfig, ChannelId, Control, DriverConfig, Frame, Law, LegIndex, LineEvent,
    OwnerId, SignalingFamily, TdmDriver,
};

fn driver(stations: u32) -> (Arc<MockLine>, TdmDriver) {
    let line = Arc::new(MockLine::new());
    let config = DriverConfig {
        channels: (1..=stations)
            .map(|n| ChannelConfig::new(ChannelId(n), SignalingFamily::FxoLoopStart))
            .collect(),
        ..DriverConfig::default()
    };
    let driver = TdmDriver::new(config, line.clone(), Arc::new(MockCallControl::new()), HashMap::new()).unwrap();
    (line, driver)
}

/// Ring station `n` and pick it up
fn answer_station(line: &MockLine, driver: &TdmDriver, n: u32) -> OwnerId {
    let owner = driver.request(&n.to_string()).unwrap();
    driver.call(owner, "", &CallerInfo::default()).unwrap();
    driver.read_frame(owner).unwrap();
    line.inject(Descriptor(n as i32), LineEvent::RingOffHook);
    assert_eq!(driver.read_frame(owner).unwrap(), Frame::Control(Control::Answer));
    owner
}

#[derive(Debug, Clone)]
enum Step {
    Flash,
    WaitingCall,
    AnswerAll,
    Hangup(usize),
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        Just(Step::Flash),
        Just(Step::WaitingCall),
        Just(Step::AnswerAll),
        (0usize..3).prop_map(Step::Hangup),
    ]
}

fn owner_at(driver: &TdmDriver, index: LegIndex) -> Option<OwnerId> {
    driver.registry().get(ChannelId(1))?.lock().owner(index)
}

fn run_step(line: &MockLine, driver: &TdmDriver, step: &Step) {
    match step {
        Step::Flash => {
            if let Some(owner) = owner_at(driver, LegIndex::Real) {
                line.inject(Descriptor(1), LineEvent::WinkFlash);
                let _ = driver.read_frame(owner);
            }
        }
        Step::WaitingCall => {
            if let Ok(owner) = driver.request("1") {
                let _ = driver.call(owner, "", &CallerInfo::default());
            }
        }
        Step::AnswerAll => {
            for index in LegIndex::ALL {
                if let Some(owner) = owner_at(driver, index) {
                    let _ = driver.answer(owner);
                }
            }
        }
        Step::Hangup(n) => {
            if let Some(owner) = owner_at(driver, LegIndex::ALL[*n]) {
                let _ = driver.hangup(owner, Cause::NormalClearing);
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn conference_state_matches_hardware(steps in prop::collection::vec(step(), 1..12)) {
        // Digit collection started by a flash is spawned but never driven here
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let _guard = runtime.enter();
        let (line, driver) = driver(1);
        answer_station(&line, &driver, 1);

        for step in &steps {
            run_step(&line, &driver, step);
        }

        let handle = driver.registry().get(ChannelId(1)).unwrap();
        let mut ch = handle.lock();
        for index in LegIndex::ALL {
            if let Some(descriptor) = ch.legs().descriptor(index) {
                prop_assert_eq!(line.conf(descriptor), ch.legs().hardware(index).applied_conf);
            }
        }
        recompute(line.as_ref(), &mut ch);
        prop_assert_eq!(recompute(line.as_ref(), &mut ch), 0);
    }

    #[test]
    fn gain_bump_restores_configured_tables(
        rx in -10.0f32..10.0,
        tx in -10.0f32..10.0,
        bump in 0.5f32..12.0,
        alaw in any::<bool>(),
    ) {
        let line = MockLine::new();
        let law = if alaw { Law::Alaw } else { Law::Mulaw };
        let mut config = ChannelConfig::new(ChannelId(1), SignalingFamily::FxsLoopStart).with_gains(rx, tx);
        config.law = law;
        let mut ch = Channel::open(&line, config, None).unwrap();
        let configured = GainTable::compute(law, rx, tx);
        prop_assert_eq!(line.gains(Descriptor(1)), Some(configured.clone()));

        ch.bump_gain(&line, bump);
        prop_assert_eq!(line.gains(Descriptor(1)), Some(GainTable::compute(law, rx + bump, tx)));
        ch.restore_gain(&line);
        prop_assert_eq!(line.gains(Descriptor(1)), Some(configured));
    }
}

#[tokio::test(start_paused = true)]
async fn test_driver_bridges_two_stations() {
    let (line, driver) = driver(2);
    let a = answer_station(&line, &driver, 1);
    let b = answer_station(&line, &driver, 2);
    let cancel = CancellationToken::new();

    let far_end = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(line.conf(Descriptor(1)), AppliedConf::Monitor(ChannelId(2)));
        assert_eq!(line.conf(Descriptor(2)), AppliedConf::Monitor(ChannelId(1)));
        line.inject(Descriptor(2), LineEvent::OnHook);
    };
    let (exit, ()) = tokio::join!(driver.native_bridge(a, b, &cancel), far_end);

    assert_eq!(
        exit.unwrap(),
        BridgeExit::Frame {
            from: b,
            frame: Frame::Control(Control::Hangup),
        }
    );
    assert_eq!(line.conf(Descriptor(1)), AppliedConf::Unattached);
    assert_eq!(line.conf(Descriptor(2)), AppliedConf::Unattached);
}

#[tokio::test(start_paused = true)]
async fn test_bridge_stops_when_cancelled() {
    let (line, driver) = driver(2);
    let a = answer_station(&line, &driver, 1);
    let b = answer_station(&line, &driver, 2);
    let cancel = CancellationToken::new();

    let stop = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
    };
    let (exit, ()) = tokio::join!(driver.native_bridge(a, b, &cancel), stop);

    assert_eq!(exit.unwrap(), BridgeExit::Cancelled);
    assert_eq!(line.conf(Descriptor(1)), AppliedConf::Unattached);
    assert!(driver.native_bridge(a, a, &cancel).await.is_err());
}
