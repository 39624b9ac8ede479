use std::sync::Mutex;

use canode_common::messages::{CanId, CanMessage, NmtCommand, NmtCommandSpecifier, NmtState};
use canode_node::{NmtControl, NodeConfig, ResetCmd};
use integration_tests::object_dict::NODE_ID;
use serial_test::serial;

mod utils;
use utils::{frames_with_id, setup, setup_with_config, BusLogger};

const HEARTBEAT_ID: u16 = 0x700 + NODE_ID as u16;

fn heartbeats(frames: &[CanMessage]) -> Vec<u8> {
    frames_with_id(frames, HEARTBEAT_ID)
        .iter()
        .map(|msg| {
            assert_eq!(1, msg.data().len());
            msg.data()[0]
        })
        .collect()
}

fn nmt(cmd: NmtCommandSpecifier, node: u8) -> CanMessage {
    NmtCommand { cmd, node }.into()
}

#[test]
#[serial]
fn test_bootup_then_heartbeats() {
    let mut node = setup();
    let mut rx = node.bus.new_receiver();
    let _logger = BusLogger::new(node.bus.new_receiver());

    // The bootup message goes out on the very first cycle
    node.process(0);
    let frames = rx.drain();
    assert_eq!(1, frames.len());
    assert_eq!(CanId::Std(0x70A), frames[0].id());
    assert_eq!(&[0x00], frames[0].data());
    assert_eq!(NmtState::PreOperational, node.node.nmt_state());

    // With no delay configured, the first heartbeat follows on the next cycle
    node.process(1000);
    assert_eq!(vec![0x7F], heartbeats(&rx.drain()));

    node.run(99, 1000);
    assert_eq!(Vec::<u8>::new(), heartbeats(&rx.drain()));
    node.process(1000);
    assert_eq!(vec![0x7F], heartbeats(&rx.drain()));
}

#[test]
#[serial]
fn test_heartbeat_period_is_kept() {
    let mut node = setup();
    let mut rx = node.bus.new_receiver();
    node.process(0);
    rx.drain();

    // Uneven cycle times, over two seconds
    let steps = [300u32, 1700, 4100, 900, 12_000, 2500];
    let mut now_us = 0u64;
    let mut last_hb_us = 0u64;
    let mut count = 0;
    while now_us < 2_000_000 {
        let step = steps[count % steps.len()];
        count += 1;
        now_us += step as u64;
        node.process(step);
        let hbs = heartbeats(&rx.drain());
        if !hbs.is_empty() {
            assert_eq!(vec![0x7F], hbs);
            // No gap longer than the period, plus one cycle of scheduling jitter
            assert!(now_us - last_hb_us <= 100_000 + step as u64);
            last_hb_us = now_us;
        }
    }
    assert!(now_us - last_hb_us <= 100_000 + 12_000);
}

#[test]
#[serial]
fn test_start_command() {
    let mut node = setup();
    let mut device = node.device();
    let mut rx = node.bus.new_receiver();
    node.process(0);
    node.process(1000);
    rx.drain();

    // Broadcast start
    device.send_now(CanMessage::new(CanId::Std(0), &[0x01, 0x00]));
    node.process(1000);
    assert_eq!(NmtState::Operational, node.node.nmt_state());
    node.process(1000);
    assert_eq!(vec![0x05], heartbeats(&rx.drain()));
}

#[test]
#[serial]
fn test_commands_for_other_nodes_are_ignored() {
    let mut node = setup();
    let mut device = node.device();
    node.process(0);

    device.send_now(nmt(NmtCommandSpecifier::Start, NODE_ID + 1));
    node.process(1000);
    assert_eq!(NmtState::PreOperational, node.node.nmt_state());

    device.send_now(nmt(NmtCommandSpecifier::Stop, NODE_ID));
    node.process(1000);
    assert_eq!(NmtState::Stopped, node.node.nmt_state());

    device.send_now(nmt(NmtCommandSpecifier::EnterPreOp, 0));
    node.process(1000);
    assert_eq!(NmtState::PreOperational, node.node.nmt_state());
}

#[test]
#[serial]
fn test_stopped_node_keeps_heartbeat() {
    let mut node = setup();
    let mut device = node.device();
    let mut rx = node.bus.new_receiver();
    node.process(0);
    device.send_now(nmt(NmtCommandSpecifier::Stop, 0));
    node.process(1000);
    rx.drain();

    node.process(1000);
    assert_eq!(vec![0x04], heartbeats(&rx.drain()));
    node.run(100, 1000);
    assert_eq!(vec![0x04], heartbeats(&rx.drain()));
}

#[test]
#[serial]
fn test_reset_communication() {
    let mut node = setup();
    let mut device = node.device();
    let mut rx = node.bus.new_receiver();
    node.process(0);
    device.send_now(nmt(NmtCommandSpecifier::Start, 0));
    node.run(5, 1000);
    rx.drain();

    device.send_now(nmt(NmtCommandSpecifier::ResetComm, NODE_ID));
    assert_eq!(ResetCmd::Comm, node.process(1000));
    // The bootup message is sent before returning, and the node is back in Pre-operational
    assert_eq!(vec![0x00], heartbeats(&rx.drain()));
    assert_eq!(NmtState::PreOperational, node.node.nmt_state());

    node.process(1000);
    assert_eq!(vec![0x7F], heartbeats(&rx.drain()));
}

#[test]
#[serial]
fn test_reset_application() {
    let mut node = setup();
    let mut device = node.device();
    let mut rx = node.bus.new_receiver();
    node.process(0);
    rx.drain();

    device.send_now(nmt(NmtCommandSpecifier::ResetApp, 0));
    assert_eq!(ResetCmd::App, node.process(1000));
    assert_eq!(vec![0x00], heartbeats(&rx.drain()));
}

#[test]
#[serial]
fn test_invalid_nmt_frame_ignored() {
    let mut node = setup();
    let mut device = node.device();
    node.process(0);

    device.send_now(CanMessage::new(CanId::Std(0), &[0x07, 0x00]));
    device.send_now(CanMessage::new(CanId::Std(0), &[0x01]));
    node.process(1000);
    assert_eq!(NmtState::PreOperational, node.node.nmt_state());
}

static STATES: Mutex<Vec<NmtState>> = Mutex::new(Vec::new());

fn record_state(state: NmtState) {
    STATES.lock().unwrap().push(state);
}

#[test]
#[serial]
fn test_state_change_callback() {
    STATES.lock().unwrap().clear();
    let mut node = setup();
    let mut device = node.device();
    node.node.register_state_change_callback(&record_state);

    node.process(0);
    device.send_now(nmt(NmtCommandSpecifier::Start, 0));
    node.run(3, 1000);
    device.send_now(nmt(NmtCommandSpecifier::Stop, 0));
    node.run(3, 1000);

    assert_eq!(
        vec![
            NmtState::PreOperational,
            NmtState::Operational,
            NmtState::Stopped
        ],
        *STATES.lock().unwrap()
    );
}

#[test]
#[serial]
fn test_startup_to_operational() {
    let config = NodeConfig {
        nmt_control: NmtControl {
            startup_to_operational: true,
            ..NmtControl::new()
        },
        ..NodeConfig::new()
    };
    let mut node = setup_with_config(config);
    let mut rx = node.bus.new_receiver();
    node.process(0);
    assert_eq!(vec![0x00], heartbeats(&rx.drain()));
    assert_eq!(NmtState::Operational, node.node.nmt_state());
    node.process(1000);
    assert_eq!(vec![0x05], heartbeats(&rx.drain()));
}

#[test]
#[serial]
fn test_request_quit() {
    let mut node = setup();
    let mut rx = node.bus.new_receiver();
    node.process(0);
    rx.drain();

    node.node.request_quit();
    assert_eq!(ResetCmd::Quit, node.process(200_000));
    assert!(rx.drain().is_empty());
}
