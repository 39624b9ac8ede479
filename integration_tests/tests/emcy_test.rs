use std::sync::Mutex;

use canode_common::{
    messages::{CanId, CanMessage, EmcyMessage, NmtCommand, NmtCommandSpecifier, NmtState},
    sdo::AbortCode,
    traits::CanSendError,
};
use canode_node::{
    emcy::{error_bit, error_code, error_register},
    hb_consumer::HbConsumerEvent,
};
use integration_tests::object_dict::NODE_ID;
use serial_test::serial;

mod utils;
use utils::{frames_with_id, setup, TestNode};

const EMCY_ID: u16 = 0x80 + NODE_ID as u16;
const HEARTBEAT_ID: u16 = 0x700 + NODE_ID as u16;
const REMOTE_NODE: u8 = 5;

fn emcy_frames(frames: &[CanMessage]) -> Vec<EmcyMessage> {
    frames_with_id(frames, EMCY_ID)
        .into_iter()
        .map(|msg| EmcyMessage::try_from(msg).unwrap())
        .collect()
}

fn nmt(node: &mut TestNode, cmd: NmtCommandSpecifier) {
    let mut device = node.device();
    device.send_now(NmtCommand { cmd, node: 0 }.into());
    node.process(0);
}

fn read_u32(node: &mut TestNode, index: u16, sub: u8) -> u32 {
    let data = node.sdo_read(index, sub).unwrap();
    u32::from_le_bytes(data.try_into().unwrap())
}

#[test]
#[serial]
fn test_application_error() {
    let mut node = setup();
    let mut rx = node.bus.new_receiver();
    node.process(0);
    rx.drain();

    let emcy = node.node.emcy();
    emcy.error_report(error_bit::MANUFACTURER_START, 0x4210, 0x1234);
    node.process(1000);
    let frames = frames_with_id(&rx.drain(), EMCY_ID);
    assert_eq!(1, frames.len());
    assert_eq!(&[0x10, 0x42, 0x09, 0x30, 0x34, 0x12, 0x00, 0x00], frames[0].data());

    assert_eq!(
        Ok(vec![error_register::GENERIC | error_register::TEMPERATURE]),
        node.sdo_read(0x1001, 0)
    );
    assert_eq!(Ok(vec![1]), node.sdo_read(0x1003, 0));
    assert_eq!(0x1234_4210, read_u32(&mut node, 0x1003, 1));

    // Reporting an active condition again does nothing
    emcy.error_report(error_bit::MANUFACTURER_START, 0x4210, 0x1234);
    node.process(1000);
    assert!(frames_with_id(&rx.drain(), EMCY_ID).is_empty());

    // Clearing it sends the "no error" message
    emcy.error_reset(error_bit::MANUFACTURER_START, 0);
    node.process(1000);
    let emcys = emcy_frames(&rx.drain());
    assert_eq!(1, emcys.len());
    assert_eq!(error_code::NO_ERROR, emcys[0].code);
    assert_eq!(0, emcys[0].register);
    assert_eq!(error_bit::MANUFACTURER_START, emcys[0].error_bit);
    assert_eq!(Ok(vec![0]), node.sdo_read(0x1001, 0));
    // The history is kept
    assert_eq!(Ok(vec![1]), node.sdo_read(0x1003, 0));
}

#[test]
#[serial]
fn test_error_history() {
    let mut node = setup();
    node.process(0);

    let emcy = node.node.emcy();
    for i in 0..10u8 {
        emcy.error_report(error_bit::MANUFACTURER_START + i, 0xFF00 + i as u16, 0);
        node.process(1000);
    }

    // Newest first, limited to eight entries
    assert_eq!(Ok(vec![8]), node.sdo_read(0x1003, 0));
    assert_eq!(0xFF09, read_u32(&mut node, 0x1003, 1));
    assert_eq!(0xFF02, read_u32(&mut node, 0x1003, 8));
    assert_eq!(Err(AbortCode::NoSuchSubIndex), node.sdo_read(0x1003, 9));

    assert_eq!(Err(AbortCode::InvalidValue), node.sdo_write(0x1003, 0, &[1]));
    assert_eq!(Err(AbortCode::ReadOnly), node.sdo_write(0x1003, 1, &[0, 0, 0, 0]));
    node.sdo_write(0x1003, 0, &[0]).unwrap();
    assert_eq!(Ok(vec![0]), node.sdo_read(0x1003, 0));
    // The conditions themselves stay active
    assert!(emcy.is_error(error_bit::MANUFACTURER_START));
}

#[test]
#[serial]
fn test_emcy_held_while_stopped() {
    let mut node = setup();
    let mut rx = node.bus.new_receiver();
    node.process(0);
    nmt(&mut node, NmtCommandSpecifier::Stop);
    rx.drain();

    node.node.emcy().error_report(error_bit::GENERIC_ERROR, error_code::GENERIC, 0);
    node.run(10, 1000);
    assert!(frames_with_id(&rx.drain(), EMCY_ID).is_empty());

    nmt(&mut node, NmtCommandSpecifier::EnterPreOp);
    node.process(1000);
    let emcys = emcy_frames(&rx.drain());
    assert_eq!(1, emcys.len());
    assert_eq!(error_code::GENERIC, emcys[0].code);
}

#[test]
#[serial]
fn test_inhibit_time() {
    let mut node = setup();
    let mut rx = node.bus.new_receiver();
    node.process(0);
    node.sdo_write(0x1015, 0, &100u16.to_le_bytes()).unwrap();
    rx.drain();

    let emcy = node.node.emcy();
    emcy.error_report(error_bit::MANUFACTURER_START, error_code::DEVICE_SPECIFIC, 0);
    emcy.error_report(error_bit::MANUFACTURER_START + 1, error_code::DEVICE_SPECIFIC, 1);

    let mut sent_at = Vec::new();
    for t in 1..=30u32 {
        node.process(1000);
        for msg in emcy_frames(&rx.drain()) {
            sent_at.push((t, msg.info));
        }
    }
    assert_eq!(vec![(1, 0), (11, 1)], sent_at);
}

#[test]
#[serial]
fn test_cob_id() {
    let mut node = setup();
    let mut rx = node.bus.new_receiver();
    node.process(0);

    assert_eq!(EMCY_ID as u32, read_u32(&mut node, 0x1014, 0));
    // The ID can't change while the producer is enabled
    assert_eq!(
        Err(AbortCode::InvalidValue),
        node.sdo_write(0x1014, 0, &0x0000_0090u32.to_le_bytes())
    );

    node.sdo_write(0x1014, 0, &0x8000_0000u32.to_le_bytes()).unwrap();
    node.sdo_write(0x1014, 0, &0x0000_0090u32.to_le_bytes()).unwrap();
    rx.drain();
    node.node.emcy().error_report(error_bit::GENERIC_ERROR, error_code::GENERIC, 0);
    node.process(1000);
    let frames = rx.drain();
    assert!(frames_with_id(&frames, EMCY_ID).is_empty());
    assert_eq!(1, frames_with_id(&frames, 0x90).len());
}

static RECEIVED_EMCY: Mutex<Vec<EmcyMessage>> = Mutex::new(Vec::new());

fn record_emcy(msg: EmcyMessage) {
    RECEIVED_EMCY.lock().unwrap().push(msg);
}

#[test]
#[serial]
fn test_emcy_consumer() {
    RECEIVED_EMCY.lock().unwrap().clear();
    let mut node = setup();
    let mut device = node.device();
    node.node.emcy().register_consumer(&record_emcy);
    node.process(0);

    let remote = EmcyMessage {
        node: REMOTE_NODE,
        code: error_code::VOLTAGE,
        register: error_register::GENERIC | error_register::VOLTAGE,
        error_bit: 0x31,
        info: 77,
    };
    device.send_now(remote.into());
    // Messages carrying the node's own ID are not consumed
    device.send_now(
        EmcyMessage {
            node: NODE_ID,
            ..remote
        }
        .into(),
    );
    node.process(1000);
    assert_eq!(vec![remote], *RECEIVED_EMCY.lock().unwrap());
}

#[test]
#[serial]
fn test_tx_queue_overflow() {
    let mut node = setup();
    let mut rx = node.bus.new_receiver();
    node.process(0);
    node.sdo_write(0x1017, 0, &1u16.to_le_bytes()).unwrap();
    rx.drain();

    // One heartbeat per cycle, and the bus never frees up
    let mut busy = |msg: CanMessage| -> Result<(), CanSendError> { Err(CanSendError(msg)) };
    for _ in 0..40 {
        node.node.process(1000, &mut busy);
    }
    assert_eq!(32, node.node.tx_pending());
    assert!(node.node.emcy().is_error(error_bit::CAN_TX_OVERFLOW));

    // Queued frames go out in order once the bus is free
    node.process(1000);
    let frames = rx.drain();
    assert_eq!(32, frames.len());
    assert!(frames.iter().all(|msg| msg.id() == CanId::Std(HEARTBEAT_ID)));
    assert!(!node.node.emcy().is_error(error_bit::CAN_TX_OVERFLOW));

    node.process(1000);
    let emcys = emcy_frames(&rx.drain());
    assert_eq!(1, emcys.len());
    assert_eq!(error_bit::CAN_TX_OVERFLOW, emcys[0].error_bit);
    assert_eq!(error_code::NO_ERROR, emcys[0].code);
}

static HB_EVENTS: Mutex<Vec<HbConsumerEvent>> = Mutex::new(Vec::new());

fn record_hb_event(event: HbConsumerEvent) {
    HB_EVENTS.lock().unwrap().push(event);
}

fn remote_heartbeat(state: NmtState) -> CanMessage {
    CanMessage::new(CanId::Std(0x700 + REMOTE_NODE as u16), &[state as u8])
}

#[test]
#[serial]
fn test_heartbeat_consumer_timeout() {
    HB_EVENTS.lock().unwrap().clear();
    let mut node = setup();
    let mut device = node.device();
    let mut rx = node.bus.new_receiver();
    node.node.register_hb_consumer_callback(&record_hb_event);
    node.process(0);

    node.sdo_write(0x1016, 1, &((REMOTE_NODE as u32) << 16 | 50).to_le_bytes()).unwrap();
    // A second entry for the same node is refused
    assert_eq!(
        Err(AbortCode::IncompatibleParameter),
        node.sdo_write(0x1016, 2, &((REMOTE_NODE as u32) << 16 | 80).to_le_bytes())
    );
    nmt(&mut node, NmtCommandSpecifier::Start);

    // Not monitored until the first heartbeat arrives
    node.run(100, 1000);
    assert_eq!(NmtState::Operational, node.node.nmt_state());

    device.send_now(remote_heartbeat(NmtState::Operational));
    node.process(1000);
    node.run(49, 1000);
    assert_eq!(NmtState::Operational, node.node.nmt_state());
    rx.drain();

    node.process(1000);
    node.process(1000);
    assert_eq!(NmtState::PreOperational, node.node.nmt_state());
    let emcys = emcy_frames(&rx.drain());
    assert_eq!(1, emcys.len());
    assert_eq!(error_bit::HEARTBEAT_CONSUMER, emcys[0].error_bit);
    assert_eq!(error_code::HEARTBEAT, emcys[0].code);
    assert_eq!(0, emcys[0].info);

    assert_eq!(
        vec![
            HbConsumerEvent::Started {
                node_id: REMOTE_NODE,
                idx: 0
            },
            HbConsumerEvent::NmtChanged {
                node_id: REMOTE_NODE,
                idx: 0,
                state: Some(NmtState::Operational)
            },
            HbConsumerEvent::Timeout {
                node_id: REMOTE_NODE,
                idx: 0
            },
            HbConsumerEvent::NmtChanged {
                node_id: REMOTE_NODE,
                idx: 0,
                state: None
            },
        ],
        *HB_EVENTS.lock().unwrap()
    );

    // The error clears once the remote node is back
    device.send_now(remote_heartbeat(NmtState::PreOperational));
    node.process(1000);
    assert!(!node.node.emcy().is_error(error_bit::HEARTBEAT_CONSUMER));
}

#[test]
#[serial]
fn test_heartbeat_consumer_remote_reset() {
    let mut node = setup();
    let mut device = node.device();
    node.process(0);
    node.sdo_write(0x1016, 1, &((REMOTE_NODE as u32) << 16 | 500).to_le_bytes()).unwrap();

    // A bootup before monitoring started is not an error
    device.send_now(remote_heartbeat(NmtState::Bootup));
    node.process(1000);
    assert!(!node.node.emcy().is_error(error_bit::HB_CONSUMER_REMOTE_RESET));

    device.send_now(remote_heartbeat(NmtState::Operational));
    node.process(1000);
    device.send_now(remote_heartbeat(NmtState::Bootup));
    node.process(1000);
    assert!(node.node.emcy().is_error(error_bit::HB_CONSUMER_REMOTE_RESET));

    // Cleared when the node is seen again
    device.send_now(remote_heartbeat(NmtState::PreOperational));
    node.process(1000);
    assert!(!node.node.emcy().is_error(error_bit::HB_CONSUMER_REMOTE_RESET));
}
