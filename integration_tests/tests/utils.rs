#![allow(dead_code)]
use std::{future::Future, time::Instant};

use canode_common::{
    messages::{CanId, CanMessage, SDO_REQ_BASE, SDO_RESP_BASE},
    sdo::{AbortCode, SdoRequest, SdoResponse},
    traits::AsyncCanSender,
    NodeId,
};
use canode_node::{Node, NodeConfig, ResetCmd};
use futures::executor::block_on;
use integration_tests::{
    object_dict::{reset_defaults, NODE_ID, NODE_MBOX, NODE_STATE, OD_TABLE},
    sdo_client::SdoClient,
    sim_bus::{SimBus, SimBusReceiver, SimBusSender},
};

pub type TestClient = SdoClient<SimBusSender, SimBusReceiver>;

/// The node under test, with the bus it is attached to
pub struct TestNode {
    pub node: Node,
    pub bus: SimBus,
    sender: SimBusSender,
    config_sender: SimBusSender,
    config_rx: SimBusReceiver,
}

impl TestNode {
    /// Run one process cycle, sending the node's frames on the bus
    pub fn process(&mut self, elapsed_us: u32) -> ResetCmd {
        let sender = &mut self.sender;
        self.node
            .process(elapsed_us, &mut |msg| block_on(sender.send(msg)))
    }

    /// Run `cycles` process cycles of `step_us` each
    pub fn run(&mut self, cycles: usize, step_us: u32) {
        for _ in 0..cycles {
            self.process(step_us);
        }
    }

    /// A sender for injecting frames from another device
    pub fn device(&mut self) -> SimBusSender {
        self.bus.new_sender()
    }

    pub fn sdo_client(&mut self) -> TestClient {
        SdoClient::new_std(NODE_ID, self.bus.new_sender(), self.bus.new_receiver())
    }

    /// Send one SDO request and run a zero length cycle to handle it
    fn sdo_request(&mut self, req: SdoRequest) -> SdoResponse {
        self.config_rx.drain();
        self.config_sender
            .send_now(req.to_can_message(CanId::Std(SDO_REQ_BASE + NODE_ID as u16)));
        self.process(0);
        let replies = frames_with_id(&self.config_rx.drain(), SDO_RESP_BASE + NODE_ID as u16);
        assert_eq!(1, replies.len(), "expected one SDO response");
        SdoResponse::try_from(replies[0]).unwrap()
    }

    /// Expedited SDO download, run synchronously with the node
    pub fn sdo_write(&mut self, index: u16, sub: u8, data: &[u8]) -> Result<(), AbortCode> {
        match self.sdo_request(SdoRequest::expedited_download(index, sub, data)) {
            SdoResponse::ConfirmDownload { .. } => Ok(()),
            SdoResponse::Abort { abort_code, .. } => Err(AbortCode::try_from(abort_code).unwrap()),
            resp => panic!("Unexpected response {resp:?}"),
        }
    }

    /// Expedited SDO upload, run synchronously with the node
    pub fn sdo_read(&mut self, index: u16, sub: u8) -> Result<Vec<u8>, AbortCode> {
        match self.sdo_request(SdoRequest::initiate_upload(index, sub)) {
            SdoResponse::ConfirmUpload {
                n,
                e: true,
                s,
                data,
                ..
            } => {
                let len = if s { 4 - n as usize } else { 4 };
                Ok(data[..len].to_vec())
            }
            SdoResponse::Abort { abort_code, .. } => Err(AbortCode::try_from(abort_code).unwrap()),
            resp => panic!("Unexpected response {resp:?}"),
        }
    }
}

/// Reset the object dictionary to its defaults and create the node
pub fn setup() -> TestNode {
    setup_with_config(NodeConfig::new())
}

pub fn setup_with_config(config: NodeConfig) -> TestNode {
    reset_defaults();
    create_node(config)
}

/// Create the node from the current object values, as on a power up
pub fn create_node(config: NodeConfig) -> TestNode {
    let node = Node::new(
        NodeId::new(NODE_ID).unwrap(),
        config,
        &NODE_MBOX,
        &NODE_STATE,
        &OD_TABLE,
    );
    let mut bus = SimBus::new(vec![&NODE_MBOX]);
    let sender = bus.node_sender(&NODE_MBOX);
    let config_sender = bus.new_sender();
    let config_rx = bus.new_receiver();
    TestNode {
        node,
        bus,
        sender,
        config_sender,
        config_rx,
    }
}

/// Run the node process loop in the background of `test_task`
///
/// The node is processed in real time, every 100us.
pub async fn test_with_background_process<T>(
    node: &mut TestNode,
    test_task: impl Future<Output = T>,
) -> T {
    // Process once, so that the node has booted before any request comes in
    node.process(0);

    let node_process_task = async move {
        let mut last = Instant::now();
        loop {
            tokio::time::sleep(tokio::time::Duration::from_micros(100)).await;
            let now = Instant::now();
            let elapsed_us = now.duration_since(last).as_micros() as u32;
            last = now;
            node.process(elapsed_us);
        }
    };

    tokio::select! {
        _ = node_process_task => panic!("Node process task exited"),
        test_result = test_task => test_result
    }
}

/// Frames on the bus with the given standard ID
pub fn frames_with_id(frames: &[CanMessage], id: u16) -> Vec<CanMessage> {
    frames
        .iter()
        .filter(|msg| msg.id() == CanId::Std(id))
        .copied()
        .collect()
}

/// Prints all traffic on the bus when dropped
pub struct BusLogger {
    rx: SimBusReceiver,
}

impl BusLogger {
    pub fn new(rx: SimBusReceiver) -> Self {
        Self { rx }
    }

    pub fn print(&mut self) {
        println!("Bus message history");
        println!("-------------------");
        for msg in self.rx.drain() {
            println!("0x{:03x} {:02x?}", msg.id().raw(), msg.data());
        }
    }
}

impl Drop for BusLogger {
    fn drop(&mut self) {
        self.print();
    }
}
