//! Implements mailbox for receiving CAN messages
use defmt_or_log::warn;
use canode_common::{
    messages::{CanId, CanMessage, EmcyMessage, NmtCommand, EMCY_BASE, NMT_CMD_ID},
    AtomicCell,
};

use crate::{hb_consumer::receive_heartbeat, node_state::NodeStateAccess};

/// A data structure to be shared between a receiving thread (e.g. a CAN controller IRQ) and the
/// [`Node`](crate::Node) object.
///
/// Incoming messages should be passed to [NodeMbox::store_message]. Frames are copied into the
/// slot of the component they belong to, and processed on the next call to
/// [`Node::process`](crate::Node::process).
#[allow(missing_debug_implementations)]
pub struct NodeMbox {
    state: &'static dyn NodeStateAccess,
    node_id: AtomicCell<u8>,
    nmt_mbox: AtomicCell<Option<NmtCommand>>,
    notify_cb: AtomicCell<Option<&'static (dyn Fn() + Sync)>>,
}

impl NodeMbox {
    /// Create a new NodeMbox
    ///
    /// # Args
    ///
    /// - `state`: The node state holding the PDOs, SYNC, EMCY and heartbeat consumers which
    ///   received frames are routed to
    pub const fn new(state: &'static dyn NodeStateAccess) -> Self {
        Self {
            state,
            node_id: AtomicCell::new(0),
            nmt_mbox: AtomicCell::new(None),
            notify_cb: AtomicCell::new(None),
        }
    }

    /// Set a callback for notification when a message is received and requires processing.
    ///
    /// It must be static. Usually this will be a static fn, but in some circumstances, it may be
    /// desirable to use Box::leak to pass a heap allocated closure instead.
    pub fn set_process_notify_callback(&self, callback: &'static (dyn Fn() + Sync)) {
        self.notify_cb.store(Some(callback));
    }

    fn notify(&self) {
        if let Some(notify_cb) = self.notify_cb.load() {
            notify_cb();
        }
    }

    pub(crate) fn set_node_id(&self, node_id: u8) {
        self.node_id.store(node_id);
    }

    pub(crate) fn read_nmt_mbox(&self) -> Option<NmtCommand> {
        self.nmt_mbox.take()
    }

    /// Store a received CAN message
    ///
    /// Returns the message back in the error if it is not handled by the node.
    pub fn store_message(&self, msg: CanMessage) -> Result<(), CanMessage> {
        let id = msg.id();
        let node_id = self.node_id.load();

        if id == NMT_CMD_ID {
            let Ok(cmd) = NmtCommand::try_from(msg) else {
                warn!("Invalid NMT command");
                return Err(msg);
            };
            if cmd.node == 0 || cmd.node == node_id {
                self.nmt_mbox.store(Some(cmd));
                self.notify();
            }
            return Ok(());
        }

        let sync = self.state.sync();
        if id == sync.cob_id() && !msg.is_rtr() {
            sync.receive(&msg);
            for rpdo in self.state.rpdos() {
                rpdo.sync_latch();
            }
            self.notify();
            return Ok(());
        }

        if let CanId::Std(raw) = id {
            if raw & !0x7F == EMCY_BASE && raw & 0x7F != 0 && raw & 0x7F != node_id as u16 {
                if let Ok(emcy) = EmcyMessage::try_from(msg) {
                    if !self.state.emcy().receive(emcy) {
                        warn!("EMCY consumer queue full");
                    }
                    self.notify();
                    return Ok(());
                }
            }
        }

        if receive_heartbeat(self.state.hb_consumer_entries(), &msg) {
            self.notify();
            return Ok(());
        }

        if msg.is_rtr() {
            if self.state.tpdos().iter().any(|tpdo| tpdo.receive_rtr(&msg)) {
                self.notify();
                return Ok(());
            }
        } else if self.state.rpdos().iter().any(|rpdo| rpdo.receive(&msg)) {
            self.notify();
            return Ok(());
        }

        if !msg.is_rtr() {
            let channels = self.state.sdo_channels();
            if let Some(channel) = channels.iter().find(|c| c.rx_cob_id() == Some(id)) {
                if channel.receiver().handle_req(msg.data()) {
                    self.notify();
                }
                return Ok(());
            }
        }

        Err(msg)
    }
}
