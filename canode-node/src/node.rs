//! The node orchestrator
use canode_common::{
    constants::object_ids,
    messages::{CanMessage, NmtState, RPDO_BASES, TPDO_BASES},
    objects::ObjectId,
    traits::CanSendError,
    NodeId,
};
use defmt_or_log::{debug, info, warn};
use heapless::Deque;

use crate::{
    config::{NodeConfig, TX_QUEUE_SIZE},
    emcy::{error_bit, error_code, Emergency},
    hb_consumer::{init_consumer, HbConsumerCallback, HbMonitor},
    nmt::{NmtSlave, ResetCmd},
    node_mbox::NodeMbox,
    node_state::NodeStateAccess,
    object_dict::{extension_init, ODEntry},
    sdo_server::configure_channels,
};

/// Callback for NMT state changes
pub type StateChangeCallback = dyn Fn(NmtState) + Sync;

/// Callback for objects written by an SDO client
pub type ObjectWrittenCallback = dyn Fn(ObjectId) + Sync;

#[derive(Clone, Copy, Debug)]
struct QueuedFrame {
    msg: CanMessage,
    synchronous: bool,
}

/// Bounded queue of frames waiting for the application's sender
struct TxQueue {
    frames: Deque<QueuedFrame, TX_QUEUE_SIZE>,
    limit: usize,
    overflowed: bool,
}

impl TxQueue {
    fn new(limit: usize) -> Self {
        Self {
            frames: Deque::new(),
            limit,
            overflowed: false,
        }
    }

    /// Queue a frame, or drop it and report the overflow when the queue is full
    fn push(&mut self, msg: CanMessage, synchronous: bool, emcy: &Emergency) -> bool {
        if self.frames.len() >= self.limit {
            warn!("TX queue full, dropping frame 0x{:x}", msg.id().raw());
            emcy.error_report(error_bit::CAN_TX_OVERFLOW, error_code::CAN_OVERRUN, msg.id().raw());
            self.overflowed = true;
            return false;
        }
        self.frames
            .push_back(QueuedFrame { msg, synchronous })
            .is_ok()
    }

    /// Drop synchronous frames which have not been sent yet. Returns the number dropped.
    fn drop_synchronous(&mut self) -> usize {
        let before = self.frames.len();
        for _ in 0..before {
            if let Some(frame) = self.frames.pop_front() {
                if !frame.synchronous {
                    // Cannot fail, one slot was just freed
                    self.frames.push_back(frame).ok();
                }
            }
        }
        before - self.frames.len()
    }

    /// Pass queued frames to `sender` until it reports busy
    fn drain(
        &mut self,
        sender: &mut dyn FnMut(CanMessage) -> Result<(), CanSendError>,
        emcy: &Emergency,
    ) {
        while let Some(frame) = self.frames.front() {
            if sender(frame.msg).is_err() {
                break;
            }
            self.frames.pop_front();
        }
        if self.overflowed && self.frames.is_empty() {
            self.overflowed = false;
            emcy.error_reset(error_bit::CAN_TX_OVERFLOW, 0);
        }
    }

    fn clear(&mut self) {
        self.frames.clear();
    }
}

/// A CANopen node
///
/// Ties the object dictionary, the [`NodeMbox`] fed by the receive path and the
/// [`NodeState`](crate::NodeState) together, and runs all protocol state machines from
/// [`Node::process`].
#[allow(missing_debug_implementations)]
pub struct Node {
    node_id: NodeId,
    config: NodeConfig,
    nmt: NmtSlave,
    hb_monitor: HbMonitor,
    tx_queue: TxQueue,
    mbox: &'static NodeMbox,
    state: &'static dyn NodeStateAccess,
    od: &'static [ODEntry<'static>],
    state_change_callback: Option<&'static StateChangeCallback>,
    hb_consumer_callback: Option<&'static HbConsumerCallback>,
    object_written_callback: Option<&'static ObjectWrittenCallback>,
    quit: bool,
}

impl Node {
    /// Create a new node
    ///
    /// Stored object values must be loaded into `od` before the node is created, either with
    /// [`Storage::load`](crate::storage::Storage::load) or
    /// [`restore_stored_objects`](crate::restore_stored_objects). The node latches the PDO, SYNC and
    /// heartbeat configuration from the OD here, and again on every communication reset.
    ///
    /// # Arguments
    /// - `node_id`: The node ID
    /// - `config`: Run time configuration
    /// - `mbox`: The mailbox which the receive path stores messages in
    /// - `state`: The node state referred to by the mailbox and the communication objects
    /// - `od`: The object dictionary
    pub fn new(
        node_id: NodeId,
        config: NodeConfig,
        mbox: &'static NodeMbox,
        state: &'static dyn NodeStateAccess,
        od: &'static [ODEntry<'static>],
    ) -> Self {
        let nmt = NmtSlave::new(
            node_id.raw(),
            config.nmt_control,
            config.first_heartbeat_ms,
            state.heartbeat_producer(),
        );
        let mut node = Self {
            node_id,
            config,
            nmt,
            hb_monitor: HbMonitor::new(),
            tx_queue: TxQueue::new(config.effective_tx_queue_limit()),
            mbox,
            state,
            od,
            state_change_callback: None,
            hb_consumer_callback: None,
            object_written_callback: None,
            quit: false,
        };

        state.storage().init(od);
        let channels = state.sdo_channels();
        // SAFETY: The servers of a state are only touched by the node driving it
        unsafe { configure_channels(channels, &config) };
        for i in 0..channels.len() {
            // Only the channels with a parameter object in the OD can be configured
            let index = object_ids::SDO_SERVER_PARAMETER + i as u16;
            extension_init(od, index, state.sdo_servers()).ok();
        }
        node.init_comm();

        let load_errors = state.storage().take_load_errors();
        if load_errors != 0 {
            state.emcy().error_report(
                error_bit::NON_VOLATILE_MEMORY,
                error_code::HARDWARE,
                load_errors,
            );
        }
        node
    }

    /// Reset all communication state and reload the configuration from the OD
    fn init_comm(&mut self) {
        let node_id = self.node_id.raw();
        let state = self.state;
        let emcy = state.emcy();
        info!("Communication init, node ID {}", node_id);

        emcy.reset(node_id);
        self.mbox.set_node_id(node_id);
        state.sync().init(self.od);
        state.heartbeat_producer().init(self.od);
        init_consumer(state.hb_consumer_entries(), state.hb_consumer(), self.od);

        for (i, rpdo) in state.rpdos().iter().enumerate() {
            let default_id = RPDO_BASES.get(i).map_or(0, |base| base + node_id as u16);
            rpdo.init(self.od, default_id, emcy);
        }
        for (i, tpdo) in state.tpdos().iter().enumerate() {
            let default_id = TPDO_BASES.get(i).map_or(0, |base| base + node_id as u16);
            tpdo.init(self.od, default_id, emcy);
        }

        // Additional SDO channels are invalid until a client configures them again
        for (i, channel) in state.sdo_channels().iter().enumerate() {
            channel.set_default_ids(if i == 0 { node_id } else { 0 });
            channel.take_changed();
            // SAFETY: The servers of a state are only touched by the node driving it
            let server = unsafe { channel.server() };
            server.reset(channel.receiver());
        }
        self.nmt = NmtSlave::new(
            node_id,
            self.config.nmt_control,
            self.config.first_heartbeat_ms,
            state.heartbeat_producer(),
        );
        self.hb_monitor = HbMonitor::new();
        self.tx_queue.clear();
    }

    /// Run one processing cycle
    ///
    /// Must be called periodically, and whenever the mailbox notification callback fires.
    /// Subsystems run in a fixed order: emergency, NMT and heartbeat, heartbeat consumer, SYNC, SDO
    /// server, RPDOs, TPDOs and storage auto save. Frames produced in the cycle are then passed to
    /// `sender`; frames it rejects stay queued for the next cycle.
    ///
    /// # Arguments
    /// - `elapsed_us`: Time since the previous call
    /// - `sender`: Transmits a frame on the bus
    ///
    /// Returns the reset requested in this cycle. On [`ResetCmd::Comm`] and [`ResetCmd::App`] the
    /// communication state has already been reinitialized and the bootup message queued.
    pub fn process(
        &mut self,
        elapsed_us: u32,
        sender: &mut dyn FnMut(CanMessage) -> Result<(), CanSendError>,
    ) -> ResetCmd {
        if self.quit {
            return ResetCmd::Quit;
        }

        let state = self.state;
        let emcy = state.emcy();
        let nmt_state = self.nmt.state();
        let pre_or_operational = matches!(nmt_state, NmtState::PreOperational | NmtState::Operational);

        if let Some(msg) = emcy.process(elapsed_us, pre_or_operational) {
            self.tx_queue.push(msg, false, emcy);
        }

        let command = self.mbox.read_nmt_mbox().map(|cmd| cmd.cmd);
        let nmt_out = self.nmt.process(elapsed_us, command, state.heartbeat_producer(), emcy);
        if let Some(hb) = nmt_out.heartbeat {
            self.tx_queue.push(hb, false, emcy);
        }
        if let Some(new_state) = nmt_out.changed {
            if let Some(cb) = self.state_change_callback {
                cb(new_state);
            }
        }
        if nmt_out.reset != ResetCmd::None {
            self.init_comm();
            // Send the bootup message before handing control back to the application
            let bootup = self.nmt.process(0, None, state.heartbeat_producer(), emcy);
            if let Some(hb) = bootup.heartbeat {
                self.tx_queue.push(hb, false, emcy);
            }
            if let (Some(new_state), Some(cb)) = (bootup.changed, self.state_change_callback) {
                cb(new_state);
            }
            self.tx_queue.drain(sender, emcy);
            return nmt_out.reset;
        }

        let nmt_state = self.nmt.state();
        let pre_or_operational = matches!(nmt_state, NmtState::PreOperational | NmtState::Operational);
        let operational = nmt_state == NmtState::Operational;

        self.hb_monitor.process(
            state.hb_consumer_entries(),
            pre_or_operational,
            elapsed_us,
            emcy,
            self.hb_consumer_callback,
        );

        let sync = state.sync();
        let sync_out = sync.process(elapsed_us, nmt_state, emcy);
        if let Some(frame) = sync_out.frame {
            self.tx_queue.push(frame, false, emcy);
            for rpdo in state.rpdos() {
                rpdo.sync_latch();
            }
        }
        if sync_out.window_closed {
            let dropped = self.tx_queue.drop_synchronous();
            if dropped != 0 {
                debug!("Dropped {} synchronous TPDOs outside the window", dropped);
                emcy.error_report(
                    error_bit::TPDO_OUTSIDE_WINDOW,
                    error_code::COMMUNICATION,
                    dropped as u32,
                );
            }
        }

        for channel in state.sdo_channels() {
            // SAFETY: The servers of a state are only touched by the node driving it
            let server = unsafe { channel.server() };
            let rx = channel.receiver();
            if channel.take_changed() {
                server.reset(rx);
            }
            match (channel.rx_cob_id(), channel.tx_cob_id()) {
                (Some(_), Some(tx_id)) if pre_or_operational => {
                    let tx_queue = &mut self.tx_queue;
                    let updated = server.process(rx, elapsed_us, self.od, &mut |data| {
                        tx_queue.push(CanMessage::new(tx_id, &data), false, emcy)
                    });
                    if let (Some(id), Some(cb)) = (updated, self.object_written_callback) {
                        cb(id);
                    }
                }
                _ if !server.is_idle() => server.reset(rx),
                // Requests received while stopped are dropped
                _ => rx.reset(),
            }
        }

        for rpdo in state.rpdos() {
            rpdo.process_rpdo(elapsed_us, pre_or_operational, emcy);
        }

        state.pdo_sync().toggle();
        for tpdo in state.tpdos() {
            let Some(frame) = tpdo.process_tpdo(elapsed_us, operational, sync_out.sync, emcy) else {
                continue;
            };
            if frame.synchronous && !sync.inside_window() {
                emcy.error_report(
                    error_bit::TPDO_OUTSIDE_WINDOW,
                    error_code::COMMUNICATION,
                    frame.msg.id().raw(),
                );
                continue;
            }
            self.tx_queue.push(frame.msg, frame.synchronous, emcy);
        }
        for tpdo in state.tpdos() {
            tpdo.clear_events();
        }

        state.storage().process(emcy);

        self.tx_queue.drain(sender, emcy);
        ResetCmd::None
    }

    /// Register a callback for NMT state changes
    pub fn register_state_change_callback(&mut self, callback: &'static StateChangeCallback) {
        self.state_change_callback = Some(callback);
    }

    /// Register a callback for heartbeat consumer events
    pub fn register_hb_consumer_callback(&mut self, callback: &'static HbConsumerCallback) {
        self.hb_consumer_callback = Some(callback);
    }

    /// Register a callback for completed SDO downloads
    pub fn register_object_written_callback(&mut self, callback: &'static ObjectWrittenCallback) {
        self.object_written_callback = Some(callback);
    }

    /// Request transmission of event driven TPDO `n`, counting from 0
    ///
    /// Returns false if the TPDO does not exist.
    pub fn tpdo_request(&self, n: usize) -> bool {
        match self.state.tpdos().get(n) {
            Some(tpdo) => {
                tpdo.request();
                true
            }
            None => false,
        }
    }

    /// Make the next call to [`Node::process`] return [`ResetCmd::Quit`]
    pub fn request_quit(&mut self) {
        self.quit = true;
    }

    /// The node ID
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The current NMT state
    pub fn nmt_state(&self) -> NmtState {
        self.nmt.state()
    }

    /// The emergency producer, for reporting application errors
    pub fn emcy(&self) -> &'static Emergency {
        self.state.emcy()
    }

    /// Number of frames waiting for the sender
    pub fn tx_pending(&self) -> usize {
        self.tx_queue.frames.len()
    }
}
