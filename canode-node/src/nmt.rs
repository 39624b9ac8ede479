//! NMT slave state machine and heartbeat producer
use canode_common::{
    constants::object_ids,
    messages::{CanMessage, Heartbeat, NmtCommandSpecifier, NmtState},
    sdo::AbortCode,
    AtomicCell,
};
use defmt_or_log::{debug, info};

use crate::{
    config::NmtControl,
    emcy::{error_bit, Emergency},
    object_dict::{exact_bytes, extension_init, find_object, ODEntry, ObjectAccess, ObjectExtension},
};

/// Reset request returned from [`Node::process`](crate::Node::process)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ResetCmd {
    /// Keep running
    None,
    /// The communication layer was reset
    Comm,
    /// The application should reset itself
    App,
    /// The application asked the node to stop
    Quit,
}

/// Heartbeat producer time (object 0x1017)
///
/// Installed as the extension on 0x1017 so that a write restarts the producer timer.
#[allow(missing_debug_implementations)]
pub struct HeartbeatProducer {
    time_ms: AtomicCell<u16>,
    reload: AtomicCell<bool>,
}

impl Default for HeartbeatProducer {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatProducer {
    /// Create a producer with heartbeats disabled
    pub const fn new() -> Self {
        Self {
            time_ms: AtomicCell::new(0),
            reload: AtomicCell::new(false),
        }
    }

    pub(crate) fn init(&'static self, od: &'static [ODEntry<'static>]) {
        self.time_ms.store(
            find_object(od, object_ids::HEARTBEAT_PRODUCER_TIME)
                .and_then(|obj| obj.read_u16(0).ok())
                .unwrap_or(0),
        );
        self.reload.store(false);
        extension_init(od, object_ids::HEARTBEAT_PRODUCER_TIME, self).ok();
    }

    /// The heartbeat period in ms. 0 disables the producer.
    pub fn time_ms(&self) -> u16 {
        self.time_ms.load()
    }
}

impl ObjectExtension for HeartbeatProducer {
    fn write(
        &self,
        _index: u16,
        object: &dyn ObjectAccess,
        sub: u8,
        data: &[u8],
    ) -> Result<(), AbortCode> {
        if sub != 0 {
            return Err(AbortCode::NoSuchSubIndex);
        }
        let time = u16::from_le_bytes(exact_bytes(data)?);
        object.write(sub, data)?;
        debug!("Heartbeat producer time set to {} ms", time);
        self.time_ms.store(time);
        self.reload.store(true);
        Ok(())
    }
}

/// The outcome of one NMT cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NmtOutput {
    pub reset: ResetCmd,
    pub heartbeat: Option<CanMessage>,
    /// Set when the state differs from the previous cycle
    pub changed: Option<NmtState>,
}

/// NMT slave
///
/// `NmtState::Bootup` doubles as the Initializing state. The first process call after creation
/// sends the bootup message and moves to Pre-operational, or Operational when configured to start
/// up that way.
#[derive(Debug)]
pub(crate) struct NmtSlave {
    node_id: u8,
    state: NmtState,
    prev_state: NmtState,
    hb_timer_us: u32,
    control: NmtControl,
}

impl NmtSlave {
    pub fn new(
        node_id: u8,
        control: NmtControl,
        first_heartbeat_ms: u16,
        producer: &HeartbeatProducer,
    ) -> Self {
        let period_us = producer.time_ms() as u32 * 1000;
        Self {
            node_id,
            state: NmtState::Bootup,
            prev_state: NmtState::Bootup,
            hb_timer_us: (first_heartbeat_ms as u32 * 1000).min(period_us),
            control,
        }
    }

    pub fn state(&self) -> NmtState {
        self.state
    }

    pub fn process(
        &mut self,
        elapsed_us: u32,
        command: Option<NmtCommandSpecifier>,
        producer: &HeartbeatProducer,
        emcy: &Emergency,
    ) -> NmtOutput {
        let old_state = self.state;
        let mut state = old_state;
        let mut reset = ResetCmd::None;
        let initializing = state == NmtState::Bootup;
        let mut heartbeat = None;

        if producer.reload.take() {
            self.hb_timer_us = 0;
        }
        self.hb_timer_us = self.hb_timer_us.saturating_sub(elapsed_us);
        let period_us = producer.time_ms() as u32 * 1000;

        if initializing || (period_us != 0 && (self.hb_timer_us == 0 || state != self.prev_state)) {
            heartbeat = Some(
                Heartbeat {
                    node: self.node_id,
                    toggle: false,
                    state,
                }
                .into(),
            );
            if initializing {
                state = if self.control.startup_to_operational {
                    NmtState::Operational
                } else {
                    NmtState::PreOperational
                };
            } else {
                self.hb_timer_us = period_us;
            }
        }
        self.prev_state = state;

        if let Some(cmd) = command {
            match cmd {
                NmtCommandSpecifier::Start => state = NmtState::Operational,
                NmtCommandSpecifier::Stop => state = NmtState::Stopped,
                NmtCommandSpecifier::EnterPreOp => state = NmtState::PreOperational,
                NmtCommandSpecifier::ResetApp => reset = ResetCmd::App,
                NmtCommandSpecifier::ResetComm => reset = ResetCmd::Comm,
            }
        }

        let bus_off_hb = self.control.error_on_busoff_hb
            && (emcy.is_error(error_bit::CAN_TX_BUS_OFF)
                || emcy.is_error(error_bit::HEARTBEAT_CONSUMER)
                || emcy.is_error(error_bit::HB_CONSUMER_REMOTE_RESET));
        let err_reg = self.control.error_on_error_register
            && emcy.error_register() & self.control.error_register_mask != 0;

        if state == NmtState::Operational && (bus_off_hb || err_reg) {
            state = if self.control.error_to_stopped {
                NmtState::Stopped
            } else {
                NmtState::PreOperational
            };
        } else if self.control.error_free_to_operational
            && state == NmtState::PreOperational
            && !bus_off_hb
            && !err_reg
        {
            state = NmtState::Operational;
        }

        let changed = if state != self.prev_state || initializing {
            info!("NMT state {} -> {}", old_state as u8, state as u8);
            Some(state)
        } else {
            None
        };
        if reset != ResetCmd::None {
            info!("NMT reset command {}", reset as u8);
        }

        self.state = state;
        NmtOutput {
            reset,
            heartbeat,
            changed,
        }
    }
}
