//! Emergency producer and consumer
//!
//! The [`Emergency`] object tracks the error conditions of the node in an 80 bit status bitmap.
//! Reporting a condition with [`Emergency::error_report`] sets its bit, records the error code in
//! the pre-defined error field (0x1003), and queues an emergency frame. Clearing it with
//! [`Emergency::error_reset`] queues a "no error" frame. Each condition is only reported on a
//! change, so callers may report a persisting condition every cycle.
//!
//! Queued frames are sent by [`Emergency::process`], at most one per call and no more often than
//! the inhibit time (0x1015) allows.
//!
//! The error register (0x1001) is derived from the active conditions: the generic bit is set
//! whenever any condition is active, and each active condition also sets the class bit of the
//! error code it was reported with.
use core::cell::RefCell;

use canode_common::{
    messages::{CanErrorStatus, EmcyMessage, EMCY_BASE},
    objects::{DataType, ObjectCode, PdoMapping, SubInfo},
    sdo::AbortCode,
    AtomicCell, CanId, CanMessage,
};
use critical_section::Mutex;
use defmt_or_log::{debug, warn};
use heapless::Deque;

use crate::object_dict::{exact_bytes, read_slice, ObjectAccess};

/// Error status bits
///
/// Each bit identifies one error condition. Bits below 0x30 have a fixed meaning, bits from
/// [`MANUFACTURER_START`](error_bit::MANUFACTURER_START) up to 0x4F are free for the application.
pub mod error_bit {
    /// CAN bus warning limit reached
    pub const CAN_BUS_WARNING: u8 = 0x01;
    /// Wrong data length of a received CAN message
    pub const RXMSG_WRONG_LENGTH: u8 = 0x02;
    /// Previous received CAN message wasn't processed yet
    pub const RXMSG_OVERFLOW: u8 = 0x03;
    /// Wrong data length of a received PDO
    pub const RPDO_WRONG_LENGTH: u8 = 0x04;
    /// Previous received PDO wasn't processed yet
    pub const RPDO_OVERFLOW: u8 = 0x05;
    /// CAN receive bus is passive
    pub const CAN_RX_BUS_PASSIVE: u8 = 0x06;
    /// CAN transmit bus is passive
    pub const CAN_TX_BUS_PASSIVE: u8 = 0x07;
    /// Wrong NMT command received
    pub const NMT_WRONG_COMMAND: u8 = 0x08;
    /// CAN transmit bus is off
    pub const CAN_TX_BUS_OFF: u8 = 0x12;
    /// CAN module receive buffer has overflowed
    pub const CAN_RXB_OVERFLOW: u8 = 0x13;
    /// CAN transmit buffer has overflowed
    pub const CAN_TX_OVERFLOW: u8 = 0x14;
    /// TPDO is outside the SYNC window
    pub const TPDO_OUTSIDE_WINDOW: u8 = 0x15;
    /// RPDO timeout
    pub const RPDO_TIME_OUT: u8 = 0x17;
    /// SYNC message timeout
    pub const SYNC_TIME_OUT: u8 = 0x18;
    /// Unexpected SYNC data length
    pub const SYNC_LENGTH: u8 = 0x19;
    /// Error with PDO mapping
    pub const PDO_WRONG_MAPPING: u8 = 0x1A;
    /// Heartbeat consumer timeout
    pub const HEARTBEAT_CONSUMER: u8 = 0x1B;
    /// Heartbeat consumer detected a remote node reset
    pub const HB_CONSUMER_REMOTE_RESET: u8 = 0x1C;
    /// Emergency buffer is full, an emergency message wasn't sent
    pub const EMERGENCY_BUFFER_FULL: u8 = 0x20;
    /// Microcontroller has just started
    pub const MICROCONTROLLER_RESET: u8 = 0x22;
    /// Automatic store to non-volatile memory failed
    pub const NON_VOLATILE_AUTO_SAVE: u8 = 0x27;
    /// Wrong parameters to an error report
    pub const WRONG_ERROR_REPORT: u8 = 0x28;
    /// Generic error, manufacturer specific
    pub const GENERIC_ERROR: u8 = 0x2B;
    /// Generic software error, manufacturer specific
    pub const GENERIC_SOFTWARE_ERROR: u8 = 0x2C;
    /// Error with access to non-volatile memory
    pub const NON_VOLATILE_MEMORY: u8 = 0x2F;
    /// First bit available to the application
    pub const MANUFACTURER_START: u8 = 0x30;
}

/// Standard emergency error codes
pub mod error_code {
    /// Error reset or no error
    pub const NO_ERROR: u16 = 0x0000;
    /// Generic error
    pub const GENERIC: u16 = 0x1000;
    /// Current
    pub const CURRENT: u16 = 0x2000;
    /// Voltage
    pub const VOLTAGE: u16 = 0x3000;
    /// Temperature
    pub const TEMPERATURE: u16 = 0x4000;
    /// Device hardware
    pub const HARDWARE: u16 = 0x5000;
    /// Internal software
    pub const SOFTWARE_INTERNAL: u16 = 0x6100;
    /// Communication
    pub const COMMUNICATION: u16 = 0x8100;
    /// CAN overrun (objects lost)
    pub const CAN_OVERRUN: u16 = 0x8110;
    /// CAN in error passive mode
    pub const CAN_PASSIVE: u16 = 0x8120;
    /// Life guard error or heartbeat error
    pub const HEARTBEAT: u16 = 0x8130;
    /// Recovered from bus off
    pub const BUS_OFF_RECOVERED: u16 = 0x8140;
    /// Protocol error
    pub const PROTOCOL: u16 = 0x8200;
    /// PDO not processed due to length error
    pub const PDO_LENGTH: u16 = 0x8210;
    /// PDO length exceeded
    pub const PDO_LENGTH_EXC: u16 = 0x8220;
    /// Unexpected SYNC data length
    pub const SYNC_DATA_LENGTH: u16 = 0x8240;
    /// RPDO timeout
    pub const RPDO_TIMEOUT: u16 = 0x8250;
    /// Device specific
    pub const DEVICE_SPECIFIC: u16 = 0xFF00;
}

/// Error register (0x1001) bits
pub mod error_register {
    /// Generic error
    pub const GENERIC: u8 = 0x01;
    /// Current
    pub const CURRENT: u8 = 0x02;
    /// Voltage
    pub const VOLTAGE: u8 = 0x04;
    /// Temperature
    pub const TEMPERATURE: u8 = 0x08;
    /// Communication error (overrun, error state)
    pub const COMMUNICATION: u8 = 0x10;
    /// Device profile specific
    pub const DEV_PROFILE: u8 = 0x20;
    /// Manufacturer specific
    pub const MANUFACTURER: u8 = 0x80;
}

/// Number of error status bits
pub const ERROR_STATUS_BITS: usize = 80;
/// Number of emergency frames which can be queued for sending
pub const EMCY_FIFO_SIZE: usize = 8;
/// Number of entries kept in the pre-defined error field
pub const ERROR_HISTORY_SIZE: usize = 8;

const STATUS_BYTES: usize = ERROR_STATUS_BITS / 8;
const RX_QUEUE_SIZE: usize = 4;
const COB_ID_INVALID: u32 = 1 << 31;

/// Callback invoked for emergency messages received from other nodes
pub type EmcyConsumerCallback = dyn Fn(EmcyMessage) + Sync;

/// The error register class bit associated with an error code
fn register_class(code: u16) -> u8 {
    match code >> 12 {
        0x2 => error_register::CURRENT,
        0x3 => error_register::VOLTAGE,
        0x4 => error_register::TEMPERATURE,
        0x6 | 0x7 | 0x9 => error_register::DEV_PROFILE,
        0x8 => error_register::COMMUNICATION,
        0xF if code >= error_code::DEVICE_SPECIFIC => error_register::MANUFACTURER,
        _ => 0,
    }
}

#[derive(Clone, Copy, Debug)]
struct PendingEmcy {
    code: u16,
    error_bit: u8,
    info: u32,
}

#[derive(Debug)]
struct EmcyInner {
    status: [u8; STATUS_BYTES],
    classes: [u8; ERROR_STATUS_BITS],
    fifo: Deque<PendingEmcy, EMCY_FIFO_SIZE>,
    overflow: bool,
    wrong_report: Option<u8>,
    history: Deque<u32, ERROR_HISTORY_SIZE>,
    can_status_old: u16,
    inhibit_timer_us: u32,
    rx: Deque<EmcyMessage, RX_QUEUE_SIZE>,
}

impl EmcyInner {
    const fn new() -> Self {
        Self {
            status: [0; STATUS_BYTES],
            classes: [0; ERROR_STATUS_BITS],
            fifo: Deque::new(),
            overflow: false,
            wrong_report: None,
            history: Deque::new(),
            can_status_old: 0,
            inhibit_timer_us: u32::MAX,
            rx: Deque::new(),
        }
    }

    fn is_set(&self, bit: u8) -> bool {
        self.status[(bit >> 3) as usize] & (1 << (bit & 7)) != 0
    }

    fn register(&self) -> u8 {
        let mut register = 0;
        for bit in 0..ERROR_STATUS_BITS {
            if self.is_set(bit as u8) {
                register |= error_register::GENERIC | self.classes[bit];
            }
        }
        register
    }

    fn enqueue(&mut self, pending: PendingEmcy) {
        if self.fifo.push_back(pending).is_err() {
            self.overflow = true;
        }
    }
}

/// Error registry and emergency message producer
#[allow(missing_debug_implementations)]
pub struct Emergency {
    inner: Mutex<RefCell<EmcyInner>>,
    node_id: AtomicCell<u8>,
    cob_id: AtomicCell<u32>,
    inhibit_100us: AtomicCell<u16>,
    can_status: AtomicCell<CanErrorStatus>,
    consumer: AtomicCell<Option<&'static EmcyConsumerCallback>>,
}

impl Default for Emergency {
    fn default() -> Self {
        Self::new()
    }
}

impl Emergency {
    /// Create a new Emergency object, using the pre-defined COB-ID and no inhibit time
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(RefCell::new(EmcyInner::new())),
            node_id: AtomicCell::new(0),
            cob_id: AtomicCell::new(EMCY_BASE as u32),
            inhibit_100us: AtomicCell::new(0),
            can_status: AtomicCell::new(CanErrorStatus(0)),
            consumer: AtomicCell::new(None),
        }
    }

    /// Reset communication state
    ///
    /// Clears all conditions and queued frames. The error history, COB-ID and inhibit time are kept.
    pub(crate) fn reset(&self, node_id: u8) {
        self.node_id.store(node_id);
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            let history = core::mem::take(&mut inner.history);
            *inner = EmcyInner::new();
            inner.history = history;
            inner.can_status_old = self.can_status.load().0;
        });
    }

    /// Report an error condition
    ///
    /// Nothing happens if the condition is already active. Reporting a bit beyond
    /// [`ERROR_STATUS_BITS`] is itself reported as
    /// [`WRONG_ERROR_REPORT`](error_bit::WRONG_ERROR_REPORT) on the next call to `process`.
    pub fn error_report(&self, bit: u8, code: u16, info: u32) {
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            if bit as usize >= ERROR_STATUS_BITS {
                inner.wrong_report = Some(bit);
                return;
            }
            if inner.is_set(bit) {
                return;
            }
            debug!("EMCY report bit 0x{:x} code 0x{:x}", bit, code);
            inner.status[(bit >> 3) as usize] |= 1 << (bit & 7);
            inner.classes[bit as usize] = register_class(code);
            if code != error_code::NO_ERROR {
                let entry = code as u32 | (info & 0xFFFF) << 16;
                if inner.history.is_full() {
                    inner.history.pop_back();
                }
                inner.history.push_front(entry).ok();
            }
            inner.enqueue(PendingEmcy {
                code,
                error_bit: bit,
                info,
            });
        });
    }

    /// Clear an error condition
    ///
    /// A "no error" frame is queued only if the condition was active.
    pub fn error_reset(&self, bit: u8, info: u32) {
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            if bit as usize >= ERROR_STATUS_BITS {
                inner.wrong_report = Some(bit);
                return;
            }
            if !inner.is_set(bit) {
                return;
            }
            debug!("EMCY reset bit 0x{:x}", bit);
            inner.status[(bit >> 3) as usize] &= !(1 << (bit & 7));
            inner.classes[bit as usize] = 0;
            inner.enqueue(PendingEmcy {
                code: error_code::NO_ERROR,
                error_bit: bit,
                info,
            });
        });
    }

    /// Check if an error condition is active
    pub fn is_error(&self, bit: u8) -> bool {
        if bit as usize >= ERROR_STATUS_BITS {
            return false;
        }
        critical_section::with(|cs| self.inner.borrow_ref(cs).is_set(bit))
    }

    /// The current value of the error register
    pub fn error_register(&self) -> u8 {
        critical_section::with(|cs| self.inner.borrow_ref(cs).register())
    }

    /// The raw error status bitmap
    pub fn status_bits(&self) -> [u8; STATUS_BYTES] {
        critical_section::with(|cs| self.inner.borrow_ref(cs).status)
    }

    /// Number of entries in the pre-defined error field
    pub fn history_len(&self) -> u8 {
        critical_section::with(|cs| self.inner.borrow_ref(cs).history.len() as u8)
    }

    /// Read entry `n` of the pre-defined error field, with 1 being the newest
    pub fn history_entry(&self, n: u8) -> Option<u32> {
        if n == 0 {
            return None;
        }
        critical_section::with(|cs| {
            self.inner
                .borrow_ref(cs)
                .history
                .iter()
                .nth(n as usize - 1)
                .copied()
        })
    }

    /// Empty the pre-defined error field
    pub fn clear_history(&self) {
        critical_section::with(|cs| self.inner.borrow_ref_mut(cs).history.clear());
    }

    /// Publish the error status of the CAN controller
    ///
    /// Changes are turned into error reports and resets on the next call to `process`.
    pub fn set_can_status(&self, status: CanErrorStatus) {
        self.can_status.store(status);
    }

    /// Register a callback for emergency messages from other nodes
    pub fn register_consumer(&self, callback: &'static EmcyConsumerCallback) {
        self.consumer.store(Some(callback));
    }

    /// Queue an emergency message received from another node
    ///
    /// Called from the receive path. Returns false if the queue is full and the message was
    /// dropped.
    pub(crate) fn receive(&self, msg: EmcyMessage) -> bool {
        critical_section::with(|cs| self.inner.borrow_ref_mut(cs).rx.push_back(msg).is_ok())
    }

    /// The COB-ID used for emergency messages, or None if the producer is disabled
    pub fn producer_id(&self) -> Option<CanId> {
        let raw = self.cob_id.load();
        if raw & COB_ID_INVALID != 0 {
            None
        } else {
            Some(CanId::Std(self.effective_id(raw)))
        }
    }

    fn effective_id(&self, raw: u32) -> u16 {
        let id = (raw & 0x7FF) as u16;
        if id == EMCY_BASE {
            id + self.node_id.load() as u16
        } else {
            id
        }
    }

    fn read_cob_id(&self) -> u32 {
        let raw = self.cob_id.load();
        (raw & COB_ID_INVALID) | self.effective_id(raw) as u32
    }

    fn write_cob_id(&self, value: u32) -> Result<(), AbortCode> {
        if value & 0x7FFF_F800 != 0 {
            return Err(AbortCode::InvalidValue);
        }
        let current = self.read_cob_id();
        let was_valid = current & COB_ID_INVALID == 0;
        let valid = value & COB_ID_INVALID == 0;
        if was_valid && valid && (value & 0x7FF) != (current & 0x7FF) {
            return Err(AbortCode::InvalidValue);
        }
        let mut stored = value;
        if value & 0x7FF == EMCY_BASE as u32 + self.node_id.load() as u32 {
            stored = (value & COB_ID_INVALID) | EMCY_BASE as u32;
        }
        self.cob_id.store(stored);
        Ok(())
    }

    /// Run the emergency producer and consumer
    ///
    /// Returns the frame to send, if any. `pre_or_operational` gates the producer; frames stay
    /// queued while the node is in another state.
    pub(crate) fn process(&self, elapsed_us: u32, pre_or_operational: bool) -> Option<CanMessage> {
        self.check_can_status();

        let wrong_report =
            critical_section::with(|cs| self.inner.borrow_ref_mut(cs).wrong_report.take());
        if let Some(bit) = wrong_report {
            self.error_report(
                error_bit::WRONG_ERROR_REPORT,
                error_code::SOFTWARE_INTERNAL,
                bit as u32,
            );
        }

        self.deliver_received();

        let inhibit_us = self.inhibit_100us.load() as u32 * 100;
        let (pending, register, overflowed) = critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            inner.inhibit_timer_us = inner.inhibit_timer_us.saturating_add(elapsed_us);
            if !pre_or_operational || inner.inhibit_timer_us < inhibit_us {
                return (None, 0, false);
            }
            let pending = inner.fifo.pop_front();
            if pending.is_some() {
                inner.inhibit_timer_us = 0;
            }
            let overflowed = pending.is_some() && inner.overflow;
            if overflowed {
                inner.overflow = false;
            }
            (pending, inner.register(), overflowed)
        });

        let pending = pending?;
        if overflowed {
            warn!("EMCY buffer overflowed");
            self.error_report(error_bit::EMERGENCY_BUFFER_FULL, error_code::GENERIC, 0);
        } else {
            self.error_reset(error_bit::EMERGENCY_BUFFER_FULL, 0);
        }

        let id = self.producer_id()?;
        let msg = EmcyMessage {
            node: self.node_id.load(),
            code: pending.code,
            register,
            error_bit: pending.error_bit,
            info: pending.info,
        };
        Some(msg.to_can_message(id))
    }

    fn check_can_status(&self) {
        let status = self.can_status.load();
        let old = critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            core::mem::replace(&mut inner.can_status_old, status.0)
        });
        let changed = CanErrorStatus(status.0 ^ old);
        if changed.0 == 0 {
            return;
        }

        if changed.is_warning() {
            self.set_condition(
                status.is_warning(),
                error_bit::CAN_BUS_WARNING,
                error_code::NO_ERROR,
            );
        }
        const EDGES: [(u16, u8, u16); 5] = [
            (CanErrorStatus::TX_PASSIVE, error_bit::CAN_TX_BUS_PASSIVE, error_code::CAN_PASSIVE),
            (CanErrorStatus::TX_BUS_OFF, error_bit::CAN_TX_BUS_OFF, error_code::BUS_OFF_RECOVERED),
            (CanErrorStatus::TX_OVERFLOW, error_bit::CAN_TX_OVERFLOW, error_code::CAN_OVERRUN),
            (CanErrorStatus::RX_PASSIVE, error_bit::CAN_RX_BUS_PASSIVE, error_code::CAN_PASSIVE),
            (CanErrorStatus::RX_OVERFLOW, error_bit::CAN_RXB_OVERFLOW, error_code::CAN_OVERRUN),
        ];
        for (mask, bit, code) in EDGES {
            if changed.contains(mask) {
                self.set_condition(status.contains(mask), bit, code);
            }
        }
    }

    fn set_condition(&self, active: bool, bit: u8, code: u16) {
        if active {
            self.error_report(bit, code, 0);
        } else {
            self.error_reset(bit, 0);
        }
    }

    fn deliver_received(&self) {
        let Some(callback) = self.consumer.load() else {
            critical_section::with(|cs| self.inner.borrow_ref_mut(cs).rx.clear());
            return;
        };
        while let Some(msg) =
            critical_section::with(|cs| self.inner.borrow_ref_mut(cs).rx.pop_front())
        {
            callback(msg);
        }
    }
}

/// Implements the error register object (0x1001)
#[allow(missing_debug_implementations)]
pub struct ErrorRegisterObject {
    emcy: &'static Emergency,
}

impl ErrorRegisterObject {
    /// Create the object
    pub const fn new(emcy: &'static Emergency) -> Self {
        Self { emcy }
    }
}

impl ObjectAccess for ErrorRegisterObject {
    fn read(&self, sub: u8, offset: usize, buf: &mut [u8]) -> Result<usize, AbortCode> {
        if sub != 0 {
            return Err(AbortCode::NoSuchSubIndex);
        }
        Ok(read_slice(&[self.emcy.error_register()], offset, buf))
    }

    fn read_size(&self, sub: u8) -> Result<usize, AbortCode> {
        self.sub_info(sub).map(|info| info.size)
    }

    fn write(&self, sub: u8, _data: &[u8]) -> Result<(), AbortCode> {
        self.sub_info(sub)?;
        Err(AbortCode::ReadOnly)
    }

    fn object_code(&self) -> ObjectCode {
        ObjectCode::Var
    }

    fn sub_info(&self, sub: u8) -> Result<SubInfo, AbortCode> {
        if sub == 0 {
            Ok(SubInfo::new_u8().ro_access().mapping(PdoMapping::Tpdo))
        } else {
            Err(AbortCode::NoSuchSubIndex)
        }
    }
}

/// Implements the pre-defined error field (0x1003)
///
/// Sub 0 holds the number of entries and accepts a write of 0 to clear the field. Subs 1..=8 hold
/// the entries, newest first.
#[allow(missing_debug_implementations)]
pub struct ErrorHistoryObject {
    emcy: &'static Emergency,
}

impl ErrorHistoryObject {
    /// Create the object
    pub const fn new(emcy: &'static Emergency) -> Self {
        Self { emcy }
    }
}

impl ObjectAccess for ErrorHistoryObject {
    fn read(&self, sub: u8, offset: usize, buf: &mut [u8]) -> Result<usize, AbortCode> {
        self.sub_info(sub)?;
        if sub == 0 {
            Ok(read_slice(&[self.emcy.history_len()], offset, buf))
        } else {
            let entry = self.emcy.history_entry(sub).ok_or(AbortCode::NoData)?;
            Ok(read_slice(&entry.to_le_bytes(), offset, buf))
        }
    }

    fn read_size(&self, sub: u8) -> Result<usize, AbortCode> {
        self.sub_info(sub).map(|info| info.size)
    }

    fn write(&self, sub: u8, data: &[u8]) -> Result<(), AbortCode> {
        self.sub_info(sub)?;
        if sub != 0 {
            return Err(AbortCode::ReadOnly);
        }
        let [value] = exact_bytes::<1>(data)?;
        if value != 0 {
            return Err(AbortCode::InvalidValue);
        }
        self.emcy.clear_history();
        Ok(())
    }

    fn object_code(&self) -> ObjectCode {
        ObjectCode::Array
    }

    fn max_sub_number(&self) -> u8 {
        ERROR_HISTORY_SIZE as u8
    }

    fn sub_info(&self, sub: u8) -> Result<SubInfo, AbortCode> {
        match sub {
            0 => Ok(SubInfo::new_u8().rw_access()),
            s if s as usize <= ERROR_HISTORY_SIZE => Ok(SubInfo::new_u32().ro_access()),
            _ => Err(AbortCode::NoSuchSubIndex),
        }
    }
}

/// Implements the EMCY COB-ID (0x1014) and inhibit time (0x1015) objects
///
/// The COB-ID reads back with the node ID added when it is the pre-defined ID.
#[allow(missing_debug_implementations)]
pub struct EmcyConfigObject {
    emcy: &'static Emergency,
    inhibit: bool,
}

impl EmcyConfigObject {
    /// Create the COB-ID object (0x1014)
    pub const fn cob_id(emcy: &'static Emergency) -> Self {
        Self {
            emcy,
            inhibit: false,
        }
    }

    /// Create the inhibit time object (0x1015)
    pub const fn inhibit_time(emcy: &'static Emergency) -> Self {
        Self {
            emcy,
            inhibit: true,
        }
    }

    fn store(&self, data: &[u8], validate: bool) -> Result<(), AbortCode> {
        if self.inhibit {
            let value = u16::from_le_bytes(exact_bytes(data)?);
            self.emcy.inhibit_100us.store(value);
            Ok(())
        } else {
            let value = u32::from_le_bytes(exact_bytes(data)?);
            if validate {
                self.emcy.write_cob_id(value)
            } else {
                self.emcy.cob_id.store(value);
                Ok(())
            }
        }
    }
}

impl ObjectAccess for EmcyConfigObject {
    fn read(&self, sub: u8, offset: usize, buf: &mut [u8]) -> Result<usize, AbortCode> {
        self.sub_info(sub)?;
        if self.inhibit {
            Ok(read_slice(
                &self.emcy.inhibit_100us.load().to_le_bytes(),
                offset,
                buf,
            ))
        } else {
            Ok(read_slice(&self.emcy.read_cob_id().to_le_bytes(), offset, buf))
        }
    }

    fn read_size(&self, sub: u8) -> Result<usize, AbortCode> {
        self.sub_info(sub).map(|info| info.size)
    }

    fn write(&self, sub: u8, data: &[u8]) -> Result<(), AbortCode> {
        self.sub_info(sub)?;
        self.store(data, true)
    }

    fn restore(&self, sub: u8, data: &[u8]) -> Result<(), AbortCode> {
        self.sub_info(sub)?;
        self.store(data, false)
    }

    fn object_code(&self) -> ObjectCode {
        ObjectCode::Var
    }

    fn sub_info(&self, sub: u8) -> Result<SubInfo, AbortCode> {
        if sub != 0 {
            return Err(AbortCode::NoSuchSubIndex);
        }
        let info = if self.inhibit {
            SubInfo::new_u16()
        } else {
            SubInfo::new_typed(DataType::UInt32, 4)
        };
        Ok(info.rw_access().persist(true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leak<T>(value: T) -> &'static T {
        Box::leak(Box::new(value))
    }

    fn emcy_for_node(node_id: u8) -> &'static Emergency {
        let emcy = leak(Emergency::new());
        emcy.reset(node_id);
        emcy
    }

    #[test]
    fn test_report_and_reset() {
        let emcy = emcy_for_node(10);
        emcy.error_report(error_bit::CAN_TX_OVERFLOW, error_code::CAN_OVERRUN, 0x1234);
        // A second report of the same condition is ignored
        emcy.error_report(error_bit::CAN_TX_OVERFLOW, error_code::CAN_OVERRUN, 0x1234);
        assert!(emcy.is_error(error_bit::CAN_TX_OVERFLOW));
        assert_eq!(
            error_register::GENERIC | error_register::COMMUNICATION,
            emcy.error_register()
        );

        let msg = emcy.process(1000, true).unwrap();
        assert_eq!(CanId::Std(0x8A), msg.id());
        assert_eq!(
            &[0x10, 0x81, 0x11, 0x14, 0x34, 0x12, 0, 0],
            msg.data()
        );
        assert!(emcy.process(1000, true).is_none());

        emcy.error_reset(error_bit::CAN_TX_OVERFLOW, 0);
        emcy.error_reset(error_bit::CAN_TX_OVERFLOW, 0);
        assert_eq!(0, emcy.error_register());
        let msg = emcy.process(1000, true).unwrap();
        assert_eq!(&[0, 0, 0, 0x14, 0, 0, 0, 0], msg.data());
        assert!(emcy.process(1000, true).is_none());
    }

    #[test]
    fn test_history() {
        let emcy = emcy_for_node(1);
        for i in 0..10u8 {
            emcy.error_report(error_bit::MANUFACTURER_START + i, 0xFF00 + i as u16, 0xAB);
        }
        assert_eq!(ERROR_HISTORY_SIZE as u8, emcy.history_len());
        assert_eq!(Some(0x00AB_FF09), emcy.history_entry(1));
        assert_eq!(Some(0x00AB_FF02), emcy.history_entry(8));

        let obj = ErrorHistoryObject::new(emcy);
        assert_eq!(8, obj.read_u8(0).unwrap());
        assert_eq!(0x00AB_FF09, obj.read_u32(1).unwrap());
        assert_eq!(Err(AbortCode::InvalidValue), obj.write(0, &[1]));
        assert_eq!(Err(AbortCode::ReadOnly), obj.write(1, &[0; 4]));
        obj.write(0, &[0]).unwrap();
        assert_eq!(0, obj.read_u8(0).unwrap());
        assert_eq!(Err(AbortCode::NoData), obj.read_u32(1));
        assert_eq!(
            error_register::GENERIC | error_register::MANUFACTURER,
            ErrorRegisterObject::new(emcy).read_u8(0).unwrap()
        );
    }

    #[test]
    fn test_fifo_overflow_and_inhibit() {
        let emcy = emcy_for_node(5);
        EmcyConfigObject::inhibit_time(emcy)
            .write(0, &10u16.to_le_bytes())
            .unwrap();
        for i in 0..(EMCY_FIFO_SIZE as u8 + 2) {
            emcy.error_report(error_bit::MANUFACTURER_START + i, error_code::GENERIC, 0);
        }

        // Not sent while stopped
        assert!(emcy.process(0, false).is_none());
        assert!(emcy.process(0, true).is_some());
        assert!(emcy.is_error(error_bit::EMERGENCY_BUFFER_FULL));
        // Inhibit time is 1ms
        assert!(emcy.process(999, true).is_none());
        let mut sent = 1;
        while emcy.process(1000, true).is_some() {
            sent += 1;
        }
        // The queued frames, then the buffer full report and its reset
        assert_eq!(EMCY_FIFO_SIZE + 2, sent);
    }

    #[test]
    fn test_wrong_report() {
        let emcy = emcy_for_node(5);
        emcy.error_report(200, error_code::GENERIC, 0);
        let msg = emcy.process(0, true).unwrap();
        assert_eq!(error_bit::WRONG_ERROR_REPORT, msg.data()[3]);
        assert_eq!(200, msg.data()[4]);
    }

    #[test]
    fn test_can_status_edges() {
        let emcy = emcy_for_node(5);
        emcy.set_can_status(CanErrorStatus(
            CanErrorStatus::TX_BUS_OFF | CanErrorStatus::RX_WARNING,
        ));
        emcy.process(0, false);
        assert!(emcy.is_error(error_bit::CAN_TX_BUS_OFF));
        assert!(emcy.is_error(error_bit::CAN_BUS_WARNING));
        emcy.set_can_status(CanErrorStatus(0));
        emcy.process(0, false);
        assert!(!emcy.is_error(error_bit::CAN_TX_BUS_OFF));
        assert!(!emcy.is_error(error_bit::CAN_BUS_WARNING));
    }

    #[test]
    fn test_cob_id_object() {
        let emcy = emcy_for_node(10);
        let obj = EmcyConfigObject::cob_id(emcy);
        assert_eq!(0x8A, obj.read_u32(0).unwrap());
        // Can't change the ID while the producer is enabled
        assert_eq!(Err(AbortCode::InvalidValue), obj.write(0, &0x90u32.to_le_bytes()));
        // Extended IDs are not supported
        assert_eq!(
            Err(AbortCode::InvalidValue),
            obj.write(0, &(1u32 << 29).to_le_bytes())
        );
        obj.write(0, &0x8000_0090u32.to_le_bytes()).unwrap();
        assert_eq!(None, emcy.producer_id());
        obj.write(0, &0x90u32.to_le_bytes()).unwrap();
        assert_eq!(Some(CanId::Std(0x90)), emcy.producer_id());

        // Writing the pre-defined ID makes it follow the node ID
        obj.write(0, &0x8000_0000u32.to_le_bytes()).unwrap();
        obj.write(0, &0x8Au32.to_le_bytes()).unwrap();
        emcy.reset(11);
        assert_eq!(0x8B, obj.read_u32(0).unwrap());
    }

    #[test]
    fn test_consumer_callback() {
        static RECEIVED: AtomicCell<Option<EmcyMessage>> = AtomicCell::new(None);
        let emcy = emcy_for_node(1);
        let callback: &'static EmcyConsumerCallback =
            Box::leak(Box::new(|msg: EmcyMessage| RECEIVED.store(Some(msg))));
        emcy.register_consumer(callback);
        let msg = EmcyMessage {
            node: 3,
            code: 0x5000,
            register: 1,
            error_bit: 0x2F,
            info: 7,
        };
        assert!(emcy.receive(msg));
        emcy.process(0, true);
        assert_eq!(Some(msg), RECEIVED.load());
    }
}
