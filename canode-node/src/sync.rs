//! SYNC producer and consumer
//!
//! The SYNC configuration lives in the application's object dictionary:
//!
//! - 0x1005: COB-ID. Bit 30 makes this node the SYNC producer, bits 0..10 hold the CAN ID.
//! - 0x1006: Communication cycle period in µs. 0 disables production and timeout monitoring.
//! - 0x1007: Synchronous window length in µs. 0 disables the window.
//! - 0x1019: Counter overflow value. 0 sends SYNC without a counter byte.
//!
//! Each object present in the OD must be an [`ExtendableObject`](crate::object_dict::ExtendableObject).
//! [`SyncState`] installs itself as the extension, validates writes, and mirrors the values for the
//! processing path.
use canode_common::{
    constants::object_ids,
    messages::{NmtState, SyncObject},
    sdo::AbortCode,
    AtomicCell, CanId, CanMessage,
};
use defmt_or_log::debug;

use crate::{
    emcy::{error_bit, error_code, Emergency},
    object_dict::{exact_bytes, extension_init, find_object, ODEntry, ObjectAccess, ObjectExtension},
};

const PRODUCER_BIT: u32 = 1 << 30;
const EXTENDED_BIT: u32 = 1 << 29;
const DEFAULT_COB_ID: u32 = 0x80;

#[derive(Clone, Copy, Debug, Default)]
struct SyncRuntime {
    timer_us: u32,
    counter: u8,
    inside_window: bool,
}

/// The result of one SYNC processing cycle
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncOutput {
    /// Set when a SYNC was received or produced in this cycle. Holds the counter value, or 0 when
    /// the counter is not in use.
    pub sync: Option<u8>,
    /// Set in the cycle in which the synchronous window closed
    pub window_closed: bool,
    /// A SYNC frame to send
    pub frame: Option<CanMessage>,
}

/// SYNC configuration and timing state
#[allow(missing_debug_implementations)]
pub struct SyncState {
    cob_id: AtomicCell<u32>,
    period_us: AtomicCell<u32>,
    window_us: AtomicCell<u32>,
    overflow: AtomicCell<u8>,
    rx: AtomicCell<Option<u8>>,
    rx_error: AtomicCell<Option<u8>>,
    runtime: AtomicCell<SyncRuntime>,
}

impl Default for SyncState {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncState {
    /// Create a SyncState with the default configuration: consumer on 0x80, no period
    pub const fn new() -> Self {
        Self {
            cob_id: AtomicCell::new(DEFAULT_COB_ID),
            period_us: AtomicCell::new(0),
            window_us: AtomicCell::new(0),
            overflow: AtomicCell::new(0),
            rx: AtomicCell::new(None),
            rx_error: AtomicCell::new(None),
            runtime: AtomicCell::new(SyncRuntime {
                timer_us: 0,
                counter: 0,
                inside_window: true,
            }),
        }
    }

    /// Install the extensions on the SYNC objects and load their current values
    pub(crate) fn init(&'static self, od: &'static [ODEntry<'static>]) {
        let read = |index| find_object(od, index).and_then(|obj| obj.read_u32(0).ok());
        self.cob_id.store(read(object_ids::SYNC_COB_ID).unwrap_or(DEFAULT_COB_ID));
        self.period_us.store(read(object_ids::SYNC_PERIOD).unwrap_or(0));
        self.window_us.store(read(object_ids::SYNC_WINDOW).unwrap_or(0));
        self.overflow.store(
            find_object(od, object_ids::SYNC_COUNTER_OVERFLOW)
                .and_then(|obj| obj.read_u8(0).ok())
                .unwrap_or(0),
        );
        self.rx.store(None);
        self.rx_error.store(None);
        self.runtime.store(SyncRuntime {
            inside_window: true,
            ..Default::default()
        });

        for index in [
            object_ids::SYNC_COB_ID,
            object_ids::SYNC_PERIOD,
            object_ids::SYNC_WINDOW,
            object_ids::SYNC_COUNTER_OVERFLOW,
        ] {
            // Objects missing from the OD keep their defaults
            extension_init(od, index, self).ok();
        }
    }

    /// The CAN ID of SYNC messages
    pub fn cob_id(&self) -> CanId {
        CanId::Std((self.cob_id.load() & 0x7FF) as u16)
    }

    /// True if this node produces SYNC messages
    pub fn is_producer(&self) -> bool {
        self.cob_id.load() & PRODUCER_BIT != 0
    }

    /// The communication cycle period in µs
    pub fn period_us(&self) -> u32 {
        self.period_us.load()
    }

    /// The synchronous window length in µs
    pub fn window_us(&self) -> u32 {
        self.window_us.load()
    }

    /// The counter overflow value
    pub fn counter_overflow(&self) -> u8 {
        self.overflow.load()
    }

    /// True while the time since the last SYNC is within the synchronous window
    pub fn inside_window(&self) -> bool {
        self.runtime.load().inside_window
    }

    /// Store a received SYNC frame
    ///
    /// Called from the receive path.
    pub(crate) fn receive(&self, msg: &CanMessage) {
        let data = msg.data();
        let expected = if self.overflow.load() == 0 { 0 } else { 1 };
        if data.len() == expected {
            self.rx.store(Some(data.first().copied().unwrap_or(0)));
        } else {
            self.rx_error.store(Some(data.len() as u8));
        }
    }

    /// Run one SYNC cycle
    ///
    /// The consumer runs in Pre-operational and Operational, the producer only in Operational.
    pub(crate) fn process(&self, elapsed_us: u32, state: NmtState, emcy: &Emergency) -> SyncOutput {
        let mut output = SyncOutput::default();

        if let Some(dlc) = self.rx_error.take() {
            emcy.error_report(
                error_bit::SYNC_LENGTH,
                error_code::SYNC_DATA_LENGTH,
                dlc as u32,
            );
        }

        if !matches!(state, NmtState::PreOperational | NmtState::Operational) {
            self.rx.store(None);
            return output;
        }

        let period = self.period_us.load();
        let window = self.window_us.load();
        let mut rt = self.runtime.load();
        rt.timer_us = rt.timer_us.saturating_add(elapsed_us);

        if let Some(counter) = self.rx.take() {
            rt.timer_us = 0;
            rt.counter = counter;
            output.sync = Some(counter);
        }

        if self.is_producer() && period != 0 && state == NmtState::Operational && rt.timer_us >= period {
            let overflow = self.overflow.load();
            let sync = if overflow == 0 {
                SyncObject::default()
            } else {
                rt.counter = if rt.counter >= overflow { 1 } else { rt.counter + 1 };
                SyncObject::new(rt.counter)
            };
            rt.timer_us = 0;
            output.sync = Some(rt.counter);
            output.frame = Some(sync.to_can_message(self.cob_id()));
        }

        if window != 0 && rt.timer_us > window {
            if rt.inside_window {
                output.window_closed = true;
            }
            rt.inside_window = false;
        } else {
            rt.inside_window = true;
        }

        if period != 0 {
            let timeout = (period / 2).saturating_mul(3).max(period);
            if rt.timer_us > timeout {
                emcy.error_report(error_bit::SYNC_TIME_OUT, error_code::COMMUNICATION, rt.timer_us);
            } else {
                emcy.error_reset(error_bit::SYNC_TIME_OUT, rt.timer_us);
            }
        }

        self.runtime.store(rt);
        output
    }

    fn write_cob_id(&self, value: u32) -> Result<(), AbortCode> {
        if value & EXTENDED_BIT != 0 || value & !(PRODUCER_BIT | 0x7FF) & !(1 << 31) != 0 {
            return Err(AbortCode::InvalidValue);
        }
        let current = self.cob_id.load();
        if current & PRODUCER_BIT != 0 && (value & 0x7FF) != (current & 0x7FF) {
            return Err(AbortCode::InvalidValue);
        }
        Ok(())
    }
}

impl ObjectExtension for SyncState {
    fn write(
        &self,
        index: u16,
        object: &dyn ObjectAccess,
        sub: u8,
        data: &[u8],
    ) -> Result<(), AbortCode> {
        match index {
            object_ids::SYNC_COB_ID => {
                let value = u32::from_le_bytes(exact_bytes(data)?);
                self.write_cob_id(value)?;
                object.write(sub, data)?;
                if value & PRODUCER_BIT != 0 && self.cob_id.load() & PRODUCER_BIT == 0 {
                    let _ = self.runtime.fetch_update(|mut rt| {
                        rt.counter = 0;
                        rt.timer_us = 0;
                        Some(rt)
                    });
                }
                debug!("SYNC COB-ID set to 0x{:x}", value);
                self.cob_id.store(value);
            }
            object_ids::SYNC_PERIOD => {
                let value = u32::from_le_bytes(exact_bytes(data)?);
                object.write(sub, data)?;
                let was_zero = self.period_us.load() == 0;
                self.period_us.store(value);
                let _ = self.runtime.fetch_update(|mut rt| {
                    if was_zero && value != 0 {
                        rt.counter = 0;
                    }
                    rt.timer_us = 0;
                    Some(rt)
                });
            }
            object_ids::SYNC_WINDOW => {
                let value = u32::from_le_bytes(exact_bytes(data)?);
                object.write(sub, data)?;
                self.window_us.store(value);
            }
            object_ids::SYNC_COUNTER_OVERFLOW => {
                let [value] = exact_bytes::<1>(data)?;
                if self.period_us.load() != 0 {
                    return Err(AbortCode::CantStoreDeviceState);
                }
                if value == 1 || value > 240 {
                    return Err(AbortCode::InvalidValue);
                }
                object.write(sub, data)?;
                self.overflow.store(value);
            }
            _ => object.write(sub, data)?,
        }
        Ok(())
    }
}
