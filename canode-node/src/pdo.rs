//! Process data objects
//!
//! Each [`Pdo`] holds the communication and mapping parameters of one RPDO or TPDO, together with
//! the run time state needed to send or receive it. The parameters are exposed in the object
//! dictionary through [`PdoCommObject`] (0x14xx / 0x18xx) and [`PdoMappingObject`]
//! (0x16xx / 0x1Axx).
//!
//! Mappings are resolved into direct object references when the PDO is initialized, and again on
//! every accepted mapping write. Configuration follows the usual CANopen rules: the mapping can
//! only be changed while the PDO is invalid (bit 31 of the COB-ID set), and the mapping entries
//! can only be changed while the mapping count (sub 0) is zero.
use canode_common::{
    objects::{ObjectCode, SubInfo},
    sdo::AbortCode,
    AtomicCell, CanId, CanMessage,
};
use defmt_or_log::{debug, warn};

use crate::{
    emcy::{error_bit, error_code, Emergency},
    object_dict::{exact_bytes, find_object, od_lock, read_slice, ODEntry, ObjectAccess},
};

/// Number of mapping entries supported per PDO
///
/// Without CAN-FD or sub-byte mappings it is not possible to map more than 8 objects.
pub const N_MAPPING_PARAMS: usize = 8;

/// Maximum number of data bytes in a PDO
pub const MAX_PDO_SIZE: usize = 8;

const INVALID_BIT: u32 = 1 << 31;
const NO_RTR_BIT: u32 = 1 << 30;
const RESERVED_BITS: u32 = 0x3FFF_F800;

/// Transmission type values (sub 2 of the communication parameter)
pub mod transmission_type {
    /// Synchronous, sent on the SYNC following an event
    pub const SYNC_ACYCLIC: u8 = 0;
    /// Highest value for cyclic synchronous transmission every N SYNCs
    pub const SYNC_MAX: u8 = 240;
    /// Data latched at SYNC, sent on remote request
    pub const SYNC_RTR: u8 = 252;
    /// Current data sent on remote request
    pub const EVENT_RTR: u8 = 253;
    /// Event driven, manufacturer specific
    pub const EVENT_MANUFACTURER: u8 = 254;
    /// Event driven, device profile specific
    pub const EVENT_PROFILE: u8 = 255;
}
use transmission_type as tt;

/// Whether a PDO is received or transmitted
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PdoKind {
    /// Received PDO, written into the object dictionary
    Rpdo,
    /// Transmitted PDO, read from the object dictionary
    Tpdo,
}

/// Communication parameters as they are stored in the object dictionary
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct PdoComm {
    cob_id: u32,
    transmission_type: u8,
    inhibit_time: u16,
    event_timer: u16,
    sync_start: u8,
}

#[derive(Clone, Copy, Default)]
enum MapSlot {
    #[default]
    Invalid,
    Dummy {
        len: u8,
    },
    Object {
        object: &'static dyn ObjectAccess,
        sub: u8,
        len: u8,
        /// Number of bytes written on reception. Values shorter than the object are zero extended.
        write_len: u8,
    },
}

impl MapSlot {
    fn len(&self) -> usize {
        match self {
            MapSlot::Invalid => 0,
            MapSlot::Dummy { len } | MapSlot::Object { len, .. } => *len as usize,
        }
    }
}

/// The configuration currently in effect
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Active {
    valid: bool,
    can_id: u16,
    data_len: u8,
    count: u8,
}

/// Length check state of received frames
///
/// The receive path only moves the state forward, the processing path reports the result and
/// acknowledges it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum RxStatus {
    #[default]
    AckNoError,
    AckError,
    Ok,
    Short,
    Long,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct PdoTimers {
    inhibit_us: u32,
    event_us: u32,
    /// 255 before the first SYNC, 254 while waiting for the SYNC start value
    sync_counter: u8,
    /// RPDO deadline monitor. 0 until the first frame is received.
    rx_timeout_us: u32,
}

impl PdoTimers {
    const fn new() -> Self {
        Self {
            inhibit_us: 0,
            event_us: 0,
            sync_counter: 255,
            rx_timeout_us: 0,
        }
    }
}

/// A frame produced by a TPDO
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TpdoFrame {
    /// The frame to send
    pub msg: CanMessage,
    /// True for SYNC triggered TPDOs, which must leave within the synchronous window
    pub synchronous: bool,
}

/// State of a single PDO
#[allow(missing_debug_implementations)]
pub struct Pdo {
    kind: PdoKind,
    od: AtomicCell<Option<&'static [ODEntry<'static>]>>,
    default_can_id: AtomicCell<u16>,
    comm: AtomicCell<PdoComm>,
    mapping_count: AtomicCell<u8>,
    mapping_params: [AtomicCell<u32>; N_MAPPING_PARAMS],
    slots: [AtomicCell<MapSlot>; N_MAPPING_PARAMS],
    active: AtomicCell<Active>,
    rx: AtomicCell<Option<[u8; MAX_PDO_SIZE]>>,
    rx_latched: AtomicCell<Option<[u8; MAX_PDO_SIZE]>>,
    rx_status: AtomicCell<RxStatus>,
    rtr: AtomicCell<bool>,
    send_request: AtomicCell<bool>,
    sync_data: AtomicCell<Option<[u8; MAX_PDO_SIZE]>>,
    timers: AtomicCell<PdoTimers>,
}

impl Pdo {
    const fn new(kind: PdoKind, transmission_type: u8) -> Self {
        Self {
            kind,
            od: AtomicCell::new(None),
            default_can_id: AtomicCell::new(0),
            comm: AtomicCell::new(PdoComm {
                cob_id: INVALID_BIT,
                transmission_type,
                inhibit_time: 0,
                event_timer: 0,
                sync_start: 0,
            }),
            mapping_count: AtomicCell::new(0),
            mapping_params: [const { AtomicCell::new(0) }; N_MAPPING_PARAMS],
            slots: [const { AtomicCell::new(MapSlot::Invalid) }; N_MAPPING_PARAMS],
            active: AtomicCell::new(Active {
                valid: false,
                can_id: 0,
                data_len: 0,
                count: 0,
            }),
            rx: AtomicCell::new(None),
            rx_latched: AtomicCell::new(None),
            rx_status: AtomicCell::new(RxStatus::AckNoError),
            rtr: AtomicCell::new(false),
            send_request: AtomicCell::new(true),
            sync_data: AtomicCell::new(None),
            timers: AtomicCell::new(PdoTimers::new()),
        }
    }

    /// Create a disabled RPDO with event driven reception
    pub const fn new_rpdo() -> Self {
        Self::new(PdoKind::Rpdo, tt::EVENT_PROFILE)
    }

    /// Create a disabled TPDO with event driven transmission
    pub const fn new_tpdo() -> Self {
        Self::new(PdoKind::Tpdo, tt::EVENT_PROFILE)
    }

    /// Whether this is an RPDO or a TPDO
    pub fn kind(&self) -> PdoKind {
        self.kind
    }

    /// True if the PDO is enabled and its mapping is valid
    pub fn is_valid(&self) -> bool {
        self.active.load().valid
    }

    /// The CAN ID in use, or None while the PDO is disabled
    pub fn cob_id(&self) -> Option<CanId> {
        let active = self.active.load();
        active.valid.then_some(CanId::Std(active.can_id))
    }

    /// The configured transmission type
    pub fn transmission_type(&self) -> u8 {
        self.comm.load().transmission_type
    }

    /// Number of data bytes of the active mapping
    pub fn data_len(&self) -> usize {
        self.active.load().data_len as usize
    }

    fn is_synchronous(&self) -> bool {
        self.transmission_type() <= tt::SYNC_MAX
    }

    /// Request transmission of an event driven TPDO
    ///
    /// The frame is sent on the next process cycle, subject to the inhibit time.
    pub fn request(&self) {
        self.send_request.store(true);
    }

    /// Load the stored configuration and activate it
    ///
    /// `default_can_id` is the pre-defined COB-ID for this PDO and node ID, or 0 when the PDO has
    /// none. Errors in the stored configuration leave the PDO disabled and are reported as
    /// [`error_bit::PDO_WRONG_MAPPING`].
    pub(crate) fn init(
        &'static self,
        od: &'static [ODEntry<'static>],
        default_can_id: u16,
        emcy: &Emergency,
    ) {
        self.od.store(Some(od));
        self.default_can_id.store(default_can_id);
        let base = default_can_id & 0xFF80;

        let mut comm = self.comm.load();
        let stored_id = (comm.cob_id & 0x7FF) as u16;
        // An unset CAN ID takes the pre-defined one, and the pre-defined one is stored without
        // the node ID so that it follows node ID changes
        if stored_id == 0 || (default_can_id != 0 && stored_id == default_can_id) {
            comm.cob_id = (comm.cob_id & !0x7FF) | base as u32;
        }
        if self.kind == PdoKind::Tpdo
            && comm.transmission_type > tt::SYNC_MAX
            && comm.transmission_type < tt::SYNC_RTR
        {
            comm.transmission_type = tt::EVENT_MANUFACTURER;
        }
        self.comm.store(comm);

        let mut erroneous_map = 0;
        let count = self.mapping_count.load();
        let mut data_len = 0;
        for (i, (param, slot)) in self.mapping_params.iter().zip(&self.slots).enumerate() {
            let param = param.load();
            let resolved = resolve_mapping(od, param, self.kind).unwrap_or_default();
            if i < count as usize {
                if matches!(resolved, MapSlot::Invalid) && erroneous_map == 0 {
                    erroneous_map = param;
                }
                data_len += resolved.len();
            }
            slot.store(resolved);
        }
        if count as usize > N_MAPPING_PARAMS || data_len > MAX_PDO_SIZE || (data_len == 0 && count > 0)
        {
            if erroneous_map == 0 {
                erroneous_map = 1;
            }
        }
        let (count, data_len) = if erroneous_map == 0 {
            (count, data_len as u8)
        } else {
            (0, 0)
        };

        let mut valid = comm.cob_id & INVALID_BIT == 0;
        let mut can_id = (comm.cob_id & 0x7FF) as u16;
        if valid && (count == 0 || can_id == 0 || comm.cob_id & RESERVED_BITS != 0) {
            valid = false;
            if erroneous_map == 0 {
                erroneous_map = 1;
            }
        }
        if erroneous_map != 0 {
            // 1 flags a COB-ID or length problem, anything else is the offending mapping entry
            let info = if erroneous_map == 1 { comm.cob_id } else { erroneous_map };
            emcy.error_report(error_bit::PDO_WRONG_MAPPING, error_code::PROTOCOL, info);
        }
        if !valid {
            can_id = 0;
        } else if can_id == base {
            can_id = default_can_id;
        }

        self.active.store(Active {
            valid,
            can_id,
            data_len,
            count,
        });
        self.rx.store(None);
        self.rx_latched.store(None);
        self.rx_status.store(RxStatus::AckNoError);
        self.rtr.store(false);
        self.sync_data.store(None);
        self.send_request.store(true);
        self.timers.store(PdoTimers::new());
    }

    /// Store a received RPDO frame
    ///
    /// Called from the receive path. Returns true if the frame belongs to this PDO.
    pub(crate) fn receive(&self, msg: &CanMessage) -> bool {
        let active = self.active.load();
        if self.kind != PdoKind::Rpdo
            || !active.valid
            || msg.is_rtr()
            || msg.id() != CanId::Std(active.can_id)
        {
            return false;
        }
        let data = msg.data();
        let expected = active.data_len as usize;
        let _ = self.rx_status.fetch_update(|status| {
            Some(if data.len() < expected {
                if status == RxStatus::AckNoError {
                    RxStatus::Short
                } else {
                    status
                }
            } else if data.len() > expected {
                if status == RxStatus::AckNoError {
                    RxStatus::Long
                } else {
                    status
                }
            } else if status == RxStatus::AckError {
                RxStatus::Ok
            } else {
                status
            })
        });
        if data.len() >= expected {
            let mut buf = [0; MAX_PDO_SIZE];
            buf[..expected].copy_from_slice(&data[..expected]);
            self.rx.store(Some(buf));
        }
        true
    }

    /// Handle a remote request for a TPDO
    ///
    /// Called from the receive path. Returns true if the frame belongs to this PDO.
    pub(crate) fn receive_rtr(&self, msg: &CanMessage) -> bool {
        let active = self.active.load();
        if self.kind != PdoKind::Tpdo
            || !active.valid
            || !msg.is_rtr()
            || msg.id() != CanId::Std(active.can_id)
        {
            return false;
        }
        let comm = self.comm.load();
        if comm.cob_id & NO_RTR_BIT == 0
            && matches!(comm.transmission_type, tt::SYNC_RTR | tt::EVENT_RTR)
        {
            self.rtr.store(true);
        }
        true
    }

    /// Move the last frame received before a SYNC to the commit buffer of a synchronous RPDO
    ///
    /// Called whenever a SYNC is received or produced.
    pub(crate) fn sync_latch(&self) {
        if self.kind == PdoKind::Rpdo && self.is_synchronous() {
            if let Some(data) = self.rx.take() {
                self.rx_latched.store(Some(data));
            }
        }
    }

    /// Run one RPDO cycle
    ///
    /// Received data is written to the mapped objects. Synchronous RPDOs only commit data latched
    /// at a SYNC. `running` must be true only while the node is Pre-operational or Operational.
    pub(crate) fn process_rpdo(&self, elapsed_us: u32, running: bool, emcy: &Emergency) {
        let active = self.active.load();
        let status = self.rx_status.load();
        if matches!(status, RxStatus::Ok | RxStatus::Short | RxStatus::Long) {
            let error = status != RxStatus::Ok;
            if error {
                let code = if status == RxStatus::Short {
                    error_code::PDO_LENGTH
                } else {
                    error_code::PDO_LENGTH_EXC
                };
                warn!("RPDO 0x{:x} wrong length", active.can_id);
                emcy.error_report(error_bit::RPDO_WRONG_LENGTH, code, active.data_len as u32);
            } else {
                emcy.error_reset(error_bit::RPDO_WRONG_LENGTH, active.data_len as u32);
            }
            self.rx_status.store(if error {
                RxStatus::AckError
            } else {
                RxStatus::AckNoError
            });
        }

        if !active.valid || !running {
            self.rx.store(None);
            self.rx_latched.store(None);
            let _ = self.timers.fetch_update(|mut t| {
                t.rx_timeout_us = 0;
                Some(t)
            });
            return;
        }

        let frame = if self.is_synchronous() {
            self.rx_latched.take()
        } else {
            self.rx.take()
        };
        let received = frame.is_some();
        if let Some(data) = frame {
            self.commit(&data, active.count);
        }

        let timeout_us = self.comm.load().event_timer as u32 * 1000;
        if timeout_us == 0 {
            return;
        }
        let mut timers = self.timers.load();
        if received {
            if timers.rx_timeout_us > timeout_us {
                emcy.error_reset(error_bit::RPDO_TIME_OUT, timers.rx_timeout_us);
            }
            // Monitoring starts with the first frame
            timers.rx_timeout_us = 1;
        } else if timers.rx_timeout_us > 0 && timers.rx_timeout_us <= timeout_us {
            timers.rx_timeout_us = timers.rx_timeout_us.saturating_add(elapsed_us);
            if timers.rx_timeout_us > timeout_us {
                warn!("RPDO 0x{:x} timed out", active.can_id);
                emcy.error_report(
                    error_bit::RPDO_TIME_OUT,
                    error_code::RPDO_TIMEOUT,
                    timers.rx_timeout_us,
                );
            }
        }
        self.timers.store(timers);
    }

    fn commit(&self, data: &[u8; MAX_PDO_SIZE], count: u8) {
        od_lock(|| {
            let mut pos = 0;
            for slot in self.slots.iter().take(count as usize) {
                let slot = slot.load();
                let len = slot.len();
                if let MapSlot::Object {
                    object,
                    sub,
                    write_len,
                    ..
                } = slot
                {
                    let mut buf = [0; MAX_PDO_SIZE];
                    if let Some(src) = data.get(pos..pos + len) {
                        buf[..len].copy_from_slice(src);
                    }
                    // Objects may still reject the value, e.g. when it is out of range
                    object.write(sub, &buf[..write_len as usize]).ok();
                }
                pos += len;
            }
        });
    }

    /// Run one TPDO cycle
    ///
    /// `sync` holds the SYNC counter when a SYNC was received or produced in this cycle. Returns
    /// the frame to send, if any.
    pub(crate) fn process_tpdo(
        &self,
        elapsed_us: u32,
        operational: bool,
        sync: Option<u8>,
        emcy: &Emergency,
    ) -> Option<TpdoFrame> {
        let active = self.active.load();
        let comm = self.comm.load();
        let mut timers = self.timers.load();

        if !active.valid || !operational {
            self.send_request.store(true);
            self.rtr.store(false);
            self.sync_data.store(None);
            timers.inhibit_us = 0;
            timers.event_us = 0;
            timers.sync_counter = 255;
            self.timers.store(timers);
            return None;
        }

        let transmission_type = comm.transmission_type;
        if transmission_type == tt::SYNC_ACYCLIC || transmission_type >= tt::EVENT_MANUFACTURER {
            if comm.event_timer != 0 {
                timers.event_us = timers.event_us.saturating_sub(elapsed_us);
                if timers.event_us == 0 {
                    self.send_request.store(true);
                }
            }
            if !self.send_request.load() && self.event_flagged(active.count) {
                self.send_request.store(true);
            }
        }

        let mut frame = None;
        if transmission_type >= tt::EVENT_MANUFACTURER {
            timers.inhibit_us = timers.inhibit_us.saturating_sub(elapsed_us);
            if self.send_request.load() && timers.inhibit_us == 0 {
                frame = self.send(&active, &comm, &mut timers, emcy);
            }
        } else if transmission_type == tt::EVENT_RTR {
            if self.rtr.take() {
                frame = self.send(&active, &comm, &mut timers, emcy);
            }
        } else if transmission_type == tt::SYNC_RTR {
            if sync.is_some() {
                self.sync_data.store(self.read_mapped(&active, emcy));
            }
            if self.rtr.take() {
                if let Some(data) = self.sync_data.take() {
                    frame = Some(TpdoFrame {
                        msg: CanMessage::new(CanId::Std(active.can_id), &data[..active.data_len as usize]),
                        synchronous: false,
                    });
                }
            }
        } else if let Some(counter) = sync {
            if transmission_type == tt::SYNC_ACYCLIC {
                if self.send_request.load() {
                    frame = self.send(&active, &comm, &mut timers, emcy);
                }
            } else {
                if timers.sync_counter == 255 {
                    timers.sync_counter = if counter != 0 && comm.sync_start != 0 {
                        254
                    } else {
                        transmission_type
                    };
                }
                if timers.sync_counter == 254 {
                    if counter == comm.sync_start {
                        timers.sync_counter = transmission_type;
                        frame = self.send(&active, &comm, &mut timers, emcy);
                    }
                } else {
                    timers.sync_counter -= 1;
                    if timers.sync_counter == 0 {
                        timers.sync_counter = transmission_type;
                        frame = self.send(&active, &comm, &mut timers, emcy);
                    }
                }
            }
            if let Some(frame) = frame.as_mut() {
                frame.synchronous = true;
            }
        }

        self.timers.store(timers);
        frame
    }

    fn event_flagged(&self, count: u8) -> bool {
        self.slots.iter().take(count as usize).any(|slot| match slot.load() {
            MapSlot::Object { object, sub, .. } => object.read_event_flag(sub),
            _ => false,
        })
    }

    /// Clear the event flags of all mapped objects
    ///
    /// Called after all TPDOs have been processed in a cycle.
    pub(crate) fn clear_events(&self) {
        let active = self.active.load();
        if self.kind != PdoKind::Tpdo || !active.valid {
            return;
        }
        for slot in self.slots.iter().take(active.count as usize) {
            if let MapSlot::Object { object, .. } = slot.load() {
                object.clear_events();
            }
        }
    }

    fn send(
        &self,
        active: &Active,
        comm: &PdoComm,
        timers: &mut PdoTimers,
        emcy: &Emergency,
    ) -> Option<TpdoFrame> {
        let data = self.read_mapped(active, emcy)?;
        self.send_request.store(false);
        timers.event_us = comm.event_timer as u32 * 1000;
        timers.inhibit_us = comm.inhibit_time as u32 * 100;
        Some(TpdoFrame {
            msg: CanMessage::new(CanId::Std(active.can_id), &data[..active.data_len as usize]),
            synchronous: false,
        })
    }

    /// Read the mapped values into a frame payload
    ///
    /// A mapped object which can no longer be read disables the PDO.
    fn read_mapped(&self, active: &Active, emcy: &Emergency) -> Option<[u8; MAX_PDO_SIZE]> {
        let mut data = [0; MAX_PDO_SIZE];
        let result = od_lock(|| {
            let mut pos = 0;
            for (i, slot) in self.slots.iter().take(active.count as usize).enumerate() {
                let slot = slot.load();
                let len = slot.len();
                if let MapSlot::Object { object, sub, .. } = slot {
                    let mut buf = [0; MAX_PDO_SIZE];
                    let size = object.read_size(sub).unwrap_or(len).min(MAX_PDO_SIZE);
                    if object.read(sub, 0, &mut buf[..size]).is_err() {
                        return Err(i);
                    }
                    if let Some(dest) = data.get_mut(pos..pos + len) {
                        dest.copy_from_slice(&buf[..len]);
                    }
                }
                pos += len;
            }
            Ok(())
        });
        match result {
            Ok(()) => Some(data),
            Err(i) => {
                let param = self.mapping_params[i].load();
                warn!("TPDO 0x{:x} mapping 0x{:x} unreadable", active.can_id, param);
                let _ = self.active.fetch_update(|mut a| {
                    a.valid = false;
                    a.can_id = 0;
                    Some(a)
                });
                emcy.error_report(error_bit::PDO_WRONG_MAPPING, error_code::PROTOCOL, param);
                None
            }
        }
    }

    fn read_comm(&self, sub: u8) -> Result<([u8; 4], usize), AbortCode> {
        let comm = self.comm.load();
        let tpdo = self.kind == PdoKind::Tpdo;
        let mut bytes = [0; 4];
        let len = match sub {
            0 => {
                bytes[0] = if tpdo { 6 } else { 5 };
                1
            }
            1 => {
                let mut value = comm.cob_id;
                let can_id = (value & 0x7FF) as u16;
                let default = self.default_can_id.load();
                if can_id != 0 && default != 0 && can_id == default & 0xFF80 {
                    value |= (default & 0x7F) as u32;
                }
                if !self.active.load().valid {
                    value |= INVALID_BIT;
                }
                bytes = value.to_le_bytes();
                4
            }
            2 => {
                bytes[0] = comm.transmission_type;
                1
            }
            3 => {
                bytes[..2].copy_from_slice(&comm.inhibit_time.to_le_bytes());
                2
            }
            5 => {
                bytes[..2].copy_from_slice(&comm.event_timer.to_le_bytes());
                2
            }
            6 if tpdo => {
                bytes[0] = comm.sync_start;
                1
            }
            _ => return Err(AbortCode::NoSuchSubIndex),
        };
        Ok((bytes, len))
    }

    fn comm_sub_info(&self, sub: u8) -> Result<SubInfo, AbortCode> {
        match sub {
            0 => Ok(SubInfo::MAX_SUB_NUMBER),
            1 => Ok(SubInfo::new_u32().rw_access().persist(true)),
            2 => Ok(SubInfo::new_u8().rw_access().persist(true)),
            3 | 5 => Ok(SubInfo::new_u16().rw_access().persist(true)),
            6 if self.kind == PdoKind::Tpdo => Ok(SubInfo::new_u8().rw_access().persist(true)),
            _ => Err(AbortCode::NoSuchSubIndex),
        }
    }

    fn write_cob_id(&self, value: u32) -> Result<(), AbortCode> {
        let valid = value & INVALID_BIT == 0;
        let can_id = (value & 0x7FF) as u16;
        let active = self.active.load();
        if value & RESERVED_BITS != 0
            || (valid && active.valid && can_id != active.can_id)
            || (valid && is_restricted_can_id(can_id))
            || (valid && active.count == 0)
        {
            debug!("PDO COB-ID 0x{:x} rejected", value);
            return Err(AbortCode::InvalidValue);
        }

        let default = self.default_can_id.load();
        let stored = if default != 0 && can_id == default {
            value & 0xFFFF_FF80
        } else {
            value
        };
        let _ = self.comm.fetch_update(|mut c| {
            c.cob_id = stored;
            Some(c)
        });
        if !valid && active.valid {
            self.rx.store(None);
            self.rx_latched.store(None);
        }
        self.active.store(Active {
            valid,
            can_id: if valid { can_id } else { 0 },
            ..active
        });
        Ok(())
    }

    fn write_comm(&self, sub: u8, data: &[u8]) -> Result<(), AbortCode> {
        let tpdo = self.kind == PdoKind::Tpdo;
        let valid = self.active.load().valid;
        match sub {
            0 => Err(AbortCode::ReadOnly),
            1 => self.write_cob_id(u32::from_le_bytes(exact_bytes(data)?)),
            2 => {
                let [value] = exact_bytes::<1>(data)?;
                let reserved = if tpdo {
                    value > tt::SYNC_MAX && value < tt::SYNC_RTR
                } else {
                    value > tt::SYNC_MAX && value < tt::EVENT_MANUFACTURER
                };
                if reserved {
                    return Err(AbortCode::InvalidValue);
                }
                let was_synchronous = self.is_synchronous();
                let _ = self.comm.fetch_update(|mut c| {
                    c.transmission_type = value;
                    Some(c)
                });
                if tpdo {
                    self.send_request.store(true);
                    let _ = self.timers.fetch_update(|mut t| {
                        t.sync_counter = 255;
                        t.inhibit_us = 0;
                        t.event_us = 0;
                        Some(t)
                    });
                } else if was_synchronous != (value <= tt::SYNC_MAX) {
                    self.rx_latched.store(None);
                }
                Ok(())
            }
            3 => {
                let value = u16::from_le_bytes(exact_bytes(data)?);
                if tpdo && valid {
                    return Err(AbortCode::InvalidValue);
                }
                let _ = self.comm.fetch_update(|mut c| {
                    c.inhibit_time = value;
                    Some(c)
                });
                let _ = self.timers.fetch_update(|mut t| {
                    t.inhibit_us = 0;
                    Some(t)
                });
                Ok(())
            }
            5 => {
                let value = u16::from_le_bytes(exact_bytes(data)?);
                let _ = self.comm.fetch_update(|mut c| {
                    c.event_timer = value;
                    Some(c)
                });
                let _ = self.timers.fetch_update(|mut t| {
                    t.event_us = 0;
                    Some(t)
                });
                Ok(())
            }
            6 if tpdo => {
                let [value] = exact_bytes::<1>(data)?;
                if valid || value > tt::SYNC_MAX {
                    return Err(AbortCode::InvalidValue);
                }
                let _ = self.comm.fetch_update(|mut c| {
                    c.sync_start = value;
                    Some(c)
                });
                Ok(())
            }
            _ => Err(AbortCode::NoSuchSubIndex),
        }
    }

    fn restore_comm(&self, sub: u8, data: &[u8]) -> Result<(), AbortCode> {
        self.comm_sub_info(sub)?;
        let mut comm = self.comm.load();
        match sub {
            1 => comm.cob_id = u32::from_le_bytes(exact_bytes(data)?),
            2 => comm.transmission_type = exact_bytes::<1>(data)?[0],
            3 => comm.inhibit_time = u16::from_le_bytes(exact_bytes(data)?),
            5 => comm.event_timer = u16::from_le_bytes(exact_bytes(data)?),
            6 => comm.sync_start = exact_bytes::<1>(data)?[0],
            _ => return Err(AbortCode::ReadOnly),
        }
        self.comm.store(comm);
        Ok(())
    }

    fn write_mapping(&self, sub: u8, data: &[u8]) -> Result<(), AbortCode> {
        let active = self.active.load();
        if sub as usize > N_MAPPING_PARAMS {
            return Err(AbortCode::NoSuchSubIndex);
        }
        if active.valid || (sub > 0 && active.count != 0) {
            debug!("PDO mapping write to sub {} while in use", sub);
            return Err(AbortCode::InvalidValue);
        }

        if sub == 0 {
            let [count] = exact_bytes::<1>(data)?;
            if count as usize > N_MAPPING_PARAMS {
                return Err(AbortCode::InvalidValue);
            }
            let mut data_len = 0;
            for slot in self.slots.iter().take(count as usize) {
                let slot = slot.load();
                if matches!(slot, MapSlot::Invalid) {
                    return Err(AbortCode::UnnallowedPdo);
                }
                data_len += slot.len();
            }
            if data_len > MAX_PDO_SIZE {
                return Err(AbortCode::IncompatibleParameter);
            }
            if data_len == 0 && count > 0 {
                return Err(AbortCode::InvalidValue);
            }
            self.mapping_count.store(count);
            self.active.store(Active {
                count,
                data_len: data_len as u8,
                ..active
            });
        } else {
            let param = u32::from_le_bytes(exact_bytes(data)?);
            let od = self.od.load().ok_or(AbortCode::ResourceNotAvailable)?;
            let slot = resolve_mapping(od, param, self.kind).inspect_err(|_| {
                debug!("PDO mapping 0x{:x} rejected", param);
            })?;
            let i = sub as usize - 1;
            self.mapping_params[i].store(param);
            self.slots[i].store(slot);
        }
        Ok(())
    }

    fn restore_mapping(&self, sub: u8, data: &[u8]) -> Result<(), AbortCode> {
        match sub {
            0 => self.mapping_count.store(exact_bytes::<1>(data)?[0]),
            1..=8 => self.mapping_params[sub as usize - 1].store(u32::from_le_bytes(exact_bytes(data)?)),
            _ => return Err(AbortCode::NoSuchSubIndex),
        }
        Ok(())
    }
}

/// CAN IDs reserved for NMT, SYNC, EMCY, SDO, heartbeat and LSS
pub(crate) fn is_restricted_can_id(can_id: u16) -> bool {
    can_id <= 0x7F
        || (0x101..=0x180).contains(&can_id)
        || (0x581..=0x5FF).contains(&can_id)
        || (0x601..=0x67F).contains(&can_id)
        || (0x6E0..=0x6FF).contains(&can_id)
        || can_id >= 0x701
}

/// Resolve a mapping entry `{index:16, sub:8, bits:8}` into an object reference
fn resolve_mapping(
    od: &'static [ODEntry<'static>],
    param: u32,
    kind: PdoKind,
) -> Result<MapSlot, AbortCode> {
    let index = (param >> 16) as u16;
    let sub = (param >> 8) as u8;
    let bits = param as u8;
    let len = bits >> 3;

    if len as usize > MAX_PDO_SIZE {
        return Err(AbortCode::PdoTooLong);
    }
    if bits & 0x7 != 0 {
        return Err(AbortCode::UnnallowedPdo);
    }
    // Data type indices are used as dummy entries to skip bytes of an RPDO
    if index < 0x20 && sub == 0 {
        return Ok(MapSlot::Dummy { len });
    }

    let object = find_object(od, index).ok_or(AbortCode::NoSuchObject)?;
    let info = object.sub_info(sub)?;
    let mappable = match kind {
        PdoKind::Rpdo => info.pdo_mapping.supports_rpdo(),
        PdoKind::Tpdo => info.pdo_mapping.supports_tpdo(),
    };
    if !mappable || info.size < len as usize {
        return Err(AbortCode::UnnallowedPdo);
    }
    let write_len = if info.size <= MAX_PDO_SIZE {
        info.size as u8
    } else {
        len
    };
    Ok(MapSlot::Object {
        object,
        sub,
        len,
        write_len,
    })
}

/// The communication parameter object of a PDO (0x1400.. for RPDOs, 0x1800.. for TPDOs)
#[allow(missing_debug_implementations)]
pub struct PdoCommObject {
    pdo: &'static Pdo,
}

impl PdoCommObject {
    /// Create the object for `pdo`
    pub const fn new(pdo: &'static Pdo) -> Self {
        Self { pdo }
    }
}

impl ObjectAccess for PdoCommObject {
    fn read(&self, sub: u8, offset: usize, buf: &mut [u8]) -> Result<usize, AbortCode> {
        let (bytes, len) = self.pdo.read_comm(sub)?;
        Ok(read_slice(&bytes[..len], offset, buf))
    }

    fn read_size(&self, sub: u8) -> Result<usize, AbortCode> {
        Ok(self.pdo.read_comm(sub)?.1)
    }

    fn write(&self, sub: u8, data: &[u8]) -> Result<(), AbortCode> {
        self.pdo.write_comm(sub, data)
    }

    fn restore(&self, sub: u8, data: &[u8]) -> Result<(), AbortCode> {
        self.pdo.restore_comm(sub, data)
    }

    fn object_code(&self) -> ObjectCode {
        ObjectCode::Record
    }

    fn sub_info(&self, sub: u8) -> Result<SubInfo, AbortCode> {
        self.pdo.comm_sub_info(sub)
    }
}

/// The mapping parameter object of a PDO (0x1600.. for RPDOs, 0x1A00.. for TPDOs)
#[allow(missing_debug_implementations)]
pub struct PdoMappingObject {
    pdo: &'static Pdo,
}

impl PdoMappingObject {
    /// Create the object for `pdo`
    pub const fn new(pdo: &'static Pdo) -> Self {
        Self { pdo }
    }
}

impl ObjectAccess for PdoMappingObject {
    fn read(&self, sub: u8, offset: usize, buf: &mut [u8]) -> Result<usize, AbortCode> {
        match sub {
            0 => Ok(read_slice(&[self.pdo.mapping_count.load()], offset, buf)),
            1..=8 => {
                let value = self.pdo.mapping_params[sub as usize - 1].load();
                Ok(read_slice(&value.to_le_bytes(), offset, buf))
            }
            _ => Err(AbortCode::NoSuchSubIndex),
        }
    }

    fn read_size(&self, sub: u8) -> Result<usize, AbortCode> {
        Ok(self.sub_info(sub)?.size)
    }

    fn write(&self, sub: u8, data: &[u8]) -> Result<(), AbortCode> {
        self.pdo.write_mapping(sub, data)
    }

    fn restore(&self, sub: u8, data: &[u8]) -> Result<(), AbortCode> {
        self.pdo.restore_mapping(sub, data)
    }

    fn object_code(&self) -> ObjectCode {
        ObjectCode::Record
    }

    fn sub_info(&self, sub: u8) -> Result<SubInfo, AbortCode> {
        match sub {
            0 => Ok(SubInfo::new_u8().rw_access().persist(true)),
            1..=8 => Ok(SubInfo::new_u32().rw_access().persist(true)),
            _ => Err(AbortCode::NoSuchSubIndex),
        }
    }

    fn max_sub_number(&self) -> u8 {
        N_MAPPING_PARAMS as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_dict::{ArrayObject, ObjectFlagSync, ObjectFlags, ScalarField};
    use canode_common::objects::PdoMapping;

    fn leak<T>(value: T) -> &'static T {
        Box::leak(Box::new(value))
    }

    struct Fixture {
        od: &'static [ODEntry<'static>],
        rpdo: &'static Pdo,
        tpdo: &'static Pdo,
        bytes: &'static ArrayObject<ScalarField<u8>, 2>,
        word: &'static ArrayObject<ScalarField<u16>, 1>,
        flag_sync: &'static ObjectFlagSync,
        emcy: Emergency,
    }

    impl Fixture {
        fn new() -> Self {
            let rpdo = leak(Pdo::new_rpdo());
            let tpdo = leak(Pdo::new_tpdo());
            let flag_sync = leak(ObjectFlagSync::new());
            let bytes = leak(ArrayObject::new_with_flags(
                [ScalarField::<u8>::new(0x11), ScalarField::<u8>::new(0x22)],
                SubInfo::new_u8().rw_access().mapping(PdoMapping::Both),
                leak(ObjectFlags::<1>::new(flag_sync)),
            ));
            let word = leak(ArrayObject::new(
                [ScalarField::<u16>::new(0x4433)],
                SubInfo::new_u16().rw_access().mapping(PdoMapping::Both),
            ));
            let od: &'static [ODEntry<'static>] = leak([
                ODEntry {
                    index: 0x1400,
                    data: leak(PdoCommObject::new(rpdo)),
                },
                ODEntry {
                    index: 0x1600,
                    data: leak(PdoMappingObject::new(rpdo)),
                },
                ODEntry {
                    index: 0x1800,
                    data: leak(PdoCommObject::new(tpdo)),
                },
                ODEntry {
                    index: 0x1A00,
                    data: leak(PdoMappingObject::new(tpdo)),
                },
                ODEntry {
                    index: 0x6000,
                    data: bytes,
                },
                ODEntry {
                    index: 0x6001,
                    data: word,
                },
            ]);
            let emcy = Emergency::new();
            rpdo.init(od, 0x20A, &emcy);
            tpdo.init(od, 0x18A, &emcy);
            Self {
                od,
                rpdo,
                tpdo,
                bytes,
                word,
                flag_sync,
                emcy,
            }
        }

        fn object(&self, index: u16) -> &'static dyn ObjectAccess {
            find_object(self.od, index).unwrap()
        }

        /// Map 0x6000:1, 0x6000:2 and 0x6001:1, then enable with the given transmission type
        fn configure(&self, comm_index: u16, transmission_type: u8) {
            let comm = self.object(comm_index);
            let mapping = self.object(comm_index + 0x200);
            mapping.write(1, &0x6000_0108u32.to_le_bytes()).unwrap();
            mapping.write(2, &0x6000_0208u32.to_le_bytes()).unwrap();
            mapping.write(3, &0x6001_0110u32.to_le_bytes()).unwrap();
            mapping.write(0, &[3]).unwrap();
            comm.write(2, &[transmission_type]).unwrap();
            let cob_id = comm.read_u32(1).unwrap() & !INVALID_BIT;
            comm.write(1, &cob_id.to_le_bytes()).unwrap();
        }
    }

    #[test]
    fn test_event_timer_tpdo() {
        let f = Fixture::new();
        f.configure(0x1800, tt::EVENT_PROFILE);
        f.object(0x1800).write(5, &100u16.to_le_bytes()).unwrap();
        assert_eq!(Some(CanId::Std(0x18A)), f.tpdo.cob_id());

        // Sent once when entering operational
        let frame = f.tpdo.process_tpdo(1000, true, None, &f.emcy).unwrap();
        assert_eq!(CanId::Std(0x18A), frame.msg.id());
        assert_eq!(&[0x11, 0x22, 0x33, 0x44], frame.msg.data());
        assert!(!frame.synchronous);

        assert_eq!(None, f.tpdo.process_tpdo(50_000, true, None, &f.emcy));
        f.word.element(1).unwrap().store(1000);
        assert_eq!(None, f.tpdo.process_tpdo(49_000, true, None, &f.emcy));
        let frame = f.tpdo.process_tpdo(1000, true, None, &f.emcy).unwrap();
        assert_eq!(&[0x11, 0x22, 0xE8, 0x03], frame.msg.data());

        // Not sent while not operational
        assert_eq!(None, f.tpdo.process_tpdo(200_000, false, None, &f.emcy));
    }

    #[test]
    fn test_inhibit_time() {
        let f = Fixture::new();
        f.object(0x1800).write(3, &100u16.to_le_bytes()).unwrap();
        f.configure(0x1800, tt::EVENT_MANUFACTURER);
        assert_eq!(
            Err(AbortCode::InvalidValue),
            f.object(0x1800).write(3, &10u16.to_le_bytes())
        );

        assert!(f.tpdo.process_tpdo(0, true, None, &f.emcy).is_some());
        f.tpdo.request();
        assert_eq!(None, f.tpdo.process_tpdo(5_000, true, None, &f.emcy));
        assert_eq!(None, f.tpdo.process_tpdo(4_999, true, None, &f.emcy));
        assert!(f.tpdo.process_tpdo(1, true, None, &f.emcy).is_some());
        assert_eq!(None, f.tpdo.process_tpdo(20_000, true, None, &f.emcy));
    }

    #[test]
    fn test_event_flags_trigger() {
        let f = Fixture::new();
        f.configure(0x1800, tt::EVENT_PROFILE);
        assert!(f.tpdo.process_tpdo(0, true, None, &f.emcy).is_some());

        f.bytes.set_event_flag(2).unwrap();
        // The flag becomes visible after the bank is swapped
        assert_eq!(None, f.tpdo.process_tpdo(0, true, None, &f.emcy));
        f.flag_sync.toggle();
        assert!(f.tpdo.process_tpdo(0, true, None, &f.emcy).is_some());
        f.tpdo.clear_events();
        f.flag_sync.toggle();
        assert_eq!(None, f.tpdo.process_tpdo(0, true, None, &f.emcy));
    }

    #[test]
    fn test_sync_tpdo() {
        let f = Fixture::new();
        f.configure(0x1800, 3);
        assert_eq!(None, f.tpdo.process_tpdo(0, true, None, &f.emcy));
        let sent: Vec<bool> = (0..7)
            .map(|_| f.tpdo.process_tpdo(0, true, Some(0), &f.emcy).is_some())
            .collect();
        assert_eq!(vec![false, false, true, false, false, true, false], sent);
        assert_eq!(None, f.tpdo.process_tpdo(0, true, Some(0), &f.emcy));
        assert!(f.tpdo.process_tpdo(0, true, Some(0), &f.emcy).unwrap().synchronous);
    }

    #[test]
    fn test_sync_start_value() {
        let f = Fixture::new();
        f.object(0x1800).write(6, &[3]).unwrap();
        f.configure(0x1800, 2);
        assert_eq!(Err(AbortCode::InvalidValue), f.object(0x1800).write(6, &[4]));

        let sent: Vec<bool> = [1, 2, 3, 4, 5, 6]
            .into_iter()
            .map(|counter| f.tpdo.process_tpdo(0, true, Some(counter), &f.emcy).is_some())
            .collect();
        assert_eq!(vec![false, false, true, false, true, false], sent);
    }

    #[test]
    fn test_acyclic_sync_tpdo() {
        let f = Fixture::new();
        f.configure(0x1800, tt::SYNC_ACYCLIC);
        assert!(f.tpdo.process_tpdo(0, true, Some(0), &f.emcy).is_some());
        assert_eq!(None, f.tpdo.process_tpdo(0, true, Some(0), &f.emcy));
        f.tpdo.request();
        assert_eq!(None, f.tpdo.process_tpdo(0, true, None, &f.emcy));
        assert!(f.tpdo.process_tpdo(0, true, Some(0), &f.emcy).is_some());
    }

    #[test]
    fn test_rtr_tpdo() {
        let f = Fixture::new();
        f.configure(0x1800, tt::EVENT_RTR);
        assert_eq!(None, f.tpdo.process_tpdo(0, true, None, &f.emcy));
        assert!(f.tpdo.receive_rtr(&CanMessage::new_rtr(CanId::Std(0x18A), 4)));
        assert!(!f.tpdo.receive_rtr(&CanMessage::new_rtr(CanId::Std(0x18B), 4)));
        assert!(f.tpdo.process_tpdo(0, true, None, &f.emcy).is_some());
        assert_eq!(None, f.tpdo.process_tpdo(0, true, None, &f.emcy));
    }

    #[test]
    fn test_rtr_sync_tpdo_latches_data() {
        let f = Fixture::new();
        f.configure(0x1800, tt::SYNC_RTR);
        assert_eq!(None, f.tpdo.process_tpdo(0, true, Some(0), &f.emcy));
        f.bytes.element(1).unwrap().store(0x99);
        f.tpdo.receive_rtr(&CanMessage::new_rtr(CanId::Std(0x18A), 4));
        let frame = f.tpdo.process_tpdo(0, true, None, &f.emcy).unwrap();
        assert_eq!(&[0x11, 0x22, 0x33, 0x44], frame.msg.data());
    }

    #[test]
    fn test_mapping_rules() {
        let f = Fixture::new();
        let mapping = f.object(0x1A00);
        // 0x6000:1 is a u8, it cannot be mapped with 16 bits
        assert_eq!(
            Err(AbortCode::UnnallowedPdo),
            mapping.write(1, &0x6000_0110u32.to_le_bytes())
        );
        assert_eq!(
            Err(AbortCode::UnnallowedPdo),
            mapping.write(1, &0x6000_0104u32.to_le_bytes())
        );
        assert_eq!(
            Err(AbortCode::NoSuchObject),
            mapping.write(1, &0x7000_0108u32.to_le_bytes())
        );
        assert_eq!(
            Err(AbortCode::NoSuchSubIndex),
            mapping.write(1, &0x6000_0308u32.to_le_bytes())
        );
        // Mapping entry 2 is not set, and maps nothing
        mapping.write(1, &0x6001_0110u32.to_le_bytes()).unwrap();
        mapping.write(0, &[2]).unwrap();
        assert_eq!(Err(AbortCode::InvalidValue), mapping.write(0, &[9]));
        mapping.write(0, &[0]).unwrap();

        for sub in 1..=5 {
            mapping.write(sub, &0x6001_0110u32.to_le_bytes()).unwrap();
        }
        assert_eq!(Err(AbortCode::IncompatibleParameter), mapping.write(0, &[5]));
        mapping.write(0, &[4]).unwrap();
        // Entries are locked while the count is non-zero
        assert_eq!(
            Err(AbortCode::InvalidValue),
            mapping.write(1, &0x6000_0108u32.to_le_bytes())
        );

        // ...and everything is locked while the PDO is valid
        f.object(0x1800).write(1, &0x18Au32.to_le_bytes()).unwrap();
        assert_eq!(Err(AbortCode::InvalidValue), mapping.write(0, &[0]));
        assert_eq!(8, f.tpdo.data_len());
        assert_eq!(4, mapping.read_u8(0).unwrap());
        assert_eq!(0x6001_0110, mapping.read_u32(4).unwrap());
    }

    #[test]
    fn test_cob_id_rules() {
        let f = Fixture::new();
        let comm = f.object(0x1800);
        assert_eq!(6, comm.read_u8(0).unwrap());
        assert_eq!(5, f.object(0x1400).read_u8(0).unwrap());
        assert_eq!(0x8000_018A, comm.read_u32(1).unwrap());
        // No mapping yet
        assert_eq!(Err(AbortCode::InvalidValue), comm.write(1, &0x18Au32.to_le_bytes()));

        f.object(0x1A00).write(1, &0x6000_0108u32.to_le_bytes()).unwrap();
        f.object(0x1A00).write(0, &[1]).unwrap();
        assert_eq!(Err(AbortCode::InvalidValue), comm.write(1, &0x2000_018Au32.to_le_bytes()));
        assert_eq!(Err(AbortCode::InvalidValue), comm.write(1, &0x60Au32.to_le_bytes()));
        assert_eq!(Err(AbortCode::ReadOnly), comm.write(0, &[6]));
        assert_eq!(Err(AbortCode::NoSuchSubIndex), comm.write(4, &[0]));
        assert_eq!(Err(AbortCode::InvalidValue), comm.write(2, &[245]));

        comm.write(1, &0x18Au32.to_le_bytes()).unwrap();
        assert_eq!(0x18A, comm.read_u32(1).unwrap());
        // The ID cannot change while valid, but the RTR bit can
        assert_eq!(Err(AbortCode::InvalidValue), comm.write(1, &0x18Bu32.to_le_bytes()));
        comm.write(1, &0x4000_018Au32.to_le_bytes()).unwrap();
        assert_eq!(0x4000_018A, comm.read_u32(1).unwrap());

        // The pre-defined ID follows the node ID
        f.tpdo.init(f.od, 0x18B, &f.emcy);
        assert_eq!(Some(CanId::Std(0x18B)), f.tpdo.cob_id());
        assert_eq!(0x4000_018B, comm.read_u32(1).unwrap());

        // Other IDs are kept as written
        comm.write(1, &0x8000_0000u32.to_le_bytes()).unwrap();
        assert_eq!(None, f.tpdo.cob_id());
        comm.write(1, &0x1F0u32.to_le_bytes()).unwrap();
        f.tpdo.init(f.od, 0x18C, &f.emcy);
        assert_eq!(Some(CanId::Std(0x1F0)), f.tpdo.cob_id());
    }

    #[test]
    fn test_invalid_stored_mapping_reported() {
        let f = Fixture::new();
        let mapping = f.object(0x1A00);
        mapping.restore(1, &0x7000_0108u32.to_le_bytes()).unwrap();
        mapping.restore(0, &[1]).unwrap();
        f.object(0x1800).restore(1, &0x18Au32.to_le_bytes()).unwrap();
        f.tpdo.init(f.od, 0x18A, &f.emcy);
        assert!(!f.tpdo.is_valid());
        assert!(f.emcy.is_error(error_bit::PDO_WRONG_MAPPING));
    }

    #[test]
    fn test_rpdo_receive() {
        let f = Fixture::new();
        f.configure(0x1400, tt::EVENT_PROFILE);
        assert_eq!(Some(CanId::Std(0x20A)), f.rpdo.cob_id());

        assert!(!f.rpdo.receive(&CanMessage::new(CanId::Std(0x20B), &[1, 2, 3, 4])));
        assert!(f.rpdo.receive(&CanMessage::new(CanId::Std(0x20A), &[1, 2, 3, 4])));
        // Not committed outside of Pre-operational or Operational
        f.rpdo.process_rpdo(1000, false, &f.emcy);
        assert_eq!(0x11, f.bytes.read_u8(1).unwrap());

        f.rpdo.receive(&CanMessage::new(CanId::Std(0x20A), &[1, 2, 3, 4]));
        f.rpdo.process_rpdo(1000, true, &f.emcy);
        assert_eq!(1, f.bytes.read_u8(1).unwrap());
        assert_eq!(2, f.bytes.read_u8(2).unwrap());
        assert_eq!(0x0403, f.word.read_u16(1).unwrap());
    }

    #[test]
    fn test_rpdo_wrong_length() {
        let f = Fixture::new();
        f.configure(0x1400, tt::EVENT_PROFILE);

        f.rpdo.receive(&CanMessage::new(CanId::Std(0x20A), &[5, 6, 7]));
        f.rpdo.process_rpdo(1000, true, &f.emcy);
        assert!(f.emcy.is_error(error_bit::RPDO_WRONG_LENGTH));
        assert_eq!(0x11, f.bytes.read_u8(1).unwrap());

        f.rpdo.receive(&CanMessage::new(CanId::Std(0x20A), &[5, 6, 7, 8]));
        f.rpdo.process_rpdo(1000, true, &f.emcy);
        assert!(!f.emcy.is_error(error_bit::RPDO_WRONG_LENGTH));
        assert_eq!(5, f.bytes.read_u8(1).unwrap());

        // Longer frames are used, but reported
        f.rpdo.receive(&CanMessage::new(CanId::Std(0x20A), &[9, 9, 9, 9, 9]));
        f.rpdo.process_rpdo(1000, true, &f.emcy);
        assert!(f.emcy.is_error(error_bit::RPDO_WRONG_LENGTH));
        assert_eq!(9, f.bytes.read_u8(1).unwrap());
    }

    #[test]
    fn test_sync_rpdo_commits_on_sync() {
        let f = Fixture::new();
        f.configure(0x1400, 1);
        f.rpdo.receive(&CanMessage::new(CanId::Std(0x20A), &[1, 2, 3, 4]));
        f.rpdo.process_rpdo(1000, true, &f.emcy);
        assert_eq!(0x11, f.bytes.read_u8(1).unwrap());

        f.rpdo.sync_latch();
        // Received after the SYNC, held for the next one
        f.rpdo.receive(&CanMessage::new(CanId::Std(0x20A), &[7, 7, 7, 7]));
        f.rpdo.process_rpdo(1000, true, &f.emcy);
        assert_eq!(1, f.bytes.read_u8(1).unwrap());

        f.rpdo.sync_latch();
        f.rpdo.process_rpdo(1000, true, &f.emcy);
        assert_eq!(7, f.bytes.read_u8(1).unwrap());
    }

    #[test]
    fn test_rpdo_timeout() {
        let f = Fixture::new();
        f.object(0x1400).write(5, &10u16.to_le_bytes()).unwrap();
        f.configure(0x1400, tt::EVENT_PROFILE);

        // Monitoring starts with the first frame
        f.rpdo.process_rpdo(20_000, true, &f.emcy);
        assert!(!f.emcy.is_error(error_bit::RPDO_TIME_OUT));

        f.rpdo.receive(&CanMessage::new(CanId::Std(0x20A), &[1, 2, 3, 4]));
        f.rpdo.process_rpdo(1000, true, &f.emcy);
        f.rpdo.process_rpdo(9_000, true, &f.emcy);
        assert!(!f.emcy.is_error(error_bit::RPDO_TIME_OUT));
        f.rpdo.process_rpdo(2_000, true, &f.emcy);
        assert!(f.emcy.is_error(error_bit::RPDO_TIME_OUT));

        f.rpdo.receive(&CanMessage::new(CanId::Std(0x20A), &[1, 2, 3, 4]));
        f.rpdo.process_rpdo(1000, true, &f.emcy);
        assert!(!f.emcy.is_error(error_bit::RPDO_TIME_OUT));
    }

    #[test]
    fn test_rpdo_dummy_mapping() {
        let f = Fixture::new();
        let mapping = f.object(0x1600);
        mapping.write(1, &0x0005_0008u32.to_le_bytes()).unwrap();
        mapping.write(2, &0x6000_0208u32.to_le_bytes()).unwrap();
        mapping.write(0, &[2]).unwrap();
        f.object(0x1400).write(1, &0x20Au32.to_le_bytes()).unwrap();

        f.rpdo.receive(&CanMessage::new(CanId::Std(0x20A), &[0xAA, 0xBB]));
        f.rpdo.process_rpdo(0, true, &f.emcy);
        assert_eq!(0x11, f.bytes.read_u8(1).unwrap());
        assert_eq!(0xBB, f.bytes.read_u8(2).unwrap());
    }
}
