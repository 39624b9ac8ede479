//! CAN frame type and codecs for the CANopen broadcast services
use snafu::Snafu;

use crate::sdo::{SdoRequest, SdoResponse};

/// A CAN identifier
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CanId {
    /// A 29-bit extended ID
    Extended(u32),
    /// An 11-bit standard ID
    Std(u16),
}

impl CanId {
    /// Create an extended ID
    pub const fn extended(id: u32) -> CanId {
        CanId::Extended(id)
    }

    /// Create a standard ID
    pub const fn std(id: u16) -> CanId {
        CanId::Std(id)
    }

    /// Get the raw ID value
    pub fn raw(&self) -> u32 {
        match self {
            CanId::Extended(id) => *id,
            CanId::Std(id) => *id as u32,
        }
    }

    /// True if this is a 29-bit ID
    pub fn is_extended(&self) -> bool {
        match self {
            CanId::Extended(_) => true,
            CanId::Std(_) => false,
        }
    }
}

const MAX_DATA_LENGTH: usize = 8;

/// A classic CAN frame
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CanMessage {
    /// Payload bytes. Only the first `dlc` bytes are valid.
    pub data: [u8; MAX_DATA_LENGTH],
    /// Data length code
    pub dlc: u8,
    /// Remote transmission request flag
    pub rtr: bool,
    /// The frame identifier
    pub id: CanId,
}

impl Default for CanMessage {
    fn default() -> Self {
        Self {
            data: [0; MAX_DATA_LENGTH],
            dlc: 0,
            rtr: false,
            id: CanId::Std(0),
        }
    }
}

impl CanMessage {
    /// Create a data frame
    ///
    /// Data beyond 8 bytes is ignored.
    pub fn new(id: CanId, data: &[u8]) -> Self {
        let dlc = data.len().min(MAX_DATA_LENGTH);
        let mut buf = [0u8; MAX_DATA_LENGTH];
        buf[0..dlc].copy_from_slice(&data[0..dlc]);

        Self {
            id,
            dlc: dlc as u8,
            rtr: false,
            data: buf,
        }
    }

    /// Create a remote request frame with the given DLC
    pub fn new_rtr(id: CanId, dlc: u8) -> Self {
        Self {
            id,
            dlc: dlc.min(MAX_DATA_LENGTH as u8),
            rtr: true,
            data: [0; MAX_DATA_LENGTH],
        }
    }

    /// Get the frame identifier
    pub fn id(&self) -> CanId {
        self.id
    }

    /// Get the valid payload bytes
    pub fn data(&self) -> &[u8] {
        &self.data[0..(self.dlc as usize).min(MAX_DATA_LENGTH)]
    }

    /// True if this is a remote request frame
    pub fn is_rtr(&self) -> bool {
        self.rtr
    }
}

/// The NMT command specifier byte
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum NmtCommandSpecifier {
    /// Enter operational
    Start = 1,
    /// Enter stopped
    Stop = 2,
    /// Enter pre-operational
    EnterPreOp = 128,
    /// Reset the application (and communication)
    ResetApp = 129,
    /// Reset communication
    ResetComm = 130,
}

impl NmtCommandSpecifier {
    /// Parse a command specifier byte
    pub fn from_byte(b: u8) -> Result<Self, MessageError> {
        match b {
            1 => Ok(Self::Start),
            2 => Ok(Self::Stop),
            128 => Ok(Self::EnterPreOp),
            129 => Ok(Self::ResetApp),
            130 => Ok(Self::ResetComm),
            _ => Err(MessageError::InvalidField),
        }
    }
}

/// COB-ID of NMT commands
pub const NMT_CMD_ID: CanId = CanId::Std(0);
/// Default COB-ID of the SYNC message
pub const SYNC_ID: CanId = CanId::Std(0x80);
/// Base of emergency message IDs (node ID is added)
pub const EMCY_BASE: u16 = 0x80;
/// Base of heartbeat message IDs (node ID is added)
pub const HEARTBEAT_ID: u16 = 0x700;
/// The default base ID for sending SDO requests (server node ID is added)
pub const SDO_REQ_BASE: u16 = 0x600;
/// The default base ID for sending SDO responses (server node ID is added)
pub const SDO_RESP_BASE: u16 = 0x580;
/// Default base IDs of TPDO1..4 (node ID is added)
pub const TPDO_BASES: [u16; 4] = [0x180, 0x280, 0x380, 0x480];
/// Default base IDs of RPDO1..4 (node ID is added)
pub const RPDO_BASES: [u16; 4] = [0x200, 0x300, 0x400, 0x500];

/// An NMT command message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NmtCommand {
    /// The command
    pub cmd: NmtCommandSpecifier,
    /// The addressed node, or 0 for all nodes
    pub node: u8,
}

impl TryFrom<CanMessage> for NmtCommand {
    type Error = MessageError;

    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        let payload = msg.data();
        if msg.id() != NMT_CMD_ID {
            Err(MessageError::UnexpectedId {
                cob_id: msg.id(),
                expected: NMT_CMD_ID,
            })
        } else if payload.len() == 2 {
            let cmd = NmtCommandSpecifier::from_byte(payload[0])?;
            let node = payload[1];
            Ok(NmtCommand { cmd, node })
        } else {
            Err(MessageError::WrongLength {
                cob_id: msg.id(),
                len: payload.len() as u8,
            })
        }
    }
}

impl From<NmtCommand> for CanMessage {
    fn from(cmd: NmtCommand) -> Self {
        CanMessage::new(NMT_CMD_ID, &[cmd.cmd as u8, cmd.node])
    }
}

/// The NMT state of a node, as it is encoded in heartbeat messages
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum NmtState {
    /// The node is initializing, or is announcing its boot
    Bootup = 0,
    /// Only NMT and heartbeat services run
    Stopped = 4,
    /// All services run
    Operational = 5,
    /// All services except TPDOs run
    PreOperational = 127,
}

/// Error for a byte which does not encode a valid NMT state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidNmtStateError(pub u8);

impl TryFrom<u8> for NmtState {
    type Error = InvalidNmtStateError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use NmtState::*;
        match value {
            x if x == Bootup as u8 => Ok(Bootup),
            x if x == Stopped as u8 => Ok(Stopped),
            x if x == Operational as u8 => Ok(Operational),
            x if x == PreOperational as u8 => Ok(PreOperational),
            _ => Err(InvalidNmtStateError(value)),
        }
    }
}

/// A heartbeat message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Heartbeat {
    /// The transmitting node
    pub node: u8,
    /// Toggle bit, only used for node guarding responses
    pub toggle: bool,
    /// The reported state
    pub state: NmtState,
}

impl From<Heartbeat> for CanMessage {
    fn from(value: Heartbeat) -> Self {
        let mut state = value.state as u8;
        if value.toggle {
            state |= 1 << 7;
        }
        CanMessage::new(CanId::Std(HEARTBEAT_ID | value.node as u16), &[state])
    }
}

impl TryFrom<CanMessage> for Heartbeat {
    type Error = MessageError;

    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        let cob_id = msg.id();
        if cob_id.raw() & !0x7f != HEARTBEAT_ID as u32 {
            return Err(MessageError::UnrecognizedId { cob_id });
        }
        if msg.data().len() != 1 {
            return Err(MessageError::WrongLength {
                cob_id,
                len: msg.dlc,
            });
        }
        let node = (cob_id.raw() & 0x7f) as u8;
        let toggle = (msg.data[0] & (1 << 7)) != 0;
        let state: NmtState = (msg.data[0] & 0x7f)
            .try_into()
            .map_err(|e: InvalidNmtStateError| MessageError::InvalidNmtState { value: e.0 })?;
        Ok(Heartbeat {
            node,
            toggle,
            state,
        })
    }
}

/// Represents a SYNC object/message
///
/// A single CAN node can serve as the SYNC provider, sending a periodic sync object to all other
/// nodes. When the counter is enabled, the one byte count value starts at 1, and increments. On
/// overflow, it is reset to 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SyncObject {
    /// The counter value, if the counter is in use
    pub count: Option<u8>,
}

impl SyncObject {
    /// Create a SYNC object with a counter
    pub fn new(count: u8) -> Self {
        Self { count: Some(count) }
    }

    /// Build the CAN message with the given COB-ID
    pub fn to_can_message(self, id: CanId) -> CanMessage {
        match self.count {
            Some(count) => CanMessage::new(id, &[count]),
            None => CanMessage::new(id, &[]),
        }
    }
}

impl From<SyncObject> for CanMessage {
    fn from(value: SyncObject) -> Self {
        value.to_can_message(SYNC_ID)
    }
}

impl TryFrom<CanMessage> for SyncObject {
    type Error = MessageError;

    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        match msg.data().len() {
            0 => Ok(Self { count: None }),
            1 => Ok(Self {
                count: Some(msg.data[0]),
            }),
            len => Err(MessageError::WrongLength {
                cob_id: msg.id(),
                len: len as u8,
            }),
        }
    }
}

/// An emergency message
///
/// Layout: `{error code: u16, error register: u8, error bit: u8, manufacturer info: u32}`. The
/// error bit and info together make up the 5 byte manufacturer specific field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EmcyMessage {
    /// The node which produced the message
    pub node: u8,
    /// Error code. 0 means "error reset / no error".
    pub code: u16,
    /// Value of the producer's error register
    pub register: u8,
    /// Error status bit of the condition being reported
    pub error_bit: u8,
    /// Additional information
    pub info: u32,
}

impl EmcyMessage {
    /// Build the CAN message with the given COB-ID
    pub fn to_can_message(self, id: CanId) -> CanMessage {
        let mut data = [0u8; 8];
        data[0..2].copy_from_slice(&self.code.to_le_bytes());
        data[2] = self.register;
        data[3] = self.error_bit;
        data[4..8].copy_from_slice(&self.info.to_le_bytes());
        CanMessage::new(id, &data)
    }
}

impl From<EmcyMessage> for CanMessage {
    fn from(value: EmcyMessage) -> Self {
        value.to_can_message(CanId::Std(EMCY_BASE + value.node as u16))
    }
}

impl TryFrom<CanMessage> for EmcyMessage {
    type Error = MessageError;

    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        let cob_id = msg.id();
        let node = (cob_id.raw() & 0x7f) as u8;
        if cob_id.raw() & !0x7f != EMCY_BASE as u32 || node == 0 {
            return Err(MessageError::UnrecognizedId { cob_id });
        }
        if msg.data().len() != 8 {
            return Err(MessageError::WrongLength {
                cob_id,
                len: msg.dlc,
            });
        }
        Ok(EmcyMessage {
            node,
            code: u16::from_le_bytes([msg.data[0], msg.data[1]]),
            register: msg.data[2],
            error_bit: msg.data[3],
            info: u32::from_le_bytes([msg.data[4], msg.data[5], msg.data[6], msg.data[7]]),
        })
    }
}

/// Test if a CAN ID is an SDO request to the given node
pub fn is_std_sdo_request(can_id: CanId, node_id: u8) -> bool {
    if let CanId::Std(id) = can_id {
        let base = id & 0xff80;
        let msg_id = id & 0x7f;
        if base == SDO_REQ_BASE && msg_id == node_id as u16 {
            return true;
        }
    }
    false
}

/// Status flags reported by a CAN controller
///
/// The driver publishes these to the node, which converts changes into emergency reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CanErrorStatus(pub u16);

impl CanErrorStatus {
    /// Transmit error counter above the warning limit
    pub const TX_WARNING: u16 = 1 << 0;
    /// Transmitter is error passive
    pub const TX_PASSIVE: u16 = 1 << 1;
    /// Controller is bus off
    pub const TX_BUS_OFF: u16 = 1 << 2;
    /// Transmit queue overflowed
    pub const TX_OVERFLOW: u16 = 1 << 3;
    /// Receive error counter above the warning limit
    pub const RX_WARNING: u16 = 1 << 8;
    /// Receiver is error passive
    pub const RX_PASSIVE: u16 = 1 << 9;
    /// Receive buffer overflowed
    pub const RX_OVERFLOW: u16 = 1 << 11;

    /// True if any bit in `mask` is set
    pub fn contains(&self, mask: u16) -> bool {
        self.0 & mask != 0
    }

    /// True if either direction is above the warning limit
    pub fn is_warning(&self) -> bool {
        self.contains(Self::TX_WARNING | Self::RX_WARNING)
    }

    /// True if the controller is bus off
    pub fn is_bus_off(&self) -> bool {
        self.contains(Self::TX_BUS_OFF)
    }
}

/// Any of the frames used by the services in this crate
#[derive(Debug, Clone, Copy)]
pub enum CanopenMessage {
    /// An NMT command
    NmtCommand(NmtCommand),
    /// A SYNC object
    Sync(SyncObject),
    /// An emergency message
    Emcy(EmcyMessage),
    /// A heartbeat
    Heartbeat(Heartbeat),
    /// A request sent to an SDO server
    SdoRequest(SdoRequest),
    /// A response sent by an SDO server
    SdoResponse(SdoResponse),
}

impl TryFrom<CanMessage> for CanopenMessage {
    type Error = MessageError;

    /// Interpret a frame using the pre-defined connection set
    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        let cob_id = msg.id();
        let raw = cob_id.raw();
        if cob_id.is_extended() {
            Err(MessageError::UnrecognizedId { cob_id })
        } else if cob_id == NMT_CMD_ID {
            Ok(CanopenMessage::NmtCommand(msg.try_into()?))
        } else if cob_id == SYNC_ID {
            Ok(CanopenMessage::Sync(msg.try_into()?))
        } else if raw & !0x7f == EMCY_BASE as u32 {
            Ok(CanopenMessage::Emcy(msg.try_into()?))
        } else if raw & !0x7f == HEARTBEAT_ID as u32 {
            Ok(CanopenMessage::Heartbeat(msg.try_into()?))
        } else if raw & !0x7f == SDO_RESP_BASE as u32 {
            let resp = SdoResponse::try_from(msg.data())
                .map_err(|_| MessageError::MalformedMsg { cob_id })?;
            Ok(CanopenMessage::SdoResponse(resp))
        } else if raw & !0x7f == SDO_REQ_BASE as u32 {
            let req = SdoRequest::try_from(msg.data())
                .map_err(|_| MessageError::MalformedMsg { cob_id })?;
            Ok(CanopenMessage::SdoRequest(req))
        } else {
            Err(MessageError::UnrecognizedId { cob_id })
        }
    }
}

/// Errors which can occur while interpreting a frame
#[derive(Debug, Clone, Copy, PartialEq, Snafu)]
pub enum MessageError {
    /// The frame carries fewer bytes than the message requires
    MessageTooShort,
    /// The frame does not have the length required by its message type
    #[snafu(display("Message {cob_id:?} has invalid length {len}"))]
    WrongLength {
        /// The frame ID
        cob_id: CanId,
        /// The received DLC
        len: u8,
    },
    /// The payload could not be interpreted
    #[snafu(display("Malformed message with ID {cob_id:?}"))]
    MalformedMsg {
        /// The frame ID
        cob_id: CanId,
    },
    /// The message ID was not the expected value
    #[snafu(display("Unexpected message ID found: {cob_id:?}, expected: {expected:?}"))]
    UnexpectedId {
        /// The frame ID
        cob_id: CanId,
        /// The ID which was expected
        expected: CanId,
    },
    /// A field contains a value which is not allowed
    InvalidField,
    /// The ID does not belong to any known message
    #[snafu(display("Unrecognized message ID {cob_id:?}"))]
    UnrecognizedId {
        /// The frame ID
        cob_id: CanId,
    },
    /// The NMT state integer in the message is not a valid NMT state
    #[snafu(display("Invalid NMT state {value}"))]
    InvalidNmtState {
        /// The received state byte
        value: u8,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nmt_command_length() {
        let msg = CanMessage::new(NMT_CMD_ID, &[0x01, 0x00]);
        let cmd: NmtCommand = msg.try_into().unwrap();
        assert_eq!(NmtCommandSpecifier::Start, cmd.cmd);
        assert_eq!(0, cmd.node);

        let msg = CanMessage::new(NMT_CMD_ID, &[0x01, 0x00, 0x00]);
        assert!(NmtCommand::try_from(msg).is_err());
        let msg = CanMessage::new(NMT_CMD_ID, &[0x03, 0x00]);
        assert_eq!(Err(MessageError::InvalidField), NmtCommand::try_from(msg));
    }

    #[test]
    fn test_heartbeat_encoding() {
        let msg: CanMessage = Heartbeat {
            node: 10,
            toggle: false,
            state: NmtState::PreOperational,
        }
        .into();
        assert_eq!(CanId::Std(0x70A), msg.id());
        assert_eq!(&[0x7F], msg.data());
    }

    #[test]
    fn test_emcy_layout() {
        let emcy = EmcyMessage {
            node: 5,
            code: 0x8110,
            register: 0x11,
            error_bit: 0x14,
            info: 0xAABBCCDD,
        };
        let msg: CanMessage = emcy.into();
        assert_eq!(CanId::Std(0x85), msg.id());
        assert_eq!(&[0x10, 0x81, 0x11, 0x14, 0xDD, 0xCC, 0xBB, 0xAA], msg.data());
        assert_eq!(emcy, EmcyMessage::try_from(msg).unwrap());
    }

    #[test]
    fn test_sync_counter() {
        let msg = CanMessage::new(SYNC_ID, &[]);
        assert_eq!(None, SyncObject::try_from(msg).unwrap().count);
        let msg = CanMessage::new(SYNC_ID, &[7]);
        assert_eq!(Some(7), SyncObject::try_from(msg).unwrap().count);
        let msg = CanMessage::new(SYNC_ID, &[7, 0]);
        assert!(SyncObject::try_from(msg).is_err());
    }

    #[test]
    fn test_message_truncates() {
        let msg = CanMessage::new(CanId::Std(1), &[0; 10]);
        assert_eq!(8, msg.dlc);
    }
}
