//! SDO server
//!
//! A node runs up to 128 independent server channels, described by the objects 0x1200 to 0x127F.
//! Channel 0 always answers the default COB-IDs `0x600 + node` (requests) and `0x580 + node`
//! (responses), and its parameters are read only. The COB-IDs of the other channels are written by
//! a client, and the channel runs while both of them are valid.
mod sdo_receiver;
mod sdo_server;

use core::cell::UnsafeCell;

use canode_common::{
    messages::{CanId, SDO_REQ_BASE, SDO_RESP_BASE},
    sdo::AbortCode,
    AtomicCell,
};
use defmt_or_log::debug;

use crate::{
    config::NodeConfig,
    object_dict::{exact_bytes, read_slice, ObjectAccess, ObjectExtension},
    pdo::is_restricted_can_id,
};

pub(crate) use sdo_receiver::SdoReceiver;
pub(crate) use sdo_server::SdoServer;

/// Size of the SDO transfer buffer. Enough for 127 segments of 7 bytes.
pub const SDO_BUFFER_SIZE: usize = 889;

/// Index of the parameter object of the first channel
const FIRST_CHANNEL_INDEX: u16 = 0x1200;
/// Maximum number of server channels
pub const MAX_SDO_SERVERS: usize = 128;

const INVALID_BIT: u32 = 1 << 31;
/// Bits 11 to 29. 29-bit identifiers are not supported.
const RESERVED_BITS: u32 = 0x3FFF_F800;

/// One SDO server channel: its COB-IDs, receive slot and transfer state
#[allow(missing_debug_implementations)]
pub struct SdoChannel {
    rx_cob_id: AtomicCell<u32>,
    tx_cob_id: AtomicCell<u32>,
    changed: AtomicCell<bool>,
    receiver: SdoReceiver,
    server: UnsafeCell<SdoServer>,
}

// The server is only touched by the node driving the channel, see `SdoChannel::server`
unsafe impl Sync for SdoChannel {}

impl SdoChannel {
    const fn new() -> Self {
        Self {
            rx_cob_id: AtomicCell::new(INVALID_BIT),
            tx_cob_id: AtomicCell::new(INVALID_BIT),
            changed: AtomicCell::new(false),
            receiver: SdoReceiver::new(),
            server: UnsafeCell::new(SdoServer::idle()),
        }
    }

    /// COB-ID of client requests, or None while the channel is not valid
    pub fn rx_cob_id(&self) -> Option<CanId> {
        valid_id(self.rx_cob_id.load())
    }

    /// COB-ID of server responses, or None while the channel is not valid
    pub fn tx_cob_id(&self) -> Option<CanId> {
        valid_id(self.tx_cob_id.load())
    }

    pub(crate) fn receiver(&self) -> &SdoReceiver {
        &self.receiver
    }

    /// The transfer state of the channel
    ///
    /// # Safety
    ///
    /// Must only be called by the [`Node`](crate::Node) driving the state this channel belongs to,
    /// and only one reference may exist at a time.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn server(&self) -> &mut SdoServer {
        &mut *self.server.get()
    }

    /// True once after a COB-ID of the channel was written
    pub(crate) fn take_changed(&self) -> bool {
        self.changed.take()
    }

    /// Point the channel at the default COB-IDs of `node_id`
    ///
    /// Node ID 0 leaves the channel invalid.
    pub(crate) fn set_default_ids(&self, node_id: u8) {
        let (rx, tx) = match node_id {
            0 => (INVALID_BIT, INVALID_BIT),
            id => ((SDO_REQ_BASE + id as u16) as u32, (SDO_RESP_BASE + id as u16) as u32),
        };
        self.rx_cob_id.store(rx);
        self.tx_cob_id.store(tx);
    }

    fn cob_id(&self, sub: u8) -> &AtomicCell<u32> {
        if sub == 1 {
            &self.rx_cob_id
        } else {
            &self.tx_cob_id
        }
    }

    fn write_cob_id(&self, sub: u8, value: u32) -> Result<(), AbortCode> {
        let current = self.cob_id(sub).load();
        let valid = value & INVALID_BIT == 0;
        let can_id = (value & 0x7FF) as u16;
        if value & RESERVED_BITS != 0
            || (valid && current & INVALID_BIT == 0 && (current & 0x7FF) as u16 != can_id)
            || (valid && is_restricted_can_id(can_id))
        {
            debug!("SDO COB-ID 0x{:x} rejected", value);
            return Err(AbortCode::InvalidValue);
        }
        self.cob_id(sub).store(value);
        self.changed.store(true);
        Ok(())
    }
}

fn valid_id(raw: u32) -> Option<CanId> {
    match raw & INVALID_BIT {
        0 => Some(CanId::std((raw & 0x7FF) as u16)),
        _ => None,
    }
}

/// The SDO server channels of a node, and the extension for their parameter objects
#[allow(missing_debug_implementations)]
pub struct SdoServers<const N: usize> {
    channels: [SdoChannel; N],
}

impl<const N: usize> Default for SdoServers<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> SdoServers<N> {
    /// Create `N` channels, all invalid until a node ID is assigned
    pub const fn new() -> Self {
        assert!(N >= 1 && N <= MAX_SDO_SERVERS, "1 to 128 SDO servers are supported");
        Self {
            channels: [const { SdoChannel::new() }; N],
        }
    }

    /// All channels
    pub fn channels(&self) -> &[SdoChannel] {
        &self.channels
    }

    fn channel(&self, index: u16) -> Option<(usize, &SdoChannel)> {
        let n = index.checked_sub(FIRST_CHANNEL_INDEX)? as usize;
        self.channels.get(n).map(|c| (n, c))
    }
}

/// Configure every channel's server from the node configuration
///
/// # Safety
///
/// As for [`SdoChannel::server`]
pub(crate) unsafe fn configure_channels(channels: &[SdoChannel], config: &NodeConfig) {
    for channel in channels {
        channel.server().configure(config);
    }
}

impl<const N: usize> ObjectExtension for SdoServers<N> {
    fn read(
        &self,
        index: u16,
        object: &dyn ObjectAccess,
        sub: u8,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<usize, AbortCode> {
        match (self.channel(index), sub) {
            (Some((_, channel)), 1 | 2) => {
                let bytes = channel.cob_id(sub).load().to_le_bytes();
                Ok(read_slice(&bytes, offset, buf))
            }
            _ => object.read(sub, offset, buf),
        }
    }

    fn read_size(&self, index: u16, object: &dyn ObjectAccess, sub: u8) -> Result<usize, AbortCode> {
        match (self.channel(index), sub) {
            (Some(_), 1 | 2) => Ok(4),
            _ => object.read_size(sub),
        }
    }

    fn write(
        &self,
        index: u16,
        object: &dyn ObjectAccess,
        sub: u8,
        data: &[u8],
    ) -> Result<(), AbortCode> {
        match (self.channel(index), sub) {
            (Some((0, _)), 1 | 2) => Err(AbortCode::ReadOnly),
            (Some((_, channel)), 1 | 2) => {
                channel.write_cob_id(sub, u32::from_le_bytes(exact_bytes(data)?))
            }
            _ => object.write(sub, data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_dict::{ArrayObject, ExtendableObject, ScalarField};
    use canode_common::objects::SubInfo;

    fn param_object(
        index: u16,
        servers: &'static SdoServers<2>,
    ) -> &'static ExtendableObject<ArrayObject<ScalarField<u32>, 3>> {
        let obj = Box::leak(Box::new(ExtendableObject::new(ArrayObject::new(
            [ScalarField::<u32>::new(0), ScalarField::<u32>::new(0), ScalarField::<u32>::new(0)],
            SubInfo::new_u32().rw_access(),
        ))));
        obj.set_extension(index, Some(servers)).unwrap();
        obj
    }

    #[test]
    fn test_default_channel() {
        let servers: &'static SdoServers<2> = Box::leak(Box::new(SdoServers::new()));
        let obj = param_object(0x1200, servers);

        assert_eq!(0x8000_0000, obj.read_u32(1).unwrap());
        assert_eq!(None, servers.channels()[0].rx_cob_id());
        servers.channels()[0].set_default_ids(10);
        assert_eq!(0x60A, obj.read_u32(1).unwrap());
        assert_eq!(0x58A, obj.read_u32(2).unwrap());
        assert_eq!(Some(CanId::std(0x58A)), servers.channels()[0].tx_cob_id());
        assert_eq!(4, obj.read_size(2).unwrap());
        assert_eq!(Err(AbortCode::ReadOnly), obj.write(1, &[0; 4]));
        assert_eq!(3, obj.read_u8(0).unwrap());
    }

    #[test]
    fn test_additional_channel_cob_ids() {
        let servers: &'static SdoServers<2> = Box::leak(Box::new(SdoServers::new()));
        let obj = param_object(0x1201, servers);
        let channel = &servers.channels()[1];
        servers.channels()[0].set_default_ids(10);

        assert_eq!(None, channel.rx_cob_id());
        assert!(!channel.take_changed());

        obj.write(1, &0x6C0u32.to_le_bytes()).unwrap();
        assert_eq!(Some(CanId::std(0x6C0)), channel.rx_cob_id());
        assert!(channel.take_changed());
        assert!(!channel.take_changed());

        // A valid ID can only be changed by invalidating it first
        assert_eq!(Err(AbortCode::InvalidValue), obj.write(1, &0x6C1u32.to_le_bytes()));
        obj.write(1, &0x6C0u32.to_le_bytes()).unwrap();
        obj.write(1, &0x8000_06C0u32.to_le_bytes()).unwrap();
        assert_eq!(None, channel.rx_cob_id());
        obj.write(1, &0x6C1u32.to_le_bytes()).unwrap();
        assert_eq!(0x6C1, obj.read_u32(1).unwrap());

        // Reserved bits, restricted IDs and short writes
        assert_eq!(Err(AbortCode::InvalidValue), obj.write(2, &0x2000_06D0u32.to_le_bytes()));
        assert_eq!(Err(AbortCode::InvalidValue), obj.write(2, &0x58Bu32.to_le_bytes()));
        assert!(obj.write(2, &[0xD0, 0x06]).is_err());
        assert_eq!(None, channel.tx_cob_id());
        obj.write(2, &0x6D0u32.to_le_bytes()).unwrap();
        assert_eq!(Some(CanId::std(0x6D0)), channel.tx_cob_id());

        // The client node ID is kept by the object
        obj.write(3, &5u32.to_le_bytes()).unwrap();
        assert_eq!(5, obj.read_u32(3).unwrap());

        // Unknown indices fall through to the object
        let other = param_object(0x1202, servers);
        other.write(1, &0x123u32.to_le_bytes()).unwrap();
        assert_eq!(0x123, other.read_u32(1).unwrap());
    }
}
