//! Static state shared between the object dictionary, the mailbox and the node
use crate::{
    emcy::Emergency,
    hb_consumer::{HbConsumerEntry, HeartbeatConsumer},
    nmt::HeartbeatProducer,
    object_dict::{ObjectExtension, ObjectFlagSync},
    pdo::Pdo,
    sdo_server::{SdoChannel, SdoServers},
    storage::Storage,
    sync::SyncState,
};

/// Access to the communication state of a node
///
/// Implemented by [`NodeState`]. The node and the mailbox only see the state through this trait, so
/// that they do not carry its size parameters.
pub trait NodeStateAccess: Sync + Send {
    /// The receive PDOs
    fn rpdos(&self) -> &[Pdo];
    /// The transmit PDOs
    fn tpdos(&self) -> &[Pdo];
    /// The heartbeat consumer entries
    fn hb_consumer_entries(&self) -> &[HbConsumerEntry];
    /// The extension handling writes to the heartbeat consumer object (0x1016)
    fn hb_consumer(&self) -> &dyn ObjectExtension;
    /// The bank switch for TPDO event flags
    fn pdo_sync(&self) -> &ObjectFlagSync;
    /// SYNC producer and consumer
    fn sync(&self) -> &SyncState;
    /// Heartbeat producer time
    fn heartbeat_producer(&self) -> &HeartbeatProducer;
    /// Emergency producer and error state
    fn emcy(&self) -> &Emergency;
    /// The SDO server channels
    fn sdo_channels(&self) -> &[SdoChannel];
    /// The extension handling the SDO server parameter objects (0x1200 to 0x127F)
    fn sdo_servers(&self) -> &dyn ObjectExtension;
    /// Non-volatile storage
    fn storage(&self) -> &Storage;
}

/// Communication state of a node
///
/// Intended to be instantiated as a static, so that objects in the object dictionary can refer to
/// its parts with the const accessors.
///
/// The last parameter is the number of SDO server channels, one by default.
///
/// ```ignore
/// static NODE_STATE: NodeState<4, 4, 2> = NodeState::new();
/// static OBJECT1800: PdoCommObject = PdoCommObject::new(NODE_STATE.tpdo(0));
/// ```
#[allow(missing_debug_implementations)]
pub struct NodeState<
    const N_RPDO: usize,
    const N_TPDO: usize,
    const N_HB: usize,
    const N_SDO: usize = 1,
> {
    rpdos: [Pdo; N_RPDO],
    tpdos: [Pdo; N_TPDO],
    hb_consumer: HeartbeatConsumer<N_HB>,
    pdo_sync: ObjectFlagSync,
    sync: SyncState,
    heartbeat_producer: HeartbeatProducer,
    emcy: Emergency,
    sdo_servers: SdoServers<N_SDO>,
    storage: Storage,
}

impl<const N_RPDO: usize, const N_TPDO: usize, const N_HB: usize, const N_SDO: usize> Default
    for NodeState<N_RPDO, N_TPDO, N_HB, N_SDO>
{
    fn default() -> Self {
        Self::new()
    }
}

impl<const N_RPDO: usize, const N_TPDO: usize, const N_HB: usize, const N_SDO: usize>
    NodeState<N_RPDO, N_TPDO, N_HB, N_SDO>
{
    /// Create the state with all PDOs disabled
    pub const fn new() -> Self {
        let rpdos = [const { Pdo::new_rpdo() }; N_RPDO];
        let tpdos = [const { Pdo::new_tpdo() }; N_TPDO];
        Self {
            rpdos,
            tpdos,
            hb_consumer: HeartbeatConsumer::new(),
            pdo_sync: ObjectFlagSync::new(),
            sync: SyncState::new(),
            heartbeat_producer: HeartbeatProducer::new(),
            emcy: Emergency::new(),
            sdo_servers: SdoServers::new(),
            storage: Storage::new(),
        }
    }

    /// All receive PDOs
    pub const fn rpdos(&'static self) -> &'static [Pdo] {
        &self.rpdos
    }

    /// All transmit PDOs
    pub const fn tpdos(&'static self) -> &'static [Pdo] {
        &self.tpdos
    }

    /// Receive PDO `n`, counting from 0
    pub const fn rpdo(&'static self, n: usize) -> &'static Pdo {
        &self.rpdos[n]
    }

    /// Transmit PDO `n`, counting from 0
    pub const fn tpdo(&'static self, n: usize) -> &'static Pdo {
        &self.tpdos[n]
    }

    /// The bank switch which object flags must be created with
    pub const fn pdo_sync(&'static self) -> &'static ObjectFlagSync {
        &self.pdo_sync
    }

    /// The emergency state, for the 0x1001 / 0x1003 / 0x1014 / 0x1015 objects
    pub const fn emcy(&'static self) -> &'static Emergency {
        &self.emcy
    }

    /// The storage, for registering entries and loading stored values
    pub const fn storage(&'static self) -> &'static Storage {
        &self.storage
    }

    /// The heartbeat consumer entries
    pub const fn hb_consumer(&'static self) -> &'static HeartbeatConsumer<N_HB> {
        &self.hb_consumer
    }
}

impl<const N_RPDO: usize, const N_TPDO: usize, const N_HB: usize, const N_SDO: usize>
    NodeStateAccess for NodeState<N_RPDO, N_TPDO, N_HB, N_SDO>
{
    fn rpdos(&self) -> &[Pdo] {
        &self.rpdos
    }

    fn tpdos(&self) -> &[Pdo] {
        &self.tpdos
    }

    fn hb_consumer_entries(&self) -> &[HbConsumerEntry] {
        self.hb_consumer.entries()
    }

    fn hb_consumer(&self) -> &dyn ObjectExtension {
        &self.hb_consumer
    }

    fn pdo_sync(&self) -> &ObjectFlagSync {
        &self.pdo_sync
    }

    fn sync(&self) -> &SyncState {
        &self.sync
    }

    fn heartbeat_producer(&self) -> &HeartbeatProducer {
        &self.heartbeat_producer
    }

    fn emcy(&self) -> &Emergency {
        &self.emcy
    }

    fn sdo_channels(&self) -> &[SdoChannel] {
        self.sdo_servers.channels()
    }

    fn sdo_servers(&self) -> &dyn ObjectExtension {
        &self.sdo_servers
    }

    fn storage(&self) -> &Storage {
        &self.storage
    }
}
