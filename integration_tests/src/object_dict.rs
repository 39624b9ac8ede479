//! Object dictionary of the node under test, node ID 10
//!
//! Objects and node state are process wide statics, as they would be on a microcontroller. Tests
//! sharing them must run serially, and call [`reset_defaults`] to start from power up values.
use canode_common::objects::{PdoMapping, SubInfo};
use canode_node::{
    emcy::{EmcyConfigObject, ErrorHistoryObject, ErrorRegisterObject},
    object_dict::{
        ArrayObject, ByteField, ConstByteRefField, ExtendableObject, ODEntry, ObjectFlags,
        ScalarField, VarObject,
    },
    pdo::{PdoCommObject, PdoMappingObject},
    storage::{StorageAttributes, StorageEntry},
    NodeMbox, NodeState,
};

use crate::mem_storage::MemoryStorage;

pub const NODE_ID: u8 = 10;

pub const DEVICE_NAME: &[u8] = b"canode-dev";
pub const DEFAULT_HEARTBEAT_MS: u16 = 100;
pub const DEFAULT_SETPOINT: u32 = 0x1234_5678;

pub static NODE_STATE: NodeState<4, 4, 2, 2> = NodeState::new();
pub static NODE_MBOX: NodeMbox = NodeMbox::new(&NODE_STATE);

pub static STORAGE: MemoryStorage = MemoryStorage::new();
pub static STORAGE_ENTRIES: [StorageEntry; 2] = [
    StorageEntry::new(2, "comm", 0x1000, 0x1FFF, StorageAttributes::on_command()),
    StorageEntry::new(3, "app", 0x2000, 0x9FFF, StorageAttributes::all()),
];

static INPUT_FLAGS: ObjectFlags<1> = ObjectFlags::new(NODE_STATE.pdo_sync());

pub static OBJECT1000: VarObject<ScalarField<u32>> =
    VarObject::new(ScalarField::<u32>::new(0x0001_0191), SubInfo::new_u32().const_access());
pub static OBJECT1001: ErrorRegisterObject = ErrorRegisterObject::new(NODE_STATE.emcy());
pub static OBJECT1003: ErrorHistoryObject = ErrorHistoryObject::new(NODE_STATE.emcy());
pub static OBJECT1005: ExtendableObject<VarObject<ScalarField<u32>>> = ExtendableObject::new(
    VarObject::new(ScalarField::<u32>::new(0x80), SubInfo::new_u32().rw_access().persist(true)),
);
pub static OBJECT1006: ExtendableObject<VarObject<ScalarField<u32>>> = ExtendableObject::new(
    VarObject::new(ScalarField::<u32>::new(0), SubInfo::new_u32().rw_access().persist(true)),
);
pub static OBJECT1007: ExtendableObject<VarObject<ScalarField<u32>>> = ExtendableObject::new(
    VarObject::new(ScalarField::<u32>::new(0), SubInfo::new_u32().rw_access().persist(true)),
);
pub static OBJECT1008: VarObject<ConstByteRefField> = VarObject::new(
    ConstByteRefField::new(DEVICE_NAME),
    SubInfo::new_octet_str(DEVICE_NAME.len()).const_access(),
);
pub static OBJECT1010: ExtendableObject<ArrayObject<ScalarField<u32>, 3>> =
    ExtendableObject::new(ArrayObject::new(
        [ScalarField::<u32>::new(0), ScalarField::<u32>::new(0), ScalarField::<u32>::new(0)],
        SubInfo::new_u32().rw_access(),
    ));
pub static OBJECT1011: ExtendableObject<ArrayObject<ScalarField<u32>, 3>> =
    ExtendableObject::new(ArrayObject::new(
        [ScalarField::<u32>::new(0), ScalarField::<u32>::new(0), ScalarField::<u32>::new(0)],
        SubInfo::new_u32().rw_access(),
    ));
pub static OBJECT1014: EmcyConfigObject = EmcyConfigObject::cob_id(NODE_STATE.emcy());
pub static OBJECT1015: EmcyConfigObject = EmcyConfigObject::inhibit_time(NODE_STATE.emcy());
pub static OBJECT1016: ExtendableObject<ArrayObject<ScalarField<u32>, 2>> =
    ExtendableObject::new(ArrayObject::new(
        [ScalarField::<u32>::new(0), ScalarField::<u32>::new(0)],
        SubInfo::new_u32().rw_access().persist(true),
    ));
pub static OBJECT1017: ExtendableObject<VarObject<ScalarField<u16>>> =
    ExtendableObject::new(VarObject::new(
        ScalarField::<u16>::new(DEFAULT_HEARTBEAT_MS),
        SubInfo::new_u16().rw_access().persist(true),
    ));
pub static OBJECT1018: ArrayObject<ScalarField<u32>, 4> = ArrayObject::new(
    [
        ScalarField::<u32>::new(0x0000_0CA0),
        ScalarField::<u32>::new(0x0000_0001),
        ScalarField::<u32>::new(0x0001_0000),
        ScalarField::<u32>::new(0x0000_0000),
    ],
    SubInfo::new_u32().ro_access(),
);
pub static OBJECT1019: ExtendableObject<VarObject<ScalarField<u8>>> = ExtendableObject::new(
    VarObject::new(ScalarField::<u8>::new(0), SubInfo::new_u8().rw_access().persist(true)),
);
pub static OBJECT1200: ExtendableObject<ArrayObject<ScalarField<u32>, 2>> =
    ExtendableObject::new(ArrayObject::new(
        [ScalarField::<u32>::new(0), ScalarField::<u32>::new(0)],
        SubInfo::new_u32().ro_access(),
    ));
/// Additional SDO server, configured by a client
pub static OBJECT1201: ExtendableObject<ArrayObject<ScalarField<u32>, 3>> =
    ExtendableObject::new(ArrayObject::new(
        [
            ScalarField::<u32>::new(0x8000_0000),
            ScalarField::<u32>::new(0x8000_0000),
            ScalarField::<u32>::new(0),
        ],
        SubInfo::new_u32().rw_access(),
    ));

pub static OBJECT1400: PdoCommObject = PdoCommObject::new(NODE_STATE.rpdo(0));
pub static OBJECT1401: PdoCommObject = PdoCommObject::new(NODE_STATE.rpdo(1));
pub static OBJECT1402: PdoCommObject = PdoCommObject::new(NODE_STATE.rpdo(2));
pub static OBJECT1403: PdoCommObject = PdoCommObject::new(NODE_STATE.rpdo(3));
pub static OBJECT1600: PdoMappingObject = PdoMappingObject::new(NODE_STATE.rpdo(0));
pub static OBJECT1601: PdoMappingObject = PdoMappingObject::new(NODE_STATE.rpdo(1));
pub static OBJECT1602: PdoMappingObject = PdoMappingObject::new(NODE_STATE.rpdo(2));
pub static OBJECT1603: PdoMappingObject = PdoMappingObject::new(NODE_STATE.rpdo(3));
pub static OBJECT1800: PdoCommObject = PdoCommObject::new(NODE_STATE.tpdo(0));
pub static OBJECT1801: PdoCommObject = PdoCommObject::new(NODE_STATE.tpdo(1));
pub static OBJECT1802: PdoCommObject = PdoCommObject::new(NODE_STATE.tpdo(2));
pub static OBJECT1803: PdoCommObject = PdoCommObject::new(NODE_STATE.tpdo(3));
pub static OBJECT1A00: PdoMappingObject = PdoMappingObject::new(NODE_STATE.tpdo(0));
pub static OBJECT1A01: PdoMappingObject = PdoMappingObject::new(NODE_STATE.tpdo(1));
pub static OBJECT1A02: PdoMappingObject = PdoMappingObject::new(NODE_STATE.tpdo(2));
pub static OBJECT1A03: PdoMappingObject = PdoMappingObject::new(NODE_STATE.tpdo(3));

/// Application setpoint, stored in the "app" storage entry
pub static OBJECT2000: VarObject<ScalarField<u32>> = VarObject::new(
    ScalarField::<u32>::new(DEFAULT_SETPOINT),
    SubInfo::new_u32().rw_access().persist(true),
);
/// Application blob, large enough to need segmented and block transfers
pub static OBJECT2001: VarObject<ByteField<200>> =
    VarObject::new(ByteField::new([0; 200]), SubInfo::new_octet_str(200).rw_access());
/// Digital inputs, mapped into TPDOs
pub static OBJECT6000: ArrayObject<ScalarField<u8>, 2> = ArrayObject::new_with_flags(
    [ScalarField::<u8>::new(0), ScalarField::<u8>::new(0)],
    SubInfo::new_u8().rw_access().mapping(PdoMapping::Tpdo),
    &INPUT_FLAGS,
);
/// Analog input, mapped into TPDOs
pub static OBJECT6001: ArrayObject<ScalarField<u16>, 1> = ArrayObject::new(
    [ScalarField::<u16>::new(0)],
    SubInfo::new_u16().rw_access().mapping(PdoMapping::Tpdo),
);
/// Digital outputs, written by RPDOs
pub static OBJECT6200: ArrayObject<ScalarField<u8>, 2> = ArrayObject::new(
    [ScalarField::<u8>::new(0), ScalarField::<u8>::new(0)],
    SubInfo::new_u8().rw_access().mapping(PdoMapping::Rpdo),
);

/// Second output bank, for RPDOs mapping more than one object
pub static OBJECT6201: ArrayObject<ScalarField<u8>, 1> = ArrayObject::new(
    [ScalarField::<u8>::new(0)],
    SubInfo::new_u8().rw_access().mapping(PdoMapping::Rpdo),
);
/// Analog output, written by RPDOs
pub static OBJECT6401: ArrayObject<ScalarField<u16>, 1> = ArrayObject::new(
    [ScalarField::<u16>::new(0)],
    SubInfo::new_u16().rw_access().mapping(PdoMapping::Rpdo),
);

/// The object dictionary, sorted by index
pub static OD_TABLE: [ODEntry<'static>; 40] = [
    ODEntry { index: 0x1000, data: &OBJECT1000 },
    ODEntry { index: 0x1001, data: &OBJECT1001 },
    ODEntry { index: 0x1003, data: &OBJECT1003 },
    ODEntry { index: 0x1005, data: &OBJECT1005 },
    ODEntry { index: 0x1006, data: &OBJECT1006 },
    ODEntry { index: 0x1007, data: &OBJECT1007 },
    ODEntry { index: 0x1008, data: &OBJECT1008 },
    ODEntry { index: 0x1010, data: &OBJECT1010 },
    ODEntry { index: 0x1011, data: &OBJECT1011 },
    ODEntry { index: 0x1014, data: &OBJECT1014 },
    ODEntry { index: 0x1015, data: &OBJECT1015 },
    ODEntry { index: 0x1016, data: &OBJECT1016 },
    ODEntry { index: 0x1017, data: &OBJECT1017 },
    ODEntry { index: 0x1018, data: &OBJECT1018 },
    ODEntry { index: 0x1019, data: &OBJECT1019 },
    ODEntry { index: 0x1200, data: &OBJECT1200 },
    ODEntry { index: 0x1201, data: &OBJECT1201 },
    ODEntry { index: 0x1400, data: &OBJECT1400 },
    ODEntry { index: 0x1401, data: &OBJECT1401 },
    ODEntry { index: 0x1402, data: &OBJECT1402 },
    ODEntry { index: 0x1403, data: &OBJECT1403 },
    ODEntry { index: 0x1600, data: &OBJECT1600 },
    ODEntry { index: 0x1601, data: &OBJECT1601 },
    ODEntry { index: 0x1602, data: &OBJECT1602 },
    ODEntry { index: 0x1603, data: &OBJECT1603 },
    ODEntry { index: 0x1800, data: &OBJECT1800 },
    ODEntry { index: 0x1801, data: &OBJECT1801 },
    ODEntry { index: 0x1802, data: &OBJECT1802 },
    ODEntry { index: 0x1803, data: &OBJECT1803 },
    ODEntry { index: 0x1A00, data: &OBJECT1A00 },
    ODEntry { index: 0x1A01, data: &OBJECT1A01 },
    ODEntry { index: 0x1A02, data: &OBJECT1A02 },
    ODEntry { index: 0x1A03, data: &OBJECT1A03 },
    ODEntry { index: 0x2000, data: &OBJECT2000 },
    ODEntry { index: 0x2001, data: &OBJECT2001 },
    ODEntry { index: 0x6000, data: &OBJECT6000 },
    ODEntry { index: 0x6001, data: &OBJECT6001 },
    ODEntry { index: 0x6200, data: &OBJECT6200 },
    ODEntry { index: 0x6201, data: &OBJECT6201 },
    ODEntry { index: 0x6401, data: &OBJECT6401 },
];

/// Put every object back to its power up value, and forget stored images
pub fn reset_defaults() {
    STORAGE.clear();
    reset_values();
}

/// Put every object back to its power up value, keeping stored images
///
/// The PDO configuration is reset to "all PDOs disabled". It is latched by the node when it is
/// created.
pub fn reset_values() {
    use canode_node::object_dict::ObjectAccess;

    let storage = NODE_STATE.storage();
    storage.register(&STORAGE_ENTRIES, &STORAGE);
    storage.set_auto_save(false);
    storage.set_sub1_all(true);

    // Write the inner objects directly, so that no extension side effects run
    OBJECT1005.inner().write(0, &0x80u32.to_le_bytes()).ok();
    OBJECT1006.inner().write(0, &0u32.to_le_bytes()).ok();
    OBJECT1007.inner().write(0, &0u32.to_le_bytes()).ok();
    OBJECT1016.inner().write(1, &0u32.to_le_bytes()).ok();
    OBJECT1016.inner().write(2, &0u32.to_le_bytes()).ok();
    OBJECT1017.inner().write(0, &DEFAULT_HEARTBEAT_MS.to_le_bytes()).ok();
    OBJECT1019.inner().write(0, &[0]).ok();
    OBJECT1201.inner().write(3, &0u32.to_le_bytes()).ok();
    OBJECT1003.write(0, &[0]).ok();
    OBJECT1014.restore(0, &0x80u32.to_le_bytes()).ok();
    OBJECT1015.restore(0, &0u16.to_le_bytes()).ok();
    OBJECT2000.field().store(DEFAULT_SETPOINT);
    OBJECT2001.field().store([0; 200]);
    for sub in 1..=2 {
        OBJECT6000.write(sub, &[0]).ok();
        OBJECT6200.write(sub, &[0]).ok();
    }
    OBJECT6001.write(1, &[0, 0]).ok();
    OBJECT6201.write(1, &[0]).ok();
    OBJECT6401.write(1, &[0, 0]).ok();

    for comm in [
        &OBJECT1400, &OBJECT1401, &OBJECT1402, &OBJECT1403, &OBJECT1800, &OBJECT1801, &OBJECT1802,
        &OBJECT1803,
    ] {
        // Raw restore of the default record: disabled, event driven, no timers
        comm.restore(1, &(0x8000_0000u32).to_le_bytes()).ok();
        comm.restore(2, &[0xFF]).ok();
        comm.restore(3, &0u16.to_le_bytes()).ok();
        comm.restore(5, &0u16.to_le_bytes()).ok();
        comm.restore(6, &[0]).ok();
    }
    for mapping in [
        &OBJECT1600, &OBJECT1601, &OBJECT1602, &OBJECT1603, &OBJECT1A00, &OBJECT1A01, &OBJECT1A02,
        &OBJECT1A03,
    ] {
        mapping.restore(0, &[0]).ok();
    }
}
