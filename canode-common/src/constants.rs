//! Constants defining standard object and special values

/// Object indices for standard objects
pub mod object_ids {
    /// Device type
    pub const DEVICE_TYPE: u16 = 0x1000;
    /// Error register
    pub const ERROR_REGISTER: u16 = 0x1001;
    /// Pre-defined error field (EMCY history)
    pub const PREDEFINED_ERROR_FIELD: u16 = 0x1003;
    /// COB-ID of the SYNC message
    pub const SYNC_COB_ID: u16 = 0x1005;
    /// Communication cycle period, in microseconds
    pub const SYNC_PERIOD: u16 = 0x1006;
    /// Synchronous window length, in microseconds
    pub const SYNC_WINDOW: u16 = 0x1007;
    /// The Device Name object index
    pub const DEVICE_NAME: u16 = 0x1008;
    /// The hardware version object index
    pub const HARDWARE_VERSION: u16 = 0x1009;
    /// The software version object index
    pub const SOFTWARE_VERSION: u16 = 0x100A;
    /// Store parameters command object index
    pub const SAVE_OBJECTS: u16 = 0x1010;
    /// Restore default parameters command object index
    pub const RESTORE_OBJECTS: u16 = 0x1011;
    /// COB-ID of the emergency producer
    pub const EMCY_COB_ID: u16 = 0x1014;
    /// Emergency inhibit time, in 100us units
    pub const EMCY_INHIBIT_TIME: u16 = 0x1015;
    /// Heartbeat consumer times
    pub const HEARTBEAT_CONSUMER_TIME: u16 = 0x1016;
    /// The heartbeat producer time object index
    pub const HEARTBEAT_PRODUCER_TIME: u16 = 0x1017;
    /// The identity object index
    pub const IDENTITY: u16 = 0x1018;
    /// Synchronous counter overflow value
    pub const SYNC_COUNTER_OVERFLOW: u16 = 0x1019;
    /// First SDO server parameter object
    pub const SDO_SERVER_PARAMETER: u16 = 0x1200;
    /// First RPDO communication parameter object
    pub const RPDO_COMM_BASE: u16 = 0x1400;
    /// First RPDO mapping parameter object
    pub const RPDO_MAPPING_BASE: u16 = 0x1600;
    /// First TPDO communication parameter object
    pub const TPDO_COMM_BASE: u16 = 0x1800;
    /// First TPDO mapping parameter object
    pub const TPDO_MAPPING_BASE: u16 = 0x1A00;
}

/// Special values used to access standard objects
pub mod values {
    /// Magic value used to trigger object storage by writing to object 0x1010 ("save" in ASCII,
    /// little endian)
    pub const SAVE_CMD: u32 = 0x65766173;
    /// Magic value used to restore default values by writing to object 0x1011 ("load" in ASCII,
    /// little endian)
    pub const LOAD_CMD: u32 = 0x64616F6C;
}
