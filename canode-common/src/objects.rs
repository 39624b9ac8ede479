//! Object metadata shared by the object dictionary and its users

/// A container for the address of a subobject
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ObjectId {
    /// Object index
    pub index: u16,
    /// Sub index
    pub sub: u8,
}

impl ObjectId {
    /// Create an object ID
    pub const fn new(index: u16, sub: u8) -> Self {
        Self { index, sub }
    }
}

/// Object Code value
///
/// Defines the type of an object or sub object
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectCode {
    /// An empty object
    Null = 0,
    /// A large chunk of data
    Domain = 2,
    /// Unused
    DefType = 5,
    /// Unused
    DefStruct = 6,
    /// An object which has a single sub object
    #[default]
    Var = 7,
    /// An array of sub-objects all with the same data type
    Array = 8,
    /// A collection of sub-objects with varying types
    Record = 9,
}

impl TryFrom<u8> for ObjectCode {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ObjectCode::Null),
            2 => Ok(ObjectCode::Domain),
            5 => Ok(ObjectCode::DefType),
            6 => Ok(ObjectCode::DefStruct),
            7 => Ok(ObjectCode::Var),
            8 => Ok(ObjectCode::Array),
            9 => Ok(ObjectCode::Record),
            _ => Err(()),
        }
    }
}

/// Access type enum
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum AccessType {
    /// Read-only
    #[default]
    Ro,
    /// Write-only
    Wo,
    /// Read-write
    Rw,
    /// Read-only, and also will never be changed, even internally by the device
    Const,
}

impl AccessType {
    /// Returns true if an object with this access type can be read
    pub fn is_readable(&self) -> bool {
        matches!(self, AccessType::Ro | AccessType::Rw | AccessType::Const)
    }

    /// Returns true if an object with this access type can be written
    pub fn is_writable(&self) -> bool {
        matches!(self, AccessType::Rw | AccessType::Wo)
    }
}

/// Possible PDO mapping values for an object
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum PdoMapping {
    /// Object cannot be mapped to PDOs
    #[default]
    None,
    /// Object can be mapped to RPDOs only
    Rpdo,
    /// Object can be mapped to TPDOs only
    Tpdo,
    /// Object can be mapped to both RPDOs and TPDOs
    Both,
}

impl PdoMapping {
    /// Returns true if the object can be transmitted in a TPDO
    pub fn supports_tpdo(&self) -> bool {
        matches!(self, PdoMapping::Tpdo | PdoMapping::Both)
    }

    /// Returns true if the object can be written by an RPDO
    pub fn supports_rpdo(&self) -> bool {
        matches!(self, PdoMapping::Rpdo | PdoMapping::Both)
    }
}

/// Indicate the type of data stored in an object
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(u16)]
#[allow(missing_docs)]
pub enum DataType {
    Boolean = 1,
    #[default]
    Int8 = 2,
    Int16 = 3,
    Int32 = 4,
    UInt8 = 5,
    UInt16 = 6,
    UInt32 = 7,
    Real32 = 8,
    VisibleString = 9,
    OctetString = 0xa,
    UnicodeString = 0xb,
    TimeOfDay = 0xc,
    TimeDifference = 0xd,
    Domain = 0xf,
    Real64 = 0x11,
    Int64 = 0x15,
    UInt64 = 0x1b,
    Other(u16),
}

impl From<u16> for DataType {
    fn from(value: u16) -> Self {
        use DataType::*;
        match value {
            1 => Boolean,
            2 => Int8,
            3 => Int16,
            4 => Int32,
            5 => UInt8,
            6 => UInt16,
            7 => UInt32,
            8 => Real32,
            9 => VisibleString,
            0xa => OctetString,
            0xb => UnicodeString,
            0xc => TimeOfDay,
            0xd => TimeDifference,
            0xf => Domain,
            0x11 => Real64,
            0x15 => Int64,
            0x1b => UInt64,
            _ => Other(value),
        }
    }
}

impl DataType {
    /// Returns true if data type is one of the string types
    pub fn is_str(&self) -> bool {
        matches!(
            self,
            Self::VisibleString | Self::OctetString | Self::UnicodeString
        )
    }

    /// Returns the size in bytes of fixed size numeric types
    ///
    /// Values of these types are committed as a whole and never partially written.
    pub fn primitive_size(&self) -> Option<usize> {
        use DataType::*;
        match self {
            Boolean | Int8 | UInt8 => Some(1),
            Int16 | UInt16 => Some(2),
            Int32 | UInt32 | Real32 => Some(4),
            Int64 | UInt64 | Real64 => Some(8),
            _ => None,
        }
    }

    /// The CANopen data type code
    pub fn code(&self) -> u16 {
        use DataType::*;
        match self {
            Boolean => 1,
            Int8 => 2,
            Int16 => 3,
            Int32 => 4,
            UInt8 => 5,
            UInt16 => 6,
            UInt32 => 7,
            Real32 => 8,
            VisibleString => 9,
            OctetString => 0xa,
            UnicodeString => 0xb,
            TimeOfDay => 0xc,
            TimeDifference => 0xd,
            Domain => 0xf,
            Real64 => 0x11,
            Int64 => 0x15,
            UInt64 => 0x1b,
            Other(code) => *code,
        }
    }
}

/// Information about a sub object
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubInfo {
    /// The size (or max size) of this sub object, in bytes
    pub size: usize,
    /// The data type of this sub object
    pub data_type: DataType,
    /// Indicates what accesses (i.e. read/write) are allowed on this sub object
    pub access_type: AccessType,
    /// Indicates whether this sub may be mapped to PDOs
    pub pdo_mapping: PdoMapping,
    /// Indicates whether this sub should be persisted when data is saved
    pub persist: bool,
}

impl SubInfo {
    /// A shorthand value for sub0 on record and array objects
    pub const MAX_SUB_NUMBER: SubInfo = SubInfo {
        size: 1,
        data_type: DataType::UInt8,
        access_type: AccessType::Const,
        pdo_mapping: PdoMapping::None,
        persist: false,
    };

    /// Convenience function for creating a new sub-info by type
    pub const fn new_u32() -> Self {
        Self {
            size: 4,
            data_type: DataType::UInt32,
            access_type: AccessType::Ro,
            pdo_mapping: PdoMapping::None,
            persist: false,
        }
    }

    /// Convenience function for creating a new sub-info by type
    pub const fn new_u16() -> Self {
        Self {
            size: 2,
            data_type: DataType::UInt16,
            access_type: AccessType::Ro,
            pdo_mapping: PdoMapping::None,
            persist: false,
        }
    }

    /// Convenience function for creating a new sub-info by type
    pub const fn new_u8() -> Self {
        Self {
            size: 1,
            data_type: DataType::UInt8,
            access_type: AccessType::Ro,
            pdo_mapping: PdoMapping::None,
            persist: false,
        }
    }

    /// Convenience function for creating a new sub-info by type
    pub const fn new_bool() -> Self {
        Self::new_typed(DataType::Boolean, 1)
    }

    /// Convenience function for creating a new sub-info by type
    pub const fn new_i8() -> Self {
        Self::new_typed(DataType::Int8, 1)
    }

    /// Convenience function for creating a new sub-info by type
    pub const fn new_i16() -> Self {
        Self::new_typed(DataType::Int16, 2)
    }

    /// Convenience function for creating a new sub-info by type
    pub const fn new_i32() -> Self {
        Self::new_typed(DataType::Int32, 4)
    }

    /// Convenience function for creating a new sub-info by type
    pub const fn new_u64() -> Self {
        Self::new_typed(DataType::UInt64, 8)
    }

    /// Convenience function for creating a new sub-info by type
    pub const fn new_f32() -> Self {
        Self::new_typed(DataType::Real32, 4)
    }

    /// Create a read-only sub-info with the given type and size
    pub const fn new_typed(data_type: DataType, size: usize) -> Self {
        Self {
            size,
            data_type,
            access_type: AccessType::Ro,
            pdo_mapping: PdoMapping::None,
            persist: false,
        }
    }

    /// Convenience function for creating a new sub-info by type
    pub const fn new_octet_str(size: usize) -> Self {
        Self::new_typed(DataType::OctetString, size)
    }

    /// Convenience function for creating a new sub-info by type
    pub const fn new_visibile_str(size: usize) -> Self {
        Self {
            size,
            data_type: DataType::VisibleString,
            access_type: AccessType::Ro,
            pdo_mapping: PdoMapping::None,
            persist: false,
        }
    }

    /// Convenience function to set the access_type to read-only
    pub const fn ro_access(mut self) -> Self {
        self.access_type = AccessType::Ro;
        self
    }

    /// Convenience function to set the access_type to read-write
    pub const fn rw_access(mut self) -> Self {
        self.access_type = AccessType::Rw;
        self
    }

    /// Convenience function to set the access_type to const
    pub const fn const_access(mut self) -> Self {
        self.access_type = AccessType::Const;
        self
    }

    /// Convenience function to set the access_type to write-only
    pub const fn wo_access(mut self) -> Self {
        self.access_type = AccessType::Wo;
        self
    }

    /// Convenience function to set the persist value
    pub const fn persist(mut self, value: bool) -> Self {
        self.persist = value;
        self
    }

    /// Convenience function to set the PDO mapping
    pub const fn mapping(mut self, value: PdoMapping) -> Self {
        self.pdo_mapping = value;
        self
    }
}
