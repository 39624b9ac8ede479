//! Node configuration file
//!
//! A NodeConfigFile is read from a TOML file and carries the run-time inputs of a node which are
//! not part of its object dictionary: the node ID, the bus bit rate, and tuning of the SDO server,
//! NMT behavior and storage.
//!
//! # An example TOML file
//!
//! ```toml
//! node_id = 10
//! bitrate = 250
//!
//! [sdo]
//! block_transfer = true
//! timeout_ms = 1000
//! block_size = 127
//! buffer_size = 889
//!
//! [nmt]
//! startup_to_operational = false
//! error_on_busoff_hb = true
//! error_register_mask = 0x10
//! error_to_stopped = false
//! error_free_to_operational = false
//!
//! [storage]
//! path = "/var/lib/my-node"
//! auto_save = false
//! ```
//!
//! Every table is optional. Missing values take the defaults listed on each field.
use serde::Deserialize;
use snafu::{ResultExt as _, Snafu};

use crate::{bitrate::Bitrate, node_id::NodeId};

/// The largest SDO buffer which can be negotiated (127 segments of 7 bytes)
pub const MAX_SDO_BUFFER_SIZE: usize = 889;

/// Error returned when loading a node config fails
#[derive(Debug, Snafu)]
pub enum LoadError {
    /// An IO error occured while reading the file
    #[snafu(display("IO error: {source}"))]
    Io {
        /// The underlying IO error
        source: std::io::Error,
    },
    /// An error occured in the TOML parser
    #[snafu(display("Toml parse error: {source}"))]
    TomlParsing {
        /// The toml error which led to this error
        source: toml::de::Error,
    },
    /// The node ID is outside 1..=127
    #[snafu(display("Invalid node ID {node_id}"))]
    InvalidNodeId {
        /// The configured value
        node_id: u8,
    },
    /// The bit rate is not a standard CANopen bit rate
    #[snafu(display("Unsupported bitrate {bitrate} kbit/s"))]
    InvalidBitrate {
        /// The configured value
        bitrate: u16,
    },
    /// A value is out of its allowed range
    #[snafu(display("Invalid value {value} for {field}"))]
    InvalidValue {
        /// Name of the offending field
        field: &'static str,
        /// The configured value
        value: u32,
    },
}

fn default_true() -> bool {
    true
}

fn default_bitrate() -> u16 {
    125
}

fn default_sdo_timeout() -> u32 {
    1000
}

fn default_block_size() -> u8 {
    127
}

fn default_buffer_size() -> usize {
    MAX_SDO_BUFFER_SIZE
}

/// SDO server settings
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SdoConfig {
    /// Enable block transfers. Defaults to true.
    #[serde(default = "default_true")]
    pub block_transfer: bool,
    /// Time without a frame from the client before a transfer is aborted, in ms. Defaults to 1000.
    #[serde(default = "default_sdo_timeout")]
    pub timeout_ms: u32,
    /// Segments per block offered to the client, 1..=127. Defaults to 127.
    #[serde(default = "default_block_size")]
    pub block_size: u8,
    /// Usable SDO buffer size in bytes, at most 889. Defaults to 889.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for SdoConfig {
    fn default() -> Self {
        Self {
            block_transfer: true,
            timeout_ms: default_sdo_timeout(),
            block_size: default_block_size(),
            buffer_size: default_buffer_size(),
        }
    }
}

/// NMT behavior settings
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct NmtConfig {
    /// Go to Operational after boot instead of Pre-operational. Defaults to false.
    #[serde(default)]
    pub startup_to_operational: bool,
    /// Leave Operational on bus off or heartbeat consumer errors. Defaults to true.
    #[serde(default = "default_true")]
    pub error_on_busoff_hb: bool,
    /// Leave Operational when any of these error register bits are set. Defaults to 0.
    #[serde(default)]
    pub error_register_mask: u8,
    /// On errors, go to Stopped instead of Pre-operational. Defaults to false.
    #[serde(default)]
    pub error_to_stopped: bool,
    /// Return from Pre-operational to Operational once errors clear. Defaults to false.
    #[serde(default)]
    pub error_free_to_operational: bool,
}

impl Default for NmtConfig {
    fn default() -> Self {
        Self {
            startup_to_operational: false,
            error_on_busoff_hb: true,
            error_register_mask: 0,
            error_to_stopped: false,
            error_free_to_operational: false,
        }
    }
}

/// Storage settings
#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Directory holding the persisted files. When absent, storage is disabled.
    #[serde(default)]
    pub path: Option<std::path::PathBuf>,
    /// Save automatically whenever persisted values change. Defaults to false.
    #[serde(default)]
    pub auto_save: bool,
}

/// The contents of a node configuration file
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct NodeConfigFile {
    /// Node ID, 1..=127
    pub node_id: u8,
    /// CAN bit rate in kbit/s. Defaults to 125.
    #[serde(default = "default_bitrate")]
    pub bitrate: u16,
    /// SDO server settings
    #[serde(default)]
    pub sdo: SdoConfig,
    /// NMT settings
    #[serde(default)]
    pub nmt: NmtConfig,
    /// Storage settings
    #[serde(default)]
    pub storage: StorageConfig,
}

impl NodeConfigFile {
    /// Try to read a node config from a file
    pub fn load(config_path: impl AsRef<std::path::Path>) -> Result<Self, LoadError> {
        let config_str = std::fs::read_to_string(&config_path).context(IoSnafu)?;
        Self::load_from_str(&config_str)
    }

    /// Try to read a node config from a &str
    pub fn load_from_str(config_str: &str) -> Result<Self, LoadError> {
        let config: NodeConfigFile = toml::from_str(config_str).context(TomlParsingSnafu)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), LoadError> {
        if NodeId::new(self.node_id).is_err() {
            return InvalidNodeIdSnafu {
                node_id: self.node_id,
            }
            .fail();
        }
        if Bitrate::from_kbps(self.bitrate).is_none() {
            return InvalidBitrateSnafu {
                bitrate: self.bitrate,
            }
            .fail();
        }
        if self.sdo.block_size == 0 || self.sdo.block_size > 127 {
            return InvalidValueSnafu {
                field: "sdo.block_size",
                value: self.sdo.block_size as u32,
            }
            .fail();
        }
        if self.sdo.buffer_size < 7 || self.sdo.buffer_size > MAX_SDO_BUFFER_SIZE {
            return InvalidValueSnafu {
                field: "sdo.buffer_size",
                value: self.sdo.buffer_size as u32,
            }
            .fail();
        }
        Ok(())
    }

    /// The validated node ID
    pub fn node_id(&self) -> Result<NodeId, LoadError> {
        NodeId::new(self.node_id).map_err(|e| LoadError::InvalidNodeId { node_id: e.0 })
    }

    /// The validated bit rate
    pub fn bitrate(&self) -> Result<Bitrate, LoadError> {
        Bitrate::from_kbps(self.bitrate).ok_or(LoadError::InvalidBitrate {
            bitrate: self.bitrate,
        })
    }
}
