//! Run time configuration of a node
//!
//! A [`NodeConfig`] collects the settings which select optional protocol behavior and size the
//! node's buffers. It is passed to [`Node::new`](crate::Node::new) and latched there; changes take
//! effect on the next node creation.
//!
//! With the `std` feature a config can be built from a
//! [`NodeConfigFile`](canode_common::node_config::NodeConfigFile).

use crate::sdo_server::SDO_BUFFER_SIZE;

/// Flags which control automatic NMT state changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NmtControl {
    /// Go straight to Operational after boot instead of Pre-operational
    pub startup_to_operational: bool,
    /// Leave Operational when the controller goes bus off or a heartbeat consumer times out
    pub error_on_busoff_hb: bool,
    /// Leave Operational when any error register bit in `error_register_mask` is set
    pub error_on_error_register: bool,
    /// Error register bits considered by `error_on_error_register`
    pub error_register_mask: u8,
    /// On an error, enter Stopped instead of Pre-operational
    pub error_to_stopped: bool,
    /// Return from Pre-operational to Operational once all errors have cleared
    pub error_free_to_operational: bool,
}

impl NmtControl {
    /// Default flags: bus off and heartbeat errors drop the node to Pre-operational
    pub const fn new() -> Self {
        Self {
            startup_to_operational: false,
            error_on_busoff_hb: true,
            error_on_error_register: false,
            error_register_mask: 0,
            error_to_stopped: false,
            error_free_to_operational: false,
        }
    }
}

impl Default for NmtControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Node configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeConfig {
    /// Accept block transfers on the SDO server
    pub block_transfer: bool,
    /// Usable SDO buffer in bytes. Values above [`SDO_BUFFER_SIZE`] are capped.
    pub sdo_buffer_size: usize,
    /// Time without a frame from the SDO client before a transfer is aborted
    pub sdo_timeout_us: u32,
    /// Number of segments per block offered to SDO clients, 1..=127
    pub sdo_block_size: u8,
    /// Delay between the bootup message and the first heartbeat, capped at the producer time
    pub first_heartbeat_ms: u16,
    /// Automatic NMT transitions
    pub nmt_control: NmtControl,
    /// Maximum number of frames held in the transmit queue
    pub tx_queue_limit: usize,
}

/// Capacity of the transmit queue
pub const TX_QUEUE_SIZE: usize = 32;

impl NodeConfig {
    /// The default configuration
    pub const fn new() -> Self {
        Self {
            block_transfer: true,
            sdo_buffer_size: SDO_BUFFER_SIZE,
            sdo_timeout_us: 1_000_000,
            sdo_block_size: 127,
            first_heartbeat_ms: 0,
            nmt_control: NmtControl::new(),
            tx_queue_limit: TX_QUEUE_SIZE,
        }
    }

    /// The SDO buffer size actually used
    pub fn effective_sdo_buffer_size(&self) -> usize {
        self.sdo_buffer_size.clamp(7, SDO_BUFFER_SIZE)
    }

    /// The SDO block size actually offered
    pub fn effective_block_size(&self) -> u8 {
        self.sdo_block_size.clamp(1, 127)
    }

    /// The transmit queue limit actually used
    pub fn effective_tx_queue_limit(&self) -> usize {
        self.tx_queue_limit.clamp(1, TX_QUEUE_SIZE)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "std")]
mod file {
    use super::*;
    use canode_common::node_config::NodeConfigFile;

    impl From<&NodeConfigFile> for NodeConfig {
        fn from(file: &NodeConfigFile) -> Self {
            Self {
                block_transfer: file.sdo.block_transfer,
                sdo_buffer_size: file.sdo.buffer_size,
                sdo_timeout_us: file.sdo.timeout_ms.saturating_mul(1000),
                sdo_block_size: file.sdo.block_size,
                first_heartbeat_ms: 0,
                nmt_control: NmtControl {
                    startup_to_operational: file.nmt.startup_to_operational,
                    error_on_busoff_hb: file.nmt.error_on_busoff_hb,
                    error_on_error_register: file.nmt.error_register_mask != 0,
                    error_register_mask: file.nmt.error_register_mask,
                    error_to_stopped: file.nmt.error_to_stopped,
                    error_free_to_operational: file.nmt.error_free_to_operational,
                },
                tx_queue_limit: TX_QUEUE_SIZE,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_are_clamped() {
        let config = NodeConfig {
            sdo_buffer_size: 4000,
            sdo_block_size: 0,
            tx_queue_limit: 0,
            ..Default::default()
        };
        assert_eq!(SDO_BUFFER_SIZE, config.effective_sdo_buffer_size());
        assert_eq!(1, config.effective_block_size());
        assert_eq!(1, config.effective_tx_queue_limit());
    }

    #[cfg(feature = "std")]
    #[test]
    fn test_from_config_file() {
        use canode_common::node_config::NodeConfigFile;

        let file = NodeConfigFile::load_from_str(
            "node_id = 3\n[sdo]\ntimeout_ms = 20\nblock_size = 8\n[nmt]\nerror_register_mask = 0x10",
        )
        .unwrap();
        let config = NodeConfig::from(&file);
        assert_eq!(20_000, config.sdo_timeout_us);
        assert_eq!(8, config.sdo_block_size);
        assert!(config.nmt_control.error_on_error_register);
        assert_eq!(0x10, config.nmt_control.error_register_mask);
    }
}
