//! Node ID type

/// The address of a CANopen node on the bus
///
/// A configured node ID is always in the range 1..=127. The value 0 is reserved for broadcast NMT
/// commands and is never a valid node address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u8);

impl NodeId {
    /// The lowest valid node ID
    pub const MIN: u8 = 1;
    /// The highest valid node ID
    pub const MAX: u8 = 127;

    /// Create a node ID, returning an error when `value` is outside 1..=127
    pub const fn new(value: u8) -> Result<Self, InvalidNodeIdError> {
        if value >= Self::MIN && value <= Self::MAX {
            Ok(NodeId(value))
        } else {
            Err(InvalidNodeIdError(value))
        }
    }

    /// Get the raw node ID value
    pub const fn raw(&self) -> u8 {
        self.0
    }
}

/// Error returned when a node ID is out of range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidNodeIdError(pub u8);

impl core::fmt::Display for InvalidNodeIdError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Invalid node ID {} (must be 1..=127)", self.0)
    }
}
impl core::error::Error for InvalidNodeIdError {}

impl TryFrom<u8> for NodeId {
    type Error = InvalidNodeIdError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        NodeId::new(value)
    }
}

impl From<NodeId> for u8 {
    fn from(value: NodeId) -> Self {
        value.raw()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_range() {
        assert_eq!(Err(InvalidNodeIdError(0)), NodeId::new(0));
        assert_eq!(1, NodeId::new(1).unwrap().raw());
        assert_eq!(127, NodeId::new(127).unwrap().raw());
        assert!(NodeId::try_from(128).is_err());
        assert!(NodeId::try_from(255).is_err());
    }
}
