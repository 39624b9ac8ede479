//! Wire types and definitions shared by the canode crates.
//!
//! Most users will have no reason to depend on this crate directly, as it is re-exported by
//! `canode-node`.
#![cfg_attr(not(feature = "std"), no_std)]
#![warn(missing_docs, missing_copy_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod atomic_cell;
pub use atomic_cell::AtomicCell;
pub mod bitrate;
pub mod constants;
pub mod messages;
#[cfg(feature = "std")]
#[cfg_attr(docsrs, doc(cfg(feature = "std")))]
pub mod node_config;
pub mod node_id;
pub mod objects;
pub mod sdo;
pub mod traits;

pub use bitrate::Bitrate;
pub use messages::{CanId, CanMessage};
pub use node_id::NodeId;
