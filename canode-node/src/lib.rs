//! A library to implement a CANopen node in Rust
//!
//! Canode-node implements the core of a CiA 301 device: the communication
//! objects and protocol state machines of a node, driven by a single
//! application thread. It is primarily intended to be run on microcontrollers,
//! and so it is no_std compatible and performs no heap allocation, instead
//! statically allocating storage. It also runs on hosted targets, where the
//! `std` feature adds file based storage and TOML configuration.
//!
//! It provides the following features:
//!
//! * *NMT* slave state machine, with heartbeat production and automatic error
//!   transitions.
//! * *Heartbeat consumer* for monitoring other nodes.
//! * *SDO* servers with expedited, segmented and block transfers, on the
//!   default channel and on channels configured by a client.
//! * Receive and transmit *PDOs* with dynamic mapping, SYNC and event driven
//!   transmission, inhibit times and event timers.
//! * *SYNC* producer and consumer, with synchronous window support.
//! * *Emergency* producer and consumer, with error register and pre-defined
//!   error field.
//! * Non-volatile *storage* of object groups, with the store (0x1010) and
//!   restore (0x1011) commands.
//!
//! # Getting Started
//!
//! ## Object dictionary and node state
//!
//! The application defines its object dictionary as a static, sorted slice of
//! [`object_dict::ODEntry`], and a static [`NodeState`] sized for its number
//! of PDOs, heartbeat consumers and SDO servers. Communication objects such as the PDO
//! parameters refer to the parts of the node state:
//!
//! ```ignore
//! static NODE_STATE: NodeState<4, 4, 2> = NodeState::new();
//! static NODE_MBOX: NodeMbox = NodeMbox::new(&NODE_STATE);
//! static OBJECT1400: PdoCommObject = PdoCommObject::new(NODE_STATE.rpdo(0));
//! ```
//!
//! ## Instantiating the [`Node`] object
//!
//! Before instantiating the node, load any stored object values, so that the
//! node latches them:
//!
//! ```ignore
//! NODE_STATE.storage().register(&STORAGE_ENTRIES, &BACKEND);
//! // A corrupt image leaves the defaults in place, and is reported as an emergency
//! NODE_STATE.storage().load(&OD_TABLE).ok();
//!
//! let mut node = Node::new(node_id, NodeConfig::new(), &NODE_MBOX, &NODE_STATE, &OD_TABLE);
//! ```
//!
//! ## Handling CAN messages
//!
//! Received messages are passed to [`NodeMbox::store_message`], from any
//! context, e.g. the CAN controller receive interrupt. The node logic runs in
//! [`Node::process`], which must be called periodically with the time elapsed
//! since the previous call, and a sender for transmitting frames. The mailbox
//! can notify the processing task when a received message requires
//! processing.
//!
//! ```ignore
//! loop {
//!     wait_for_notify_or_timeout(Duration::from_millis(1));
//!     let elapsed_us = timer.restart_us();
//!     match node.process(elapsed_us, &mut |msg| can_tx.try_send(msg)) {
//!         ResetCmd::App => reset_application(),
//!         ResetCmd::Quit => break,
//!         _ => (),
//!     }
//! }
//! ```
//!
//! A sender which is busy returns the frame in a
//! [`CanSendError`](common::traits::CanSendError); the node keeps it queued
//! and retries on the next cycle.
#![cfg_attr(all(not(test), not(feature = "std")), no_std)]
#![warn(missing_docs, missing_debug_implementations)]
#![allow(clippy::comparison_chain)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod config;
pub mod emcy;
pub mod hb_consumer;
mod nmt;
mod node;
mod node_mbox;
mod node_state;
pub mod object_dict;
pub mod pdo;
mod persist;
mod sdo_server;
pub mod storage;
pub mod sync;

// Re-export types used by object dictionary definitions
pub use canode_common as common;
pub use critical_section;

pub use config::{NmtControl, NodeConfig, TX_QUEUE_SIZE};
pub use nmt::{HeartbeatProducer, ResetCmd};
pub use node::{Node, ObjectWrittenCallback, StateChangeCallback};
pub use node_mbox::NodeMbox;
pub use node_state::{NodeState, NodeStateAccess};
pub use persist::{restore_stored_objects, serialize, serialized_size};
pub use sdo_server::{SdoChannel, SdoServers, MAX_SDO_SERVERS, SDO_BUFFER_SIZE};
