//! Object Dictionary
//!
//! # Objects Overview
//!
//! The object dictionary is the main mechanism of configuration and communication for a node. For
//! example, SDO access is performed on sub objects, which are identified by the 16-bit object ID of
//! their parent object, and an 8-bit sub index. Objects come in three varieties:
//!
//! - VAR: A single variable of any type (accessed at sub index 0)
//! - ARRAY: An array of sub-objects, all with the same type. Sub-index 0 is a u8 containing the
//!   size of the array. Sub indices 1-N contain the array values.
//! - RECORD: A collection of sub-objects of heterogenous types. Sub-index 0 contains the highest
//!   implemented sub index.
//!
//! The dictionary itself is a static slice of [`ODEntry`], sorted by index, and searched with a
//! binary search by [`find_object`].
//!
//! # The ObjectAccess trait
//!
//! Any struct which implements the [`ObjectAccess`] trait can be used to represent an object in the
//! dictionary. A more ergonomic way to implement this trait is to implement the
//! [`ProvidesSubObjects`] trait, and implement the sub objects individually by implementing the
//! [`SubObjectAccess`] trait. Any object which implements [`ProvidesSubObjects`] will also get an
//! [`ObjectAccess`] implementation. [`VarObject`] and [`ArrayObject`] cover the common cases.
//!
//! Most sub objects can be implemented using one of the following existing types:
//!
//! - [`ScalarField<T>`]
//! - [`ByteField`]
//! - [`NullTermByteField`]
//! - [`ConstField`]
//! - [`ConstByteRefField`]
//!
//! # Extensions
//!
//! An object wrapped in [`ExtendableObject`] can have an [`ObjectExtension`] installed at run time
//! using [`extension_init`]. Reads and writes are then routed through the extension, which may
//! still delegate to the wrapped object. Installing an extension replaces any previous one.
//!
//! # Atomicity
//!
//! All objects must be `Sync` and `Send`. Sub objects guard their storage with `critical_section`,
//! so a single [`ObjectAccess::write`] is observed completely or not at all. Values of primitive
//! types are always committed with a single write: [`OdStream`] stages them until the last byte has
//! arrived. Objects larger than the SDO buffer are written with the partial write API, and readers
//! may observe a partially written value until the transfer completes.
//!
//! Sequences of accesses which must not be interleaved with other contexts (e.g. committing all
//! the mapped values of a received PDO) are wrapped in [`od_lock`].
//!
//! # Object flags for TPDO event triggering
//!
//! Some objects support event flags, which can be set via [`ObjectAccess::set_event_flag`]. These
//! are used to trigger TPDO transmission.

mod object_flags;
mod objects;
mod stream;
mod sub_objects;

// Pull up public sub module definitions. The submodules provide some code organization, but
// shouldn't clutter the public API
pub use object_flags::*;
pub use objects::*;
pub use stream::OdStream;
pub use sub_objects::*;
pub(crate) use sub_objects::{exact_bytes, read_slice};

/// Run `f` while holding the object dictionary lock
///
/// On single core targets this masks interrupts, so it must be kept short.
pub fn od_lock<R>(f: impl FnOnce() -> R) -> R {
    critical_section::with(|_| f())
}
