//! On-disk storage primitives for a segmented RDF store: a family of
//! file-backed containers sharing one lockable-file protocol (advisory
//! whole-file locks with header revalidation on every acquisition).
//!
//! Three containers are built on it: [`list::List`], an append-only
//! record file with an external-memory sort; [`mhash::ModelHash`], a
//! fixed-width open-addressed hash from model rids to index nodes; and
//! [`rhash::ResourceHash`], a bucketed mmapped hash from resource rids to
//! attribute + lexical form, with inline packing, a spill file and a
//! prefix dictionary.

pub mod error;
pub mod list;
pub mod lockable;
pub mod mhash;
pub mod prefixes;
mod prelude;
pub mod rhash;
pub mod rid;

#[cfg(test)]
mod test_util;

pub use crate::error::StoreError;
pub use crate::list::List;
pub use crate::lockable::{LockOp, LockState, Lockable, OpenFlags};
pub use crate::mhash::ModelHash;
pub use crate::rhash::{Resource, ResourceHash};
pub use crate::rid::Rid;
