//! Log-structured, page-mapped flash translation layer.
//!
//! Logical pages are written out of place: every write takes the next free
//! page of an open block, chosen round-robin over the LUNs, and the address
//! map is updated to point at it. Superseded pages are tracked per block and
//! reclaimed by a garbage collector that migrates what is still live before
//! erasing.

pub mod bitmap;
pub mod config;
pub mod error;
pub mod ftl;
pub mod media;
pub mod request;

pub use crate::config::{FtlConfig, Geometry};
pub use crate::error::{FtlError, MediaError, Result};
pub use crate::ftl::map::{L2PValue, L2pChunk};
pub use crate::ftl::{Ftl, FtlStats, Submit};
pub use crate::media::{Media, MemMedia};
pub use crate::request::{Request, Response};
