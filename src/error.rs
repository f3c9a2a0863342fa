//! Error types for the translation layer.
//!
//! Failures fall into three classes:
//!
//! - resource exhaustion (`OutOfSpace`), recovered by requeueing a write once
//!   GC has had a chance to free blocks, fatal only while configuring LUNs at mount;
//! - media failures (`Media`), surfaced to the caller and never retried here;
//! - map consistency violations (`MapConsistency`, `L2pOutOfBounds`), which
//!   abort the mount or reject the operation outright.
//!
//! Range conflicts on in-flight logical addresses are not errors. The I/O path
//! reports them as [`crate::ftl::Submit::Requeue`].

use thiserror::Error;

use crate::config::{BlockId, LunId, Lpa, Ppa};

pub type Result<T> = std::result::Result<T, FtlError>;

/// Failures reported by a [`crate::media::Media`] implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("page read failed at ppa {0}")]
    Read(Ppa),

    #[error("page program failed at ppa {0}")]
    Write(Ppa),

    #[error("erase failed for block {block} on lun {lun}")]
    Erase { lun: LunId, block: BlockId },

    #[error("ppa {0} is outside the media")]
    OutOfBounds(Ppa),

    #[error("page at ppa {0} was programmed twice without an erase")]
    Overwrite(Ppa),
}

#[derive(Debug, Error)]
pub enum FtlError {
    #[error("no free block available in lun {lun}")]
    OutOfSpace { lun: LunId },

    #[error("media error: {0}")]
    Media(#[from] MediaError),

    #[error("address map inconsistency: {0}")]
    MapConsistency(String),

    #[error("L2P entry for lpa {lpa} points at ppa {ppa}, beyond {max} pages")]
    L2pOutOfBounds { lpa: Lpa, ppa: u64, max: usize },

    #[error("lpa {lpa} is not mapped")]
    Unmapped { lpa: Lpa },

    #[error("request [{lpa}, +{len}) exceeds {max} logical pages")]
    OutOfRange { lpa: Lpa, len: usize, max: usize },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("failed to start GC thread: {0}")]
    Spawn(#[from] std::io::Error),
}
