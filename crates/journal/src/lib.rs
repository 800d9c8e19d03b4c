//! Write-ahead journal for the chunksnap metadata device.
//!
//! Unlike an append-only, segmented commit log that grows without bound,
//! this journal is a small **fixed ring** of chunks reused forever:
//! individual metadata writes never land at their final location until a
//! commit block describing them is durable in the ring, and replaying the
//! ring is how a crashed daemon recovers.

pub mod error;
mod ring;

pub use error::{Error, Recovery, Result};
pub use ring::{DirtyBuffer, Journal, Options};
