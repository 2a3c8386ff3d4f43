//! Core value types shared by the persistors and the file service.
//!
//! Nothing here touches I/O: locations, ranges and digests are plain values
//! that flow through every storage operation.

pub mod digest;
pub mod location;

pub use digest::ContentDigest;
pub use location::{ByteRange, ObjectLocation};
