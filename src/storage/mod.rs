//! Storage Module
//!
//! Single-file storage layer: backends (heap buffer, mapped file, plain
//! file) and the codec for the on-disk structures.
//!
//! ## Responsibilities
//! - Map, read, write, grow and truncate the backing file
//! - Re-map when another process has grown the file
//! - Encode/decode headers and records in the file's byte order
//!
//! ## File Format
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ Header (128 bytes)                                       │
//! │   Signature (32) | Version | HashSize | RecoveryStart    │
//! │   Allocated | Magic1Hash | Magic2Hash | reserved         │
//! ├──────────────────────────────────────────────────────────┤
//! │ Slot Table                                               │
//! │   FreeBucket[0..8] (u32 each) | Chain[0..N] (u32 each)   │
//! ├──────────────────────────────────────────────────────────┤
//! │ Record Space (tiled by records, 8-byte aligned)          │
//! │   [Next][RecLen][KeyLen][DataLen][FullHash][Magic]       │
//! │   [Key][Data][padding][Tailer = total length]            │
//! │   ... repeated until end of file ...                     │
//! └──────────────────────────────────────────────────────────┘
//! ```

mod backend;
pub mod codec;

pub(crate) use backend::Backend;
pub use codec::{ByteOrder, Header, RecordHeader};
