//! On-disk representation of a vault.
//!
//! Every logical document persists as one file carrying the vault's reserved
//! extension. This crate enumerates, reads and writes those files and knows
//! nothing about their encoding.
//!
//! # Layout
//! - `<root>/<virtual path><extension>` for every document
//! - directories mirror the virtual path segments
//! - files without the extension are plaintext awaiting migration
//! - [`DESCRIPTOR_FILE`] at the root is never treated as a document

pub mod local;
pub mod memory;
pub mod store;
pub mod volume;

pub use local::LocalStore;
pub use memory::MemoryStore;
pub use store::{EncryptedFile, EncryptedStore, DEFAULT_EXTENSION, DESCRIPTOR_FILE};
pub use volume::{volume_stats, VolumeStats};
