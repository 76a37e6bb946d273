//! Vault engine for vaultdrive.
//!
//! This module provides:
//! - The in-memory [`ContentMap`] that backs a mounted drive
//! - The Locked/Unlocked state machine ([`VaultState`])
//! - The per-vault descriptor ([`VaultConfig`])
//!
//! # Architecture
//! Unlocking decodes every document from the encrypted store into the
//! content map. The drive mutates the map in place while mounted. Locking
//! encodes the map back to disk and clears it.

pub mod config;
pub mod content;
pub mod state;

pub use config::{VaultConfig, VaultVersion};
pub use content::{resize_document, write_document, CapacityError, ContentMap, MoveError};
pub use state::{MigrationReport, VaultState};
