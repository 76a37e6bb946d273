//! Common utilities and types shared across the vaultdrive crates.
//!
//! This module provides foundational types that are used throughout the codebase,
//! ensuring consistency and type safety.

pub mod error;
pub mod types;

pub use error::{Error, PersistFailure, Result};
pub use types::{LockState, VaultId};
