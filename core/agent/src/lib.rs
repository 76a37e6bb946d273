//! Management boundary for vaultdrive.
//!
//! [`VaultManager`] owns every known vault and drives the
//! unlock-then-mount and unmount-then-lock sequences. [`AgentSettings`]
//! holds the process configuration.

pub mod manager;
pub mod settings;

pub use manager::{VaultManager, VaultStatus};
pub use settings::{AgentSettings, CONFIG_ENV};
