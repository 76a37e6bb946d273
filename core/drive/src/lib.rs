//! Virtual drive for unlocked vaults.
//!
//! Serves a vault's in-memory content map as a filesystem:
//! - [`namespace`]: virtual path keys and the directory structure they imply
//! - [`shadow`]: tracking of editor temp files and lock files
//! - [`driver`]: the filesystem callback contract
//! - [`mount`]: mount point allocation and the mount/unmount lifecycle
//! - `fuse`: the FUSE host (requires the "fuse" feature)

pub mod driver;
pub mod mount;
pub mod namespace;
pub mod shadow;

#[cfg(feature = "fuse")]
pub mod fuse;

pub use driver::{
    CreateDisposition, CreateOutcome, DriverError, DriverOptions, DriverResult, EntryInfo,
    ReadOutcome, VaultDriver, VolumeInfo,
};
pub use mount::{
    DriveHost, HeadlessHost, HostSession, MountHandle, MountPoint, MountPointAllocator, Teardown,
    DEFAULT_GRACE, DEFAULT_JOIN_TIMEOUT,
};
pub use shadow::{OfficeSavePolicy, ShadowPolicy, TempFileTracker};

#[cfg(feature = "fuse")]
pub use fuse::{DriveFilesystem, FuseHost, FuseOptions};
