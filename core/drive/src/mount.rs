//! Mount lifecycle of a driver.
//!
//! A [`DriveHost`] binds a [`VaultDriver`] to a native filesystem API and
//! hands back its blocking event loop. [`MountHandle`] runs that loop on a
//! dedicated thread and tears it down with a bounded wait: polite stop, then
//! the host's force path, then detaching the thread. Teardown never fails.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::driver::{DriverOptions, VaultDriver};
use vaultdrive_common::{Error, Result};
use vaultdrive_vault::ContentMap;

/// Default wait for a polite stop.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(2);

/// Default wait after forcing.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Blocking event loop of a bound host.
pub type EventLoop = Box<dyn FnOnce() -> Result<()> + Send>;

/// Callback asking a running event loop to end.
pub type StopHook = Box<dyn FnMut() + Send>;

/// A driver bound to a host, ready to run.
pub struct HostSession {
    event_loop: EventLoop,
    stop: StopHook,
    force: StopHook,
}

impl HostSession {
    /// `stop` asks the loop to return; `force` is the last resort when it
    /// does not.
    pub fn new(event_loop: EventLoop, stop: StopHook, force: StopHook) -> Self {
        Self {
            event_loop,
            stop,
            force,
        }
    }
}

/// Native filesystem API a driver can be served through.
pub trait DriveHost: Send + Sync {
    fn name(&self) -> &str;

    /// Bind `driver` at `mount_point`.
    ///
    /// # Errors
    /// - The host refuses the mount
    fn bind(&self, driver: Arc<VaultDriver>, mount_point: &Path) -> Result<HostSession>;
}

/// Host without an OS binding.
///
/// The loop idles until stopped. The driver stays reachable in-process
/// through [`MountHandle::driver`].
#[derive(Debug, Default, Clone, Copy)]
pub struct HeadlessHost;

impl DriveHost for HeadlessHost {
    fn name(&self) -> &str {
        "headless"
    }

    fn bind(&self, _driver: Arc<VaultDriver>, mount_point: &Path) -> Result<HostSession> {
        let (tx, rx) = mpsc::channel::<()>();
        let force_tx = tx.clone();
        debug!(mount_point = %mount_point.display(), "Bound headless host");

        Ok(HostSession::new(
            Box::new(move || {
                // Returns on a stop signal or once both senders are gone.
                let _ = rx.recv();
                Ok(())
            }),
            Box::new(move || {
                let _ = tx.send(());
            }),
            Box::new(move || {
                let _ = force_tx.send(());
            }),
        ))
    }
}

/// A reserved drive identity and its directory under the mount base.
pub struct MountPoint {
    letter: char,
    path: PathBuf,
    reserved: Arc<Mutex<BTreeSet<char>>>,
}

impl MountPoint {
    pub fn letter(&self) -> char {
        self.letter
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for MountPoint {
    fn drop(&mut self) {
        self.reserved.lock().remove(&self.letter);
        // Leaves the directory alone if a stale mount still occupies it.
        if std::fs::remove_dir(&self.path).is_ok() {
            debug!(path = %self.path.display(), "Removed mount directory");
        }
    }
}

impl std::fmt::Debug for MountPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountPoint")
            .field("letter", &self.letter)
            .field("path", &self.path)
            .finish()
    }
}

/// Hands out free drive identities, `Z` first, down to `D`.
///
/// Clones share reservations.
#[derive(Clone)]
pub struct MountPointAllocator {
    base: PathBuf,
    reserved: Arc<Mutex<BTreeSet<char>>>,
}

impl MountPointAllocator {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            reserved: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Reserve the first free identity.
    ///
    /// An identity is free when no live mount holds it and its directory is
    /// absent or empty.
    ///
    /// # Errors
    /// - Every identity is taken
    /// - The mount directory cannot be created
    pub fn allocate(&self) -> Result<MountPoint> {
        let mut reserved = self.reserved.lock();

        for letter in ('D'..='Z').rev() {
            if reserved.contains(&letter) {
                continue;
            }
            let path = self.base.join(letter.to_string());
            if !is_free_directory(&path) {
                debug!(letter = %letter, "Drive identity occupied");
                continue;
            }

            std::fs::create_dir_all(&path)?;
            reserved.insert(letter);
            debug!(letter = %letter, path = %path.display(), "Reserved drive identity");
            return Ok(MountPoint {
                letter,
                path,
                reserved: Arc::clone(&self.reserved),
            });
        }

        Err(Error::Mount("No free drive identity".to_string()))
    }

    /// Identities currently held.
    pub fn reserved(&self) -> Vec<char> {
        self.reserved.lock().iter().rev().copied().collect()
    }
}

fn is_free_directory(path: &Path) -> bool {
    match std::fs::read_dir(path) {
        Ok(mut entries) => entries.next().is_none(),
        Err(e) => e.kind() == std::io::ErrorKind::NotFound,
    }
}

/// How a mount ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// The loop returned after the polite stop.
    Clean,
    /// The loop returned after the force path.
    Forced,
    /// The loop never returned; its thread was detached.
    Abandoned,
}

/// A running mount.
///
/// Dropping the handle performs [`MountHandle::stop`] with the default waits.
pub struct MountHandle {
    mount_point: MountPoint,
    driver: Arc<VaultDriver>,
    thread: Option<JoinHandle<()>>,
    exited: Receiver<Result<()>>,
    stop: StopHook,
    force: StopHook,
}

impl MountHandle {
    /// Allocate a mount point, bind a driver over `content` and start its
    /// event loop.
    ///
    /// # Errors
    /// - No free mount point
    /// - The host refuses the mount
    /// - The loop thread cannot be spawned
    pub fn start(
        host: &dyn DriveHost,
        allocator: &MountPointAllocator,
        content: ContentMap,
        mut options: DriverOptions,
    ) -> Result<Self> {
        let mount_point = allocator.allocate()?;
        options.identity = Some(mount_point.letter());

        let driver = Arc::new(VaultDriver::new(content, options));
        let session = host.bind(Arc::clone(&driver), mount_point.path())?;
        let HostSession {
            event_loop,
            stop,
            force,
        } = session;

        let (tx, exited) = mpsc::channel();
        let loop_driver = Arc::clone(&driver);
        let thread = thread::Builder::new()
            .name(format!("vaultdrive-{}", mount_point.letter()))
            .spawn(move || {
                loop_driver.mounted();
                let result = event_loop();
                loop_driver.unmounted();
                let _ = tx.send(result);
            })?;

        info!(
            host = host.name(),
            letter = %mount_point.letter(),
            path = %mount_point.path().display(),
            "Mount started"
        );

        Ok(Self {
            mount_point,
            driver,
            thread: Some(thread),
            exited,
            stop,
            force,
        })
    }

    pub fn letter(&self) -> char {
        self.mount_point.letter()
    }

    pub fn mount_point(&self) -> &Path {
        self.mount_point.path()
    }

    pub fn driver(&self) -> &Arc<VaultDriver> {
        &self.driver
    }

    /// Whether the event loop is still running.
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the mount.
    ///
    /// Waits `grace` after the polite stop, then forces and waits
    /// `join_timeout`. A loop that still has not returned is abandoned.
    pub fn stop(mut self, grace: Duration, join_timeout: Duration) -> Teardown {
        self.shutdown(grace, join_timeout)
    }

    fn shutdown(&mut self, grace: Duration, join_timeout: Duration) -> Teardown {
        let Some(thread) = self.thread.take() else {
            return Teardown::Clean;
        };
        let letter = self.mount_point.letter();
        info!(letter = %letter, "Stopping mount");

        (self.stop)();
        if self.wait(grace) {
            let _ = thread.join();
            info!(letter = %letter, "Mount stopped");
            return Teardown::Clean;
        }

        warn!(letter = %letter, grace_ms = grace.as_millis() as u64, "Event loop ignored stop, forcing");
        (self.force)();
        if self.wait(join_timeout) {
            let _ = thread.join();
            info!(letter = %letter, "Mount stopped after forcing");
            return Teardown::Forced;
        }

        warn!(letter = %letter, "Event loop did not stop, abandoning its thread");
        drop(thread);
        self.driver.unmounted();
        Teardown::Abandoned
    }

    /// Wait for the loop to report. Returns whether it ended.
    fn wait(&self, timeout: Duration) -> bool {
        match self.exited.recv_timeout(timeout) {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!(letter = %self.mount_point.letter(), error = %e, "Event loop failed");
                true
            }
            Err(RecvTimeoutError::Timeout) => false,
            // Loop thread panicked before reporting.
            Err(RecvTimeoutError::Disconnected) => true,
        }
    }
}

impl Drop for MountHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.shutdown(DEFAULT_GRACE, DEFAULT_JOIN_TIMEOUT);
        }
    }
}
