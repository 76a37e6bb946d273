//! FUSE host for the driver.
//!
//! Translates kernel requests into [`VaultDriver`] callbacks. Inode numbers
//! are handed out per virtual path on first lookup and follow renames.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
    TimeOrNow,
};
use tracing::{debug, info, warn};

use crate::driver::{CreateDisposition, DriverError, EntryInfo, ReadOutcome, VaultDriver};
use crate::mount::{DriveHost, HostSession};
use crate::namespace;
use vaultdrive_common::{Error, Result};

const ROOT_INODE: u64 = 1;
const TTL: Duration = Duration::from_secs(1);
const BLOCK_SIZE: u32 = 4096;
const NAME_MAX: u32 = 255;

/// Inode number mapping to virtual keys. The root is the empty key.
struct InodeMap {
    key_to_inode: HashMap<String, u64>,
    inode_to_key: HashMap<u64, String>,
    next_inode: u64,
}

impl InodeMap {
    fn new() -> Self {
        let mut map = Self {
            key_to_inode: HashMap::new(),
            inode_to_key: HashMap::new(),
            next_inode: ROOT_INODE + 1,
        };
        map.key_to_inode.insert(String::new(), ROOT_INODE);
        map.inode_to_key.insert(ROOT_INODE, String::new());
        map
    }

    fn get_or_create(&mut self, key: &str) -> u64 {
        if let Some(&ino) = self.key_to_inode.get(key) {
            return ino;
        }
        let ino = self.next_inode;
        self.next_inode += 1;
        self.key_to_inode.insert(key.to_string(), ino);
        self.inode_to_key.insert(ino, key.to_string());
        ino
    }

    fn key(&self, ino: u64) -> Option<&str> {
        self.inode_to_key.get(&ino).map(String::as_str)
    }

    fn child_key(&self, parent: u64, name: &OsStr) -> std::result::Result<String, i32> {
        let parent = self.key(parent).ok_or(libc::ENOENT)?;
        let name = name.to_str().ok_or(libc::EINVAL)?;
        Ok(namespace::join(parent, name))
    }

    fn remove(&mut self, key: &str) {
        if let Some(ino) = self.key_to_inode.remove(key) {
            self.inode_to_key.remove(&ino);
        }
    }

    /// Re-point `from` and everything below it at `to`.
    fn rename(&mut self, from: &str, to: &str) {
        self.remove(to);
        let prefix = format!("{}{}", from, namespace::SEPARATOR);
        let moved: Vec<(String, u64)> = self
            .key_to_inode
            .iter()
            .filter(|(key, _)| key.as_str() == from || key.starts_with(&prefix))
            .map(|(key, ino)| (key.clone(), *ino))
            .collect();

        for (old, ino) in moved {
            let new = format!("{}{}", to, &old[from.len()..]);
            self.key_to_inode.remove(&old);
            self.key_to_inode.insert(new.clone(), ino);
            self.inode_to_key.insert(ino, new);
        }
    }
}

/// Mount options for the FUSE host.
#[derive(Debug, Clone)]
pub struct FuseOptions {
    /// Allow other users to access the mount.
    pub allow_other: bool,
    /// Unmount when the process exits.
    pub auto_unmount: bool,
}

impl Default for FuseOptions {
    fn default() -> Self {
        Self {
            allow_other: false,
            auto_unmount: true,
        }
    }
}

/// Serves drivers through FUSE.
#[derive(Debug, Clone, Default)]
pub struct FuseHost {
    options: FuseOptions,
}

impl FuseHost {
    pub fn new(options: FuseOptions) -> Self {
        Self { options }
    }

    /// Check if FUSE is available on the system.
    pub fn is_available() -> bool {
        #[cfg(target_os = "linux")]
        {
            Path::new("/dev/fuse").exists()
        }

        #[cfg(target_os = "macos")]
        {
            Path::new("/Library/Filesystems/macfuse.fs").exists()
        }

        #[cfg(not(any(target_os = "linux", target_os = "macos")))]
        {
            false
        }
    }
}

impl DriveHost for FuseHost {
    fn name(&self) -> &str {
        "fuse"
    }

    fn bind(&self, driver: Arc<VaultDriver>, mount_point: &Path) -> Result<HostSession> {
        let mut options = vec![
            MountOption::FSName("vaultdrive".to_string()),
            MountOption::Subtype("vaultdrive".to_string()),
            MountOption::DefaultPermissions,
        ];
        if self.options.allow_other {
            options.push(MountOption::AllowOther);
        }
        if self.options.auto_unmount {
            options.push(MountOption::AutoUnmount);
        }

        let filesystem = DriveFilesystem::new(driver);
        let mut session = fuser::Session::new(filesystem, mount_point, &options).map_err(|e| {
            Error::Mount(format!(
                "FUSE mount at {} failed: {}",
                mount_point.display(),
                e
            ))
        })?;
        let mut unmounter = session.unmount_callable();
        let force_path = mount_point.to_path_buf();
        info!(mount_point = %mount_point.display(), "FUSE session created");

        Ok(HostSession::new(
            Box::new(move || session.run().map_err(Error::Io)),
            Box::new(move || {
                if let Err(e) = unmounter.unmount() {
                    warn!(error = %e, "FUSE unmount request failed");
                }
            }),
            Box::new(move || force_unmount(&force_path)),
        ))
    }
}

/// Detach a mount that refuses to go away.
fn force_unmount(mount_point: &Path) {
    #[cfg(target_os = "linux")]
    let attempts: [(&str, &[&str]); 2] = [("fusermount", &["-uz"]), ("umount", &["-l"])];

    #[cfg(target_os = "macos")]
    let attempts: [(&str, &[&str]); 2] = [("diskutil", &["unmount", "force"]), ("umount", &["-f"])];

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    let attempts: [(&str, &[&str]); 0] = [];

    for (program, args) in attempts {
        match Command::new(program).args(args).arg(mount_point).output() {
            Ok(output) if output.status.success() => {
                debug!(program, mount_point = %mount_point.display(), "Force unmount succeeded");
                return;
            }
            Ok(output) => debug!(program, status = %output.status, "Force unmount attempt failed"),
            Err(e) => debug!(program, error = %e, "Force unmount tool unavailable"),
        }
    }
    warn!(mount_point = %mount_point.display(), "All force unmount attempts failed");
}

/// Kernel-facing adapter around a driver.
pub struct DriveFilesystem {
    driver: Arc<VaultDriver>,
    inodes: InodeMap,
    /// Paths of open file handles.
    open_files: HashMap<u64, String>,
    uid: u32,
    gid: u32,
}

impl DriveFilesystem {
    pub fn new(driver: Arc<VaultDriver>) -> Self {
        Self {
            driver,
            inodes: InodeMap::new(),
            open_files: HashMap::new(),
            // SAFETY: getuid/getgid cannot fail.
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        }
    }

    fn attr(&self, ino: u64, info: &EntryInfo) -> FileAttr {
        let time: SystemTime = info.modified;
        FileAttr {
            ino,
            size: info.size,
            blocks: info.size.div_ceil(u64::from(BLOCK_SIZE)),
            atime: time,
            mtime: time,
            ctime: time,
            crtime: time,
            kind: if info.is_directory {
                FileType::Directory
            } else {
                FileType::RegularFile
            },
            perm: if info.is_directory { 0o755 } else { 0o644 },
            nlink: if info.is_directory { 2 } else { 1 },
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    fn directory_info(&self, key: &str) -> EntryInfo {
        EntryInfo {
            name: namespace::file_name(key).to_string(),
            is_directory: true,
            size: 0,
            modified: self.driver.timestamp(),
        }
    }

    fn key_of(&self, ino: u64) -> std::result::Result<String, i32> {
        self.inodes.key(ino).map(str::to_string).ok_or(libc::ENOENT)
    }

    fn open_key(&mut self, handle: u64, key: String) {
        self.open_files.insert(handle, key);
    }
}

fn disposition_for(flags: i32, creating: bool) -> CreateDisposition {
    let truncate = flags & libc::O_TRUNC != 0;
    match (creating, flags & libc::O_EXCL != 0, truncate) {
        (true, true, _) => CreateDisposition::Create,
        (true, false, true) => CreateDisposition::OverwriteIf,
        (true, false, false) => CreateDisposition::OpenIf,
        (false, _, true) => CreateDisposition::Overwrite,
        (false, _, false) => CreateDisposition::Open,
    }
}

impl Filesystem for DriveFilesystem {
    fn destroy(&mut self) {
        debug!("FUSE session destroyed");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let key = match self.inodes.child_key(parent, name) {
            Ok(key) => key,
            Err(errno) => return reply.error(errno),
        };

        match self.driver.stat(&key) {
            Ok(info) => {
                let ino = self.inodes.get_or_create(&key);
                reply.entry(&TTL, &self.attr(ino, &info), 0);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let key = match self.key_of(ino) {
            Ok(key) => key,
            Err(errno) => return reply.error(errno),
        };

        match self.driver.stat(&key) {
            Ok(info) => reply.attr(&TTL, &self.attr(ino, &info)),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let key = match self.key_of(ino) {
            Ok(key) => key,
            Err(errno) => return reply.error(errno),
        };

        if let Some(size) = size {
            if let Err(e) = self.driver.set_end_of_file(&key, size) {
                return reply.error(e.errno());
            }
        }

        match self.driver.stat(&key) {
            Ok(info) => reply.attr(&TTL, &self.attr(ino, &info)),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let key = match self.key_of(ino) {
            Ok(key) => key,
            Err(errno) => return reply.error(errno),
        };

        let mut children = match self.driver.enumerate(&key) {
            Ok(children) => children,
            Err(e) => return reply.error(e.errno()),
        };
        children.sort_by(|a, b| a.name.cmp(&b.name));

        let parent_ino = if key.is_empty() {
            ROOT_INODE
        } else {
            self.inodes.get_or_create(namespace::parent(&key))
        };

        let mut entries = vec![
            (ino, FileType::Directory, ".".to_string()),
            (parent_ino, FileType::Directory, "..".to_string()),
        ];
        for child in children {
            let child_ino = self.inodes.get_or_create(&namespace::join(&key, &child.name));
            let kind = if child.is_directory {
                FileType::Directory
            } else {
                FileType::RegularFile
            };
            entries.push((child_ino, kind, child.name));
        }

        for (idx, (entry_ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            if reply.add(entry_ino, (idx + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let key = match self.key_of(ino) {
            Ok(key) => key,
            Err(errno) => return reply.error(errno),
        };

        match self.driver.create(&key, disposition_for(flags, false), false) {
            Ok(outcome) => {
                self.open_key(outcome.handle, key);
                reply.opened(outcome.handle, 0);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let key = match self.key_of(ino) {
            Ok(key) => key,
            Err(errno) => return reply.error(errno),
        };
        let Ok(offset) = u64::try_from(offset) else {
            return reply.error(libc::EINVAL);
        };

        match self.driver.read(&key, offset, size as usize) {
            Ok(ReadOutcome::Data(data)) => reply.data(&data),
            Ok(ReadOutcome::EndOfFile) => reply.data(&[]),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let key = match self.key_of(ino) {
            Ok(key) => key,
            Err(errno) => return reply.error(errno),
        };
        let Ok(offset) = u64::try_from(offset) else {
            return reply.error(libc::EINVAL);
        };

        match self.driver.write(&key, offset, data) {
            Ok(written) => reply.written(written as u32),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let key = self
            .open_files
            .remove(&fh)
            .or_else(|| self.inodes.key(ino).map(str::to_string));
        if let Some(key) = key {
            self.driver.close(&key);
        }
        reply.ok();
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let key = match self.inodes.child_key(parent, name) {
            Ok(key) => key,
            Err(errno) => return reply.error(errno),
        };

        let outcome = match self.driver.create(&key, disposition_for(flags, true), false) {
            Ok(outcome) => outcome,
            Err(e) => return reply.error(e.errno()),
        };
        match self.driver.stat(&key) {
            Ok(info) => {
                let ino = self.inodes.get_or_create(&key);
                let attr = self.attr(ino, &info);
                self.open_key(outcome.handle, key);
                reply.created(&TTL, &attr, 0, outcome.handle, 0);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let key = match self.inodes.child_key(parent, name) {
            Ok(key) => key,
            Err(errno) => return reply.error(errno),
        };

        match self.driver.create(&key, CreateDisposition::Create, true) {
            Ok(outcome) if outcome.is_directory && !outcome.existed => {
                let ino = self.inodes.get_or_create(&key);
                let info = self.directory_info(&key);
                reply.entry(&TTL, &self.attr(ino, &info), 0);
            }
            Ok(_) => reply.error(libc::EEXIST),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let key = match self.inodes.child_key(parent, name) {
            Ok(key) => key,
            Err(errno) => return reply.error(errno),
        };

        match self.driver.delete(&key) {
            Ok(()) => {
                self.inodes.remove(&key);
                reply.ok();
            }
            Err(DriverError::AccessDenied) => reply.error(libc::EISDIR),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let key = match self.inodes.child_key(parent, name) {
            Ok(key) => key,
            Err(errno) => return reply.error(errno),
        };

        // A visible directory always has contents.
        match self.driver.stat(&key) {
            Ok(info) if info.is_directory => reply.error(libc::ENOTEMPTY),
            Ok(_) => reply.error(libc::ENOTDIR),
            Err(DriverError::NotFound) => {
                self.inodes.remove(&key);
                reply.ok();
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        let from = match self.inodes.child_key(parent, name) {
            Ok(key) => key,
            Err(errno) => return reply.error(errno),
        };
        let to = match self.inodes.child_key(newparent, newname) {
            Ok(key) => key,
            Err(errno) => return reply.error(errno),
        };

        #[cfg(target_os = "linux")]
        let replace = flags & libc::RENAME_NOREPLACE == 0;
        #[cfg(not(target_os = "linux"))]
        let replace = {
            let _ = flags;
            true
        };

        match self.driver.rename(&from, &to, replace) {
            Ok(()) => {
                self.inodes.rename(&from, &to);
                for path in self.open_files.values_mut() {
                    if *path == from {
                        *path = to.clone();
                    }
                }
                reply.ok();
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        match self.driver.volume_stat() {
            Ok(info) => {
                let block = info.block_size.max(1);
                reply.statfs(
                    info.total / block,
                    info.free / block,
                    info.available / block,
                    0,
                    0,
                    block as u32,
                    NAME_MAX,
                    block as u32,
                );
            }
            Err(e) => reply.error(e.errno()),
        }
    }
}
