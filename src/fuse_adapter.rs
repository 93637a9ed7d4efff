//! The FUSE surface: translates kernel callbacks (which address files by
//! flat inode number) into `ReadPipeline`/`Index` queries (which address
//! them by virtual path), and back.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use fuser::{
    Errno, FileAttr, FileHandle, FileType, Filesystem, FopenFlags, Generation, INodeNo,
    MountOption, OpenFlags, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, Request,
};

use crate::read_pipeline::{NotFoundError, ReadPipeline, VirtualStat};

const TTL: Duration = Duration::from_secs(1);
const ROOT_INO: u64 = 1;

/// Bidirectional virtual-path <-> flat-inode table. FUSE addresses
/// everything by `u64` inode; `Index` addresses everything by path. New
/// inode numbers are minted lazily the first time a path is named back to
/// the kernel (via `lookup` or `readdir`).
struct InodeTable {
    next_ino: AtomicU64,
    path_to_ino: Mutex<HashMap<PathBuf, u64>>,
    ino_to_path: Mutex<HashMap<u64, PathBuf>>,
}

impl InodeTable {
    fn new() -> Self {
        let path_to_ino = HashMap::from([(PathBuf::from("/"), ROOT_INO)]);
        let ino_to_path = HashMap::from([(ROOT_INO, PathBuf::from("/"))]);
        InodeTable {
            next_ino: AtomicU64::new(ROOT_INO + 1),
            path_to_ino: Mutex::new(path_to_ino),
            ino_to_path: Mutex::new(ino_to_path),
        }
    }

    fn ino_for_path(&self, path: &Path) -> u64 {
        let mut p2i = self.path_to_ino.lock().unwrap();
        if let Some(&ino) = p2i.get(path) {
            return ino;
        }
        let ino = self.next_ino.fetch_add(1, Ordering::SeqCst);
        p2i.insert(path.to_path_buf(), ino);
        self.ino_to_path.lock().unwrap().insert(ino, path.to_path_buf());
        ino
    }

    fn path_for_ino(&self, ino: u64) -> Option<PathBuf> {
        self.ino_to_path.lock().unwrap().get(&ino).cloned()
    }
}

fn dir_attr(ino: u64, mount_time: SystemTime) -> FileAttr {
    FileAttr {
        ino: INodeNo(ino),
        size: 0,
        blocks: 0,
        atime: mount_time,
        mtime: mount_time,
        ctime: mount_time,
        crtime: mount_time,
        kind: FileType::Directory,
        perm: 0o755,
        nlink: 2,
        uid: 0,
        gid: 0,
        rdev: 0,
        blksize: 512,
        flags: 0,
    }
}

fn file_attr(ino: u64, stat: &VirtualStat) -> FileAttr {
    FileAttr {
        ino: INodeNo(ino),
        size: stat.size,
        blocks: stat.blocks,
        atime: stat.atime,
        mtime: stat.mtime,
        ctime: stat.ctime,
        crtime: stat.ctime,
        kind: FileType::RegularFile,
        perm: stat.perm as u16,
        nlink: 1,
        uid: stat.uid,
        gid: stat.gid,
        rdev: 0,
        blksize: 512,
        flags: 0,
    }
}

pub struct FreezeFs {
    pipeline: ReadPipeline,
    inodes: InodeTable,
    mount_time: SystemTime,
    /// Write end of a pipe used to signal a waiting parent process that
    /// the mount is established. `None` in foreground mode.
    signal_fd: Option<i32>,
}

impl FreezeFs {
    pub fn new(pipeline: ReadPipeline) -> Self {
        FreezeFs { pipeline, inodes: InodeTable::new(), mount_time: SystemTime::now(), signal_fd: None }
    }

    pub fn with_signal_fd(pipeline: ReadPipeline, signal_fd: i32) -> Self {
        FreezeFs {
            pipeline,
            inodes: InodeTable::new(),
            mount_time: SystemTime::now(),
            signal_fd: Some(signal_fd),
        }
    }

    fn attr_for_path(&self, ino: u64, path: &Path) -> Option<FileAttr> {
        if self.pipeline.is_dir(path) {
            return Some(dir_attr(ino, self.mount_time));
        }
        self.pipeline.stat(path).map(|stat| file_attr(ino, &stat))
    }
}

/// Mount options: read-only, single-threaded, `fsname=freezefs` (a fixed
/// identity, not the source path — matches the original's `fuse_args`),
/// plus a macOS-only `volname` naming the mount point's basename.
pub fn mount_options(mountpoint: &Path) -> Vec<MountOption> {
    let mut options = vec![MountOption::RO, MountOption::FSName("freezefs".to_string())];

    if cfg!(target_os = "macos") {
        let volname = mountpoint.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        options.push(MountOption::CUSTOM(format!("volname={volname}")));
    }

    options
}

impl Filesystem for FreezeFs {
    fn init(&mut self, _req: &Request, _config: &mut fuser::KernelConfig) -> std::io::Result<()> {
        if let Some(fd) = self.signal_fd.take() {
            unsafe {
                let byte = 0u8;
                libc::write(fd, &byte as *const _ as *const _, 1);
                libc::close(fd);
            }
        }
        Ok(())
    }

    fn lookup(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEntry) {
        let Some(parent_path) = self.inodes.path_for_ino(parent.0) else {
            reply.error(Errno::from_i32(libc::ENOENT));
            return;
        };
        let path = parent_path.join(name);
        match self.attr_for_path(self.inodes.ino_for_path(&path), &path) {
            Some(attr) => reply.entry(&TTL, &attr, Generation(0)),
            None => reply.error(Errno::from_i32(libc::ENOENT)),
        }
    }

    fn getattr(&self, _req: &Request, ino: INodeNo, _fh: Option<FileHandle>, reply: ReplyAttr) {
        let Some(path) = self.inodes.path_for_ino(ino.0) else {
            reply.error(Errno::from_i32(libc::ENOENT));
            return;
        };
        match self.attr_for_path(ino.0, &path) {
            Some(attr) => reply.attr(&TTL, &attr),
            None => reply.error(Errno::from_i32(libc::ENOENT)),
        }
    }

    fn open(&self, _req: &Request, ino: INodeNo, _flags: OpenFlags, reply: ReplyOpen) {
        let Some(path) = self.inodes.path_for_ino(ino.0) else {
            reply.error(Errno::from_i32(libc::ENOENT));
            return;
        };
        match self.pipeline.open(&path) {
            Ok(fh) => reply.opened(FileHandle(fh), FopenFlags::empty()),
            Err(e) if e.downcast_ref::<NotFoundError>().is_some() => {
                reply.error(Errno::from_i32(libc::ENOENT));
            }
            Err(e) => {
                log::warn!("open {} failed: {e}", path.display());
                reply.error(Errno::from_i32(libc::EIO));
            }
        }
    }

    fn read(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        offset: u64,
        size: u32,
        _flags: OpenFlags,
        _lock_owner: Option<fuser::LockOwner>,
        reply: ReplyData,
    ) {
        match self.pipeline.read(fh.0, offset, size) {
            Ok(data) => reply.data(&data),
            Err(e) => {
                log::warn!("read fh={} failed: {e}", fh.0);
                reply.error(Errno::from_i32(libc::EIO));
            }
        }
    }

    fn release(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        _flags: OpenFlags,
        _lock_owner: Option<fuser::LockOwner>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.pipeline.release(fh.0);
        reply.ok();
    }

    fn readdir(
        &self,
        _req: &Request,
        ino: INodeNo,
        _fh: FileHandle,
        offset: u64,
        mut reply: ReplyDirectory,
    ) {
        let Some(path) = self.inodes.path_for_ino(ino.0) else {
            reply.error(Errno::from_i32(libc::ENOENT));
            return;
        };
        let Some(children) = self.pipeline.readdir(&path) else {
            reply.error(Errno::from_i32(libc::ENOTDIR));
            return;
        };

        let mut pos = offset;
        if pos == 0 {
            if reply.add(ino, 1, FileType::Directory, ".") {
                reply.ok();
                return;
            }
            pos = 1;
        }
        if pos == 1 {
            if reply.add(ino, 2, FileType::Directory, "..") {
                reply.ok();
                return;
            }
            pos = 2;
        }

        for (i, name) in children.iter().enumerate().skip((pos - 2) as usize) {
            let child_path = path.join(name);
            let child_ino = self.inodes.ino_for_path(&child_path);
            let kind =
                if self.pipeline.is_dir(&child_path) { FileType::Directory } else { FileType::RegularFile };
            if reply.add(INodeNo(child_ino), (i + 3) as u64, kind, name.as_str()) {
                break;
            }
        }
        reply.ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_inode_is_preassigned() {
        let table = InodeTable::new();
        assert_eq!(table.ino_for_path(Path::new("/")), ROOT_INO);
        assert_eq!(table.path_for_ino(ROOT_INO).unwrap(), PathBuf::from("/"));
    }

    #[test]
    fn ino_for_path_is_stable_and_unique() {
        let table = InodeTable::new();
        let a = table.ino_for_path(Path::new("/Album/01.flac"));
        let b = table.ino_for_path(Path::new("/Album/02.flac"));
        let a_again = table.ino_for_path(Path::new("/Album/01.flac"));
        assert_eq!(a, a_again);
        assert_ne!(a, b);
        assert_eq!(table.path_for_ino(a).unwrap(), PathBuf::from("/Album/01.flac"));
    }
}
