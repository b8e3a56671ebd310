//! Host binary: mounts a [`regionfs`] region over FUSE.
//!
//! Everything in this file is explicitly out of scope for the core
//! (`regionfs` the library): option parsing, region acquisition (either
//! an anonymous in-memory buffer or a file-backed memory map), the
//! single filesystem-wide lock serializing every dispatch, and the glue
//! between kernel upcalls and the core's path-based entry points. The
//! core has no notion of a file descriptor or an inode number; this
//! binary keeps a small bidirectional cache between FUSE's `u64` inode
//! numbers and the absolute paths the core understands.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::Parser;
use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyStatfs, ReplyWrite, Request,
};
use log::{debug, warn};
use memmap2::MmapMut;

use regionfs::{error::ErrorKind, layout, ops};

const TTL: Duration = Duration::from_secs(1);
const ROOT_INO: u64 = 1;

/// A filesystem whose entire state lives inside one contiguous memory
/// region, mounted over FUSE.
#[derive(Parser, Debug)]
#[command(name = "regionfs-mount", version, about)]
struct Args {
    /// Directory to mount the filesystem at.
    mountpoint: PathBuf,

    /// Back the region with this file instead of anonymous memory. The
    /// file is created and extended to `--size` bytes if it doesn't
    /// already hold a formatted region.
    #[arg(long)]
    backing_file: Option<PathBuf>,

    /// Region size in bytes, used only when formatting for the first
    /// time.
    #[arg(long, default_value_t = 16 * 1024 * 1024)]
    size: u64,

    /// Block payload size in bytes, used only when formatting for the
    /// first time.
    #[arg(long, default_value_t = layout::DEFAULT_BLOCK_SIZE)]
    block_size: usize,

    /// Increase log verbosity; repeatable (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Owns the backing bytes, however they were acquired.
enum Backing {
    Anonymous(Vec<u8>),
    Mapped(MmapMut),
}

impl Backing {
    fn as_slice(&self) -> &[u8] {
        match self {
            Backing::Anonymous(v) => v,
            Backing::Mapped(m) => m,
        }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            Backing::Anonymous(v) => v,
            Backing::Mapped(m) => m,
        }
    }
}

/// Bidirectional cache between FUSE inode numbers and the absolute paths
/// the core resolves. The root is seeded at construction and never
/// evicted; every other entry is populated lazily as the kernel looks
/// entries up.
struct InoTable {
    next_ino: u64,
    path_to_ino: HashMap<String, u64>,
    ino_to_path: HashMap<u64, String>,
}

impl InoTable {
    fn new() -> Self {
        let mut path_to_ino = HashMap::new();
        let mut ino_to_path = HashMap::new();
        path_to_ino.insert("/".to_string(), ROOT_INO);
        ino_to_path.insert(ROOT_INO, "/".to_string());
        InoTable {
            next_ino: ROOT_INO + 1,
            path_to_ino,
            ino_to_path,
        }
    }

    fn ino_for(&mut self, path: &str) -> u64 {
        if let Some(&ino) = self.path_to_ino.get(path) {
            return ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.path_to_ino.insert(path.to_string(), ino);
        self.ino_to_path.insert(ino, path.to_string());
        ino
    }

    fn path_of(&self, ino: u64) -> Option<&str> {
        self.ino_to_path.get(&ino).map(|s| s.as_str())
    }

    fn forget_path(&mut self, path: &str) {
        if let Some(ino) = self.path_to_ino.remove(path) {
            self.ino_to_path.remove(&ino);
        }
    }

    fn rename_path(&mut self, from: &str, to: &str) {
        if let Some(ino) = self.path_to_ino.remove(from) {
            self.ino_to_path.insert(ino, to.to_string());
            self.path_to_ino.insert(to.to_string(), ino);
        }
    }
}

struct RegionFs {
    region: Mutex<Backing>,
    inos: Mutex<InoTable>,
    uid: u32,
    gid: u32,
}

impl RegionFs {
    fn new(backing: Backing, uid: u32, gid: u32) -> Self {
        RegionFs {
            region: Mutex::new(backing),
            inos: Mutex::new(InoTable::new()),
            uid,
            gid,
        }
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Option<String> {
        let inos = self.inos.lock().unwrap();
        let parent_path = inos.path_of(parent)?;
        let name = name.to_str()?;
        Some(if parent_path == "/" {
            format!("/{name}")
        } else {
            format!("{parent_path}/{name}")
        })
    }

    fn to_file_attr(&self, ino: u64, a: &ops::Attr) -> FileAttr {
        let kind = match a.kind {
            ops::FileKind::Directory => FileType::Directory,
            ops::FileKind::Regular => FileType::RegularFile,
        };
        let perm = match kind {
            FileType::Directory => 0o755,
            _ => 0o644,
        };
        FileAttr {
            ino,
            size: a.size,
            blocks: a.size.div_ceil(512),
            atime: system_time(a.atime_sec, a.atime_nsec),
            mtime: system_time(a.mtime_sec, a.mtime_nsec),
            ctime: system_time(a.mtime_sec, a.mtime_nsec),
            crtime: system_time(a.mtime_sec, a.mtime_nsec),
            kind,
            perm,
            nlink: a.link_count,
            uid: a.uid,
            gid: a.gid,
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }
}

fn system_time(sec: i64, nsec: i64) -> SystemTime {
    if sec >= 0 {
        UNIX_EPOCH + Duration::new(sec as u64, nsec as u32)
    } else {
        UNIX_EPOCH - Duration::new((-sec) as u64, 0)
    }
}

fn errno_for(err: ErrorKind) -> i32 {
    err.to_errno()
}

/// Logs the outcome of a dispatched operation at a level matching its
/// severity: a clean result is `debug`, a failure is `warn` with the
/// errno the caller will see.
fn log_op(op: &str, path: &str, result: Result<(), ErrorKind>) {
    match result {
        Ok(()) => debug!("{op} {path}: ok"),
        Err(e) => warn!("{op} {path}: {e} (errno {})", e.to_errno()),
    }
}

impl Filesystem for RegionFs {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let region = self.region.lock().unwrap();
        let mut err = ErrorKind::NoSuchEntry;
        match ops::attr(region.as_slice(), self.uid, self.gid, &path, &mut err) {
            Some(a) => {
                let ino = self.inos.lock().unwrap().ino_for(&path);
                reply.entry(&TTL, &self.to_file_attr(ino, &a), 0);
            }
            None => reply.error(errno_for(err)),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        let Some(path) = self.inos.lock().unwrap().path_of(ino).map(str::to_string) else {
            reply.error(libc::ENOENT);
            return;
        };
        let region = self.region.lock().unwrap();
        let mut err = ErrorKind::NoSuchEntry;
        match ops::attr(region.as_slice(), self.uid, self.gid, &path, &mut err) {
            Some(a) => reply.attr(&TTL, &self.to_file_attr(ino, &a)),
            None => reply.error(errno_for(err)),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        atime: Option<fuser::TimeOrNow>,
        mtime: Option<fuser::TimeOrNow>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(path) = self.inos.lock().unwrap().path_of(ino).map(str::to_string) else {
            reply.error(libc::ENOENT);
            return;
        };
        let mut region = self.region.lock().unwrap();
        let mut err = ErrorKind::NoSuchEntry;

        if let Some(n) = size {
            if ops::truncate(region.as_mut_slice(), &path, n, &mut err).is_none() {
                reply.error(errno_for(err));
                return;
            }
        }
        if atime.is_some() || mtime.is_some() {
            let now = now_pair();
            let to_pair = |t: fuser::TimeOrNow| match t {
                fuser::TimeOrNow::SpecificTime(st) => time_pair(st),
                fuser::TimeOrNow::Now => now,
            };
            let a = atime.map(to_pair).unwrap_or(now);
            let m = mtime.map(to_pair).unwrap_or(now);
            if ops::utimens(region.as_mut_slice(), &path, a, m, &mut err).is_none() {
                reply.error(errno_for(err));
                return;
            }
        }

        match ops::attr(region.as_slice(), self.uid, self.gid, &path, &mut err) {
            Some(a) => reply.attr(&TTL, &self.to_file_attr(ino, &a)),
            None => reply.error(errno_for(err)),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::EINVAL);
            return;
        };
        let mut region = self.region.lock().unwrap();
        let mut err = ErrorKind::InvalidArgument;
        if ops::mkdir(region.as_mut_slice(), &path, &mut err).is_none() {
            log_op("mkdir", &path, Err(err));
            reply.error(errno_for(err));
            return;
        }
        log_op("mkdir", &path, Ok(()));
        match ops::attr(region.as_slice(), self.uid, self.gid, &path, &mut err) {
            Some(a) => {
                let ino = self.inos.lock().unwrap().ino_for(&path);
                reply.entry(&TTL, &self.to_file_attr(ino, &a), 0);
            }
            None => reply.error(errno_for(err)),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::EINVAL);
            return;
        };
        let mut region = self.region.lock().unwrap();
        let mut err = ErrorKind::InvalidArgument;
        if ops::mknod(region.as_mut_slice(), &path, &mut err).is_none() {
            log_op("mknod", &path, Err(err));
            reply.error(errno_for(err));
            return;
        }
        log_op("mknod", &path, Ok(()));
        match ops::attr(region.as_slice(), self.uid, self.gid, &path, &mut err) {
            Some(a) => {
                let ino = self.inos.lock().unwrap().ino_for(&path);
                reply.entry(&TTL, &self.to_file_attr(ino, &a), 0);
            }
            None => reply.error(errno_for(err)),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::EINVAL);
            return;
        };
        let mut region = self.region.lock().unwrap();
        let mut err = ErrorKind::NoSuchEntry;
        match ops::unlink(region.as_mut_slice(), &path, &mut err) {
            Some(()) => {
                log_op("unlink", &path, Ok(()));
                self.inos.lock().unwrap().forget_path(&path);
                reply.ok();
            }
            None => {
                log_op("unlink", &path, Err(err));
                reply.error(errno_for(err));
            }
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::EINVAL);
            return;
        };
        let mut region = self.region.lock().unwrap();
        let mut err = ErrorKind::NoSuchEntry;
        match ops::rmdir(region.as_mut_slice(), &path, &mut err) {
            Some(()) => {
                log_op("rmdir", &path, Ok(()));
                self.inos.lock().unwrap().forget_path(&path);
                reply.ok();
            }
            None => {
                log_op("rmdir", &path, Err(err));
                reply.error(errno_for(err));
            }
        }
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(from), Some(to)) = (
            self.child_path(parent, name),
            self.child_path(newparent, newname),
        ) else {
            reply.error(libc::EINVAL);
            return;
        };
        let mut region = self.region.lock().unwrap();
        let mut err = ErrorKind::NoSuchEntry;
        match ops::rename(region.as_mut_slice(), &from, &to, &mut err) {
            Some(()) => {
                log_op("rename", &format!("{from} -> {to}"), Ok(()));
                self.inos.lock().unwrap().rename_path(&from, &to);
                reply.ok();
            }
            None => {
                log_op("rename", &format!("{from} -> {to}"), Err(err));
                reply.error(errno_for(err));
            }
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, _flags: i32, reply: fuser::ReplyOpen) {
        let Some(path) = self.inos.lock().unwrap().path_of(ino).map(str::to_string) else {
            reply.error(libc::ENOENT);
            return;
        };
        let region = self.region.lock().unwrap();
        let mut err = ErrorKind::NoSuchEntry;
        match ops::open_check(region.as_slice(), &path, &mut err) {
            Some(()) => reply.opened(0, 0),
            None => reply.error(errno_for(err)),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(path) = self.inos.lock().unwrap().path_of(ino).map(str::to_string) else {
            reply.error(libc::ENOENT);
            return;
        };
        let mut region = self.region.lock().unwrap();
        let mut err = ErrorKind::NoSuchEntry;
        let mut buf = vec![0u8; size as usize];
        match ops::read(
            region.as_mut_slice(),
            &path,
            &mut buf,
            offset as u64,
            &mut err,
        ) {
            Some(n) => reply.data(&buf[..n]),
            None => reply.error(errno_for(err)),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(path) = self.inos.lock().unwrap().path_of(ino).map(str::to_string) else {
            reply.error(libc::ENOENT);
            return;
        };
        let mut region = self.region.lock().unwrap();
        let mut err = ErrorKind::NoSuchEntry;
        match ops::write(region.as_mut_slice(), &path, data, offset as u64, &mut err) {
            Some(n) => reply.written(n as u32),
            None => {
                log_op("write", &path, Err(err));
                reply.error(errno_for(err));
            }
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(path) = self.inos.lock().unwrap().path_of(ino).map(str::to_string) else {
            reply.error(libc::ENOENT);
            return;
        };
        let region = self.region.lock().unwrap();
        let mut err = ErrorKind::NoSuchEntry;
        let Some(names) = ops::list(region.as_slice(), &path, &mut err) else {
            reply.error(errno_for(err));
            return;
        };
        drop(region);

        let mut entries: Vec<(u64, FileType, String)> = vec![
            (ino, FileType::Directory, ".".to_string()),
            (ino, FileType::Directory, "..".to_string()),
        ];
        for name in names {
            let child_path = if path == "/" {
                format!("/{name}")
            } else {
                format!("{path}/{name}")
            };
            let child_ino = self.inos.lock().unwrap().ino_for(&child_path);
            let region = self.region.lock().unwrap();
            let mut err = ErrorKind::NoSuchEntry;
            let kind = match ops::attr(region.as_slice(), self.uid, self.gid, &child_path, &mut err)
            {
                Some(a) => match a.kind {
                    ops::FileKind::Directory => FileType::Directory,
                    ops::FileKind::Regular => FileType::RegularFile,
                },
                None => FileType::RegularFile,
            };
            entries.push((child_ino, kind, name));
        }

        for (i, (ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            if reply.add(ino, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
        let region = self.region.lock().unwrap();
        let mut err = ErrorKind::BadFilesystem;
        match ops::statfs(region.as_slice(), &mut err) {
            Some(s) => reply.statfs(
                s.block_count,
                s.free_blocks,
                s.free_blocks,
                0,
                0,
                s.block_size as u32,
                s.max_name_len as u32,
                s.block_size as u32,
            ),
            None => reply.error(errno_for(err)),
        }
    }
}

fn time_pair(t: SystemTime) -> (i64, i64) {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => (d.as_secs() as i64, d.subsec_nanos() as i64),
        Err(e) => (-(e.duration().as_secs() as i64), 0),
    }
}

fn now_pair() -> (i64, i64) {
    time_pair(SystemTime::now())
}

/// Acquires the backing bytes: an anonymous buffer, or a memory-mapped
/// file grown to `size` bytes if it is not already at least that large.
fn acquire_backing(args: &Args) -> std::io::Result<Backing> {
    match &args.backing_file {
        None => Ok(Backing::Anonymous(vec![0u8; args.size as usize])),
        Some(path) => {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(path)?;
            let current_len = file.metadata()?.len();
            if current_len < args.size {
                file.set_len(args.size)?;
            }
            let mmap = unsafe { MmapMut::map_mut(&file)? };
            Ok(Backing::Mapped(mmap))
        }
    }
}

fn main() {
    let args = Args::parse();

    let level = match args.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new().filter_level(level).init();

    let mut backing = match acquire_backing(&args) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("regionfs-mount: failed to acquire backing storage: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = layout::attach(backing.as_mut_slice(), args.block_size) {
        eprintln!("regionfs-mount: failed to attach region: {e}");
        std::process::exit(1);
    }
    debug!(
        "attached region of {} bytes, block_size={}",
        args.size, args.block_size
    );

    let uid = unsafe { libc::getuid() };
    let gid = unsafe { libc::getgid() };
    let fs = RegionFs::new(backing, uid, gid);

    let options = vec![
        MountOption::FSName("regionfs".to_string()),
        MountOption::AutoUnmount,
    ];
    if let Err(e) = fuser::mount2(fs, &args.mountpoint, &options) {
        warn!("regionfs-mount exited: {e}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_path_joins_root_without_double_slash() {
        let backing = Backing::Anonymous(vec![0u8; 1 << 16]);
        let fs = RegionFs::new(backing, 0, 0);
        let path = fs.child_path(ROOT_INO, OsStr::new("a.txt")).unwrap();
        assert_eq!(path, "/a.txt");
    }
}
