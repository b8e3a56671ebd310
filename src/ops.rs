//! Operations layer: the thirteen entry points dispatched
//! by the host.
//!
//! Every function here takes the region as a single `&[u8]`/`&mut [u8]`
//! slice (which already carries both `region_base` and `region_size`) and
//! an `&mut ErrorKind` out-parameter, and reports failure as `None`
//! rather than `-1`, the Rust shape of the error-slot convention
//! described in [`crate::error`]. Byte-count results (`read`/`write`)
//! report failure as `None` and success as `Some(count)`.
//!
//! Callers are expected to have already formatted the region once (via
//! [`layout::attach`]) before dispatching any of these; each entry point
//! still checks the header's magic and fails with `BadFilesystem` rather
//! than operating on an unformatted region, but does not itself choose a
//! block capacity to format with.

use crate::block_alloc;
use crate::dir;
use crate::error::{fail, ErrorKind};
use crate::layout;
use crate::path;
use crate::payload;
use crate::region::validate_name;

/// The kind of entry reported by [`attr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
}

/// Attribute snapshot returned by [`attr`].
#[derive(Debug, Clone, Copy)]
pub struct Attr {
    pub kind: FileKind,
    pub uid: u32,
    pub gid: u32,
    pub link_count: u32,
    pub size: u64,
    pub atime_sec: i64,
    pub atime_nsec: i64,
    pub mtime_sec: i64,
    pub mtime_nsec: i64,
}

/// Summary returned by [`statfs`].
#[derive(Debug, Clone, Copy)]
pub struct StatFs {
    pub block_size: u64,
    pub block_count: u64,
    pub free_blocks: u64,
    pub max_name_len: u64,
}

fn table_offset_or_fail(region: &[u8], err: &mut ErrorKind) -> Option<u64> {
    if !layout::header(region).is_formatted() {
        return fail(err, ErrorKind::BadFilesystem, None);
    }
    Some({ layout::header(region).inode_table_offset })
}

fn now() -> (i64, i64) {
    use std::time::{SystemTime, UNIX_EPOCH};
    let d = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    (d.as_secs() as i64, d.subsec_nanos() as i64)
}

fn touch_atime(region: &mut [u8], table_off: u64, idx: usize) {
    let (sec, nsec) = now();
    let inode = layout::inode_mut(region, table_off, idx);
    inode.atime_sec = sec;
    inode.atime_nsec = nsec;
}

/// Allocates a fresh inode, installs it under `name` in `parent_idx`'s
/// table, and gives it an empty payload. Used by both `mknod` and
/// `mkdir`, and by `rename`'s "create the destination" branches.
fn create_child(
    region: &mut [u8],
    table_off: u64,
    parent_idx: usize,
    name: &str,
    is_dir: bool,
) -> Result<usize, ErrorKind> {
    if !validate_name(name) {
        return Err(ErrorKind::InvalidArgument);
    }
    if dir::lookup(region, table_off, parent_idx, name).is_some() {
        return Err(ErrorKind::AlreadyExists);
    }
    let idx = crate::inode_alloc::next_free_inode(region).ok_or(ErrorKind::NoSpace)?;
    let head = block_alloc::next_free_block(region).ok_or(ErrorKind::NoSpace)?;
    let (sec, nsec) = now();
    {
        let bh = layout::block_header_mut(region, head);
        bh.in_use = 1;
        bh.data_bytes = 0;
        bh.next_block_offset = 0;
    }
    {
        let inode = layout::inode_mut(region, table_off, idx);
        inode.set_name(name);
        inode.is_dir = if is_dir { 1 } else { 0 };
        inode.subdir_count = 0;
        inode.payload_bytes = 0;
        inode.atime_sec = sec;
        inode.atime_nsec = nsec;
        inode.mtime_sec = sec;
        inode.mtime_nsec = nsec;
        inode.first_block_offset = head.as_usize() as u64;
    }
    if let Err(e) = dir::insert(region, table_off, parent_idx, name, idx) {
        free_inode(region, table_off, idx);
        return Err(e);
    }
    if is_dir {
        let parent = layout::inode_mut(region, table_off, parent_idx);
        parent.subdir_count += 1;
    }
    Ok(idx)
}

/// Releases an inode's block chain and resets it to the free state.
fn free_inode(region: &mut [u8], table_off: u64, idx: usize) {
    let head = {
        let inode = layout::inode(region, table_off, idx);
        crate::region::Offset({ inode.first_block_offset })
    };
    block_alloc::release_chain(region, head);
    let inode = layout::inode_mut(region, table_off, idx);
    inode.name = [0; 256];
    inode.is_dir = 0;
    inode.subdir_count = 0;
    inode.payload_bytes = 0;
    inode.first_block_offset = 0;
}

pub fn attr(
    region: &[u8],
    uid: u32,
    gid: u32,
    path_str: &str,
    err: &mut ErrorKind,
) -> Option<Attr> {
    let table_off = table_offset_or_fail(region, err)?;
    let idx = match path::resolve(region, table_off, path_str) {
        Ok(i) => i,
        Err(e) => return fail(err, e, None),
    };
    let inode = layout::inode(region, table_off, idx);
    let is_dir = { inode.is_dir } != 0;
    let link_count = if is_dir {
        { inode.subdir_count } + 2
    } else {
        1
    };
    Some(Attr {
        kind: if is_dir {
            FileKind::Directory
        } else {
            FileKind::Regular
        },
        uid,
        gid,
        link_count,
        size: { inode.payload_bytes },
        atime_sec: { inode.atime_sec },
        atime_nsec: { inode.atime_nsec },
        mtime_sec: { inode.mtime_sec },
        mtime_nsec: { inode.mtime_nsec },
    })
}

pub fn list(region: &[u8], path_str: &str, err: &mut ErrorKind) -> Option<Vec<String>> {
    let table_off = table_offset_or_fail(region, err)?;
    let idx = match path::resolve(region, table_off, path_str) {
        Ok(i) => i,
        Err(e) => return fail(err, e, None),
    };
    let inode = layout::inode(region, table_off, idx);
    if { inode.is_dir } == 0 {
        return fail(err, ErrorKind::InvalidArgument, None);
    }
    Some(
        dir::enumerate(region, table_off, idx)
            .into_iter()
            .map(|e| e.name)
            .collect(),
    )
}

pub fn mknod(region: &mut [u8], path_str: &str, err: &mut ErrorKind) -> Option<()> {
    let table_off = table_offset_or_fail(region, err)?;
    let (parent_idx, name) = match path::resolve_parent(region, table_off, path_str) {
        Ok(v) => v,
        Err(e) => return fail(err, e, None),
    };
    match create_child(region, table_off, parent_idx, name, false) {
        Ok(_) => Some(()),
        Err(e) => fail(err, e, None),
    }
}

pub fn mkdir(region: &mut [u8], path_str: &str, err: &mut ErrorKind) -> Option<()> {
    let table_off = table_offset_or_fail(region, err)?;
    let (parent_idx, name) = match path::resolve_parent(region, table_off, path_str) {
        Ok(v) => v,
        Err(e) => return fail(err, e, None),
    };
    match create_child(region, table_off, parent_idx, name, true) {
        Ok(_) => Some(()),
        Err(e) => fail(err, e, None),
    }
}

pub fn unlink(region: &mut [u8], path_str: &str, err: &mut ErrorKind) -> Option<()> {
    let table_off = table_offset_or_fail(region, err)?;
    let (parent_idx, name) = match path::resolve_parent(region, table_off, path_str) {
        Ok(v) => v,
        Err(e) => return fail(err, e, None),
    };
    let Some(idx) = dir::lookup(region, table_off, parent_idx, name) else {
        return fail(err, ErrorKind::NoSuchEntry, None);
    };
    let inode = layout::inode(region, table_off, idx);
    if { inode.is_dir } != 0 {
        return fail(err, ErrorKind::InvalidArgument, None);
    }
    if let Err(e) = dir::remove(region, table_off, parent_idx, name) {
        return fail(err, e, None);
    }
    free_inode(region, table_off, idx);
    Some(())
}

pub fn rmdir(region: &mut [u8], path_str: &str, err: &mut ErrorKind) -> Option<()> {
    let table_off = table_offset_or_fail(region, err)?;
    let (parent_idx, name) = match path::resolve_parent(region, table_off, path_str) {
        Ok(v) => v,
        Err(e) => return fail(err, e, None),
    };
    let Some(idx) = dir::lookup(region, table_off, parent_idx, name) else {
        return fail(err, ErrorKind::NoSuchEntry, None);
    };
    let inode = layout::inode(region, table_off, idx);
    if { inode.is_dir } == 0 {
        return fail(err, ErrorKind::InvalidArgument, None);
    }
    if { inode.payload_bytes } != 0 {
        return fail(err, ErrorKind::NotEmpty, None);
    }
    if let Err(e) = dir::remove(region, table_off, parent_idx, name) {
        return fail(err, e, None);
    }
    free_inode(region, table_off, idx);
    let parent = layout::inode_mut(region, table_off, parent_idx);
    parent.subdir_count = parent.subdir_count.saturating_sub(1);
    Some(())
}

pub fn rename(region: &mut [u8], from: &str, to: &str, err: &mut ErrorKind) -> Option<()> {
    if from == to {
        return Some(());
    }
    let table_off = table_offset_or_fail(region, err)?;

    let (from_parent, from_name) = match path::resolve_parent(region, table_off, from) {
        Ok(v) => v,
        Err(e) => return fail(err, e, None),
    };
    let Some(from_child) = dir::lookup(region, table_off, from_parent, from_name) else {
        return fail(err, ErrorKind::NoSuchEntry, None);
    };
    let (to_parent, to_name) = match path::resolve_parent(region, table_off, to) {
        Ok(v) => v,
        Err(e) => return fail(err, e, None),
    };
    let to_child = dir::lookup(region, table_off, to_parent, to_name);

    let from_is_dir = { layout::inode(region, table_off, from_child).is_dir } != 0;
    let from_subdir_count = { layout::inode(region, table_off, from_child).subdir_count };
    let contents = payload::read_payload(region, table_off, from_child);

    let dest_idx = if from_is_dir {
        match to_child {
            None => match create_child(region, table_off, to_parent, to_name, true) {
                Ok(idx) => idx,
                Err(e) => return fail(err, e, None),
            },
            Some(idx) => {
                let dest = layout::inode(region, table_off, idx);
                if { dest.is_dir } == 0 || { dest.payload_bytes } != 0 {
                    return fail(err, ErrorKind::InvalidArgument, None);
                }
                idx
            }
        }
    } else {
        match to_child {
            None => match create_child(region, table_off, to_parent, to_name, false) {
                Ok(idx) => idx,
                Err(e) => return fail(err, e, None),
            },
            Some(idx) => {
                let dest = layout::inode(region, table_off, idx);
                if { dest.is_dir } != 0 {
                    return fail(err, ErrorKind::InvalidArgument, None);
                }
                idx
            }
        }
    };

    if payload::set_payload(region, table_off, dest_idx, &contents).is_err() {
        return fail(err, ErrorKind::NoSpace, None);
    }
    if from_is_dir {
        let dest = layout::inode_mut(region, table_off, dest_idx);
        dest.subdir_count = from_subdir_count;
    }
    if let Err(e) = dir::remove(region, table_off, from_parent, from_name) {
        return fail(err, e, None);
    }
    if from_is_dir {
        let parent = layout::inode_mut(region, table_off, from_parent);
        parent.subdir_count = parent.subdir_count.saturating_sub(1);
    }
    free_inode(region, table_off, from_child);
    Some(())
}

pub fn truncate(region: &mut [u8], path_str: &str, n: u64, err: &mut ErrorKind) -> Option<()> {
    let table_off = table_offset_or_fail(region, err)?;
    let idx = match path::resolve(region, table_off, path_str) {
        Ok(i) => i,
        Err(e) => return fail(err, e, None),
    };
    if payload::truncate_payload(region, table_off, idx, n).is_err() {
        return fail(err, ErrorKind::NoSpace, None);
    }
    Some(())
}

pub fn open_check(region: &[u8], path_str: &str, err: &mut ErrorKind) -> Option<()> {
    let table_off = table_offset_or_fail(region, err)?;
    match path::resolve(region, table_off, path_str) {
        Ok(_) => Some(()),
        Err(e) => fail(err, e, None),
    }
}

pub fn read(
    region: &mut [u8],
    path_str: &str,
    buf: &mut [u8],
    offset: u64,
    err: &mut ErrorKind,
) -> Option<usize> {
    let table_off = table_offset_or_fail(region, err)?;
    let idx = match path::resolve(region, table_off, path_str) {
        Ok(i) => i,
        Err(e) => return fail(err, e, None),
    };
    let payload_bytes = { layout::inode(region, table_off, idx).payload_bytes };
    if offset > payload_bytes {
        return fail(err, ErrorKind::TooLarge, None);
    }
    let data = payload::read_payload(region, table_off, idx);
    let start = offset as usize;
    let n = (data.len() - start).min(buf.len());
    buf[..n].copy_from_slice(&data[start..start + n]);
    touch_atime(region, table_off, idx);
    Some(n)
}

pub fn write(
    region: &mut [u8],
    path_str: &str,
    buf: &[u8],
    offset: u64,
    err: &mut ErrorKind,
) -> Option<usize> {
    let table_off = table_offset_or_fail(region, err)?;
    let idx = match path::resolve(region, table_off, path_str) {
        Ok(i) => i,
        Err(e) => return fail(err, e, None),
    };
    let payload_bytes = { layout::inode(region, table_off, idx).payload_bytes };

    let new_payload = if offset == 0 {
        buf.to_vec()
    } else if offset < payload_bytes {
        let mut current = payload::read_payload(region, table_off, idx);
        current.truncate(offset as usize);
        current.extend_from_slice(buf);
        current
    } else {
        return fail(err, ErrorKind::TooLarge, None);
    };

    if payload::set_payload(region, table_off, idx, &new_payload).is_err() {
        return fail(err, ErrorKind::NoSpace, None);
    }
    Some(buf.len())
}

pub fn statfs(region: &[u8], err: &mut ErrorKind) -> Option<StatFs> {
    let _ = table_offset_or_fail(region, err)?;
    let h = layout::header(region);
    Some(StatFs {
        block_size: { h.block_capacity },
        block_count: { h.block_count },
        free_blocks: block_alloc::free_block_count(region),
        max_name_len: crate::region::MAX_NAME_LEN as u64,
    })
}

pub fn utimens(
    region: &mut [u8],
    path_str: &str,
    atime: (i64, i64),
    mtime: (i64, i64),
    err: &mut ErrorKind,
) -> Option<()> {
    let table_off = table_offset_or_fail(region, err)?;
    let idx = match path::resolve(region, table_off, path_str) {
        Ok(i) => i,
        Err(e) => return fail(err, e, None),
    };
    let inode = layout::inode_mut(region, table_off, idx);
    inode.atime_sec = atime.0;
    inode.atime_nsec = atime.1;
    inode.mtime_sec = mtime.0;
    inode.mtime_nsec = mtime.1;
    Some(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout;

    fn new_region(size: usize, block_capacity: usize) -> Vec<u8> {
        let mut region = vec![0u8; size];
        layout::attach(&mut region, block_capacity).unwrap();
        region
    }

    #[test]
    fn scenario_1_empty_root() {
        let region = new_region(65536, 64);
        let mut err = ErrorKind::BadFilesystem;
        assert_eq!(list(&region, "/", &mut err), Some(vec![]));
        let a = attr(&region, 0, 0, "/", &mut err).unwrap();
        assert_eq!(a.kind, FileKind::Directory);
        assert_eq!(a.link_count, 2);
        assert_eq!(a.size, 0);
    }

    #[test]
    fn scenario_2_mkdir() {
        let mut region = new_region(65536, 64);
        let mut err = ErrorKind::BadFilesystem;
        assert_eq!(mkdir(&mut region, "/a", &mut err), Some(()));
        assert_eq!(list(&region, "/", &mut err), Some(vec!["a".to_string()]));
        let a = attr(&region, 0, 0, "/", &mut err).unwrap();
        assert_eq!(a.link_count, 3);
    }

    #[test]
    fn scenario_3_and_4_write_read_offsets() {
        let mut region = new_region(1 << 16, 64);
        let mut err = ErrorKind::BadFilesystem;
        mkdir(&mut region, "/a", &mut err).unwrap();
        mknod(&mut region, "/a/f", &mut err).unwrap();
        assert_eq!(write(&mut region, "/a/f", b"hello", 0, &mut err), Some(5));
        let mut buf = [0u8; 5];
        assert_eq!(read(&mut region, "/a/f", &mut buf, 0, &mut err), Some(5));
        assert_eq!(&buf, b"hello");

        let mut buf2 = [0u8; 5];
        assert_eq!(read(&mut region, "/a/f", &mut buf2, 11, &mut err), None);
        assert_eq!(err, ErrorKind::TooLarge);

        assert_eq!(write(&mut region, "/a/f", b"!", 5, &mut err), None);
        assert_eq!(err, ErrorKind::TooLarge);

        assert_eq!(write(&mut region, "/a/f", b"XYZ", 2, &mut err), Some(3));
        let mut buf3 = [0u8; 8];
        let n = read(&mut region, "/a/f", &mut buf3, 0, &mut err).unwrap();
        assert_eq!(&buf3[..n], b"heXYZ");
    }

    #[test]
    fn scenario_5_truncate() {
        let mut region = new_region(1 << 16, 64);
        let mut err = ErrorKind::BadFilesystem;
        mknod(&mut region, "/f", &mut err).unwrap();
        write(&mut region, "/f", b"heXYZ", 0, &mut err).unwrap();
        truncate(&mut region, "/f", 2, &mut err).unwrap();
        let mut buf = [0u8; 8];
        let n = read(&mut region, "/f", &mut buf, 0, &mut err).unwrap();
        assert_eq!(&buf[..n], b"he");
        truncate(&mut region, "/f", 4, &mut err).unwrap();
        let n = read(&mut region, "/f", &mut buf, 0, &mut err).unwrap();
        assert_eq!(&buf[..n], b"he\0\0");
    }

    #[test]
    fn scenario_6_rmdir_requires_empty() {
        let mut region = new_region(1 << 16, 64);
        let mut err = ErrorKind::BadFilesystem;
        mkdir(&mut region, "/a", &mut err).unwrap();
        mknod(&mut region, "/a/f", &mut err).unwrap();
        assert_eq!(rmdir(&mut region, "/a", &mut err), None);
        assert_eq!(err, ErrorKind::NotEmpty);
        assert_eq!(unlink(&mut region, "/a/f", &mut err), Some(()));
        assert_eq!(rmdir(&mut region, "/a", &mut err), Some(()));
        assert_eq!(list(&region, "/", &mut err), Some(vec![]));
    }

    #[test]
    fn rename_round_trip_restores_payload() {
        let mut region = new_region(1 << 16, 64);
        let mut err = ErrorKind::BadFilesystem;
        mknod(&mut region, "/f", &mut err).unwrap();
        write(&mut region, "/f", b"payload", 0, &mut err).unwrap();
        rename(&mut region, "/f", "/g", &mut err).unwrap();
        rename(&mut region, "/g", "/f", &mut err).unwrap();
        let mut buf = [0u8; 16];
        let n = read(&mut region, "/f", &mut buf, 0, &mut err).unwrap();
        assert_eq!(&buf[..n], b"payload");
    }

    #[test]
    fn rename_of_directory_preserves_subdir_count() {
        let mut region = new_region(1 << 16, 64);
        let mut err = ErrorKind::BadFilesystem;
        mkdir(&mut region, "/a", &mut err).unwrap();
        mkdir(&mut region, "/a/b", &mut err).unwrap();
        rename(&mut region, "/a", "/c", &mut err).unwrap();
        let a = attr(&region, 0, 0, "/c", &mut err).unwrap();
        assert_eq!(a.link_count, 3);
        assert_eq!(list(&region, "/c", &mut err), Some(vec!["b".to_string()]));
    }

    #[test]
    fn mknod_then_rmdir_then_reuse_inode() {
        let mut region = new_region(1 << 16, 64);
        let mut err = ErrorKind::BadFilesystem;
        mkdir(&mut region, "/a", &mut err).unwrap();
        rmdir(&mut region, "/a", &mut err).unwrap();
        assert_eq!(mknod(&mut region, "/b", &mut err), Some(()));
    }

    #[test]
    fn statfs_reports_configured_block_size() {
        let region = new_region(1 << 16, 64);
        let mut err = ErrorKind::BadFilesystem;
        let s = statfs(&region, &mut err).unwrap();
        assert_eq!(s.block_size, 64);
        assert_eq!(s.max_name_len, 255);
    }
}
