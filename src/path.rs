//! Path resolver: absolute-path lookup by descending through
//! directory tables starting at inode 0 (root).

use crate::dir;
use crate::error::ErrorKind;
use crate::layout;
use crate::region::ROOT_NAME;

/// Inode index of the root directory. Never reused or freed.
pub const ROOT_IDX: usize = 0;

/// Splits an absolute path into its non-empty components.
///
/// `/` resolves to zero components (the root itself). A path that does
/// not start with `/` is rejected by the caller before this is reached;
/// this function only does the splitting.
fn components(path: &str) -> Vec<&str> {
    path.split('/').filter(|c| !c.is_empty()).collect()
}

/// Resolves `path` to an inode index, descending from the root.
///
/// Every component but the last must name an existing directory;
/// `NoSuchEntry` otherwise. The final component may be a file or a
/// directory.
pub fn resolve(
    region: &[u8],
    inode_table_offset: u64,
    path: &str,
) -> Result<usize, ErrorKind> {
    if !path.starts_with('/') {
        return Err(ErrorKind::InvalidArgument);
    }
    if path == ROOT_NAME {
        return Ok(ROOT_IDX);
    }
    let parts = components(path);
    let mut cur = ROOT_IDX;
    for (i, part) in parts.iter().enumerate() {
        let inode = layout::inode(region, inode_table_offset, cur);
        if inode.is_dir == 0 {
            return Err(ErrorKind::NoSuchEntry);
        }
        let next = dir::lookup(region, inode_table_offset, cur, part)
            .ok_or(ErrorKind::NoSuchEntry)?;
        let _ = i;
        cur = next;
    }
    Ok(cur)
}

/// Resolves the parent directory of `path` and returns `(parent_idx,
/// leaf_name)`, without requiring the leaf itself to exist.
///
/// Used by the creating/removing/renaming operations, which need the
/// parent directory's inode to update its table even when the leaf does
/// not yet exist (`mknod`, `mkdir`) or is about to stop existing
/// (`unlink`, `rmdir`).
pub fn resolve_parent<'a>(
    region: &[u8],
    inode_table_offset: u64,
    path: &'a str,
) -> Result<(usize, &'a str), ErrorKind> {
    if !path.starts_with('/') {
        return Err(ErrorKind::InvalidArgument);
    }
    let parts = components(path);
    let Some((leaf, parent_parts)) = parts.split_last() else {
        // The path is exactly "/"; it has no parent.
        return Err(ErrorKind::InvalidArgument);
    };
    let mut cur = ROOT_IDX;
    for part in parent_parts {
        let inode = layout::inode(region, inode_table_offset, cur);
        if inode.is_dir == 0 {
            return Err(ErrorKind::NoSuchEntry);
        }
        cur = dir::lookup(region, inode_table_offset, cur, part).ok_or(ErrorKind::NoSuchEntry)?;
    }
    let parent_inode = layout::inode(region, inode_table_offset, cur);
    if parent_inode.is_dir == 0 {
        return Err(ErrorKind::NoSuchEntry);
    }
    Ok((cur, leaf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dir;
    use crate::layout;

    fn new_region(size: usize, block_capacity: usize) -> (Vec<u8>, u64) {
        let mut region = vec![0u8; size];
        layout::attach(&mut region, block_capacity).unwrap();
        let off = { layout::header(&region).inode_table_offset };
        (region, off)
    }

    fn make_dir(region: &mut [u8], table_off: u64, parent: usize, name: &str) -> usize {
        let idx = crate::inode_alloc::next_free_inode(region).unwrap();
        {
            let inode = layout::inode_mut(region, table_off, idx);
            inode.set_name(name);
            inode.is_dir = 1;
            inode.first_block_offset = crate::block_alloc::next_free_block(region)
                .unwrap()
                .as_usize() as u64;
        }
        dir::insert(region, table_off, parent, name, idx).unwrap();
        idx
    }

    #[test]
    fn root_resolves_to_zero() {
        let (region, table_off) = new_region(1 << 16, 64);
        assert_eq!(resolve(&region, table_off, "/").unwrap(), ROOT_IDX);
    }

    #[test]
    fn nested_path_resolves() {
        let (mut region, table_off) = new_region(1 << 20, 64);
        let a = make_dir(&mut region, table_off, ROOT_IDX, "a");
        let b = make_dir(&mut region, table_off, a, "b");
        let file_idx = crate::inode_alloc::next_free_inode(&region).unwrap();
        {
            let inode = layout::inode_mut(&mut region, table_off, file_idx);
            inode.set_name("c.txt");
            inode.is_dir = 0;
            inode.first_block_offset = crate::block_alloc::next_free_block(&region)
                .unwrap()
                .as_usize() as u64;
        }
        dir::insert(&mut region, table_off, b, "c.txt", file_idx).unwrap();

        assert_eq!(resolve(&region, table_off, "/a/b/c.txt").unwrap(), file_idx);
    }

    #[test]
    fn missing_component_is_no_such_entry() {
        let (region, table_off) = new_region(1 << 16, 64);
        assert_eq!(
            resolve(&region, table_off, "/nope"),
            Err(ErrorKind::NoSuchEntry)
        );
    }

    #[test]
    fn resolve_parent_splits_leaf() {
        let (mut region, table_off) = new_region(1 << 20, 64);
        let a = make_dir(&mut region, table_off, ROOT_IDX, "a");
        let (parent, leaf) = resolve_parent(&region, table_off, "/a/new.txt").unwrap();
        assert_eq!(parent, a);
        assert_eq!(leaf, "new.txt");
    }

    #[test]
    fn resolve_parent_of_root_is_invalid() {
        let (region, table_off) = new_region(1 << 16, 64);
        assert_eq!(
            resolve_parent(&region, table_off, "/"),
            Err(ErrorKind::InvalidArgument)
        );
    }
}
