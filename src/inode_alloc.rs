//! Inode allocator: linear scan for a free inode slot.

use crate::layout;

/// Scans the inode table from index 0 and returns the index of the first
/// free inode (`first_block_offset == 0`), or `None` if the table is
/// exhausted.
pub fn next_free_inode(region: &[u8]) -> Option<usize> {
    let h = layout::header(region);
    let inode_count = { h.inode_count };
    let inode_table_offset = { h.inode_table_offset };
    for i in 0..inode_count as usize {
        if layout::inode(region, inode_table_offset, i).is_free() {
            return Some(i);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_never_offered_as_free() {
        let mut region = vec![0u8; 65536];
        layout::attach(&mut region, 64).unwrap();
        let idx = next_free_inode(&region).unwrap();
        assert_ne!(idx, 0);
    }
}
