//! Block allocator: linear scan for a free block, and release
//! of an entire chain.

use crate::layout;
use crate::region::Offset;

/// Scans the block array from index 0 and returns the offset of the first
/// free block, or `None` if the array is exhausted.
pub fn next_free_block(region: &[u8]) -> Option<Offset> {
    let h = layout::header(region);
    let block_region_offset = { h.block_region_offset };
    let block_count = { h.block_count };
    let block_capacity = { h.block_capacity } as usize;
    let stride = layout::block_stride(block_capacity);
    for i in 0..block_count {
        let off = Offset(block_region_offset + i * stride as u64);
        if layout::block_header(region, off).is_free() {
            return Some(off);
        }
    }
    None
}

/// Derives the number of free blocks without scanning the block array:
/// `block_count - sum over inodes of ceil(payload_bytes /
/// block_capacity)`. This keeps the statfs path O(inodes).
pub fn free_block_count(region: &[u8]) -> u64 {
    let h = layout::header(region);
    let block_count = { h.block_count };
    let inode_count = { h.inode_count };
    let inode_table_offset = { h.inode_table_offset };
    let block_capacity = { h.block_capacity };

    let mut used: u64 = 0;
    for i in 0..inode_count as usize {
        let inode = layout::inode(region, inode_table_offset, i);
        if inode.is_free() {
            continue;
        }
        let payload_bytes = { inode.payload_bytes };
        used += payload_bytes.div_ceil(block_capacity);
    }
    block_count.saturating_sub(used)
}

/// Releases every block in the chain starting at `head`, zeroing each
/// block's header and payload as it goes.
///
/// The next-block offset is captured before the current block is zeroed,
/// so the walk survives the in-place mutation.
pub fn release_chain(region: &mut [u8], head: Offset) {
    let block_capacity = { layout::header(region).block_capacity } as usize;
    let mut cur = head;
    while cur.is_some() {
        let next = { layout::block_header(region, cur).next_block_offset };
        let payload = layout::block_payload_mut(region, cur, block_capacity);
        payload.fill(0);
        let bh = layout::block_header_mut(region, cur);
        bh.in_use = 0;
        bh.data_bytes = 0;
        bh.next_block_offset = 0;
        cur = Offset(next);
    }
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
    fn first_free_block_skips_root() {
        let region = new_region(65536, 64);
        let free = next_free_block(&region).unwrap();
        let h = layout::header(&region);
        assert_ne!(free.as_usize() as u64, { h.block_region_offset });
    }

    #[test]
    fn free_count_ignores_the_empty_roots_reserved_block() {
        let region = new_region(65536, 64);
        let h = layout::header(&region);
        assert_eq!(free_block_count(&region), { h.block_count });
    }

    #[test]
    fn release_chain_frees_every_block() {
        let mut region = new_region(65536, 64);
        let a = next_free_block(&region).unwrap();
        {
            let bh = layout::block_header_mut(&mut region, a);
            bh.in_use = 1;
            bh.data_bytes = 10;
            bh.next_block_offset = 0;
        }
        release_chain(&mut region, a);
        let bh = layout::block_header(&region, a);
        assert!(bh.is_free());
        assert_eq!({ bh.data_bytes }, 0);
    }
}
