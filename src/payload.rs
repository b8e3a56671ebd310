//! Chained payload I/O: reading and (re)writing the
//! variable-length byte stream stored across an inode's block chain.

use crate::block_alloc;
use crate::error::ErrorKind;
use crate::layout;
use crate::region::Offset;

/// Reads the full logical payload of the inode at `idx` into a fresh
/// `Vec<u8>`, sized to the inode's `payload_bytes`.
///
/// Walks the chain from `first_block_offset`, copying each block's
/// `data_bytes` in order, and stops at the first block whose
/// `next_block_offset` is `0` or whose `data_bytes` is `0`.
pub fn read_payload(region: &[u8], inode_table_offset: u64, idx: usize) -> Vec<u8> {
    let inode = layout::inode(region, inode_table_offset, idx);
    let payload_bytes = { inode.payload_bytes } as usize;
    let block_capacity = { layout::header(region).block_capacity } as usize;
    let mut head = Offset({ inode.first_block_offset });

    let mut out = Vec::with_capacity(payload_bytes);
    while head.is_some() && out.len() < payload_bytes {
        let bh = layout::block_header(region, head);
        let data_bytes = { bh.data_bytes } as usize;
        if data_bytes == 0 {
            break;
        }
        let payload = layout::block_payload(region, head, block_capacity);
        out.extend_from_slice(&payload[..data_bytes.min(payload.len())]);
        let next = { bh.next_block_offset };
        if next == 0 {
            break;
        }
        head = Offset(next);
    }
    out.truncate(payload_bytes);
    out
}

/// Replaces the inode's entire payload with `bytes`.
///
/// If the inode already holds a chain, it is released first (its head
/// block offset is kept around for immediate reuse). On allocation
/// failure partway through a multi-block write, every block acquired
/// during this call is released before returning `NoSpace`, so no
/// partial chain is ever left behind.
pub fn set_payload(
    region: &mut [u8],
    inode_table_offset: u64,
    idx: usize,
    bytes: &[u8],
) -> Result<(), ErrorKind> {
    let block_capacity = { layout::header(region).block_capacity } as usize;
    let reused_head = {
        let inode = layout::inode(region, inode_table_offset, idx);
        Offset({ inode.first_block_offset })
    };
    if reused_head.is_some() {
        block_alloc::release_chain(region, reused_head);
    }

    let result = write_chain(region, bytes, block_capacity, reused_head);
    match result {
        Ok(new_head) => {
            let (sec, nsec) = now();
            let inode = layout::inode_mut(region, inode_table_offset, idx);
            inode.first_block_offset = new_head.as_usize() as u64;
            inode.payload_bytes = bytes.len() as u64;
            inode.mtime_sec = sec;
            inode.mtime_nsec = nsec;
            inode.atime_sec = sec;
            inode.atime_nsec = nsec;
            Ok(())
        }
        Err((e, partial_head)) => {
            if partial_head.is_some() {
                block_alloc::release_chain(region, partial_head);
            }
            let inode = layout::inode_mut(region, inode_table_offset, idx);
            inode.first_block_offset = 0;
            inode.payload_bytes = 0;
            Err(e)
        }
    }
}

/// Writes `bytes` across a freshly acquired block chain.
///
/// `preferred_first` is reused as the head block when available (it was
/// just released by the caller), avoiding a needless free/alloc pair for
/// the common case of overwriting an existing file in place.
///
/// On success, returns the offset of the chain head. On failure, returns
/// the error together with the offset of the partial chain's head, if one
/// was acquired (`Offset::NONE` if the failure happened before any block
/// was touched), so the caller can release the whole attempt in one
/// [`block_alloc::release_chain`] call: every block from that head onward
/// is already linked through `next_block_offset`.
fn write_chain(
    region: &mut [u8],
    bytes: &[u8],
    block_capacity: usize,
    preferred_first: Offset,
) -> Result<Offset, (ErrorKind, Offset)> {
    let first = if preferred_first.is_some() {
        preferred_first
    } else {
        match block_alloc::next_free_block(region) {
            Some(off) => off,
            None => return Err((ErrorKind::NoSpace, Offset::NONE)),
        }
    };

    if bytes.is_empty() {
        let bh = layout::block_header_mut(region, first);
        bh.in_use = 1;
        bh.data_bytes = 0;
        bh.next_block_offset = 0;
        return Ok(first);
    }

    let mut cur = first;
    let mut written = 0usize;
    loop {
        let chunk_len = (bytes.len() - written).min(block_capacity);
        {
            let payload = layout::block_payload_mut(region, cur, block_capacity);
            payload[..chunk_len].copy_from_slice(&bytes[written..written + chunk_len]);
            if chunk_len < payload.len() {
                payload[chunk_len..].fill(0);
            }
        }
        written += chunk_len;
        let remaining = bytes.len() - written;
        if remaining == 0 {
            let bh = layout::block_header_mut(region, cur);
            bh.in_use = 1;
            bh.data_bytes = chunk_len as u64;
            bh.next_block_offset = 0;
            break;
        }

        let next = match block_alloc::next_free_block(region) {
            Some(off) => off,
            None => {
                // Finish initializing the current block before failing so
                // the rollback below walks a well-formed (if short) chain.
                let bh = layout::block_header_mut(region, cur);
                bh.in_use = 1;
                bh.data_bytes = chunk_len as u64;
                bh.next_block_offset = 0;
                return Err((ErrorKind::NoSpace, first));
            }
        };
        {
            let bh = layout::block_header_mut(region, cur);
            bh.in_use = 1;
            bh.data_bytes = chunk_len as u64;
            bh.next_block_offset = next.as_usize() as u64;
        }
        cur = next;
    }
    Ok(first)
}

/// Appends `tail` to the inode's current payload.
pub fn append_payload(
    region: &mut [u8],
    inode_table_offset: u64,
    idx: usize,
    tail: &[u8],
) -> Result<(), ErrorKind> {
    let mut current = read_payload(region, inode_table_offset, idx);
    current.extend_from_slice(tail);
    set_payload(region, inode_table_offset, idx, &current)
}

/// Truncates (or zero-extends) the inode's payload to exactly `n` bytes.
pub fn truncate_payload(
    region: &mut [u8],
    inode_table_offset: u64,
    idx: usize,
    n: u64,
) -> Result<(), ErrorKind> {
    let current = read_payload(region, inode_table_offset, idx);
    let n = n as usize;
    if n as u64 == current.len() as u64 {
        return Ok(());
    }
    let mut new_payload = current;
    if n > new_payload.len() {
        new_payload.resize(n, 0);
    } else {
        new_payload.truncate(n);
    }
    set_payload(region, inode_table_offset, idx, &new_payload)
}

fn now() -> (i64, i64) {
    use std::time::{SystemTime, UNIX_EPOCH};
    let d = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    (d.as_secs() as i64, d.subsec_nanos() as i64)
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
    fn round_trips_small_payload() {
        let mut region = new_region(65536, 16);
        let idx = crate::inode_alloc::next_free_inode(&region).unwrap();
        {
            let h = layout::header(&region);
            let off = h.inode_table_offset;
            let inode = layout::inode_mut(&mut region, off, idx);
            inode.is_dir = 0;
            inode.first_block_offset = crate::block_alloc::next_free_block(&region)
                .map(|o| o.as_usize() as u64)
                .unwrap();
        }
        let h = layout::header(&region);
        let table_off = h.inode_table_offset;
        set_payload(&mut region, table_off, idx, b"hello").unwrap();
        assert_eq!(read_payload(&region, table_off, idx), b"hello");
    }

    #[test]
    fn round_trips_multi_block_payload() {
        let mut region = new_region(1 << 20, 8);
        let idx = crate::inode_alloc::next_free_inode(&region).unwrap();
        let h = layout::header(&region);
        let table_off = h.inode_table_offset;
        let data: Vec<u8> = (0u8..=255).collect();
        set_payload(&mut region, table_off, idx, &data).unwrap();
        assert_eq!(read_payload(&region, table_off, idx), data);
    }

    #[test]
    fn set_payload_twice_does_not_leak_blocks() {
        let mut region = new_region(1 << 16, 8);
        let idx = crate::inode_alloc::next_free_inode(&region).unwrap();
        let h = layout::header(&region);
        let table_off = h.inode_table_offset;
        set_payload(&mut region, table_off, idx, &[1u8; 100]).unwrap();
        let free_after_first = block_alloc::free_block_count(&region);
        set_payload(&mut region, table_off, idx, &[2u8; 100]).unwrap();
        let free_after_second = block_alloc::free_block_count(&region);
        assert_eq!(free_after_first, free_after_second);
    }

    /// Counts blocks actually marked `in_use`, by direct scan rather than
    /// the inode-derived estimate `block_alloc::free_block_count` uses, so
    /// a leaked block with no owning inode cannot hide from this count.
    fn count_in_use_blocks(region: &[u8]) -> u64 {
        let h = layout::header(region);
        let block_region_offset = { h.block_region_offset };
        let block_count = { h.block_count };
        let stride = layout::block_stride({ h.block_capacity } as usize) as u64;
        (0..block_count)
            .filter(|i| {
                let off = crate::region::Offset(block_region_offset + i * stride);
                !layout::block_header(region, off).is_free()
            })
            .count() as u64
    }

    #[test]
    fn set_payload_releases_head_block_on_allocation_exhaustion() {
        let mut region = new_region(1 << 12, 4);
        let idx = crate::inode_alloc::next_free_inode(&region).unwrap();
        let h = layout::header(&region);
        let table_off = h.inode_table_offset;
        let block_count = { h.block_count };
        let block_capacity = { h.block_capacity } as usize;

        let before = count_in_use_blocks(&region);
        let too_big = vec![7u8; (block_count as usize + 8) * block_capacity];
        let result = set_payload(&mut region, table_off, idx, &too_big);
        assert_eq!(result, Err(ErrorKind::NoSpace));

        // Every block acquired for the failed attempt, including the
        // chain's head, must be back on the free list.
        assert_eq!(count_in_use_blocks(&region), before);
    }

    #[test]
    fn truncate_to_zero_then_grow_zero_fills() {
        let mut region = new_region(1 << 16, 8);
        let idx = crate::inode_alloc::next_free_inode(&region).unwrap();
        let h = layout::header(&region);
        let table_off = h.inode_table_offset;
        set_payload(&mut region, table_off, idx, b"heXYZ").unwrap();
        truncate_payload(&mut region, table_off, idx, 2).unwrap();
        assert_eq!(read_payload(&region, table_off, idx), b"he");
        truncate_payload(&mut region, table_off, idx, 4).unwrap();
        assert_eq!(read_payload(&region, table_off, idx), b"he\0\0");
    }
}
