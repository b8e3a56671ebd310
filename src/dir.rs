//! Directory table: a directory's payload is plain text, one
//! `NAME:OFFSET\n` line per child, where `OFFSET` is the child's inode
//! index (not a byte offset) rendered in decimal.
//!
//! Lookups match on the `NAME:` prefix and then re-read the candidate
//! inode's own stored name to verify the match, so a name that happens to
//! be a prefix of another (`"foo"` inside `"foobar:3\n"`) can never alias.
//! A malformed line (missing `:`, non-numeric index, out-of-range index)
//! ends enumeration or lookup at that point rather than panicking; it
//! never occurs from this module's own writers, only if the table were
//! corrupted some other way.

use crate::error::ErrorKind;
use crate::layout;
use crate::payload;

/// One decoded entry from a directory table.
pub struct Entry {
    pub name: String,
    pub inode_idx: usize,
}

/// Parses the directory payload text into entries, stopping at the first
/// malformed line.
fn parse(text: &str) -> Vec<Entry> {
    let mut out = Vec::new();
    for line in text.split('\n') {
        if line.is_empty() {
            continue;
        }
        let Some((name, idx_str)) = line.split_once(':') else {
            break;
        };
        let Ok(idx) = idx_str.parse::<usize>() else {
            break;
        };
        out.push(Entry {
            name: name.to_string(),
            inode_idx: idx,
        });
    }
    out
}

/// Renders entries back into directory-table text.
fn render(entries: &[Entry]) -> String {
    let mut out = String::new();
    for e in entries {
        out.push_str(&e.name);
        out.push(':');
        out.push_str(&e.inode_idx.to_string());
        out.push('\n');
    }
    out
}

/// Enumerates the children of the directory inode at `dir_idx`, verifying
/// each against its own stored name. An entry whose target inode is free
/// or whose stored name disagrees is skipped rather than returned (the
/// table and the inode array can only disagree if something upstream is
/// already corrupt, and skipping keeps `list` usable for the rest of the
/// directory).
pub fn enumerate(region: &[u8], inode_table_offset: u64, dir_idx: usize) -> Vec<Entry> {
    let text = payload::read_payload(region, inode_table_offset, dir_idx);
    let text = String::from_utf8_lossy(&text);
    let mut out = Vec::new();
    for e in parse(&text) {
        let inode_count = { layout::header(region).inode_count } as usize;
        if e.inode_idx >= inode_count {
            continue;
        }
        let inode = layout::inode(region, inode_table_offset, e.inode_idx);
        if inode.is_free() {
            continue;
        }
        if inode.name_str() != e.name {
            continue;
        }
        out.push(e);
    }
    out
}

/// Looks up `name` among the children of `dir_idx`, returning the child's
/// inode index.
pub fn lookup(region: &[u8], inode_table_offset: u64, dir_idx: usize, name: &str) -> Option<usize> {
    enumerate(region, inode_table_offset, dir_idx)
        .into_iter()
        .find(|e| e.name == name)
        .map(|e| e.inode_idx)
}

/// Adds a `name -> child_idx` entry to the directory at `dir_idx`.
///
/// Returns `AlreadyExists` if `name` is already present. The table is
/// rewritten in full through [`payload::set_payload`], inheriting its
/// rollback-on-no-space behavior.
pub fn insert(
    region: &mut [u8],
    inode_table_offset: u64,
    dir_idx: usize,
    name: &str,
    child_idx: usize,
) -> Result<(), ErrorKind> {
    let mut entries = enumerate(region, inode_table_offset, dir_idx);
    if entries.iter().any(|e| e.name == name) {
        return Err(ErrorKind::AlreadyExists);
    }
    entries.push(Entry {
        name: name.to_string(),
        inode_idx: child_idx,
    });
    let text = render(&entries);
    payload::set_payload(region, inode_table_offset, dir_idx, text.as_bytes())
}

/// Removes the `name` entry from the directory at `dir_idx`.
///
/// Returns `NoSuchEntry` if `name` is not present.
pub fn remove(
    region: &mut [u8],
    inode_table_offset: u64,
    dir_idx: usize,
    name: &str,
) -> Result<(), ErrorKind> {
    let mut entries = enumerate(region, inode_table_offset, dir_idx);
    let before = entries.len();
    entries.retain(|e| e.name != name);
    if entries.len() == before {
        return Err(ErrorKind::NoSuchEntry);
    }
    let text = render(&entries);
    payload::set_payload(region, inode_table_offset, dir_idx, text.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout;

    fn new_dir_region(size: usize, block_capacity: usize) -> (Vec<u8>, u64) {
        let mut region = vec![0u8; size];
        layout::attach(&mut region, block_capacity).unwrap();
        let off = { layout::header(&region).inode_table_offset };
        (region, off)
    }

    #[test]
    fn insert_then_lookup_round_trips() {
        let (mut region, table_off) = new_dir_region(1 << 16, 64);
        insert(&mut region, table_off, 0, "a.txt", 1).unwrap();
        insert(&mut region, table_off, 0, "b.txt", 2).unwrap();
        assert_eq!(lookup(&region, table_off, 0, "a.txt"), Some(1));
        assert_eq!(lookup(&region, table_off, 0, "b.txt"), Some(2));
        assert_eq!(lookup(&region, table_off, 0, "missing"), None);
    }

    #[test]
    fn insert_duplicate_fails() {
        let (mut region, table_off) = new_dir_region(1 << 16, 64);
        insert(&mut region, table_off, 0, "a.txt", 1).unwrap();
        assert_eq!(
            insert(&mut region, table_off, 0, "a.txt", 2),
            Err(ErrorKind::AlreadyExists)
        );
    }

    #[test]
    fn prefix_names_do_not_alias() {
        // Entries are verified against the child's own stored name, so a
        // literal substring match on "foo:" inside "foobar:2\n" can never
        // resolve "foo" to inode 2's slot by accident.
        let (mut region, table_off) = new_dir_region(1 << 16, 64);
        {
            let inode = layout::inode_mut(&mut region, table_off, 2);
            inode.set_name("foobar");
            inode.is_dir = 0;
            inode.first_block_offset = crate::block_alloc::next_free_block(&region)
                .unwrap()
                .as_usize() as u64;
        }
        insert(&mut region, table_off, 0, "foobar", 2).unwrap();
        assert_eq!(lookup(&region, table_off, 0, "foo"), None);
        assert_eq!(lookup(&region, table_off, 0, "foobar"), Some(2));
    }

    #[test]
    fn remove_missing_entry_fails() {
        let (mut region, table_off) = new_dir_region(1 << 16, 64);
        assert_eq!(
            remove(&mut region, table_off, 0, "nope"),
            Err(ErrorKind::NoSuchEntry)
        );
    }

}
