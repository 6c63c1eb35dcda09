//! Encoding of merged listings as packed directory records.
//!
//! Record layout, little-endian:
//!
//! ```text
//! u32 fileno | u16 reclen | u8 type | u8 namlen | name | NUL | padding
//! ```
//!
//! `reclen` covers the whole record, rounded up to [`DIRENT_ALIGN`].

use crate::merge::MergedEntry;
use crate::vfs::FileType;

/// Offset of the name within a record.
pub const DIRENT_NAME_OFFS: usize = 8;
/// Records are padded to a multiple of this.
pub const DIRENT_ALIGN: usize = 4;

pub const DT_UNKNOWN: u8 = 0;
pub const DT_DIR: u8 = 4;
pub const DT_REG: u8 = 8;
pub const DT_LNK: u8 = 10;

/// File number reported for the synthesized "." and ".." entries.
const DOT_FILENO: u32 = 2;

/// Longest name a record can hold; `namlen` is a single byte.
pub const DIRENT_NAME_MAX: usize = u8::MAX as usize;

/// The part of `name` a record stores: at most [`DIRENT_NAME_MAX`] bytes,
/// cut at a character boundary.
pub fn stored_name(name: &str) -> &str {
    if name.len() <= DIRENT_NAME_MAX {
        return name;
    }
    let mut end = DIRENT_NAME_MAX;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// Length of the record for a name of `name_len` bytes.
pub fn dirent_len(name_len: usize) -> usize {
    (DIRENT_NAME_OFFS + name_len + 1 + (DIRENT_ALIGN - 1)) & !(DIRENT_ALIGN - 1)
}

pub fn dirent_type(kind: FileType) -> u8 {
    match kind {
        FileType::File => DT_REG,
        FileType::Directory => DT_DIR,
        FileType::Symlink => DT_LNK,
    }
}

/// Byte length of the full listing, "." and ".." included. Reported as
/// the size of a merged directory.
pub fn listing_size(entries: &[MergedEntry]) -> u64 {
    let dots = dirent_len(1) + dirent_len(2);
    let rest: usize = entries.iter().map(|e| dirent_len(stored_name(&e.name).len())).sum();
    (dots + rest) as u64
}

/// A page of encoded records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirentPage {
    pub data: Vec<u8>,
    pub count: usize,
}

struct Record<'a> {
    name: &'a str,
    fileno: u32,
    kind: u8,
}

/// Encode a page of the listing.
///
/// Entries 0 and 1 are "." and ".."; merged entries follow. Starts at
/// `first_entry`, stops after `num_entries` records (`None` for no limit)
/// or before the record that would push the page past `max_bytes` (`0`
/// for no limit).
pub fn encode(
    entries: &[MergedEntry],
    first_entry: usize,
    num_entries: Option<usize>,
    max_bytes: usize,
) -> DirentPage {
    let dots = [(".", 0usize), ("..", 1usize)]
        .into_iter()
        .filter(|(_, index)| *index >= first_entry)
        .map(|(name, _)| Record {
            name,
            fileno: DOT_FILENO,
            kind: DT_DIR,
        });
    let merged = entries.iter().skip(first_entry.saturating_sub(2)).map(|e| Record {
        name: stored_name(&e.name),
        // The record only has room for 32 bits.
        fileno: e.ino as u32,
        kind: dirent_type(e.kind),
    });

    let mut page = DirentPage::default();
    for record in dots.chain(merged) {
        if num_entries.is_some_and(|limit| page.count >= limit) {
            break;
        }
        let len = dirent_len(record.name.len());
        if max_bytes > 0 && page.data.len() + len > max_bytes {
            break;
        }
        write_record(&mut page.data, &record, len);
        page.count += 1;
    }
    page
}

fn write_record(out: &mut Vec<u8>, record: &Record<'_>, len: usize) {
    let start = out.len();
    out.extend_from_slice(&record.fileno.to_le_bytes());
    out.extend_from_slice(&(len as u16).to_le_bytes());
    out.push(record.kind);
    out.push(record.name.len() as u8);
    out.extend_from_slice(record.name.as_bytes());
    out.resize(start + len, 0);
}

/// Iterate over the records in an encoded page as `(fileno, type, name)`.
pub fn decode(data: &[u8]) -> impl Iterator<Item = (u32, u8, String)> + '_ {
    let mut offset = 0;
    std::iter::from_fn(move || {
        let header = data.get(offset..offset + DIRENT_NAME_OFFS)?;
        let fileno = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let reclen = u16::from_le_bytes([header[4], header[5]]) as usize;
        let kind = header[6];
        let namlen = header[7] as usize;
        let name_start = offset + DIRENT_NAME_OFFS;
        let name = data.get(name_start..name_start + namlen)?;
        if reclen == 0 {
            return None;
        }
        offset += reclen;
        Some((fileno, kind, String::from_utf8_lossy(name).into_owned()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, ino: u64, kind: FileType) -> MergedEntry {
        MergedEntry {
            name: name.to_string(),
            ino,
            kind,
        }
    }

    fn sample() -> Vec<MergedEntry> {
        vec![
            entry("a", 10, FileType::File),
            entry("bb", 11, FileType::Directory),
            entry("link", 12, FileType::Symlink),
        ]
    }

    #[test]
    fn test_record_length() {
        assert_eq!(dirent_len(1), 12);
        assert_eq!(dirent_len(2), 12);
        assert_eq!(dirent_len(3), 12);
        assert_eq!(dirent_len(4), 16);
        for n in 0..64 {
            assert_eq!(dirent_len(n) % DIRENT_ALIGN, 0);
            assert!(dirent_len(n) > DIRENT_NAME_OFFS + n);
        }
    }

    #[test]
    fn test_full_listing() {
        let entries = sample();
        let page = encode(&entries, 0, None, 0);
        assert_eq!(page.count, 5);
        assert_eq!(page.data.len() as u64, listing_size(&entries));

        let records: Vec<_> = decode(&page.data).collect();
        assert_eq!(records[0], (2, DT_DIR, ".".to_string()));
        assert_eq!(records[1], (2, DT_DIR, "..".to_string()));
        assert_eq!(records[2], (10, DT_REG, "a".to_string()));
        assert_eq!(records[3], (11, DT_DIR, "bb".to_string()));
        assert_eq!(records[4], (12, DT_LNK, "link".to_string()));
    }

    #[test]
    fn test_paging() {
        let entries = sample();
        let page = encode(&entries, 1, Some(2), 0);
        let names: Vec<_> = decode(&page.data).map(|r| r.2).collect();
        assert_eq!(names, vec!["..", "a"]);

        let page = encode(&entries, 3, None, 0);
        let names: Vec<_> = decode(&page.data).map(|r| r.2).collect();
        assert_eq!(names, vec!["bb", "link"]);

        let page = encode(&entries, 9, None, 0);
        assert_eq!(page, DirentPage::default());
    }

    #[test]
    fn test_byte_budget() {
        let entries = sample();
        // Room for "." and ".." plus one byte: the next record must not be split.
        let page = encode(&entries, 0, None, 25);
        assert_eq!(page.count, 2);
        assert_eq!(page.data.len(), 24);
    }

    #[test]
    fn test_name_is_nul_terminated() {
        let entries = vec![entry("abcd", 1, FileType::File)];
        let page = encode(&entries, 2, None, 0);
        assert_eq!(page.data.len(), 16);
        assert_eq!(&page.data[8..13], b"abcd\0");
    }

    #[test]
    fn test_long_name_is_truncated_consistently() {
        let long = format!("{}é", "x".repeat(254));
        let entries = vec![entry(&long, 7, FileType::File), entry("after", 8, FileType::File)];
        let page = encode(&entries, 2, None, 0);
        assert_eq!(page.data.len() as u64, listing_size(&entries) - 24);

        let records: Vec<_> = decode(&page.data).collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].2, "x".repeat(254));
        assert_eq!(page.data[7] as usize, 254);
        assert_eq!(records[1], (8, DT_REG, "after".to_string()));
    }
}
