//! Segment file naming.
//!
//! Generations are written in base 36 the way segment-based engines
//! traditionally name their files: commit points are `segments_<gen>`,
//! stored fields of a segment are `_<n>.fdt`, and deletions of a segment at
//! deletion generation `d` are `_<n>_<d>.del`. The `segments.gen` pointer
//! records the newest commit generation and is rewritten on every commit.

use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt};
use lazy_static::lazy_static;
use regex::Regex;

use crate::error::{Result, StratusError};

/// Prefix of commit point files.
pub const SEGMENTS_PREFIX: &str = "segments";

/// Name of the current-generation pointer file.
pub const SEGMENTS_GEN: &str = "segments.gen";

/// Name of the index writer lock.
pub const WRITE_LOCK_NAME: &str = "write.lock";

/// Extension of stored-field files.
pub const STORED_FIELDS_EXTENSION: &str = "fdt";

/// Extension of deletion files.
pub const DELETES_EXTENSION: &str = "del";

/// Returned by [`max_generation`] when no commit point is present.
pub const NO_GENERATION: i64 = -1;

/// Format marker at the head of `segments.gen`.
const GEN_POINTER_FORMAT: i32 = -2;

const RADIX: u64 = 36;

lazy_static! {
    static ref SEGMENTS_FILE: Regex = Regex::new(r"^segments_([0-9a-z]+)$").unwrap();
}

/// Format `value` in base 36.
pub fn to_base36(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        let digit = (value % RADIX) as u32;
        digits.push(char::from_digit(digit, RADIX as u32).unwrap_or('0'));
        value /= RADIX;
    }
    digits.iter().rev().collect()
}

/// Parse a base 36 number.
pub fn parse_base36(text: &str) -> Option<u64> {
    u64::from_str_radix(text, RADIX as u32).ok()
}

/// Name of the commit point file for `generation`.
pub fn segments_file_name(generation: u64) -> String {
    format!("{SEGMENTS_PREFIX}_{}", to_base36(generation))
}

/// Generation encoded in a commit point file name, if `name` is one.
pub fn generation_of(name: &str) -> Option<u64> {
    SEGMENTS_FILE
        .captures(name)
        .and_then(|caps| caps.get(1))
        .and_then(|m| parse_base36(m.as_str()))
}

/// Highest commit generation among `names`, or [`NO_GENERATION`].
pub fn max_generation<I, S>(names: I) -> i64
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    names
        .into_iter()
        .filter_map(|name| generation_of(name.as_ref()))
        .map(|generation| generation as i64)
        .max()
        .unwrap_or(NO_GENERATION)
}

/// Name of segment number `number`, e.g. `_a`.
pub fn segment_name(number: u64) -> String {
    format!("_{}", to_base36(number))
}

/// Stored-field file of a segment.
pub fn stored_fields_file(segment: &str) -> String {
    format!("{segment}.{STORED_FIELDS_EXTENSION}")
}

/// Deletion file of a segment at deletion generation `del_gen`.
pub fn deletes_file(segment: &str, del_gen: u64) -> String {
    format!("{segment}_{}.{DELETES_EXTENSION}", to_base36(del_gen))
}

/// Encode the `segments.gen` pointer. The generation is written twice so a
/// torn write can be detected.
pub fn encode_generation_pointer(generation: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(20);
    buf.extend_from_slice(&GEN_POINTER_FORMAT.to_be_bytes());
    buf.extend_from_slice(&generation.to_be_bytes());
    buf.extend_from_slice(&generation.to_be_bytes());
    buf
}

/// Decode a `segments.gen` pointer written by [`encode_generation_pointer`].
pub fn decode_generation_pointer(bytes: &[u8]) -> Result<u64> {
    let mut cursor = Cursor::new(bytes);
    let format = cursor.read_i32::<BigEndian>()?;
    if format != GEN_POINTER_FORMAT {
        return Err(StratusError::index(format!(
            "{SEGMENTS_GEN} has unknown format {format}"
        )));
    }
    let first = cursor.read_u64::<BigEndian>()?;
    let second = cursor.read_u64::<BigEndian>()?;
    if first != second {
        return Err(StratusError::index(format!(
            "{SEGMENTS_GEN} is torn: {first} != {second}"
        )));
    }
    Ok(first)
}
