//! Sort Keys and Comparison
//!
//! The sorter treats records as opaque bytes; ordering comes from a
//! host-supplied [`KeyComparator`]. Comparators work through a reusable
//! [`UnpackedRecord`] scratch: the right-hand key is decoded into the
//! scratch once and compared against as many left-hand keys as the caller
//! likes, which is what lets the tournament tree skip redundant unpacking.
//! Decode failures park an error on the scratch for the caller to inspect.
//!
//! [`TypedKeyComparator`] is the engine's own record format: a fixed number
//! of tagged fields (NULL, integer, text), NULL ordering first.

use super::error::{SortError, SortResult};
use super::pma::{parse_varint, push_varint, VarintParse};
use std::cmp::Ordering;

/// One decoded key field
#[derive(Debug, Clone, PartialEq)]
pub enum SortField {
    Null,
    Int(i64),
    Text(Vec<u8>),
}

impl SortField {
    fn rank(&self) -> u8 {
        match self {
            SortField::Null => 0,
            SortField::Int(_) => 1,
            SortField::Text(_) => 2,
        }
    }

    /// Total order: NULL < integers < text
    pub fn compare(&self, other: &SortField) -> Ordering {
        match (self, other) {
            (SortField::Int(a), SortField::Int(b)) => a.cmp(b),
            (SortField::Text(a), SortField::Text(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

/// Reusable decode scratch sized for one key
#[derive(Debug, Default)]
pub struct UnpackedRecord {
    fields: Vec<SortField>,
    /// Decode failure observed while populating; sticky until taken
    pub err: Option<SortError>,
}

impl UnpackedRecord {
    pub fn with_capacity(n_fields: usize) -> Self {
        UnpackedRecord {
            fields: Vec::with_capacity(n_fields),
            err: None,
        }
    }

    pub fn fields(&self) -> &[SortField] {
        &self.fields
    }
}

/// Host-supplied key ordering
pub trait KeyComparator: Send + Sync {
    /// Number of key fields this comparator expects per record
    fn field_count(&self) -> usize;

    /// Scratch object sized for this comparator's keys
    fn new_scratch(&self) -> UnpackedRecord;

    /// Decode `key` into the scratch, replacing its previous contents.
    /// Failures set `scratch.err`.
    fn populate(&self, scratch: &mut UnpackedRecord, key: &[u8]);

    /// Compare `left` against the populated scratch
    fn compare_with(&self, scratch: &mut UnpackedRecord, left: &[u8]) -> Ordering;

    /// Compare two packed keys over their first `n_fields` fields
    fn compare_prefix(
        &self,
        scratch: &mut UnpackedRecord,
        left: &[u8],
        right: &[u8],
        n_fields: usize,
    ) -> Ordering;

    /// True when any of the first `n_fields` fields of `key` is NULL
    fn contains_null(&self, key: &[u8], n_fields: usize) -> bool;

    /// Full-key comparison through the scratch
    fn compare(&self, scratch: &mut UnpackedRecord, left: &[u8], right: &[u8]) -> Ordering {
        self.populate(scratch, right);
        self.compare_with(scratch, left)
    }
}

// ============================================================================
// The engine's record format
// ============================================================================

const TAG_NULL: u8 = 0;
const TAG_INT: u8 = 1;
const TAG_TEXT: u8 = 2;

/// Encode fields into a packed key
pub fn encode_key(fields: &[SortField]) -> Vec<u8> {
    let mut out = Vec::with_capacity(fields.len() * 4);
    for field in fields {
        match field {
            SortField::Null => out.push(TAG_NULL),
            SortField::Int(v) => {
                out.push(TAG_INT);
                // zigzag so the varint stays compact for negatives
                let zz = ((v << 1) ^ (v >> 63)) as u64;
                push_varint(&mut out, zz);
            }
            SortField::Text(bytes) => {
                out.push(TAG_TEXT);
                push_varint(&mut out, bytes.len() as u64);
                out.extend_from_slice(bytes);
            }
        }
    }
    out
}

fn decode_field(bytes: &[u8]) -> SortResult<(SortField, usize)> {
    let corrupt = || SortError::Corrupt("truncated key field");
    let (&tag, rest) = bytes.split_first().ok_or_else(corrupt)?;
    match tag {
        TAG_NULL => Ok((SortField::Null, 1)),
        TAG_INT => match parse_varint(rest) {
            VarintParse::Complete(zz, n) => {
                let v = ((zz >> 1) as i64) ^ -((zz & 1) as i64);
                Ok((SortField::Int(v), 1 + n))
            }
            _ => Err(corrupt()),
        },
        TAG_TEXT => match parse_varint(rest) {
            VarintParse::Complete(len, n) => {
                let len = len as usize;
                let body = rest.get(n..n + len).ok_or_else(corrupt)?;
                Ok((SortField::Text(body.to_vec()), 1 + n + len))
            }
            _ => Err(corrupt()),
        },
        _ => Err(SortError::Corrupt("unknown key field tag")),
    }
}

/// Decode the first `n_fields` fields of a packed key
pub fn decode_key(bytes: &[u8], n_fields: usize) -> SortResult<Vec<SortField>> {
    let mut fields = Vec::with_capacity(n_fields);
    let mut pos = 0;
    for _ in 0..n_fields {
        let (field, n) = decode_field(&bytes[pos..])?;
        fields.push(field);
        pos += n;
    }
    Ok(fields)
}

/// Comparator over the engine's tagged key format
#[derive(Debug, Clone)]
pub struct TypedKeyComparator {
    n_fields: usize,
}

impl TypedKeyComparator {
    pub fn new(n_fields: usize) -> Self {
        TypedKeyComparator { n_fields }
    }
}

impl KeyComparator for TypedKeyComparator {
    fn field_count(&self) -> usize {
        self.n_fields
    }

    fn new_scratch(&self) -> UnpackedRecord {
        UnpackedRecord::with_capacity(self.n_fields)
    }

    fn populate(&self, scratch: &mut UnpackedRecord, key: &[u8]) {
        scratch.fields.clear();
        let mut pos = 0;
        for _ in 0..self.n_fields {
            match decode_field(&key[pos..]) {
                Ok((field, n)) => {
                    scratch.fields.push(field);
                    pos += n;
                }
                Err(e) => {
                    scratch.err = Some(e);
                    return;
                }
            }
        }
    }

    fn compare_with(&self, scratch: &mut UnpackedRecord, left: &[u8]) -> Ordering {
        let mut pos = 0;
        for right in &scratch.fields {
            let (field, n) = match decode_field(&left[pos..]) {
                Ok(ok) => ok,
                Err(e) => {
                    scratch.err = Some(e);
                    return Ordering::Equal;
                }
            };
            pos += n;
            match field.compare(right) {
                Ordering::Equal => {}
                other => return other,
            }
        }
        Ordering::Equal
    }

    fn compare_prefix(
        &self,
        scratch: &mut UnpackedRecord,
        left: &[u8],
        right: &[u8],
        n_fields: usize,
    ) -> Ordering {
        let (mut lp, mut rp) = (0, 0);
        for _ in 0..n_fields.min(self.n_fields) {
            let (lf, ln) = match decode_field(&left[lp..]) {
                Ok(ok) => ok,
                Err(e) => {
                    scratch.err = Some(e);
                    return Ordering::Equal;
                }
            };
            let (rf, rn) = match decode_field(&right[rp..]) {
                Ok(ok) => ok,
                Err(e) => {
                    scratch.err = Some(e);
                    return Ordering::Equal;
                }
            };
            lp += ln;
            rp += rn;
            match lf.compare(&rf) {
                Ordering::Equal => {}
                other => return other,
            }
        }
        Ordering::Equal
    }

    fn contains_null(&self, key: &[u8], n_fields: usize) -> bool {
        let mut pos = 0;
        for _ in 0..n_fields.min(self.n_fields) {
            match decode_field(&key[pos..]) {
                Ok((SortField::Null, _)) => return true,
                Ok((_, n)) => pos += n,
                Err(_) => return false,
            }
        }
        false
    }
}
