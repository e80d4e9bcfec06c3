//! Parses a table's metadata blob into a `TableDef`.
//!
//! The blob is the concatenation of the table's definition records.  The
//! strict path decodes the standard layout: a fixed header, then field,
//! memo and index entries.  Real corpora contain tables whose definitions
//! exceed the standard layout's assumptions (oversized field arrays,
//! offsets past the record end, truncated name strings); those fall back
//! to a tolerant rescan, and finally to a minimal definition that exposes
//! the whole record as one opaque column so no data is lost.

use byteorder::{LittleEndian, ReadBytesExt};
use serde::Serialize;
use std::io::Cursor;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Definition blob ends inside the fixed header.")]
    TruncatedHeader,
    #[error("Definition blob ends inside a field entry.")]
    TruncatedField,
    #[error("Unknown field type code {0:#x}.")]
    BadFieldType(u8),
    #[error("Field name is not NUL-terminated.")]
    NameNotTerminated,
    #[error("Field extent ({offset}+{length}) exceeds the record length {record_length}.")]
    FieldBeyondRecord {
        offset: u32,
        length: u32,
        record_length: u32,
    },
    #[error("Field has a zero element count.")]
    ZeroElements,
    #[error("Memo section fails its length check.")]
    MemoSection,
    #[error("Index section fails its length check.")]
    IndexSection,
    #[error("No table definition could be recovered (record length {0}).")]
    Unrecoverable(u32),
}

/// Strict parsing distrusts definitions wider than this; the tolerant
/// rescan takes over.
const STRICT_MAX_FIELDS: usize = 30;

/// Hard cap on fields the tolerant rescan will accept.
const RESCAN_MAX_FIELDS: usize = 512;

/// The TopSpeed field data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FieldType {
    Byte,
    Short,
    UShort,
    Date,
    Time,
    Long,
    ULong,
    SReal,
    Double,
    Decimal,
    String,
    CString,
    PString,
    Group,
    Memo,
}

impl FieldType {
    pub fn from_code(code: u8) -> Option<FieldType> {
        match code {
            0x01 => Some(FieldType::Byte),
            0x02 => Some(FieldType::Short),
            0x03 => Some(FieldType::UShort),
            0x04 => Some(FieldType::Date),
            0x05 => Some(FieldType::Time),
            0x06 => Some(FieldType::Long),
            0x07 => Some(FieldType::ULong),
            0x08 => Some(FieldType::SReal),
            0x09 => Some(FieldType::Double),
            0x0a => Some(FieldType::Decimal),
            0x12 => Some(FieldType::String),
            0x13 => Some(FieldType::CString),
            0x14 => Some(FieldType::PString),
            0x16 => Some(FieldType::Group),
            _ => None,
        }
    }

    /// Fixed per-element width, where the type has one.  Strings, BCD and
    /// groups take their width from the definition entry instead.
    pub fn fixed_width(&self) -> Option<u32> {
        match self {
            FieldType::Byte => Some(1),
            FieldType::Short | FieldType::UShort => Some(2),
            FieldType::Date
            | FieldType::Time
            | FieldType::Long
            | FieldType::ULong
            | FieldType::SReal => Some(4),
            FieldType::Double => Some(8),
            FieldType::Decimal
            | FieldType::String
            | FieldType::CString
            | FieldType::PString
            | FieldType::Group
            | FieldType::Memo => None,
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// One field of a table definition.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    pub offset: u32,
    /// Total bytes the field occupies: `element_count` times the element
    /// width.
    pub length: u32,
    pub decimals: Option<u8>,
    pub element_count: u32,
    pub flags: u16,
    pub index: u16,
}

impl FieldDef {
    pub fn is_array(&self) -> bool {
        self.element_count > 1
    }

    /// Width of one element; equal to `length` for scalars.
    pub fn element_width(&self) -> u32 {
        if self.element_count == 0 {
            return self.length;
        }
        self.length / self.element_count
    }

    /// First byte past the field.
    pub fn end(&self) -> u32 {
        self.offset + self.length
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemoDef {
    pub name: String,
    pub flags: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexDef {
    pub name: String,
    pub flags: u16,
    /// Ordinals into `TableDef::fields`.
    pub members: Vec<u16>,
}

/// How the definition was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ParseMode {
    Strict,
    Enhanced,
    /// Nothing could be recovered; the record is exposed as one BLOB.
    Minimal,
}

/// A parsed table definition.  Produced once per table and immutable
/// thereafter.
#[derive(Debug, Clone, PartialEq)]
pub struct TableDef {
    pub table_number: u8,
    pub record_length: u32,
    pub fields: Vec<FieldDef>,
    pub memos: Vec<MemoDef>,
    pub indexes: Vec<IndexDef>,
    /// Retained verbatim so a later release can re-parse with better
    /// heuristics.
    pub raw_definition: Vec<u8>,
    pub parse_mode: ParseMode,
}

fn read_cstring(c: &mut Cursor<&[u8]>) -> Result<String, Error> {
    let data = *c.get_ref();
    let start = c.position() as usize;
    let end = data[start..]
        .iter()
        .position(|&b| b == 0)
        .map(|p| start + p)
        .ok_or(Error::NameNotTerminated)?;
    c.set_position(end as u64 + 1);
    // Names are plain ASCII in practice; anything else is replaced.
    Ok(String::from_utf8_lossy(&data[start..end]).into_owned())
}

/// Tolerant variant: a name running into the end of the blob is accepted
/// as-is, as if NUL padding had been trimmed.
fn read_cstring_tolerant(c: &mut Cursor<&[u8]>) -> String {
    let data = *c.get_ref();
    let start = c.position() as usize;
    match data[start..].iter().position(|&b| b == 0) {
        Some(p) => {
            c.set_position((start + p) as u64 + 1);
            String::from_utf8_lossy(&data[start..start + p]).into_owned()
        }
        None => {
            c.set_position(data.len() as u64);
            String::from_utf8_lossy(&data[start..]).into_owned()
        }
    }
}

/// Strips the `PRE:` ownership prefix Clarion writes before field names.
fn strip_prefix(name: &str) -> String {
    match name.split_once(':') {
        Some((_, rest)) => rest.to_string(),
        None => name.to_string(),
    }
}

struct DefHeader {
    record_length: u32,
    field_count: usize,
    memo_count: usize,
    index_count: usize,
}

fn read_def_header(c: &mut Cursor<&[u8]>) -> Result<DefHeader, Error> {
    let _driver_version = c.read_u16::<LittleEndian>().map_err(|_| Error::TruncatedHeader)?;
    let record_length = c.read_u16::<LittleEndian>().map_err(|_| Error::TruncatedHeader)?;
    let field_count = c.read_u16::<LittleEndian>().map_err(|_| Error::TruncatedHeader)?;
    let memo_count = c.read_u16::<LittleEndian>().map_err(|_| Error::TruncatedHeader)?;
    let index_count = c.read_u16::<LittleEndian>().map_err(|_| Error::TruncatedHeader)?;
    Ok(DefHeader {
        record_length: record_length as u32,
        field_count: field_count as usize,
        memo_count: memo_count as usize,
        index_count: index_count as usize,
    })
}

fn read_field_strict(c: &mut Cursor<&[u8]>, record_length: u32) -> Result<FieldDef, Error> {
    let type_code = c.read_u8().map_err(|_| Error::TruncatedField)?;
    let field_type = FieldType::from_code(type_code).ok_or(Error::BadFieldType(type_code))?;
    let offset = c.read_u16::<LittleEndian>().map_err(|_| Error::TruncatedField)? as u32;
    let name = strip_prefix(&read_cstring(c)?);
    let element_count = c.read_u16::<LittleEndian>().map_err(|_| Error::TruncatedField)? as u32;
    let length = c.read_u16::<LittleEndian>().map_err(|_| Error::TruncatedField)? as u32;
    let flags = c.read_u16::<LittleEndian>().map_err(|_| Error::TruncatedField)?;
    let index = c.read_u16::<LittleEndian>().map_err(|_| Error::TruncatedField)?;
    let decimals = if field_type == FieldType::Decimal {
        Some(c.read_u8().map_err(|_| Error::TruncatedField)?)
    } else {
        None
    };
    if element_count == 0 {
        return Err(Error::ZeroElements);
    }
    if offset + length > record_length {
        return Err(Error::FieldBeyondRecord {
            offset,
            length,
            record_length,
        });
    }
    if let Some(w) = field_type.fixed_width() {
        if length != w * element_count {
            return Err(Error::FieldBeyondRecord {
                offset,
                length,
                record_length,
            });
        }
    }
    Ok(FieldDef {
        name,
        field_type,
        offset,
        length,
        decimals,
        element_count,
        flags,
        index,
    })
}

fn read_memos(c: &mut Cursor<&[u8]>, count: usize) -> Result<Vec<MemoDef>, Error> {
    let mut memos = Vec::with_capacity(count);
    for _ in 0..count {
        let name = read_cstring(c).map_err(|_| Error::MemoSection)?;
        let flags = c.read_u16::<LittleEndian>().map_err(|_| Error::MemoSection)?;
        memos.push(MemoDef { name, flags });
    }
    Ok(memos)
}

fn read_indexes(c: &mut Cursor<&[u8]>, count: usize, field_count: usize) -> Result<Vec<IndexDef>, Error> {
    let mut indexes = Vec::with_capacity(count);
    for _ in 0..count {
        let name = read_cstring(c).map_err(|_| Error::IndexSection)?;
        let flags = c.read_u16::<LittleEndian>().map_err(|_| Error::IndexSection)?;
        let member_count = c.read_u16::<LittleEndian>().map_err(|_| Error::IndexSection)? as usize;
        let mut members = Vec::with_capacity(member_count);
        for _ in 0..member_count {
            let m = c.read_u16::<LittleEndian>().map_err(|_| Error::IndexSection)?;
            if (m as usize) >= field_count {
                return Err(Error::IndexSection);
            }
            members.push(m);
        }
        indexes.push(IndexDef {
            name,
            flags,
            members,
        });
    }
    Ok(indexes)
}

/// Parses a definition blob.
///
/// Falls back internally: strict, then tolerant rescan, then the minimal
/// single-BLOB definition.  Returns an error only when even the minimal
/// definition is impossible (unreadable header or zero record length).
pub fn parse(table_number: u8, raw: &[u8]) -> Result<TableDef, Error> {
    let mut c = Cursor::new(raw);
    let hdr = read_def_header(&mut c)?;
    if hdr.record_length == 0 {
        return Err(Error::Unrecoverable(0));
    }

    if hdr.field_count <= STRICT_MAX_FIELDS {
        match parse_strict(&mut c.clone(), &hdr) {
            Ok((fields, memos, indexes)) => {
                return Ok(TableDef {
                    table_number,
                    record_length: hdr.record_length,
                    fields,
                    memos,
                    indexes,
                    raw_definition: raw.to_vec(),
                    parse_mode: ParseMode::Strict,
                });
            }
            Err(e) => {
                log::debug!(
                    "strict definition parse failed for table {}: {}; rescanning",
                    table_number,
                    e
                );
            }
        }
    } else {
        log::debug!(
            "table {} declares {} fields; taking the tolerant path",
            table_number,
            hdr.field_count
        );
    }

    let fields = rescan_fields(&mut c, &hdr);
    if fields.is_empty() {
        log::warn!(
            "table {}: no field could be recovered; exposing the raw record",
            table_number
        );
        return Ok(TableDef {
            table_number,
            record_length: hdr.record_length,
            fields: vec![],
            memos: vec![],
            indexes: vec![],
            raw_definition: raw.to_vec(),
            parse_mode: ParseMode::Minimal,
        });
    }

    // The memo and index sections keep their strict layout after a
    // tolerant field rescan; when they fail their length checks the
    // definition simply carries none.
    let memos = read_memos(&mut c.clone(), hdr.memo_count).unwrap_or_default();
    let indexes = if memos.len() == hdr.memo_count {
        let mut c2 = c.clone();
        let _ = read_memos(&mut c2, hdr.memo_count);
        read_indexes(&mut c2, hdr.index_count, fields.len()).unwrap_or_default()
    } else {
        vec![]
    };

    Ok(TableDef {
        table_number,
        record_length: hdr.record_length,
        fields,
        memos,
        indexes,
        raw_definition: raw.to_vec(),
        parse_mode: ParseMode::Enhanced,
    })
}

fn parse_strict(
    c: &mut Cursor<&[u8]>,
    hdr: &DefHeader,
) -> Result<(Vec<FieldDef>, Vec<MemoDef>, Vec<IndexDef>), Error> {
    let mut fields = Vec::with_capacity(hdr.field_count);
    for _ in 0..hdr.field_count {
        fields.push(read_field_strict(c, hdr.record_length)?);
    }
    let memos = read_memos(c, hdr.memo_count)?;
    let indexes = read_indexes(c, hdr.index_count, fields.len())?;
    Ok((fields, memos, indexes))
}

/// Tolerant field rescan: truncated names are accepted, offsets are
/// clamped to the record, fields overlapping an earlier field are
/// dropped.  Stops at the first entry that cannot be a field at all.
fn rescan_fields(c: &mut Cursor<&[u8]>, hdr: &DefHeader) -> Vec<FieldDef> {
    let mut fields: Vec<FieldDef> = Vec::new();
    let count = hdr.field_count.min(RESCAN_MAX_FIELDS);
    let mut high_water = 0_u32;
    for _ in 0..count {
        let type_code = match c.read_u8() {
            Ok(t) => t,
            Err(_) => break,
        };
        let field_type = match FieldType::from_code(type_code) {
            Some(t) => t,
            None => break,
        };
        let offset = match c.read_u16::<LittleEndian>() {
            Ok(o) => (o as u32).min(hdr.record_length),
            Err(_) => break,
        };
        let name = strip_prefix(&read_cstring_tolerant(c));
        let element_count = c.read_u16::<LittleEndian>().map(u32::from).unwrap_or(1).max(1);
        let mut length = c.read_u16::<LittleEndian>().map(u32::from).unwrap_or(0);
        let flags = c.read_u16::<LittleEndian>().unwrap_or(0);
        let index = c.read_u16::<LittleEndian>().unwrap_or(0);
        let decimals = if field_type == FieldType::Decimal {
            c.read_u8().ok()
        } else {
            None
        };

        // Clamp the extent to the record.
        if offset + length > hdr.record_length {
            length = hdr.record_length - offset;
        }
        if length == 0 {
            continue;
        }
        // Drop fields that would overlap a prior field.  Groups overlay
        // their members and do not advance the high-water mark.
        if field_type != FieldType::Group {
            if offset < high_water {
                continue;
            }
            high_water = offset + length;
        }
        fields.push(FieldDef {
            name,
            field_type,
            offset,
            length,
            decimals,
            element_count,
            flags,
            index,
        });
    }
    fields
}


#[cfg(test)]
mod tests {
    use super::encode::DefBuilder;
    use super::*;

    #[test]
    fn test_strict_parse_simple_table() {
        let raw = DefBuilder::new(16)
            .field(0x06, 0, "CUS:NUMBER", 1, 4) // LONG
            .field(0x12, 4, "CUS:NAME", 1, 10) // STRING
            .field(0x02, 14, "CUS:AGE", 1, 2) // SHORT
            .key("KEY_NUMBER", &[0])
            .build();
        let def = parse(1, &raw).unwrap();
        assert_eq!(def.parse_mode, ParseMode::Strict);
        assert_eq!(def.record_length, 16);
        assert_eq!(def.fields.len(), 3);
        assert_eq!(def.fields[0].name, "NUMBER");
        assert_eq!(def.fields[0].field_type, FieldType::Long);
        assert_eq!(def.fields[1].name, "NAME");
        assert_eq!(def.fields[1].length, 10);
        assert_eq!(def.fields[2].offset, 14);
        assert_eq!(def.indexes.len(), 1);
        assert_eq!(def.indexes[0].members, vec![0]);
        assert_eq!(def.raw_definition, raw);
    }

    #[test]
    fn test_strict_parse_array_field() {
        let raw = DefBuilder::new(96)
            .field(0x09, 0, "FC:VALUES", 12, 96) // DOUBLE[12]
            .build();
        let def = parse(2, &raw).unwrap();
        assert_eq!(def.parse_mode, ParseMode::Strict);
        assert!(def.fields[0].is_array());
        assert_eq!(def.fields[0].element_count, 12);
        assert_eq!(def.fields[0].element_width(), 8);
    }

    #[test]
    fn test_decimal_carries_decimals() {
        let raw = DefBuilder::new(6)
            .field(0x0a, 0, "AMT", 1, 6)
            .build();
        let def = parse(3, &raw).unwrap();
        assert_eq!(def.fields[0].field_type, FieldType::Decimal);
        assert_eq!(def.fields[0].decimals, Some(2));
    }

    #[test]
    fn test_wide_table_takes_enhanced_path() {
        // 31 BYTE fields: strict distrusts any definition this wide.
        let mut b = DefBuilder::new(31);
        for i in 0..31 {
            b = b.field(0x01, i as u16, &format!("F{}", i + 1), 1, 1);
        }
        let def = parse(4, &b.build()).unwrap();
        assert_eq!(def.parse_mode, ParseMode::Enhanced);
        assert_eq!(def.fields.len(), 31);
    }

    #[test]
    fn test_offset_beyond_record_falls_back() {
        let raw = DefBuilder::new(8)
            .field(0x06, 0, "A", 1, 4)
            .field(0x06, 200, "B", 1, 4) // extent beyond record_length
            .build();
        let def = parse(5, &raw).unwrap();
        assert_eq!(def.parse_mode, ParseMode::Enhanced);
        // B's offset clamps to the record end and its length clamps to 0,
        // so only A survives.
        assert_eq!(def.fields.len(), 1);
        assert_eq!(def.fields[0].name, "A");
    }

    #[test]
    fn test_overlapping_field_dropped_in_rescan() {
        let raw = DefBuilder::new(40)
            .field(0x06, 0, "A", 1, 4)
            .field(0x06, 2, "B", 1, 4) // overlaps A
            .field(0x06, 600, "C", 1, 4) // forces the fallback
            .field(0x06, 4, "D", 1, 4)
            .build();
        let def = parse(6, &raw).unwrap();
        assert_eq!(def.parse_mode, ParseMode::Enhanced);
        let names: Vec<&str> = def.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["A", "D"]);
    }

    #[test]
    fn test_group_may_overlay() {
        let raw = DefBuilder::new(64)
            .field(0x16, 0, "GRP", 1, 8) // GROUP covering two LONGs
            .field(0x06, 0, "A", 1, 4)
            .field(0x06, 4, "B", 1, 4)
            .build();
        let def = parse(7, &raw).unwrap();
        assert_eq!(def.parse_mode, ParseMode::Strict);
        assert_eq!(def.fields.len(), 3);
    }

    #[test]
    fn test_minimal_fallback_when_nothing_recoverable() {
        // Valid header, garbage body.
        let mut raw = DefBuilder::new(2528).build();
        raw.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef, 0xff, 0xff]);
        // Claim one field so both parsers try and fail.
        raw[4] = 1;
        let def = parse(8, &raw).unwrap();
        assert_eq!(def.parse_mode, ParseMode::Minimal);
        assert!(def.fields.is_empty());
        assert_eq!(def.record_length, 2528);
    }

    #[test]
    fn test_unreadable_header_is_unrecoverable() {
        assert!(parse(9, &[0x01, 0x02]).is_err());
    }

    #[test]
    fn test_truncated_memo_section_drops_sections() {
        let raw = DefBuilder::new(600)
            .field(0x06, 0, "A", 1, 4)
            .field(0x06, 580, "B", 1, 4)
            .build();
        // Declare a memo that is not present.
        let mut raw = raw;
        raw[6] = 2; // field_count still 2
        raw[8] = 1; // memo_count = 1, but no memo bytes follow
        let def = parse(10, &raw).unwrap();
        assert_eq!(def.parse_mode, ParseMode::Enhanced);
        assert_eq!(def.fields.len(), 2);
        assert!(def.memos.is_empty());
        assert!(def.indexes.is_empty());
    }
}
