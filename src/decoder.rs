//! Decodes raw record bytes into typed values using a table definition.
//!
//! Scalars decode by field type at their byte offset; arrays extract
//! `element_count` elements and serialize them as one JSON string.  The
//! all-0xFF DOUBLE is the TopSpeed missing-value sentinel and decodes to
//! `Null`, which is distinct from a decoded 0.0; conflating the two
//! corrupts downstream statistics silently.

use byteorder::{ByteOrder, LittleEndian};
use lazy_static::lazy_static;

use crate::arrays::{ArrayFieldInfo, ArrayKind};
use crate::codepage::CodePage;
use crate::schema::{ColumnKind, ColumnPlan};
use crate::table_def::{FieldDef, FieldType, TableDef};
use crate::value::Value;

lazy_static! {
    /// Day zero of the Clarion standard date.
    static ref CLARION_EPOCH: chrono::NaiveDate =
        chrono::NaiveDate::from_ymd_opt(1800, 12, 28).unwrap();
}

/// The DOUBLE missing-value sentinel.
const DOUBLE_NULL: [u8; 8] = [0xff; 8];

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum FieldError {
    #[error("Field bytes end at {end} but the record has {len}.")]
    OutOfBounds { end: usize, len: usize },
    #[error("Packed decimal contains the non-digit nibble {0:#x}.")]
    BadBcdNibble(u8),
    #[error("Date value {0} is out of range.")]
    BadDate(u32),
    #[error("Time value {0} is out of range.")]
    BadTime(u32),
    #[error("Field type {0} carries no scalar value.")]
    NotScalar(FieldType),
}

/// A per-record decode failure.  Carries the raw bytes so a recovery pass
/// can revisit the record later.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("Cannot decode field {field_index} ({field_name}): {source}")]
pub struct RowDecodeError {
    pub field_index: usize,
    pub field_name: String,
    pub raw: Vec<u8>,
    #[source]
    pub source: FieldError,
}

/// Decodes one table's records against an immutable column plan.
pub struct RecordDecoder<'a> {
    def: &'a TableDef,
    arrays: &'a [ArrayFieldInfo],
    columns: &'a [ColumnPlan],
    codepage: CodePage,
}

impl<'a> RecordDecoder<'a> {
    pub fn new(
        def: &'a TableDef,
        arrays: &'a [ArrayFieldInfo],
        columns: &'a [ColumnPlan],
        codepage: CodePage,
    ) -> RecordDecoder<'a> {
        RecordDecoder {
            def,
            arrays,
            columns,
            codepage,
        }
    }

    /// Decodes a record into one value per planned column, in column
    /// order.  `memos` carries the memo payloads for this record, indexed
    /// by memo ordinal.
    pub fn decode(
        &self,
        payload: &[u8],
        memos: &[Option<Vec<u8>>],
    ) -> Result<Vec<Value>, RowDecodeError> {
        let mut row = Vec::with_capacity(self.columns.len());
        for (ci, col) in self.columns.iter().enumerate() {
            row.push(self.decode_column(ci, col, payload, memos)?);
        }
        Ok(row)
    }

    /// Decodes as much of a record as possible.  Failed columns become
    /// `Null`; the errors are returned alongside the row.
    pub fn decode_partial(
        &self,
        payload: &[u8],
        memos: &[Option<Vec<u8>>],
    ) -> (Vec<Value>, Vec<RowDecodeError>) {
        let mut row = Vec::with_capacity(self.columns.len());
        let mut errors = Vec::new();
        for (ci, col) in self.columns.iter().enumerate() {
            match self.decode_column(ci, col, payload, memos) {
                Ok(v) => row.push(v),
                Err(e) => {
                    errors.push(e);
                    row.push(Value::Null);
                }
            }
        }
        (row, errors)
    }

    fn decode_column(
        &self,
        column_index: usize,
        col: &ColumnPlan,
        payload: &[u8],
        memos: &[Option<Vec<u8>>],
    ) -> Result<Value, RowDecodeError> {
        match &col.kind {
            ColumnKind::Scalar { field } => {
                let f = &self.def.fields[*field];
                self.scalar_at(f, f.offset as usize, f.length as usize, payload)
                    .map_err(|e| self.row_error(column_index, &f.name, payload, e))
            }
            ColumnKind::Array { array } => {
                let info = &self.arrays[*array];
                self.decode_array(info, payload)
                    .map_err(|e| self.row_error(column_index, &info.base_name, payload, e))
            }
            ColumnKind::Memo { memo } => Ok(match memos.get(*memo).and_then(|m| m.as_ref()) {
                Some(bytes) => Value::Blob(bytes.clone()),
                None => Value::Null,
            }),
            ColumnKind::RawRecord => Ok(Value::Blob(payload.to_vec())),
        }
    }

    fn row_error(
        &self,
        field_index: usize,
        field_name: &str,
        payload: &[u8],
        source: FieldError,
    ) -> RowDecodeError {
        RowDecodeError {
            field_index,
            field_name: field_name.to_string(),
            raw: payload.to_vec(),
            source,
        }
    }

    fn scalar_at(
        &self,
        f: &FieldDef,
        offset: usize,
        width: usize,
        payload: &[u8],
    ) -> Result<Value, FieldError> {
        let end = offset + width;
        let bytes = payload.get(offset..end).ok_or(FieldError::OutOfBounds {
            end,
            len: payload.len(),
        })?;
        decode_scalar(f.field_type, bytes, f.decimals.unwrap_or(0), &self.codepage)
    }

    /// Extracts every element of an array and serializes them as a JSON
    /// array string, in element order.
    fn decode_array(&self, info: &ArrayFieldInfo, payload: &[u8]) -> Result<Value, FieldError> {
        let mut elements = Vec::with_capacity(info.element_count as usize);
        match info.kind {
            ArrayKind::SingleField => {
                let f = &self.def.fields[info.members[0]];
                let stride = f.element_width() as usize;
                for i in 0..info.element_count as usize {
                    let v = self.scalar_at(f, f.offset as usize + i * stride, stride, payload)?;
                    elements.push(element_to_json(info.element_type, v));
                }
            }
            ArrayKind::MultiField => {
                for &m in &info.members {
                    let f = &self.def.fields[m];
                    let v = self.scalar_at(f, f.offset as usize, f.length as usize, payload)?;
                    elements.push(element_to_json(info.element_type, v));
                }
            }
        }
        Ok(Value::Text(serde_json::Value::Array(elements).to_string()))
    }
}

/// JSON representation of one array element.  BYTE elements read as flags
/// and serialize as booleans; a missing DOUBLE stays null.
fn element_to_json(element_type: FieldType, v: Value) -> serde_json::Value {
    if element_type == FieldType::Byte {
        return match v {
            Value::Int(n) => serde_json::Value::Bool(n != 0),
            other => other.to_json(),
        };
    }
    v.to_json()
}

/// Decodes one scalar element from its raw bytes.
///
/// This is the single point of truth for TopSpeed type semantics; both
/// scalar columns and array elements come through here.
pub fn decode_scalar(
    t: FieldType,
    bytes: &[u8],
    decimals: u8,
    codepage: &CodePage,
) -> Result<Value, FieldError> {
    // Tolerantly rescanned definitions can declare a field narrower than
    // its type; that is a field error, not a panic.
    let min_width = match t {
        FieldType::Decimal | FieldType::PString => 1,
        other => other.fixed_width().unwrap_or(0) as usize,
    };
    if bytes.len() < min_width {
        return Err(FieldError::OutOfBounds {
            end: min_width,
            len: bytes.len(),
        });
    }
    match t {
        FieldType::Byte => Ok(Value::Int(bytes[0] as i64)),
        FieldType::Short => Ok(Value::Int(LittleEndian::read_i16(bytes) as i64)),
        FieldType::UShort => Ok(Value::Int(LittleEndian::read_u16(bytes) as i64)),
        FieldType::Long => Ok(Value::Int(LittleEndian::read_i32(bytes) as i64)),
        FieldType::ULong => Ok(Value::Int(LittleEndian::read_u32(bytes) as i64)),
        FieldType::SReal => Ok(Value::Real(LittleEndian::read_f32(bytes) as f64)),
        FieldType::Double => {
            if bytes == DOUBLE_NULL {
                Ok(Value::Null)
            } else {
                Ok(Value::Real(LittleEndian::read_f64(bytes)))
            }
        }
        FieldType::Decimal => decode_bcd(bytes, decimals),
        FieldType::Date => decode_date(LittleEndian::read_u32(bytes)),
        FieldType::Time => decode_time(LittleEndian::read_u32(bytes)),
        FieldType::String => {
            let s = codepage.decode(bytes);
            Ok(Value::Text(s.trim_end_matches(['\0', ' ']).to_string()))
        }
        FieldType::CString => {
            let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
            Ok(Value::Text(codepage.decode(&bytes[..end])))
        }
        FieldType::PString => {
            let len = (bytes[0] as usize).min(bytes.len().saturating_sub(1));
            Ok(Value::Text(codepage.decode(&bytes[1..1 + len])))
        }
        FieldType::Group | FieldType::Memo => Err(FieldError::NotScalar(t)),
    }
}

/// Packed BCD with a sign nibble: the high nibble of the first byte is
/// zero for positive values, nonzero for negative; every following nibble
/// is one decimal digit.  `decimals` digits fall after the decimal point.
fn decode_bcd(bytes: &[u8], decimals: u8) -> Result<Value, FieldError> {
    let negative = bytes[0] >> 4 != 0;
    let mut digits: i128 = (bytes[0] & 0x0f) as i128;
    if bytes[0] & 0x0f > 9 {
        return Err(FieldError::BadBcdNibble(bytes[0] & 0x0f));
    }
    for &b in &bytes[1..] {
        for nibble in [b >> 4, b & 0x0f] {
            if nibble > 9 {
                return Err(FieldError::BadBcdNibble(nibble));
            }
            digits = digits * 10 + nibble as i128;
        }
    }
    let mut value = digits as f64 / 10_f64.powi(decimals as i32);
    if negative {
        value = -value;
    }
    Ok(Value::Real(value))
}

/// Days since 1800-12-28; zero means "no date".
fn decode_date(days: u32) -> Result<Value, FieldError> {
    if days == 0 {
        return Ok(Value::Null);
    }
    let date = CLARION_EPOCH
        .checked_add_signed(chrono::Duration::days(days as i64))
        .ok_or(FieldError::BadDate(days))?;
    Ok(Value::Text(date.format("%Y-%m-%d").to_string()))
}

/// Centiseconds since midnight.
fn decode_time(centis: u32) -> Result<Value, FieldError> {
    let hours = centis / 360_000;
    if hours > 23 {
        return Err(FieldError::BadTime(centis));
    }
    let minutes = centis / 6_000 % 60;
    let seconds = centis / 100 % 60;
    let hundredths = centis % 100;
    Ok(Value::Text(format!(
        "{:02}:{:02}:{:02}.{:02}",
        hours, minutes, seconds, hundredths
    )))
}
