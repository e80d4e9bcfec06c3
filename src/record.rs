// Data pages hold records.  Records are prefix-compressed against their
// predecessor within the page, and each opens with a small header naming
// the table it belongs to and what kind of record it is.
//
// Record layout:
//   flags: u8
//     0x80  a fresh u16le data length follows (else inherited)
//     0x40  a fresh u16le header length follows (else inherited)
//     0x3F  count of bytes reused from the head of the previous record
//   then (data_length - reuse) fresh bytes.
//
// Record header layout (the first header_length bytes of a record):
//   table_number: u32be, then a type byte:
//     0xF3  data record; u32be record number follows
//     0xFA  table definition; u16be block ordinal follows
//     0xFC  memo; u32be record number, u8 memo index, u16be sequence follow
//     0xF6  metadata (table name registry)
//     < 0xF3  an index entry; the byte is the index number

use byteorder::{BigEndian, ByteOrder};
use std::io::{Read, Seek};
use streaming_iterator::StreamingIterator;

use crate::pager::{Page, PageReader, PageScan};

pub const TYPE_DATA: u8 = 0xF3;
pub const TYPE_METADATA: u8 = 0xF6;
pub const TYPE_TABLE_DEF: u8 = 0xFA;
pub const TYPE_MEMO: u8 = 0xFC;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Record extends past the end of the page payload.")]
    TruncatedRecord,
    #[error("First record of a page must carry explicit lengths.")]
    MissingLengths,
    #[error("Record reuses {reuse} bytes but the previous record has {available}.")]
    BadReuse { reuse: usize, available: usize },
    #[error("Record header is shorter than its fixed fields require.")]
    ShortHeader,
    #[error("Table number {0} is out of the supported range.")]
    TableNumberOutOfRange(u32),
    #[error("Record header carries an unknown type byte {0:#x}.")]
    UnknownRecordType(u8),
}

/// What kind of record a header announced.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordKind {
    Data { record_number: u32 },
    TableDefinition { block: u16 },
    Memo { record_number: u32, memo_index: u8, sequence: u16 },
    Index { index_number: u8, record_number: u32 },
    Metadata,
}

/// A record as it sits in the file: classified, payload split from header.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub table_number: u8,
    pub kind: RecordKind,
    pub payload: Vec<u8>,
}

/// A data record crossing the decoding boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub table_number: u8,
    pub record_number: u32,
    pub payload: Vec<u8>,
}

/// Iterates the records of one page payload, resolving prefix compression.
///
/// The first splitting failure poisons the remainder of the page: one `Err`
/// is yielded and iteration stops, since later records may reuse bytes of
/// the one that failed.
pub struct PageRecords<'a> {
    data: &'a [u8],
    pos: usize,
    prev: Vec<u8>,
    data_len: Option<usize>,
    header_len: Option<usize>,
    poisoned: bool,
}

impl<'a> PageRecords<'a> {
    pub fn new(page: &'a Page) -> PageRecords<'a> {
        PageRecords {
            data: &page.data,
            pos: 0,
            prev: Vec::new(),
            data_len: None,
            header_len: None,
            poisoned: false,
        }
    }

    fn split_next(&mut self) -> Result<Option<RawRecord>, Error> {
        if self.pos >= self.data.len() {
            return Ok(None);
        }
        let flags = self.data[self.pos];
        self.pos += 1;
        if flags & 0x80 != 0 {
            let b = self
                .data
                .get(self.pos..self.pos + 2)
                .ok_or(Error::TruncatedRecord)?;
            self.data_len = Some(u16::from_le_bytes([b[0], b[1]]) as usize);
            self.pos += 2;
        }
        if flags & 0x40 != 0 {
            let b = self
                .data
                .get(self.pos..self.pos + 2)
                .ok_or(Error::TruncatedRecord)?;
            self.header_len = Some(u16::from_le_bytes([b[0], b[1]]) as usize);
            self.pos += 2;
        }
        let data_len = self.data_len.ok_or(Error::MissingLengths)?;
        let header_len = self.header_len.ok_or(Error::MissingLengths)?;
        let reuse = (flags & 0x3F) as usize;
        if reuse > self.prev.len() {
            return Err(Error::BadReuse {
                reuse,
                available: self.prev.len(),
            });
        }
        if reuse > data_len {
            return Err(Error::BadReuse {
                reuse,
                available: data_len,
            });
        }
        let fresh = data_len - reuse;
        let tail = self
            .data
            .get(self.pos..self.pos + fresh)
            .ok_or(Error::TruncatedRecord)?;
        self.pos += fresh;

        let mut bytes = Vec::with_capacity(data_len);
        bytes.extend_from_slice(&self.prev[..reuse]);
        bytes.extend_from_slice(tail);
        self.prev = bytes.clone();

        let rec = parse_record(&bytes, header_len)?;
        Ok(Some(rec))
    }
}

impl<'a> Iterator for PageRecords<'a> {
    type Item = Result<RawRecord, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.poisoned {
            return None;
        }
        match self.split_next() {
            Ok(Some(rec)) => Some(Ok(rec)),
            Ok(None) => None,
            Err(e) => {
                self.poisoned = true;
                Some(Err(e))
            }
        }
    }
}

/// Parses the record header and splits the payload off.
fn parse_record(bytes: &[u8], header_len: usize) -> Result<RawRecord, Error> {
    if header_len > bytes.len() || header_len < 5 {
        return Err(Error::ShortHeader);
    }
    let header = &bytes[..header_len];
    let table_raw = BigEndian::read_u32(&header[0..4]);
    let table_number =
        u8::try_from(table_raw).map_err(|_| Error::TableNumberOutOfRange(table_raw))?;
    let type_byte = header[4];
    let kind = match type_byte {
        TYPE_DATA => {
            if header_len < 9 {
                return Err(Error::ShortHeader);
            }
            RecordKind::Data {
                record_number: BigEndian::read_u32(&header[5..9]),
            }
        }
        TYPE_TABLE_DEF => {
            if header_len < 7 {
                return Err(Error::ShortHeader);
            }
            RecordKind::TableDefinition {
                block: BigEndian::read_u16(&header[5..7]),
            }
        }
        TYPE_MEMO => {
            if header_len < 12 {
                return Err(Error::ShortHeader);
            }
            RecordKind::Memo {
                record_number: BigEndian::read_u32(&header[5..9]),
                memo_index: header[9],
                sequence: BigEndian::read_u16(&header[10..12]),
            }
        }
        TYPE_METADATA => RecordKind::Metadata,
        n if n < TYPE_DATA => {
            if header_len < 9 {
                return Err(Error::ShortHeader);
            }
            RecordKind::Index {
                index_number: n,
                record_number: BigEndian::read_u32(&header[5..9]),
            }
        }
        other => return Err(Error::UnknownRecordType(other)),
    };
    Ok(RawRecord {
        table_number,
        kind,
        payload: bytes[header_len..].to_vec(),
    })
}

/// Streams every record of every data page in one pass over the file.
///
/// Pages that fail validation or record splitting are counted as corrupt
/// and skipped; the stream itself never aborts.  Finite and not
/// restartable: a fresh scan requires a new iterator.
pub struct RawRecords<'a, R> {
    scan: PageScan<'a, R>,
    buffered: std::vec::IntoIter<RawRecord>,
    split_failures: u32,
}

impl<'a, R: Read + Seek> RawRecords<'a, R> {
    pub fn new(reader: &'a mut PageReader<R>) -> RawRecords<'a, R> {
        RawRecords {
            scan: reader.pages(),
            buffered: Vec::new().into_iter(),
            split_failures: 0,
        }
    }

    /// Pages skipped for header corruption plus pages whose record area
    /// could not be split.
    pub fn corrupt_pages(&self) -> u32 {
        self.scan.corrupt_pages() + self.split_failures
    }

    /// Pages the underlying scan has yielded, data pages or not.
    pub fn pages_seen(&self) -> u32 {
        self.scan.pages_seen()
    }
}

impl<'a, R: Read + Seek> Iterator for RawRecords<'a, R> {
    type Item = RawRecord;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(rec) = self.buffered.next() {
                return Some(rec);
            }
            let page = self.scan.next()?;
            if !page.is_data_page() {
                continue;
            }
            let mut recs = Vec::new();
            let mut failed = false;
            for r in PageRecords::new(page) {
                match r {
                    Ok(rec) => recs.push(rec),
                    Err(e) => {
                        log::warn!("record split failed on page {}: {}", page.number, e);
                        failed = true;
                        break;
                    }
                }
            }
            if failed {
                self.split_failures += 1;
            }
            self.buffered = recs.into_iter();
        }
    }
}

impl<R: Read + Seek> PageReader<R> {
    /// Lazy sequence of one table's data records, in page order.  Finite
    /// and not restartable; a fresh scan requires a new iterator.
    pub fn records_for_table(&mut self, table_number: u8) -> RecordIter<'_, R> {
        RecordIter::new(self, table_number)
    }
}

/// Lazy sequence of one table's data records, in page order.
pub struct RecordIter<'a, R> {
    inner: RawRecords<'a, R>,
    table_number: u8,
}

impl<'a, R: Read + Seek> RecordIter<'a, R> {
    pub fn new(reader: &'a mut PageReader<R>, table_number: u8) -> RecordIter<'a, R> {
        RecordIter {
            inner: RawRecords::new(reader),
            table_number,
        }
    }

    pub fn corrupt_pages(&self) -> u32 {
        self.inner.corrupt_pages()
    }
}

impl<'a, R: Read + Seek> Iterator for RecordIter<'a, R> {
    type Item = Record;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let rec = self.inner.next()?;
            if rec.table_number != self.table_number {
                continue;
            }
            if let RecordKind::Data { record_number } = rec.kind {
                return Some(Record {
                    table_number: rec.table_number,
                    record_number,
                    payload: rec.payload,
                });
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod encode {
    //! Test-side encoders mirroring the on-disk record conventions.
    use super::*;

    /// Builds the header bytes for a record kind.
    pub fn header(table_number: u8, kind: &RecordKind) -> Vec<u8> {
        let mut h = Vec::new();
        h.extend_from_slice(&(table_number as u32).to_be_bytes());
        match kind {
            RecordKind::Data { record_number } => {
                h.push(TYPE_DATA);
                h.extend_from_slice(&record_number.to_be_bytes());
            }
            RecordKind::TableDefinition { block } => {
                h.push(TYPE_TABLE_DEF);
                h.extend_from_slice(&block.to_be_bytes());
            }
            RecordKind::Memo {
                record_number,
                memo_index,
                sequence,
            } => {
                h.push(TYPE_MEMO);
                h.extend_from_slice(&record_number.to_be_bytes());
                h.push(*memo_index);
                h.extend_from_slice(&sequence.to_be_bytes());
            }
            RecordKind::Index {
                index_number,
                record_number,
            } => {
                h.push(*index_number);
                h.extend_from_slice(&record_number.to_be_bytes());
            }
            RecordKind::Metadata => h.push(TYPE_METADATA),
        }
        h
    }

    /// Appends one record to a page body, with explicit lengths.
    pub fn push_record(body: &mut Vec<u8>, table: u8, kind: &RecordKind, payload: &[u8]) {
        let h = header(table, kind);
        let data_len = (h.len() + payload.len()) as u16;
        body.push(0x80 | 0x40);
        body.extend_from_slice(&data_len.to_le_bytes());
        body.extend_from_slice(&(h.len() as u16).to_le_bytes());
        body.extend_from_slice(&h);
        body.extend_from_slice(payload);
    }

    /// Appends a record that reuses `reuse` bytes of the previous record.
    /// `full` is the complete record image (header plus payload).
    pub fn push_record_compressed(body: &mut Vec<u8>, full: &[u8], reuse: usize) {
        let data_len = full.len() as u16;
        body.push(0x80 | reuse as u8);
        body.extend_from_slice(&data_len.to_le_bytes());
        body.extend_from_slice(&full[reuse..]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pager::Page;

    fn page_with_body(body: Vec<u8>) -> Page {
        Page {
            number: 0,
            addr: 0x200,
            size: 0,
            uncompressed_size: 0,
            unabridged_size: 0,
            fragment_count: 0,
            hierarchy_level: 0,
            data: body,
        }
    }

    #[test]
    fn test_split_single_data_record() {
        let mut body = Vec::new();
        encode::push_record(
            &mut body,
            2,
            &RecordKind::Data { record_number: 7 },
            b"PAYLOAD",
        );
        let page = page_with_body(body);
        let recs: Vec<_> = PageRecords::new(&page).collect::<Result<_, _>>().unwrap();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].table_number, 2);
        assert_eq!(recs[0].kind, RecordKind::Data { record_number: 7 });
        assert_eq!(recs[0].payload, b"PAYLOAD");
    }

    #[test]
    fn test_split_prefix_compressed_run() {
        // Second record shares the 9 header bytes except the record number,
        // so it reuses the first 5 (table + type byte).
        let mut body = Vec::new();
        encode::push_record(
            &mut body,
            1,
            &RecordKind::Data { record_number: 1 },
            b"aaaa",
        );
        let mut full = encode::header(1, &RecordKind::Data { record_number: 2 });
        full.extend_from_slice(b"bbbb");
        encode::push_record_compressed(&mut body, &full, 5);

        let page = page_with_body(body);
        let recs: Vec<_> = PageRecords::new(&page).collect::<Result<_, _>>().unwrap();
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].kind, RecordKind::Data { record_number: 1 });
        assert_eq!(recs[0].payload, b"aaaa");
        assert_eq!(recs[1].kind, RecordKind::Data { record_number: 2 });
        assert_eq!(recs[1].payload, b"bbbb");
    }

    #[test]
    fn test_split_various_kinds() {
        let mut body = Vec::new();
        encode::push_record(&mut body, 3, &RecordKind::TableDefinition { block: 0 }, b"def");
        encode::push_record(
            &mut body,
            3,
            &RecordKind::Memo {
                record_number: 9,
                memo_index: 1,
                sequence: 0,
            },
            b"memo bytes",
        );
        encode::push_record(
            &mut body,
            3,
            &RecordKind::Index {
                index_number: 0,
                record_number: 9,
            },
            b"",
        );
        encode::push_record(&mut body, 3, &RecordKind::Metadata, b"CUSTOMER\0");

        let page = page_with_body(body);
        let recs: Vec<_> = PageRecords::new(&page).collect::<Result<_, _>>().unwrap();
        assert_eq!(recs.len(), 4);
        assert_eq!(recs[0].kind, RecordKind::TableDefinition { block: 0 });
        assert_eq!(
            recs[1].kind,
            RecordKind::Memo {
                record_number: 9,
                memo_index: 1,
                sequence: 0
            }
        );
        assert_eq!(
            recs[2].kind,
            RecordKind::Index {
                index_number: 0,
                record_number: 9
            }
        );
        assert_eq!(recs[3].kind, RecordKind::Metadata);
        assert_eq!(recs[3].payload, b"CUSTOMER\0");
    }

    #[test]
    fn test_first_record_must_have_lengths() {
        // flags byte with no 0x80/0x40 set and nothing to inherit.
        let page = page_with_body(vec![0x00, 1, 2, 3]);
        let mut it = PageRecords::new(&page);
        assert_eq!(it.next(), Some(Err(Error::MissingLengths)));
        // Poisoned after the first failure.
        assert_eq!(it.next(), None);
    }

    #[test]
    fn test_truncated_record_poisons_page() {
        let mut body = Vec::new();
        encode::push_record(&mut body, 1, &RecordKind::Data { record_number: 1 }, b"xy");
        // Claim 40 data bytes but provide none.
        body.push(0x80);
        body.extend_from_slice(&40_u16.to_le_bytes());
        let page = page_with_body(body);
        let results: Vec<_> = PageRecords::new(&page).collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert_eq!(results[1], Err(Error::TruncatedRecord));
    }

    #[test]
    fn test_reuse_beyond_previous_is_error() {
        let mut body = Vec::new();
        // First record, 2 bytes of data, then a record reusing 10.
        encode::push_record(&mut body, 1, &RecordKind::Metadata, b"");
        body.push(0x80 | 0x0A);
        body.extend_from_slice(&12_u16.to_le_bytes());
        let page = page_with_body(body);
        let results: Vec<_> = PageRecords::new(&page).collect();
        assert!(matches!(results[1], Err(Error::BadReuse { .. })));
    }
}
