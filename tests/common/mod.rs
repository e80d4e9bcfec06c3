//! Builds synthetic TopSpeed files for the integration tests.
//!
//! This is the write-side mirror of the crate's readers: file header,
//! aligned pages (optionally RLE-compressed), prefix-length records and
//! table definition blobs, all in the byte layout the library decodes.

#![allow(dead_code)]

use std::path::Path;

pub const PAGE_HEADER_LEN: usize = 13;
const PAGE_ALIGN: usize = 0x100;
const FILE_HEADER_LEN: usize = 0x200;

pub const TYPE_DATA: u8 = 0xF3;
pub const TYPE_METADATA: u8 = 0xF6;
pub const TYPE_TABLE_DEF: u8 = 0xFA;
pub const TYPE_MEMO: u8 = 0xFC;

// ---------------------------------------------------------------- records

fn record_header(table: u8, type_byte: u8, tail: &[u8]) -> Vec<u8> {
    let mut h = Vec::new();
    h.extend_from_slice(&(table as u32).to_be_bytes());
    h.push(type_byte);
    h.extend_from_slice(tail);
    h
}

/// Appends one record with explicit data and header lengths.
pub fn push_record(body: &mut Vec<u8>, header: &[u8], payload: &[u8]) {
    let data_len = (header.len() + payload.len()) as u16;
    body.push(0x80 | 0x40);
    body.extend_from_slice(&data_len.to_le_bytes());
    body.extend_from_slice(&(header.len() as u16).to_le_bytes());
    body.extend_from_slice(header);
    body.extend_from_slice(payload);
}

pub fn push_data_record(body: &mut Vec<u8>, table: u8, recno: u32, payload: &[u8]) {
    let h = record_header(table, TYPE_DATA, &recno.to_be_bytes());
    push_record(body, &h, payload);
}

pub fn push_def_record(body: &mut Vec<u8>, table: u8, block: u16, payload: &[u8]) {
    let h = record_header(table, TYPE_TABLE_DEF, &block.to_be_bytes());
    push_record(body, &h, payload);
}

pub fn push_metadata_record(body: &mut Vec<u8>, table: u8, name: &str) {
    let h = record_header(table, TYPE_METADATA, &[]);
    let mut payload = name.as_bytes().to_vec();
    payload.push(0);
    push_record(body, &h, &payload);
}

pub fn push_memo_record(
    body: &mut Vec<u8>,
    table: u8,
    recno: u32,
    memo_index: u8,
    sequence: u16,
    payload: &[u8],
) {
    let mut tail = recno.to_be_bytes().to_vec();
    tail.push(memo_index);
    tail.extend_from_slice(&sequence.to_be_bytes());
    let h = record_header(table, TYPE_MEMO, &tail);
    push_record(body, &h, payload);
}

// ---------------------------------------------------------- definitions

/// Builds table definition blobs field by field.
pub struct DefBuilder {
    record_length: u16,
    fields: Vec<u8>,
    field_count: u16,
    memos: Vec<u8>,
    memo_count: u16,
    indexes: Vec<u8>,
    index_count: u16,
}

impl DefBuilder {
    pub fn new(record_length: u16) -> DefBuilder {
        DefBuilder {
            record_length,
            fields: Vec::new(),
            field_count: 0,
            memos: Vec::new(),
            memo_count: 0,
            indexes: Vec::new(),
            index_count: 0,
        }
    }

    pub fn field(
        mut self,
        type_code: u8,
        offset: u16,
        name: &str,
        element_count: u16,
        length: u16,
    ) -> DefBuilder {
        self.fields.push(type_code);
        self.fields.extend_from_slice(&offset.to_le_bytes());
        self.fields.extend_from_slice(name.as_bytes());
        self.fields.push(0);
        self.fields.extend_from_slice(&element_count.to_le_bytes());
        self.fields.extend_from_slice(&length.to_le_bytes());
        self.fields.extend_from_slice(&0_u16.to_le_bytes()); // flags
        self.fields.extend_from_slice(&0_u16.to_le_bytes()); // index
        if type_code == 0x0a {
            self.fields.push(2); // decimals
        }
        self.field_count += 1;
        self
    }

    pub fn memo(mut self, name: &str) -> DefBuilder {
        self.memos.extend_from_slice(name.as_bytes());
        self.memos.push(0);
        self.memos.extend_from_slice(&0_u16.to_le_bytes());
        self.memo_count += 1;
        self
    }

    pub fn key(mut self, name: &str, members: &[u16]) -> DefBuilder {
        self.indexes.extend_from_slice(name.as_bytes());
        self.indexes.push(0);
        self.indexes.extend_from_slice(&0_u16.to_le_bytes());
        self.indexes
            .extend_from_slice(&(members.len() as u16).to_le_bytes());
        for m in members {
            self.indexes.extend_from_slice(&m.to_le_bytes());
        }
        self.index_count += 1;
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut v = Vec::new();
        v.extend_from_slice(&0x0006_u16.to_le_bytes()); // driver version
        v.extend_from_slice(&self.record_length.to_le_bytes());
        v.extend_from_slice(&self.field_count.to_le_bytes());
        v.extend_from_slice(&self.memo_count.to_le_bytes());
        v.extend_from_slice(&self.index_count.to_le_bytes());
        v.extend_from_slice(&self.fields);
        v.extend_from_slice(&self.memos);
        v.extend_from_slice(&self.indexes);
        v
    }
}

// ---------------------------------------------------------------- pages

/// RLE "compression" good enough to exercise the expander: literal runs
/// with zero-length repeats between them.
fn rle_wrap(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut chunks = raw.chunks(255).peekable();
    while let Some(chunk) = chunks.next() {
        out.push(chunk.len() as u8);
        out.extend_from_slice(chunk);
        if chunks.peek().is_some() {
            out.push(0); // repeat nothing
        }
    }
    out
}

struct PendingPage {
    label: String,
    body: Vec<u8>,
    hierarchy_level: u8,
    compressed: bool,
}

/// Accumulates pages and renders a complete file image.
#[derive(Default)]
pub struct TpsBuilder {
    pages: Vec<PendingPage>,
}

impl TpsBuilder {
    pub fn new() -> TpsBuilder {
        TpsBuilder::default()
    }

    pub fn page(&mut self, label: &str, body: Vec<u8>) -> &mut Self {
        self.pages.push(PendingPage {
            label: label.to_string(),
            body,
            hierarchy_level: 0,
            compressed: false,
        });
        self
    }

    pub fn compressed_page(&mut self, label: &str, body: Vec<u8>) -> &mut Self {
        self.pages.push(PendingPage {
            label: label.to_string(),
            body,
            hierarchy_level: 0,
            compressed: true,
        });
        self
    }

    pub fn index_page(&mut self, label: &str, body: Vec<u8>) -> &mut Self {
        self.pages.push(PendingPage {
            label: label.to_string(),
            body,
            hierarchy_level: 1,
            compressed: false,
        });
        self
    }

    /// Renders the image; returns the bytes and each page's file offset
    /// by label.
    pub fn build(&self) -> (Vec<u8>, Vec<(String, u64)>) {
        let mut image = vec![0_u8; FILE_HEADER_LEN];
        let mut addrs = Vec::new();
        for p in &self.pages {
            let addr = image.len().div_ceil(PAGE_ALIGN) * PAGE_ALIGN;
            image.resize(addr, 0);
            addrs.push((p.label.clone(), addr as u64));

            let uncompressed = (PAGE_HEADER_LEN + p.body.len()) as u16;
            let stored_body = if p.compressed {
                rle_wrap(&p.body)
            } else {
                p.body.clone()
            };
            let size = (PAGE_HEADER_LEN + stored_body.len()) as u16;
            image.extend_from_slice(&(addr as u32).to_le_bytes());
            image.extend_from_slice(&size.to_le_bytes());
            image.extend_from_slice(&uncompressed.to_le_bytes());
            image.extend_from_slice(&uncompressed.to_le_bytes());
            image.extend_from_slice(&0_u16.to_le_bytes());
            image.push(p.hierarchy_level);
            image.extend_from_slice(&stored_body);
        }

        // File header: addr 0, size 0x200, sizes, magic, version, counters.
        let file_size = image.len() as u32;
        let mut h = Vec::with_capacity(FILE_HEADER_LEN);
        h.extend_from_slice(&0_u32.to_le_bytes());
        h.extend_from_slice(&0x200_u16.to_le_bytes());
        h.extend_from_slice(&file_size.to_le_bytes());
        h.extend_from_slice(&file_size.to_le_bytes());
        h.extend_from_slice(b"tOpS");
        h.extend_from_slice(&0x0006_u16.to_le_bytes());
        h.extend_from_slice(&0_u32.to_le_bytes());
        h.extend_from_slice(&1_u32.to_le_bytes());
        h.resize(FILE_HEADER_LEN, 0);
        image[..FILE_HEADER_LEN].copy_from_slice(&h);

        (image, addrs)
    }

    pub fn write_to(&self, path: &Path) -> Vec<(String, u64)> {
        let (image, addrs) = self.build();
        std::fs::write(path, image).expect("Should have written fixture file.");
        addrs
    }
}

// ----------------------------------------------------------- table kits

/// A complete fixture table: definition, optional registered name, data
/// records and memo records.
pub struct FixtureTable {
    pub number: u8,
    pub name: Option<String>,
    pub definition: Vec<u8>,
    pub records: Vec<(u32, Vec<u8>)>,
    pub memos: Vec<(u32, u8, Vec<u8>)>,
    pub records_per_page: usize,
}

impl FixtureTable {
    pub fn new(number: u8, name: &str, definition: Vec<u8>) -> FixtureTable {
        FixtureTable {
            number,
            name: Some(name.to_string()),
            definition,
            records: Vec::new(),
            memos: Vec::new(),
            records_per_page: 20,
        }
    }

    pub fn record(mut self, recno: u32, payload: Vec<u8>) -> FixtureTable {
        self.records.push((recno, payload));
        self
    }

    pub fn memo(mut self, recno: u32, memo_index: u8, payload: &[u8]) -> FixtureTable {
        self.memos.push((recno, memo_index, payload.to_vec()));
        self
    }
}

/// Lays out tables the way production files do: definitions and names
/// first, then the data pages, then memos.
pub fn build_file(tables: &[FixtureTable]) -> TpsBuilder {
    let mut b = TpsBuilder::new();
    let mut meta_body = Vec::new();
    for t in tables {
        if let Some(name) = &t.name {
            push_metadata_record(&mut meta_body, t.number, name);
        }
        // Definition blobs split across blocks of at most 128 bytes, as
        // writers split long definitions.
        for (block, chunk) in t.definition.chunks(128).enumerate() {
            push_def_record(&mut meta_body, t.number, block as u16, chunk);
        }
    }
    b.page("meta", meta_body);

    for t in tables {
        for (pi, recs) in t.records.chunks(t.records_per_page).enumerate() {
            let mut body = Vec::new();
            for (recno, payload) in recs {
                push_data_record(&mut body, t.number, *recno, payload);
            }
            b.page(&format!("data:{}:{}", t.number, pi), body);
        }
        if !t.memos.is_empty() {
            let mut body = Vec::new();
            for (recno, idx, payload) in &t.memos {
                push_memo_record(&mut body, t.number, *recno, *idx, 0, payload);
            }
            b.page(&format!("memo:{}", t.number), body);
        }
    }
    b
}

pub fn write_file(path: &Path, tables: &[FixtureTable]) -> Vec<(String, u64)> {
    build_file(tables).write_to(path)
}
