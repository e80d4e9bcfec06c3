//! dbheader reads the fixed-size header at the front of a TopSpeed file.
//!
//! The header occupies the first 0x200 bytes.  The page area begins
//! immediately after it.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Read, Seek, SeekFrom};

#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    #[error("The magic bytes for this file are wrong; not a TopSpeed file.")]
    WrongMagic,
    #[error("The header declares an unsupported size ({0:#x}); only 0x200 is supported.")]
    UnsupportedVersion(u16),
    #[error("The header's self-address field is nonzero.")]
    Invalid,
    #[error("Error reading file.")]
    ReadFailed,
}

/// Size of the file header; the first page starts here.
pub const HEADER_SIZE: u64 = 0x200;

const TOPSPEED_MAGIC: &[u8; 4] = b"tOpS";

/// The TopSpeed file header.
#[derive(Debug, Clone)]
pub struct FileHeader {
    /// File size the writer recorded at last close.  The physical file may
    /// be larger when the writer crashed mid-extension.
    pub file_size: u32,
    /// Bytes allocated to the file, including unflushed tail space.
    pub alloc_size: u32,
    /// Format version stamp of the producing driver.
    pub version: u16,
    /// Highest record number the writer handed out.
    pub last_record: u32,
    /// Incremented on every committed change.
    pub change_count: u32,
}

/// Reads and validates the file header, leaving the cursor at offset 0.
pub fn get_header<R: Read + Seek>(f: &mut R) -> Result<FileHeader, Error> {
    f.seek(SeekFrom::Start(0)).map_err(|_| Error::ReadFailed)?;

    // Offset  Size  Description
    // 0       4     Self address; always zero for the header block.
    // 4       2     Header size.  0x200 in every file this code supports.
    let addr = f.read_u32::<LittleEndian>().map_err(|_| Error::ReadFailed)?;
    if addr != 0 {
        return Err(Error::Invalid);
    }
    let header_size = f.read_u16::<LittleEndian>().map_err(|_| Error::ReadFailed)?;

    // Offset  Size  Description
    // 6       4     File size at last clean close.
    // 10      4     Allocated size.
    let file_size = f.read_u32::<LittleEndian>().map_err(|_| Error::ReadFailed)?;
    let alloc_size = f.read_u32::<LittleEndian>().map_err(|_| Error::ReadFailed)?;

    // Offset  Size  Description
    // 14      4     The magic: "tOpS".
    let mut magic = [0_u8; 4];
    f.read_exact(&mut magic).map_err(|_| Error::ReadFailed)?;
    if &magic != TOPSPEED_MAGIC {
        return Err(Error::WrongMagic);
    }
    // The magic is checked before the header size so that a non-TopSpeed
    // file reports WrongMagic rather than a confusing version error.
    if u64::from(header_size) != HEADER_SIZE {
        return Err(Error::UnsupportedVersion(header_size));
    }

    // Offset  Size  Description
    // 18      2     Driver version stamp.
    // 20      4     Last issued record number.
    // 24      4     Change counter.
    let version = f.read_u16::<LittleEndian>().map_err(|_| Error::ReadFailed)?;
    let last_record = f.read_u32::<LittleEndian>().map_err(|_| Error::ReadFailed)?;
    let change_count = f.read_u32::<LittleEndian>().map_err(|_| Error::ReadFailed)?;

    // The remainder of the header is reserved and ignored.
    f.seek(SeekFrom::Start(0)).map_err(|_| Error::ReadFailed)?;
    Ok(FileHeader {
        file_size,
        alloc_size,
        version,
        last_record,
        change_count,
    })
}

#[cfg(test)]
pub(crate) fn build_test_header(file_size: u32) -> Vec<u8> {
    use byteorder::WriteBytesExt;
    let mut v = Vec::with_capacity(HEADER_SIZE as usize);
    v.write_u32::<LittleEndian>(0).unwrap();
    v.write_u16::<LittleEndian>(0x200).unwrap();
    v.write_u32::<LittleEndian>(file_size).unwrap();
    v.write_u32::<LittleEndian>(file_size).unwrap();
    v.extend_from_slice(TOPSPEED_MAGIC);
    v.write_u16::<LittleEndian>(0x0006).unwrap();
    v.write_u32::<LittleEndian>(0).unwrap();
    v.write_u32::<LittleEndian>(1).unwrap();
    v.resize(HEADER_SIZE as usize, 0);
    v
}

#[test]
fn test_get_header_roundtrip() {
    let bytes = build_test_header(0x1400);
    let mut c = std::io::Cursor::new(bytes);
    let h = get_header(&mut c).unwrap();
    assert_eq!(h.file_size, 0x1400);
    assert_eq!(h.alloc_size, 0x1400);
    assert_eq!(h.version, 6);
    assert_eq!(h.change_count, 1);
    // The cursor must be rewound for the page scan that follows.
    assert_eq!(c.position(), 0);
}

#[test]
fn test_get_header_wrong_magic() {
    let mut bytes = build_test_header(0x1400);
    bytes[14] = b'X';
    let mut c = std::io::Cursor::new(bytes);
    match get_header(&mut c) {
        Err(Error::WrongMagic) => (),
        other => panic!("expected WrongMagic, got {:?}", other),
    }
}

#[test]
fn test_get_header_bad_size() {
    let mut bytes = build_test_header(0x1400);
    bytes[4] = 0x00;
    bytes[5] = 0x01; // header size 0x100
    let mut c = std::io::Cursor::new(bytes);
    match get_header(&mut c) {
        Err(Error::UnsupportedVersion(0x100)) => (),
        other => panic!("expected UnsupportedVersion, got {:?}", other),
    }
}

#[test]
fn test_get_header_truncated() {
    let mut c = std::io::Cursor::new(vec![0_u8; 8]);
    assert!(get_header(&mut c).is_err());
}
