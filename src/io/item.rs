//! The item store: typed, positioned access to the named binary items inside
//! a dataset.
//!
//! # Item format
//!
//! Every typed item starts with a four byte type tag, followed by padding up
//! to the natural alignment of its elements (never less than four bytes).
//! Text items carry no tag at all. All numbers are big-endian.
//!
//! | type      | tag           | payload offset |
//! |-----------|---------------|----------------|
//! | binary    | `00 00 00 00` | 4              |
//! | character | `00 00 00 01` | 4              |
//! | int32     | `00 00 00 02` | 4              |
//! | int16     | `00 00 00 03` | 4              |
//! | float32   | `00 00 00 04` | 4              |
//! | float64   | `00 00 00 05` | 8              |
//! | complex64 | `00 00 00 07` | 8              |
//! | int64     | `00 00 00 08` | 8              |
//! | text      | -             | 0              |

use std::{
    fmt::Display,
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use byteorder::{BigEndian, ByteOrder};
use num_complex::Complex32;

use super::error::IOError;

/// Size of the read cache and the write-combining buffer of file-backed items.
const BUF_SIZE: usize = 1 << 16;

/// The element type recorded in an item's type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemType {
    /// Uninterpreted bytes, with a tag
    Binary,
    /// A short string, with a tag
    Character,
    /// 32-bit integers
    Int32,
    /// 16-bit integers
    Int16,
    /// 32-bit floats
    Float32,
    /// 64-bit floats
    Float64,
    /// Pairs of 32-bit floats
    Complex64,
    /// 64-bit integers
    Int64,
    /// Untagged text, e.g. `history` and `vartable`
    Text,
}

impl ItemType {
    /// The four byte tag written at the start of an item of this type.
    pub const fn tag(self) -> Option<[u8; 4]> {
        match self {
            Self::Binary => Some([0, 0, 0, 0]),
            Self::Character => Some([0, 0, 0, 1]),
            Self::Int32 => Some([0, 0, 0, 2]),
            Self::Int16 => Some([0, 0, 0, 3]),
            Self::Float32 => Some([0, 0, 0, 4]),
            Self::Float64 => Some([0, 0, 0, 5]),
            Self::Complex64 => Some([0, 0, 0, 7]),
            Self::Int64 => Some([0, 0, 0, 8]),
            Self::Text => None,
        }
    }

    /// Identify the type from the first bytes of an item. Anything without a
    /// recognised tag is text.
    pub fn from_leading_bytes(bytes: &[u8]) -> Self {
        if bytes.len() < 4 || bytes[..3] != [0, 0, 0] {
            return Self::Text;
        }
        match bytes[3] {
            0 => Self::Binary,
            1 => Self::Character,
            2 => Self::Int32,
            3 => Self::Int16,
            4 => Self::Float32,
            5 => Self::Float64,
            7 => Self::Complex64,
            8 => Self::Int64,
            _ => Self::Text,
        }
    }

    /// Size of one element on disk, in bytes.
    pub const fn element_size(self) -> usize {
        match self {
            Self::Binary | Self::Character | Self::Text => 1,
            Self::Int16 => 2,
            Self::Int32 | Self::Float32 => 4,
            Self::Int64 | Self::Float64 | Self::Complex64 => 8,
        }
    }

    /// Byte offset of the first element.
    pub const fn data_offset(self) -> u64 {
        match self {
            Self::Text => 0,
            _ => {
                let size = self.element_size();
                if size > 4 {
                    size as u64
                } else {
                    4
                }
            }
        }
    }
}

impl Display for ItemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Binary => "binary",
                Self::Character => "character",
                Self::Int32 => "integer",
                Self::Int16 => "integer*2",
                Self::Float32 => "real",
                Self::Float64 => "double",
                Self::Complex64 => "complex",
                Self::Int64 => "integer*8",
                Self::Text => "text",
            }
        )
    }
}

/// How an item is accessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemMode {
    /// Existing item, read only
    Read,
    /// Truncate (or create) and write
    Write,
    /// Open (or create) without truncation
    Append,
    /// Like `Write`, but the item is discarded on close
    Scratch,
}

impl ItemMode {
    /// Whether this mode permits writes.
    pub const fn is_writable(self) -> bool {
        !matches!(self, Self::Read)
    }
}

struct FileStorage {
    path: PathBuf,
    file: File,
    size: u64,
    cache: Vec<u8>,
    cache_offset: u64,
    pending: Vec<u8>,
    pending_offset: u64,
}

impl FileStorage {
    fn flush_pending(&mut self) -> std::io::Result<()> {
        if !self.pending.is_empty() {
            self.file.seek(SeekFrom::Start(self.pending_offset))?;
            self.file.write_all(&self.pending)?;
            self.pending.clear();
        }
        Ok(())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
        self.flush_pending()?;
        if buf.len() > BUF_SIZE {
            self.file.seek(SeekFrom::Start(offset))?;
            return self.file.read_exact(buf);
        }
        let end = offset + buf.len() as u64;
        let cache_end = self.cache_offset + self.cache.len() as u64;
        if offset < self.cache_offset || end > cache_end {
            let fill = (self.size - offset).min(BUF_SIZE as u64) as usize;
            self.cache.resize(fill, 0);
            self.file.seek(SeekFrom::Start(offset))?;
            self.file.read_exact(&mut self.cache)?;
            self.cache_offset = offset;
        }
        let start = (offset - self.cache_offset) as usize;
        buf.copy_from_slice(&self.cache[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        self.cache.clear();
        let contiguous = offset == self.pending_offset + self.pending.len() as u64;
        if self.pending.is_empty() || !contiguous || self.pending.len() + data.len() > 4 * BUF_SIZE
        {
            self.flush_pending()?;
            self.pending_offset = offset;
        }
        self.pending.extend_from_slice(data);
        self.size = self.size.max(offset + data.len() as u64);
        Ok(())
    }
}

enum Storage {
    Memory(Vec<u8>),
    File(Box<FileStorage>),
}

/// An open item.
///
/// Items are owned by the [`crate::io::Dataset`] they were opened from; see
/// [`crate::io::Dataset::open_item`].
pub struct Item {
    dataset: String,
    name: String,
    mode: ItemMode,
    storage: Storage,
    position: u64,
}

impl Item {
    pub(crate) fn in_memory(dataset: &str, name: &str, mode: ItemMode, bytes: Vec<u8>) -> Self {
        Self {
            dataset: dataset.to_string(),
            name: name.to_string(),
            mode,
            storage: Storage::Memory(bytes),
            position: 0,
        }
    }

    pub(crate) fn on_disk(
        dataset: &str,
        name: &str,
        mode: ItemMode,
        path: &Path,
    ) -> Result<Self, IOError> {
        let file = match mode {
            ItemMode::Read => OpenOptions::new().read(true).open(path)?,
            ItemMode::Write | ItemMode::Scratch => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?,
            ItemMode::Append => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(path)?,
        };
        let size = file.metadata()?.len();
        Ok(Self {
            dataset: dataset.to_string(),
            name: name.to_string(),
            mode,
            storage: Storage::File(Box::new(FileStorage {
                path: path.to_path_buf(),
                file,
                size,
                cache: vec![],
                cache_offset: 0,
                pending: vec![],
                pending_offset: 0,
            })),
            position: 0,
        })
    }

    /// The item name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The mode this item was opened with.
    pub fn mode(&self) -> ItemMode {
        self.mode
    }

    /// Size of the item in bytes.
    pub fn size(&self) -> u64 {
        match &self.storage {
            Storage::Memory(bytes) => bytes.len() as u64,
            Storage::File(fs) => fs.size,
        }
    }

    pub(crate) fn file_path(&self) -> Option<&Path> {
        match &self.storage {
            Storage::Memory(_) => None,
            Storage::File(fs) => Some(&fs.path),
        }
    }

    /// Push buffered writes out to the file.
    pub fn flush(&mut self) -> Result<(), IOError> {
        if let Storage::File(fs) = &mut self.storage {
            fs.flush_pending()?;
            fs.file.flush()?;
        }
        Ok(())
    }

    /// Consume the item, returning the in-memory contents if it was never
    /// backed by a file.
    pub(crate) fn finish(mut self) -> Result<Option<Vec<u8>>, IOError> {
        self.flush()?;
        match self.storage {
            Storage::Memory(bytes) => Ok(Some(bytes)),
            Storage::File(_) => Ok(None),
        }
    }

    /// Read `buf.len()` bytes at `offset`.
    pub fn read_bytes(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), IOError> {
        let size = self.size();
        if offset + buf.len() as u64 > size {
            return Err(IOError::ShortRead {
                dataset: self.dataset.clone(),
                name: self.name.clone(),
                offset,
                len: buf.len(),
                size,
            });
        }
        match &mut self.storage {
            Storage::Memory(bytes) => {
                let start = offset as usize;
                buf.copy_from_slice(&bytes[start..start + buf.len()]);
            }
            Storage::File(fs) => fs.read_at(offset, buf)?,
        }
        Ok(())
    }

    /// Write `data` at `offset`, growing the item (zero filled) as needed.
    pub fn write_bytes(&mut self, offset: u64, data: &[u8]) -> Result<(), IOError> {
        if !self.mode.is_writable() {
            return Err(IOError::ReadOnly {
                dataset: self.dataset.clone(),
                name: self.name.clone(),
            });
        }
        match &mut self.storage {
            Storage::Memory(bytes) => {
                let start = offset as usize;
                let end = start + data.len();
                if bytes.len() < end {
                    bytes.resize(end, 0);
                }
                bytes[start..end].copy_from_slice(data);
            }
            Storage::File(fs) => {
                if offset > fs.size {
                    let gap = vec![0; (offset - fs.size) as usize];
                    let at = fs.size;
                    fs.write_at(at, &gap)?;
                }
                fs.write_at(offset, data)?;
            }
        }
        Ok(())
    }

    /// Read the whole item.
    pub fn read_all(&mut self) -> Result<Vec<u8>, IOError> {
        let mut buf = vec![0; self.size() as usize];
        self.read_bytes(0, &mut buf)?;
        Ok(buf)
    }

    /// Determine the item type from its tag.
    pub fn probe_type(&mut self) -> Result<ItemType, IOError> {
        let mut lead = [0_u8; 4];
        if self.size() < 4 {
            return Ok(ItemType::Text);
        }
        self.read_bytes(0, &mut lead)?;
        Ok(ItemType::from_leading_bytes(&lead))
    }

    /// Write the type tag of `item_type` at the start of the item.
    pub fn write_tag(&mut self, item_type: ItemType) -> Result<(), IOError> {
        match item_type.tag() {
            Some(tag) => {
                self.write_bytes(0, &tag)?;
                // pad out to the first element
                let pad = item_type.data_offset() - 4;
                if pad > 0 && self.size() < item_type.data_offset() {
                    self.write_bytes(4, &vec![0; pad as usize])?;
                }
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Fail unless the item's tag is `expected`.
    pub fn expect_type(&mut self, expected: ItemType) -> Result<(), IOError> {
        let found = self.probe_type()?;
        if found != expected {
            return Err(IOError::ItemTypeMismatch {
                dataset: self.dataset.clone(),
                name: self.name.clone(),
                expected: expected.to_string(),
                found: found.to_string(),
            });
        }
        Ok(())
    }

    /// Number of elements of `item_type` the item holds after its tag.
    pub fn element_count(&self, item_type: ItemType) -> usize {
        let size = self.size();
        let offset = item_type.data_offset();
        if size <= offset {
            0
        } else {
            ((size - offset) / item_type.element_size() as u64) as usize
        }
    }

    /// Read 32-bit integers at byte `offset`.
    pub fn read_i32s(&mut self, offset: u64, buf: &mut [i32]) -> Result<(), IOError> {
        let mut raw = vec![0; buf.len() * 4];
        self.read_bytes(offset, &mut raw)?;
        BigEndian::read_i32_into(&raw, buf);
        Ok(())
    }

    /// Read 16-bit integers at byte `offset` into a widened buffer.
    ///
    /// This is the primitive form: values are two bytes on disk but are
    /// always handed across the item interface as native ints.
    pub fn read_i16s_widened(&mut self, offset: u64, buf: &mut [i32]) -> Result<(), IOError> {
        let mut raw = vec![0; buf.len() * 2];
        self.read_bytes(offset, &mut raw)?;
        for (wide, chunk) in buf.iter_mut().zip(raw.chunks_exact(2)) {
            *wide = i32::from(BigEndian::read_i16(chunk));
        }
        Ok(())
    }

    /// Read 16-bit integers at byte `offset`, via a widened intermediate.
    pub fn read_i16s(&mut self, offset: u64, buf: &mut [i16]) -> Result<(), IOError> {
        let mut wide = vec![0_i32; buf.len()];
        self.read_i16s_widened(offset, &mut wide)?;
        for (narrow, &wide) in buf.iter_mut().zip(wide.iter()) {
            *narrow = wide as i16;
        }
        Ok(())
    }

    /// Read 64-bit integers at byte `offset`.
    pub fn read_i64s(&mut self, offset: u64, buf: &mut [i64]) -> Result<(), IOError> {
        let mut raw = vec![0; buf.len() * 8];
        self.read_bytes(offset, &mut raw)?;
        BigEndian::read_i64_into(&raw, buf);
        Ok(())
    }

    /// Read 32-bit floats at byte `offset`.
    pub fn read_f32s(&mut self, offset: u64, buf: &mut [f32]) -> Result<(), IOError> {
        let mut raw = vec![0; buf.len() * 4];
        self.read_bytes(offset, &mut raw)?;
        BigEndian::read_f32_into(&raw, buf);
        Ok(())
    }

    /// Read 64-bit floats at byte `offset`.
    pub fn read_f64s(&mut self, offset: u64, buf: &mut [f64]) -> Result<(), IOError> {
        let mut raw = vec![0; buf.len() * 8];
        self.read_bytes(offset, &mut raw)?;
        BigEndian::read_f64_into(&raw, buf);
        Ok(())
    }

    /// Read complex values (pairs of 32-bit floats) at byte `offset`.
    pub fn read_c64s(&mut self, offset: u64, buf: &mut [Complex32]) -> Result<(), IOError> {
        let mut floats = vec![0.0_f32; buf.len() * 2];
        self.read_f32s(offset, &mut floats)?;
        for (c, pair) in buf.iter_mut().zip(floats.chunks_exact(2)) {
            *c = Complex32::new(pair[0], pair[1]);
        }
        Ok(())
    }

    /// Write 32-bit integers at byte `offset`.
    pub fn write_i32s(&mut self, offset: u64, values: &[i32]) -> Result<(), IOError> {
        let mut raw = vec![0; values.len() * 4];
        BigEndian::write_i32_into(values, &mut raw);
        self.write_bytes(offset, &raw)
    }

    /// Write 16-bit integers given in widened form at byte `offset`. Only the
    /// low 16 bits of each value reach the disk.
    pub fn write_i16s_widened(&mut self, offset: u64, values: &[i32]) -> Result<(), IOError> {
        let mut raw = vec![0; values.len() * 2];
        for (chunk, &wide) in raw.chunks_exact_mut(2).zip(values.iter()) {
            BigEndian::write_i16(chunk, wide as i16);
        }
        self.write_bytes(offset, &raw)
    }

    /// Write 16-bit integers at byte `offset`, via a widened intermediate.
    pub fn write_i16s(&mut self, offset: u64, values: &[i16]) -> Result<(), IOError> {
        let wide: Vec<i32> = values.iter().map(|&v| i32::from(v)).collect();
        self.write_i16s_widened(offset, &wide)
    }

    /// Write 64-bit integers at byte `offset`.
    pub fn write_i64s(&mut self, offset: u64, values: &[i64]) -> Result<(), IOError> {
        let mut raw = vec![0; values.len() * 8];
        BigEndian::write_i64_into(values, &mut raw);
        self.write_bytes(offset, &raw)
    }

    /// Write 32-bit floats at byte `offset`.
    pub fn write_f32s(&mut self, offset: u64, values: &[f32]) -> Result<(), IOError> {
        let mut raw = vec![0; values.len() * 4];
        BigEndian::write_f32_into(values, &mut raw);
        self.write_bytes(offset, &raw)
    }

    /// Write 64-bit floats at byte `offset`.
    pub fn write_f64s(&mut self, offset: u64, values: &[f64]) -> Result<(), IOError> {
        let mut raw = vec![0; values.len() * 8];
        BigEndian::write_f64_into(values, &mut raw);
        self.write_bytes(offset, &raw)
    }

    /// Write complex values at byte `offset`.
    pub fn write_c64s(&mut self, offset: u64, values: &[Complex32]) -> Result<(), IOError> {
        let floats: Vec<f32> = values.iter().flat_map(|c| [c.re, c.im]).collect();
        self.write_f32s(offset, &floats)
    }

    /// Move the sequential cursor.
    pub fn seek(&mut self, offset: u64) {
        self.position = offset;
    }

    /// The sequential cursor.
    pub fn tell(&self) -> u64 {
        self.position
    }

    /// Read a newline-terminated line from the cursor, or `None` at the end.
    /// The newline is not included, and the bytes are not decoded.
    pub fn read_line(&mut self) -> Result<Option<Vec<u8>>, IOError> {
        let size = self.size();
        if self.position >= size {
            return Ok(None);
        }
        let mut line = vec![];
        let mut byte = [0_u8; 1];
        while self.position < size {
            self.read_bytes(self.position, &mut byte)?;
            self.position += 1;
            if byte[0] == b'\n' {
                break;
            }
            line.push(byte[0]);
        }
        Ok(Some(line))
    }

    /// Write `line` and a newline at the cursor.
    pub fn write_line(&mut self, line: &str) -> Result<(), IOError> {
        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');
        self.write_bytes(self.position, &bytes)?;
        self.position += bytes.len() as u64;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use tempfile::tempdir;

    #[test]
    fn test_tags_and_offsets() {
        assert_eq!(ItemType::Int32.tag(), Some([0, 0, 0, 2]));
        assert_eq!(ItemType::Int32.data_offset(), 4);
        assert_eq!(ItemType::Int16.data_offset(), 4);
        assert_eq!(ItemType::Float64.data_offset(), 8);
        assert_eq!(ItemType::Complex64.data_offset(), 8);
        assert_eq!(ItemType::Int64.data_offset(), 8);
        assert_eq!(ItemType::Text.data_offset(), 0);
        assert_eq!(ItemType::from_leading_bytes(&[0, 0, 0, 5]), ItemType::Float64);
        assert_eq!(ItemType::from_leading_bytes(b"i nchan"), ItemType::Text);
        assert_eq!(ItemType::from_leading_bytes(&[0, 0, 0, 6]), ItemType::Text);
    }

    #[test]
    fn test_int16_is_two_bytes_on_disk() {
        let mut item = Item::in_memory("ds", "shorts", ItemMode::Write, vec![]);
        item.write_tag(ItemType::Int16).unwrap();
        item.write_i16s(4, &[1, -2, i16::MAX]).unwrap();
        assert_eq!(item.size(), 4 + 3 * 2);
        assert_eq!(
            item.read_all().unwrap(),
            vec![0, 0, 0, 3, 0, 1, 0xff, 0xfe, 0x7f, 0xff]
        );

        let mut wide = [0_i32; 3];
        item.read_i16s_widened(4, &mut wide).unwrap();
        assert_eq!(wide, [1, -2, 32767]);

        // only the low half of a widened value is stored
        item.write_i16s_widened(4, &[0x1_0005]).unwrap();
        let mut narrow = [0_i16; 1];
        item.read_i16s(4, &mut narrow).unwrap();
        assert_eq!(narrow, [5]);
    }

    #[test]
    fn test_file_item_big_endian_values() {
        let tmp_dir = tempdir().unwrap();
        let path = tmp_dir.path().join("values");
        {
            let mut item = Item::on_disk("ds", "values", ItemMode::Write, &path).unwrap();
            item.write_tag(ItemType::Float64).unwrap();
            item.write_f64s(8, &[1.5, -2.25]).unwrap();
            item.flush().unwrap();
        }
        let raw = std::fs::read(&path).unwrap();
        assert_eq!(raw.len(), 24);
        assert_eq!(&raw[..4], &[0, 0, 0, 5]);
        assert_eq!(&raw[8..16], &1.5_f64.to_be_bytes());

        let mut item = Item::on_disk("ds", "values", ItemMode::Read, &path).unwrap();
        assert_eq!(item.probe_type().unwrap(), ItemType::Float64);
        assert_eq!(item.element_count(ItemType::Float64), 2);
        let mut values = [0.0; 2];
        item.read_f64s(8, &mut values).unwrap();
        assert_abs_diff_eq!(values[1], -2.25);
        assert!(matches!(
            item.write_f64s(8, &[0.0]),
            Err(IOError::ReadOnly { .. })
        ));
    }

    #[test]
    fn test_read_past_end_is_an_error() {
        let mut item = Item::in_memory("ds", "x", ItemMode::Read, vec![0, 0, 0, 2]);
        let mut buf = [0_i32; 1];
        assert!(matches!(
            item.read_i32s(4, &mut buf),
            Err(IOError::ShortRead { size: 4, .. })
        ));
    }

    #[test]
    fn test_lines() {
        let mut item = Item::in_memory("ds", "history", ItemMode::Write, vec![]);
        item.write_line("first").unwrap();
        item.write_line("second").unwrap();
        item.seek(0);
        assert_eq!(item.read_line().unwrap().as_deref(), Some(&b"first"[..]));
        assert_eq!(item.read_line().unwrap().as_deref(), Some(&b"second"[..]));
        assert_eq!(item.read_line().unwrap(), None);
    }

    #[test]
    fn test_complex_round_trip_through_file_cache() {
        let tmp_dir = tempdir().unwrap();
        let path = tmp_dir.path().join("cplx");
        let mut item = Item::on_disk("ds", "cplx", ItemMode::Write, &path).unwrap();
        item.write_tag(ItemType::Complex64).unwrap();
        let values: Vec<Complex32> = (0..1000)
            .map(|i| Complex32::new(i as f32, -(i as f32)))
            .collect();
        item.write_c64s(8, &values).unwrap();
        let mut back = vec![Complex32::default(); 1000];
        item.read_c64s(8, &mut back).unwrap();
        assert_eq!(back, values);
    }
}
