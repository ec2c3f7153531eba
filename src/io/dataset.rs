//! Dataset handles.
//!
//! A dataset is a directory of items. Items of at most [`MAX_HEADER_ITEM`]
//! bytes are packed into a single file called `header`; everything else,
//! and the stream items listed in [`STREAM_ITEMS`], gets a file of its own.
//!
//! The `header` file is a run of entries, each a 16 byte block holding the
//! item name (NUL padded, at most 15 bytes) with the payload size in its last
//! byte, followed by the payload padded out to a multiple of 16 bytes.

use std::{
    collections::HashMap,
    fmt::Display,
    fs,
    path::{Path, PathBuf},
};

use indexmap::IndexMap;
use log::{debug, trace, warn};
use num_complex::Complex32;

use super::{
    error::IOError,
    item::{Item, ItemMode, ItemType},
};
use crate::uv::variable::{read_value, write_value, Value, VarType};

/// Name of the file holding packed small items.
pub const HEADER_FILE: &str = "header";

/// The largest item that is kept in the `header` file.
pub const MAX_HEADER_ITEM: usize = 64;

/// Items which always live in a file of their own.
pub const STREAM_ITEMS: [&str; 5] = ["history", "vartable", "visdata", "flags", "wflags"];

const MAX_NAME_LEN: usize = 15;
const HEADER_BLOCK: usize = 16;

/// How a dataset is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetMode {
    /// An existing dataset, read only
    Read,
    /// A new dataset; the path must not exist
    Create,
    /// An existing dataset, read and write
    Append,
}

impl Display for DatasetMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Read => "read",
                Self::Create => "create",
                Self::Append => "append",
            }
        )
    }
}

/// Check that `name` can be stored as an item.
pub fn validate_item_name(name: &str) -> Result<(), IOError> {
    let why = if name.is_empty() {
        Some("empty name")
    } else if name.len() > MAX_NAME_LEN {
        Some("longer than 15 bytes")
    } else if name == HEADER_FILE {
        Some("reserved name")
    } else if !name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-')
    {
        Some("only lowercase letters, digits, '_' and '-' are allowed")
    } else {
        None
    };
    match why {
        Some(why) => Err(IOError::InvalidItemName {
            name: name.to_string(),
            why,
        }),
        None => Ok(()),
    }
}

fn parse_header(dataset: &str, bytes: &[u8]) -> Result<IndexMap<String, Vec<u8>>, IOError> {
    let corrupt = |why: String| IOError::Corrupt {
        dataset: dataset.to_string(),
        name: HEADER_FILE.to_string(),
        why,
    };
    let mut items = IndexMap::new();
    let mut pos = 0;
    while pos < bytes.len() {
        if pos + HEADER_BLOCK > bytes.len() {
            return Err(corrupt(format!("truncated entry at byte {}", pos)));
        }
        let block = &bytes[pos..pos + HEADER_BLOCK];
        let name_len = block[..MAX_NAME_LEN]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(MAX_NAME_LEN);
        let name = String::from_utf8_lossy(&block[..name_len]).into_owned();
        let size = block[MAX_NAME_LEN] as usize;
        pos += HEADER_BLOCK;
        if pos + size > bytes.len() {
            return Err(corrupt(format!("payload of \"{}\" runs past the end", name)));
        }
        items.insert(name, bytes[pos..pos + size].to_vec());
        pos += padded_len(size);
    }
    Ok(items)
}

fn read_typed(item: &mut Item, dataset: &str) -> Result<Value, IOError> {
    let item_type = item.probe_type()?;
    let var_type =
        VarType::from_item_type(item_type).ok_or_else(|| IOError::ItemTypeMismatch {
            dataset: dataset.to_string(),
            name: item.name().to_string(),
            expected: "numeric or character".to_string(),
            found: item_type.to_string(),
        })?;
    let offset = item_type.data_offset();
    let n_bytes = item.size().saturating_sub(offset) as usize;
    read_value(item, offset, var_type, n_bytes)
}

fn padded_len(len: usize) -> usize {
    (len + HEADER_BLOCK - 1) / HEADER_BLOCK * HEADER_BLOCK
}

fn encode_header(items: &IndexMap<String, Vec<u8>>) -> Vec<u8> {
    let mut bytes = vec![];
    for (name, payload) in items {
        let mut block = [0_u8; HEADER_BLOCK];
        block[..name.len()].copy_from_slice(name.as_bytes());
        block[MAX_NAME_LEN] = payload.len() as u8;
        bytes.extend_from_slice(&block);
        bytes.extend_from_slice(payload);
        let padded = padded_len(payload.len());
        bytes.resize(bytes.len() + padded - payload.len(), 0);
    }
    bytes
}

/// An open dataset. Open items are owned by the dataset and borrowed out
/// through [`Dataset::item_mut`].
///
/// Nothing guards against another process touching the same directory while
/// it is open.
pub struct Dataset {
    path: PathBuf,
    name: String,
    mode: DatasetMode,
    header: IndexMap<String, Vec<u8>>,
    header_dirty: bool,
    items: HashMap<String, Item>,
    closed: bool,
}

impl Dataset {
    /// Open the dataset at `path`.
    ///
    /// # Errors
    ///
    /// - [`IOError::NotFound`] if reading or appending to a missing dataset
    /// - [`IOError::AlreadyExists`] if creating over an existing path
    /// - [`IOError::Corrupt`] if the `header` file can't be parsed
    pub fn open<P: AsRef<Path>>(path: P, mode: DatasetMode) -> Result<Self, IOError> {
        let path = path.as_ref().to_path_buf();
        let name = path.display().to_string();
        let header = match mode {
            DatasetMode::Create => {
                if path.exists() {
                    return Err(IOError::AlreadyExists { path: name });
                }
                fs::create_dir(&path)?;
                IndexMap::new()
            }
            DatasetMode::Read | DatasetMode::Append => {
                if !path.is_dir() {
                    return Err(IOError::NotFound {
                        dataset: name.clone(),
                        name,
                    });
                }
                let header_path = path.join(HEADER_FILE);
                if header_path.is_file() {
                    parse_header(&name, &fs::read(header_path)?)?
                } else {
                    IndexMap::new()
                }
            }
        };
        debug!("opened dataset {} ({} mode)", name, mode);
        Ok(Self {
            path,
            name,
            mode,
            header,
            header_dirty: mode == DatasetMode::Create,
            items: HashMap::new(),
            closed: false,
        })
    }

    /// The dataset directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The dataset path as displayed in messages.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The mode the dataset was opened with.
    pub fn mode(&self) -> DatasetMode {
        self.mode
    }

    fn is_writable(&self) -> bool {
        self.mode != DatasetMode::Read
    }

    /// Allow items of a dataset opened for reading to be rewritten.
    pub(crate) fn allow_writes(&mut self) {
        if self.mode == DatasetMode::Read {
            debug!("{}: reopened for writing", self.name);
            self.mode = DatasetMode::Append;
        }
    }

    /// Whether the dataset contains the item `name`.
    pub fn has_item(&self, name: &str) -> bool {
        name != HEADER_FILE
            && (self.items.contains_key(name)
                || self.header.contains_key(name)
                || self.path.join(name).is_file())
    }

    /// Names of all items in the dataset: header items in stored order, then
    /// file items sorted by name.
    pub fn item_names(&self) -> Result<Vec<String>, IOError> {
        let mut names: Vec<String> = self.header.keys().cloned().collect();
        let mut files = vec![];
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if file_name != HEADER_FILE && !self.header.contains_key(&file_name) {
                files.push(file_name);
            }
        }
        for name in self.items.keys() {
            if !self.header.contains_key(name) && !files.contains(name) {
                files.push(name.clone());
            }
        }
        files.sort();
        names.extend(files);
        Ok(names)
    }

    /// Open the item `name`. Items not yet closed can't be opened again.
    ///
    /// # Errors
    ///
    /// - [`IOError::AlreadyOpen`] if the item is open
    /// - [`IOError::ReadOnly`] for a write mode on a read-only dataset
    /// - [`IOError::NotFound`] when reading a missing item
    pub fn open_item(&mut self, name: &str, mode: ItemMode) -> Result<&mut Item, IOError> {
        validate_item_name(name)?;
        if self.items.contains_key(name) {
            return Err(IOError::AlreadyOpen {
                dataset: self.name.clone(),
                name: name.to_string(),
            });
        }
        if mode.is_writable() && !self.is_writable() {
            return Err(IOError::ReadOnly {
                dataset: self.name.clone(),
                name: name.to_string(),
            });
        }
        let file_path = self.path.join(name);
        let is_stream = STREAM_ITEMS.contains(&name);
        let item = match mode {
            ItemMode::Read | ItemMode::Append => {
                if let Some(bytes) = self.header.get(name) {
                    Item::in_memory(&self.name, name, mode, bytes.clone())
                } else if file_path.is_file() || (mode == ItemMode::Append && is_stream) {
                    Item::on_disk(&self.name, name, mode, &file_path)?
                } else if mode == ItemMode::Append {
                    Item::in_memory(&self.name, name, mode, vec![])
                } else {
                    return Err(IOError::NotFound {
                        dataset: self.name.clone(),
                        name: name.to_string(),
                    });
                }
            }
            ItemMode::Write | ItemMode::Scratch => {
                if is_stream {
                    Item::on_disk(&self.name, name, mode, &file_path)?
                } else {
                    Item::in_memory(&self.name, name, mode, vec![])
                }
            }
        };
        trace!("{}: opened item {} ({:?})", self.name, name, mode);
        Ok(self.items.entry(name.to_string()).or_insert(item))
    }

    /// Borrow an open item.
    pub fn item_mut(&mut self, name: &str) -> Result<&mut Item, IOError> {
        let dataset = &self.name;
        self.items.get_mut(name).ok_or_else(|| IOError::NotOpen {
            dataset: dataset.clone(),
            name: name.to_string(),
        })
    }

    /// Whether the item `name` is currently open.
    pub fn is_open(&self, name: &str) -> bool {
        self.items.contains_key(name)
    }

    /// Close an open item, committing it to the header or to its own file.
    pub fn close_item(&mut self, name: &str) -> Result<(), IOError> {
        let item = self.items.remove(name).ok_or_else(|| IOError::NotOpen {
            dataset: self.name.clone(),
            name: name.to_string(),
        })?;
        let mode = item.mode();
        let file_path = item.file_path().map(Path::to_path_buf);
        match item.finish()? {
            Some(bytes) if mode == ItemMode::Write || mode == ItemMode::Append => {
                self.store(name, bytes)?;
            }
            Some(_) => {}
            None => {
                if mode == ItemMode::Scratch {
                    if let Some(path) = file_path {
                        fs::remove_file(path)?;
                    }
                } else if mode.is_writable() && self.header.shift_remove(name).is_some() {
                    self.header_dirty = true;
                }
            }
        }
        trace!("{}: closed item {}", self.name, name);
        Ok(())
    }

    fn store(&mut self, name: &str, bytes: Vec<u8>) -> Result<(), IOError> {
        let file_path = self.path.join(name);
        if bytes.len() <= MAX_HEADER_ITEM && !STREAM_ITEMS.contains(&name) {
            self.header.insert(name.to_string(), bytes);
            self.header_dirty = true;
            if file_path.is_file() {
                fs::remove_file(file_path)?;
            }
        } else {
            fs::write(file_path, bytes)?;
            if self.header.shift_remove(name).is_some() {
                self.header_dirty = true;
            }
        }
        Ok(())
    }

    /// Remove the item `name`.
    pub fn delete_item(&mut self, name: &str) -> Result<(), IOError> {
        validate_item_name(name)?;
        if self.items.contains_key(name) {
            return Err(IOError::AlreadyOpen {
                dataset: self.name.clone(),
                name: name.to_string(),
            });
        }
        if !self.is_writable() {
            return Err(IOError::ReadOnly {
                dataset: self.name.clone(),
                name: name.to_string(),
            });
        }
        let file_path = self.path.join(name);
        let in_header = self.header.shift_remove(name).is_some();
        if in_header {
            self.header_dirty = true;
        }
        if file_path.is_file() {
            fs::remove_file(file_path)?;
        } else if !in_header {
            return Err(IOError::NotFound {
                dataset: self.name.clone(),
                name: name.to_string(),
            });
        }
        Ok(())
    }

    /// Write out buffered item data and the header.
    pub fn flush(&mut self) -> Result<(), IOError> {
        for item in self.items.values_mut() {
            item.flush()?;
        }
        if self.header_dirty {
            fs::write(self.path.join(HEADER_FILE), encode_header(&self.header))?;
            self.header_dirty = false;
        }
        Ok(())
    }

    fn close_all(&mut self) -> Result<(), IOError> {
        let names: Vec<String> = self.items.keys().cloned().collect();
        for name in names {
            self.close_item(&name)?;
        }
        self.flush()
    }

    /// Close every open item and write the header.
    pub fn close(mut self) -> Result<(), IOError> {
        self.closed = true;
        self.close_all()
    }

    /// Remove the dataset from disk, items and all.
    ///
    /// Failing to remove the directory itself (say, because something else
    /// put a file in it) is logged rather than returned.
    pub fn delete_all(mut self) -> Result<(), IOError> {
        self.closed = true;
        self.items.clear();
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                fs::remove_file(entry.path())?;
            }
        }
        if let Err(e) = fs::remove_dir(&self.path) {
            warn!("could not remove dataset directory {}: {}", self.name, e);
        }
        debug!("deleted dataset {}", self.name);
        Ok(())
    }

    /// Type and element count of item `name`, if it exists.
    pub fn header_info(&mut self, name: &str) -> Result<Option<(ItemType, usize)>, IOError> {
        if !self.has_item(name) {
            return Ok(None);
        }
        let item = self.open_item(name, ItemMode::Read)?;
        let item_type = item.probe_type();
        let info = item_type.map(|t| {
            let count = match t {
                ItemType::Text => item.size() as usize,
                _ => item.element_count(t),
            };
            (t, count)
        });
        self.close_item(name)?;
        info.map(Some)
    }

    /// Read the whole of header item `name` as a typed array.
    ///
    /// Returns `None` if the item is absent.
    pub fn get_array_header(&mut self, name: &str) -> Result<Option<Value>, IOError> {
        if !self.has_item(name) {
            return Ok(None);
        }
        let dataset = self.name.clone();
        let item = self.open_item(name, ItemMode::Read)?;
        let result = read_typed(item, &dataset);
        self.close_item(name)?;
        result.map(Some)
    }

    /// Replace header item `name` with `value`.
    pub fn write_array_header(&mut self, name: &str, value: &Value) -> Result<(), IOError> {
        let item = self.open_item(name, ItemMode::Write)?;
        let item_type = value.var_type().item_type();
        let result = item
            .write_tag(item_type)
            .and_then(|_| write_value(item, item_type.data_offset(), value));
        self.close_item(name)?;
        result
    }

    fn header_scalar(&mut self, name: &str) -> Result<Option<Value>, IOError> {
        match self.get_array_header(name)? {
            Some(value) if value.is_empty() => Err(IOError::Corrupt {
                dataset: self.name.clone(),
                name: name.to_string(),
                why: "empty header item".to_string(),
            }),
            other => Ok(other),
        }
    }

    fn scalar_mismatch(&self, name: &str, expected: &str, value: &Value) -> IOError {
        IOError::ItemTypeMismatch {
            dataset: self.name.clone(),
            name: name.to_string(),
            expected: expected.to_string(),
            found: value.var_type().item_type().to_string(),
        }
    }

    /// Read integer header item `name`, or `default` if it is absent.
    pub fn read_header_i32(&mut self, name: &str, default: i32) -> Result<i32, IOError> {
        match self.header_scalar(name)? {
            None => Ok(default),
            Some(value) => match value.first_i64() {
                Some(x) => Ok(x as i32),
                None => Err(self.scalar_mismatch(name, "integer", &value)),
            },
        }
    }

    /// Read 64-bit integer header item `name`, or `default` if it is absent.
    pub fn read_header_i64(&mut self, name: &str, default: i64) -> Result<i64, IOError> {
        match self.header_scalar(name)? {
            None => Ok(default),
            Some(value) => value
                .first_i64()
                .ok_or_else(|| self.scalar_mismatch(name, "integer*8", &value)),
        }
    }

    /// Read real header item `name`, or `default` if it is absent.
    pub fn read_header_f32(&mut self, name: &str, default: f32) -> Result<f32, IOError> {
        self.read_header_f64(name, f64::from(default))
            .map(|x| x as f32)
    }

    /// Read double header item `name`, or `default` if it is absent. Any
    /// real numeric type is accepted.
    pub fn read_header_f64(&mut self, name: &str, default: f64) -> Result<f64, IOError> {
        match self.header_scalar(name)? {
            None => Ok(default),
            Some(value @ Value::C64(_)) => Err(self.scalar_mismatch(name, "double", &value)),
            Some(value) => value
                .first_f64()
                .ok_or_else(|| self.scalar_mismatch(name, "double", &value)),
        }
    }

    /// Read complex header item `name`, or `default` if it is absent.
    pub fn read_header_c64(
        &mut self,
        name: &str,
        default: Complex32,
    ) -> Result<Complex32, IOError> {
        match self.header_scalar(name)? {
            None => Ok(default),
            Some(Value::C64(v)) => Ok(v[0]),
            Some(value) => Err(self.scalar_mismatch(name, "complex", &value)),
        }
    }

    /// Read string header item `name`, or `default` if it is absent.
    pub fn read_header_text(&mut self, name: &str, default: &str) -> Result<String, IOError> {
        match self.get_array_header(name)? {
            None => Ok(default.to_string()),
            Some(Value::Text(bytes)) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Some(value) => Err(self.scalar_mismatch(name, "character", &value)),
        }
    }

    /// Write integer header item `name`.
    pub fn write_header_i32(&mut self, name: &str, value: i32) -> Result<(), IOError> {
        self.write_array_header(name, &Value::from(value))
    }

    /// Write 64-bit integer header item `name`.
    pub fn write_header_i64(&mut self, name: &str, value: i64) -> Result<(), IOError> {
        self.write_array_header(name, &Value::from(value))
    }

    /// Write real header item `name`.
    pub fn write_header_f32(&mut self, name: &str, value: f32) -> Result<(), IOError> {
        self.write_array_header(name, &Value::from(value))
    }

    /// Write double header item `name`.
    pub fn write_header_f64(&mut self, name: &str, value: f64) -> Result<(), IOError> {
        self.write_array_header(name, &Value::from(value))
    }

    /// Write complex header item `name`.
    pub fn write_header_c64(&mut self, name: &str, value: Complex32) -> Result<(), IOError> {
        self.write_array_header(name, &Value::from(value))
    }

    /// Write string header item `name`.
    pub fn write_header_text(&mut self, name: &str, value: &str) -> Result<(), IOError> {
        self.write_array_header(name, &Value::from(value))
    }

    /// Copy item `name` verbatim into `dest`. Returns false, doing nothing,
    /// when this dataset has no such item.
    pub fn copy_item(&mut self, dest: &mut Dataset, name: &str) -> Result<bool, IOError> {
        if !self.has_item(name) {
            return Ok(false);
        }
        let bytes = {
            let item = self.open_item(name, ItemMode::Read)?;
            let bytes = item.read_all();
            self.close_item(name)?;
            bytes?
        };
        let item = dest.open_item(name, ItemMode::Write)?;
        let result = item.write_bytes(0, &bytes);
        dest.close_item(name)?;
        result?;
        trace!("copied item {} from {} to {}", name, self.name, dest.name);
        Ok(true)
    }
}

impl Drop for Dataset {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.close_all() {
                warn!("error closing dataset {}: {}", self.name, e);
            }
        }
    }
}
