//! Errors that can occur in the io module

use thiserror::Error;

#[derive(Error, Debug)]
#[allow(clippy::upper_case_acronyms)]
/// All the errors that can occur in item, dataset and uv stream operations
pub enum IOError {
    /// A dataset or item that was expected to exist does not.
    #[error("{dataset}: no such item or dataset \"{name}\"")]
    NotFound {
        /// The dataset path
        dataset: String,
        /// The item name (or the dataset path itself)
        name: String,
    },

    /// The item is already open on this dataset handle.
    #[error("{dataset}: item \"{name}\" is already open")]
    AlreadyOpen {
        /// The dataset path
        dataset: String,
        /// The item name
        name: String,
    },

    /// Tried to create a dataset at a path that already exists.
    #[error("cannot create dataset {path}: path already exists")]
    AlreadyExists {
        /// The offending path
        path: String,
    },

    /// The item is not open on this dataset handle.
    #[error("{dataset}: item \"{name}\" is not open")]
    NotOpen {
        /// The dataset path
        dataset: String,
        /// The item name
        name: String,
    },

    /// Attempted a write through a read-only handle.
    #[error("{dataset}: \"{name}\" was opened read-only")]
    ReadOnly {
        /// The dataset path
        dataset: String,
        /// The item name
        name: String,
    },

    /// The item name can't be represented in a dataset.
    #[error("invalid item name \"{name}\": {why}")]
    InvalidItemName {
        /// The offending name
        name: String,
        /// Why it was rejected
        why: &'static str,
    },

    /// An item holds a different type than the one requested.
    #[error("{dataset}: item \"{name}\" has type {found}, expected {expected}")]
    ItemTypeMismatch {
        /// The dataset path
        dataset: String,
        /// The item name
        name: String,
        /// The type that was requested
        expected: String,
        /// The type found on disk
        found: String,
    },

    /// Read past the end of an item.
    #[error("{dataset}: read of {len} bytes at offset {offset} is past the end of \"{name}\" ({size} bytes)")]
    ShortRead {
        /// The dataset path
        dataset: String,
        /// The item name
        name: String,
        /// The requested offset
        offset: u64,
        /// The requested length
        len: usize,
        /// The item size
        size: u64,
    },

    /// Structural problem in an on-disk item.
    #[error("{dataset}: corrupt \"{name}\": {why}")]
    Corrupt {
        /// The dataset path
        dataset: String,
        /// The item name
        name: String,
        /// Description of the inconsistency
        why: String,
    },

    /// A uv variable that doesn't exist in the stream.
    #[error("{dataset}: uv variable \"{name}\" is not present")]
    VarNotFound {
        /// The dataset path
        dataset: String,
        /// The variable name
        name: String,
    },

    /// A uv variable was accessed or written as the wrong type.
    #[error("{dataset}: uv variable \"{name}\" has type '{found}', expected '{expected}'")]
    VarTypeMismatch {
        /// The dataset path
        dataset: String,
        /// The variable name
        name: String,
        /// The requested type code
        expected: char,
        /// The type code in the vartable
        found: char,
    },

    /// The vartable can't hold any more variables.
    #[error("{dataset}: too many uv variables (max {max})")]
    TooManyVars {
        /// The dataset path
        dataset: String,
        /// The limit
        max: usize,
    },

    /// Invalid preamble layout, or a preamble of the wrong length.
    #[error("bad preamble: {0}")]
    Preamble(String),

    /// Caller-provided buffer too small for the record.
    #[error("record has {needed} channels but the buffer only holds {available}")]
    BufferTooSmall {
        /// Channels in the record
        needed: usize,
        /// Channels the buffer can hold
        available: usize,
    },

    /// Data and flag vectors disagree in length.
    #[error("data has {data} channels but flags has {flags}")]
    LengthMismatch {
        /// Length of the data vector
        data: usize,
        /// Length of the flags vector
        flags: usize,
    },

    /// An operation which needs a record before it was read.
    #[error("{dataset}: {op} requires a record to have been read")]
    NoCurrentRecord {
        /// The dataset path
        dataset: String,
        /// The operation attempted
        op: &'static str,
    },

    /// Operation not allowed in the handle's mode.
    #[error("{dataset}: {op} is not allowed in {mode} mode")]
    BadMode {
        /// The dataset path
        dataset: String,
        /// The operation attempted
        op: &'static str,
        /// The handle mode
        mode: String,
    },

    /// Correlation type other than `r`, `j` or `c`.
    #[error("invalid correlation type '{0}' (expected one of r, j, c)")]
    InvalidCorrType(char),

    #[error("{0}")]
    /// Error derived from [`std::io::Error`]
    StdIo(#[from] std::io::Error),
}
