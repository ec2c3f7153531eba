//! The MIRIAD item store.
//!
//! A dataset is a directory of named items. Small items are packed into the
//! dataset's `header` file, everything else gets a file of its own.

pub mod dataset;
pub mod error;
pub mod history;
pub mod item;
pub mod mask;

pub use dataset::{Dataset, DatasetMode};
pub use error::IOError;
pub use history::HistoryMode;
pub use item::{Item, ItemMode, ItemType};
