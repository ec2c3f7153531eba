//! The `history` item: an append-only log of text lines.

use std::fs;

use chrono::{DateTime, Timelike, Utc};
use log::trace;

use super::{dataset::Dataset, error::IOError, item::ItemMode};

/// Name of the history item.
pub const HISTORY_ITEM: &str = "history";

/// Argument which marks the next argument as a parameter file.
pub const PARAM_FILE_FLAG: &str = "-f";

/// How the history is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryMode {
    /// Read lines from the start
    Read,
    /// Start a fresh history
    Write,
    /// Add lines after the existing history
    Append,
}

/// Format a timestamp the way history entries record it, e.g.
/// `09JAN15:12:34:56.7`.
pub fn format_history_date(time: &DateTime<Utc>) -> String {
    let tenths = time.nanosecond().min(999_999_999) / 100_000_000;
    format!("{}.{}", time.format("%y%b%d:%H:%M:%S"), tenths).to_uppercase()
}

impl Dataset {
    /// Open the history item.
    pub fn open_history(&mut self, mode: HistoryMode) -> Result<(), IOError> {
        let item = match mode {
            HistoryMode::Read => self.open_item(HISTORY_ITEM, ItemMode::Read)?,
            HistoryMode::Write => self.open_item(HISTORY_ITEM, ItemMode::Write)?,
            HistoryMode::Append => self.open_item(HISTORY_ITEM, ItemMode::Append)?,
        };
        let start = match mode {
            HistoryMode::Append => item.size(),
            _ => 0,
        };
        item.seek(start);
        Ok(())
    }

    /// Append a line to the open history.
    pub fn write_history(&mut self, line: &str) -> Result<(), IOError> {
        trace!("{}: history += {}", self.name(), line);
        self.item_mut(HISTORY_ITEM)?.write_line(line)
    }

    /// Read the next line of the open history, or `None` at the end.
    /// Bytes that are not UTF-8 are replaced.
    pub fn read_history(&mut self) -> Result<Option<String>, IOError> {
        Ok(self
            .item_mut(HISTORY_ITEM)?
            .read_line()?
            .map(|line| String::from_utf8_lossy(&line).into_owned()))
    }

    /// Close the history item.
    pub fn close_history(&mut self) -> Result<(), IOError> {
        self.close_item(HISTORY_ITEM)
    }

    /// Record that task `ident` was run now with `args`.
    ///
    /// Writes the date and a heading, then one indented line per argument.
    /// An argument equal to [`PARAM_FILE_FLAG`] is not logged itself; the
    /// argument after it names a file whose lines are logged instead.
    pub fn log_invocation<S: AsRef<str>>(&mut self, ident: &str, args: &[S]) -> Result<(), IOError> {
        self.log_invocation_at(ident, args, &Utc::now())
    }

    /// [`Dataset::log_invocation`] with an explicit timestamp.
    pub fn log_invocation_at<S: AsRef<str>>(
        &mut self,
        ident: &str,
        args: &[S],
        time: &DateTime<Utc>,
    ) -> Result<(), IOError> {
        self.write_history(&format!(
            "{}: Executed on: {}",
            ident,
            format_history_date(time)
        ))?;
        self.write_history(&format!("{}: Command line inputs follow:", ident))?;

        let mut param_file_next = false;
        for arg in args.iter().map(AsRef::as_ref) {
            if param_file_next {
                for line in fs::read_to_string(arg)?.lines() {
                    self.write_history(&format!("{}:   {}", ident, line))?;
                }
                param_file_next = false;
            } else if arg == PARAM_FILE_FLAG {
                param_file_next = true;
            } else {
                self.write_history(&format!("{}:   {}", ident, arg))?;
            }
        }
        Ok(())
    }
}
