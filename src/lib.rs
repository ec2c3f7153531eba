#![warn(missing_docs)]
#![warn(clippy::missing_safety_doc)]
#![warn(clippy::missing_errors_doc)]

//! mirtask reads and writes MIRIAD uv datasets, and averages their spectral
//! channels.
//!
//! A MIRIAD dataset is a directory of named items. The [`io`] module is the
//! item store: typed items, the packed `header`, the `history` log and
//! packed flag masks. The [`uv`] module builds visibility streams on top of
//! it: records of a preamble, correlation data and per-channel flags, along
//! with named variables that change from record to record.
//!
//! [`averaging::channel_average`] consumes one or more input streams through
//! a [`source::VisSource`] and writes a new dataset with every run of `naver`
//! channels averaged into one.
//!
//! # Examples
//!
//! ```rust
//! use mirtask::{
//!     averaging::{channel_average, ChanAverageParamsBuilder},
//!     source::VisInputs,
//!     uv::{encode_baseline, StreamMode, VisData},
//!     Complex32,
//! };
//! use tempfile::tempdir;
//!
//! let tmp_dir = tempdir().unwrap();
//! let in_path = tmp_dir.path().join("in.uv");
//!
//! // write a single 8 channel record
//! let mut vis = VisData::open(&in_path, StreamMode::New).unwrap();
//! vis.put_var("nspect", 1_i32).unwrap();
//! vis.put_var("nwide", 0_i32).unwrap();
//! vis.put_var("nschan", 8_i32).unwrap();
//! vis.put_var("ischan", 1_i32).unwrap();
//! vis.put_var("sdf", 0.0001_f64).unwrap();
//! vis.put_var("sfreq", 1.4_f64).unwrap();
//! let preamble = [0.0, 0.0, 0.0, 2455000.5, encode_baseline(1, 2)];
//! let data = vec![Complex32::new(1.0, 0.0); 8];
//! vis.write(&preamble, &data, &[true; 8]).unwrap();
//! vis.close().unwrap();
//!
//! // average pairs of channels
//! let mut inputs = VisInputs::new(&[&in_path]).unwrap();
//! let params = ChanAverageParamsBuilder::default()
//!     .naver(2_usize)
//!     .draw_progress(false)
//!     .build()
//!     .unwrap();
//! let out_path = tmp_dir.path().join("out.uv");
//! let summary = channel_average(&mut inputs, &out_path, &params).unwrap();
//! assert_eq!(summary.num_records, 1);
//! assert_eq!(summary.plans[0].nout, 4);
//! ```

use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use lazy_static::lazy_static;

pub mod averaging;
pub mod error;
pub mod io;
pub mod source;
pub mod uv;

#[cfg(feature = "cli")]
pub mod cli;

#[cfg(test)]
pub(crate) mod test_common;

pub use averaging::{channel_average, AverageSummary, ChanAverageParams, ChannelPlan};
pub use error::{CLIError, MirError};
pub use io::{
    dataset::{Dataset, DatasetMode},
    error::IOError,
};
pub use num_complex::Complex32;
pub use source::{VisInputs, VisSource};
pub use uv::{StreamMode, Value, VarTracker, VarType, VisData, VisRecord};

lazy_static! {
    static ref DURATIONS: Mutex<HashMap<String, Duration>> = Mutex::new(HashMap::new());
}

/// Add `elapsed` to the running total for the stage `name`.
pub fn increment_duration(name: &str, elapsed: Duration) {
    let mut durations = DURATIONS.lock().unwrap_or_else(PoisonError::into_inner);
    *durations.entry(name.to_string()).or_insert(Duration::ZERO) += elapsed;
}

/// Time spent in each named stage so far in this process.
pub fn get_durations() -> HashMap<String, Duration> {
    DURATIONS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Evaluate an expression, adding the time it took to the stage `$name`
/// (see [`get_durations`]).
#[macro_export]
macro_rules! with_increment_duration {
    ($name:expr, $body:expr) => {{
        let _now = std::time::Instant::now();
        let _res = $body;
        $crate::increment_duration($name, _now.elapsed());
        _res
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_increment_duration_accumulates() {
        let value = with_increment_duration!("test_accumulate", 1 + 1);
        assert_eq!(value, 2);
        let first = get_durations()["test_accumulate"];
        with_increment_duration!("test_accumulate", {
            std::thread::sleep(Duration::from_millis(2));
        });
        assert!(get_durations()["test_accumulate"] >= first + Duration::from_millis(2));
    }
}
