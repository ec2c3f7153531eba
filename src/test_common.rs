//! Synthetic uv datasets for unit tests.

use std::path::{Path, PathBuf};

use num_complex::Complex32;

use crate::uv::{encode_baseline, StreamMode, VisData};

/// Julian date of the first synthetic record.
pub const SYNTH_START_JD: f64 = 2_455_000.5;

/// A run of records sharing one spectral setup.
#[derive(Debug, Clone)]
pub struct SynthWindow {
    pub nchan: usize,
    pub nrecords: usize,
    pub nspect: i32,
    pub nwide: i32,
    /// `nschan`, if it should differ from `nchan`
    pub nschan: Option<i32>,
    pub ischan: i32,
    pub sdf: f64,
    pub sfreq: f64,
    pub npol: i32,
    /// flags for every record, all good if unset
    pub flags: Option<Vec<bool>>,
    /// raw bytes of the `source` variable, not written if unset
    pub source: Option<Vec<u8>>,
}

impl SynthWindow {
    pub fn new(nchan: usize, nrecords: usize) -> Self {
        Self {
            nchan,
            nrecords,
            nspect: 1,
            nwide: 0,
            nschan: None,
            ischan: 1,
            sdf: 0.0001,
            sfreq: 1.4,
            npol: 1,
            flags: None,
            source: None,
        }
    }
}

/// Data of synthetic record `record` (0-based over the whole dataset).
pub fn synth_data(record: usize, nchan: usize) -> Vec<Complex32> {
    (0..nchan)
        .map(|i| Complex32::new((record * nchan + i) as f32, -(i as f32)))
        .collect()
}

/// Write a dataset called `name` in `dir` with `r` correlations.
pub fn synth_vis(dir: &Path, name: &str, windows: &[SynthWindow]) -> PathBuf {
    synth_vis_with_corr(dir, name, 'r', windows)
}

/// Write a dataset called `name` in `dir`, one window after another.
pub fn synth_vis_with_corr(
    dir: &Path,
    name: &str,
    corr_type: char,
    windows: &[SynthWindow],
) -> PathBuf {
    let path = dir.join(name);
    let mut vis = VisData::open(&path, StreamMode::New).unwrap();
    vis.set_correlation_type(corr_type).unwrap();
    vis.dataset_mut().write_header_text("obstype", "crosscorrelation").unwrap();

    let mut record = 0;
    for window in windows {
        let flags = window
            .flags
            .clone()
            .unwrap_or_else(|| vec![true; window.nchan]);
        for _ in 0..window.nrecords {
            vis.put_var("telescop", "ATA").unwrap();
            vis.put_var("inttime", 10.0_f32).unwrap();
            vis.put_var("nspect", window.nspect).unwrap();
            vis.put_var("nwide", window.nwide).unwrap();
            vis.put_var("nschan", window.nschan.unwrap_or(window.nchan as i32))
                .unwrap();
            vis.put_var("ischan", window.ischan).unwrap();
            vis.put_var("sdf", window.sdf).unwrap();
            vis.put_var("sfreq", window.sfreq).unwrap();
            vis.put_var("restfreq", 1.420_405_75_f64).unwrap();
            vis.put_var("systemp", vec![40.0_f32, 50.0]).unwrap();
            vis.put_var("npol", window.npol).unwrap();
            if let Some(source) = &window.source {
                vis.put_var("source", source.as_slice()).unwrap();
            }
            vis.put_var("pol", -5 - (record as i32 % window.npol))
                .unwrap();

            let ant2 = 2 + (record / window.npol as usize) as u32 % 3;
            let preamble = [
                record as f64,
                2.0 * record as f64,
                0.0,
                SYNTH_START_JD + record as f64 * 1e-4,
                encode_baseline(1, ant2),
            ];
            vis.write(&preamble, &synth_data(record, window.nchan), &flags)
                .unwrap();
            record += 1;
        }
    }
    vis.close().unwrap();
    path
}
