use std::path::{Path, PathBuf};

use mirtask::{
    io::HistoryMode,
    uv::encode_baseline,
    Complex32, Dataset, StreamMode, VisData, VisRecord,
};

/// Data of record `record` in a dataset written by [`write_vis`].
pub fn record_data(record: usize, nchan: usize) -> Vec<Complex32> {
    (0..nchan)
        .map(|i| Complex32::new((record * nchan + i) as f32, 1.0))
        .collect()
}

/// Write `nrecords` single-window records of `nchan` channels to `dir/name`,
/// with the last channel of every record flagged.
pub fn write_vis(dir: &Path, name: &str, nchan: usize, nrecords: usize, sfreq: f64) -> PathBuf {
    let path = dir.join(name);
    let mut vis = VisData::open(&path, StreamMode::New).unwrap();
    vis.set_correlation_type('r').unwrap();
    let mut flags = vec![true; nchan];
    flags[nchan - 1] = false;
    for record in 0..nrecords {
        vis.put_var("nspect", 1_i32).unwrap();
        vis.put_var("nwide", 0_i32).unwrap();
        vis.put_var("nschan", nchan as i32).unwrap();
        vis.put_var("ischan", 1_i32).unwrap();
        vis.put_var("sdf", 0.0005_f64).unwrap();
        vis.put_var("sfreq", sfreq).unwrap();
        vis.put_var("npol", 1_i32).unwrap();
        vis.put_var("pol", -5_i32).unwrap();
        let preamble = [0.0, 0.0, 0.0, 2_455_000.5 + record as f64 * 1e-4, encode_baseline(1, 2)];
        vis.write(&preamble, &record_data(record, nchan), &flags)
            .unwrap();
    }
    vis.close().unwrap();
    path
}

pub fn read_records(path: &Path) -> Vec<VisRecord> {
    let mut vis = VisData::open(path, StreamMode::Old).unwrap();
    let mut records = vec![];
    let mut record = VisRecord::default();
    while vis.read_record(&mut record).unwrap() {
        records.push(record.clone());
    }
    vis.close().unwrap();
    records
}

pub fn read_history(path: &Path) -> Vec<String> {
    let mut dataset = Dataset::open(path, mirtask::DatasetMode::Read).unwrap();
    dataset.open_history(HistoryMode::Read).unwrap();
    let mut lines = vec![];
    while let Some(line) = dataset.read_history().unwrap() {
        lines.push(line);
    }
    dataset.close_history().unwrap();
    lines
}
