use std::{fs, io::Write};

use approx::assert_abs_diff_eq;
use mirtask::{cli::main_with_args, Complex32, Dataset, DatasetMode, StreamMode, VisData, VisRecord};
use tempfile::tempdir;

mod common;
use common::{read_history, read_records, record_data, write_vis};

#[test]
fn test_chanaver_keywords_end_to_end() {
    let tmp_dir = tempdir().unwrap();
    let in_path = write_vis(tmp_dir.path(), "in.uv", 8, 3, 1.4);
    let out_path = tmp_dir.path().join("avg.uv");
    let vis_arg = format!("vis={}", in_path.display());
    let out_arg = format!("out={}", out_path.display());

    #[rustfmt::skip]
    let args = vec![
        "chanaver",
        vis_arg.as_str(),
        out_arg.as_str(),
        "naver=4",
        "--no-draw-progress",
    ];
    assert_eq!(main_with_args(&args), 0);

    let records = read_records(&out_path);
    assert_eq!(records.len(), 3);
    for (idx, record) in records.iter().enumerate() {
        let input = record_data(idx, 8);
        assert_eq!(record.nchan(), 2);
        assert_eq!(record.flags, vec![true, true]);
        // the last input channel is flagged, so the second bin averages three
        let first = input[..4].iter().sum::<Complex32>() / 4.0;
        let second = input[4..7].iter().sum::<Complex32>() / 3.0;
        assert_abs_diff_eq!(record.data[0], first, epsilon = 1e-4);
        assert_abs_diff_eq!(record.data[1], second, epsilon = 1e-4);
    }

    let mut out = VisData::open(&out_path, StreamMode::Old).unwrap();
    let mut record = VisRecord::default();
    assert!(out.read_record(&mut record).unwrap());
    assert_eq!(out.get_var_first_i32("nschan", 0).unwrap(), 2);
    assert_abs_diff_eq!(out.get_var_first_f64("sdf", 0.0).unwrap(), 0.002, epsilon = 1e-12);
    assert_abs_diff_eq!(out.get_var_first_f64("sfreq", 0.0).unwrap(), 1.40075, epsilon = 1e-12);
    out.close().unwrap();

    let mut dataset = Dataset::open(&out_path, DatasetMode::Read).unwrap();
    assert_eq!(dataset.read_header_i32("npol", 0).unwrap(), 1);

    let history = read_history(&out_path);
    assert!(history.iter().any(|line| line.starts_with("CHANAVER: channel average")));
    assert!(history.contains(&"CHANAVER:   naver=4".to_string()));
    assert_eq!(
        history.last().unwrap(),
        "CHANAVER: naver=4 slop=0.500000"
    );
}

#[test]
fn test_chanaver_param_file_multiple_inputs() {
    let tmp_dir = tempdir().unwrap();
    let first = write_vis(tmp_dir.path(), "a.uv", 8, 2, 1.4);
    let second = write_vis(tmp_dir.path(), "b.uv", 16, 2, 1.5);
    let out_path = tmp_dir.path().join("avg.uv");

    let param_path = tmp_dir.path().join("chanaver.par");
    let mut param_file = fs::File::create(&param_path).unwrap();
    writeln!(param_file, "# two inputs, different widths").unwrap();
    writeln!(param_file, "vis={},{}", first.display(), second.display()).unwrap();
    writeln!(param_file, "naver=2 slop=1").unwrap();
    drop(param_file);

    let param_arg = param_path.display().to_string();
    let out_arg = format!("out={}", out_path.display());
    #[rustfmt::skip]
    let args = vec![
        "chanaver",
        "-f", param_arg.as_str(),
        out_arg.as_str(),
        "--no-draw-progress",
    ];
    assert_eq!(main_with_args(&args), 0);

    let records = read_records(&out_path);
    assert_eq!(
        records.iter().map(VisRecord::nchan).collect::<Vec<_>>(),
        vec![4, 4, 8, 8]
    );
    // slop=1 needs every channel, and the last pair has a flagged channel
    assert_eq!(records[0].flags, vec![true, true, true, false]);
    assert_eq!(records[3].flags.iter().filter(|f| **f).count(), 7);

    let history = read_history(&out_path);
    assert!(history.contains(&"CHANAVER:   # two inputs, different widths".to_string()));
    assert!(history.contains(&"CHANAVER:   naver=2 slop=1".to_string()));
    assert_eq!(history.last().unwrap(), "CHANAVER: naver=2 slop=1.000000");
}

#[test]
fn test_chanaver_bad_structure_leaves_no_output() {
    let tmp_dir = tempdir().unwrap();
    let in_path = write_vis(tmp_dir.path(), "in.uv", 6, 2, 1.4);
    let out_path = tmp_dir.path().join("avg.uv");
    let vis_arg = format!("vis={}", in_path.display());
    let out_arg = format!("out={}", out_path.display());

    #[rustfmt::skip]
    let args = vec![
        "chanaver",
        vis_arg.as_str(),
        out_arg.as_str(),
        "naver=4",
        "--no-draw-progress",
    ];
    assert_eq!(main_with_args(&args), 1);
    assert!(!out_path.exists());
}

#[test]
fn test_chanaver_refuses_existing_output() {
    let tmp_dir = tempdir().unwrap();
    let in_path = write_vis(tmp_dir.path(), "in.uv", 4, 1, 1.4);
    let out_path = write_vis(tmp_dir.path(), "taken.uv", 4, 1, 1.4);
    let vis_arg = format!("vis={}", in_path.display());
    let out_arg = format!("out={}", out_path.display());

    assert_eq!(
        main_with_args([
            "chanaver",
            vis_arg.as_str(),
            out_arg.as_str(),
            "naver=2",
            "--no-draw-progress",
        ]),
        1
    );
    // untouched
    assert_eq!(read_records(&out_path).len(), 1);
}
