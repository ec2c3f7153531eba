//! Where the averaging engine gets its records from.

use std::path::{Path, PathBuf};

use log::{debug, trace};

use crate::{
    error::MirError,
    uv::{PreambleLayout, StreamMode, VisData, VisRecord},
};

/// A sequence of records, drawn from one input stream at a time.
///
/// Records are yielded in the order the inputs produce them. An input is
/// exhausted, and closed, before the next one is opened, so consumers can
/// scope their bookkeeping to [`VisSource::input_index`] changes.
pub trait VisSource {
    /// Read the next record into `record`. Returns false once every input
    /// is exhausted.
    ///
    /// # Errors
    ///
    /// Whatever reading or opening an input raises.
    fn read_next(&mut self, record: &mut VisRecord) -> Result<bool, MirError>;

    /// The input the last record came from.
    fn current(&self) -> Option<&VisData>;

    /// Mutable access to the input the last record came from.
    fn current_mut(&mut self) -> Option<&mut VisData>;

    /// Position of the current input in the input list.
    fn input_index(&self) -> usize;

    /// Name of the current input.
    fn input_name(&self) -> String {
        self.current()
            .map(|vis| vis.name().to_string())
            .unwrap_or_default()
    }
}

/// Reads a list of uv datasets back to back.
pub struct VisInputs {
    paths: Vec<PathBuf>,
    layout: PreambleLayout,
    index: usize,
    current: Option<VisData>,
}

impl VisInputs {
    /// Open the first of `paths` with the default `uvw/time/baseline`
    /// preamble.
    ///
    /// # Errors
    ///
    /// - [`MirError::NoInputs`] if `paths` is empty
    /// - anything opening the first dataset raises
    pub fn new<P: AsRef<Path>>(paths: &[P]) -> Result<Self, MirError> {
        Self::with_layout(paths, PreambleLayout::default())
    }

    /// Like [`VisInputs::new`], reading every input with `layout`.
    ///
    /// # Errors
    ///
    /// See [`VisInputs::new`].
    pub fn with_layout<P: AsRef<Path>>(
        paths: &[P],
        layout: PreambleLayout,
    ) -> Result<Self, MirError> {
        if paths.is_empty() {
            return Err(MirError::NoInputs);
        }
        let mut inputs = Self {
            paths: paths.iter().map(|p| p.as_ref().to_path_buf()).collect(),
            layout,
            index: 0,
            current: None,
        };
        inputs.current = Some(inputs.open(0)?);
        Ok(inputs)
    }

    fn open(&self, index: usize) -> Result<VisData, MirError> {
        let path = &self.paths[index];
        debug!(
            "opening input {} of {}: {}",
            index + 1,
            self.paths.len(),
            path.display()
        );
        let mut vis = VisData::open(path, StreamMode::Old)?;
        vis.set_preamble_layout(self.layout.clone())?;
        Ok(vis)
    }

    /// Number of inputs.
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// Always false; construction requires at least one input.
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// The input paths.
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

impl VisSource for VisInputs {
    fn read_next(&mut self, record: &mut VisRecord) -> Result<bool, MirError> {
        loop {
            let vis = match self.current.as_mut() {
                Some(vis) => vis,
                None => return Ok(false),
            };
            if vis.read_record(record)? {
                return Ok(true);
            }
            if let Some(vis) = self.current.take() {
                trace!("{}: exhausted", vis.name());
                vis.close()?;
            }
            if self.index + 1 < self.paths.len() {
                self.index += 1;
                self.current = Some(self.open(self.index)?);
            }
        }
    }

    fn current(&self) -> Option<&VisData> {
        self.current.as_ref()
    }

    fn current_mut(&mut self) -> Option<&mut VisData> {
        self.current.as_mut()
    }

    fn input_index(&self) -> usize {
        self.index
    }

    fn input_name(&self) -> String {
        match &self.current {
            Some(vis) => vis.name().to_string(),
            None => self.paths[self.index].display().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_common::{synth_data, synth_vis, SynthWindow};
    use tempfile::tempdir;

    #[test]
    fn test_no_inputs() {
        assert!(matches!(
            VisInputs::new::<&str>(&[]),
            Err(MirError::NoInputs)
        ));
    }

    #[test]
    fn test_missing_input() {
        let tmp_dir = tempdir().unwrap();
        assert!(matches!(
            VisInputs::new(&[tmp_dir.path().join("nope.uv")]),
            Err(MirError::IOError(_))
        ));
    }

    #[test]
    fn test_reads_inputs_in_order() {
        let tmp_dir = tempdir().unwrap();
        let first = synth_vis(tmp_dir.path(), "a.uv", &[SynthWindow::new(4, 2)]);
        let second = synth_vis(tmp_dir.path(), "b.uv", &[SynthWindow::new(8, 3)]);
        let mut inputs = VisInputs::new(&[&first, &second]).unwrap();
        assert_eq!(inputs.len(), 2);
        assert_eq!(inputs.input_index(), 0);

        let mut record = VisRecord::default();
        let mut seen = vec![];
        while inputs.read_next(&mut record).unwrap() {
            assert_eq!(record.preamble.len(), 5);
            seen.push((inputs.input_index(), record.nchan(), record.data.clone()));
        }
        assert_eq!(seen.len(), 5);
        assert_eq!(
            seen.iter().map(|(i, n, _)| (*i, *n)).collect::<Vec<_>>(),
            vec![(0, 4), (0, 4), (1, 8), (1, 8), (1, 8)]
        );
        // record numbering restarts with each synthetic dataset
        assert_eq!(seen[1].2, synth_data(1, 4));
        assert_eq!(seen[2].2, synth_data(0, 8));

        // exhausted, and stays that way
        assert!(inputs.current().is_none());
        assert!(!inputs.read_next(&mut record).unwrap());
        assert!(inputs.input_name().ends_with("b.uv"));
    }

    #[test]
    fn test_empty_input_is_skipped() {
        let tmp_dir = tempdir().unwrap();
        let empty = synth_vis(tmp_dir.path(), "empty.uv", &[]);
        let full = synth_vis(tmp_dir.path(), "full.uv", &[SynthWindow::new(2, 1)]);
        let mut inputs = VisInputs::new(&[&empty, &full]).unwrap();
        let mut record = VisRecord::default();
        assert!(inputs.read_next(&mut record).unwrap());
        assert_eq!(inputs.input_index(), 1);
        assert!(inputs.input_name().ends_with("full.uv"));
        assert!(!inputs.read_next(&mut record).unwrap());
    }
}
