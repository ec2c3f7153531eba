//! Visibility streams: sequential uv records on top of a [`Dataset`].
//!
//! A uv dataset keeps three stream items:
//!
//! - `vartable`, the text list of variables (`"<type code> <name>"` per line)
//! - `visdata`, the record stream
//! - `flags`, a packed mask (see [`crate::io::mask`]) of per-channel flags
//!
//! `visdata` is a sequence of entries, each starting with a four byte header
//! `[var index, 0, kind, 0]`:
//!
//! | kind | meaning       | layout                                                  |
//! |------|---------------|---------------------------------------------------------|
//! | 0    | size          | int32 byte length at +4, next entry at +8               |
//! | 1    | data          | value at +4 aligned to the element size, next entry at the end aligned to 8 |
//! | 2    | end of record | next entry at +8                                        |
//!
//! Writers only emit a value when it differs from the previous one, and only
//! emit a size when the byte length changes. Readers carry each variable's
//! value forward from record to record.

pub mod preamble;
pub mod tracker;
pub mod variable;

use std::{
    borrow::Cow,
    collections::{HashMap, HashSet},
};

use log::{debug, trace, warn};
use num_complex::Complex32;

pub use preamble::{PreambleField, PreambleLayout};
pub use tracker::VarTracker;
pub use variable::{Value, VarType};

use self::variable::{read_value, write_value, Variable};
use crate::io::{
    dataset::{Dataset, DatasetMode},
    error::IOError,
    item::ItemMode,
    mask::{init_mask, mask_capacity, read_flags, write_flags, FLAGS_PER_WORD},
};

/// Name of the variable table item.
pub const VARTABLE: &str = "vartable";
/// Name of the record stream item.
pub const VISDATA: &str = "visdata";
/// Name of the channel flag mask item.
pub const FLAGS: &str = "flags";

/// Most variables a stream can hold; indices must fit in a byte.
pub const MAX_VARS: usize = 256;

/// Variables that define a spectral line setup.
pub const LINE_VARS: [&str; 10] = [
    "nspect", "nschan", "ischan", "sdf", "sfreq", "restfreq", "systemp", "xtsys", "ytsys",
    "xyphase",
];

/// Variables describing record structure, which are never copied wholesale
/// from an input to an output.
const STRUCTURAL_VARS: [&str; 12] = [
    "corr", "wcorr", "nchan", "nwide", "wfreq", "wwidth", "tscale", "coord", "time", "baseline",
    "pol", "npol",
];

const ENTRY_SIZE: u8 = 0;
const ENTRY_DATA: u8 = 1;
const ENTRY_EOR: u8 = 2;

/// Largest magnitude of a scaled 16-bit correlation.
const INT16_FULL_SCALE: f32 = 32767.0;

/// How a stream is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    /// Read an existing stream. Flags of the current record may be rewritten.
    Old,
    /// Create a new dataset and write a stream into it
    New,
    /// Add records to the end of an existing stream
    Append,
}

impl std::fmt::Display for StreamMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Old => "old",
                Self::New => "new",
                Self::Append => "append",
            }
        )
    }
}

/// Which line-defining variables an input hands on to an output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineType {
    /// None; the caller defines the output spectral setup itself
    None,
    /// Copy the channel line variables in [`LINE_VARS`]
    Channel,
}

/// A record as handed out by [`VisData::read_record`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VisRecord {
    /// Preamble values, laid out per the stream's [`PreambleLayout`]
    pub preamble: Vec<f64>,
    /// Correlation data, one value per channel
    pub data: Vec<Complex32>,
    /// Channel flags; true is good
    pub flags: Vec<bool>,
}

impl VisRecord {
    /// Number of channels in the record.
    pub fn nchan(&self) -> usize {
        self.data.len()
    }
}

/// What [`VisData::probe_var`] knows about a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarProbe {
    /// The variable type
    pub var_type: VarType,
    /// Number of elements in the current value
    pub len: usize,
    /// Whether the value changed in the last record read
    pub updated: bool,
}

/// The spectral setup of the current record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpectralConfig {
    /// Number of spectral windows
    pub nspect: i32,
    /// Number of wideband channels
    pub nwide: i32,
    /// Number of channels per record
    pub nchan: i32,
    /// Channel width per window, GHz
    pub sdf: Vec<f64>,
    /// Channels per window
    pub nschan: Vec<i32>,
    /// First channel of each window, 1-based
    pub ischan: Vec<i32>,
    /// Frequency of the first channel of each window, GHz
    pub sfreq: Vec<f64>,
}

/// Encode an antenna pair (1-based) as a baseline number.
pub fn encode_baseline(ant1: u32, ant2: u32) -> f64 {
    if ant1 > 255 || ant2 > 255 {
        f64::from(2048 * ant1 + ant2 + 65536)
    } else {
        f64::from(256 * ant1 + ant2)
    }
}

/// Decode a baseline number into its antenna pair.
pub fn decode_baseline(baseline: f64) -> (u32, u32) {
    let mut code = baseline.round().max(0.0) as u32;
    if code > 65536 {
        code -= 65536;
        (code / 2048, code % 2048)
    } else {
        (code / 256, code % 256)
    }
}

#[derive(Debug, Clone, Copy)]
struct CurrentRecord {
    flag_offset: u64,
    nchan: usize,
}

fn align(offset: u64, to: usize) -> u64 {
    let to = to as u64;
    (offset + to - 1) / to * to
}

fn corrupt(dataset: &str, name: &str, why: String) -> IOError {
    IOError::Corrupt {
        dataset: dataset.to_string(),
        name: name.to_string(),
        why,
    }
}

/// An open visibility stream.
pub struct VisData {
    dataset: Dataset,
    mode: StreamMode,
    vars: Vec<Variable>,
    index: HashMap<String, usize>,
    vartable_dirty: bool,
    /// Number of records read so far, over the handle's lifetime.
    generation: u64,
    offset: u64,
    flag_offset: u64,
    has_flags: bool,
    flags_writable: bool,
    vis_num: u64,
    record: Option<CurrentRecord>,
    layout: PreambleLayout,
    io_started: bool,
    corr_type: VarType,
    watched: VarTracker,
    copy_names: HashSet<String>,
    copy_inputs: bool,
    line_type: LineType,
    pending: Vec<usize>,
}

impl VisData {
    /// Open the uv dataset at `path`.
    ///
    /// A [`StreamMode::New`] dataset that fails part way through creation is
    /// removed again before the error is returned.
    ///
    /// # Errors
    ///
    /// Anything [`Dataset::open`] can return, plus [`IOError::Corrupt`] for
    /// a malformed `vartable` or `visdata`.
    pub fn open<P: AsRef<std::path::Path>>(path: P, mode: StreamMode) -> Result<Self, IOError> {
        let dataset_mode = match mode {
            StreamMode::New => DatasetMode::Create,
            StreamMode::Old => DatasetMode::Read,
            StreamMode::Append => DatasetMode::Append,
        };
        let dataset = Dataset::open(path, dataset_mode)?;
        let mut vis = Self {
            dataset,
            mode,
            vars: vec![],
            index: HashMap::new(),
            vartable_dirty: false,
            generation: 0,
            offset: 0,
            flag_offset: 0,
            has_flags: false,
            flags_writable: false,
            vis_num: 0,
            record: None,
            layout: PreambleLayout::default(),
            io_started: false,
            corr_type: VarType::Float32,
            watched: VarTracker::new(),
            copy_names: HashSet::new(),
            copy_inputs: false,
            line_type: LineType::None,
            pending: vec![],
        };
        let started = match mode {
            StreamMode::Old => vis.start_old(),
            StreamMode::New => vis.start_new(),
            StreamMode::Append => vis.start_append(),
        };
        match started {
            Ok(()) => {
                debug!("opened uv stream {} ({} mode)", vis.name(), mode);
                Ok(vis)
            }
            Err(e) if mode == StreamMode::New => {
                if let Err(cleanup) = vis.dataset.delete_all() {
                    warn!("could not remove partial dataset after {}: {}", e, cleanup);
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn start_old(&mut self) -> Result<(), IOError> {
        self.load_vartable()?;
        self.dataset.open_item(VISDATA, ItemMode::Read)?;
        if self.dataset.has_item(FLAGS) {
            init_mask(self.dataset.open_item(FLAGS, ItemMode::Read)?)?;
            self.has_flags = true;
        }
        Ok(())
    }

    fn start_new(&mut self) -> Result<(), IOError> {
        self.dataset.open_item(VISDATA, ItemMode::Write)?;
        init_mask(self.dataset.open_item(FLAGS, ItemMode::Write)?)?;
        self.has_flags = true;
        self.flags_writable = true;
        self.vartable_dirty = true;
        Ok(())
    }

    fn start_append(&mut self) -> Result<(), IOError> {
        self.load_vartable()?;
        self.dataset.open_item(VISDATA, ItemMode::Append)?;
        init_mask(self.dataset.open_item(FLAGS, ItemMode::Append)?)?;
        self.has_flags = true;
        self.flags_writable = true;
        // replay the stream so unchanged values aren't rewritten
        while self.advance()? {}
        let size = self.dataset.item_mut(VISDATA)?.size();
        if self.offset != size {
            return Err(corrupt(
                self.dataset.name(),
                VISDATA,
                format!("stream ends at {} but item is {} bytes", self.offset, size),
            ));
        }
        debug!(
            "{}: appending after {} existing records",
            self.name(),
            self.vis_num
        );
        self.vis_num = 0;
        self.record = None;
        Ok(())
    }

    fn load_vartable(&mut self) -> Result<(), IOError> {
        if !self.dataset.has_item(VARTABLE) {
            return Ok(());
        }
        let name = self.dataset.name().to_string();
        let item = self.dataset.open_item(VARTABLE, ItemMode::Read)?;
        let mut lines = vec![];
        let read = (|| {
            while let Some(line) = item.read_line()? {
                lines.push(line);
            }
            Ok::<(), IOError>(())
        })();
        self.dataset.close_item(VARTABLE)?;
        read?;

        for raw in lines {
            let text = String::from_utf8_lossy(&raw);
            let line = text.trim();
            if line.is_empty() {
                continue;
            }
            let parsed = line.split_once(' ').and_then(|(code, var_name)| {
                let mut chars = code.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => VarType::from_code(c).map(|t| (t, var_name.trim())),
                    _ => None,
                }
            });
            let (var_type, var_name) = parsed.ok_or_else(|| {
                corrupt(&name, VARTABLE, format!("bad vartable line \"{}\"", line))
            })?;
            if self.vars.len() >= MAX_VARS {
                return Err(IOError::TooManyVars {
                    dataset: name,
                    max: MAX_VARS,
                });
            }
            self.index.insert(var_name.to_string(), self.vars.len());
            self.vars.push(Variable::new(var_name, var_type));
        }
        Ok(())
    }

    fn write_vartable(&mut self) -> Result<(), IOError> {
        let item = self.dataset.open_item(VARTABLE, ItemMode::Write)?;
        let written = self
            .vars
            .iter()
            .try_for_each(|var| item.write_line(&format!("{} {}", var.var_type.code(), var.name)));
        self.dataset.close_item(VARTABLE)?;
        written?;
        self.vartable_dirty = false;
        Ok(())
    }

    /// The underlying dataset.
    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    /// The underlying dataset, for header items and history.
    pub fn dataset_mut(&mut self) -> &mut Dataset {
        &mut self.dataset
    }

    /// The dataset path as displayed in messages.
    pub fn name(&self) -> &str {
        self.dataset.name()
    }

    /// The mode the stream was opened with.
    pub fn mode(&self) -> StreamMode {
        self.mode
    }

    /// Number of records read so far. Used by trackers.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Serial number (1-based) of the last record read or written, 0 if
    /// there is none yet.
    pub fn current_vis_num(&self) -> u64 {
        self.vis_num
    }

    /// The preamble layout.
    pub fn preamble_layout(&self) -> &PreambleLayout {
        &self.layout
    }

    fn bad_mode(&self, op: &'static str) -> IOError {
        IOError::BadMode {
            dataset: self.name().to_string(),
            op,
            mode: self.mode.to_string(),
        }
    }

    fn require_readable(&self, op: &'static str) -> Result<(), IOError> {
        match self.mode {
            StreamMode::Old => Ok(()),
            _ => Err(self.bad_mode(op)),
        }
    }

    fn require_writable(&self, op: &'static str) -> Result<(), IOError> {
        match self.mode {
            StreamMode::New | StreamMode::Append => Ok(()),
            StreamMode::Old => Err(self.bad_mode(op)),
        }
    }

    /// Fix the preamble layout. Only allowed before any record is read or
    /// written.
    pub fn set_preamble_layout(&mut self, layout: PreambleLayout) -> Result<(), IOError> {
        if self.io_started {
            return Err(self.bad_mode("set_preamble_layout after data i/o"));
        }
        debug!("{}: preamble layout {}", self.name(), layout);
        self.layout = layout;
        Ok(())
    }

    /// [`VisData::set_preamble_layout`] from field names.
    pub fn set_preamble<S: AsRef<str>>(&mut self, names: &[S]) -> Result<(), IOError> {
        self.set_preamble_layout(PreambleLayout::parse(names)?)
    }

    /// Choose how correlations are stored: `r` (float pairs), `j` (scaled
    /// 16-bit integer pairs) or `c` (complex). Only allowed before the
    /// first record is written.
    pub fn set_correlation_type(&mut self, code: char) -> Result<(), IOError> {
        self.require_writable("set_correlation_type")?;
        if self.io_started {
            return Err(self.bad_mode("set_correlation_type after data i/o"));
        }
        self.corr_type = match VarType::from_code(code) {
            Some(t @ (VarType::Float32 | VarType::Int16 | VarType::Complex64)) => t,
            _ => return Err(IOError::InvalidCorrType(code)),
        };
        Ok(())
    }

    // ///////// //
    // Variables //
    // ///////// //

    fn var(&self, name: &str) -> Option<&Variable> {
        self.index.get(name).map(|&idx| &self.vars[idx])
    }

    pub(crate) fn var_generation(&self, name: &str) -> Option<u64> {
        self.var(name)
            .filter(|var| var.value.is_some())
            .map(|var| var.updated_gen)
    }

    fn updated_in_last_record(&self, var: &Variable) -> bool {
        self.record.is_some() && var.value.is_some() && var.updated_gen == self.generation
    }

    /// Type, length and update state of variable `name`, if the stream
    /// knows it.
    pub fn probe_var(&self, name: &str) -> Option<VarProbe> {
        self.var(name).map(|var| VarProbe {
            var_type: var.var_type,
            len: var.value.as_ref().map_or(0, Value::len),
            updated: self.updated_in_last_record(var),
        })
    }

    /// The current value of variable `name`.
    pub fn get_var(&self, name: &str) -> Result<&Value, IOError> {
        self.var(name)
            .and_then(|var| var.value.as_ref())
            .ok_or_else(|| IOError::VarNotFound {
                dataset: self.name().to_string(),
                name: name.to_string(),
            })
    }

    fn var_mismatch(&self, name: &str, expected: char, value: &Value) -> IOError {
        IOError::VarTypeMismatch {
            dataset: self.name().to_string(),
            name: name.to_string(),
            expected,
            found: value.var_type().code(),
        }
    }

    fn present_value(&self, name: &str) -> Option<&Value> {
        self.get_var(name).ok().filter(|value| !value.is_empty())
    }

    /// First element of numeric variable `name` as a double, or `default`
    /// if the variable is absent.
    pub fn get_var_first_f64(&self, name: &str, default: f64) -> Result<f64, IOError> {
        match self.present_value(name) {
            None => Ok(default),
            Some(value) => value
                .first_f64()
                .ok_or_else(|| self.var_mismatch(name, 'd', value)),
        }
    }

    /// First element of integer variable `name`, or `default` if the
    /// variable is absent.
    pub fn get_var_first_i32(&self, name: &str, default: i32) -> Result<i32, IOError> {
        match self.present_value(name) {
            None => Ok(default),
            Some(value) => value
                .first_i64()
                .map(|x| x as i32)
                .ok_or_else(|| self.var_mismatch(name, 'i', value)),
        }
    }

    /// Text variable `name`, or `default` if the variable is absent.
    pub fn get_var_first_text(&self, name: &str, default: &str) -> Result<String, IOError> {
        match self.present_value(name) {
            None => Ok(default.to_string()),
            Some(value) => value
                .to_text()
                .map(Cow::into_owned)
                .ok_or_else(|| self.var_mismatch(name, 'a', value)),
        }
    }

    /// All elements of real numeric variable `name` as doubles; empty if
    /// the variable is absent.
    pub fn get_var_f64s(&self, name: &str) -> Result<Vec<f64>, IOError> {
        match self.present_value(name) {
            None => Ok(vec![]),
            Some(value) => value
                .to_f64s()
                .ok_or_else(|| self.var_mismatch(name, 'd', value)),
        }
    }

    /// All elements of integer variable `name`; empty if the variable is
    /// absent.
    pub fn get_var_i32s(&self, name: &str) -> Result<Vec<i32>, IOError> {
        match self.present_value(name) {
            None => Ok(vec![]),
            Some(value) => value
                .to_i64s()
                .map(|v| v.into_iter().map(|x| x as i32).collect())
                .ok_or_else(|| self.var_mismatch(name, 'i', value)),
        }
    }

    /// Polarization code of the current record; 1 when not recorded.
    pub fn pol(&self) -> Result<i32, IOError> {
        self.get_var_first_i32("pol", 1)
    }

    /// Number of simultaneous polarizations; 1 when not recorded.
    pub fn npol(&self) -> Result<i32, IOError> {
        self.get_var_first_i32("npol", 1)
    }

    /// The spectral setup of the current record. Absent variables read as
    /// zero or empty.
    pub fn spectral_config(&self) -> Result<SpectralConfig, IOError> {
        Ok(SpectralConfig {
            nspect: self.get_var_first_i32("nspect", 0)?,
            nwide: self.get_var_first_i32("nwide", 0)?,
            nchan: self.get_var_first_i32("nchan", 0)?,
            sdf: self.get_var_f64s("sdf")?,
            nschan: self.get_var_i32s("nschan")?,
            ischan: self.get_var_i32s("ischan")?,
            sfreq: self.get_var_f64s("sfreq")?,
        })
    }

    /// Noise variance of the current record in Jy², from `jyperk`,
    /// `systemp` (per antenna), `sdf` and `inttime`. `None` when any of
    /// those is missing or zero.
    pub fn variance(&self) -> Result<Option<f64>, IOError> {
        let jyperk = self.get_var_first_f64("jyperk", 0.0)?;
        let inttime = self.get_var_first_f64("inttime", 0.0)?;
        let sdf = self.get_var_first_f64("sdf", 0.0)?.abs();
        let systemp = self.get_var_f64s("systemp")?;
        let (ant1, ant2) = decode_baseline(self.get_var_first_f64("baseline", 0.0)?);
        let tsys = |ant: u32| {
            systemp
                .get(ant.saturating_sub(1) as usize)
                .or_else(|| systemp.first())
                .copied()
                .unwrap_or(0.0)
        };
        let (tsys1, tsys2) = (tsys(ant1), tsys(ant2));
        if jyperk <= 0.0 || inttime <= 0.0 || sdf <= 0.0 || tsys1 <= 0.0 || tsys2 <= 0.0 {
            return Ok(None);
        }
        Ok(Some(
            jyperk * jyperk * tsys1 * tsys2 / (2.0 * sdf * 1e9 * inttime),
        ))
    }

    fn var_index_or_create(&mut self, name: &str, var_type: VarType) -> Result<usize, IOError> {
        if let Some(&idx) = self.index.get(name) {
            let existing = self.vars[idx].var_type;
            if existing != var_type {
                return Err(IOError::VarTypeMismatch {
                    dataset: self.name().to_string(),
                    name: name.to_string(),
                    expected: var_type.code(),
                    found: existing.code(),
                });
            }
            return Ok(idx);
        }
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(IOError::InvalidItemName {
                name: name.to_string(),
                why: "uv variable names must be non-empty without whitespace",
            });
        }
        if self.vars.len() >= MAX_VARS {
            return Err(IOError::TooManyVars {
                dataset: self.name().to_string(),
                max: MAX_VARS,
            });
        }
        trace!("{}: new variable {} {}", self.name(), var_type.code(), name);
        let idx = self.vars.len();
        self.vars.push(Variable::new(name, var_type));
        self.index.insert(name.to_string(), idx);
        self.vartable_dirty = true;
        Ok(idx)
    }

    /// Set variable `name` for the next record written. Values equal to the
    /// current one are not written again.
    pub fn put_var<V: Into<Value>>(&mut self, name: &str, value: V) -> Result<(), IOError> {
        self.require_writable("put_var")?;
        let value = value.into();
        let idx = self.var_index_or_create(name, value.var_type())?;
        let var = &mut self.vars[idx];
        if var.value.as_ref().map_or(false, |old| old.same_bits(&value)) {
            return Ok(());
        }
        var.value = Some(value);
        if !var.pending {
            var.pending = true;
            self.pending.push(idx);
        }
        Ok(())
    }

    /// Mark variables for watching by [`VisData::updated`] and/or copying by
    /// [`VisData::copy_marked_vars`].
    pub fn track_var(&mut self, name: &str, watch: bool, copy: bool) {
        if watch {
            self.watched.track(&[name]);
        }
        if copy {
            self.copy_names.insert(name.to_string());
        }
    }

    /// Whether any variable watched through [`VisData::track_var`] changed
    /// since the previous call.
    pub fn updated(&mut self) -> bool {
        let mut watched = std::mem::take(&mut self.watched);
        let changed = watched.updated(self);
        self.watched = watched;
        changed
    }

    /// Mark every input variable for copying except those describing record
    /// structure. Line-defining variables are left to
    /// [`VisData::copy_line_vars`], which copies them only for
    /// [`LineType::Channel`].
    pub fn init_vars_as_input(&mut self, line_type: LineType) {
        self.copy_inputs = true;
        self.line_type = line_type;
    }

    fn is_copied(&self, name: &str) -> bool {
        self.copy_names.contains(name)
            || (self.copy_inputs
                && !STRUCTURAL_VARS.contains(&name)
                && !LINE_VARS.contains(&name))
    }

    /// Copy variables marked for copying that changed in the last record
    /// read to `dest`.
    pub fn copy_marked_vars(&self, dest: &mut VisData) -> Result<(), IOError> {
        for var in &self.vars {
            if self.is_copied(&var.name) && self.updated_in_last_record(var) {
                if let Some(value) = &var.value {
                    dest.put_var(&var.name, value.clone())?;
                }
            }
        }
        Ok(())
    }

    /// Copy line-defining variables that changed in the last record read to
    /// `dest`, if the line type set by [`VisData::init_vars_as_input`] asks
    /// for it.
    pub fn copy_line_vars(&self, dest: &mut VisData) -> Result<(), IOError> {
        if self.line_type != LineType::Channel {
            return Ok(());
        }
        for name in LINE_VARS {
            if let Some(var) = self.var(name) {
                if self.updated_in_last_record(var) {
                    if let Some(value) = &var.value {
                        dest.put_var(name, value.clone())?;
                    }
                }
            }
        }
        Ok(())
    }

    // /////// //
    // Reading //
    // /////// //

    /// Read the entries of the next record, updating variables.
    fn advance(&mut self) -> Result<bool, IOError> {
        let name = self.dataset.name().to_string();
        let item = self.dataset.item_mut(VISDATA)?;
        let size = item.size();
        if self.offset >= size {
            return Ok(false);
        }
        let generation = self.generation + 1;
        loop {
            if self.offset + 4 > size {
                return Err(corrupt(
                    &name,
                    VISDATA,
                    format!("record truncated at byte {}", self.offset),
                ));
            }
            let mut header = [0_u8; 4];
            item.read_bytes(self.offset, &mut header)?;
            let (idx, kind) = (header[0] as usize, header[2]);
            if kind == ENTRY_EOR {
                self.offset += 8;
                break;
            }
            let var = self.vars.get_mut(idx).ok_or_else(|| {
                corrupt(
                    &name,
                    VISDATA,
                    format!("variable index {} not in vartable", idx),
                )
            })?;
            match kind {
                ENTRY_SIZE => {
                    let mut len = [0_i32; 1];
                    item.read_i32s(self.offset + 4, &mut len)?;
                    let len = usize::try_from(len[0]).map_err(|_| {
                        corrupt(&name, VISDATA, format!("negative size for {}", var.name))
                    })?;
                    var.stream_len = Some(len);
                    self.offset += 8;
                }
                ENTRY_DATA => {
                    let len = var.stream_len.ok_or_else(|| {
                        corrupt(&name, VISDATA, format!("{} has data before a size", var.name))
                    })?;
                    let start = align(self.offset + 4, var.var_type.element_size());
                    let value = read_value(item, start, var.var_type, len)?;
                    if !var.value.as_ref().map_or(false, |old| old.same_bits(&value)) {
                        var.value = Some(value);
                        var.updated_gen = generation;
                    }
                    self.offset = align(start + len as u64, 8);
                }
                other => {
                    return Err(corrupt(
                        &name,
                        VISDATA,
                        format!("unknown entry kind {} at byte {}", other, self.offset),
                    ))
                }
            }
        }
        self.generation = generation;
        let nchan = self.record_nchan()?;
        self.record = Some(CurrentRecord {
            flag_offset: self.flag_offset,
            nchan,
        });
        self.flag_offset += nchan as u64;
        self.vis_num += 1;
        trace!("{}: record {} ({} channels)", name, self.vis_num, nchan);
        Ok(true)
    }

    fn record_nchan(&self) -> Result<usize, IOError> {
        if let Some(nchan) = self.present_value("nchan") {
            return nchan
                .first_i64()
                .map(|n| n.max(0) as usize)
                .ok_or_else(|| self.var_mismatch("nchan", 'i', nchan));
        }
        Ok(match self.present_value("corr") {
            Some(Value::C64(v)) => v.len(),
            Some(corr) => corr.len() / 2,
            None => 0,
        })
    }

    fn fill_data(&self, data: &mut [Complex32]) -> Result<(), IOError> {
        let nchan = data.len();
        if nchan == 0 {
            return Ok(());
        }
        let short = || {
            corrupt(
                self.name(),
                VISDATA,
                format!("corr holds fewer than {} channels", nchan),
            )
        };
        match self.get_var("corr")? {
            Value::F32(v) => {
                let pairs = v.get(..2 * nchan).ok_or_else(short)?;
                for (d, pair) in data.iter_mut().zip(pairs.chunks_exact(2)) {
                    *d = Complex32::new(pair[0], pair[1]);
                }
            }
            Value::I16(v) => {
                let scale = self.get_var_first_f64("tscale", 1.0)? as f32;
                let pairs = v.get(..2 * nchan).ok_or_else(short)?;
                for (d, pair) in data.iter_mut().zip(pairs.chunks_exact(2)) {
                    *d = Complex32::new(f32::from(pair[0]) * scale, f32::from(pair[1]) * scale);
                }
            }
            Value::C64(v) => {
                data.copy_from_slice(v.get(..nchan).ok_or_else(short)?);
            }
            other => return Err(self.var_mismatch("corr", 'r', other)),
        }
        Ok(())
    }

    fn fill_flags(&mut self, record: CurrentRecord, flags: &mut [bool]) -> Result<(), IOError> {
        flags.fill(true);
        if !self.has_flags {
            return Ok(());
        }
        let item = self.dataset.item_mut(FLAGS)?;
        let stored = mask_capacity(item)
            .saturating_sub(record.flag_offset)
            .min(flags.len() as u64) as usize;
        read_flags(item, record.flag_offset, &mut flags[..stored])
    }

    fn fill_preamble(&self, preamble: &mut [f64]) -> Result<(), IOError> {
        let mut pos = 0;
        for field in self.layout.fields() {
            match field {
                PreambleField::Uv | PreambleField::Uvw => {
                    let coord = self.get_var("coord")?;
                    let coord = coord
                        .to_f64s()
                        .ok_or_else(|| self.var_mismatch("coord", 'd', coord))?;
                    for (i, out) in preamble[pos..pos + field.width()].iter_mut().enumerate() {
                        *out = coord.get(i).copied().unwrap_or(0.0);
                    }
                }
                _ => {
                    let name = field.var_name();
                    let value = self.get_var(name)?;
                    preamble[pos] = value
                        .first_f64()
                        .ok_or_else(|| self.var_mismatch(name, 'd', value))?;
                }
            }
            pos += field.width();
        }
        Ok(())
    }

    /// Read the next record into caller buffers.
    ///
    /// Returns the number of channels read, or 0 at the end of the stream.
    ///
    /// # Errors
    ///
    /// - [`IOError::Preamble`] if `preamble` is shorter than the layout
    /// - [`IOError::BufferTooSmall`] if the record doesn't fit
    pub fn read(
        &mut self,
        preamble: &mut [f64],
        data: &mut [Complex32],
        flags: &mut [bool],
    ) -> Result<usize, IOError> {
        self.require_readable("read")?;
        if preamble.len() < self.layout.len() {
            return Err(IOError::Preamble(format!(
                "layout {} needs {} values, buffer holds {}",
                self.layout,
                self.layout.len(),
                preamble.len()
            )));
        }
        self.io_started = true;
        if !self.advance()? {
            return Ok(0);
        }
        let record = self.current_record("read")?;
        let available = data.len().min(flags.len());
        if available < record.nchan {
            return Err(IOError::BufferTooSmall {
                needed: record.nchan,
                available,
            });
        }
        self.fill_preamble(preamble)?;
        self.fill_data(&mut data[..record.nchan])?;
        self.fill_flags(record, &mut flags[..record.nchan])?;
        Ok(record.nchan)
    }

    /// Read the next record into `record`, resizing its buffers. Returns
    /// false at the end of the stream. As with [`VisData::read`], a record
    /// without channels ends the stream.
    pub fn read_record(&mut self, record: &mut VisRecord) -> Result<bool, IOError> {
        self.require_readable("read_record")?;
        self.io_started = true;
        if !self.advance()? {
            return Ok(false);
        }
        let current = self.current_record("read_record")?;
        if current.nchan == 0 {
            trace!("{}: record {} has no channels", self.name(), self.vis_num);
            return Ok(false);
        }
        record.preamble.resize(self.layout.len(), 0.0);
        record.data.resize(current.nchan, Complex32::default());
        record.flags.resize(current.nchan, false);
        self.fill_preamble(&mut record.preamble)?;
        self.fill_data(&mut record.data)?;
        self.fill_flags(current, &mut record.flags)?;
        Ok(true)
    }

    /// Skip to the next record, updating variables only. Returns false at
    /// the end of the stream.
    pub fn next(&mut self) -> Result<bool, IOError> {
        self.require_readable("next")?;
        self.io_started = true;
        self.advance()
    }

    /// Read records until variable `name` changes. Returns false if the end
    /// of the stream comes first.
    pub fn scan_until_change(&mut self, name: &str) -> Result<bool, IOError> {
        self.require_readable("scan_until_change")?;
        self.io_started = true;
        while self.advance()? {
            if let Some(var) = self.var(name) {
                if self.updated_in_last_record(var) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Go back to the first record. Variables are forgotten, so everything
    /// read again counts as updated.
    pub fn rewind(&mut self) -> Result<(), IOError> {
        self.require_readable("rewind")?;
        self.offset = 0;
        self.flag_offset = 0;
        self.vis_num = 0;
        self.record = None;
        for var in &mut self.vars {
            var.value = None;
            var.stream_len = None;
        }
        Ok(())
    }

    fn current_record(&self, op: &'static str) -> Result<CurrentRecord, IOError> {
        self.record.ok_or_else(|| IOError::NoCurrentRecord {
            dataset: self.name().to_string(),
            op,
        })
    }

    /// Overwrite the flags of the record most recently read.
    pub fn rewrite_flags(&mut self, flags: &[bool]) -> Result<(), IOError> {
        self.require_readable("rewrite_flags")?;
        let record = self.current_record("rewrite_flags")?;
        if flags.len() != record.nchan {
            return Err(IOError::LengthMismatch {
                data: record.nchan,
                flags: flags.len(),
            });
        }
        if !self.flags_writable {
            self.dataset.allow_writes();
            if self.has_flags {
                self.dataset.close_item(FLAGS)?;
            }
            let item = self.dataset.open_item(FLAGS, ItemMode::Append)?;
            init_mask(item)?;
            if !self.has_flags {
                // a missing mask means all good; materialise that up to the
                // end of the word holding this record
                let end = record.flag_offset + record.nchan as u64;
                let filled = align(end, FLAGS_PER_WORD as usize);
                write_flags(item, 0, &vec![true; filled as usize])?;
            }
            self.has_flags = true;
            self.flags_writable = true;
        }
        write_flags(
            self.dataset.item_mut(FLAGS)?,
            record.flag_offset,
            flags,
        )
    }

    // /////// //
    // Writing //
    // /////// //

    fn stage_corr(&mut self, data: &[Complex32]) -> Result<(), IOError> {
        match self.corr_type {
            VarType::Int16 => {
                let max = data
                    .iter()
                    .flat_map(|c| [c.re.abs(), c.im.abs()])
                    .fold(0.0_f32, f32::max);
                let scale = if max > 0.0 { max / INT16_FULL_SCALE } else { 1.0 };
                let scaled: Vec<i16> = data
                    .iter()
                    .flat_map(|c| [c.re, c.im])
                    .map(|x| (x / scale).round() as i16)
                    .collect();
                self.put_var("tscale", scale)?;
                self.put_var("corr", scaled)
            }
            VarType::Complex64 => self.put_var("corr", data.to_vec()),
            _ => {
                let floats: Vec<f32> = data.iter().flat_map(|c| [c.re, c.im]).collect();
                self.put_var("corr", floats)
            }
        }
    }

    fn write_pending(&mut self) -> Result<(), IOError> {
        let item = self.dataset.item_mut(VISDATA)?;
        for idx in self.pending.drain(..) {
            let var = &mut self.vars[idx];
            var.pending = false;
            let value = match &var.value {
                Some(value) => value,
                None => continue,
            };
            let len = value.byte_len();
            if var.stream_len != Some(len) {
                item.write_bytes(self.offset, &[idx as u8, 0, ENTRY_SIZE, 0])?;
                item.write_i32s(self.offset + 4, &[len as i32])?;
                self.offset += 8;
                var.stream_len = Some(len);
            }
            item.write_bytes(self.offset, &[idx as u8, 0, ENTRY_DATA, 0])?;
            let start = align(self.offset + 4, var.var_type.element_size());
            if start > self.offset + 4 {
                item.write_bytes(self.offset + 4, &vec![0; (start - self.offset - 4) as usize])?;
            }
            write_value(item, start, value)?;
            let end = start + len as u64;
            let next = align(end, 8);
            if next > end {
                item.write_bytes(end, &vec![0; (next - end) as usize])?;
            }
            self.offset = next;
        }
        item.write_bytes(self.offset, &[0, 0, ENTRY_EOR, 0, 0, 0, 0, 0])?;
        self.offset += 8;
        Ok(())
    }

    /// Write a record.
    ///
    /// `preamble` must match the layout; `data` and `flags` must have the
    /// same length, which becomes the record's `nchan`.
    pub fn write(
        &mut self,
        preamble: &[f64],
        data: &[Complex32],
        flags: &[bool],
    ) -> Result<(), IOError> {
        self.require_writable("write")?;
        if data.len() != flags.len() {
            return Err(IOError::LengthMismatch {
                data: data.len(),
                flags: flags.len(),
            });
        }
        if preamble.len() != self.layout.len() {
            return Err(IOError::Preamble(format!(
                "layout {} needs {} values, got {}",
                self.layout,
                self.layout.len(),
                preamble.len()
            )));
        }
        self.io_started = true;

        let layout = self.layout.clone();
        let mut pos = 0;
        for field in layout.fields() {
            let values = &preamble[pos..pos + field.width()];
            match field {
                PreambleField::Uv | PreambleField::Uvw => self.put_var("coord", values.to_vec())?,
                PreambleField::Baseline => self.put_var("baseline", values[0] as f32)?,
                PreambleField::Pol => self.put_var("pol", values[0].round() as i32)?,
                PreambleField::Time | PreambleField::Other(_) => {
                    self.put_var(field.var_name(), values[0])?
                }
            }
            pos += field.width();
        }
        self.put_var("nchan", data.len() as i32)?;
        self.stage_corr(data)?;
        self.write_pending()?;

        let flag_offset = self.flag_offset;
        write_flags(self.dataset.item_mut(FLAGS)?, flag_offset, flags)?;
        self.flag_offset += flags.len() as u64;
        self.record = Some(CurrentRecord {
            flag_offset,
            nchan: data.len(),
        });
        self.vis_num += 1;
        if self.vartable_dirty {
            self.write_vartable()?;
        }
        Ok(())
    }

    /// Push buffered output to disk.
    pub fn flush(&mut self) -> Result<(), IOError> {
        if self.vartable_dirty && self.mode != StreamMode::Old {
            self.write_vartable()?;
        }
        self.dataset.flush()
    }

    /// Close the stream and its dataset.
    pub fn close(mut self) -> Result<(), IOError> {
        self.flush()?;
        debug!("{}: closed after {} records", self.name(), self.vis_num);
        self.dataset.close()
    }

    /// Close the stream and remove its dataset from disk.
    pub fn delete_all(self) -> Result<(), IOError> {
        self.dataset.delete_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_common::{synth_vis, SynthWindow};
    use approx::assert_abs_diff_eq;
    use tempfile::tempdir;

    fn c(re: f32, im: f32) -> Complex32 {
        Complex32::new(re, im)
    }

    #[test]
    fn test_baseline_codes() {
        assert_abs_diff_eq!(encode_baseline(1, 2), 258.0);
        assert_eq!(decode_baseline(258.0), (1, 2));
        assert_eq!(decode_baseline(encode_baseline(300, 7)), (300, 7));
    }

    #[test]
    fn test_write_then_read_records() {
        let tmp_dir = tempdir().unwrap();
        let path = tmp_dir.path().join("rt.uv");
        let mut out = VisData::open(&path, StreamMode::New).unwrap();
        out.put_var("telescop", "ATA").unwrap();
        out.write(
            &[1.0, 2.0, 3.0, 100.5, 258.0],
            &[c(1.0, -1.0), c(2.0, 0.5)],
            &[true, false],
        )
        .unwrap();
        out.write(
            &[1.5, 2.0, 3.0, 100.5, 259.0],
            &[c(1.0, -1.0), c(2.0, 0.5)],
            &[false, true],
        )
        .unwrap();
        out.close().unwrap();

        let mut vis = VisData::open(&path, StreamMode::Old).unwrap();
        let mut preamble = [0.0; 5];
        let mut data = [Complex32::default(); 4];
        let mut flags = [false; 4];
        assert_eq!(vis.read(&mut preamble, &mut data, &mut flags).unwrap(), 2);
        assert_eq!(preamble, [1.0, 2.0, 3.0, 100.5, 258.0]);
        assert_eq!(&data[..2], &[c(1.0, -1.0), c(2.0, 0.5)]);
        assert_eq!(&flags[..2], &[true, false]);
        assert!(vis.probe_var("telescop").unwrap().updated);
        assert_eq!(vis.get_var_first_text("telescop", "").unwrap(), "ATA");
        assert_eq!(vis.current_vis_num(), 1);

        assert_eq!(vis.read(&mut preamble, &mut data, &mut flags).unwrap(), 2);
        assert_abs_diff_eq!(preamble[0], 1.5);
        assert_abs_diff_eq!(preamble[4], 259.0);
        assert_eq!(&flags[..2], &[false, true]);
        // unchanged values carry over but are not updated
        assert!(!vis.probe_var("telescop").unwrap().updated);
        assert_eq!(vis.get_var_first_text("telescop", "").unwrap(), "ATA");

        assert_eq!(vis.read(&mut preamble, &mut data, &mut flags).unwrap(), 0);
    }

    #[test]
    fn test_unchanged_values_are_not_rewritten() {
        let tmp_dir = tempdir().unwrap();
        let path = tmp_dir.path().join("skip.uv");
        let mut out = VisData::open(&path, StreamMode::New).unwrap();
        let data = [c(1.0, 2.0); 4];
        let flags = [true; 4];
        out.write(&[0.0, 0.0, 0.0, 1.0, 258.0], &data, &flags)
            .unwrap();
        let first = out.dataset_mut().item_mut(VISDATA).unwrap().size();
        out.write(&[0.0, 0.0, 0.0, 1.0, 258.0], &data, &flags)
            .unwrap();
        let second = out.dataset_mut().item_mut(VISDATA).unwrap().size();
        // nothing changed, so only an end-of-record entry
        assert_eq!(second - first, 8);
        out.close().unwrap();
    }

    #[test]
    fn test_record_without_channels_ends_stream() {
        let tmp_dir = tempdir().unwrap();
        let path = tmp_dir.path().join("short.uv");
        let mut out = VisData::open(&path, StreamMode::New).unwrap();
        out.write(&[0.0, 0.0, 0.0, 1.0, 258.0], &[c(1.0, 0.0); 2], &[true; 2])
            .unwrap();
        out.write(&[0.0, 0.0, 0.0, 2.0, 258.0], &[], &[]).unwrap();
        out.write(&[0.0, 0.0, 0.0, 3.0, 258.0], &[c(3.0, 0.0); 2], &[true; 2])
            .unwrap();
        out.close().unwrap();

        let mut vis = VisData::open(&path, StreamMode::Old).unwrap();
        let mut record = VisRecord::default();
        assert!(vis.read_record(&mut record).unwrap());
        assert_eq!(record.nchan(), 2);
        assert!(!vis.read_record(&mut record).unwrap());

        let mut vis = VisData::open(&path, StreamMode::Old).unwrap();
        let mut preamble = [0.0; 5];
        let mut data = [Complex32::default(); 2];
        let mut flags = [false; 2];
        assert_eq!(vis.read(&mut preamble, &mut data, &mut flags).unwrap(), 2);
        assert_eq!(vis.read(&mut preamble, &mut data, &mut flags).unwrap(), 0);
    }

    #[test]
    fn test_nan_variable_written_once() {
        let tmp_dir = tempdir().unwrap();
        let path = tmp_dir.path().join("nan.uv");
        let mut out = VisData::open(&path, StreamMode::New).unwrap();
        let data = [c(1.0, 2.0); 4];
        let flags = [true; 4];
        out.put_var("systemp", f32::NAN).unwrap();
        out.write(&[0.0, 0.0, 0.0, 1.0, 258.0], &data, &flags)
            .unwrap();
        let first = out.dataset_mut().item_mut(VISDATA).unwrap().size();
        out.put_var("systemp", f32::NAN).unwrap();
        out.write(&[0.0, 0.0, 0.0, 1.0, 258.0], &data, &flags)
            .unwrap();
        let second = out.dataset_mut().item_mut(VISDATA).unwrap().size();
        assert_eq!(second - first, 8);
        out.close().unwrap();

        let mut vis = VisData::open(&path, StreamMode::Old).unwrap();
        let mut record = VisRecord::default();
        assert!(vis.read_record(&mut record).unwrap());
        assert!(vis.probe_var("systemp").unwrap().updated);
        assert!(vis.read_record(&mut record).unwrap());
        assert!(!vis.probe_var("systemp").unwrap().updated);
        assert!(vis.get_var_first_f64("systemp", 0.0).unwrap().is_nan());
    }

    #[test]
    fn test_visdata_entry_layout() {
        let tmp_dir = tempdir().unwrap();
        let path = tmp_dir.path().join("layout.uv");
        let mut out = VisData::open(&path, StreamMode::New).unwrap();
        out.set_preamble(&["time"]).unwrap();
        out.write(&[2.5], &[], &[]).unwrap();
        out.close().unwrap();

        assert_eq!(
            std::fs::read_to_string(path.join(VARTABLE)).unwrap(),
            "d time\ni nchan\nr corr\n"
        );
        let raw = std::fs::read(path.join(VISDATA)).unwrap();
        #[rustfmt::skip]
        let expected: Vec<u8> = [
            // time: size entry, then data aligned to 8
            &[0, 0, 0, 0][..], &8_i32.to_be_bytes(),
            &[0, 0, 1, 0], &[0, 0, 0, 0], &2.5_f64.to_be_bytes(),
            // nchan
            &[1, 0, 0, 0], &4_i32.to_be_bytes(),
            &[1, 0, 1, 0], &0_i32.to_be_bytes(),
            // corr: zero length
            &[2, 0, 0, 0], &0_i32.to_be_bytes(),
            &[2, 0, 1, 0], &[0, 0, 0, 0],
            // end of record
            &[0, 0, 2, 0], &[0, 0, 0, 0],
        ]
        .concat();
        assert_eq!(raw, expected);
    }

    #[test]
    fn test_int16_correlations_are_scaled() {
        let tmp_dir = tempdir().unwrap();
        let path = tmp_dir.path().join("j.uv");
        let mut out = VisData::open(&path, StreamMode::New).unwrap();
        out.set_correlation_type('j').unwrap();
        // full scale 65534 gives a scale factor of exactly 2
        let data = [c(65534.0, -2.0), c(0.0, 6.0)];
        out.write(&[0.0, 0.0, 0.0, 1.0, 258.0], &data, &[true, true])
            .unwrap();
        out.close().unwrap();

        let mut vis = VisData::open(&path, StreamMode::Old).unwrap();
        assert_eq!(vis.probe_var("corr").map(|p| p.var_type), Some(VarType::Int16));
        let mut rec = VisRecord::default();
        assert!(vis.read_record(&mut rec).unwrap());
        assert_abs_diff_eq!(vis.get_var_first_f64("tscale", 0.0).unwrap(), 2.0);
        assert_eq!(rec.data, data.to_vec());
    }

    #[test]
    fn test_bad_corr_type_and_late_layout() {
        let tmp_dir = tempdir().unwrap();
        let mut out = VisData::open(tmp_dir.path().join("x.uv"), StreamMode::New).unwrap();
        assert!(matches!(
            out.set_correlation_type('d'),
            Err(IOError::InvalidCorrType('d'))
        ));
        out.write(&[0.0; 5], &[c(1.0, 1.0)], &[true]).unwrap();
        assert!(matches!(
            out.set_preamble(&["uv", "time"]),
            Err(IOError::BadMode { .. })
        ));
        assert!(matches!(
            out.write(&[0.0; 3], &[c(1.0, 1.0)], &[true]),
            Err(IOError::Preamble(_))
        ));
        assert!(matches!(
            out.write(&[0.0; 5], &[c(1.0, 1.0)], &[true, true]),
            Err(IOError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_buffer_too_small() {
        let tmp_dir = tempdir().unwrap();
        let path = synth_vis(tmp_dir.path(), "in.uv", &[SynthWindow::new(8, 2)]);
        let mut vis = VisData::open(path, StreamMode::Old).unwrap();
        let mut preamble = [0.0; 5];
        let mut data = [Complex32::default(); 4];
        let mut flags = [false; 4];
        assert!(matches!(
            vis.read(&mut preamble, &mut data, &mut flags),
            Err(IOError::BufferTooSmall {
                needed: 8,
                available: 4
            })
        ));
    }

    #[test]
    fn test_rewind_and_scan() {
        let tmp_dir = tempdir().unwrap();
        let path = synth_vis(
            tmp_dir.path(),
            "in.uv",
            &[SynthWindow::new(8, 3), SynthWindow::new(16, 2)],
        );
        let mut vis = VisData::open(path, StreamMode::Old).unwrap();
        assert!(vis.next().unwrap());
        assert!(vis.scan_until_change("nchan").unwrap());
        assert_eq!(vis.current_vis_num(), 4);
        assert_eq!(vis.get_var_first_i32("nchan", 0).unwrap(), 16);
        assert!(!vis.scan_until_change("nchan").unwrap());

        vis.rewind().unwrap();
        let mut rec = VisRecord::default();
        assert!(vis.read_record(&mut rec).unwrap());
        assert_eq!(rec.nchan(), 8);
        assert!(vis.probe_var("nchan").unwrap().updated);
    }

    #[test]
    fn test_rewrite_flags_in_place() {
        let tmp_dir = tempdir().unwrap();
        let path = synth_vis(tmp_dir.path(), "in.uv", &[SynthWindow::new(4, 3)]);
        {
            let mut vis = VisData::open(&path, StreamMode::Old).unwrap();
            assert!(matches!(
                vis.rewrite_flags(&[true; 4]),
                Err(IOError::NoCurrentRecord { .. })
            ));
            assert_eq!(vis.dataset().mode(), DatasetMode::Read);
            assert!(matches!(
                vis.dataset_mut().write_header_i32("npol", 2),
                Err(IOError::ReadOnly { .. })
            ));
            assert!(vis.next().unwrap());
            assert!(vis.next().unwrap());
            vis.rewrite_flags(&[false, true, false, true]).unwrap();
            assert_eq!(vis.dataset().mode(), DatasetMode::Append);
            assert!(matches!(
                vis.rewrite_flags(&[true; 3]),
                Err(IOError::LengthMismatch { .. })
            ));
            vis.close().unwrap();
        }
        let mut vis = VisData::open(&path, StreamMode::Old).unwrap();
        let mut rec = VisRecord::default();
        let mut all_flags = vec![];
        while vis.read_record(&mut rec).unwrap() {
            all_flags.push(rec.flags.clone());
        }
        assert_eq!(all_flags.len(), 3);
        assert_eq!(all_flags[0], vec![true; 4]);
        assert_eq!(all_flags[1], vec![false, true, false, true]);
        assert_eq!(all_flags[2], vec![true; 4]);
    }

    #[test]
    fn test_append_continues_stream() {
        let tmp_dir = tempdir().unwrap();
        let path = synth_vis(tmp_dir.path(), "in.uv", &[SynthWindow::new(4, 2)]);
        {
            let mut vis = VisData::open(&path, StreamMode::Append).unwrap();
            vis.write(&[0.0, 0.0, 0.0, 9.0, 258.0], &[c(5.0, 5.0); 4], &[false; 4])
                .unwrap();
            vis.close().unwrap();
        }
        let mut vis = VisData::open(&path, StreamMode::Old).unwrap();
        let mut rec = VisRecord::default();
        let mut n = 0;
        while vis.read_record(&mut rec).unwrap() {
            n += 1;
        }
        assert_eq!(n, 3);
        assert_eq!(rec.flags, vec![false; 4]);
        assert_eq!(rec.data[0], c(5.0, 5.0));
        // sdf was carried over from the replayed records, not rewritten
        assert!(vis.get_var_first_f64("sdf", 0.0).unwrap() > 0.0);
    }

    #[test]
    fn test_copy_marked_and_line_vars() {
        let tmp_dir = tempdir().unwrap();
        let path = synth_vis(tmp_dir.path(), "in.uv", &[SynthWindow::new(4, 1)]);
        let mut vis = VisData::open(&path, StreamMode::Old).unwrap();
        vis.init_vars_as_input(LineType::None);
        vis.track_var("restfreq", false, true);
        assert!(vis.next().unwrap());

        let mut out = VisData::open(tmp_dir.path().join("out.uv"), StreamMode::New).unwrap();
        vis.copy_line_vars(&mut out).unwrap();
        vis.copy_marked_vars(&mut out).unwrap();
        assert!(out.get_var("restfreq").is_ok());
        assert!(out.get_var("telescop").is_ok());
        assert!(out.get_var("sdf").is_err());
        assert!(out.get_var("corr").is_err());

        vis.init_vars_as_input(LineType::Channel);
        vis.copy_line_vars(&mut out).unwrap();
        assert!(out.get_var("sdf").is_ok());
    }

    #[test]
    fn test_variance() {
        let tmp_dir = tempdir().unwrap();
        let path = tmp_dir.path().join("var.uv");
        let mut out = VisData::open(&path, StreamMode::New).unwrap();
        out.put_var("jyperk", 150.0_f32).unwrap();
        out.put_var("inttime", 10.0_f32).unwrap();
        out.put_var("sdf", 0.001_f64).unwrap();
        out.put_var("systemp", vec![50.0_f32, 100.0]).unwrap();
        out.write(&[0.0, 0.0, 0.0, 1.0, 258.0], &[c(1.0, 0.0)], &[true])
            .unwrap();
        out.close().unwrap();

        let mut vis = VisData::open(&path, StreamMode::Old).unwrap();
        assert!(vis.next().unwrap());
        let expected = 150.0 * 150.0 * 50.0 * 100.0 / (2.0 * 0.001 * 1e9 * 10.0);
        assert_abs_diff_eq!(vis.variance().unwrap().unwrap(), expected, epsilon = 1e-6);
    }
}
