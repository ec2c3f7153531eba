//! Channel averaging of uv data.
//!
//! Runs of `naver` adjacent channels are averaged into one output channel.
//! Flagged channels are left out of each average, and an output channel is
//! only good when enough of its inputs were (see [`min_good_channels`]).

use std::{fmt::Display, fs, path::Path};

use derive_builder::Builder;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use itertools::izip;
use log::{debug, info, trace, warn};

use crate::{
    error::MirError,
    io::history::{HistoryMode, HISTORY_ITEM},
    source::VisSource,
    uv::{LineType, SpectralConfig, StreamMode, VarTracker, VisData, VisRecord},
    with_increment_duration, Complex32,
};

/// Name this task logs itself as in history.
pub const IDENT: &str = "CHANAVER";

/// Default fraction of good channels needed per output channel.
pub const DEFAULT_SLOP: f64 = 0.5;

/// Default banner written to the output history.
pub const DEFAULT_BANNER: &str = "CHANAVER: channel average after applying bandpass";

/// Variables whose change means a new spectral setup.
const SPECTRAL_VARS: [&str; 7] = ["nchan", "nspect", "nwide", "sdf", "nschan", "ischan", "sfreq"];

/// Line variables carried over from the input unchanged.
const PASSTHROUGH_LINE_VARS: [&str; 5] = ["restfreq", "systemp", "xtsys", "ytsys", "xyphase"];

/// Options for channel averaging
#[derive(Builder, Debug, Clone)]
pub struct ChanAverageParams {
    /// Number of channels averaged into each output channel
    pub naver: usize,

    /// Fraction of the channels in each bin which must be good for the
    /// output channel to be good
    #[builder(default = "DEFAULT_SLOP")]
    pub slop: f64,

    /// Written to the output history before the invocation log
    #[builder(default = "DEFAULT_BANNER.to_string()", setter(into))]
    pub banner: String,

    /// Command line arguments logged to the output history, without the
    /// program name
    #[builder(default = "vec![\"undefined\".to_string()]")]
    pub args: Vec<String>,

    /// Whether to draw progress bars
    #[builder(default = "true")]
    pub draw_progress: bool,
}

impl ChanAverageParams {
    /// Check `naver` and `slop`.
    ///
    /// # Errors
    ///
    /// [`MirError::InvalidNaver`] or [`MirError::InvalidSlop`].
    pub fn validate(&self) -> Result<(), MirError> {
        if self.naver < 1 {
            return Err(MirError::InvalidNaver(self.naver));
        }
        if !(0.0..=1.0).contains(&self.slop) {
            return Err(MirError::InvalidSlop(self.slop));
        }
        Ok(())
    }
}

impl Display for ChanAverageParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Will average {} channels, requiring {} good per bin (slop={}).",
            self.naver,
            min_good_channels(self.slop, self.naver),
            self.slop
        )
    }
}

/// Fewest good input channels an output channel needs to be good. Never
/// less than one, even with a `slop` of zero.
pub fn min_good_channels(slop: f64, naver: usize) -> usize {
    ((slop * naver as f64).round() as usize).max(1)
}

/// How one spectral setup maps onto the output.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelPlan {
    /// Input channels per record
    pub nchan: usize,
    /// Output channels per record
    pub nout: usize,
    /// Input channels per output channel
    pub naver: usize,
    /// Good input channels needed per output channel
    pub nmin: usize,
    /// Input channel width, GHz
    pub sdf: f64,
    /// Output channel width, GHz
    pub sdf_out: f64,
    /// Input first channel frequency, GHz
    pub sfreq: f64,
    /// Output first channel frequency, GHz
    pub sfreq_out: f64,
}

impl ChannelPlan {
    /// Check the spectral setup of input `vis` can be averaged by `naver`,
    /// and work out the output setup.
    ///
    /// # Errors
    ///
    /// [`MirError::InputStructure`] unless the input has a single spectral
    /// window, no wideband channels, and `nchan` channels starting at the
    /// first which split evenly into runs of `naver`.
    pub fn new(
        vis: &str,
        config: &SpectralConfig,
        naver: usize,
        nmin: usize,
    ) -> Result<Self, MirError> {
        if naver < 1 {
            return Err(MirError::InvalidNaver(naver));
        }
        let fail = |why: String| MirError::InputStructure {
            vis: vis.to_string(),
            why,
        };
        if config.nspect != 1 {
            return Err(fail("require exactly one spectral window".to_string()));
        }
        if config.nwide != 0 {
            return Err(fail("require no wideband windows".to_string()));
        }
        let nchan = config.nchan;
        let nschan = config.nschan.first().copied().unwrap_or(0);
        let ischan = config.ischan.first().copied().unwrap_or(0);
        if nschan != nchan {
            return Err(fail(format!(
                "require nchan ({}) = nschan ({})",
                nchan, nschan
            )));
        }
        if ischan != 1 {
            return Err(fail(format!("require ischan ({}) = 1", ischan)));
        }
        if nchan < 0 || nchan as usize % naver != 0 {
            return Err(fail(format!(
                "require nchan ({}) to be a multiple of naver ({})",
                nchan, naver
            )));
        }

        let nchan = nchan as usize;
        let sdf = config.sdf.first().copied().unwrap_or(0.0);
        let sfreq = config.sfreq.first().copied().unwrap_or(0.0);
        Ok(Self {
            nchan,
            nout: nchan / naver,
            naver,
            nmin,
            sdf,
            sdf_out: sdf * naver as f64,
            sfreq,
            sfreq_out: sfreq + 0.5 * sdf * (naver as f64 - 1.0),
        })
    }

    /// Set the output spectral variables for the next record written.
    fn put_vars(&self, out: &mut VisData) -> Result<(), MirError> {
        out.put_var("nspect", 1_i32)?;
        out.put_var("nschan", self.nout as i32)?;
        out.put_var("ischan", 1_i32)?;
        out.put_var("sdf", self.sdf_out)?;
        out.put_var("sfreq", self.sfreq_out)?;
        Ok(())
    }
}

impl Display for ChannelPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} -> {} channels, sdf {} -> {} GHz, sfreq {} -> {} GHz",
            self.nchan, self.nout, self.sdf, self.sdf_out, self.sfreq, self.sfreq_out
        )
    }
}

/// Average `data` in runs of `naver` channels.
///
/// Flagged (false) channels are left out of each sum, and every sum is
/// divided by its number of good channels, or by one when there are none.
/// An output channel is good when at least `nmin` of its inputs are.
///
/// `out_data` and `out_flags` receive `data.len() / naver` channels.
///
/// # Panics
///
/// If `naver` is zero.
pub fn average_channels(
    data: &[Complex32],
    flags: &[bool],
    naver: usize,
    nmin: usize,
    out_data: &mut [Complex32],
    out_flags: &mut [bool],
) {
    for (bin_data, bin_flags, out, out_flag) in izip!(
        data.chunks_exact(naver),
        flags.chunks_exact(naver),
        out_data.iter_mut(),
        out_flags.iter_mut(),
    ) {
        let mut sum = Complex32::default();
        let mut count = 0_usize;
        for (&value, &good) in izip!(bin_data, bin_flags) {
            if good {
                sum += value;
                count += 1;
            }
        }
        *out_flag = count >= nmin;
        *out = sum / count.max(1) as f32;
    }
}

/// Whether the output ended up with one polarization count throughout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NpolRepr {
    /// Constant, and recorded in the `npol` header item
    Constant(i32),
    /// Varied, and only recorded per record
    Varied,
}

/// What [`channel_average`] did.
#[derive(Debug, Clone, PartialEq)]
pub struct AverageSummary {
    /// Every spectral setup seen, in order, without consecutive repeats
    pub plans: Vec<ChannelPlan>,
    /// Number of records written
    pub num_records: usize,
    /// How `npol` was recorded
    pub npol: NpolRepr,
}

/// Failure of an averaging run, split by whether the output got created.
#[derive(Debug)]
pub enum AverageError {
    /// The output could not be created; whatever is at the path isn't ours
    CreateFailed(MirError),
    /// The run failed after the output was created
    RuntimeFailed(MirError),
}

/// Average the channels of every record in `source` into a new uv dataset
/// at `out_path`.
///
/// The output history starts with a copy of the first input's history,
/// followed by the banner, an invocation log of `params.args`, and the
/// averaging parameters.
///
/// # Errors
///
/// - [`MirError::InvalidNaver`], [`MirError::InvalidSlop`] for bad params,
///   before anything is created
/// - [`MirError::InputStructure`] for an input that can't be averaged
/// - I/O errors
///
/// On any failure after the output was created, the output is removed.
pub fn channel_average<S, P>(
    source: &mut S,
    out_path: P,
    params: &ChanAverageParams,
) -> Result<AverageSummary, MirError>
where
    S: VisSource + ?Sized,
    P: AsRef<Path>,
{
    params.validate()?;
    let out_path = out_path.as_ref();
    match run(source, out_path, params) {
        Ok(summary) => Ok(summary),
        Err(AverageError::CreateFailed(e)) => Err(e),
        Err(AverageError::RuntimeFailed(e)) => {
            debug!("removing incomplete output {}", out_path.display());
            if let Err(remove_err) = fs::remove_dir_all(out_path) {
                warn!(
                    "could not remove incomplete output {}: {}",
                    out_path.display(),
                    remove_err
                );
            }
            Err(e)
        }
    }
}

fn run<S: VisSource + ?Sized>(
    source: &mut S,
    out_path: &Path,
    params: &ChanAverageParams,
) -> Result<AverageSummary, AverageError> {
    let mut out = VisData::open(out_path, StreamMode::New)
        .map_err(|e| AverageError::CreateFailed(e.into()))?;
    let summary = average_into(source, &mut out, params).map_err(AverageError::RuntimeFailed)?;
    out.close()
        .map_err(|e| AverageError::RuntimeFailed(e.into()))?;
    Ok(summary)
}

/// Copy the preamble layout, correlation type and history of the first
/// input to `out`.
fn start_output(
    vis: &mut VisData,
    out: &mut VisData,
    params: &ChanAverageParams,
) -> Result<(), MirError> {
    out.set_preamble_layout(vis.preamble_layout().clone())?;
    let corr_type = match vis.probe_var("corr") {
        Some(probe) => probe.var_type.code(),
        None => {
            return Err(MirError::InputStructure {
                vis: vis.name().to_string(),
                why: "no \"corr\" variable".to_string(),
            })
        }
    };
    if !matches!(corr_type, 'r' | 'j' | 'c') {
        return Err(MirError::InputStructure {
            vis: vis.name().to_string(),
            why: format!(
                "type of \"corr\" variable ({}) not expected (one of rjc)",
                corr_type
            ),
        });
    }
    out.set_correlation_type(corr_type)?;

    vis.dataset_mut()
        .copy_item(out.dataset_mut(), HISTORY_ITEM)?;
    let history = out.dataset_mut();
    history.open_history(HistoryMode::Append)?;
    history.write_history(&params.banner)?;
    history.log_invocation(IDENT, &params.args)?;
    history.write_history(&format!(
        "{}: naver={} slop={:.6}",
        IDENT, params.naver, params.slop
    ))?;
    history.close_history()?;
    Ok(())
}

/// Prepare a newly opened input: watch its spectral setup, and copy
/// everything else through.
fn watch_input(vis: &mut VisData) -> VarTracker {
    let mut tracker = VarTracker::new();
    tracker.track(&SPECTRAL_VARS);
    for name in PASSTHROUGH_LINE_VARS {
        vis.track_var(name, false, true);
    }
    vis.init_vars_as_input(LineType::None);
    tracker
}

fn average_into<S: VisSource + ?Sized>(
    source: &mut S,
    out: &mut VisData,
    params: &ChanAverageParams,
) -> Result<AverageSummary, MirError> {
    let nmin = min_good_channels(params.slop, params.naver);

    let draw_target = if params.draw_progress {
        ProgressDrawTarget::stderr()
    } else {
        ProgressDrawTarget::hidden()
    };
    let progress = ProgressBar::with_draw_target(None, draw_target)
        .with_style(
            ProgressStyle::with_template("{msg:16}: [{elapsed_precise}] {spinner} {pos} records")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        )
        .with_message("averaging");

    let mut record = VisRecord::default();
    let mut out_data: Vec<Complex32> = vec![];
    let mut out_flags: Vec<bool> = vec![];

    let mut started = false;
    let mut input_index: Option<usize> = None;
    let mut tracker = VarTracker::new();
    let mut plan: Option<ChannelPlan> = None;
    let mut plans: Vec<ChannelPlan> = vec![];

    // polarizations left in the current group, and the npol last written
    let mut npol_left = 0_i32;
    let mut prev_npol = 0_i32;
    let mut npol_varied = false;
    let mut num_records = 0_usize;

    while with_increment_duration!("read", source.read_next(&mut record))? {
        let index = source.input_index();
        let vis = source.current_mut().ok_or_else(|| {
            MirError::Bookkeeping("source yielded a record without an open input".to_string())
        })?;

        if !started {
            started = true;
            start_output(vis, out, params)?;
        }

        if input_index != Some(index) {
            debug!("now reading {}", vis.name());
            input_index = Some(index);
            npol_left = 0;
            tracker = watch_input(vis);
        }

        if tracker.updated(vis) || plan.is_none() {
            let new_plan = ChannelPlan::new(
                vis.name(),
                &vis.spectral_config()?,
                params.naver,
                nmin,
            )?;
            debug!("{}: {}", vis.name(), new_plan);
            new_plan.put_vars(out)?;
            out_data.resize(new_plan.nout, Complex32::default());
            out_flags.resize(new_plan.nout, false);
            if plans.last() != Some(&new_plan) {
                plans.push(new_plan.clone());
            }
            plan = Some(new_plan);
        }
        let current_plan = match plan.as_ref() {
            Some(current_plan) => current_plan,
            None => return Err(MirError::Bookkeeping("no channel plan".to_string())),
        };
        if record.nchan() != current_plan.nchan {
            return Err(MirError::Bookkeeping(format!(
                "{}: record {} has {} channels, but nchan is {}",
                vis.name(),
                vis.current_vis_num(),
                record.nchan(),
                current_plan.nchan
            )));
        }

        with_increment_duration!(
            "average",
            average_channels(
                &record.data,
                &record.flags,
                current_plan.naver,
                current_plan.nmin,
                &mut out_data,
                &mut out_flags,
            )
        );

        vis.copy_line_vars(out)?;
        vis.copy_marked_vars(out)?;

        if npol_left <= 0 {
            npol_left = vis.npol()?;
            if npol_left != prev_npol {
                trace!("{}: npol {} -> {}", vis.name(), prev_npol, npol_left);
                out.put_var("npol", npol_left)?;
                npol_varied = npol_varied || prev_npol != 0;
                prev_npol = npol_left;
            }
        }
        out.put_var("pol", vis.pol()?)?;
        with_increment_duration!(
            "write",
            out.write(&record.preamble, &out_data, &out_flags)
        )?;
        npol_left -= 1;
        num_records += 1;
        progress.inc(1);
    }
    progress.finish();

    if !started {
        warn!("no records read, output {} is empty", out.name());
    }

    let npol = if npol_varied {
        NpolRepr::Varied
    } else {
        out.dataset_mut().write_header_i32("npol", prev_npol)?;
        NpolRepr::Constant(prev_npol)
    };

    info!(
        "averaged {} records into {} ({} spectral setups)",
        num_records,
        out.name(),
        plans.len()
    );
    Ok(AverageSummary {
        plans,
        num_records,
        npol,
    })
}
