//! Command Line Interface helpers for chanaver
//!
//! Arguments follow the MIRIAD convention of `keyword=value` tokens, e.g.
//! `chanaver vis=a.uv,b.uv out=avg.uv naver=4`. Tokens may also come from a
//! parameter file given with `-f <file>`.

use std::{
    ffi::OsString,
    fmt::{Debug, Display},
    fs,
    time::Duration,
};

use clap::{
    arg, command,
    ErrorKind::{ArgumentNotFound, DisplayHelp, DisplayVersion},
    ValueHint::FilePath,
};
use lazy_static::lazy_static;
use log::{debug, info, trace};
use prettytable::{cell, format as prettyformat, row, table, Table};
use regex::Regex;

use crate::{
    averaging::{channel_average, AverageSummary, ChanAverageParams, DEFAULT_BANNER, DEFAULT_SLOP},
    error::{
        CLIError::{self, InvalidCommandLineArgument, MissingKeyword, ParamFile, Unsupported},
        MirError,
    },
    get_durations,
    io::history::PARAM_FILE_FLAG,
    source::VisInputs,
};

lazy_static! {
    static ref KEYWORD: Regex = Regex::new(r"^([A-Za-z][A-Za-z0-9_]*)=(.*)$").unwrap();
}

/// Keywords of the usual uv task interface which this task doesn't act on.
const UNSUPPORTED_KEYWORDS: [&str; 4] = ["select", "line", "stokes", "ref"];

/// Values accepted by `options=`.
const OPTION_NAMES: [&str; 3] = ["nocal", "nopass", "nopol"];

// Add build-time information from the "built" crate.
include!(concat!(env!("OUT_DIR"), "/built.rs"));

/// Write many info-level log lines of how this executable was compiled.
///
/// # Errors
///
/// propagates writeln! fails
pub fn fmt_build_info(f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match (GIT_HEAD_REF, GIT_COMMIT_HASH) {
        (Some(hr), Some(hash)) => {
            let dirty = GIT_DIRTY.unwrap_or(false);
            writeln!(
                f,
                "Compiled on git commit hash: {}{}",
                hash,
                if dirty { " (dirty)" } else { "" }
            )?;
            writeln!(f, "            git head ref: {}", hr)?;
        }
        _ => writeln!(f, "Compiled on git commit hash: <no git info>")?,
    }
    writeln!(f, "            {}", BUILT_TIME_UTC)?;
    writeln!(f, "         with compiler {}", RUSTC_VERSION)?;
    writeln!(f)?;
    Ok(())
}

/// Rewrite a `keyword=value` token as `--keyword=value`; anything else is
/// passed through.
fn keyword_to_flag(token: &str) -> String {
    match KEYWORD.captures(token) {
        Some(caps) => format!("--{}={}", caps[1].to_lowercase(), &caps[2]),
        None => token.to_string(),
    }
}

/// Tokens of a parameter file, one or more per line, `#` starting a comment.
fn read_param_file(path: &str) -> Result<Vec<String>, CLIError> {
    let contents = fs::read_to_string(path).map_err(|e| ParamFile {
        path: path.to_string(),
        why: e.to_string(),
    })?;
    let mut tokens = vec![];
    for line in contents.lines() {
        let line = line.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }
        let words = shlex::split(line).ok_or_else(|| ParamFile {
            path: path.to_string(),
            why: format!("unbalanced quotes in \"{}\"", line),
        })?;
        tokens.extend(words.iter().map(|word| keyword_to_flag(word)));
    }
    Ok(tokens)
}

/// Split raw arguments (program name first) into those handed to clap, and
/// those logged to history (program name dropped, parameter files left for
/// the history writer to expand).
fn expand_args(args: &[String]) -> Result<(Vec<String>, Vec<String>), CLIError> {
    let mut clap_args = vec![];
    let mut history_args = vec![];
    let mut tokens = args.iter();
    if let Some(program) = tokens.next() {
        clap_args.push(program.clone());
    }
    while let Some(token) = tokens.next() {
        history_args.push(token.clone());
        if token == PARAM_FILE_FLAG {
            let path = tokens.next().ok_or_else(|| ParamFile {
                path: String::new(),
                why: format!("{} needs a file name", PARAM_FILE_FLAG),
            })?;
            history_args.push(path.clone());
            clap_args.extend(read_param_file(path)?);
        } else {
            clap_args.push(keyword_to_flag(token));
        }
    }
    Ok((clap_args, history_args))
}

/// Calibration switches given with `options=`.
///
/// This crate applies no calibration tables, so these only document intent.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChanaverOptions {
    /// Do not apply gain/phase calibration tables
    pub nocal: bool,
    /// Do not apply the bandpass correction
    pub nopass: bool,
    /// Do not apply polarization leakage correction
    pub nopol: bool,
}

impl ChanaverOptions {
    /// Parse a comma separated list, with minimum-match on each word.
    ///
    /// # Errors
    ///
    /// [`CLIError::InvalidCommandLineArgument`] for an unknown or ambiguous
    /// word.
    pub fn parse(value: &str) -> Result<Self, CLIError> {
        let mut options = Self::default();
        for word in value.split(',').map(str::trim).filter(|w| !w.is_empty()) {
            let lower = word.to_lowercase();
            let exact = OPTION_NAMES.iter().any(|name| *name == lower);
            let matched: Vec<&str> = OPTION_NAMES
                .iter()
                .copied()
                .filter(|name| if exact { *name == lower } else { name.starts_with(&lower) })
                .collect();
            match matched.as_slice() {
                ["nocal"] => options.nocal = true,
                ["nopass"] => options.nopass = true,
                ["nopol"] => options.nopol = true,
                _ => {
                    return Err(InvalidCommandLineArgument {
                        option: "options=".into(),
                        expected: format!("one of {}", OPTION_NAMES.join(", ")),
                        received: word.to_string(),
                    })
                }
            }
        }
        Ok(options)
    }
}

impl Display for ChanaverOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let set: Vec<&str> = OPTION_NAMES
            .iter()
            .copied()
            .zip([self.nocal, self.nopass, self.nopol])
            .filter_map(|(name, on)| if on { Some(name) } else { None })
            .collect();
        if set.is_empty() {
            write!(f, "(none)")
        } else {
            write!(f, "{}", set.join(","))
        }
    }
}

/// Everything needed to run chanaver.
#[derive(Debug, Clone)]
pub struct ChanaverContext {
    /// Input dataset paths
    pub vis: Vec<String>,
    /// Output dataset path
    pub out: String,
    /// Averaging parameters
    pub params: ChanAverageParams,
    /// Calibration switches
    pub options: ChanaverOptions,
}

impl Display for ChanaverContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "chanaver ({} version {})", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))?;
        fmt_build_info(f)?;
        writeln!(f, "Input datasets:       {}", self.vis.join(", "))?;
        writeln!(f, "Output dataset:       {}", self.out)?;
        writeln!(f, "Options:              {}", self.options)?;
        write!(f, "{}", self.params)?;
        Ok(())
    }
}

impl ChanaverContext {
    fn get_matches<I, T>(args: I) -> Result<clap::ArgMatches, MirError>
    where
        I: IntoIterator<Item = T> + Debug,
        T: Into<OsString> + Clone,
    {
        let mut app = command!()
            .name("chanaver")
            .arg_required_else_help(true)
            .next_line_help(false)
            .about(
                "Average spectral channels of MIRIAD uv datasets. \
                    Keywords are given as key=value.",
            )
            .args(&[
                // input options
                arg!(--vis <VIS> "Input datasets, comma separated")
                    .value_hint(FilePath)
                    .help_heading("INPUT")
                    .required(false),
                arg!(--select <SELECT> "uv data selection (not supported)")
                    .help_heading("INPUT")
                    .required(false),
                arg!(--line <LINE> "Line processing (not supported)")
                    .help_heading("INPUT")
                    .required(false),
                arg!(--stokes <STOKES> "Stokes processing (not supported)")
                    .help_heading("INPUT")
                    .required(false),
                arg!(--"ref" <REF> "Reference line processing (not supported)")
                    .help_heading("INPUT")
                    .required(false),
                arg!(--options <OPTIONS> "Comma separated: nocal, nopass, nopol")
                    .help_heading("INPUT")
                    .required(false),

                // averaging options
                arg!(--naver <NAVER> "Number of channels to average together")
                    .help_heading("AVERAGING")
                    .required(false),
                arg!(--slop <SLOP> "Fraction of good channels needed per bin [default: 0.5]")
                    .help_heading("AVERAGING")
                    .required(false),

                // output options
                arg!(--out <OUT> "The averaged output dataset to create")
                    .value_hint(FilePath)
                    .help_heading("OUTPUT")
                    .required(false),

                arg!(--"no-draw-progress" "do not show progress bars"),
            ]);
        let matches = app.try_get_matches_from_mut(args)?;
        Ok(matches)
    }

    /// Parse a chanaver command line, program name first.
    ///
    /// # Errors
    ///
    /// - `clap::Error` if clap cannot parse `args`
    /// - [`CLIError`] for missing, unsupported or invalid keywords, or an
    ///   unreadable parameter file
    /// - [`MirError::InvalidNaver`], [`MirError::InvalidSlop`]
    pub fn from_args<I, T>(args: I) -> Result<Self, MirError>
    where
        I: IntoIterator<Item = T> + Debug,
        T: Into<OsString> + Clone,
    {
        debug!("args:\n{:?}", &args);
        let args: Vec<String> = args
            .into_iter()
            .map(|arg| arg.into().to_string_lossy().into_owned())
            .collect();
        let (clap_args, history_args) = expand_args(&args)?;

        let matches = Self::get_matches(clap_args)?;
        trace!("arg matches:\n{:?}", &matches);

        for keyword in UNSUPPORTED_KEYWORDS {
            if matches.is_present(keyword) {
                return Err(Unsupported {
                    keyword: keyword.to_string(),
                }
                .into());
            }
        }

        let out = match matches.value_of("out") {
            Some(out) if !out.trim().is_empty() => out.to_string(),
            _ => {
                return Err(MissingKeyword {
                    keyword: "out".into(),
                    message: "must specify an output filename".into(),
                }
                .into())
            }
        };
        let naver = match matches.value_of_t::<usize>("naver") {
            Ok(naver) => naver,
            Err(err) if err.kind() == ArgumentNotFound => {
                return Err(MissingKeyword {
                    keyword: "naver".into(),
                    message: "must specify the number of channels to average".into(),
                }
                .into())
            }
            Err(err) => return Err(err.into()),
        };
        let slop = match matches.value_of_t::<f64>("slop") {
            Ok(slop) => slop,
            Err(err) if err.kind() == ArgumentNotFound => DEFAULT_SLOP,
            Err(err) => return Err(err.into()),
        };
        let vis: Vec<String> = matches
            .value_of("vis")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|path| !path.is_empty())
            .map(String::from)
            .collect();
        if vis.is_empty() {
            return Err(MissingKeyword {
                keyword: "vis".into(),
                message: "must specify the input datasets".into(),
            }
            .into());
        }
        let options = ChanaverOptions::parse(matches.value_of("options").unwrap_or_default())?;

        let params = ChanAverageParams {
            naver,
            slop,
            banner: DEFAULT_BANNER.to_string(),
            args: history_args,
            draw_progress: !matches.is_present("no-draw-progress"),
        };
        params.validate()?;

        let result = Self {
            vis,
            out,
            params,
            options,
        };
        info!("{}", &result);
        Ok(result)
    }

    /// Average the inputs into the output.
    ///
    /// # Errors
    ///
    /// Whatever opening the inputs or [`channel_average`] raises.
    pub fn run(&self) -> Result<AverageSummary, MirError> {
        let mut inputs = VisInputs::new(&self.vis)?;
        channel_average(&mut inputs, &self.out, &self.params)
    }
}

/// A table of the spectral setups averaged.
pub fn summary_table(summary: &AverageSummary) -> Table {
    let mut plan_table = table!([
        "", "nchan", "nout", "nmin", "sdf [GHz]", "sdf out", "sfreq [GHz]", "sfreq out"
    ]);
    plan_table.set_format(*prettyformat::consts::FORMAT_CLEAN);
    for (idx, plan) in summary.plans.iter().enumerate() {
        plan_table.add_row(row![r =>
            format!("setup{}:", idx),
            plan.nchan,
            plan.nout,
            plan.nmin,
            format!("{:.6}", plan.sdf),
            format!("{:.6}", plan.sdf_out),
            format!("{:.6}", plan.sfreq),
            format!("{:.6}", plan.sfreq_out)
        ]);
    }
    plan_table
}

/// Run chanaver with `args`, program name first. Returns the process exit
/// code.
pub fn main_with_args<I, T>(args: I) -> i32
where
    I: IntoIterator<Item = T> + Debug,
    T: Into<OsString> + Clone,
{
    let ctx = match ChanaverContext::from_args(args) {
        Ok(ctx) => ctx,
        Err(MirError::ClapError(inner)) => {
            // Swallow broken pipe errors
            trace!("clap error: {:?}", inner.kind());
            let _ = inner.print();
            match inner.kind() {
                DisplayHelp | DisplayVersion => return 0,
                _ => return 1,
            }
        }
        Err(e) => {
            eprintln!("error parsing args: {e}");
            return 1;
        }
    };

    match ctx.run() {
        Ok(summary) => {
            info!(
                "{} records, npol {:?}, spectral setups:\n{}",
                summary.num_records,
                summary.npol,
                summary_table(&summary)
            );
            info!(
                "total duration: {:?}",
                get_durations().into_iter().fold(
                    Duration::ZERO,
                    |duration_sum, (name, duration)| {
                        info!("{} duration: {:?}", name, duration);
                        duration_sum + duration
                    }
                )
            );
            0
        }
        Err(e) => {
            eprintln!("averaging error: {e}");
            1
        }
    }
}
