//! Errors that can occur in mirtask

use thiserror::Error;

use crate::io::error::IOError;

#[derive(Error, Debug)]
#[allow(clippy::upper_case_acronyms)]
/// Errors from the command line layer
pub enum CLIError {
    /// A keyword the task can't run without was not given.
    #[error("{message} ({keyword}=...)")]
    MissingKeyword {
        /// The keyword, e.g. `out`
        keyword: String,
        /// What the user must do
        message: String,
    },

    /// A keyword this task recognises but does not act on.
    #[error("keyword {keyword}= is not supported by this task")]
    Unsupported {
        /// The keyword, e.g. `select`
        keyword: String,
    },

    /// A keyword value that could not be used.
    #[error("Invalid command line argument {option}: expected {expected}, received {received}")]
    InvalidCommandLineArgument {
        /// The option or keyword
        option: String,
        /// What was expected
        expected: String,
        /// What was received
        received: String,
    },

    /// A parameter file given with `-f` could not be used.
    #[error("could not read parameter file {path}: {why}")]
    ParamFile {
        /// Path to the parameter file
        path: String,
        /// The underlying failure
        why: String,
    },
}

#[derive(Error, Debug)]
#[allow(clippy::upper_case_acronyms)]
/// Top level error type of the crate
pub enum MirError {
    /// An input dataset has a structure the task can't process.
    #[error("Cannot handle input dataset {vis}: {why}")]
    InputStructure {
        /// Name of the input dataset
        vis: String,
        /// The violated condition
        why: String,
    },

    /// `naver` below one.
    #[error("must average at least one channel (got naver={0})")]
    InvalidNaver(usize),

    /// `slop` outside `[0, 1]`.
    #[error("slop must be between 0 and 1 (got slop={0})")]
    InvalidSlop(f64),

    /// No input datasets were given.
    #[error("no input datasets given")]
    NoInputs,

    /// An internal consistency check failed while writing output.
    #[error("bookkeeping error: {0}")]
    Bookkeeping(String),

    #[error(transparent)]
    /// Error derived from [`IOError`]
    IOError(#[from] IOError),

    #[error(transparent)]
    /// Error derived from [`CLIError`]
    CLIError(#[from] CLIError),

    #[cfg(feature = "cli")]
    #[error(transparent)]
    /// Error derived from [`clap::Error`]
    ClapError(#[from] clap::Error),
}
