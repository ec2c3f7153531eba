//! Preamble layouts.
//!
//! Every record read or written carries a preamble: a short array of doubles
//! whose meaning is fixed per stream. Each field maps onto a uv variable.

use std::fmt::Display;

use crate::io::error::IOError;

/// Upper limit on the number of doubles in a preamble.
pub const MAX_PREAMBLE: usize = 5;

/// One field of a preamble layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreambleField {
    /// u and v, from `coord`
    Uv,
    /// u, v and w, from `coord`
    Uvw,
    /// `time`
    Time,
    /// `baseline`, encoded as in [`crate::uv::encode_baseline`]
    Baseline,
    /// `pol`
    Pol,
    /// Any other scalar numeric variable
    Other(String),
}

impl PreambleField {
    fn parse(name: &str) -> Self {
        match name {
            "uv" => Self::Uv,
            "uvw" => Self::Uvw,
            "time" => Self::Time,
            "baseline" => Self::Baseline,
            "pol" => Self::Pol,
            other => Self::Other(other.to_string()),
        }
    }

    /// Number of doubles this field occupies.
    pub fn width(&self) -> usize {
        match self {
            Self::Uv => 2,
            Self::Uvw => 3,
            _ => 1,
        }
    }

    /// The uv variable holding this field.
    pub fn var_name(&self) -> &str {
        match self {
            Self::Uv | Self::Uvw => "coord",
            Self::Time => "time",
            Self::Baseline => "baseline",
            Self::Pol => "pol",
            Self::Other(name) => name,
        }
    }
}

impl Display for PreambleField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uv => write!(f, "uv"),
            Self::Uvw => write!(f, "uvw"),
            Self::Time => write!(f, "time"),
            Self::Baseline => write!(f, "baseline"),
            Self::Pol => write!(f, "pol"),
            Self::Other(name) => write!(f, "{}", name),
        }
    }
}

/// The ordered fields making up each record's preamble.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreambleLayout {
    fields: Vec<PreambleField>,
}

impl Default for PreambleLayout {
    /// `uvw/time/baseline`
    fn default() -> Self {
        Self {
            fields: vec![
                PreambleField::Uvw,
                PreambleField::Time,
                PreambleField::Baseline,
            ],
        }
    }
}

impl PreambleLayout {
    /// Build a layout from field names such as `["uvw", "time", "baseline"]`.
    ///
    /// # Errors
    ///
    /// [`IOError::Preamble`] if the layout is empty, repeats a variable, or
    /// adds up to more than [`MAX_PREAMBLE`] values.
    pub fn parse<S: AsRef<str>>(names: &[S]) -> Result<Self, IOError> {
        if names.is_empty() {
            return Err(IOError::Preamble("no fields given".to_string()));
        }
        let mut fields: Vec<PreambleField> = vec![];
        for name in names {
            let name = name.as_ref().trim().to_lowercase();
            if name.is_empty() {
                return Err(IOError::Preamble("empty field name".to_string()));
            }
            let field = PreambleField::parse(&name);
            if fields.iter().any(|f| f.var_name() == field.var_name()) {
                return Err(IOError::Preamble(format!(
                    "\"{}\" appears more than once",
                    name
                )));
            }
            fields.push(field);
        }
        let layout = Self { fields };
        if layout.len() > MAX_PREAMBLE {
            return Err(IOError::Preamble(format!(
                "{} needs {} values, at most {} are allowed",
                layout,
                layout.len(),
                MAX_PREAMBLE
            )));
        }
        Ok(layout)
    }

    /// The fields in order.
    pub fn fields(&self) -> &[PreambleField] {
        &self.fields
    }

    /// Total number of doubles per preamble.
    pub fn len(&self) -> usize {
        self.fields.iter().map(PreambleField::width).sum()
    }

    /// Always false; layouts have at least one field.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl Display for PreambleLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.fields.iter().map(ToString::to_string).collect();
        write!(f, "{}", names.join("/"))
    }
}
