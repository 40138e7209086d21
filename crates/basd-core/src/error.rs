//! Error taxonomy and cell-local diagnostics for the engine.
//!
//! [`Error`] carries only conditions that abort a run. Cell-local issues
//! (fit fallback, an all-invalid time series, a capped climatology value,
//! ...) are not errors: they are pushed onto a [`Diagnostics`] sink and the
//! affected cell proceeds or is skipped, per spec.

use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Fatal errors that abort a run.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid bounds, inconsistent distribution/bounds, invalid month list
    /// or step size, inconsistent shapes across roles.
    #[error("configuration error: {0}")]
    Config(String),

    /// Missing coordinate variables, non-proleptic-Gregorian calendar,
    /// non-nested grids, gaps in period coverage.
    #[error("data error: {0}")]
    Data(String),

    /// Inf/nan remaining in a cell's output after adjustment.
    #[error("numerical error at {location}: {message}")]
    Numerical { location: String, message: String },

    /// A `GridStore` read or write failed.
    #[error("grid store error: {0}")]
    Store(String),
}

/// A single cell-local warning, as described in spec §7.
#[derive(Debug, Clone, PartialEq)]
pub struct Warning {
    /// Human-readable location tag (e.g. a formatted `i_loc` tuple).
    pub location: String,
    pub message: String,
}

impl Warning {
    pub fn new(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            message: message.into(),
        }
    }
}

/// Accumulates cell-local warnings for a run.
///
/// Mirrors the source's `--repeat-warnings` flag: by default, identical
/// `(location, message)` pairs are recorded only once.
#[derive(Debug, Default)]
pub struct Diagnostics {
    repeat: bool,
    seen: std::collections::HashSet<(String, String)>,
    warnings: Vec<Warning>,
}

impl Diagnostics {
    pub fn new(repeat_warnings: bool) -> Self {
        Self {
            repeat: repeat_warnings,
            seen: std::collections::HashSet::new(),
            warnings: Vec::new(),
        }
    }

    /// Record a warning, honoring the dedup policy.
    pub fn warn(&mut self, location: impl Into<String>, message: impl Into<String>) {
        let location = location.into();
        let message = message.into();
        if !self.repeat {
            let key = (location.clone(), message.clone());
            if !self.seen.insert(key) {
                return;
            }
        }
        self.warnings.push(Warning::new(location, message));
    }

    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    pub fn is_empty(&self) -> bool {
        self.warnings.is_empty()
    }

    pub fn merge(&mut self, other: Diagnostics) {
        for w in other.warnings {
            self.warn(w.location, w.message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedups_identical_warnings_by_default() {
        let mut d = Diagnostics::new(false);
        d.warn("(3, 4)", "fit failed");
        d.warn("(3, 4)", "fit failed");
        d.warn("(3, 5)", "fit failed");
        assert_eq!(d.warnings().len(), 2);
    }

    #[test]
    fn repeat_warnings_keeps_duplicates() {
        let mut d = Diagnostics::new(true);
        d.warn("(3, 4)", "fit failed");
        d.warn("(3, 4)", "fit failed");
        assert_eq!(d.warnings().len(), 2);
    }
}
