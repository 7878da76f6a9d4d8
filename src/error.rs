use std::fmt::{self, Display, Formatter};

use thiserror::Error;

use crate::registry::UnitStatus;

/// A single problem found while compiling a unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Diagnostic {
    /// One-based line of the offending source.
    pub line: usize,
    /// One-based column of the offending source.
    pub column: usize,
    /// Human-readable description.
    pub message: String,
}

impl Display for Diagnostic {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}:{}: {}", self.line, self.column, self.message)
    }
}

/// All problems found while compiling a unit, in source order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Diagnostics(Vec<Diagnostic>);

impl Diagnostics {
    /// Creates an empty set of diagnostics.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Adds a diagnostic at a line and column.
    pub fn push(&mut self, line: usize, column: usize, message: impl Into<String>) {
        self.0.push(Diagnostic { line, column, message: message.into() });
    }

    /// Whether no problems were found.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The number of problems.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterates over the problems.
    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.0.iter()
    }

    /// Renders the diagnostics as text, one per line, for display to the user.
    pub fn text(&self) -> String {
        self.to_string()
    }
}

impl Display for Diagnostics {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        for (i, diagnostic) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            diagnostic.fmt(f)?;
        }
        Ok(())
    }
}

impl From<Diagnostic> for Diagnostics {
    fn from(diagnostic: Diagnostic) -> Self {
        Self(vec![diagnostic])
    }
}

/// A unit's source failed to compile against its contract.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to compile `{unit}`:\n{diagnostics}")]
pub struct CompileError {
    /// The qualified name of the unit.
    pub unit: String,
    /// The compiler's diagnostics, verbatim.
    pub diagnostics: Diagnostics,
}

/// An engine was requested from a unit that is not built.
///
/// This is a caller-ordering bug: engines can only be minted after
/// [`UnitRegistry::get_or_build`](crate::UnitRegistry::get_or_build) returned
/// a built unit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot instantiate `{unit}`: unit is {status:?}")]
pub struct InstantiationError {
    /// The qualified name of the unit.
    pub unit: String,
    /// The status the unit was in.
    pub status: UnitStatus,
}

/// A runtime fault raised by a loaded artifact.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct Fault(pub String);

impl Fault {
    /// Creates a fault from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Transforming a raw value failed.
///
/// Recorded on the entry and delivered to every subscriber of it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformError {
    /// The transformation logic rejected the value.
    #[error("`{engine}` failed: {message}")]
    Fault { engine: String, message: String },
    /// The transformation logic panicked.
    #[error("`{engine}` panicked: {message}")]
    Panicked { engine: String, message: String },
    /// The unit backing the engine does not compile.
    #[error(transparent)]
    Compilation(#[from] CompileError),
    /// The unit backing the engine could not be instantiated.
    #[error(transparent)]
    Instantiation(#[from] InstantiationError),
    /// The computation owning the entry went away without a result.
    #[error("computation was abandoned before producing a result")]
    Abandoned,
}

impl TransformError {
    /// Creates a fault attributed to an engine.
    pub fn fault(engine: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fault { engine: engine.into(), message: message.into() }
    }
}

/// Loading a configuration failed.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The text is not valid TOML or does not match the schema.
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
    /// A field holds a value that cannot be used.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// The unit runtime could not be started.
    #[error("cannot start the unit runtime: {0}")]
    Runtime(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostics_text() {
        let mut diagnostics = Diagnostics::new();
        assert!(diagnostics.is_empty());
        diagnostics.push(1, 4, "expected `(`");
        diagnostics.push(3, 1, "missing entry point `convert`");
        assert_eq!(diagnostics.len(), 2);
        assert_eq!(
            diagnostics.text(),
            "1:4: expected `(`\n3:1: missing entry point `convert`"
        );
    }

    #[test]
    fn test_compile_error_carries_text() {
        let error = CompileError {
            unit: "demo.Hex".into(),
            diagnostics: Diagnostic { line: 2, column: 7, message: "boom".into() }
                .into(),
        };
        let transform: TransformError = error.into();
        assert_eq!(transform.to_string(), "failed to compile `demo.Hex`:\n2:7: boom");
    }
}
