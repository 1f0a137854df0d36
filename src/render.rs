//! Invoking the converter and turning its output into displayable HTML.

use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

pub mod output;
mod process;

pub use output::{escape_html, render_error, transform, BASE_TAG_PLACEHOLDER};
pub use process::Invocation;

/// Why a single converter invocation produced no HTML.
///
/// A diagnostic only ever ends the invocation it came from. The session displays it in place of
/// the rendered output and keeps scheduling renders as usual.
#[derive(Debug, Error)]
pub enum Diagnostic {
    /// The converter could not be started, usually because it is not installed.
    #[error("failed to spawn converter: {0}")]
    Spawn(#[source] io::Error),

    /// The converter ran but reported failure.
    #[error("converter exited with {status}\n{stderr}")]
    Exit {
        /// Exit status of the process.
        status: ExitStatus,
        /// Everything the converter wrote to its error stream.
        stderr: String,
    },

    /// The converter did not finish within the configured bound and was killed.
    #[error("converter timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Writing input to, or reading output from, the converter failed.
    #[error("converter I/O failed: {0}")]
    Io(#[source] io::Error),

    /// The extra converter arguments have an unterminated quote or a trailing backslash, so the
    /// converter was never started.
    #[error("invalid extra pandoc arguments: {0}")]
    Arguments(#[source] shell_words::ParseError),

    /// An extra input file could not be read, so the converter was never started.
    #[error("failed to read input file {}: {source}", .path.display())]
    InputFile {
        /// The resolved path of the file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },
}

/// Coarse classification of a [`Diagnostic`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// The converter failed to start, failed while running, or its input could not be assembled.
    ProcessFailed,
    /// The converter exceeded its wall-clock bound.
    Timeout,
}

impl Diagnostic {
    /// Returns the coarse kind of this diagnostic.
    pub fn kind(&self) -> DiagnosticKind {
        match self {
            Diagnostic::Timeout(_) => DiagnosticKind::Timeout,
            _ => DiagnosticKind::ProcessFailed,
        }
    }
}
