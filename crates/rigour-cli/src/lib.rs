//! # rigour-cli
//!
//! Support code for the `rigour` binary: loading scene and connection files,
//! exporting reports and rendering progress on the terminal.

pub mod init;
pub mod loader;
pub mod reporters;
pub mod terminal;

pub use reporters::{ReportFormat, ReportWriter};
pub use terminal::{TerminalReporter, Verbosity};
