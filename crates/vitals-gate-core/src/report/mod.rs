//! Report generation for run summaries
//!
//! The JSON reporter is what the runner writes to `output.path`; the console
//! reporter renders the same summary for a terminal.

mod console;
mod json;

pub use console::ConsoleReporter;
pub use json::JsonReporter;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Where and how the final summary is written
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// JSON summary file; nothing is written when unset
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Pretty-print the JSON
    #[serde(default)]
    pub pretty: bool,
}
