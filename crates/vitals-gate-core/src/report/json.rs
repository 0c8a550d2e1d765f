//! JSON reporter for run summaries

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use crate::runner::RunSummary;

/// JSON format reporter
pub struct JsonReporter;

impl JsonReporter {
    /// Format a run summary as JSON
    ///
    /// # Arguments
    ///
    /// * `summary` - The run summary to format
    /// * `pretty` - Whether to pretty-print the JSON
    pub fn format(summary: &RunSummary, pretty: bool) -> Result<String> {
        let output = if pretty {
            serde_json::to_string_pretty(summary)?
        } else {
            serde_json::to_string(summary)?
        };
        Ok(output)
    }

    /// Write the summary to `path`, creating parent directories as needed
    pub fn write_to_file(summary: &RunSummary, path: &Path, pretty: bool) -> Result<()> {
        let output = Self::format(summary, pretty)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::write(path, output).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }
}
