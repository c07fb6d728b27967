//! Post-run processing: optional exports of the finished session summary.

use crate::cli::Cli;
use crate::model::RunSummary;
use crate::storage;

/// Result of post-run processing, ready for presentation layers.
pub(crate) struct ProcessedRun {
    pub summary: RunSummary,
    pub export_messages: Vec<String>,
}

/// Apply the requested exports to a completed session.
pub(crate) fn process_run_completion(args: &Cli, summary: &RunSummary) -> ProcessedRun {
    let mut export_messages = vec![format!("Saved: {}", summary.output_dir.display())];
    if let Some(export_path) = args.export_json.as_deref() {
        match storage::export_json(export_path, summary) {
            Ok(_) => export_messages.push(format!("Exported JSON: {}", export_path.display())),
            Err(e) => export_messages.push(format!("Export JSON failed: {e:#}")),
        }
    }

    ProcessedRun {
        summary: summary.clone(),
        export_messages,
    }
}
