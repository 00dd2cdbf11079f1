use std::io::IsTerminal;

use indicatif::{ProgressBar, ProgressStyle};
use watchtally_core::{JobKind, SyncObserver, SyncStats};

/// Renders one progress bar per job when attached to a terminal; silent
/// otherwise (the structured logs carry the same information).
pub struct ProgressObserver {
    bar: Option<ProgressBar>,
    interactive: bool,
}

impl ProgressObserver {
    pub fn new() -> Self {
        Self {
            bar: None,
            interactive: std::io::stderr().is_terminal(),
        }
    }
}

impl SyncObserver for ProgressObserver {
    fn job_started(&mut self, job: JobKind) {
        if !self.interactive {
            return;
        }
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
        );
        bar.enable_steady_tick(std::time::Duration::from_millis(120));
        bar.set_message(format!("{job}: fetching history..."));
        self.bar = Some(bar);
    }

    fn page_loaded(&mut self, job: JobKind, page: u32, page_count: Option<u32>, item_count: Option<u64>) {
        if let Some(bar) = &self.bar {
            let pages = page_count
                .map(|count| format!("{page}/{count}"))
                .unwrap_or_else(|| page.to_string());
            let items = item_count
                .map(|count| format!(" ({count} events)"))
                .unwrap_or_default();
            bar.set_message(format!("{job}: page {pages}{items}"));
        }
    }

    fn job_finished(&mut self, _stats: &SyncStats) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}
