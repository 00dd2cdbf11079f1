use clap::ValueEnum;
use owo_colors::OwoColorize;
use serde_json::json;
use watchtally_core::{JobStatus, SyncStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Human,
    Json,
    #[value(name = "json-pretty")]
    JsonPretty,
}

pub struct Output {
    format: OutputFormat,
    quiet: bool,
}

impl Output {
    pub fn new(format: OutputFormat, quiet: bool) -> Self {
        Self { format, quiet }
    }

    pub fn success(&self, msg: impl AsRef<str>) {
        if self.quiet {
            return;
        }
        match self.format {
            OutputFormat::Human => println!("{} {}", "✓".green(), msg.as_ref()),
            OutputFormat::Json | OutputFormat::JsonPretty => {
                self.print_json(&json!({ "type": "success", "message": msg.as_ref() }));
            }
        }
    }

    pub fn error(&self, msg: impl AsRef<str>) {
        // Errors are shown even in quiet mode.
        match self.format {
            OutputFormat::Human => eprintln!("{} {}", "✗".red(), msg.as_ref()),
            OutputFormat::Json | OutputFormat::JsonPretty => {
                self.print_json(&json!({ "type": "error", "message": msg.as_ref() }));
            }
        }
    }

    pub fn info(&self, msg: impl AsRef<str>) {
        if self.quiet {
            return;
        }
        match self.format {
            OutputFormat::Human => println!("{}", msg.as_ref()),
            OutputFormat::Json | OutputFormat::JsonPretty => {
                self.print_json(&json!({ "type": "info", "message": msg.as_ref() }));
            }
        }
    }

    pub fn stats(&self, stats: &SyncStats) {
        if self.quiet {
            return;
        }
        match self.format {
            OutputFormat::Human => {
                if stats.status == JobStatus::Skipped {
                    println!("{} {} skipped", "·".dimmed(), stats.job);
                    return;
                }
                println!(
                    "{} {} finished in {:.1}s",
                    "✓".green(),
                    stats.job.bold(),
                    stats.duration_ms as f64 / 1000.0
                );
                println!(
                    "  fetched {}, inserted {}, duplicates {}, parse errors {}",
                    stats.events_fetched,
                    stats.events_inserted,
                    stats.duplicates_skipped,
                    stats.parse_errors
                );
                if stats.job == watchtally_core::JobKind::Reconcile {
                    println!(
                        "  deleted {}, days rewritten {}",
                        stats.events_deleted, stats.days_rewritten_raw
                    );
                }
            }
            OutputFormat::Json | OutputFormat::JsonPretty => {
                match serde_json::to_value(stats) {
                    Ok(value) => self.print_json(&json!({ "type": "stats", "stats": value })),
                    Err(e) => self.error(format!("could not serialize stats: {e}")),
                }
            }
        }
    }

    fn print_json(&self, value: &serde_json::Value) {
        let rendered = match self.format {
            OutputFormat::JsonPretty => serde_json::to_string_pretty(value),
            _ => serde_json::to_string(value),
        };
        if let Ok(rendered) = rendered {
            println!("{rendered}");
        }
    }
}
