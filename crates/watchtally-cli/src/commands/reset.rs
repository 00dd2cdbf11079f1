use std::path::PathBuf;

use dialoguer::{theme::ColorfulTheme, Confirm};

use crate::commands::setup;
use crate::output::Output;

/// Deletes the local state database. The next run starts from scratch: full
/// backfill, fresh cursor, and a re-seeded refresh token from the config.
pub fn run_reset(
    config: Option<PathBuf>,
    yes: bool,
    output: &Output,
) -> color_eyre::Result<()> {
    let ctx = setup::load(config, false)?;
    let db_path = ctx.paths.state_db_file();

    if !db_path.exists() {
        output.info("no sync state to clear");
        return Ok(());
    }

    if !yes {
        let confirmed = Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(format!(
                "Delete {} and all sync progress (including stored authorization)?",
                db_path.display()
            ))
            .default(false)
            .interact()?;
        if !confirmed {
            output.info("aborted");
            return Ok(());
        }
    }

    // Remove the sqlite sidecar files along with the database itself.
    for suffix in ["", "-wal", "-shm"] {
        let mut path = db_path.clone().into_os_string();
        path.push(suffix);
        let path = PathBuf::from(path);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
    }

    output.success("sync state cleared");
    Ok(())
}
