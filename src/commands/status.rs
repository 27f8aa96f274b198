use anyhow::Result;
use chrono::{DateTime, Utc};
use colored::Colorize;
use convergence::{ConvergenceState, FileStateStore, LockInfo, PassLock, StateStore};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::Context;
use crate::paths;
use crate::ui;

/// Persisted progress of this node
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub state_dir: PathBuf,
    /// Holder of the pass lock, if a pass is running
    pub running: Option<LockInfo>,
    pub in_progress: Option<ConvergenceState>,
    pub last_completed: Option<ConvergenceState>,
}

pub fn run(ctx: &Context, json: bool) -> Result<()> {
    let state_dir = paths::state_dir(ctx.state_dir.as_deref())?;
    let report = collect(&state_dir)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    ui::header("hpcnode status");
    ui::kv("State dir", &report.state_dir.display().to_string());

    if let Some(lock) = &report.running {
        ui::kv(
            "Running",
            &format!("pid {} since {}", lock.pid, timestamp(lock.acquired_at))
                .yellow()
                .to_string(),
        );
    }

    ui::section("Current run");
    match &report.in_progress {
        Some(state) => show_state(state),
        None => ui::dim("No run in progress"),
    }

    ui::section("Last completed run");
    match &report.last_completed {
        Some(state) => show_state(state),
        None => ui::dim("Never completed"),
    }

    println!();
    Ok(())
}

pub fn collect(state_dir: &Path) -> Result<StatusReport> {
    let store = FileStateStore::new(state_dir);
    Ok(StatusReport {
        state_dir: state_dir.to_path_buf(),
        running: PassLock::holder(&paths::lock_file(state_dir)),
        in_progress: store.load()?,
        last_completed: store.load_completed()?,
    })
}

fn show_state(state: &ConvergenceState) {
    ui::kv("Role", state.role.as_deref().unwrap_or("-"));
    ui::kv(
        "Last step",
        state.last_completed_step.as_deref().unwrap_or("-"),
    );
    if state.pending_reboot {
        ui::kv("Reboot", &"pending".yellow().to_string());
    }
    if let Some(step) = &state.deferred_reboot {
        ui::kv("Deferred reboot", &format!("requested by {step}"));
    }
    ui::kv("Reboots", &state.reboots.to_string());
    if let Some(at) = state.started_at {
        ui::kv("Started", &timestamp(at));
    }
    if let Some(at) = state.completed_at.or(state.updated_at) {
        ui::kv("Updated", &timestamp(at));
    }
    for (step, reason) in &state.failures {
        ui::kv(
            &format!("Ignored failure ({step})"),
            &reason.yellow().to_string(),
        );
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    format!(
        "{} ({} ago)",
        at.format("%Y-%m-%d %H:%M:%S UTC"),
        age(Utc::now().signed_duration_since(at))
    )
}

fn age(elapsed: chrono::TimeDelta) -> String {
    let secs = elapsed.num_seconds().max(0);
    match secs {
        0..60 => format!("{secs}s"),
        60..3600 => format!("{}m", secs / 60),
        3600..86_400 => format!("{}h {}m", secs / 3600, secs % 3600 / 60),
        _ => format!("{}d", secs / 86_400),
    }
}
