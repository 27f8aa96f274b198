//! Dry-run report of a pass

use anyhow::Result;
use colored::Colorize;
use convergence::{Driver, NoProgress, PassOutcome, PassSummary, StepReport, SystemClock};

use super::converge::Session;
use crate::Context;
use crate::role::Role;
use crate::ui;

pub fn run(ctx: &Context, role: Option<Role>) -> Result<()> {
    let session = Session::open(ctx, role)?;
    let store = session.store();
    let reboot = session.reboot()?;

    let outcome = Driver::new(
        &session.pipeline,
        &session.env,
        &store,
        &reboot,
        &SystemClock,
        session.options(true, false),
    )
    .run(&mut NoProgress)?;

    let PassOutcome::Completed(summary) = outcome else {
        // Dry runs neither lock nor reboot
        return Ok(());
    };

    ui::header(&format!(
        "Plan for {} on {}",
        session.env.role, session.env.hostname
    ));
    println!();
    for line in render(&summary) {
        println!("{line}");
    }
    println!();

    match summary.would_apply() {
        0 => ui::success("Node is converged; no step would run"),
        n => ui::info(&format!("{n} of {} step(s) would run", summary.steps.len())),
    }
    if summary.would_apply() > 0 && !ctx.quiet {
        ui::dim("Run 'hpcnode converge' to apply.");
    }
    Ok(())
}

/// One line per step: marker, id and why it would or would not run
fn render(summary: &PassSummary) -> Vec<String> {
    let width = summary
        .steps
        .iter()
        .map(|s| s.id.len())
        .max()
        .unwrap_or(0);

    summary
        .steps
        .iter()
        .map(|record| {
            let id = format!("{:width$}", record.id);
            match &record.report {
                StepReport::WouldApply => {
                    format!("  {} {}  {}", "→".blue(), id.bold(), record.description)
                }
                StepReport::Skipped { reason } => format!(
                    "  {} {}  {}",
                    "·".dimmed(),
                    id.dimmed(),
                    reason.to_string().dimmed()
                ),
                other => format!("  {} {}  {other:?}", "?".yellow(), id),
            }
        })
        .collect()
}
