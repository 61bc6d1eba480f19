use crate::utils;
use colored::Colorize;
use pveflow_config::Settings;
use pveflow_reconcile::PassOutcome;
use std::path::Path;

pub async fn handle(settings: &Settings, file: &Path) -> anyhow::Result<()> {
    let desired = utils::load_instance(file, settings)?;
    let reconciler = utils::reconciler(settings)?;

    println!("{}", "Applying...".blue());
    let report = reconciler.apply(&desired).await?;

    println!(
        "{} {}",
        report.identity.to_string().cyan(),
        report.outcome.to_string().bold()
    );
    if report.plan.has_changes {
        println!();
        utils::print_plan(&report.plan);
    }

    for skipped in &report.apply.skipped {
        println!(
            "  {} {} ({})",
            "skipped".yellow(),
            skipped.intent,
            skipped.message
        );
    }
    if report.outcome != PassOutcome::Deleted && !report.converged && report.is_success() {
        println!(
            "{}",
            "Remote state still differs after apply; run again to converge.".yellow()
        );
    }

    if !report.is_success() {
        utils::print_errors(&report.errors);
        std::process::exit(1);
    }
    println!(
        "{} ({} ms)",
        "✓ Done".green().bold(),
        report.apply.duration_ms
    );
    Ok(())
}
