use crate::utils;
use colored::Colorize;
use pveflow_config::Settings;
use std::path::Path;

pub async fn handle(settings: &Settings, file: &Path, clone_provenance: bool) -> anyhow::Result<()> {
    let desired = utils::load_instance(file, settings)?;
    let reconciler = utils::reconciler(settings)?;

    let Some(vm_id) = desired.vm_id else {
        println!(
            "{}",
            "No vm_id given: a new instance would be created.".yellow()
        );
        return Ok(());
    };
    let identity = desired.identity(vm_id);
    println!("Planning {}", identity.to_string().cyan());

    let clone_provenance = clone_provenance || desired.is_clone();
    let Some((observed, outcome)) = reconciler
        .plan(&desired, &identity, clone_provenance)
        .await?
    else {
        println!(
            "{}",
            format!("{} does not exist: it would be created.", identity).yellow()
        );
        return Ok(());
    };

    println!(
        "Status: {}",
        observed.status.status.to_string().cyan()
    );
    if outcome.plan.has_changes {
        println!();
        utils::print_plan(&outcome.plan);
    } else {
        println!("{}", "✓ No changes".green().bold());
    }

    if !outcome.is_clean() {
        utils::print_errors(&outcome.errors);
        std::process::exit(1);
    }
    Ok(())
}
