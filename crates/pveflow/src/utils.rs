use anyhow::Context;
use colored::Colorize;
use pveflow_config::Settings;
use pveflow_core::{DesiredInstance, Normalizer, RawInstance};
use pveflow_pve::{PveClient, PveConfig};
use pveflow_reconcile::{Operation, Plan, ReconcileError, Reconciler};
use std::path::Path;

/// Reads and normalizes an instance definition.
pub fn load_instance(path: &Path, settings: &Settings) -> anyhow::Result<DesiredInstance> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let raw: RawInstance = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    let desired = Normalizer::new(settings.defaults.clone())
        .normalize(&raw)
        .with_context(|| format!("Invalid instance definition in {}", path.display()))?;
    Ok(desired)
}

pub fn client(settings: &Settings) -> anyhow::Result<PveClient> {
    let config = PveConfig::new(settings.api.endpoint()?, settings.api.api_token()?)
        .with_insecure(settings.api.insecure);
    Ok(PveClient::new(config)?)
}

pub fn reconciler(settings: &Settings) -> anyhow::Result<Reconciler<PveClient>> {
    Ok(Reconciler::new(client(settings)?)
        .with_timeouts(settings.timeouts())
        .with_poll_interval(settings.poll_interval()))
}

/// One line per intent; secrets are masked.
pub fn print_plan(plan: &Plan) {
    for intent in &plan.intents {
        let line = match &intent.op {
            Operation::FieldUpdate { field, param, .. } if param == "cipassword" => {
                format!("update {} ({}=****) [{}]", field, param, intent.reason)
            }
            _ => intent.to_string(),
        };
        let (marker, line) = match &intent.op {
            Operation::FieldUpdate { .. } => ("~".yellow(), line.normal()),
            Operation::DeviceDelete { .. } => ("-".red(), line.normal()),
            Operation::DiskMove { .. } | Operation::DiskResize { .. } => {
                ("»".cyan(), line.cyan())
            }
            _ => ("⟳".magenta(), line.magenta()),
        };
        println!("  {} {}", marker, line);
    }
    println!();
    println!("{}", plan.summary().to_string().bold());
    if plan.reboot_required {
        println!("{}", "A restart is required for some changes.".yellow());
    }
}

pub fn print_errors(errors: &[ReconcileError]) {
    eprintln!();
    eprintln!("{}", "✗ Errors".red().bold());
    for error in errors {
        eprintln!("  - {}", error);
    }
}
