use crate::utils;
use colored::Colorize;
use pveflow_config::Settings;
use pveflow_core::{InstanceIdentity, InstanceKind};
use pveflow_reconcile::read_observed;

pub async fn handle(settings: &Settings, node: &str, id: u32, container: bool) -> anyhow::Result<()> {
    let kind = if container {
        InstanceKind::Container
    } else {
        InstanceKind::Vm
    };
    let identity = InstanceIdentity::new(node, id).with_kind(kind);
    let client = utils::client(settings)?;

    let observed = read_observed(&client, &identity).await?;
    println!(
        "{} {}",
        identity.to_string().cyan(),
        observed.status.status.to_string().bold()
    );
    if let Some(lock) = &observed.status.lock {
        println!("locked: {}", lock.yellow());
    }
    println!();
    print!("{}", serde_yaml::to_string(&observed.config)?);
    Ok(())
}
