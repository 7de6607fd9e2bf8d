//! xen-backup - command line entry point.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dialoguer::{Password, Select};
use std::path::PathBuf;
use std::sync::Arc;
use xen_backup::executor::{delete_backup_set, BackupReport, Executor};
use xen_backup::inventory::{self, EndpointChoice};
use xen_backup::registry::BackupSetRegistry;
use xen_backup::transfer::progress::{format_bytes, format_duration};
use xen_backup::xapi::{JsonRpcSession, XenApi};
use xen_backup::{utils, Config};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List VMs in the pool
    Vms,
    /// List storage repositories that can hold disks
    Srs,
    /// List networks
    Networks,
    /// List registered backup sets
    Sets,
    /// Snapshot a VM and export every disk in full
    Backup {
        vm_uuid: String,
        #[command(flatten)]
        endpoint: EndpointArgs,
    },
    /// Export the changes since the VM's latest full backup
    BackupDiff {
        vm_uuid: String,
        #[command(flatten)]
        endpoint: EndpointArgs,
    },
    /// Restore a backup set into a new VM
    Restore {
        set_id: String,
        sr_uuid: String,
        /// Data-plane URL for imports (defaults to the pool master)
        #[arg(long, value_name = "URL")]
        endpoint: Option<String>,
    },
    /// Delete a backup set, or every set with "all"
    Rm { set_id: String },
}

#[derive(clap::Args, Debug)]
struct EndpointArgs {
    /// Host address to export from
    #[arg(long, value_name = "ADDR", conflicts_with = "endpoint_index")]
    endpoint: Option<String>,

    /// Position of the export address in the host's address list
    #[arg(long, value_name = "N")]
    endpoint_index: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    config.apply_env_overrides();
    config.validate()?;

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    std::fs::create_dir_all(&config.storage.dir)
        .with_context(|| format!("Failed to create {}", config.storage.dir.display()))?;

    // Registry-only commands need no session
    match &args.command {
        Command::Sets => return print_sets(&config),
        Command::Rm { set_id } => return remove_sets(&config, set_id),
        _ => {}
    }

    if config.xenserver.password.is_empty() {
        config.xenserver.password = Password::new()
            .with_prompt(format!(
                "Password for {}@{}",
                config.xenserver.username, config.xenserver.host
            ))
            .interact()?;
    }

    let session = JsonRpcSession::login(
        &config.xenserver.host,
        &config.xenserver.username,
        &config.xenserver.password,
        config.xenserver.insecure_tls,
    )
    .await?;
    let api: Arc<dyn XenApi> = Arc::new(session);
    let executor = Executor::from_config(api.clone(), &config)?;

    let result = run(&executor, &config, args.command).await;

    if let Err(e) = api.logout().await {
        tracing::warn!("Logout failed: {}", e);
    }

    result
}

async fn run(executor: &Executor, config: &Config, command: Command) -> Result<()> {
    match command {
        Command::Vms => {
            println!("{:<36}  {:<10}  NAME", "UUID", "POWER");
            for vm in inventory::list_vms(executor.api()).await? {
                println!("{:<36}  {:<10}  {}", vm.uuid, vm.power_state, vm.name_label);
            }
        }
        Command::Srs => {
            println!("{:<36}  {:<8}  {:>10}  {:>10}  NAME", "UUID", "TYPE", "SIZE", "USED");
            for sr in inventory::list_srs(executor.api()).await? {
                println!(
                    "{:<36}  {:<8}  {:>10}  {:>10}  {}",
                    sr.uuid,
                    sr.sr_type,
                    format_bytes(sr.physical_size.max(0) as u64),
                    format_bytes(sr.physical_utilisation.max(0) as u64),
                    sr.name_label
                );
            }
        }
        Command::Networks => {
            println!("{:<36}  {:<12}  {:>5}  NAME", "UUID", "BRIDGE", "MTU");
            for network in inventory::list_networks(executor.api()).await? {
                println!(
                    "{:<36}  {:<12}  {:>5}  {}",
                    network.uuid, network.bridge, network.mtu, network.name_label
                );
            }
        }
        Command::Backup { vm_uuid, endpoint } => {
            let choice = endpoint_choice(executor, config, &vm_uuid, &endpoint).await?;
            let report = executor.backup_full(&vm_uuid, &choice).await?;
            print_backup(&report);
        }
        Command::BackupDiff { vm_uuid, endpoint } => {
            let choice = endpoint_choice(executor, config, &vm_uuid, &endpoint).await?;
            let report = executor.backup_diff(&vm_uuid, &choice).await?;
            print_backup(&report);
        }
        Command::Restore {
            set_id,
            sr_uuid,
            endpoint,
        } => {
            let report = executor
                .restore_vm(&set_id, &sr_uuid, endpoint.as_deref())
                .await?;
            println!("Restored {} as {} ({})", set_id, report.name, report.vm_uuid);
            for device in &report.skipped_vifs {
                println!("  interface {} not restored: network is gone", device);
            }
        }
        Command::Sets => print_sets(config)?,
        Command::Rm { set_id } => remove_sets(config, &set_id)?,
    }
    Ok(())
}

/// Command line flags first, then the configured endpoint, then the host's
/// only address or an interactive pick among several.
async fn endpoint_choice(
    executor: &Executor,
    config: &Config,
    vm_uuid: &str,
    args: &EndpointArgs,
) -> Result<EndpointChoice> {
    if let Some(address) = &args.endpoint {
        return Ok(EndpointChoice::Address(address.clone()));
    }
    if let Some(index) = args.endpoint_index {
        return Ok(EndpointChoice::Index(index));
    }
    if let Some(address) = &config.transfer.endpoint {
        return Ok(EndpointChoice::Address(address.clone()));
    }

    let addresses = executor.endpoints_for(vm_uuid).await?;
    if addresses.len() <= 1 {
        return Ok(EndpointChoice::Only);
    }
    let index = Select::new()
        .with_prompt("Export endpoint")
        .items(addresses.as_slice())
        .default(0)
        .interact()?;
    Ok(EndpointChoice::Index(index))
}

fn print_sets(config: &Config) -> Result<()> {
    let registry = BackupSetRegistry::open(config.registry_path())?;
    println!("{:<52}  {:<4}  {:<14}  VM", "SET", "TYPE", "DATE");
    for set in registry.sets() {
        println!("{:<52}  {:<4}  {:<14}  {}", set.set_id, set.kind, set.date, set.vm_uuid);
    }
    Ok(())
}

fn remove_sets(config: &Config, set_id: &str) -> Result<()> {
    let mut registry = BackupSetRegistry::open(config.registry_path())?;
    let report = delete_backup_set(&config.storage.dir, &mut registry, set_id)?;
    println!("Deleted {} set(s)", report.removed.len());
    for diff in &report.orphaned_diffs {
        println!("  {} has lost its full set", diff);
    }
    Ok(())
}

fn print_backup(report: &BackupReport) {
    println!("Backup set {} ({})", report.set.set_id, report.set.kind);
    for disk in &report.disks {
        println!(
            "  slot {:<3} {:<36}  {:>10}  {}",
            disk.userdevice,
            disk.vdi_uuid,
            format_bytes(disk.outcome.bytes),
            format_duration(disk.outcome.elapsed)
        );
    }
    for effect in &report.leftovers {
        println!("  left behind: {}", effect);
    }
}
