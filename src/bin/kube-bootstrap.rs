use anyhow::{Context, Result};
use clap::{ArgGroup, Args, Parser, Subcommand, ValueEnum};
use log::{error, info};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use kube_bootstrap::config::{create_sample_config, load_config, ClusterConfig};
use kube_bootstrap::error::{exit_code_for, ScalingError};
use kube_bootstrap::executor::{RemoteExecutor, SshExecutor};
use kube_bootstrap::inventory::{self, Inventory, InventoryFormat};
use kube_bootstrap::orchestrator::Bootstrapper;
use kube_bootstrap::roles::{Role, RoleLedger, Topology};
use kube_bootstrap::scaling::{RemoveOptions, ScalingOperator};

#[derive(Parser)]
#[command(name = "kube-bootstrap")]
#[command(about = "Bootstrap and scale kubeadm clusters over SSH", version)]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Show debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Bring up a new cluster from an inventory
    Bootstrap {
        #[command(flatten)]
        inventory: InventoryArgs,

        /// Print the phase plan without connecting to any host
        #[arg(long)]
        dry_run: bool,

        /// Write the run report as JSON
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Prepare inventory hosts and join them to a running cluster
    #[command(group(ArgGroup::new("target").required(true).args(["hostname", "ip", "all_new"])))]
    AddNode {
        #[command(flatten)]
        inventory: InventoryArgs,

        /// Control-plane host the cluster is administered through
        entry: String,

        #[arg(long)]
        hostname: Option<String>,

        #[arg(long)]
        ip: Option<String>,

        /// Add every inventory host the cluster does not list yet
        #[arg(long)]
        all_new: bool,

        #[arg(long, value_enum, default_value_t = NodeType::Worker)]
        node_type: NodeType,
    },

    /// Drain and remove a node, or inspect membership
    #[command(group(ArgGroup::new("action").required(true).args(["node", "list", "status"])))]
    RemoveNode {
        #[command(flatten)]
        inventory: InventoryArgs,

        /// Control-plane host the cluster is administered through
        entry: String,

        /// Node to remove
        #[arg(long)]
        node: Option<String>,

        /// List cluster nodes
        #[arg(long)]
        list: bool,

        /// Describe one node
        #[arg(long, value_name = "NODE")]
        status: Option<String>,

        /// Keep going when the drain fails
        #[arg(long)]
        force: bool,

        /// Leave kubeadm state on the removed host
        #[arg(long)]
        no_reset: bool,

        /// Allow the control plane to shrink below quorum
        #[arg(long)]
        allow_quorum_loss: bool,
    },

    /// Validate an inventory and print it with roles attached
    Inventory {
        #[command(flatten)]
        inventory: InventoryArgs,

        #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
        output: OutputFormat,
    },

    /// Write the default configuration as TOML
    SampleConfig { path: PathBuf },
}

#[derive(Args)]
struct InventoryArgs {
    /// Inventory file (YAML, INI or CSV)
    inventory: PathBuf,

    /// Inventory format, detected from the extension when omitted
    #[arg(long)]
    format: Option<InventoryFormat>,

    /// Role ledger, defaults to <inventory>.roles.json
    #[arg(long)]
    state: Option<PathBuf>,
}

impl InventoryArgs {
    fn ledger_path(&self) -> PathBuf {
        self.state
            .clone()
            .unwrap_or_else(|| RoleLedger::default_path(&self.inventory))
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum NodeType {
    ControlPlane,
    Worker,
    Hybrid,
}

impl From<NodeType> for Role {
    fn from(node_type: NodeType) -> Self {
        match node_type {
            NodeType::ControlPlane => Role::ControlPlane,
            NodeType::Worker => Role::Worker,
            NodeType::Hybrid => Role::Hybrid,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Json,
    Yaml,
    Ini,
    Csv,
}

/// Inventory, ledger and the topology resolved from them.
struct Resolved {
    inventory: Inventory,
    ledger: RoleLedger,
    ledger_path: PathBuf,
    topology: Topology,
}

fn resolve(args: &InventoryArgs, config: &ClusterConfig) -> Result<Resolved> {
    let inventory = inventory::load(&args.inventory, args.format)
        .with_context(|| format!("Failed to load inventory {}", args.inventory.display()))?;
    let ledger_path = args.ledger_path();
    let mut ledger = RoleLedger::load(&ledger_path)?;
    let topology = ledger.resolve(&inventory, config.control_plane_size)?;
    Ok(Resolved {
        inventory,
        ledger,
        ledger_path,
        topology,
    })
}

fn executor(config: &ClusterConfig) -> Arc<dyn RemoteExecutor> {
    Arc::new(SshExecutor::new(config.ssh.clone()))
}

async fn bootstrap(
    config: ClusterConfig,
    args: &InventoryArgs,
    dry_run: bool,
    report_path: Option<&Path>,
) -> Result<u8> {
    let resolved = resolve(args, &config)?;
    let executor = executor(&config);
    let bootstrapper = Bootstrapper::new(config, resolved.topology, executor)?;

    if dry_run {
        for phase in bootstrapper.plan() {
            println!("{phase}");
        }
        return Ok(0);
    }

    resolved.ledger.save(&resolved.ledger_path)?;
    info!(
        "Bootstrapping {} host(s), roles recorded in {}",
        resolved.inventory.len(),
        resolved.ledger_path.display()
    );

    let report = bootstrapper.run().await;
    println!("{}", report.summary());
    if let Some(path) = report_path {
        report
            .write_json(path)
            .with_context(|| format!("Failed to write run report to {}", path.display()))?;
        info!("Run report written to {}", path.display());
    }
    Ok(report.exit_code() as u8)
}

async fn add_node(
    config: ClusterConfig,
    args: &InventoryArgs,
    entry: &str,
    target: &str,
    role: Role,
) -> Result<u8> {
    let mut resolved = resolve(args, &config)?;
    let host = resolved
        .inventory
        .find(target)
        .cloned()
        .ok_or_else(|| ScalingError::UnknownHost(target.to_string()))?;

    let operator = ScalingOperator::new(config.clone(), executor(&config));
    let member = operator
        .add_node(&resolved.topology, entry, &host, role)
        .await?;

    resolved.ledger.record(member.hostname(), member.role);
    resolved.ledger.save(&resolved.ledger_path)?;
    println!("{} joined as {}", member.hostname(), member.role);
    Ok(0)
}

async fn add_all_new(
    config: ClusterConfig,
    args: &InventoryArgs,
    entry: &str,
    role: Role,
) -> Result<u8> {
    let mut resolved = resolve(args, &config)?;
    let operator = ScalingOperator::new(config.clone(), executor(&config));
    let report = operator.add_nodes(&resolved.topology, entry, role).await?;

    for member in &report.added {
        resolved.ledger.record(member.hostname(), member.role);
    }
    if !report.added.is_empty() {
        resolved.ledger.save(&resolved.ledger_path)?;
    }
    println!(
        "added {} host(s), {} failed",
        report.added.len(),
        report.failed.len()
    );
    for (hostname, err) in &report.failed {
        println!("  {hostname}: {err}");
    }
    Ok(if report.is_complete() { 0 } else { 1 })
}

enum RemoveAction {
    Remove(String, RemoveOptions),
    List,
    Status(String),
}

async fn remove_node(
    config: ClusterConfig,
    args: &InventoryArgs,
    entry: &str,
    action: RemoveAction,
) -> Result<u8> {
    let mut resolved = resolve(args, &config)?;
    let operator = ScalingOperator::new(config.clone(), executor(&config));

    match action {
        RemoveAction::List => {
            for node in operator.list_nodes(&resolved.topology, entry).await? {
                println!(
                    "{:<24} {:<10} {:<22} {}",
                    node.name, node.status, node.roles, node.version
                );
            }
        }
        RemoveAction::Status(node) => {
            let status = operator
                .node_status(&resolved.topology, entry, &node)
                .await?;
            println!("{}", status.description);
        }
        RemoveAction::Remove(node, options) => {
            let report = operator
                .remove_node(&resolved.topology, entry, &node, options)
                .await?;
            resolved.ledger.forget(&report.hostname);
            resolved.ledger.save(&resolved.ledger_path)?;
            println!(
                "{} ({}) removed with {} warning(s)",
                report.hostname,
                report.role,
                report.warnings.len()
            );
        }
    }
    Ok(0)
}

fn show_inventory(config: &ClusterConfig, args: &InventoryArgs, output: OutputFormat) -> Result<u8> {
    let resolved = resolve(args, config)?;
    let rendered = match output {
        OutputFormat::Json => serde_json::to_string_pretty(&resolved.topology)?,
        OutputFormat::Yaml => resolved.inventory.render(InventoryFormat::Yaml)?,
        OutputFormat::Ini => resolved.inventory.render(InventoryFormat::Ini)?,
        OutputFormat::Csv => resolved.inventory.render(InventoryFormat::Csv)?,
    };
    print!("{rendered}");
    if !rendered.ends_with('\n') {
        println!();
    }
    Ok(0)
}

async fn run(cli: Cli) -> Result<u8> {
    let config = || load_config(cli.config.as_deref());

    match cli.command {
        Command::SampleConfig { path } => {
            create_sample_config(&path)?;
            Ok(0)
        }
        Command::Bootstrap {
            inventory,
            dry_run,
            report,
        } => bootstrap(config()?, &inventory, dry_run, report.as_deref()).await,
        Command::AddNode {
            inventory,
            entry,
            hostname,
            ip,
            all_new,
            node_type,
        } => {
            if all_new {
                return add_all_new(config()?, &inventory, &entry, node_type.into()).await;
            }
            let target = hostname.or(ip).unwrap_or_default();
            add_node(config()?, &inventory, &entry, &target, node_type.into()).await
        }
        Command::RemoveNode {
            inventory,
            entry,
            node,
            list: _,
            status,
            force,
            no_reset,
            allow_quorum_loss,
        } => {
            // clap guarantees exactly one of --node, --list, --status.
            let action = match (node, status) {
                (Some(node), _) => RemoveAction::Remove(
                    node,
                    RemoveOptions {
                        force,
                        reset: !no_reset,
                        allow_quorum_loss,
                    },
                ),
                (None, Some(status)) => RemoveAction::Status(status),
                (None, None) => RemoveAction::List,
            };
            remove_node(config()?, &inventory, &entry, action).await
        }
        Command::Inventory { inventory, output } => {
            show_inventory(&config()?, &inventory, output)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            error!("{err:#}");
            ExitCode::from(exit_code_for(&err))
        }
    }
}
