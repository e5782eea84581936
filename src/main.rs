// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use convoy::builder::{DesiredState, DesiredStateBuilder};
use convoy::config::Config;
use convoy::declarations::load_resources;
use convoy::diff::{self, Plan};
use convoy::kubernetes::KubeconfigConnector;
use convoy::registry::{DigestResolver, HttpRegistryClient};
use convoy::store::{SqlStateStore, StateStore};
use convoy::sync::{ApplyExecutor, ImportFlow, RefreshFlow};
use convoy::types::{KeyFilter, ObjectKey};

/// Reconciles declared resources onto a fleet of Kubernetes clusters
#[derive(Parser)]
#[command(name = "convoy", version)]
struct Cli {
    /// Answer yes to every confirmation
    #[arg(short, long, global = true)]
    yes: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show what a push would change
    Diff(FilterArgs),
    /// Apply the declared resources after confirmation
    Push(FilterArgs),
    /// Read live cluster state back into the store
    Refresh(FilterArgs),
    /// Record an object already on a cluster without touching it
    Import(KeyArgs),
    /// Drop one record from the store without touching the cluster
    Forget(KeyArgs),
}

/// Identifies exactly one object
#[derive(Args, Clone, Debug)]
struct KeyArgs {
    #[arg(long)]
    cluster: String,
    #[arg(long)]
    api_version: String,
    #[arg(long)]
    kind: String,
    #[arg(long)]
    namespace: Option<String>,
    #[arg(long)]
    name: String,
}

impl From<KeyArgs> for ObjectKey {
    fn from(args: KeyArgs) -> Self {
        ObjectKey::new(
            args.cluster,
            args.api_version,
            args.kind,
            args.namespace.as_deref(),
            args.name,
        )
    }
}

/// Restrict the command to matching object keys
#[derive(Args, Clone, Debug, Default)]
struct FilterArgs {
    #[arg(long)]
    api_version: Option<String>,
    #[arg(long)]
    cluster: Option<String>,
    #[arg(long)]
    kind: Option<String>,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    namespace: Option<String>,
}

impl From<FilterArgs> for KeyFilter {
    fn from(args: FilterArgs) -> Self {
        KeyFilter {
            api_version: args.api_version,
            cluster: args.cluster,
            kind: args.kind,
            name: args.name,
            namespace: args.namespace,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    let store = Arc::new(
        SqlStateStore::connect(&config.database_url, config.operation_timeout)
            .await
            .context("Failed to open the state store")?,
    );
    info!("State store opened at {}", config.database_url);

    match cli.command {
        Command::Diff(filter) => {
            let (desired, plan) = build_plan(&config, &*store, &filter.into()).await?;
            print!("{}", plan);
            report_failures(&desired)
        }
        Command::Push(filter) => push(&config, store, &filter.into(), cli.yes).await,
        Command::Refresh(filter) => refresh(&config, store, &filter.into(), cli.yes).await,
        Command::Import(key) => import(&config, store, &key.into(), cli.yes).await,
        Command::Forget(key) => forget(&config, &*store, &key.into(), cli.yes).await,
    }
}

async fn build_plan(
    config: &Config,
    store: &dyn StateStore,
    filter: &KeyFilter,
) -> Result<(DesiredState, Plan)> {
    let root = config.monitor_directory()?;
    let resources = load_resources(root)?;
    info!("Loaded {} resources from {}", resources.len(), root.display());

    let registry = HttpRegistryClient::new(
        config.insecure_registries.clone(),
        config.registry_credentials.clone(),
    );
    let resolver = DigestResolver::new(
        Arc::new(registry),
        config.operation_timeout,
        config.registry_retry_attempts,
    );
    let desired = DesiredStateBuilder::new(
        resolver,
        Arc::new(KubeconfigConnector),
        config.operation_timeout,
        &config.label_namespace,
    )
    .build(&resources)
    .await?;
    let plan = diff::plan(&desired, store, filter).await?;
    Ok((desired, plan))
}

async fn push(
    config: &Config,
    store: Arc<SqlStateStore>,
    filter: &KeyFilter,
    yes: bool,
) -> Result<()> {
    let (desired, plan) = build_plan(config, &*store, filter).await?;
    print!("{}", plan);
    if plan.is_empty() {
        return report_failures(&desired);
    }
    if !yes && !confirm("Apply these changes?")? {
        info!("Push cancelled");
        return report_failures(&desired);
    }

    let executor = ApplyExecutor::new(
        Arc::new(KubeconfigConnector),
        store,
        config.apply_concurrency,
        config.operation_timeout,
    );
    let report = executor.apply(plan.confirm(&config.actor)).await?;
    println!("{} applied, {} failed", report.applied.len(), report.failed.len());
    for (key, err) in &report.failed {
        error!("{}: {}", key, err);
    }

    report_failures(&desired)?;
    anyhow::ensure!(report.is_success(), "{} objects failed to apply", report.failed.len());
    Ok(())
}

async fn refresh(
    config: &Config,
    store: Arc<SqlStateStore>,
    filter: &KeyFilter,
    yes: bool,
) -> Result<()> {
    let flow = RefreshFlow::new(
        Arc::new(KubeconfigConnector),
        store,
        config.apply_concurrency,
        config.operation_timeout,
        &config.label_namespace,
    );
    let report = flow.scan(filter).await?;
    for (cluster, err) in &report.unreachable {
        warn!("Cluster {} was not refreshed: {}", cluster, err);
    }
    for (key, err) in &report.failed {
        error!("{}: {}", key, err);
    }

    print!("{}", report.changes);
    if !report.changes.is_empty() {
        if !yes && !confirm("Write these changes to the store?")? {
            info!("Refresh cancelled");
            return Ok(());
        }
        flow.commit(&report, &config.actor).await?;
    }

    anyhow::ensure!(
        report.unreachable.is_empty() && report.failed.is_empty(),
        "{} clusters unreachable, {} objects failed",
        report.unreachable.len(),
        report.failed.len()
    );
    Ok(())
}

async fn import(
    config: &Config,
    store: Arc<SqlStateStore>,
    key: &ObjectKey,
    yes: bool,
) -> Result<()> {
    let flow = ImportFlow::new(
        Arc::new(KubeconfigConnector),
        store,
        config.operation_timeout,
        &config.label_namespace,
    );
    let preview = flow.preview(key).await?;

    println!("{} [{}]", preview.key, preview.owner);
    print!("{}", serde_yaml::to_string(&preview.body.display_value())?);
    if !yes && !confirm("Import this object? The cluster is not changed.")? {
        info!("Import cancelled");
        return Ok(());
    }

    flow.commit(&preview, &config.actor).await?;
    Ok(())
}

async fn forget(config: &Config, store: &dyn StateStore, key: &ObjectKey, yes: bool) -> Result<()> {
    let record = store
        .get(key)
        .await?
        .with_context(|| format!("No record for {}", key))?;

    println!("{} [{}]", record.key, record.owner);
    print!("{}", serde_yaml::to_string(&record.body.display_value())?);
    if !yes && !confirm("Forget this record? The object stays on its cluster.")? {
        info!("Forget cancelled");
        return Ok(());
    }

    store.remove(key, &config.actor).await?;
    info!("Forgot {}", key);
    Ok(())
}

/// Resources that failed to build are left untouched; report them after the fact
fn report_failures(desired: &DesiredState) -> Result<()> {
    for (owner, err) in &desired.failures {
        error!("{}: {}", owner, err);
    }
    anyhow::ensure!(
        desired.failures.is_empty(),
        "{} resources failed to build",
        desired.failures.len()
    );
    Ok(())
}

fn confirm(question: &str) -> Result<bool> {
    print!("{} [y/N] ", question);
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}
