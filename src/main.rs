//! vault-bootstrap - bring a raft secrets cluster from nothing to unsealed and verified

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Args, Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vault_bootstrap::bootstrap::{observe_phase, BootstrapReport, ClusterBootstrapper};
use vault_bootstrap::config::{
    BootstrapConfig, DEFAULT_CHART, DEFAULT_KEY_SHARES, DEFAULT_KEY_THRESHOLD, DEFAULT_MIN_SCORE,
    DEFAULT_NAMESPACE, DEFAULT_RELEASE, DEFAULT_REPLICAS,
};
use vault_bootstrap::context::BootstrapContext;
use vault_bootstrap::score::DeploymentScorer;

/// Bootstraps a TLS-secured, raft-backed secrets cluster on Kubernetes
#[derive(Parser, Debug)]
#[command(name = "vault-bootstrap", version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    cluster: ClusterArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run every phase, resuming from whatever the cluster already satisfies
    Bootstrap,

    /// Print the furthest phase the cluster currently satisfies (read-only)
    Status,

    /// Score the deployment without changing anything
    Verify,
}

/// Target cluster and bootstrap parameters
#[derive(Args, Debug)]
struct ClusterArgs {
    /// Namespace holding the cluster
    #[arg(long, global = true, env = "BOOTSTRAP_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    namespace: String,

    /// Helm release name
    #[arg(long, global = true, env = "BOOTSTRAP_RELEASE", default_value = DEFAULT_RELEASE)]
    release: String,

    /// Chart reference
    #[arg(long, global = true, env = "BOOTSTRAP_CHART", default_value = DEFAULT_CHART)]
    chart: String,

    /// Chart version pin
    #[arg(long, global = true, env = "BOOTSTRAP_CHART_VERSION")]
    chart_version: Option<String>,

    /// Number of nodes
    #[arg(long, global = true, env = "BOOTSTRAP_REPLICAS", default_value_t = DEFAULT_REPLICAS)]
    replicas: u32,

    /// Unseal key shares generated at init
    #[arg(long, global = true, env = "BOOTSTRAP_KEY_SHARES", default_value_t = DEFAULT_KEY_SHARES)]
    key_shares: u8,

    /// Shares required to unseal
    #[arg(long, global = true, env = "BOOTSTRAP_KEY_THRESHOLD", default_value_t = DEFAULT_KEY_THRESHOLD)]
    key_threshold: u8,

    /// Secret receiving the TLS key pair (default: <release>-server-tls)
    #[arg(long, global = true, env = "BOOTSTRAP_TLS_SECRET")]
    tls_secret: Option<String>,

    /// cert-manager issuer name (default: <release>-selfsigned)
    #[arg(long, global = true, env = "BOOTSTRAP_ISSUER")]
    issuer: Option<String>,

    /// Issuer kind: Issuer or ClusterIssuer
    #[arg(long, global = true, env = "BOOTSTRAP_ISSUER_KIND", default_value = "Issuer")]
    issuer_kind: String,

    /// Create the issuer as a self-signed namespaced Issuer if missing
    #[arg(
        long,
        global = true,
        env = "BOOTSTRAP_SELF_SIGNED_ISSUER",
        default_value_t = true,
        action = ArgAction::Set
    )]
    self_signed_issuer: bool,

    /// Externally routable hostname(s), comma separated
    #[arg(long = "external-host", global = true, env = "BOOTSTRAP_EXTERNAL_HOSTS", value_delimiter = ',')]
    external_hosts: Vec<String>,

    /// Kubernetes cluster DNS domain
    #[arg(long, global = true, env = "BOOTSTRAP_CLUSTER_DOMAIN", default_value = "cluster.local")]
    cluster_domain: String,

    /// File the unseal keys and root token are written to (mode 0600)
    #[arg(long, global = true, env = "BOOTSTRAP_CREDENTIALS_FILE", default_value = "vault-init.json")]
    credentials_file: PathBuf,

    /// YAML file of extra chart values merged over the generated ones
    #[arg(long, global = true, env = "BOOTSTRAP_VALUES_FILE")]
    values_file: Option<PathBuf>,

    /// Minimum score for a zero exit code
    #[arg(long, global = true, env = "BOOTSTRAP_MIN_SCORE", default_value_t = DEFAULT_MIN_SCORE)]
    min_score: u32,
}

impl ClusterArgs {
    async fn into_config(self) -> anyhow::Result<BootstrapConfig> {
        let mut config = BootstrapConfig::new(self.namespace);
        config.release = self.release;
        config.tls_secret = self
            .tls_secret
            .unwrap_or_else(|| format!("{}-server-tls", config.release));
        config.issuer.name = self
            .issuer
            .unwrap_or_else(|| format!("{}-selfsigned", config.release));
        config.issuer.kind = self.issuer_kind;
        config.issuer.self_signed = self.self_signed_issuer;
        config.chart = self.chart;
        config.chart_version = self.chart_version;
        config.replicas = self.replicas;
        config.key_shares = self.key_shares;
        config.key_threshold = self.key_threshold;
        config.external_hosts = self
            .external_hosts
            .into_iter()
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .collect();
        config.cluster_domain = self.cluster_domain;
        config.credentials_file = self.credentials_file;
        config.min_score = self.min_score;

        if let Some(path) = self.values_file {
            let raw = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to read values file {:?}: {}", path, e))?;
            let values: serde_json::Value = serde_yaml::from_str(&raw)
                .map_err(|e| anyhow::anyhow!("Failed to parse values file {:?}: {}", path, e))?;
            config.extra_values = Some(values);
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = cli.cluster.into_config().await?;
    let min_score = config.min_score;
    let ctx = BootstrapContext::connect(config).await?;

    match cli.command {
        Commands::Bootstrap => run_bootstrap(ctx, min_score).await,
        Commands::Status => run_status(ctx).await,
        Commands::Verify => run_verify(ctx, min_score).await,
    }
}

async fn run_bootstrap(ctx: BootstrapContext, min_score: u32) -> anyhow::Result<ExitCode> {
    println!("=== Bootstrapping {} in namespace {} ===", ctx.config.release, ctx.config.namespace);
    let credentials_file = ctx.config.credentials_file.clone();

    match ClusterBootstrapper::new(ctx).run().await {
        Ok(report) => {
            print_report(&report, &credentials_file);
            if report.succeeded(min_score) {
                Ok(ExitCode::SUCCESS)
            } else {
                println!(
                    "\nScore {} is below the minimum of {}",
                    report.score.total, min_score
                );
                Ok(ExitCode::FAILURE)
            }
        }
        Err(failure) => {
            eprintln!("\nBootstrap failed: {}", failure);
            eprintln!("Re-run to resume from {}.", failure.reached);
            Ok(ExitCode::FAILURE)
        }
    }
}

fn print_report(report: &BootstrapReport, credentials_file: &std::path::Path) {
    println!("\n=== Bootstrap complete: {} ===", report.phase);
    if report.initialized_now {
        println!(
            "Unseal keys and root token written to {:?}. Move them somewhere safe.",
            credentials_file
        );
    }
    for node in &report.nodes {
        println!(
            "  {:<12} {:?} {}",
            node.id,
            node.role,
            if node.sealed { "sealed" } else { "unsealed" }
        );
    }
    if !report.node_failures.is_empty() {
        println!("\nNode failures:");
        for (node, error) in &report.node_failures {
            println!("  {}: {}", node, error);
        }
    }
    if !report.quorate {
        println!("\nCluster is running with partial quorum.");
    }
    println!("\nScore:\n{}", report.score);
}

async fn run_status(ctx: BootstrapContext) -> anyhow::Result<ExitCode> {
    let phase = observe_phase(&ctx).await?;
    println!("{}", phase);
    Ok(ExitCode::SUCCESS)
}

async fn run_verify(ctx: BootstrapContext, min_score: u32) -> anyhow::Result<ExitCode> {
    let coordinator = ctx.coordinator();
    let card = DeploymentScorer::new(&ctx, &coordinator).score().await;
    println!("Score:\n{}", card);
    Ok(if card.meets(min_score) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
