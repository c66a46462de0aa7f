use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use brood_apply::{ApplyConfig, KubeApplier};
use brood_core::prelude::*;
use brood_kubehub::{ApiResolver, KubeDeleter, KubeLister, ParentEvent};
use brood_patch::{GenerationAnnotation, NamespaceDefaulter, OverrideMerger, OwnerLabels, Patcher, PatcherChain, UniqueIdentities};
use brood_reconcile::{parse_kinds, ObservedLister, Plan, ReconcileOutcome, Reconciler, ReconcilerConfig};
use brood_render::{generate_checked, EmbeddedGenerator};
use clap::{Parser, Subcommand, ValueEnum};
use metrics::counter;
use serde_json::json;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "broodctl", version, about = "Brood: keep the children of parent resources in sync")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace of the parent (default: all namespaces for `run`)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Parent spec field holding the embedded child manifests
    #[arg(long = "field", global = true, default_value = "resources")]
    field: String,

    /// Extra child kinds checked for orphans, e.g. "v1/ConfigMap,apps/v1/Deployment"
    #[arg(long = "child-kinds", global = true, env = "BROOD_CHILD_KINDS")]
    child_kinds: Option<String>,

    /// Cluster-scoped kinds beyond the built-in ones, e.g. "example.dev/v1/Tenant"
    #[arg(long = "cluster-scoped-kinds", global = true, env = "BROOD_CLUSTER_SCOPED_KINDS")]
    cluster_scoped_kinds: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Render a parent file's children offline and print them
    Render {
        /// Parent manifest (YAML or JSON)
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
    },
    /// Show desired children and orphans for a live parent without changing anything
    Plan {
        /// Parent GVK key, e.g. "example.dev/v1/Widget"
        #[arg(long = "parent")]
        parent: String,
        name: String,
    },
    /// Run one reconcile cycle for a live parent
    Reconcile {
        /// Parent GVK key, e.g. "example.dev/v1/Widget"
        #[arg(long = "parent")]
        parent: String,
        name: String,
    },
    /// Watch parents of a kind and reconcile them until interrupted
    Run {
        /// Parent GVK key, e.g. "example.dev/v1/Widget"
        #[arg(long = "parent")]
        parent: String,
        /// Re-run every known parent this often; retries partial deletions
        #[arg(long = "resync-secs", env = "BROOD_RESYNC_SECS", default_value_t = 60)]
        resync_secs: u64,
    },
}

fn init_tracing() {
    let env = std::env::var("BROOD_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("BROOD_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid BROOD_METRICS_ADDR; expected host:port");
        }
    }
}

/// Default chain, minus owner references when the parent has no uid (a local
/// file that was never applied).
fn offline_chain(parent: &ParentResource, scopes: &ScopeTable) -> PatcherChain {
    if parent.uid.is_some() {
        return brood_patch::default_chain_with(scopes.clone());
    }
    info!(parent = %parent.key, "parent has no uid; rendering without owner references");
    PatcherChain::new()
        .with(NamespaceDefaulter::new(scopes.clone()))
        .with(OverrideMerger::default())
        .with(OwnerLabels)
        .with(GenerationAnnotation)
        .with(UniqueIdentities)
}

fn render_document(doc: &str, field: &str, scopes: &ScopeTable) -> Result<Vec<ChildResource>> {
    let val: serde_yaml::Value = serde_yaml::from_str(doc).context("parsing parent YAML")?;
    let json = serde_json::to_value(val).context("converting YAML to JSON")?;
    let parent = ParentResource::from_object(&json)?;
    let generator = EmbeddedGenerator::new().with_field(field).with_scopes(scopes.clone());
    let children = generate_checked(&generator, &parent)?;
    Ok(offline_chain(&parent, scopes).patch(&parent, children)?)
}

/// Environment config with command-line kind lists on top.
fn reconciler_config(cli: &Cli) -> ReconcilerConfig {
    let mut config = ReconcilerConfig::from_env();
    if let Some(list) = cli.child_kinds.as_deref() {
        config.child_kinds = parse_kinds(list);
    }
    if let Some(list) = cli.cluster_scoped_kinds.as_deref() {
        config.cluster_scoped = parse_kinds(list);
    }
    config
}

fn yaml_documents(children: &[ChildResource]) -> Result<String> {
    let mut out = String::new();
    for c in children {
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(&c.manifest())?);
    }
    Ok(out)
}

struct Cluster {
    resolver: Arc<ApiResolver>,
    reconciler: Reconciler,
}

async fn connect(cli: &Cli) -> Result<Cluster> {
    let client = brood_kubehub::get_kube_client().await?;
    let resolver = Arc::new(ApiResolver::new(client));
    let config = reconciler_config(cli);
    let scopes = config.scopes();
    let reconciler = Reconciler::new(
        EmbeddedGenerator::new().with_field(cli.field.as_str()).with_scopes(scopes.clone()),
        KubeApplier::new(Arc::clone(&resolver), ApplyConfig::from_env()),
        KubeLister::new(Arc::clone(&resolver)),
        KubeDeleter::new(Arc::clone(&resolver)),
    )
    .with_pipeline(brood_patch::default_chain_with(scopes))
    .with_config(config);
    Ok(Cluster { resolver, reconciler })
}

fn outcome_json(o: &ReconcileOutcome) -> serde_json::Value {
    json!({
        "parent": o.parent,
        "generation": o.generation,
        "applied": o.applied,
        "pruned": o.pruned,
        "deleted": o.deleted,
        "pendingDeletions": o.pending_deletions,
        "failures": o.failures,
    })
}

fn print_outcome(output: Output, o: &ReconcileOutcome) -> Result<()> {
    match output {
        Output::Human => {
            for id in &o.applied.created { println!("+ {}", id); }
            for id in &o.applied.updated { println!("~ {}", id); }
            for id in &o.applied.unchanged { println!("= {}", id); }
            for id in &o.deleted { println!("- {}", id); }
            for f in &o.failures { println!("! {} ({})", f.identity, f.reason); }
            if !o.pruned { println!("(cleanup disabled)"); }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&outcome_json(o))?),
    }
    Ok(())
}

/// Sequential per process, so a parent's cycles never overlap.
async fn run_once(reconciler: &Reconciler, parent: &ParentResource) {
    match reconciler.reconcile(parent).await {
        Ok(o) if !o.is_complete() => warn!(parent = %parent.key, pending = o.pending_deletions.len(), "orphans left for the next resync"),
        Ok(_) => {}
        Err(e) => error!(parent = %parent.key, error = %e, retryable = e.kind().is_retryable(), "reconcile failed"),
    }
}

/// Children the garbage collector cannot reach (cluster-scoped, other
/// namespaces) are deleted from the parent's last known copy.
async fn release_once(reconciler: &Reconciler, parent: &ParentResource) {
    match reconciler.release(parent).await {
        Ok(o) if !o.is_complete() => warn!(parent = %parent.key, pending = o.pending_deletions.len(), "children of deleted parent left behind"),
        Ok(_) => {}
        Err(e) => error!(parent = %parent.key, error = %e, "releasing children failed"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Render { file } => {
            let doc = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
            let children = render_document(&doc, &cli.field, &reconciler_config(&cli).scopes())?;
            match cli.output {
                Output::Human => print!("{}", yaml_documents(&children)?),
                Output::Json => {
                    let manifests: Vec<_> = children.iter().map(|c| c.manifest()).collect();
                    println!("{}", serde_json::to_string_pretty(&manifests)?);
                }
            }
        }
        Commands::Plan { parent, name } => {
            let kind = ResourceKind::parse(parent)?;
            let cluster = connect(&cli).await?;
            let p = brood_kubehub::fetch_parent(&cluster.resolver, &kind, cli.namespace.as_deref(), name).await?;
            let desired = cluster.reconciler.desired(&p)?;
            let kinds = cluster.reconciler.watched_kinds(&desired);
            let observed = KubeLister::new(Arc::clone(&cluster.resolver)).observed(&p, &kinds).await?;
            let plan = Plan::from_desired(desired, &observed);
            match cli.output {
                Output::Human => {
                    for c in &plan.desired { println!("  {}", c.identity()); }
                    for c in &plan.deletions { println!("- {}", c.identity()); }
                }
                Output::Json => {
                    let desired: Vec<_> = plan.desired.iter().map(|c| c.identity()).collect();
                    let deletions: Vec<_> = plan.deletions.iter().map(|c| c.identity()).collect();
                    println!("{}", serde_json::to_string_pretty(&json!({ "desired": desired, "deletions": deletions }))?);
                }
            }
        }
        Commands::Reconcile { parent, name } => {
            let kind = ResourceKind::parse(parent)?;
            let cluster = connect(&cli).await?;
            let p = brood_kubehub::fetch_parent(&cluster.resolver, &kind, cli.namespace.as_deref(), name).await?;
            let outcome = cluster.reconciler.reconcile(&p).await?;
            print_outcome(cli.output, &outcome)?;
        }
        Commands::Run { parent, resync_secs } => {
            let kind = ResourceKind::parse(parent)?;
            let cluster = connect(&cli).await?;
            let (tx, mut rx) = mpsc::channel::<ParentEvent>(256);
            let watcher_handle = tokio::spawn({
                let resolver = Arc::clone(&cluster.resolver);
                let kind = kind.clone();
                let ns = cli.namespace.clone();
                async move {
                    if let Err(e) = brood_kubehub::watch_parents(&resolver, &kind, ns.as_deref(), tx).await {
                        error!(error = ?e, "parent watcher failed");
                    }
                }
            });

            let mut known: HashMap<ObjectKey, ParentResource> = HashMap::new();
            let mut resync = tokio::time::interval(Duration::from_secs((*resync_secs).max(1)));
            resync.tick().await;
            loop {
                tokio::select! {
                    maybe = rx.recv() => {
                        let Some(ev) = maybe else {
                            warn!("parent watch closed; exiting run loop");
                            break;
                        };
                        counter!("parent_events_total", 1u64);
                        match ev {
                            ParentEvent::Applied(p) => {
                                run_once(&cluster.reconciler, &p).await;
                                known.insert(p.key.clone(), p);
                            }
                            ParentEvent::Deleted(key) => match known.remove(&key) {
                                Some(last) => release_once(&cluster.reconciler, &last).await,
                                None => info!(parent = %key, "unknown parent deleted; nothing to release"),
                            },
                            ParentEvent::Restarted(list) => {
                                let mut gone = std::mem::take(&mut known);
                                for p in list {
                                    gone.remove(&p.key);
                                    run_once(&cluster.reconciler, &p).await;
                                    known.insert(p.key.clone(), p);
                                }
                                // Deleted while the watch was down.
                                for last in gone.values() {
                                    release_once(&cluster.reconciler, last).await;
                                }
                            }
                        }
                    }
                    _ = resync.tick() => {
                        info!(parents = known.len(), "resync");
                        for p in known.values() {
                            run_once(&cluster.reconciler, p).await;
                        }
                    }
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; shutting down run loop");
                        break;
                    }
                }
            }
            watcher_handle.abort();
        }
    }
    Ok(())
}
