//! kubectl-link: reach cluster pods and services by their cluster addresses.
//!
//! Connections redirected to the local stack are mapped back to a running
//! pod through the cluster DNS, then carried over a deduplicated pod
//! port-forward session.

mod config;
mod original_dst;
mod stack;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use config::{LinkConfig, Overrides, DEFAULT_CONFIG_PATH};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use kubelink_core::discovery::DNS_PORT;
use kubelink_core::{
    find_dns_instance, wait_ready, DnsProxy, DnsResolver, Engine, EngineConfig, Establisher,
    ForwardRegistry, InstanceLocator, LinkResult, TunnelDialer, Zone,
};
use kubelink_kube::{KubeInventory, PodPortForwarder};
use stack::RedirectStackBuilder;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// kubectl-link: route local traffic to cluster addresses
#[derive(Parser, Debug)]
#[command(
    name = "kubectl-link",
    version,
    about = "Reach cluster pods and services by their cluster addresses"
)]
struct Cli {
    /// Network device as driver://name, e.g. redirect://127.0.0.1:15001
    #[arg(short, long)]
    device: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// DNS pod to forward to instead of discovering one by label
    #[arg(long)]
    dns_pod: Option<String>,

    /// Namespace of the cluster DNS pods
    #[arg(long)]
    dns_namespace: Option<String>,

    /// Cluster DNS zone used until one is discovered
    #[arg(long)]
    dns_cluster_zone: Option<String>,

    /// Local port for the forwarded cluster DNS endpoint
    #[arg(long)]
    dns_local_port: Option<u16>,

    /// Serve a local UDP DNS proxy in front of the cluster DNS
    #[arg(long)]
    dns_proxy: bool,

    /// Config file path
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Path to the kubeconfig file
    #[arg(long)]
    kubeconfig: Option<String>,

    /// Kubeconfig context to use
    #[arg(long)]
    context: Option<String>,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            device: self.device.clone(),
            log_level: self.log_level.clone(),
            dns_pod: self.dns_pod.clone(),
            dns_namespace: self.dns_namespace.clone(),
            dns_zone: self.dns_cluster_zone.clone(),
            dns_local_port: self.dns_local_port,
            dns_proxy: self.dns_proxy,
            kubeconfig: self.kubeconfig.clone(),
            context: self.context.clone(),
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config_path = PathBuf::from(&cli.config);
    let config = match LinkConfig::load(Some(&config_path), cli.overrides()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("kubectl-link: failed to load config: {e:#}");
            std::process::exit(1);
        }
    };

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        device = %config.device,
        "starting kubectl-link"
    );
    match &config.source {
        Some(path) => info!(path = %path.display(), "loaded config file"),
        None => info!(path = %config_path.display(), "config file not found, using defaults"),
    }

    if let Err(e) = run(config).await {
        error!(error = %format!("{e:#}"), "kubectl-link failed");
        std::process::exit(1);
    }

    info!("kubectl-link stopped");
}

async fn run(config: LinkConfig) -> Result<()> {
    let client = kube_client(&config)
        .await
        .context("failed to connect to the cluster")?;
    let inventory = Arc::new(KubeInventory::new(client.clone()));
    let forwarder = Arc::new(PodPortForwarder::new(client));

    // Forward the cluster DNS to a fixed local port.
    let dns_pod = find_dns_instance(
        inventory.as_ref(),
        &config.dns.namespace,
        config.dns.pod.as_deref(),
    )
    .await
    .context("failed to find a cluster dns pod")?;
    let dns_ip = dns_pod
        .ip
        .with_context(|| format!("dns pod {dns_pod} has no address"))?;
    info!(pod = %dns_pod, ip = %dns_ip, "using cluster dns");

    let mut dns_session = tokio::spawn({
        let forwarder = forwarder.clone();
        let dns_pod = dns_pod.clone();
        let local_port = config.dns.local_port;
        async move { forwarder.establish(dns_pod, local_port, DNS_PORT).await }
    });
    let dns_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, config.dns.local_port));
    wait_ready(dns_addr, config.forward.readiness)
        .await
        .context("dns port-forward did not come up")?;

    let resolver = Arc::new(DnsResolver::new(dns_addr));
    let discovered = resolver
        .discover_zone(dns_ip)
        .await
        .context("failed to discover the cluster zone")?;
    // A markerless answer yields the default zone; a configured zone wins then.
    let zone = if discovered == Zone::default() {
        config.dns.zone.clone()
    } else {
        discovered
    };
    info!(zone = %zone, "cluster zone");

    let registry = Arc::new(ForwardRegistry::new(
        InstanceLocator::new(resolver, inventory),
        forwarder,
        zone,
        config.forward.ports.clone(),
        config.forward.readiness,
    ));
    let dialer = Arc::new(TunnelDialer::new(registry.clone()));
    let engine = Engine::new(dialer, Arc::new(RedirectStackBuilder::new()));
    let proxy = launch(
        &engine,
        EngineConfig {
            device: config.device.clone(),
            dial: config.dial,
            hooks: config.hooks.clone(),
        },
        config.dns.proxy.map(|listen| (listen, dns_addr)),
    )
    .await?;

    let proxy_task = proxy.map(|proxy| {
        tokio::spawn(async move {
            if let Err(e) = proxy.serve().await {
                error!(error = %e, "dns proxy stopped");
            }
        })
    });

    let gc_task = tokio::spawn({
        let registry = registry.clone();
        let interval = config.forward.gc_interval;
        let max_age = config.forward.max_session_age;
        async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                registry.gc(max_age).await;
                for s in registry.status().await {
                    debug!(
                        key = %s.key,
                        local = %s.local_addr,
                        instance = %s.instance,
                        alive = s.alive,
                        age_secs = s.age.as_secs(),
                        "forward"
                    );
                }
            }
        }
    });

    let outcome = supervise(&engine, &mut dns_session, shutdown_signal()).await;
    gc_task.abort();
    if let Some(task) = proxy_task {
        task.abort();
    }
    dns_session.abort();
    outcome
}

/// Bind the DNS proxy when `proxy` is given as `(listen, upstream)`, then
/// configure and start the engine. A busy listen address fails before any
/// hook has run.
async fn launch(
    engine: &Engine,
    config: EngineConfig,
    proxy: Option<(SocketAddr, SocketAddr)>,
) -> Result<Option<DnsProxy>> {
    let proxy = match proxy {
        Some((listen, upstream)) => Some(
            DnsProxy::bind(listen, upstream)
                .await
                .with_context(|| format!("failed to bind dns proxy on {listen}"))?,
        ),
        None => None,
    };
    engine.insert(config).await?;
    engine.start().await.context("failed to start engine")?;
    Ok(proxy)
}

/// Serve until `shutdown` resolves or the cluster DNS session ends, then
/// stop the engine. The engine is stopped on both paths.
async fn supervise<F>(
    engine: &Engine,
    dns_session: &mut JoinHandle<LinkResult<()>>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()>,
{
    let outcome = tokio::select! {
        _ = shutdown => {
            info!("received shutdown signal");
            Ok(())
        }
        ended = dns_session => {
            let err = match ended {
                Ok(Ok(())) => anyhow!("cluster dns port-forward closed"),
                Ok(Err(e)) => anyhow::Error::new(e).context("cluster dns port-forward failed"),
                Err(e) => anyhow!("cluster dns port-forward task failed: {e}"),
            };
            error!(error = %format!("{err:#}"), "stopping");
            Err(err)
        }
    };
    engine.stop().await?;
    outcome
}

async fn kube_client(config: &LinkConfig) -> Result<Client> {
    let options = KubeConfigOptions {
        context: config.context.clone(),
        ..Default::default()
    };
    let kube_config = match &config.kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("cannot read kubeconfig {}", path.display()))?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &options).await?
        }
        None if config.context.is_some() => kube::Config::from_kubeconfig(&options).await?,
        None => kube::Config::infer().await?,
    };
    Ok(Client::try_from(kube_config)?)
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
