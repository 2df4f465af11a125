//! Beacon operator - serves the Pod injection admission webhook

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client, CustomResourceExt};
use tracing::{info, warn};

use beacon_common::crd::WorkloadConfig;
use beacon_common::events::KubeEventPublisher;
use beacon_common::kube_utils::cluster_uid;
use beacon_common::telemetry::{init_tracing, LogFormat};
use beacon_common::WEBHOOK_COMPONENT;
use beacon_webhook::owner::DEFAULT_MAX_OWNER_DEPTH;
use beacon_webhook::{
    webhook_router, KubeClusterReader, KubeSecretEnsurer, MutatorSettings, PodMutator,
    VolumeProvider, WebhookState,
};

/// Beacon - injects monitoring agents and data-ingest enrichment into Pods
#[derive(Parser, Debug)]
#[command(name = "beacon-operator", version, about, long_about = None)]
struct Cli {
    /// Generate the WorkloadConfig CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Address the webhook listens on
    #[arg(long, env = "BEACON_LISTEN_ADDR", default_value = "0.0.0.0:8443")]
    listen_addr: SocketAddr,

    /// PEM certificate served by the webhook
    #[arg(long, env = "BEACON_TLS_CERT", default_value = "/tmp/webhook/certs/tls.crt")]
    tls_cert: PathBuf,

    /// PEM private key of the certificate
    #[arg(long, env = "BEACON_TLS_KEY", default_value = "/tmp/webhook/certs/tls.key")]
    tls_key: PathBuf,

    /// Namespace the operator runs in; token secrets are read from here
    #[arg(long, env = "POD_NAMESPACE", default_value = "beacon")]
    namespace: String,

    /// Name of the operator's own Pod
    #[arg(long, env = "POD_NAME")]
    pod_name: Option<String>,

    /// Default install init container image, instead of the operator's own
    #[arg(long, env = "BEACON_IMAGE")]
    image: Option<String>,

    /// Name of the CSI driver publishing agent binaries
    #[arg(long, env = "BEACON_CSI_DRIVER_NAME", default_value = beacon_common::DEFAULT_CSI_DRIVER_NAME)]
    csi_driver_name: String,

    /// Deadline of one admission call in seconds
    #[arg(long, default_value_t = 10)]
    admission_timeout_secs: u64,

    /// Owner objects fetched before owner resolution gives up
    #[arg(long, default_value_t = DEFAULT_MAX_OWNER_DEPTH)]
    max_owner_depth: usize,

    /// Log output format: text or json
    #[arg(long, env = "BEACON_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&WorkloadConfig::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_tracing(cli.log_format)?;
    run_webhook(cli).await
}

async fn run_webhook(cli: Cli) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let image = match cli.image.clone() {
        Some(image) => image,
        None => own_image(&client, &cli).await?,
    };
    let cluster_id = cluster_uid(&client)
        .await
        .context("Failed to read cluster id")?;
    info!(image = %image, cluster_id = %cluster_id, "Resolved webhook identity");

    let mut settings = MutatorSettings::new(image, cluster_id);
    settings.max_owner_depth = cli.max_owner_depth;

    let events = KubeEventPublisher::new(client.clone(), WEBHOOK_COMPONENT, cli.pod_name.clone());
    let mutator = PodMutator::new(
        Arc::new(KubeClusterReader::new(client.clone())),
        Arc::new(KubeSecretEnsurer::new(client.clone(), cli.namespace.clone())),
        Arc::new(events),
        VolumeProvider::new(cli.csi_driver_name.clone()),
        settings,
    );
    let state = Arc::new(WebhookState {
        mutator,
        timeout: Duration::from_secs(cli.admission_timeout_secs),
    });

    let tls_config = RustlsConfig::from_pem_file(&cli.tls_cert, &cli.tls_key)
        .await
        .with_context(|| format!("Failed to load TLS material from {}", cli.tls_cert.display()))?;

    info!(addr = %cli.listen_addr, "Starting injection webhook");
    axum_server::bind_rustls(cli.listen_addr, tls_config)
        .serve(webhook_router(state).into_make_service())
        .await
        .context("Webhook server failed")?;
    Ok(())
}

/// Image of the first container of the operator's own Pod
async fn own_image(client: &Client, cli: &Cli) -> anyhow::Result<String> {
    let Some(pod_name) = cli.pod_name.as_deref() else {
        anyhow::bail!("--image or --pod-name is required to determine the install image");
    };
    let pods: Api<Pod> = Api::namespaced(client.clone(), &cli.namespace);
    let pod = pods
        .get(pod_name)
        .await
        .with_context(|| format!("Failed to read own pod {}/{}", cli.namespace, pod_name))?;
    let image = pod
        .spec
        .and_then(|spec| spec.containers.into_iter().next())
        .and_then(|container| container.image);
    match image {
        Some(image) => Ok(image),
        None => {
            warn!(pod = %pod_name, "Own pod has no container image");
            anyhow::bail!("own pod {pod_name} has no container image")
        }
    }
}
