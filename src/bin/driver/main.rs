//! CloudStack CSI driver binary.
//!
//! Serves the CSI Identity, Controller and Node services over a UNIX
//! domain socket, in the mode selected on the command line.

use anyhow::Context;
use clap::Arg;
use cloudstack_csi_driver::{
    cloud::{CloudConfig, CloudConnector, CloudStackApiClient},
    Mode, DEFAULT_CSI_ENDPOINT,
};
use std::{sync::Arc, time::Duration};
use tracing::info;

mod server;

const DEFAULT_CLOUDSTACK_CONFIG: &str = "./cloud-config";
const DEFAULT_OPERATION_TIMEOUT: &str = "5m";
const DEFAULT_VOLUME_ATTACH_LIMIT: i64 = 256;

/// Accept `unix://` endpoints, eg `unix://tmp/csi.sock` or
/// `unix:///var/tmp/csi.sock`, yielding the socket path.
fn parse_unix_endpoint(endpoint: &str) -> anyhow::Result<String> {
    let url = url::Url::parse(endpoint).with_context(|| format!("invalid endpoint {endpoint}"))?;
    anyhow::ensure!(
        url.scheme() == "unix",
        "only unix:// endpoints are supported, got {endpoint}"
    );
    let path = format!("{}{}", url.host_str().unwrap_or_default(), url.path());
    anyhow::ensure!(!path.is_empty(), "endpoint {endpoint} has no socket path");
    Ok(path)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = clap::Command::new("cloudstack-csi-driver")
        .about("CSI plugin for Apache CloudStack")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::new("mode")
                .value_parser(["controller", "node", "all"])
                .default_value("all")
                .help("Which CSI services to serve"),
        )
        .arg(
            Arg::new("endpoint")
                .long("endpoint")
                .env("CSI_ENDPOINT")
                .default_value(DEFAULT_CSI_ENDPOINT)
                .help("Endpoint for the CSI driver server"),
        )
        .arg(
            Arg::new("cloudstack-config")
                .long("cloudstack-config")
                .default_value(DEFAULT_CLOUDSTACK_CONFIG)
                .help("Path to CloudStack configuration file"),
        )
        .arg(
            Arg::new("node-name")
                .long("node-name")
                .env("NODE_NAME")
                .default_value("")
                .help("Node name used to look up the instance ID in case metadata lookup fails"),
        )
        .arg(
            Arg::new("volume-attach-limit")
                .long("volume-attach-limit")
                .value_parser(clap::value_parser!(i64))
                .default_value(clap::builder::Str::from(DEFAULT_VOLUME_ATTACH_LIMIT.to_string()))
                .help("Value for the maximum number of volumes attachable per node"),
        )
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .default_value(DEFAULT_OPERATION_TIMEOUT)
                .help("Timeout for a single cloud operation"),
        )
        .get_matches();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mode: Mode = matches
        .get_one::<String>("mode")
        .expect("has a default")
        .parse()
        .map_err(|error: String| anyhow::anyhow!(error))?;

    let volume_attach_limit = *matches
        .get_one::<i64>("volume-attach-limit")
        .expect("has a default");
    if mode != Mode::Controller && !(1..=256).contains(&volume_attach_limit) {
        anyhow::bail!("invalid --volume-attach-limit specified, allowed range is 1 to 256");
    }

    let node_name = matches
        .get_one::<String>("node-name")
        .cloned()
        .unwrap_or_default();

    let timeout: Duration = matches
        .get_one::<String>("timeout")
        .expect("has a default")
        .parse::<humantime::Duration>()
        .context("invalid --timeout")?
        .into();

    let config_path = matches
        .get_one::<String>("cloudstack-config")
        .expect("has a default");
    let config = CloudConfig::read(config_path)
        .map_err(|error| anyhow::anyhow!("failed to read CloudStack configuration: {error}"))?;

    let connector: Arc<dyn CloudConnector> = Arc::new(
        CloudStackApiClient::new(&config, timeout)
            .map_err(|error| anyhow::anyhow!("failed to build CloudStack API client: {error}"))?,
    );

    let endpoint = matches
        .get_one::<String>("endpoint")
        .expect("has a default");
    let csi_socket = parse_unix_endpoint(endpoint)?;

    info!(
        mode = ?mode,
        endpoint = %endpoint,
        api_url = %config.api_url,
        "starting CloudStack CSI driver"
    );

    server::CsiServer::run(
        &csi_socket,
        mode,
        connector,
        node_name,
        volume_attach_limit,
        timeout,
    )
    .await
}
