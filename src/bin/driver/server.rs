//! gRPC server assembly: UNIX domain socket listener and mode-dependent
//! service registration.

use cloudstack_csi_driver::{
    cloud::CloudConnector,
    controller::ControllerService,
    csi::{
        controller_server::ControllerServer, identity_server::IdentityServer,
        node_server::NodeServer,
    },
    identity::IdentityService,
    node::NodeService,
    Mode,
};
use futures::TryFutureExt;
use std::{
    fs,
    io::ErrorKind,
    ops::Add,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::UnixListener,
};
use tonic::transport::{server::Connected, Server};
use tracing::{debug, error, info};

#[derive(Debug)]
struct UnixStream(tokio::net::UnixStream);

impl Connected for UnixStream {
    type ConnectInfo = UdsConnectInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        UdsConnectInfo {
            peer_addr: self.0.peer_addr().ok().map(Arc::new),
            peer_cred: self.0.peer_cred().ok(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct UdsConnectInfo {
    pub peer_addr: Option<Arc<tokio::net::unix::SocketAddr>>,
    pub peer_cred: Option<tokio::net::unix::UCred>,
}

impl AsyncRead for UnixStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl AsyncWrite for UnixStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_shutdown(cx)
    }
}

/// Resolve when the process is asked to stop.
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(error) => {
            error!(%error, "failed to listen for SIGTERM");
            return std::future::pending::<()>().await;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
    info!("shutdown signal received");
}

pub struct CsiServer {}

impl CsiServer {
    pub async fn run(
        csi_socket: &str,
        mode: Mode,
        connector: Arc<dyn CloudConnector>,
        node_name: String,
        volume_attach_limit: i64,
        io_timeout: Duration,
    ) -> anyhow::Result<()> {
        // Remove existing CSI socket from previous runs.
        match fs::remove_file(csi_socket) {
            Ok(_) => info!("Removed stale CSI socket {csi_socket}"),
            Err(err) => {
                if err.kind() != ErrorKind::NotFound {
                    anyhow::bail!("Error removing stale CSI socket {csi_socket}: {err}");
                }
            }
        }

        debug!("CSI RPC server is listening on {csi_socket}");

        let incoming = {
            let uds = UnixListener::bind(csi_socket)
                .map_err(|error| anyhow::anyhow!("Failed to bind CSI socket: {error}"))?;

            // Change permissions on CSI socket to allow non-privileged
            // clients to access it, to simplify testing.
            if let Err(e) = fs::set_permissions(
                csi_socket,
                std::os::unix::fs::PermissionsExt::from_mode(0o777),
            ) {
                error!("Failed to change permissions for CSI socket: {:?}", e);
            } else {
                debug!("Successfully changed file permissions for CSI socket");
            }

            async_stream::stream! {
                loop {
                    let item = uds.accept().map_ok(|(st, _)| UnixStream(st)).await;
                    yield item;
                }
            }
        };

        let controller = matches!(mode, Mode::Controller | Mode::All)
            .then(|| ControllerServer::new(ControllerService::new(connector.clone())));
        let node = matches!(mode, Mode::Node | Mode::All).then(|| {
            NodeServer::new(NodeService::new(
                connector.clone(),
                node_name,
                volume_attach_limit,
            ))
        });

        Server::builder()
            .timeout(io_timeout.add(Duration::from_secs(3)))
            .add_service(IdentityServer::new(IdentityService::default()))
            .add_optional_service(controller)
            .add_optional_service(node)
            .serve_with_incoming_shutdown(incoming, shutdown_signal())
            .await
            .map_err(|error| anyhow::anyhow!("Failed to start gRPC server: {error}"))?;
        Ok(())
    }
}
