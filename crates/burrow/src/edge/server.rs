//! EdgeServer and its accept loop.

use std::net::SocketAddr;
use std::sync::Arc;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::handler::{handle_request, EdgeContext};

/// The public HTTP listener.
pub struct EdgeServer {
    listener: TcpListener,
    context: Arc<EdgeContext>,
}

impl EdgeServer {
    pub fn new(listener: TcpListener, context: EdgeContext) -> Self {
        Self {
            listener,
            context: Arc::new(context),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` fires. Connections already being
    /// served finish on their own tasks.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), anyhow::Error> {
        info!("Edge listening on http://{}", self.listener.local_addr()?);
        if let Some(ref base) = self.context.edge.base_domain {
            info!("Routing hosts under *.{}", base);
        }

        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = shutdown.cancelled() => {
                    info!("Edge shutting down");
                    return Ok(());
                }
            };

            let (stream, remote_addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Edge accept error: {}", e);
                    continue;
                }
            };

            let context = Arc::clone(&self.context);
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                // A caller hanging up drops the in-flight handler future,
                // which releases its pending slot
                let service = service_fn(move |req| {
                    let context = Arc::clone(&context);
                    async move { handle_request(&context, req).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    debug!("Error serving edge connection from {}: {}", remote_addr, err);
                }
            });
        }
    }
}
