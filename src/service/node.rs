use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use tokio::signal;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, trace, warn};

use crate::service::{NodeConfig, NodeService, Server};
use crate::{AppError, AppResult};

/// A broker node: one TCP server in front of one [`NodeService`].
pub struct Node {
    config: NodeConfig,
    node_service: Arc<NodeService>,
}

impl Node {
    pub fn new(config: NodeConfig) -> Self {
        Node {
            config,
            node_service: Arc::new(NodeService::new()),
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn node_service(&self) -> Arc<NodeService> {
        self.node_service.clone()
    }

    /// Serves on the configured address until ctrl-c.
    pub fn start(&mut self, rt: &Runtime) -> AppResult<()> {
        rt.block_on(async {
            let listener = self.bind().await?;
            self.serve(listener, async {
                if let Err(err) = signal::ctrl_c().await {
                    error!(cause = %err, "failed to listen for ctrl-c");
                }
            })
            .await
        })
    }

    pub async fn bind(&self) -> AppResult<TcpListener> {
        let listen_address = self.config.network.listen_address();
        match TcpListener::bind(&listen_address).await {
            Ok(listener) => {
                info!("tcp server binding to {} for listening", &listen_address);
                Ok(listener)
            }
            Err(err) => {
                let error_msg = format!(
                    "Failed to bind server to address: {} - Error: {}",
                    listen_address, err
                );
                error!(error_msg);
                Err(AppError::IllegalStateError(error_msg))
            }
        }
    }

    /// Creates the configured topics, then serves `listener` until
    /// `shutdown_signal` resolves. Returns once every connection is closed
    /// and every partition is stopped.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown_signal: F) -> AppResult<()>
    where
        F: Future<Output = ()>,
    {
        self.bootstrap_topics()?;

        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel::<()>(1);
        let local_addr: Option<SocketAddr> = listener.local_addr().ok();
        let server = Server::new(
            listener,
            notify_shutdown.clone(),
            shutdown_complete_tx,
            self.node_service.clone(),
            self.config.clone(),
        );

        tokio::select! {
            res = server.run() => {
                if let Err(err) = res {
                    error!(cause = %err, "failed to accept");
                }
            }
            _ = shutdown_signal => {
                info!(addr = ?local_addr, "get shutdown signal");
            }
        }

        // tcp server has been shutdown, send shutdown signal
        let _ = notify_shutdown.send(());
        self.node_service.shutdown();
        drop(server);
        // wait for every connection handler to finish
        trace!("waiting for shutdown complete...");
        let _ = shutdown_complete_rx.recv().await;
        info!("node shutdown complete");
        Ok(())
    }

    fn bootstrap_topics(&self) -> AppResult<()> {
        for meta in &self.config.topics {
            match self.node_service.create_topic(meta.clone()) {
                Ok(()) => {}
                Err(AppError::TopicAlreadyExists(topic)) => {
                    warn!(topic = %topic, "bootstrap topic already exists");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}
