/* This file is part of backhaul.
 *
 * backhaul is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as
 * published by the Free Software Foundation, either version 3 of the
 * License, or (at your option) any later version.
 *
 * backhaul is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with backhaul.  If not, see <http://www.gnu.org/licenses/>.
 */

mod session;

mod storage;
pub use storage::ClientStore;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::registry::DbInterface;
use session::Session;

/// Everything a session needs, threaded through explicitly: the
/// registry handle, the storage tree, the configuration, and the
/// shutdown signal.
pub struct ServerContext {
    pub config: ServerConfig,
    pub registry: Arc<dyn DbInterface>,
    pub store: ClientStore,
    pub shutdown: broadcast::Sender<()>,
}

pub struct BackupServer {
    listener: TcpListener,
    ctx: Arc<ServerContext>,
}

impl BackupServer {
    pub async fn start(config: ServerConfig, registry: Arc<dyn DbInterface>)
        -> Result<BackupServer>
    {
        let listener = TcpListener::bind(&config.listen_address).await
            .with_context(|| format!("Failed to bind on address {}",
                                     config.listen_address))?;
        tokio::fs::create_dir_all(&config.data_root).await
            .with_context(|| format!("Failed to create data root {}",
                                     config.data_root.display()))?;

        info!("Listening on {}", listener.local_addr()?);
        let store = ClientStore::new(&config.data_root);
        let (shutdown, _) = broadcast::channel(1);
        Ok(BackupServer {
            listener,
            ctx: Arc::new(ServerContext { config, registry, store, shutdown }),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Clones the shutdown trigger; sending on it stops the accept
    /// loop and starts the drain countdown.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.ctx.shutdown.clone()
    }

    pub async fn run(self) {
        let mut shutdown_recv = self.ctx.shutdown.subscribe();
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((sock, peer)) => {
                            debug!("Accepted connection from {peer}");
                            let ctx = self.ctx.clone();
                            sessions.spawn(Session::new(sock, peer, ctx).run());
                        }
                        Err(err) => {
                            warn!("Failed to accept from socket: {err}");
                        }
                    }
                }
                _ = shutdown_recv.recv() => {
                    info!("Shutdown requested; no longer accepting connections");
                    break;
                }
            }

            // Reap whatever already finished so the set stays small
            while sessions.try_join_next().is_some() {}
        }

        drop(self.listener);
        if sessions.is_empty() {
            return;
        }

        info!("Draining {} active sessions", sessions.len());
        let drained = tokio::time::timeout(self.ctx.config.drain_timeout, async {
            while sessions.join_next().await.is_some() {}
        }).await;
        if drained.is_err() {
            warn!("Drain timeout expired; cancelling {} sessions", sessions.len());
            sessions.shutdown().await;
        }
    }
}
