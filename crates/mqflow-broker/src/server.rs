//! MQTT broker server - accepts TCP connections and spawns a task per client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::net::TcpListener;

use mqflow_core::Result;

use crate::config::Config;
use crate::shared::Broker;
use crate::worker::serve_connection;

/// MQTT broker server.
pub struct Server {
    listener: TcpListener,
    broker: Arc<Broker>,
}

impl Server {
    /// Bind the listener configured in `server.bind`.
    pub async fn bind(config: Config) -> Result<Self> {
        let listener = TcpListener::bind(config.server.bind).await?;
        info!("mqflow listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            broker: Arc::new(Broker::new(config)),
        })
    }

    /// The bound address, useful when binding port 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Accept connections until the listener fails.
    ///
    /// Also sweeps expired offline sessions every
    /// `server.session_expiry_check` seconds.
    pub async fn run(self) -> Result<()> {
        let check = self.broker.config().server.session_expiry_check;
        let mut sweep = tokio::time::interval(Duration::from_secs(check.max(1)));
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            // Running out of file descriptors is transient
                            warn!("Accept failed: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            continue;
                        }
                    };
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                    }
                    debug!("Accepted connection from {}", addr);
                    let broker = Arc::downgrade(&self.broker);
                    tokio::spawn(serve_connection(broker, stream, addr.to_string()));
                }
                _ = sweep.tick(), if check > 0 => {
                    self.broker.expire_sessions(std::time::Instant::now());
                }
            }
        }
    }
}
