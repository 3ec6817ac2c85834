use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};

use crate::config::ServerConfig;
use crate::dispatch::RecordHandler;
use crate::error::{Error, Result};
use crate::handler::{ErrorAction, ErrorHandler, Severity};
use crate::output::OutputSink;
use crate::reader::FrameReader;
use crate::roster::Outbound;
use crate::session::ServerSession;
use crate::worker::{receive_loop, spawn_writer, Exit};

#[derive(Clone)]
pub struct Server {
    session: Arc<ServerSession>,
    config: ServerConfig,
    errors: Arc<dyn ErrorHandler>,
}

impl Server {
    pub fn new(config: ServerConfig, sink: Arc<dyn OutputSink>, errors: Arc<dyn ErrorHandler>) -> Self {
        Self {
            session: Arc::new(ServerSession::new(config.version, sink)),
            config,
            errors,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// # Errors
    ///
    /// Fails if the configured address cannot be bound.
    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(self.config.addr()).await?;
        info!(
            "Listening on {} for clients at version {}",
            listener.local_addr()?,
            self.config.version
        );
        Ok(listener)
    }

    /// Accept connections until the error handler asks to stop.
    ///
    /// # Errors
    ///
    /// The accept error the handler chose to terminate on.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => self.handle_connection(stream, peer).await,
                Err(e) => {
                    let error = Error::Accept(e);
                    if self.errors.handle(&error, Severity::Recoverable) == ErrorAction::Terminate {
                        return Err(error);
                    }
                }
            }
        }
    }

    /// Register a socket and spawn its writer and receive worker.
    pub async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        debug!("New connection from {peer}");
        let (reader, writer) = stream.into_split();
        let (outbound, rx, shutdown) = Outbound::channel();
        spawn_writer(writer, rx, peer.to_string(), Arc::clone(&shutdown));
        let id = self.session.register(Some(peer), outbound).await;

        let session = Arc::clone(&self.session);
        tokio::spawn(async move {
            match receive_loop(FrameReader::new(reader), session.as_ref(), id, &shutdown).await {
                Exit::Failed(e) => warn!("Dropping {peer}: {e}"),
                exit => debug!("Receive worker for {peer} stopped: {exit:?}"),
            }
            session.on_closed(id).await;
        });
    }

    /// Validated member names in join order.
    pub async fn member_names(&self) -> Vec<String> {
        self.session.member_names().await
    }

    /// Remove a member as if a `Disconnect` record had named it.
    pub async fn kick(&self, name: &str) -> bool {
        self.session.kick(name).await
    }

    /// Close every connection without announcing anything.
    pub async fn disconnect_all(&self) -> usize {
        let closed = self.session.disconnect_all().await;
        info!("Disconnected {closed} clients");
        closed
    }
}
