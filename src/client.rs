//! Client side of the session protocol.
//!
//! The client keeps a mirror of the server's roster: its own connection is
//! the first node, and every `Connect` sync record links a member that exists
//! only as a name. Mirror members are never written to.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::dispatch::{Disposition, RecordHandler};
use crate::error::{Error, Result, SessionError};
use crate::handler::{ErrorHandler, Severity};
use crate::output::OutputSink;
use crate::reader::FrameReader;
use crate::record::{Kind, Record, UserInfo};
use crate::roster::{Connection, ConnectionId, Outbound, Roster, SessionState};
use crate::worker::{receive_loop, spawn_writer, Exit};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Connected, waiting for the server to accept our credentials.
    Pending,
    Ready,
    Closed,
}

pub struct ClientSession {
    roster: Mutex<Roster>,
    local: ConnectionId,
    status: watch::Sender<Status>,
    sink: Arc<dyn OutputSink>,
}

impl ClientSession {
    pub fn new(addr: Option<SocketAddr>, outbound: Outbound, sink: Arc<dyn OutputSink>) -> Self {
        let mut roster = Roster::new();
        let local = roster.link(Connection::remote(addr, outbound));
        let (status, _) = watch::channel(Status::Pending);
        Self {
            roster: Mutex::new(roster),
            local,
            status,
            sink,
        }
    }

    pub fn local(&self) -> ConnectionId {
        self.local
    }

    pub fn status(&self) -> Status {
        *self.status.borrow()
    }

    pub async fn members(&self) -> Vec<String> {
        self.roster.lock().await.member_names()
    }

    async fn local_state(&self) -> Option<SessionState> {
        self.roster.lock().await.get(self.local).map(Connection::state)
    }

    async fn authenticate(&self, user: UserInfo) -> Result<()> {
        if user.name.is_empty() {
            return Err(Error::InvalidName);
        }
        let mut roster = self.roster.lock().await;
        let conn = roster.get_mut(self.local).ok_or(Error::NotConnected)?;
        if conn.state() != SessionState::Connected {
            return Err(SessionError::AlreadyValidated.into());
        }
        conn.begin_validation(user.clone());
        if conn.send(Record::UserInfo(user)) {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    async fn send_message(&self, text: &str) -> Result<()> {
        let roster = self.roster.lock().await;
        let conn = roster.get(self.local).ok_or(Error::NotConnected)?;
        if !conn.is_validated() {
            return Err(SessionError::NotValidated(Kind::Message).into());
        }
        if conn.send(Record::message(text)) {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    /// Close our own connection. The writer flushes whatever is queued and
    /// shuts the socket; the receive worker is told to stop.
    async fn hang_up(&self) -> bool {
        self.roster.lock().await.disconnect(self.local).is_some()
    }
}

#[async_trait]
impl RecordHandler for ClientSession {
    fn role(&self) -> &'static str {
        "client"
    }

    async fn on_stdout(
        &self,
        _origin: ConnectionId,
        text: String,
    ) -> std::result::Result<Disposition, SessionError> {
        self.sink.write(&text);
        Ok(Disposition::Continue)
    }

    async fn on_connect(
        &self,
        origin: ConnectionId,
        user: UserInfo,
        validate_only: bool,
    ) -> std::result::Result<Disposition, SessionError> {
        let mut roster = self.roster.lock().await;
        if validate_only {
            if let Some(conn) = roster.get_mut(origin) {
                conn.begin_validation(user);
                conn.mark_validated();
            }
            self.status.send_replace(Status::Ready);
        } else if roster.find_member(&user.name, Some(origin)).is_none() {
            debug!("Learned of client \"{}\"", user.name);
            roster.link(Connection::mirror(user));
        }
        Ok(Disposition::Continue)
    }

    async fn on_disconnect(
        &self,
        origin: ConnectionId,
        name: String,
    ) -> std::result::Result<Disposition, SessionError> {
        let mut roster = self.roster.lock().await;
        if let Some(id) = roster.find_member(&name, Some(origin)) {
            roster.unlink(id);
            self.sink.write(&format!("Client \"{name}\" has disconnected\n"));
        }
        Ok(Disposition::Continue)
    }

    async fn on_closed(&self, _origin: ConnectionId) {
        self.roster.lock().await.disconnect_all();
        self.status.send_replace(Status::Closed);
    }
}

/// A connected chat client.
pub struct Client {
    session: Arc<ClientSession>,
    worker: JoinHandle<()>,
}

impl Client {
    /// Open a connection to the server and start its receive worker.
    ///
    /// # Errors
    ///
    /// Fails if the server cannot be reached.
    pub async fn connect(
        config: &ClientConfig,
        sink: Arc<dyn OutputSink>,
        errors: Arc<dyn ErrorHandler>,
    ) -> Result<Self> {
        let stream = TcpStream::connect((config.host.as_str(), config.port)).await?;
        let addr = stream.peer_addr().ok();
        let label = addr.map_or_else(|| config.host.clone(), |addr| addr.to_string());
        info!("Connected to {label}");

        let (reader, writer) = stream.into_split();
        let (outbound, rx, shutdown) = Outbound::channel();
        spawn_writer(writer, rx, label, Arc::clone(&shutdown));

        let session = Arc::new(ClientSession::new(addr, outbound, sink));
        let worker = tokio::spawn({
            let session = Arc::clone(&session);
            async move {
                let local = session.local();
                let exit = receive_loop(FrameReader::new(reader), session.as_ref(), local, &shutdown).await;
                // After a hang-up the server closing its end is expected.
                let hung_up = session.local_state().await.is_none();
                match exit {
                    Exit::EndOfStream | Exit::Stopped if !hung_up => {
                        errors.handle(&Error::ConnectionLost, Severity::Fatal);
                    }
                    Exit::Failed(e) if !hung_up => {
                        errors.handle(&e, Severity::Fatal);
                    }
                    exit => debug!("Receive worker stopped: {exit:?}"),
                }
                session.on_closed(local).await;
            }
        });

        Ok(Self { session, worker })
    }

    /// Send credentials. Completion is signalled later by the server's
    /// acknowledgement; see [`Client::is_ready`] and [`Client::wait_ready`].
    ///
    /// # Errors
    ///
    /// [`Error::InvalidName`] for an empty name, [`Error::NotConnected`] once
    /// the connection is gone.
    pub async fn authenticate(&self, user: UserInfo) -> Result<()> {
        self.session.authenticate(user).await
    }

    pub fn is_ready(&self) -> bool {
        self.session.status() == Status::Ready
    }

    /// Wait for the server to accept or refuse the handshake.
    ///
    /// # Errors
    ///
    /// [`Error::ConnectionLost`] if the connection closed first, which is how
    /// the server refuses.
    pub async fn wait_ready(&self) -> Result<()> {
        let mut status = self.session.status.subscribe();
        let result = status
            .wait_for(|status| *status != Status::Pending)
            .await
            .map(|status| *status);
        match result {
            Ok(Status::Ready) => Ok(()),
            _ => Err(Error::ConnectionLost),
        }
    }

    /// # Errors
    ///
    /// Fails before the handshake has completed or after the connection is
    /// gone.
    pub async fn send_message(&self, text: &str) -> Result<()> {
        self.session.send_message(text).await
    }

    /// Every member this client knows of, itself first.
    pub async fn members(&self) -> Vec<String> {
        self.session.members().await
    }

    /// Resolves once the receive worker has stopped.
    pub async fn closed(&self) {
        let mut status = self.session.status.subscribe();
        let _ = status.wait_for(|status| *status == Status::Closed).await;
    }

    pub async fn disconnect(&self) {
        if self.session.hang_up().await {
            info!("Disconnecting from server");
        }
        self.closed().await;
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.worker.abort();
    }
}
