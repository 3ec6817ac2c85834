//! Server side of the session protocol.
//!
//! ```text
//! Connected --UserInfo--> PendingValidation --checks pass--> Validated
//!     |                          |                              |
//!     +--------------------------+------ close / kick ---------> Closed
//! ```
//!
//! The roster sits behind one async mutex and every handler holds it from
//! start to finish, so a handshake's name check and its move to Validated
//! happen with no other handler in between. Two sockets racing for the same
//! name are decided by whichever takes the lock first.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::Mutex;

use crate::dispatch::{Disposition, RecordHandler};
use crate::error::SessionError;
use crate::output::OutputSink;
use crate::record::{Kind, ProtocolVersion, Record, UserInfo};
use crate::roster::{Connection, ConnectionId, Departure, Outbound, Roster, SessionState};

pub const EMPTY_NAME_NOTICE: &str = "Your username cannot be empty!\n";
pub const NAME_TAKEN_NOTICE: &str = "Sorry, another client is already connected with that name!\n";

pub struct ServerSession {
    roster: Mutex<Roster>,
    version: ProtocolVersion,
    sink: Arc<dyn OutputSink>,
}

impl ServerSession {
    pub fn new(version: ProtocolVersion, sink: Arc<dyn OutputSink>) -> Self {
        Self {
            roster: Mutex::new(Roster::new()),
            version,
            sink,
        }
    }

    /// Link a freshly accepted socket. It stays invisible to broadcasts
    /// until its handshake passes.
    pub async fn register(&self, addr: Option<SocketAddr>, outbound: Outbound) -> ConnectionId {
        self.roster
            .lock()
            .await
            .link(Connection::remote(addr, outbound))
    }

    pub async fn member_names(&self) -> Vec<String> {
        self.roster.lock().await.member_names()
    }

    /// Every linked connection, validated or not.
    pub async fn connection_count(&self) -> usize {
        self.roster.lock().await.len()
    }

    pub async fn state_of(&self, id: ConnectionId) -> Option<SessionState> {
        self.roster.lock().await.get(id).map(Connection::state)
    }

    /// Remove a validated member by name, announcing the departure.
    pub async fn kick(&self, name: &str) -> bool {
        let mut roster = self.roster.lock().await;
        match roster.find_member(name, None) {
            Some(id) => {
                info!("Kicking client \"{name}\"");
                Self::teardown(&mut roster, id);
                true
            }
            None => false,
        }
    }

    /// Close everything without announcing anything.
    pub async fn disconnect_all(&self) -> usize {
        self.roster.lock().await.disconnect_all()
    }

    // Unlink first, then announce to whoever is left.
    fn teardown(roster: &mut Roster, id: ConnectionId) -> Option<Departure> {
        let departure = roster.disconnect(id)?;
        let addr = departure.peer_label();

        match &departure.user {
            Some(user) if departure.was_validated => {
                info!("Client \"{}\" ({addr}) has disconnected", user.name);
                roster.broadcast(None, &Record::disconnect(&user.name));
            }
            _ if departure.rejected => debug!("Removed rejected client from address {addr}"),
            _ => warn!("Client from address {addr} failed to connect"),
        }
        Some(departure)
    }

    fn reject(roster: &mut Roster, origin: ConnectionId, notice: String) -> Disposition {
        if let Some(conn) = roster.get_mut(origin) {
            conn.send(Record::stdout(notice));
            conn.mark_for_removal();
        }
        Disposition::Close
    }

    // First failing check wins.
    fn check(&self, roster: &Roster, origin: ConnectionId, user: &UserInfo, peer: &str) -> Option<String> {
        if user.name.is_empty() {
            warn!("Client from address {peer} sent an empty username");
            return Some(EMPTY_NAME_NOTICE.to_string());
        }
        if user.version != self.version {
            warn!(
                "Client \"{}\" ({peer}) failed to connect as its version is {}, however the server expects version {}",
                user.name, user.version, self.version
            );
            return Some(format!(
                "Your client version is {}, however the server expects a client version of {}!\n",
                user.version, self.version
            ));
        }
        if roster.find_member(&user.name, Some(origin)).is_some() {
            warn!(
                "Client \"{}\" ({peer}) failed to connect as the given username is already occupied",
                user.name
            );
            return Some(NAME_TAKEN_NOTICE.to_string());
        }
        None
    }

    fn admit(roster: &mut Roster, origin: ConnectionId, user: &UserInfo, peer: &str) {
        roster.broadcast(
            Some(origin),
            &Record::stdout(format!("Client \"{}\" has connected\n", user.name)),
        );

        if let Some(conn) = roster.get_mut(origin) {
            conn.mark_validated();
            conn.send(Record::Connect {
                user: user.clone(),
                validate_only: true,
            });
        }
        info!("Client \"{}\" ({peer}) has connected", user.name);

        // Both sides need each other's identity, so this is pairwise rather
        // than a single broadcast.
        let Some(newcomer) = roster.get(origin) else {
            return;
        };
        for (_, other) in roster.members(Some(origin)) {
            if let Some(known) = other.user() {
                newcomer.send(Record::Connect {
                    user: known.clone(),
                    validate_only: false,
                });
                other.send(Record::Connect {
                    user: user.clone(),
                    validate_only: false,
                });
            }
        }
    }

    /// The origin if it is still linked and validated. `Ok(None)` means it
    /// was torn down while its record was in flight.
    fn member<'r>(
        roster: &'r Roster,
        origin: ConnectionId,
        kind: Kind,
    ) -> Result<Option<&'r Connection>, SessionError> {
        match roster.get(origin) {
            Some(conn) if conn.is_validated() => Ok(Some(conn)),
            Some(_) => Err(SessionError::NotValidated(kind)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl RecordHandler for ServerSession {
    fn role(&self) -> &'static str {
        "server"
    }

    async fn on_userinfo(
        &self,
        origin: ConnectionId,
        user: UserInfo,
    ) -> Result<Disposition, SessionError> {
        let mut roster = self.roster.lock().await;
        let Some(conn) = roster.get_mut(origin) else {
            return Ok(Disposition::Close);
        };
        if conn.state() != SessionState::Connected {
            return Err(SessionError::AlreadyValidated);
        }
        conn.begin_validation(user.clone());
        let peer = conn.peer_label();

        if let Some(notice) = self.check(&roster, origin, &user, &peer) {
            return Ok(Self::reject(&mut roster, origin, notice));
        }
        Self::admit(&mut roster, origin, &user, &peer);
        Ok(Disposition::Continue)
    }

    async fn on_message(
        &self,
        origin: ConnectionId,
        text: String,
    ) -> Result<Disposition, SessionError> {
        let roster = self.roster.lock().await;
        let Some(conn) = Self::member(&roster, origin, Kind::Message)? else {
            return Ok(Disposition::Close);
        };
        let line = format!("{}: {}\n", conn.name().unwrap_or_default(), text);
        self.sink.write(&line);
        roster.broadcast(Some(origin), &Record::stdout(line));
        Ok(Disposition::Continue)
    }

    async fn on_disconnect(
        &self,
        origin: ConnectionId,
        name: String,
    ) -> Result<Disposition, SessionError> {
        let mut roster = self.roster.lock().await;
        let Some(conn) = Self::member(&roster, origin, Kind::Disconnect)? else {
            return Ok(Disposition::Close);
        };
        let requester = conn.name().unwrap_or_default().to_string();
        match roster.find_member(&name, Some(origin)) {
            Some(target) => {
                info!("Client \"{requester}\" removed client \"{name}\"");
                Self::teardown(&mut roster, target);
            }
            None => debug!("Client \"{requester}\" asked to remove unknown client \"{name}\""),
        }
        Ok(Disposition::Continue)
    }

    async fn on_closed(&self, origin: ConnectionId) {
        let mut roster = self.roster.lock().await;
        Self::teardown(&mut roster, origin);
    }
}
