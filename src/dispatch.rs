use async_trait::async_trait;

use crate::error::SessionError;
use crate::record::{Kind, Record, UserInfo};
use crate::roster::ConnectionId;

/// What the receive loop should do once a handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Continue,
    /// The origin has been marked for removal; stop reading and tear it down.
    Close,
}

/// One side of the protocol. Each method handles one record kind for the
/// connection it arrived on; kinds a role never expects keep the default,
/// which refuses the record.
#[async_trait]
pub trait RecordHandler: Send + Sync {
    fn role(&self) -> &'static str;

    async fn on_stdout(
        &self,
        _origin: ConnectionId,
        _text: String,
    ) -> Result<Disposition, SessionError> {
        Err(unsupported(Kind::Stdout, self.role()))
    }

    async fn on_userinfo(
        &self,
        _origin: ConnectionId,
        _user: UserInfo,
    ) -> Result<Disposition, SessionError> {
        Err(unsupported(Kind::UserInfo, self.role()))
    }

    async fn on_connect(
        &self,
        _origin: ConnectionId,
        _user: UserInfo,
        _validate_only: bool,
    ) -> Result<Disposition, SessionError> {
        Err(unsupported(Kind::Connect, self.role()))
    }

    async fn on_disconnect(
        &self,
        _origin: ConnectionId,
        _name: String,
    ) -> Result<Disposition, SessionError> {
        Err(unsupported(Kind::Disconnect, self.role()))
    }

    async fn on_message(
        &self,
        _origin: ConnectionId,
        _text: String,
    ) -> Result<Disposition, SessionError> {
        Err(unsupported(Kind::Message, self.role()))
    }

    /// Called exactly once when the origin's receive loop has ended, however
    /// it ended.
    async fn on_closed(&self, origin: ConnectionId);
}

fn unsupported(kind: Kind, role: &'static str) -> SessionError {
    SessionError::Unsupported { kind, role }
}

/// Route a decoded record to its handler. The record is consumed whatever
/// the outcome.
///
/// # Errors
///
/// Whatever the handler refuses; the caller must close the origin.
pub async fn dispatch<H>(
    handler: &H,
    record: Record,
    origin: ConnectionId,
) -> Result<Disposition, SessionError>
where
    H: RecordHandler + ?Sized,
{
    match record {
        Record::Stdout(text) => handler.on_stdout(origin, text).await,
        Record::UserInfo(user) => handler.on_userinfo(origin, user).await,
        Record::Connect {
            user,
            validate_only,
        } => handler.on_connect(origin, user, validate_only).await,
        Record::Disconnect { name } => handler.on_disconnect(origin, name).await,
        Record::Message(text) => handler.on_message(origin, text).await,
    }
}
