//! Connection worker: the per-socket receive loop and its writer task.

use std::sync::Arc;

use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::dispatch::{dispatch, Disposition, RecordHandler};
use crate::error::Error;
use crate::reader::{FrameReader, ReadOutcome};
use crate::record::Record;
use crate::roster::ConnectionId;

/// Why a receive loop stopped.
#[derive(Debug)]
pub enum Exit {
    /// Peer shut down cleanly.
    EndOfStream,
    /// A handler asked for the connection to be closed.
    Closed,
    /// Someone else tore the connection down.
    Stopped,
    Failed(Error),
}

/// Decode and dispatch records from `reader` until the peer goes away, a
/// handler closes the origin, `shutdown` fires, or something fails.
///
/// Each record is fully handled before the next read starts.
pub async fn receive_loop<R, H>(
    mut reader: FrameReader<R>,
    handler: &H,
    origin: ConnectionId,
    shutdown: &Notify,
) -> Exit
where
    R: AsyncRead + Unpin,
    H: RecordHandler + ?Sized,
{
    loop {
        let outcome = tokio::select! {
            () = shutdown.notified() => return Exit::Stopped,
            outcome = reader.read_record() => outcome,
        };
        let record = match outcome {
            Ok(ReadOutcome::Record(record)) => record,
            Ok(ReadOutcome::EndOfStream) => return Exit::EndOfStream,
            Err(e) => return Exit::Failed(e.into()),
        };

        debug!("{origin}: {} record", record.kind());
        match dispatch(handler, record, origin).await {
            Ok(Disposition::Continue) => {}
            Ok(Disposition::Close) => return Exit::Closed,
            Err(e) => return Exit::Failed(e.into()),
        }
    }
}

/// Drain `rx` onto `writer` until every sender is gone, then shut the write
/// side down so the peer sees end-of-stream.
///
/// A failed write stops the connection's receive worker through `shutdown`,
/// which in turn tears the connection down.
pub fn spawn_writer<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Record>,
    peer: String,
    shutdown: Arc<Notify>,
) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(record) = rx.recv().await {
            if let Err(e) = writer.write_all(&record.encode()).await {
                warn!("Failed to send {} record to {peer}: {e}", record.kind());
                shutdown.notify_one();
                return;
            }
        }
        if let Err(e) = writer.shutdown().await {
            debug!("Shutdown of {peer} failed: {e}");
        }
    })
}
