use std::{io, net::SocketAddr};

use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::{Mutex, MutexGuard},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    codec::{Frame, write_frame},
    error::{RelayError, RelayResult},
};

pub type SessionId = u64;

/// Write half of a participant's transport.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One named participant.
///
/// The write handle sits behind an async mutex so a frame is always written
/// whole, even when several broadcasts target the same session at once.
pub struct Session {
    id: SessionId,
    name: String,
    peer: Option<SocketAddr>,
    writer: Mutex<Option<BoxedWriter>>,
    closed: CancellationToken,
}

impl Session {
    /// `closed` is cancelled when the session is closed; it is usually a child
    /// of the server's shutdown token so shutdown reaches every session.
    pub fn new(
        id: SessionId,
        name: String,
        peer: Option<SocketAddr>,
        writer: BoxedWriter,
        closed: CancellationToken,
    ) -> Self {
        Self {
            id,
            name,
            peer,
            writer: Mutex::new(Some(writer)),
            closed,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub async fn send(&self, frame: &Frame) -> RelayResult<()> {
        self.lock_writer().await.send(frame).await
    }

    /// Holds the write handle so nothing else can write until the guard drops.
    pub async fn lock_writer(&self) -> SessionWriter<'_> {
        SessionWriter {
            guard: self.writer.lock().await,
        }
    }

    /// Closes the session. Safe to call any number of times.
    pub async fn close(&self) {
        self.closed.cancel();
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(error) = writer.shutdown().await {
                debug!(session = self.id, ?error, "transport shutdown failed");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the session is closed or the server shuts down.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

pub struct SessionWriter<'a> {
    guard: MutexGuard<'a, Option<BoxedWriter>>,
}

impl SessionWriter<'_> {
    pub async fn send(&mut self, frame: &Frame) -> RelayResult<()> {
        let writer = self.guard.as_mut().ok_or_else(|| {
            RelayError::WriteFailed(io::Error::new(
                io::ErrorKind::NotConnected,
                "session closed",
            ))
        })?;
        write_frame(writer, frame)
            .await
            .map_err(RelayError::WriteFailed)
    }
}
