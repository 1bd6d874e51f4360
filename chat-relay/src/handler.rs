//! Per-connection control loop.
//!
//! A connection moves through `Connecting -> AwaitingName -> Active ->
//! Closing -> Closed`. Nothing that happens here is allowed to escape the
//! connection: every failure becomes a [`CloseReason`].

use std::{net::SocketAddr, sync::Arc};

use tokio::{
    io::{AsyncRead, AsyncWriteExt, BufReader},
    select,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    broadcast::BroadcastEvent,
    codec::{Frame, read_frame, write_frame},
    error::{RelayError, RelayResult},
    protocol::{
        JOIN_CONFIRMATION, NAME_REQUEST, chat_text, duplicate_name_rejection,
        invalid_name_rejection, joined_notice, parse_name, relay_line_len,
    },
    server::Relay,
    session::{BoxedWriter, Session, SessionWriter},
};

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer ended its stream cleanly between frames.
    Left,
    /// The stream broke, was cut mid-frame, or a write to the peer failed.
    Disconnected,
    /// The peer declared a frame above the configured limit.
    FrameTooLarge,
    /// The proposed nickname was invalid or already taken.
    Rejected,
    /// The session was closed elsewhere, typically after a failed broadcast.
    Evicted,
    Shutdown,
}

impl From<&RelayError> for CloseReason {
    fn from(error: &RelayError) -> Self {
        match error {
            RelayError::FrameTooLarge { .. } => Self::FrameTooLarge,
            RelayError::DuplicateName { .. } | RelayError::InvalidName { .. } => Self::Rejected,
            RelayError::ConnectionClosed | RelayError::WriteFailed(_) => Self::Disconnected,
        }
    }
}

enum Endpoint {
    Unnamed(BoxedWriter),
    Named(Arc<Session>),
}

enum ConnectionState {
    Connecting(BoxedWriter),
    AwaitingName(BoxedWriter),
    Active(Arc<Session>),
    Closing {
        endpoint: Endpoint,
        reason: CloseReason,
    },
    Closed(CloseReason),
}

impl ConnectionState {
    fn closing_unnamed(writer: BoxedWriter, reason: CloseReason) -> Self {
        Self::Closing {
            endpoint: Endpoint::Unnamed(writer),
            reason,
        }
    }

    fn closing_named(session: Arc<Session>, reason: CloseReason) -> Self {
        Self::Closing {
            endpoint: Endpoint::Named(session),
            reason,
        }
    }
}

/// Runs one participant's connection to completion.
pub async fn handle_connection<R>(
    reader: R,
    writer: BoxedWriter,
    peer: Option<SocketAddr>,
    relay: Arc<Relay>,
) -> CloseReason
where
    R: AsyncRead + Unpin + Send,
{
    let mut connection = Connection {
        reader: BufReader::new(reader),
        peer,
        token: relay.connection_token(),
        relay,
    };

    let mut state = ConnectionState::Connecting(writer);
    loop {
        state = match state {
            ConnectionState::Closed(reason) => return reason,
            ConnectionState::Connecting(writer) => connection.request_name(writer).await,
            ConnectionState::AwaitingName(writer) => connection.await_name(writer).await,
            ConnectionState::Active(session) => connection.receive(session).await,
            ConnectionState::Closing { endpoint, reason } => {
                connection.close(endpoint, reason).await
            }
        };
    }
}

struct Connection<R> {
    reader: BufReader<R>,
    peer: Option<SocketAddr>,
    token: CancellationToken,
    relay: Arc<Relay>,
}

impl<R> Connection<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn request_name(&mut self, mut writer: BoxedWriter) -> ConnectionState {
        match send_raw(&mut writer, NAME_REQUEST).await {
            Ok(()) => ConnectionState::AwaitingName(writer),
            Err(error) => {
                debug!(peer = ?self.peer, %error, "failed to request nickname");
                ConnectionState::closing_unnamed(writer, CloseReason::Disconnected)
            }
        }
    }

    async fn await_name(&mut self, mut writer: BoxedWriter) -> ConnectionState {
        let max_len = self.relay.config().max_frame_len;
        let frame = select! {
            biased;
            _ = self.token.cancelled() => {
                return ConnectionState::closing_unnamed(writer, CloseReason::Shutdown);
            }
            frame = read_frame(&mut self.reader, max_len) => frame,
        };

        let payload = match frame {
            Ok(Some(payload)) => payload,
            Ok(None) => return ConnectionState::closing_unnamed(writer, CloseReason::Left),
            Err(error) => {
                self.log_read_failure(&error);
                return ConnectionState::closing_unnamed(writer, CloseReason::from(&error));
            }
        };

        let name = match parse_name(&payload) {
            Ok(name) => name,
            Err(error) => {
                info!(peer = ?self.peer, %error, "rejected nickname");
                if let Err(error) = send_raw(&mut writer, &invalid_name_rejection()).await {
                    debug!(peer = ?self.peer, %error, "failed to send rejection");
                }
                return ConnectionState::closing_unnamed(writer, CloseReason::Rejected);
            }
        };

        let session = Arc::new(Session::new(
            self.relay.next_id(),
            name,
            self.peer,
            writer,
            self.token.clone(),
        ));
        self.join(session).await
    }

    /// Registers the session and confirms the join.
    ///
    /// The session's writer stays locked from registration until the
    /// confirmation is written, so no broadcast can reach the newcomer first.
    async fn join(&mut self, session: Arc<Session>) -> ConnectionState {
        let admitted = {
            let mut writer = session.lock_writer().await;
            let registered = self.relay.registry().register(Arc::clone(&session));
            if registered.is_ok() && self.relay.is_shutting_down() {
                // Registered after the shutdown drain; nobody may hear of it.
                self.relay.registry().deregister(session.id());
                None
            } else {
                let replied = match &registered {
                    Ok(()) => send_text(&mut writer, JOIN_CONFIRMATION).await,
                    Err(_) => {
                        let rejection = duplicate_name_rejection(session.name());
                        send_text(&mut writer, &rejection).await
                    }
                };
                Some((registered, replied))
            }
        };

        let Some((registered, replied)) = admitted else {
            debug!(peer = ?self.peer, name = session.name(), "join abandoned, relay stopping");
            return ConnectionState::closing_named(session, CloseReason::Shutdown);
        };

        match (registered, replied) {
            (Ok(()), Ok(())) => {
                info!(
                    peer = ?self.peer,
                    session = session.id(),
                    name = session.name(),
                    "participant joined"
                );
                self.relay
                    .broadcaster()
                    .broadcast(BroadcastEvent::system(joined_notice(session.name())))
                    .await;
                ConnectionState::Active(session)
            }
            (Ok(()), Err(error)) => {
                // Never announced, so leave without a departure notice.
                debug!(peer = ?self.peer, %error, "failed to confirm join");
                self.relay.registry().deregister(session.id());
                ConnectionState::closing_named(session, CloseReason::Disconnected)
            }
            (Err(error), _) => {
                info!(peer = ?self.peer, %error, "rejected nickname");
                ConnectionState::closing_named(session, CloseReason::Rejected)
            }
        }
    }

    async fn receive(&mut self, session: Arc<Session>) -> ConnectionState {
        let max_len = self.relay.config().max_frame_len;
        let frame = select! {
            biased;
            _ = session.closed() => {
                let reason = if self.relay.is_shutting_down() {
                    CloseReason::Shutdown
                } else {
                    CloseReason::Evicted
                };
                return ConnectionState::closing_named(session, reason);
            }
            frame = read_frame(&mut self.reader, max_len) => frame,
        };

        match frame {
            Ok(Some(payload)) => {
                self.relay_chat(&session, &payload).await;
                ConnectionState::Active(session)
            }
            Ok(None) => ConnectionState::closing_named(session, CloseReason::Left),
            Err(error) => {
                self.log_read_failure(&error);
                ConnectionState::closing_named(session, CloseReason::from(&error))
            }
        }
    }

    async fn relay_chat(&mut self, session: &Session, payload: &[u8]) {
        if payload.is_empty() {
            trace!(session = session.id(), "keepalive");
            return;
        }

        let max_len = self.relay.config().max_frame_len;
        match chat_text(payload) {
            Some(text) if relay_line_len(session.name(), text) > max_len => {
                warn!(
                    session = session.id(),
                    name = session.name(),
                    len = payload.len(),
                    max = max_len,
                    "dropping chat that would not fit in one relayed frame"
                );
            }
            Some(text) => {
                debug!(
                    session = session.id(),
                    name = session.name(),
                    len = text.len(),
                    "relaying chat"
                );
                self.relay
                    .broadcaster()
                    .broadcast(BroadcastEvent::chat(session, text))
                    .await;
            }
            None => debug!(session = session.id(), "dropping blank or non-UTF-8 chat frame"),
        }
    }

    async fn close(&mut self, endpoint: Endpoint, reason: CloseReason) -> ConnectionState {
        match endpoint {
            Endpoint::Named(session) => {
                self.relay.broadcaster().depart(session.id()).await;
                session.close().await;
            }
            Endpoint::Unnamed(mut writer) => {
                if let Err(error) = writer.shutdown().await {
                    trace!(peer = ?self.peer, ?error, "transport shutdown failed");
                }
            }
        }
        debug!(peer = ?self.peer, ?reason, "connection closed");
        ConnectionState::Closed(reason)
    }

    fn log_read_failure(&self, error: &RelayError) {
        match error {
            RelayError::FrameTooLarge { .. } => {
                warn!(peer = ?self.peer, %error, "closing connection after oversized frame");
            }
            _ => debug!(peer = ?self.peer, %error, "read failed"),
        }
    }
}

async fn send_raw(writer: &mut BoxedWriter, text: &str) -> RelayResult<()> {
    let frame = Frame::encode(text)?;
    write_frame(writer, &frame)
        .await
        .map_err(RelayError::WriteFailed)
}

async fn send_text(writer: &mut SessionWriter<'_>, text: &str) -> RelayResult<()> {
    writer.send(&Frame::encode(text)?).await
}
