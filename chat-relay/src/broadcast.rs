//! Fan-out of one frame to every live session.
//!
//! A broadcast works on a registry snapshot, so slow recipients never hold the
//! registry lock. Sends to different recipients run concurrently and each is
//! bounded by the configured send timeout. A recipient whose send fails is
//! evicted and its departure is announced once the current fan-out finishes.

use std::{collections::VecDeque, io, sync::Arc, time::Duration};

use bytes::Bytes;
use futures::future::join_all;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::{
    codec::Frame,
    error::{RelayError, RelayResult},
    protocol::{left_notice, relay_line},
    registry::Registry,
    session::{Session, SessionId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    System,
    Session(SessionId),
}

/// A single payload on its way to the live sessions.
#[derive(Debug, Clone)]
pub struct BroadcastEvent {
    origin: Origin,
    payload: Bytes,
    exclude: Vec<SessionId>,
}

impl BroadcastEvent {
    /// Join/leave notices and other server-originated text. Excludes nobody.
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            origin: Origin::System,
            payload: Bytes::from(text.into()),
            exclude: Vec::new(),
        }
    }

    /// A chat line labeled with the sender's name. The sender receives it too.
    pub fn chat(session: &Session, text: &str) -> Self {
        Self {
            origin: Origin::Session(session.id()),
            payload: Bytes::from(relay_line(session.name(), text)),
            exclude: Vec::new(),
        }
    }

    pub fn excluding(mut self, id: SessionId) -> Self {
        self.exclude.push(id);
        self
    }
}

/// Outcome of the requested event's fan-out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct Broadcaster {
    registry: Arc<Registry>,
    send_timeout: Duration,
}

impl Broadcaster {
    pub fn new(registry: Arc<Registry>, send_timeout: Duration) -> Self {
        Self {
            registry,
            send_timeout,
        }
    }

    #[cfg(test)]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Delivers `event`, then announces the departure of any recipient that
    /// could not be reached.
    pub async fn broadcast(&self, event: BroadcastEvent) -> Delivery {
        let mut pending = VecDeque::from([event]);
        let mut requested = None;

        while let Some(event) = pending.pop_front() {
            let (delivery, unreachable) = self.fan_out(&event).await;
            requested.get_or_insert(delivery);

            for session in unreachable {
                if let Some(session) = self.registry.deregister(session.id()) {
                    warn!(
                        session = session.id(),
                        name = session.name(),
                        peer = ?session.peer(),
                        "evicting unreachable participant"
                    );
                    session.close().await;
                    pending.push_back(BroadcastEvent::system(left_notice(session.name())));
                }
            }
        }

        requested.unwrap_or_default()
    }

    /// Removes a session and announces it left, unless it was already gone.
    ///
    /// Returns whether this call removed the session.
    pub async fn depart(&self, id: SessionId) -> bool {
        let Some(session) = self.registry.deregister(id) else {
            return false;
        };

        session.close().await;
        info!(
            session = session.id(),
            name = session.name(),
            peer = ?session.peer(),
            "participant left"
        );
        self.broadcast(BroadcastEvent::system(left_notice(session.name())))
            .await;
        true
    }

    async fn fan_out(&self, event: &BroadcastEvent) -> (Delivery, Vec<Arc<Session>>) {
        let frame = match Frame::encode(&event.payload) {
            Ok(frame) => frame,
            Err(error) => {
                warn!(%error, origin = ?event.origin, "dropping unencodable broadcast");
                return (Delivery::default(), Vec::new());
            }
        };

        let recipients: Vec<_> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|session| !event.exclude.contains(&session.id()))
            .collect();

        let results = join_all(
            recipients
                .iter()
                .map(|session| self.send_to(session, &frame)),
        )
        .await;

        let mut delivery = Delivery::default();
        let mut unreachable = Vec::new();
        for (session, result) in recipients.into_iter().zip(results) {
            match result {
                Ok(()) => delivery.delivered += 1,
                Err(error) => {
                    debug!(session = session.id(), %error, "failed to deliver frame");
                    delivery.failed += 1;
                    unreachable.push(session);
                }
            }
        }

        (delivery, unreachable)
    }

    async fn send_to(&self, session: &Session, frame: &Frame) -> RelayResult<()> {
        match timeout(self.send_timeout, session.send(frame)).await {
            Ok(result) => result,
            Err(_) => Err(RelayError::WriteFailed(io::Error::new(
                io::ErrorKind::TimedOut,
                "send timed out",
            ))),
        }
    }
}
