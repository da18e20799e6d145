//! Local client sessions.
//!
//! Each accepted loopback connection becomes a session: a reader task that
//! parses length-prefixed `AppMessage` records into the service event loop,
//! and a writer task draining the service's outbound queue for that client.
//! The tasks never touch protocol state; a session's state is unwound on
//! the loop when its reader reports closure.

use super::timers::TimerKey;
use super::GcnService;
use crate::app::{self, AppMessage};
use crate::types::GroupId;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Service-local identifier of one client connection.
pub type SessionId = u64;

/// Events a session reader reports into the service loop.
pub(crate) enum SessionEvent {
    Message(SessionId, AppMessage),
    Closed(SessionId),
}

/// The service's half of one client session.
pub(crate) struct SessionHandle {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    tasks: Vec<JoinHandle<()>>,
}

impl SessionHandle {
    /// Queue an already-framed record for the writer task.
    pub(crate) fn send(&self, framed: Vec<u8>) {
        // a dropped receiver means the writer is gone and the reader will
        // report closure shortly
        let _ = self.tx.send(framed);
    }

    pub(crate) fn close(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

impl GcnService {
    /// Register a newly accepted client connection and spawn its I/O tasks.
    pub(crate) fn accept_session(
        &mut self,
        stream: TcpStream,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> SessionId {
        let id = self.alloc_session_id();
        let (mut read_half, mut write_half) = stream.into_split();

        let reader = tokio::spawn(async move {
            loop {
                match app::read_frame(&mut read_half).await {
                    Ok(Some(record)) => match AppMessage::decode(&record) {
                        Ok(msg) => {
                            if events.send(SessionEvent::Message(id, msg)).is_err() {
                                return; // service loop gone
                            }
                        }
                        Err(e) => {
                            debug!(session = id, error = %e, "dropping undecodable app record");
                        }
                    },
                    Ok(None) => break,
                    Err(e) => {
                        debug!(session = id, error = %e, "session read failed");
                        break;
                    }
                }
            }
            let _ = events.send(SessionEvent::Closed(id));
        });

        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let writer = tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                if let Err(e) = write_half.write_all(&bytes).await {
                    warn!(session = id, error = %e, "session write failed");
                    break;
                }
            }
        });

        self.sessions.insert(
            id,
            SessionHandle {
                tx,
                tasks: vec![reader, writer],
            },
        );
        id
    }

    /// Unwind everything a departed client left behind: subscriptions,
    /// source registrations, and their announce timers.
    pub(crate) fn close_session(&mut self, id: SessionId) {
        debug!(session = id, "closing client session");

        self.local_subs.retain(|(_, session)| *session != id);

        let owned: Vec<GroupId> = self
            .announces
            .iter()
            .filter(|(_, info)| info.session == id)
            .map(|(gid, _)| *gid)
            .collect();
        for gid in owned {
            self.timers.cancel(&TimerKey::Announce(gid));
            self.announces.remove(&gid);
            debug!(gid, session = id, "announce unwound on disconnect");
        }

        if let Some(handle) = self.sessions.remove(&id) {
            handle.close();
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn alloc_session_id(&mut self) -> SessionId {
        let id = self.next_session_id;
        self.next_session_id += 1;
        id
    }

    /// Register a session backed by a plain channel instead of a socket.
    /// Used by tests to observe what the service pushes to a client.
    #[cfg(test)]
    pub(crate) fn add_test_session(&mut self) -> (SessionId, mpsc::UnboundedReceiver<Vec<u8>>) {
        let id = self.alloc_session_id();
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions.insert(
            id,
            SessionHandle {
                tx,
                tasks: Vec::new(),
            },
        );
        (id, rx)
    }
}
