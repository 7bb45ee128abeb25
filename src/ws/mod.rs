//! WebSocket gateway: session plumbing and wire protocol

pub mod handler;
pub mod protocol;

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::ws::protocol::ServerMsg;

/// Frames delivered to a session's writer task.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// A message serialized by the writer task.
    Msg(ServerMsg),
    /// A pre-serialized frame shared across a room broadcast.
    Frame(Arc<str>),
    /// Close the connection after flushing.
    Close,
}

/// Capability handle for one client session. The match stores this and uses
/// only `emit`/`emit_frame`/`disconnect`; it never touches the transport.
/// Sends are non-blocking so a slow client cannot stall the simulation.
#[derive(Clone)]
pub struct SessionHandle {
    session_id: String,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl SessionHandle {
    pub fn new(session_id: String) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { session_id, tx }, rx)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn emit(&self, msg: ServerMsg) {
        let _ = self.tx.send(Outbound::Msg(msg));
    }

    pub fn emit_frame(&self, frame: Arc<str>) {
        let _ = self.tx.send(Outbound::Frame(frame));
    }

    pub fn disconnect(&self) {
        let _ = self.tx.send(Outbound::Close);
    }
}
