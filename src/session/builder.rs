//! Session builder

use tokio::sync::mpsc;

use crate::endpoint::BackingChannel;

use super::{
    engine::SessionEngine,
    frame::{BrokerEvent, SessionFrame, SessionIncomingItem},
    BeginError, Session, SessionHandle, INCOMING_CREDIT, MAX_SESSION_BUFFER_SIZE,
};

pub(crate) const DEFAULT_SESSION_CONTROL_BUFFER_SIZE: usize = 128;

/// Builder for a bridged [`Session`]
#[derive(Debug, Clone)]
pub struct Builder {
    /// Upper bound applied to the session window proposed by the peer
    pub max_window: u32,

    /// Link credit granted to sending peers at attach
    pub incoming_credit: u32,

    /// Buffer size of the control channel backing the
    /// [`SessionHandle`](super::SessionHandle)
    pub control_buffer_size: usize,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            max_window: MAX_SESSION_BUFFER_SIZE,
            incoming_credit: INCOMING_CREDIT,
            control_buffer_size: DEFAULT_SESSION_CONTROL_BUFFER_SIZE,
        }
    }
}

impl Builder {
    /// Creates a new builder with the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps the session window; values above the implementation maximum are
    /// clamped
    pub fn max_window(mut self, max_window: u32) -> Self {
        self.max_window = max_window.min(MAX_SESSION_BUFFER_SIZE);
        self
    }

    /// Sets the link credit granted to sending peers
    pub fn incoming_credit(mut self, incoming_credit: u32) -> Self {
        self.incoming_credit = incoming_credit;
        self
    }

    /// Waits for the peer's begin on `incoming`, replies on `outgoing`, and
    /// spawns the session event loop
    pub async fn accept<B>(
        self,
        broker: B,
        incoming: mpsc::Receiver<SessionIncomingItem>,
        broker_events: mpsc::Receiver<BrokerEvent>,
        outgoing: mpsc::Sender<SessionFrame>,
    ) -> Result<SessionHandle, BeginError>
    where
        B: BackingChannel + 'static,
    {
        let (control_tx, control_rx) = mpsc::channel(self.control_buffer_size);
        let session = Session::new(broker, self.max_window, self.incoming_credit);
        let engine =
            SessionEngine::begin(session, control_rx, incoming, broker_events, outgoing).await?;
        let engine_handle = tokio::spawn(engine.event_loop());
        Ok(SessionHandle {
            control: control_tx,
            engine_handle,
        })
    }
}
