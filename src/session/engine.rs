//! The session event loop
//!
//! A single cooperative task owns the [`Session`] and services one inbox
//! message to completion at a time: decoded 1.0 frames from the reader,
//! broker events from the backing channel glue, and control messages from
//! the [`SessionHandle`]. There is no locking; every suspension point is a
//! synchronous call into the backing channel or a write to the outgoing
//! frame channel.

use fe2o3_amqp_types::{
    definitions::{self, AmqpError, SessionError},
    performatives::End,
    states::SessionState,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, instrument, trace};

use crate::endpoint::{BackingChannel, IncomingChannel};

use super::{
    error::{BeginError, Error},
    frame::{
        BrokerEvent, SessionFrame, SessionFrameBody, SessionIncomingItem, SessionOutgoingItem,
    },
    Session, SessionInnerError,
};

#[derive(Debug)]
enum Running {
    Continue,
    Stop,
}

#[derive(Debug)]
pub(crate) enum SessionControl {
    End(Option<definitions::Error>),
}

/// A handle to a running session event loop
///
/// Dropping the handle asks the event loop to end the session.
pub struct SessionHandle {
    pub(crate) control: mpsc::Sender<SessionControl>,
    pub(crate) engine_handle: JoinHandle<Result<(), Error>>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle").finish()
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        let _ = self.control.try_send(SessionControl::End(None));
    }
}

impl SessionHandle {
    /// Checks if the underlying event loop has stopped
    pub fn is_ended(&self) -> bool {
        self.control.is_closed()
    }

    /// End the session
    ///
    /// # Panics
    ///
    /// Panics if called after any of [`end`](#method.end),
    /// [`end_with_error`](#method.end_with_error) or [`on_end`](#method.on_end)
    /// has returned, as the `JoinHandle` would be polled after completion.
    pub async fn end(&mut self) -> Result<(), Error> {
        // If the send fails the event loop has already stopped and the
        // JoinHandle carries the outcome.
        let _ = self.control.send(SessionControl::End(None)).await;
        self.on_end().await
    }

    /// End the session with an error
    ///
    /// # Panics
    ///
    /// Panics under the same conditions as [`end`](#method.end).
    pub async fn end_with_error(
        &mut self,
        error: impl Into<definitions::Error>,
    ) -> Result<(), Error> {
        let _ = self
            .control
            .send(SessionControl::End(Some(error.into())))
            .await;
        self.on_end().await
    }

    /// Returns when the underlying event loop has stopped
    ///
    /// # Panics
    ///
    /// Panics under the same conditions as [`end`](#method.end).
    pub async fn on_end(&mut self) -> Result<(), Error> {
        match (&mut self.engine_handle).await {
            Ok(outcome) => outcome,
            Err(join_error) => Err(Error::JoinError(join_error)),
        }
    }
}

pub(crate) struct SessionEngine<B>
where
    B: BackingChannel,
{
    pub session: Session<B>,
    pub control: mpsc::Receiver<SessionControl>,
    pub incoming: mpsc::Receiver<SessionIncomingItem>,
    pub broker_events: mpsc::Receiver<BrokerEvent>,
    pub outgoing: mpsc::Sender<SessionFrame>,
}

impl<B> SessionEngine<B>
where
    B: BackingChannel + 'static,
{
    /// Waits for the peer's begin, replies, and returns the mapped engine
    pub(crate) async fn begin(
        session: Session<B>,
        control: mpsc::Receiver<SessionControl>,
        incoming: mpsc::Receiver<SessionIncomingItem>,
        broker_events: mpsc::Receiver<BrokerEvent>,
        outgoing: mpsc::Sender<SessionFrame>,
    ) -> Result<Self, BeginError> {
        let mut engine = Self {
            session,
            control,
            incoming,
            broker_events,
            outgoing,
        };

        let frame = engine
            .incoming
            .recv()
            .await
            .ok_or(BeginError::IllegalConnectionState)?;
        let (channel, begin) = match frame {
            SessionFrame {
                channel,
                body: SessionFrameBody::Begin(begin),
            } => (channel, begin),
            _ => return Err(BeginError::IllegalState),
        };

        let reply = engine
            .session
            .on_incoming_begin(IncomingChannel(channel), begin)
            .await?;
        engine
            .outgoing
            .send(SessionFrame::new(channel, SessionFrameBody::Begin(reply)))
            .await
            .map_err(|_| BeginError::IllegalConnectionState)?;
        engine.session.local_state = SessionState::Mapped;

        Ok(engine)
    }

    async fn send_frame(&mut self, frame: SessionFrame) -> Result<(), SessionInnerError> {
        self.outgoing
            .send(frame)
            .await
            // The receiving half must have dropped; the connection writer
            // has stopped
            .map_err(|_| SessionInnerError::IllegalConnectionState)
    }

    async fn send_outgoing_item(
        &mut self,
        item: SessionOutgoingItem,
    ) -> Result<(), SessionInnerError> {
        match item {
            SessionOutgoingItem::SingleFrame(frame) => self.send_frame(frame).await,
            SessionOutgoingItem::MultipleFrames(frames) => {
                for frame in frames {
                    self.send_frame(frame).await?;
                }
                Ok(())
            }
        }
    }

    #[inline]
    async fn on_incoming(
        &mut self,
        incoming: SessionIncomingItem,
    ) -> Result<Running, SessionInnerError> {
        match incoming.body {
            SessionFrameBody::Begin(_) => return Err(SessionInnerError::IllegalState),
            SessionFrameBody::Attach(attach) => {
                let item = self.session.on_incoming_attach(attach).await?;
                self.send_outgoing_item(item).await?;
            }
            SessionFrameBody::Flow(flow) => {
                if let Some(item) = self.session.on_incoming_flow(flow).await? {
                    self.send_outgoing_item(item).await?;
                }
            }
            SessionFrameBody::Transfer {
                performative,
                payload,
            } => {
                if let Some(item) = self
                    .session
                    .on_incoming_transfer(performative, payload)
                    .await?
                {
                    self.send_outgoing_item(item).await?;
                }
            }
            SessionFrameBody::Disposition(disposition) => {
                if let Some(item) = self.session.on_incoming_disposition(disposition).await? {
                    self.send_outgoing_item(item).await?;
                }
            }
            SessionFrameBody::Detach(detach) => {
                let item = self.session.on_incoming_detach(detach)?;
                self.send_outgoing_item(item).await?;
            }
            SessionFrameBody::End(end) => {
                trace!(?end);
                let (reply, remote_error) = self.session.on_incoming_end(end);
                let channel = self.session.channel;
                self.send_frame(SessionFrame::new(channel, SessionFrameBody::End(reply)))
                    .await?;
                self.session.local_state = SessionState::Unmapped;
                if let Some(error) = remote_error {
                    return Err(SessionInnerError::RemoteEndedWithError(error));
                }
            }
        }

        match self.session.local_state {
            SessionState::Unmapped => Ok(Running::Stop),
            _ => Ok(Running::Continue),
        }
    }

    #[inline]
    async fn on_broker_event(&mut self, event: BrokerEvent) -> Result<Running, SessionInnerError> {
        match event {
            BrokerEvent::Deliver(delivery) => {
                if let Some(item) = self.session.on_broker_deliver(delivery).await? {
                    self.send_outgoing_item(item).await?;
                }
            }
            BrokerEvent::Confirm {
                delivery_tag,
                multiple,
            } => {
                if let Some(item) = self.session.on_broker_confirm(delivery_tag, multiple) {
                    self.send_outgoing_item(item).await?;
                }
            }
            BrokerEvent::CreditState(state) => {
                if let Some(item) = self.session.on_broker_credit_state(state) {
                    self.send_outgoing_item(item).await?;
                }
            }
            BrokerEvent::Closed { reason } => {
                return Err(SessionInnerError::BrokerClosed { reason })
            }
        }
        Ok(Running::Continue)
    }

    #[inline]
    async fn on_control(&mut self, control: SessionControl) -> Result<Running, SessionInnerError> {
        trace!(?control);
        match control {
            SessionControl::End(error) => {
                self.send_end(error).await?;
                Ok(Running::Stop)
            }
        }
    }

    async fn send_end(
        &mut self,
        error: Option<definitions::Error>,
    ) -> Result<(), SessionInnerError> {
        self.session.local_state = match self.session.local_state {
            SessionState::EndReceived => SessionState::Unmapped,
            _ => SessionState::EndSent,
        };
        self.session.declaring = None;
        let channel = self.session.channel;
        self.send_frame(SessionFrame::new(
            channel,
            SessionFrameBody::End(End { error }),
        ))
        .await
    }

    async fn on_error(&mut self, kind: &SessionInnerError) -> Running {
        let error = match kind {
            SessionInnerError::UnattachedHandle => Some(definitions::Error::new(
                SessionError::UnattachedHandle,
                None,
                None,
            )),
            SessionInnerError::HandleInUse => {
                Some(definitions::Error::new(SessionError::HandleInUse, None, None))
            }
            SessionInnerError::WindowViolation => Some(definitions::Error::new(
                SessionError::WindowViolation,
                None,
                None,
            )),
            SessionInnerError::InvalidField(description) => Some(definitions::Error::new(
                AmqpError::InvalidField,
                Some(description.clone()),
                None,
            )),
            SessionInnerError::MessageDecode => {
                Some(definitions::Error::new(AmqpError::DecodeError, None, None))
            }
            SessionInnerError::IllegalState => {
                Some(definitions::Error::new(AmqpError::IllegalState, None, None))
            }
            SessionInnerError::Broker(_) | SessionInnerError::BrokerClosed { .. } => {
                Some(definitions::Error::new(AmqpError::InternalError, None, None))
            }
            // the writer is gone, nothing can be sent anymore
            SessionInnerError::IllegalConnectionState => None,
            // the end frame exchange has already happened
            SessionInnerError::RemoteEnded | SessionInnerError::RemoteEndedWithError(_) => {
                return Running::Stop
            }
        };

        if let Some(error) = error {
            let _ = self.send_end(Some(error)).await;
        }
        Running::Stop
    }

    #[instrument(name = "Session::event_loop", skip_all, fields(channel = self.session.channel.0))]
    pub(crate) async fn event_loop(mut self) -> Result<(), Error> {
        let mut outcome = Ok(());
        loop {
            let result = tokio::select! {
                incoming = self.incoming.recv() => {
                    match incoming {
                        Some(incoming) => self.on_incoming(incoming).await,
                        None => {
                            // the reader is gone; only fine once the session
                            // has wound down
                            match self.session.local_state {
                                SessionState::Unmapped
                                | SessionState::EndSent
                                | SessionState::EndReceived => Ok(Running::Stop),
                                _ => Err(SessionInnerError::IllegalConnectionState),
                            }
                        }
                    }
                },
                event = self.broker_events.recv() => {
                    match event {
                        Some(event) => self.on_broker_event(event).await,
                        None => Err(SessionInnerError::BrokerClosed { reason: None }),
                    }
                },
                control = self.control.recv() => {
                    match control {
                        Some(control) => self.on_control(control).await,
                        // every handle is dropped: end the session
                        None => self.on_control(SessionControl::End(None)).await,
                    }
                },
            };

            let running = match result {
                Ok(running) => running,
                Err(inner) => {
                    error!(error = ?inner);
                    let running = self.on_error(&inner).await;
                    outcome = Err(inner);
                    running
                }
            };

            match running {
                Running::Continue => {}
                Running::Stop => break,
            }
        }

        debug!("Stopped");
        outcome.map_err(Error::from)
    }
}
