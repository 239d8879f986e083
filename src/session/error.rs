//! Error types for session operations

use fe2o3_amqp_types::definitions;
use tokio::task::JoinError;

use crate::endpoint::BrokerError;

/// Errors raised inside the event loop. The engine maps them onto 1.0
/// session errors before ending the session.
#[derive(Debug, thiserror::Error)]
pub(crate) enum SessionInnerError {
    /// A frame (other than attach) referenced a handle which is not
    /// currently attached
    #[error("A frame referenced a handle which is not currently attached")]
    UnattachedHandle,

    /// An attach was received using a handle that is already in use
    #[error("An attach was received using a handle that is already in use")]
    HandleInUse,

    /// Session flow-control fields are inconsistent with the local state
    #[error("Session window fields are inconsistent")]
    WindowViolation,

    /// A frame field could not be interpreted (unparseable address, flow
    /// with an unknown handle)
    #[error("Invalid field: {0}")]
    InvalidField(String),

    /// A message payload could not be decoded
    #[error("Message payload could not be decoded")]
    MessageDecode,

    /// Frame arrived in a state that does not allow it
    #[error("Illegal session state")]
    IllegalState,

    /// The frame writer is gone; the connection must have closed
    #[error("Connection must have been closed")]
    IllegalConnectionState,

    /// An operation on the backing channel failed
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// The broker event stream closed without a shutdown notification
    #[error("Backing channel event stream ended: {reason:?}")]
    BrokerClosed { reason: Option<String> },

    /// Remote session ended
    #[error("Remote session ended")]
    RemoteEnded,

    /// Remote session ended with an error
    #[error("Remote ended with error")]
    RemoteEndedWithError(definitions::Error),
}

/// Error while waiting for the peer's begin
#[derive(Debug, thiserror::Error)]
pub enum BeginError {
    /// The first frame from the peer was not a begin
    #[error("Expecting a begin frame")]
    IllegalState,

    /// The reader or writer half is gone
    #[error("Connection must have been closed")]
    IllegalConnectionState,

    /// The backing channel refused the prefetch setup
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Error with session operations, as observed through the
/// [`SessionHandle`](crate::session::SessionHandle)
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A frame (other than attach) referenced a handle which is not
    /// currently attached
    #[error("A frame referenced a handle which is not currently attached")]
    UnattachedHandle,

    /// An attach was received using a handle that is already in use
    #[error("An attach was received using a handle that is already in use")]
    HandleInUse,

    /// Session flow-control fields were inconsistent with the local state
    #[error("Session window fields are inconsistent")]
    WindowViolation,

    /// A frame field could not be interpreted
    #[error("Invalid field: {0}")]
    InvalidField(String),

    /// A message payload could not be decoded
    #[error("Message payload could not be decoded")]
    MessageDecode,

    /// A frame arrived in a state that does not allow it
    #[error("Illegal session state")]
    IllegalState,

    /// The connection must have been closed
    #[error("Connection must have been closed")]
    IllegalConnectionState,

    /// The backing channel failed
    #[error(transparent)]
    Broker(BrokerError),

    /// The backing channel event stream ended
    #[error("Backing channel event stream ended: {reason:?}")]
    BrokerClosed {
        /// Reason given by the backing channel, if any
        reason: Option<String>,
    },

    /// Remote session ended before the local side was done with it
    #[error("Remote session ended")]
    RemoteEnded,

    /// Remote session ended with an error
    #[error("Remote ended with error")]
    RemoteEndedWithError(definitions::Error),

    /// The event loop task panicked or was cancelled
    #[error(transparent)]
    JoinError(JoinError),
}

impl From<SessionInnerError> for Error {
    fn from(error: SessionInnerError) -> Self {
        match error {
            SessionInnerError::UnattachedHandle => Self::UnattachedHandle,
            SessionInnerError::HandleInUse => Self::HandleInUse,
            SessionInnerError::WindowViolation => Self::WindowViolation,
            SessionInnerError::InvalidField(field) => Self::InvalidField(field),
            SessionInnerError::MessageDecode => Self::MessageDecode,
            SessionInnerError::IllegalState => Self::IllegalState,
            SessionInnerError::IllegalConnectionState => Self::IllegalConnectionState,
            SessionInnerError::Broker(err) => Self::Broker(err),
            SessionInnerError::BrokerClosed { reason } => Self::BrokerClosed { reason },
            SessionInnerError::RemoteEnded => Self::RemoteEnded,
            SessionInnerError::RemoteEndedWithError(err) => Self::RemoteEndedWithError(err),
        }
    }
}
