#![deny(missing_docs, missing_debug_implementations)]

//! AMQP 1.0 session semantics bridged onto an AMQP 0-9-1 backing channel.
//!
//! Peers speak AMQP 1.0; this crate implements the per-session state machine
//! that translates their attach/flow/transfer/disposition exchanges into
//! publishes, consumes, acks, credit updates and reject/requeue operations
//! on a backing 0-9-1 channel, and translates broker-side deliveries,
//! publish confirms and credit notifications back into 1.0 frames.
//!
//! The 1.0 framing codec, the concrete 0-9-1 client and the connection
//! handshake are out of scope: decoded performatives enter and leave through
//! [`tokio::sync::mpsc`] channels, and the backing channel is reached
//! through the [`endpoint::BackingChannel`] trait.
//!
//! # Accepting a session
//!
//! ```rust,ignore
//! use amqp10_bridge::Session;
//!
//! // frames_rx:  decoded 1.0 frames from the connection reader
//! // events_rx:  deliveries/confirms/credit-state from the 0-9-1 glue
//! // frames_tx:  outgoing 1.0 frames toward the connection writer
//! let mut session = Session::accept(channel, frames_rx, events_rx, frames_tx)
//!     .await
//!     .unwrap();
//!
//! session.on_end().await.unwrap();
//! ```
//!
//! # Customize configuration with [`Builder`]
//!
//! ```rust,ignore
//! let mut session = Session::builder()
//!     .max_window(1024)
//!     .accept(channel, frames_rx, events_rx, frames_tx)
//!     .await
//!     .unwrap();
//! ```

pub mod address;
pub mod endpoint;
pub mod link;
pub mod session;

mod serial;

pub mod types {
    //! Re-exporting `fe2o3-amqp-types`
    pub use fe2o3_amqp_types::*;
}

pub use session::{Builder, Session, SessionHandle};

/// Raw payload bytes of a 1.0 message
pub type Payload = bytes::Bytes;
