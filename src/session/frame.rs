//! Frame and inbox item types exchanged with the reader, writer and the
//! broker glue

use fe2o3_amqp_types::performatives::{Attach, Begin, Detach, Disposition, End, Flow, Transfer};

use crate::{
    endpoint::{BrokerDelivery, CreditState},
    Payload,
};

/// A 1.0 frame entering or leaving the session
#[derive(Debug)]
pub struct SessionFrame {
    /// Channel number; incoming frames carry the peer's channel, outgoing
    /// frames echo it
    pub channel: u16,
    /// The performative and, for transfers, its payload
    pub body: SessionFrameBody,
}

impl SessionFrame {
    /// Creates a frame on the given channel
    pub fn new(channel: impl Into<u16>, body: SessionFrameBody) -> Self {
        Self {
            channel: channel.into(),
            body,
        }
    }
}

/// Performatives the session understands
#[derive(Debug)]
pub enum SessionFrameBody {
    /// `begin`
    Begin(Begin),
    /// `attach`
    Attach(Attach),
    /// `flow`
    Flow(Flow),
    /// `transfer` with its (possibly partial) payload
    Transfer {
        /// The transfer performative
        performative: Transfer,
        /// Payload bytes carried by this frame
        payload: Payload,
    },
    /// `disposition`
    Disposition(Disposition),
    /// `detach`
    Detach(Detach),
    /// `end`
    End(End),
}

/// Decoded frames pushed by the reader into the session inbox
pub type SessionIncomingItem = SessionFrame;

/// Broker-side events entering the session inbox
#[derive(Debug)]
pub enum BrokerEvent {
    /// `basic.deliver` on one of the session's consumers
    Deliver(BrokerDelivery),

    /// Publish confirm (`basic.ack`) from the broker
    Confirm {
        /// Broker-side publish sequence number being confirmed
        delivery_tag: u64,
        /// Whether everything up to the tag is confirmed at once
        multiple: bool,
    },

    /// `basic.credit_state` for one consumer
    CreditState(CreditState),

    /// The backing channel or its connection is gone
    Closed {
        /// Close reason reported by the transport, if any
        reason: Option<String>,
    },
}

/// One or more frames produced by a single handler invocation
#[derive(Debug)]
pub(crate) enum SessionOutgoingItem {
    SingleFrame(SessionFrame),
    MultipleFrames(Vec<SessionFrame>),
}
