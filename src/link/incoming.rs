//! Incoming link: the peer is the sender and transfers become publishes

use bytes::{BufMut, BytesMut};
use fe2o3_amqp_types::{
    definitions::{SequenceNo, TransferNumber},
    messaging::{message::DecodeIntoMessage, Message, MessageId},
};
use serde_amqp::Value;

use crate::{address::ResolvedTarget, endpoint::BrokerProperties, serial::serial_add, Payload};

/// State of one peer→broker link
#[derive(Debug)]
pub(crate) struct IncomingLink {
    pub name: String,
    /// Empty means the default exchange
    pub exchange: String,
    /// When `None` the message's Subject routes the publish
    pub routing_key: Option<String>,
    pub delivery_count: SequenceNo,
    /// Link credit granted to the peer on attach and on every replenish
    pub credit_grant: u32,
    /// Credit consumed since the last replenishing flow
    pub credit_used: u32,
    /// Publishes on this link participate in broker confirms
    pub confirms: bool,
    partial: Vec<Payload>,
    partial_delivery_id: Option<TransferNumber>,
    partial_settled: bool,
}

impl IncomingLink {
    pub fn new(name: String, target: ResolvedTarget, confirms: bool, credit_grant: u32) -> Self {
        Self {
            name,
            exchange: target.exchange,
            routing_key: target.routing_key,
            delivery_count: 0,
            credit_grant,
            credit_used: credit_grant / 2,
            confirms,
            partial: Vec::new(),
            partial_delivery_id: None,
            partial_settled: false,
        }
    }

    /// Buffers a `more=true` fragment until the terminating frame arrives.
    /// The delivery id and settled flag of a multi-frame delivery are those
    /// of its first frame.
    pub fn push_fragment(&mut self, delivery_id: TransferNumber, settled: bool, payload: Payload) {
        if self.partial.is_empty() {
            self.partial_delivery_id = Some(delivery_id);
        }
        self.partial_settled |= settled;
        self.partial.push(payload);
    }

    /// Concatenates buffered fragments with the terminating one, in arrival
    /// order. Returns the delivery id, the effective settled flag and the
    /// complete message bytes.
    pub fn assemble(
        &mut self,
        delivery_id: TransferNumber,
        settled: bool,
        last: Payload,
    ) -> (TransferNumber, bool, Payload) {
        let id = self.partial_delivery_id.take().unwrap_or(delivery_id);
        let settled = std::mem::take(&mut self.partial_settled) || settled;
        if self.partial.is_empty() {
            return (id, settled, last);
        }
        let total = self.partial.iter().map(|p| p.len()).sum::<usize>() + last.len();
        let mut buf = BytesMut::with_capacity(total);
        for fragment in self.partial.drain(..) {
            buf.put_slice(&fragment);
        }
        buf.put_slice(&last);
        (id, settled, buf.freeze())
    }

    /// Routing key for one publish: the link's configured key wins over the
    /// message Subject; absent both, the key is empty
    pub fn routing_key_for(&self, subject: Option<&str>) -> String {
        self.routing_key
            .clone()
            .or_else(|| subject.map(str::to_string))
            .unwrap_or_default()
    }

    /// Bookkeeping after a publish. Returns true when the credit-replenish
    /// threshold is hit and a flow frame is due; `credit_used` resets to
    /// half the grant.
    pub fn register_publish(&mut self) -> bool {
        self.delivery_count = serial_add(self.delivery_count, 1);
        self.credit_used -= 1;
        if self.credit_used == 0 {
            self.credit_used = self.credit_grant / 2;
            true
        } else {
            false
        }
    }
}

/// Decodes an assembled payload just far enough to steer the publish
pub(crate) fn decode_message(payload: &Payload) -> Result<Message<Value>, serde_amqp::Error> {
    Value::decode_message_from_reader(serde_amqp::read::SliceReader::new(&payload[..]))
}

pub(crate) fn subject(message: &Message<Value>) -> Option<&str> {
    message
        .properties
        .as_ref()
        .and_then(|properties| properties.subject.as_deref())
}

/// Maps the 1.0 header and properties sections onto 0-9-1 basic properties.
/// The payload itself ships unchanged; this is only what the broker needs to
/// route and expire the message.
pub(crate) fn broker_properties(message: &Message<Value>) -> BrokerProperties {
    let mut mapped = BrokerProperties::default();

    if let Some(header) = &message.header {
        mapped.durable = header.durable;
        mapped.priority = Some(header.priority.0);
        mapped.expiration = header.ttl;
    }

    if let Some(properties) = &message.properties {
        mapped.content_type = properties
            .content_type
            .as_ref()
            .map(|symbol| symbol.as_str().to_string());
        mapped.content_encoding = properties
            .content_encoding
            .as_ref()
            .map(|symbol| symbol.as_str().to_string());
        mapped.message_id = properties.message_id.as_ref().and_then(message_id_string);
        mapped.correlation_id = properties
            .correlation_id
            .as_ref()
            .and_then(message_id_string);
        mapped.reply_to = properties.reply_to.clone();
    }

    mapped
}

fn message_id_string(id: &MessageId) -> Option<String> {
    match id {
        MessageId::String(s) => Some(s.clone()),
        MessageId::Ulong(v) => Some(v.to_string()),
        // uuid/binary ids have no 0-9-1 string form worth inventing
        _ => None,
    }
}
