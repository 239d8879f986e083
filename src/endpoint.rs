//! Facade over the backing AMQP 0-9-1 channel
//!
//! 1.0 frame         backing operation
//! ==========================================================
//! begin             basic.qos
//! attach (sender)   [confirm.select]
//! attach (receiver) queue/exchange.declare, queue.bind,
//!                   basic.consume
//! transfer          basic.publish
//! flow              basic.credit
//! disposition       basic.ack / basic.reject
//! ----------------------------------------------------------
//! Passive declares and binds go through a second, lazily
//! opened declaring channel so their failure replies cannot
//! poison the data path.

use async_trait::async_trait;
use bytes::Bytes;

use crate::Payload;

/// Channel number assigned by the peer at session begin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IncomingChannel(pub u16);

impl From<IncomingChannel> for u16 {
    fn from(channel: IncomingChannel) -> Self {
        channel.0
    }
}

/// Consumer tag passed to `basic.consume` and echoed on every delivery.
///
/// The session encodes the link handle into the tag (see
/// [`crate::link::encode_consumer_tag`]), so the tag bytes are not
/// necessarily valid UTF-8.
pub type ConsumerTag = Bytes;

/// 0-9-1 basic properties carried on a publish
///
/// Only the fields the bridge maps from the 1.0 header/properties sections.
/// Everything else travels inside the payload, which remains the encoded
/// bare 1.0 message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerProperties {
    /// Persistent delivery mode when true
    pub durable: bool,
    /// Message priority, 0-9
    pub priority: Option<u8>,
    /// Per-message TTL in milliseconds
    pub expiration: Option<u32>,
    /// MIME content type
    pub content_type: Option<String>,
    /// MIME content encoding
    pub content_encoding: Option<String>,
    /// Application message identifier
    pub message_id: Option<String>,
    /// Application correlation identifier
    pub correlation_id: Option<String>,
    /// Address to reply to
    pub reply_to: Option<String>,
}

/// A `basic.publish` operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerPublish {
    /// Exchange to publish to; empty means the default exchange
    pub exchange: String,
    /// Routing key the exchange routes on
    pub routing_key: String,
    /// Mapped 0-9-1 properties
    pub properties: BrokerProperties,
    /// The encoded bare 1.0 message
    pub payload: Payload,
}

/// A `basic.deliver` pushed by the broker
///
/// The subscription glue has already re-encoded the message as a bare 1.0
/// message, so `payload` is ready to ship in a transfer frame.
#[derive(Debug, Clone)]
pub struct BrokerDelivery {
    /// Tag of the consumer the delivery arrived on
    pub consumer_tag: ConsumerTag,
    /// Channel-scoped delivery tag used for ack/reject
    pub delivery_tag: u64,
    /// The message, already encoded as a bare 1.0 message
    pub payload: Payload,
}

/// A `basic.credit_state` notification for one consumer
#[derive(Debug, Clone)]
pub struct CreditState {
    /// Tag of the consumer the notification is about
    pub consumer_tag: ConsumerTag,
    /// Remaining per-consumer credit
    pub credit: u32,
    /// Messages available on the queue; -1 when the broker does not know
    pub available: i64,
    /// Whether the consumer is draining
    pub drain: bool,
}

/// Error from the backing channel
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// The backing channel or its connection is gone
    #[error("Backing channel is closed")]
    ChannelClosed,

    /// The broker refused the operation
    #[error("Backing channel error: {0}")]
    Channel(String),
}

/// Error from a declare or bind on the declaring channel
#[derive(Debug, thiserror::Error)]
pub enum DeclareError {
    /// Passive declare failed: the named queue or exchange does not exist
    #[error("Queue or exchange not found")]
    NotFound,

    /// The channel itself failed
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// The data-path half of the backing channel
///
/// One instance is shared by publish, subscribe, ack, credit and confirm
/// traffic for a session; the order in which its completions are observed is
/// the order the session trusts. Deliveries, publish confirms and
/// credit-state notifications do NOT surface here; they arrive as
/// [`BrokerEvent`](crate::session::BrokerEvent)s on the session inbox.
#[async_trait]
pub trait BackingChannel: Send {
    /// The declaring-channel type opened by [`open_declaring`](Self::open_declaring)
    type Declaring: DeclaringChannel + Send;

    /// `confirm.select`: enable publish confirms on this channel
    async fn confirm_select(&mut self) -> Result<(), BrokerError>;

    /// `basic.qos`: bound the number of in-flight deliveries
    async fn basic_qos(&mut self, prefetch_count: u16) -> Result<(), BrokerError>;

    /// `basic.publish`: backpressure-aware cast, no broker reply
    async fn basic_publish(&mut self, publish: BrokerPublish) -> Result<(), BrokerError>;

    /// `basic.consume` with the given initial per-consumer credit
    /// (RabbitMQ `x-credit` consume argument)
    async fn basic_consume(
        &mut self,
        queue: &str,
        consumer_tag: ConsumerTag,
        no_ack: bool,
        initial_credit: u32,
    ) -> Result<(), BrokerError>;

    /// `basic.credit`: top up one consumer. Returns the broker's `available`
    /// count, -1 when unknown.
    async fn basic_credit(
        &mut self,
        consumer_tag: &ConsumerTag,
        credit: u32,
        drain: bool,
    ) -> Result<i64, BrokerError>;

    /// `basic.ack`
    async fn basic_ack(&mut self, delivery_tag: u64, multiple: bool) -> Result<(), BrokerError>;

    /// `basic.reject`
    async fn basic_reject(&mut self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    /// Open a fresh declaring channel on the same connection
    async fn open_declaring(&mut self) -> Result<Self::Declaring, BrokerError>;
}

/// The declare/bind half of the backing transport
///
/// Kept on a channel of its own because a failed passive declare kills the
/// 0-9-1 channel it was issued on. The session drops the instance on the
/// first failure and opens a fresh one on the next attach.
#[async_trait]
pub trait DeclaringChannel: Send {
    /// Passive `queue.declare`
    async fn declare_queue_passive(&mut self, queue: &str) -> Result<(), DeclareError>;

    /// Passive `exchange.declare`
    async fn declare_exchange_passive(&mut self, exchange: &str) -> Result<(), DeclareError>;

    /// Declare a server-named auto-delete queue and return its name
    async fn declare_transient_queue(&mut self) -> Result<String, DeclareError>;

    /// `queue.bind`
    async fn bind_queue(
        &mut self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), DeclareError>;
}
