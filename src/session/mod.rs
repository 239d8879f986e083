//! The per-session state machine bridging 1.0 links onto the backing channel
//!
//! One [`Session`] owns the window accounting, the two unsettled maps, the
//! handle-keyed link tables and the declaring channel. It is driven by the
//! [`engine`] one inbox message at a time; nothing else touches its state.

use std::collections::{BTreeMap, HashMap};

use fe2o3_amqp_types::{
    definitions::{self, AmqpError, Handle, Role, SenderSettleMode, SequenceNo, TransferNumber},
    messaging::{
        Accepted, DeliveryState, Outcome, Released, Source, Target, TargetArchetype,
        MESSAGE_FORMAT,
    },
    performatives::{Attach, Begin, Detach, Disposition, End, Flow, Transfer},
    primitives::Array,
    states::SessionState,
};
use serde_bytes::ByteBuf;
use tracing::{debug, trace};

use crate::{
    address::{self, AddressError},
    endpoint::{BackingChannel, BrokerDelivery, BrokerPublish, CreditState, IncomingChannel},
    link::{self, IncomingLink, OutgoingLink},
    serial::{serial_add, serial_le, serial_lt},
    Payload,
};

pub(crate) mod engine;
pub(crate) mod frame;

mod error;
pub(crate) use error::SessionInnerError;
pub use error::{BeginError, Error};

mod builder;
pub use builder::Builder;

pub use engine::SessionHandle;
pub use frame::{BrokerEvent, SessionFrame, SessionFrameBody, SessionIncomingItem};
use frame::SessionOutgoingItem;

/// Upper bound on the session window in either direction
pub const MAX_SESSION_BUFFER_SIZE: u32 = 4096;

/// Link credit granted to sending peers at attach, replenished once half of
/// it has been consumed
pub const INCOMING_CREDIT: u32 = 65_536;

/// A broker delivery shipped to the peer and not yet disposed of
#[derive(Debug, Clone)]
pub(crate) struct UnsettledDelivery {
    /// Broker-side tag for ack/reject
    pub delivery_tag: u64,
    /// Outcome applied if the peer settles without naming one
    pub outcome: Outcome,
}

/// Link-level fields carried on an outgoing flow frame
#[derive(Debug)]
pub(crate) struct LinkFlowFields {
    pub handle: u32,
    pub delivery_count: SequenceNo,
    pub link_credit: u32,
    pub available: Option<u32>,
    pub drain: bool,
}

/// AMQP 1.0 session state bridged onto one backing 0-9-1 channel
pub struct Session<B>
where
    B: BackingChannel,
{
    pub(crate) channel: IncomingChannel,
    pub(crate) local_state: SessionState,

    // window accounting, all modulo-2^32 serial numbers
    pub(crate) initial_outgoing_id: TransferNumber,
    pub(crate) next_outgoing_id: TransferNumber,
    pub(crate) next_incoming_id: TransferNumber,
    pub(crate) max_outgoing_id: TransferNumber,
    pub(crate) window_size: u32,
    pub(crate) max_window: u32,
    pub(crate) incoming_credit: u32,

    /// Broker-side publish counter for confirm correlation; 0 while confirm
    /// mode is off
    pub(crate) next_publish_id: u64,
    /// publish-id → incoming transfer-id, awaiting broker confirm
    pub(crate) incoming_unsettled: BTreeMap<u64, TransferNumber>,
    /// outgoing transfer-id → broker delivery, awaiting peer disposition
    pub(crate) outgoing_unsettled: BTreeMap<TransferNumber, UnsettledDelivery>,

    // peer-handle-keyed link tables; a handle lives in at most one
    pub(crate) incoming_links: HashMap<u32, IncomingLink>,
    pub(crate) outgoing_links: HashMap<u32, OutgoingLink>,

    pub(crate) broker: B,
    pub(crate) declaring: Option<B::Declaring>,
}

impl<B> std::fmt::Debug for Session<B>
where
    B: BackingChannel,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("channel", &self.channel)
            .field("local_state", &self.local_state)
            .field("next_outgoing_id", &self.next_outgoing_id)
            .field("next_incoming_id", &self.next_incoming_id)
            .field("max_outgoing_id", &self.max_outgoing_id)
            .field("window_size", &self.window_size)
            .field("incoming_unsettled", &self.incoming_unsettled.len())
            .field("outgoing_unsettled", &self.outgoing_unsettled.len())
            .finish()
    }
}

impl<B> Session<B>
where
    B: BackingChannel,
{
    /// Creates a builder for a [`Session`]
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Accepts a session begun by the peer with the default configuration
    /// and spawns its event loop
    pub async fn accept(
        broker: B,
        incoming: tokio::sync::mpsc::Receiver<SessionIncomingItem>,
        broker_events: tokio::sync::mpsc::Receiver<BrokerEvent>,
        outgoing: tokio::sync::mpsc::Sender<SessionFrame>,
    ) -> Result<SessionHandle, BeginError>
    where
        B: 'static,
    {
        Builder::new()
            .accept(broker, incoming, broker_events, outgoing)
            .await
    }

    pub(crate) fn new(broker: B, max_window: u32, incoming_credit: u32) -> Self {
        Self {
            channel: IncomingChannel(0),
            local_state: SessionState::Unmapped,
            initial_outgoing_id: 0,
            next_outgoing_id: 0,
            next_incoming_id: 0,
            max_outgoing_id: 0,
            window_size: 0,
            max_window,
            incoming_credit,
            next_publish_id: 0,
            incoming_unsettled: BTreeMap::new(),
            outgoing_unsettled: BTreeMap::new(),
            incoming_links: HashMap::new(),
            outgoing_links: HashMap::new(),
            broker,
            declaring: None,
        }
    }

    fn outgoing_window(&self) -> u32 {
        self.window_size
            .saturating_sub(self.outgoing_unsettled.len() as u32)
    }

    /// Session-level flow fields, carried on every flow this session emits
    fn session_flow(&self, link: Option<LinkFlowFields>) -> Flow {
        let mut flow = Flow {
            next_incoming_id: Some(self.next_incoming_id),
            incoming_window: self.window_size,
            next_outgoing_id: self.next_outgoing_id,
            outgoing_window: self.outgoing_window(),
            handle: None,
            delivery_count: None,
            link_credit: None,
            available: None,
            drain: false,
            echo: false,
            properties: None,
        };
        if let Some(fields) = link {
            flow.handle = Some(Handle(fields.handle));
            flow.delivery_count = Some(fields.delivery_count);
            flow.link_credit = Some(fields.link_credit);
            flow.available = fields.available;
            flow.drain = fields.drain;
        }
        flow
    }

    fn frame(&self, body: SessionFrameBody) -> SessionFrame {
        SessionFrame::new(self.channel, body)
    }

    /// Reacting to the peer's begin. Returns the begin to reply with; the
    /// engine transitions the state to Mapped once it is written.
    pub(crate) async fn on_incoming_begin(
        &mut self,
        channel: IncomingChannel,
        begin: Begin,
    ) -> Result<Begin, BeginError> {
        match self.local_state {
            SessionState::Unmapped => self.local_state = SessionState::BeginReceived,
            _ => return Err(BeginError::IllegalState),
        }

        let window = begin.incoming_window.min(self.max_window);

        // bound in-flight broker deliveries to roughly the session window
        let prefetch = window.min(u16::MAX as u32) as u16;
        self.broker.basic_qos(prefetch).await?;

        self.channel = channel;
        self.next_incoming_id = begin.next_outgoing_id;
        self.max_outgoing_id = serial_add(begin.next_outgoing_id, begin.incoming_window);
        self.window_size = window;

        Ok(Begin {
            remote_channel: Some(channel.0),
            next_outgoing_id: self.next_outgoing_id,
            incoming_window: window,
            outgoing_window: window,
            handle_max: Handle::default(),
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        })
    }

    pub(crate) async fn on_incoming_attach(
        &mut self,
        attach: Attach,
    ) -> Result<SessionOutgoingItem, SessionInnerError> {
        let handle = attach.handle.0;
        if self.incoming_links.contains_key(&handle) || self.outgoing_links.contains_key(&handle) {
            return Err(SessionInnerError::HandleInUse);
        }

        match attach.role {
            Role::Sender => self.attach_incoming_link(attach).await,
            Role::Receiver => self.attach_outgoing_link(attach).await,
        }
    }

    /// Peer is the sender: resolve the target and grant credit
    async fn attach_incoming_link(
        &mut self,
        attach: Attach,
    ) -> Result<SessionOutgoingItem, SessionInnerError> {
        let handle = attach.handle.0;
        let target = match attach.target.as_deref() {
            Some(TargetArchetype::Target(target)) => target.clone(),
            _ => {
                return Err(SessionInnerError::InvalidField(
                    "attach target is missing".to_string(),
                ))
            }
        };

        let resolved = match self.resolve_target_node(&target).await {
            Ok(resolved) => resolved,
            Err(AddressError::NotFound) => {
                return Ok(self.attach_refusal(
                    &attach,
                    Role::Receiver,
                    definitions::Error::new(AmqpError::NotFound, None, None),
                ))
            }
            Err(AddressError::Broker(err)) => {
                debug!(error = %err, "target resolution failed on the backing channel");
                return Ok(self.attach_refusal(
                    &attach,
                    Role::Receiver,
                    definitions::Error::new(AmqpError::InternalError, None, None),
                ));
            }
            Err(err) => return Err(SessionInnerError::InvalidField(err.to_string())),
        };

        // settled senders never see confirms; everything else does
        let confirms = !matches!(attach.snd_settle_mode, SenderSettleMode::Settled);
        if confirms && self.next_publish_id == 0 {
            self.broker.confirm_select().await?;
            self.next_publish_id = 1;
        }

        let mut reply_target = target.clone();
        if let Some(queue) = &resolved.queue {
            reply_target.address = Some(address::queue_address(queue));
        }

        let mut incoming_link = IncomingLink::new(
            attach.name.clone(),
            resolved,
            confirms,
            self.incoming_credit,
        );
        incoming_link.delivery_count = attach.initial_delivery_count.unwrap_or(0);
        let delivery_count = incoming_link.delivery_count;
        self.incoming_links.insert(handle, incoming_link);

        let reply = Attach {
            name: attach.name,
            handle: attach.handle,
            role: Role::Receiver,
            snd_settle_mode: attach.snd_settle_mode,
            rcv_settle_mode: Default::default(),
            source: attach.source,
            target: Some(Box::new(TargetArchetype::Target(reply_target))),
            unsettled: None,
            incomplete_unsettled: false,
            // the local side is the receiver
            initial_delivery_count: None,
            max_message_size: None,
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        };
        let flow = self.session_flow(Some(LinkFlowFields {
            handle,
            delivery_count,
            link_credit: self.incoming_credit,
            available: None,
            drain: false,
        }));

        Ok(SessionOutgoingItem::MultipleFrames(vec![
            self.frame(SessionFrameBody::Attach(reply)),
            self.frame(SessionFrameBody::Flow(flow)),
        ]))
    }

    /// Peer is the receiver: resolve the source and subscribe
    async fn attach_outgoing_link(
        &mut self,
        attach: Attach,
    ) -> Result<SessionOutgoingItem, SessionInnerError> {
        let handle = attach.handle.0;
        let source = match attach.source.as_deref() {
            Some(source) => source.clone(),
            None => {
                return Err(SessionInnerError::InvalidField(
                    "attach source is missing".to_string(),
                ))
            }
        };

        let negotiated = match link::negotiate_outcomes(&source) {
            Ok(negotiated) => negotiated,
            Err(err) => {
                return Ok(self.attach_refusal(
                    &attach,
                    Role::Sender,
                    definitions::Error::new(
                        AmqpError::NotImplemented,
                        Some(err.to_string()),
                        None,
                    ),
                ))
            }
        };

        let resolved = match self.resolve_source_node(&source).await {
            Ok(resolved) => resolved,
            Err(AddressError::NotFound) => {
                return Ok(self.attach_refusal(
                    &attach,
                    Role::Sender,
                    definitions::Error::new(AmqpError::NotFound, None, None),
                ))
            }
            Err(AddressError::Broker(err)) => {
                debug!(error = %err, "source resolution failed on the backing channel");
                return Ok(self.attach_refusal(
                    &attach,
                    Role::Sender,
                    definitions::Error::new(AmqpError::InternalError, None, None),
                ));
            }
            Err(err) => return Err(SessionInnerError::InvalidField(err.to_string())),
        };

        let no_ack = negotiated.no_ack();
        let consumer_tag = link::encode_consumer_tag(handle);

        // per-consumer credit starts at zero; the peer's first flow opens it
        if let Err(err) = self
            .broker
            .basic_consume(&resolved.queue, consumer_tag.clone(), no_ack, 0)
            .await
        {
            debug!(error = %err, queue = %resolved.queue, "basic.consume failed");
            return Ok(self.attach_refusal(
                &attach,
                Role::Sender,
                definitions::Error::new(AmqpError::InternalError, None, None),
            ));
        }

        let mut reply_source = source.clone();
        reply_source.default_outcome = Some(negotiated.default_outcome.clone());
        reply_source.outcomes = Some(Array::from(link::supported_outcomes()));
        reply_source.distribution_mode = Some(resolved.distribution_mode.clone());
        if let Some(queue) = &resolved.dynamic_queue {
            reply_source.address = Some(address::queue_address(queue));
        }

        let outgoing_link = OutgoingLink::new(
            attach.name.clone(),
            resolved.queue,
            consumer_tag,
            no_ack,
            negotiated.default_outcome,
        );
        self.outgoing_links.insert(handle, outgoing_link);

        let reply = Attach {
            name: attach.name,
            handle: attach.handle,
            role: Role::Sender,
            snd_settle_mode: if no_ack {
                SenderSettleMode::Settled
            } else {
                SenderSettleMode::Unsettled
            },
            rcv_settle_mode: attach.rcv_settle_mode,
            source: Some(Box::new(reply_source)),
            target: attach.target,
            unsettled: None,
            incomplete_unsettled: false,
            initial_delivery_count: Some(0),
            max_message_size: None,
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        };

        Ok(SessionOutgoingItem::SingleFrame(
            self.frame(SessionFrameBody::Attach(reply)),
        ))
    }

    /// Attach could not be honored: echo an attach with empty linkage, then
    /// close the link with a detach carrying the error
    fn attach_refusal(
        &self,
        attach: &Attach,
        local_role: Role,
        error: definitions::Error,
    ) -> SessionOutgoingItem {
        let initial_delivery_count = match local_role {
            Role::Sender => Some(0),
            Role::Receiver => None,
        };
        let reply = Attach {
            name: attach.name.clone(),
            handle: attach.handle.clone(),
            role: local_role,
            snd_settle_mode: Default::default(),
            rcv_settle_mode: Default::default(),
            source: None,
            target: None,
            unsettled: None,
            incomplete_unsettled: false,
            initial_delivery_count,
            max_message_size: None,
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        };
        let detach = Detach {
            handle: attach.handle.clone(),
            closed: true,
            error: Some(error),
        };
        SessionOutgoingItem::MultipleFrames(vec![
            self.frame(SessionFrameBody::Attach(reply)),
            self.frame(SessionFrameBody::Detach(detach)),
        ])
    }

    async fn take_declaring(&mut self) -> Result<B::Declaring, AddressError> {
        match self.declaring.take() {
            Some(channel) => Ok(channel),
            None => self
                .broker
                .open_declaring()
                .await
                .map_err(AddressError::Broker),
        }
    }

    async fn resolve_target_node(
        &mut self,
        target: &Target,
    ) -> Result<address::ResolvedTarget, AddressError> {
        let parsed = if target.dynamic {
            if target.address.is_some() {
                return Err(AddressError::BothDynamicAndAddress);
            }
            None
        } else {
            let addr = target
                .address
                .as_deref()
                .ok_or(AddressError::UnknownAddress)?;
            Some(address::parse_target(addr)?)
        };

        let mut declaring = self.take_declaring().await?;
        let result = match &parsed {
            Some(parsed) => address::resolve_target(&mut declaring, parsed).await,
            None => address::resolve_dynamic_target(&mut declaring).await,
        };
        // a failure reply poisons the declaring channel; reopen lazily
        if result.is_ok() {
            self.declaring = Some(declaring);
        }
        result
    }

    async fn resolve_source_node(
        &mut self,
        source: &Source,
    ) -> Result<address::ResolvedSource, AddressError> {
        let parsed = if source.dynamic {
            if source.address.is_some() {
                return Err(AddressError::BothDynamicAndAddress);
            }
            None
        } else {
            let addr = source
                .address
                .as_deref()
                .ok_or(AddressError::UnknownAddress)?;
            Some(address::parse_source(addr)?)
        };

        let mut declaring = self.take_declaring().await?;
        let result = match &parsed {
            Some(parsed) => address::resolve_source(&mut declaring, parsed).await,
            None => address::resolve_dynamic_source(&mut declaring).await,
        };
        if result.is_ok() {
            self.declaring = Some(declaring);
        }
        result
    }

    pub(crate) async fn on_incoming_flow(
        &mut self,
        flow: Flow,
    ) -> Result<Option<SessionOutgoingItem>, SessionInnerError> {
        // the peer's next-outgoing-id must line up with what we have seen
        if flow.next_outgoing_id != self.next_incoming_id {
            return Err(SessionInnerError::WindowViolation);
        }
        match flow.next_incoming_id {
            Some(next_incoming) => {
                if !serial_le(next_incoming, self.next_outgoing_id) {
                    return Err(SessionInnerError::WindowViolation);
                }
                self.max_outgoing_id = serial_add(next_incoming, flow.incoming_window);
            }
            None => {
                self.max_outgoing_id =
                    serial_add(self.initial_outgoing_id, flow.incoming_window);
            }
        }

        let handle = match &flow.handle {
            Some(handle) => handle.0,
            None => return Ok(None),
        };

        if let Some(outgoing_link) = self.outgoing_links.get(&handle) {
            let consumer_tag = outgoing_link.consumer_tag.clone();
            let transfer_count = outgoing_link.transfer_count;
            let credit = flow.link_credit.unwrap_or(0);
            let drain = flow.drain;

            let available = self
                .broker
                .basic_credit(&consumer_tag, credit, drain)
                .await?;
            if available < 0 {
                // backlog unknown; nothing useful to echo
                return Ok(None);
            }
            let reply = self.session_flow(Some(LinkFlowFields {
                handle,
                delivery_count: transfer_count,
                link_credit: credit,
                available: Some(available as u32),
                drain,
            }));
            Ok(Some(SessionOutgoingItem::SingleFrame(
                self.frame(SessionFrameBody::Flow(reply)),
            )))
        } else if self.incoming_links.contains_key(&handle) {
            // informational: credit toward the peer is managed locally
            Ok(None)
        } else {
            Err(SessionInnerError::InvalidField(format!(
                "flow names unattached handle {}",
                handle
            )))
        }
    }

    pub(crate) async fn on_incoming_transfer(
        &mut self,
        transfer: Transfer,
        payload: Payload,
    ) -> Result<Option<SessionOutgoingItem>, SessionInnerError> {
        // the implicit transfer-id of this frame
        let frame_id = self.next_incoming_id;
        self.next_incoming_id = serial_add(self.next_incoming_id, 1);

        let handle = transfer.handle.0;
        let incoming_link = self
            .incoming_links
            .get_mut(&handle)
            .ok_or(SessionInnerError::UnattachedHandle)?;

        let candidate_id = transfer.delivery_id.unwrap_or(frame_id);
        let frame_settled = transfer.settled.unwrap_or(false);

        if transfer.more {
            incoming_link.push_fragment(candidate_id, frame_settled, payload);
            return Ok(None);
        }

        let (transfer_id, settled, message_bytes) =
            incoming_link.assemble(candidate_id, frame_settled, payload);
        let message = link::decode_message(&message_bytes)
            .map_err(|_| SessionInnerError::MessageDecode)?;

        let routing_key = incoming_link.routing_key_for(link::subject(&message));
        let exchange = incoming_link.exchange.clone();
        let properties = link::broker_properties(&message);
        let confirms = incoming_link.confirms;
        let flow_due = incoming_link.register_publish();
        let delivery_count = incoming_link.delivery_count;
        let credit_grant = incoming_link.credit_grant;

        self.broker
            .basic_publish(BrokerPublish {
                exchange,
                routing_key,
                properties,
                payload: message_bytes,
            })
            .await?;

        if confirms {
            let publish_id = self.next_publish_id;
            self.next_publish_id += 1;
            // pre-settled transfers are counted but not tracked: the broker
            // numbers every publish on a confirm-selected channel
            if !settled {
                self.incoming_unsettled.insert(publish_id, transfer_id);
            }
        }

        if flow_due {
            let flow = self.session_flow(Some(LinkFlowFields {
                handle,
                delivery_count,
                link_credit: credit_grant,
                available: None,
                drain: false,
            }));
            return Ok(Some(SessionOutgoingItem::SingleFrame(
                self.frame(SessionFrameBody::Flow(flow)),
            )));
        }
        Ok(None)
    }

    /// The peer (as receiver) is disposing of outgoing transfers
    pub(crate) async fn on_incoming_disposition(
        &mut self,
        disposition: Disposition,
    ) -> Result<Option<SessionOutgoingItem>, SessionInnerError> {
        if let Role::Sender = disposition.role {
            // settlement of incoming transfers is driven by broker confirms
            return Ok(None);
        }

        let first = disposition.first;
        let last = disposition.last.unwrap_or(first);

        let (lwm, hwm) = match (
            self.outgoing_unsettled.keys().next().copied(),
            self.outgoing_unsettled.keys().next_back().copied(),
        ) {
            (Some(lwm), Some(hwm)) => (lwm, hwm),
            _ => return Ok(None),
        };
        if serial_lt(last, lwm) || serial_lt(hwm, first) {
            // ids we no longer track; the peer is allowed to dispose of them
            return Ok(None);
        }
        let lo = if serial_lt(first, lwm) { lwm } else { first };
        let hi = if serial_lt(hwm, last) { hwm } else { last };

        let mut transfer_id = lo;
        loop {
            if let Some(unsettled) = self.outgoing_unsettled.remove(&transfer_id) {
                let outcome = match &disposition.state {
                    Some(DeliveryState::Accepted(accepted)) => {
                        Outcome::Accepted(accepted.clone())
                    }
                    Some(DeliveryState::Rejected(rejected)) => {
                        Outcome::Rejected(rejected.clone())
                    }
                    Some(DeliveryState::Released(released)) => {
                        Outcome::Released(released.clone())
                    }
                    // modified is outside the supported set; requeue like released
                    Some(DeliveryState::Modified(_)) => Outcome::Released(Released {}),
                    _ => unsettled.outcome.clone(),
                };
                match outcome {
                    Outcome::Accepted(_) => {
                        self.broker
                            .basic_ack(unsettled.delivery_tag, false)
                            .await?;
                    }
                    Outcome::Rejected(_) => {
                        self.broker
                            .basic_reject(unsettled.delivery_tag, false)
                            .await?;
                    }
                    _ => {
                        self.broker
                            .basic_reject(unsettled.delivery_tag, true)
                            .await?;
                    }
                }
            }
            if transfer_id == hi {
                break;
            }
            transfer_id = serial_add(transfer_id, 1);
        }

        if disposition.settled {
            return Ok(None);
        }
        let echo = Disposition {
            role: Role::Sender,
            first,
            last: Some(last),
            settled: true,
            state: disposition.state,
            batchable: false,
        };
        Ok(Some(SessionOutgoingItem::SingleFrame(
            self.frame(SessionFrameBody::Disposition(echo)),
        )))
    }

    /// Broker confirmed publishes up to `delivery_tag`. Confirms arrive in
    /// publish order, so everything at or below the tag is settled in one
    /// sweep whether or not `multiple` is set.
    pub(crate) fn on_broker_confirm(
        &mut self,
        delivery_tag: u64,
        multiple: bool,
    ) -> Option<SessionOutgoingItem> {
        let _ = multiple;
        let mut settled_ids = Vec::new();
        while let Some((&publish_id, &transfer_id)) = self.incoming_unsettled.first_key_value() {
            if publish_id > delivery_tag {
                break;
            }
            self.incoming_unsettled.pop_first();
            settled_ids.push(transfer_id);
        }

        let first = *settled_ids.first()?;
        let last = *settled_ids.last()?;
        let disposition = Disposition {
            role: Role::Sender,
            first,
            last: Some(last),
            settled: true,
            state: Some(DeliveryState::Accepted(Accepted {})),
            batchable: false,
        };
        Some(SessionOutgoingItem::SingleFrame(
            self.frame(SessionFrameBody::Disposition(disposition)),
        ))
    }

    pub(crate) async fn on_broker_deliver(
        &mut self,
        delivery: BrokerDelivery,
    ) -> Result<Option<SessionOutgoingItem>, SessionInnerError> {
        let handle = match link::decode_consumer_tag(&delivery.consumer_tag) {
            Some(handle) => handle,
            None => {
                trace!("delivery on a foreign consumer tag, dropping");
                return Ok(None);
            }
        };
        let outgoing_link = match self.outgoing_links.get_mut(&handle) {
            Some(outgoing_link) => outgoing_link,
            None => {
                // detach raced the delivery; the ack mode is unknowable
                trace!(handle, "delivery for a detached link, dropping");
                return Ok(None);
            }
        };

        let transfer_id = self.next_outgoing_id;
        let admitted = serial_lt(transfer_id, self.max_outgoing_id)
            && (self.outgoing_unsettled.len() as u32) < self.window_size;
        if !admitted {
            if outgoing_link.no_ack {
                // the peer shrank the window under a no-ack consumer; the
                // broker has already forgotten the delivery
                debug!(handle, tag = delivery.delivery_tag, "window full, dropping");
                return Ok(None);
            }
            self.broker
                .basic_reject(delivery.delivery_tag, true)
                .await?;
            return Ok(None);
        }

        let no_ack = outgoing_link.no_ack;
        let default_outcome = outgoing_link.default_outcome.clone();
        outgoing_link.register_transfer();

        let transfer = Transfer {
            handle: Handle(handle),
            delivery_id: Some(transfer_id),
            delivery_tag: Some(ByteBuf::from(delivery.delivery_tag.to_be_bytes().to_vec())),
            message_format: Some(MESSAGE_FORMAT),
            settled: Some(no_ack),
            more: false,
            rcv_settle_mode: None,
            state: None,
            resume: false,
            aborted: false,
            batchable: false,
        };

        if !no_ack {
            self.outgoing_unsettled.insert(
                transfer_id,
                UnsettledDelivery {
                    delivery_tag: delivery.delivery_tag,
                    outcome: default_outcome,
                },
            );
        }
        self.next_outgoing_id = serial_add(self.next_outgoing_id, 1);

        Ok(Some(SessionOutgoingItem::SingleFrame(self.frame(
            SessionFrameBody::Transfer {
                performative: transfer,
                payload: delivery.payload,
            },
        ))))
    }

    pub(crate) fn on_broker_credit_state(
        &mut self,
        state: CreditState,
    ) -> Option<SessionOutgoingItem> {
        let handle = link::decode_consumer_tag(&state.consumer_tag)?;
        let outgoing_link = self.outgoing_links.get(&handle)?;
        let flow = self.session_flow(Some(LinkFlowFields {
            handle,
            delivery_count: outgoing_link.transfer_count,
            link_credit: state.credit,
            available: u32::try_from(state.available).ok(),
            drain: state.drain,
        }));
        Some(SessionOutgoingItem::SingleFrame(
            self.frame(SessionFrameBody::Flow(flow)),
        ))
    }

    pub(crate) fn on_incoming_detach(
        &mut self,
        detach: Detach,
    ) -> Result<SessionOutgoingItem, SessionInnerError> {
        let handle = detach.handle.0;
        // TODO: cancel the backing consumer once the facade grows basic.cancel
        let known = self.incoming_links.remove(&handle).is_some()
            || self.outgoing_links.remove(&handle).is_some();
        if !known {
            return Err(SessionInnerError::UnattachedHandle);
        }
        // unsettled entries for the link stay until dispositions arrive
        let reply = Detach {
            handle: detach.handle,
            closed: detach.closed,
            error: None,
        };
        Ok(SessionOutgoingItem::SingleFrame(
            self.frame(SessionFrameBody::Detach(reply)),
        ))
    }

    /// Peer ended the session. Links die with it; the reply end is written
    /// by the engine.
    pub(crate) fn on_incoming_end(&mut self, end: End) -> (End, Option<definitions::Error>) {
        self.local_state = SessionState::EndReceived;
        self.declaring = None;
        self.incoming_links.clear();
        self.outgoing_links.clear();
        (End { error: None }, end.error)
    }
}
