//! Protocol walkthrough of the session engine against an in-memory broker

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use amqp10_bridge::{
    endpoint::{
        BackingChannel, BrokerDelivery, BrokerError, BrokerPublish, ConsumerTag, DeclareError,
        DeclaringChannel,
    },
    link::encode_consumer_tag,
    session::{BrokerEvent, SessionFrame, SessionFrameBody},
    Payload, Session,
};
use fe2o3_amqp_types::{
    definitions::{Handle, Role, SenderSettleMode},
    messaging::{
        message::__private::Serializable, Accepted, DeliveryState, Message, Source, Target,
        TargetArchetype,
    },
    performatives::{Attach, Begin, Disposition, End, Flow, Transfer},
};
use serde_amqp::Value;
use serde_bytes::ByteBuf;

#[derive(Debug, Clone, PartialEq)]
enum Op {
    Qos(u16),
    ConfirmSelect,
    Publish { exchange: String, routing_key: String },
    Consume { queue: String, no_ack: bool },
    Credit { credit: u32 },
    Ack { delivery_tag: u64 },
}

#[derive(Debug, Clone, Default)]
struct Broker {
    ops: Arc<Mutex<Vec<Op>>>,
    queues: Arc<Mutex<Vec<String>>>,
}

impl Broker {
    fn with_queue(self, queue: &str) -> Self {
        self.queues.lock().unwrap().push(queue.to_string());
        self
    }

    fn record(&self, op: Op) {
        self.ops.lock().unwrap().push(op);
    }
}

#[async_trait]
impl BackingChannel for Broker {
    type Declaring = Declaring;

    async fn confirm_select(&mut self) -> Result<(), BrokerError> {
        self.record(Op::ConfirmSelect);
        Ok(())
    }

    async fn basic_qos(&mut self, prefetch_count: u16) -> Result<(), BrokerError> {
        self.record(Op::Qos(prefetch_count));
        Ok(())
    }

    async fn basic_publish(&mut self, publish: BrokerPublish) -> Result<(), BrokerError> {
        self.record(Op::Publish {
            exchange: publish.exchange,
            routing_key: publish.routing_key,
        });
        Ok(())
    }

    async fn basic_consume(
        &mut self,
        queue: &str,
        _consumer_tag: ConsumerTag,
        no_ack: bool,
        _initial_credit: u32,
    ) -> Result<(), BrokerError> {
        self.record(Op::Consume {
            queue: queue.to_string(),
            no_ack,
        });
        Ok(())
    }

    async fn basic_credit(
        &mut self,
        _consumer_tag: &ConsumerTag,
        credit: u32,
        _drain: bool,
    ) -> Result<i64, BrokerError> {
        self.record(Op::Credit { credit });
        Ok(0)
    }

    async fn basic_ack(&mut self, delivery_tag: u64, _multiple: bool) -> Result<(), BrokerError> {
        self.record(Op::Ack { delivery_tag });
        Ok(())
    }

    async fn basic_reject(&mut self, _delivery_tag: u64, _requeue: bool) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn open_declaring(&mut self) -> Result<Self::Declaring, BrokerError> {
        Ok(Declaring {
            broker: self.clone(),
        })
    }
}

#[derive(Debug)]
struct Declaring {
    broker: Broker,
}

#[async_trait]
impl DeclaringChannel for Declaring {
    async fn declare_queue_passive(&mut self, queue: &str) -> Result<(), DeclareError> {
        if self.broker.queues.lock().unwrap().iter().any(|q| q == queue) {
            Ok(())
        } else {
            Err(DeclareError::NotFound)
        }
    }

    async fn declare_exchange_passive(&mut self, _exchange: &str) -> Result<(), DeclareError> {
        Err(DeclareError::NotFound)
    }

    async fn declare_transient_queue(&mut self) -> Result<String, DeclareError> {
        Ok("amq.gen-test".to_string())
    }

    async fn bind_queue(
        &mut self,
        _queue: &str,
        _exchange: &str,
        _routing_key: &str,
    ) -> Result<(), DeclareError> {
        Ok(())
    }
}

fn begin_frame() -> SessionFrame {
    SessionFrame::new(
        1u16,
        SessionFrameBody::Begin(Begin {
            remote_channel: None,
            next_outgoing_id: 0,
            incoming_window: 512,
            outgoing_window: 512,
            handle_max: Handle::default(),
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        }),
    )
}

fn sender_attach_frame() -> SessionFrame {
    SessionFrame::new(
        1u16,
        SessionFrameBody::Attach(Attach {
            name: "publisher".to_string(),
            handle: Handle(0),
            role: Role::Sender,
            snd_settle_mode: SenderSettleMode::Mixed,
            rcv_settle_mode: Default::default(),
            source: Some(Box::new(Source::default())),
            target: Some(Box::new(TargetArchetype::Target(Target {
                address: Some("/queue/foo".to_string()),
                ..Default::default()
            }))),
            unsettled: None,
            incomplete_unsettled: false,
            initial_delivery_count: Some(0),
            max_message_size: None,
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        }),
    )
}

fn receiver_attach_frame() -> SessionFrame {
    SessionFrame::new(
        1u16,
        SessionFrameBody::Attach(Attach {
            name: "subscriber".to_string(),
            handle: Handle(1),
            role: Role::Receiver,
            snd_settle_mode: Default::default(),
            rcv_settle_mode: Default::default(),
            source: Some(Box::new(Source {
                address: Some("/queue/bar".to_string()),
                ..Default::default()
            })),
            target: Some(Box::new(TargetArchetype::Target(Target::default()))),
            unsettled: None,
            incomplete_unsettled: false,
            initial_delivery_count: None,
            max_message_size: None,
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        }),
    )
}

fn message_payload() -> Payload {
    let message = Message::builder()
        .value(Value::String("ping".to_string()))
        .build();
    Payload::from(serde_amqp::to_vec(&Serializable(message)).unwrap())
}

fn transfer_frame() -> SessionFrame {
    SessionFrame::new(
        1u16,
        SessionFrameBody::Transfer {
            performative: Transfer {
                handle: Handle(0),
                delivery_id: Some(0),
                delivery_tag: Some(ByteBuf::from(vec![0, 0, 0, 0])),
                message_format: Some(0),
                settled: Some(false),
                more: false,
                rcv_settle_mode: None,
                state: None,
                resume: false,
                aborted: false,
                batchable: false,
            },
            payload: message_payload(),
        },
    )
}

#[tokio::test]
async fn test_session_protocol_walkthrough() {
    let (frames_tx, frames_rx) = mpsc::channel(32);
    let (events_tx, events_rx) = mpsc::channel(32);
    let (out_tx, mut out_rx) = mpsc::channel(32);

    let broker = Broker::default().with_queue("foo").with_queue("bar");
    let ops = broker.ops.clone();

    // the begin is buffered before accept so no task juggling is needed
    frames_tx.send(begin_frame()).await.unwrap();
    let mut session = Session::accept(broker, frames_rx, events_rx, out_tx)
        .await
        .unwrap();

    let reply = out_rx.recv().await.unwrap();
    assert_eq!(reply.channel, 1);
    match reply.body {
        SessionFrameBody::Begin(begin) => {
            assert_eq!(begin.remote_channel, Some(1));
            assert_eq!(begin.incoming_window, 512);
        }
        other => panic!("expected begin, got {:?}", other),
    }
    assert_eq!(ops.lock().unwrap().as_slice(), &[Op::Qos(512)]);

    // publisher link: attach reply plus an initial credit grant
    frames_tx.send(sender_attach_frame()).await.unwrap();
    let reply = out_rx.recv().await.unwrap();
    assert!(matches!(reply.body, SessionFrameBody::Attach(_)));
    let reply = out_rx.recv().await.unwrap();
    match reply.body {
        SessionFrameBody::Flow(flow) => assert_eq!(flow.handle, Some(Handle(0))),
        other => panic!("expected flow, got {:?}", other),
    }

    // peer transfer becomes a publish; the broker confirm comes back as a
    // settled disposition
    frames_tx.send(transfer_frame()).await.unwrap();
    let publish = Op::Publish {
        exchange: String::new(),
        routing_key: "foo".to_string(),
    };
    // frames and broker events ride separate inboxes; wait for the publish
    // to land before confirming it
    while !ops.lock().unwrap().contains(&publish) {
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
    }
    events_tx
        .send(BrokerEvent::Confirm {
            delivery_tag: 1,
            multiple: false,
        })
        .await
        .unwrap();
    let reply = out_rx.recv().await.unwrap();
    match reply.body {
        SessionFrameBody::Disposition(disposition) => {
            assert!(matches!(disposition.role, Role::Sender));
            assert_eq!(disposition.first, 0);
            assert!(disposition.settled);
        }
        other => panic!("expected disposition, got {:?}", other),
    }
    assert!(ops.lock().unwrap().contains(&Op::Publish {
        exchange: String::new(),
        routing_key: "foo".to_string(),
    }));

    // subscriber link: attach, grant credit, receive a delivery
    frames_tx.send(receiver_attach_frame()).await.unwrap();
    let reply = out_rx.recv().await.unwrap();
    assert!(matches!(reply.body, SessionFrameBody::Attach(_)));
    assert!(ops.lock().unwrap().contains(&Op::Consume {
        queue: "bar".to_string(),
        no_ack: false,
    }));

    frames_tx
        .send(SessionFrame::new(
            1u16,
            SessionFrameBody::Flow(Flow {
                next_incoming_id: Some(0),
                incoming_window: 512,
                next_outgoing_id: 1,
                outgoing_window: 512,
                handle: Some(Handle(1)),
                delivery_count: None,
                link_credit: Some(10),
                available: None,
                drain: false,
                echo: false,
                properties: None,
            }),
        ))
        .await
        .unwrap();
    let reply = out_rx.recv().await.unwrap();
    assert!(matches!(reply.body, SessionFrameBody::Flow(_)));
    assert!(ops.lock().unwrap().contains(&Op::Credit { credit: 10 }));

    events_tx
        .send(BrokerEvent::Deliver(BrokerDelivery {
            consumer_tag: encode_consumer_tag(1),
            delivery_tag: 42,
            payload: message_payload(),
        }))
        .await
        .unwrap();
    let reply = out_rx.recv().await.unwrap();
    match reply.body {
        SessionFrameBody::Transfer { performative, .. } => {
            assert_eq!(performative.handle, Handle(1));
            assert_eq!(performative.delivery_id, Some(0));
            assert_eq!(performative.settled, Some(false));
        }
        other => panic!("expected transfer, got {:?}", other),
    }

    // the peer accepts the delivery: broker ack plus settled echo
    frames_tx
        .send(SessionFrame::new(
            1u16,
            SessionFrameBody::Disposition(Disposition {
                role: Role::Receiver,
                first: 0,
                last: None,
                settled: false,
                state: Some(DeliveryState::Accepted(Accepted {})),
                batchable: false,
            }),
        ))
        .await
        .unwrap();
    let reply = out_rx.recv().await.unwrap();
    assert!(matches!(reply.body, SessionFrameBody::Disposition(_)));
    assert!(ops.lock().unwrap().contains(&Op::Ack { delivery_tag: 42 }));

    // peer end: the session echoes and the event loop finishes cleanly
    frames_tx
        .send(SessionFrame::new(
            1u16,
            SessionFrameBody::End(End { error: None }),
        ))
        .await
        .unwrap();
    let reply = out_rx.recv().await.unwrap();
    assert!(matches!(reply.body, SessionFrameBody::End(_)));

    session.on_end().await.unwrap();
}
