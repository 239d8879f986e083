//! Address grammar and node resolution
//!
//! ```text
//! target  := "/queue" | "/queue/" NAME | "/exchange/" NAME [ "/" ROUTING_KEY ]
//! source  := "/queue/" NAME | "/exchange/" NAME "/" ROUTING_KEY
//! ```
//!
//! Names and routing keys are opaque; the only structure is the `/`-split
//! shown above. Resolution asserts named nodes with passive declares on the
//! declaring channel and materializes dynamic nodes as server-named
//! auto-delete queues.

use fe2o3_amqp_types::messaging::DistributionMode;

use crate::endpoint::{BrokerError, DeclareError, DeclaringChannel};

/// Parsed form of a target address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddress {
    /// `/queue` — routed through the default exchange with the per-message
    /// Subject as routing key, or `/queue/NAME` with a fixed routing key
    Queue(Option<String>),

    /// `/exchange/NAME` or `/exchange/NAME/ROUTING_KEY`
    Exchange {
        /// Exchange name
        name: String,
        /// Fixed routing key; absent for the two-segment form
        routing_key: Option<String>,
    },
}

/// Parsed form of a source address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceAddress {
    /// `/queue/NAME`
    Queue(String),

    /// `/exchange/NAME/ROUTING_KEY`
    Exchange {
        /// Exchange name
        name: String,
        /// Binding key for the private subscription queue
        routing_key: String,
    },
}

/// Where publishes for an incoming link go
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ResolvedTarget {
    /// Empty means the default exchange
    pub exchange: String,
    /// When `None` the message's Subject is used at publish time
    pub routing_key: Option<String>,
    /// Server-named queue backing a dynamic target
    pub queue: Option<String>,
}

/// What an outgoing link subscribes to
#[derive(Debug, Clone)]
pub(crate) struct ResolvedSource {
    pub queue: String,
    /// *move* for queue sources, *copy* for exchange sources
    pub distribution_mode: DistributionMode,
    /// Server-named queue backing a dynamic source
    pub dynamic_queue: Option<String>,
}

/// Address parse or resolution error
#[derive(Debug, thiserror::Error)]
pub enum AddressError {
    /// The address does not match the grammar
    #[error("Unrecognized address")]
    UnknownAddress,

    /// The attach carried both `dynamic=true` and an address
    #[error("Both dynamic and address supplied")]
    BothDynamicAndAddress,

    /// Passive declare failed for the named queue or exchange
    #[error("Queue or exchange not found")]
    NotFound,

    /// The declaring channel itself failed
    #[error(transparent)]
    Broker(BrokerError),
}

impl From<DeclareError> for AddressError {
    fn from(error: DeclareError) -> Self {
        match error {
            DeclareError::NotFound => Self::NotFound,
            DeclareError::Broker(err) => Self::Broker(err),
        }
    }
}

fn split(address: &str) -> Option<(&str, Vec<&str>)> {
    let mut segments = address.split('/');
    // the leading "/" yields an empty first segment
    match segments.next() {
        Some("") => {}
        _ => return None,
    }
    let kind = segments.next()?;
    Some((kind, segments.collect()))
}

/// Parses a target address
pub fn parse_target(address: &str) -> Result<TargetAddress, AddressError> {
    match split(address) {
        Some(("queue", rest)) => match rest[..] {
            [] => Ok(TargetAddress::Queue(None)),
            [name] if !name.is_empty() => Ok(TargetAddress::Queue(Some(name.to_string()))),
            _ => Err(AddressError::UnknownAddress),
        },
        Some(("exchange", rest)) => match rest[..] {
            [name] if !name.is_empty() => Ok(TargetAddress::Exchange {
                name: name.to_string(),
                routing_key: None,
            }),
            [name, ..] if !name.is_empty() => Ok(TargetAddress::Exchange {
                name: name.to_string(),
                routing_key: Some(rest[1..].join("/")),
            }),
            _ => Err(AddressError::UnknownAddress),
        },
        _ => Err(AddressError::UnknownAddress),
    }
}

/// Parses a source address
pub fn parse_source(address: &str) -> Result<SourceAddress, AddressError> {
    match parse_target(address)? {
        TargetAddress::Queue(Some(name)) => Ok(SourceAddress::Queue(name)),
        TargetAddress::Exchange {
            name,
            routing_key: Some(routing_key),
        } => Ok(SourceAddress::Exchange { name, routing_key }),
        // bare "/queue" and "/exchange/N" are target-only forms
        _ => Err(AddressError::UnknownAddress),
    }
}

/// Renders the address of a queue node, e.g. for dynamic attach replies
pub fn queue_address(queue: &str) -> String {
    format!("/queue/{}", queue)
}

pub(crate) async fn resolve_target<D>(
    declaring: &mut D,
    target: &TargetAddress,
) -> Result<ResolvedTarget, AddressError>
where
    D: DeclaringChannel,
{
    match target {
        TargetAddress::Queue(None) => Ok(ResolvedTarget {
            exchange: String::new(),
            routing_key: None,
            queue: None,
        }),
        TargetAddress::Queue(Some(name)) => {
            declaring.declare_queue_passive(name).await?;
            Ok(ResolvedTarget {
                exchange: String::new(),
                routing_key: Some(name.clone()),
                queue: None,
            })
        }
        TargetAddress::Exchange { name, routing_key } => {
            declaring.declare_exchange_passive(name).await?;
            Ok(ResolvedTarget {
                exchange: name.clone(),
                routing_key: routing_key.clone(),
                queue: None,
            })
        }
    }
}

/// Materializes a dynamic target as an auto-delete queue reached through the
/// default exchange
pub(crate) async fn resolve_dynamic_target<D>(
    declaring: &mut D,
) -> Result<ResolvedTarget, AddressError>
where
    D: DeclaringChannel,
{
    let queue = declaring.declare_transient_queue().await?;
    Ok(ResolvedTarget {
        exchange: String::new(),
        routing_key: Some(queue.clone()),
        queue: Some(queue),
    })
}

pub(crate) async fn resolve_source<D>(
    declaring: &mut D,
    source: &SourceAddress,
) -> Result<ResolvedSource, AddressError>
where
    D: DeclaringChannel,
{
    match source {
        SourceAddress::Queue(name) => {
            declaring.declare_queue_passive(name).await?;
            Ok(ResolvedSource {
                queue: name.clone(),
                distribution_mode: DistributionMode::Move,
                dynamic_queue: None,
            })
        }
        SourceAddress::Exchange { name, routing_key } => {
            // a private auto-delete queue carries the subscription
            declaring.declare_exchange_passive(name).await?;
            let queue = declaring.declare_transient_queue().await?;
            declaring.bind_queue(&queue, name, routing_key).await?;
            Ok(ResolvedSource {
                queue,
                distribution_mode: DistributionMode::Copy,
                dynamic_queue: None,
            })
        }
    }
}

/// Materializes a dynamic source. No binding happens here; the peer binds
/// through a later attach if it wants exchange traffic.
pub(crate) async fn resolve_dynamic_source<D>(
    declaring: &mut D,
) -> Result<ResolvedSource, AddressError>
where
    D: DeclaringChannel,
{
    let queue = declaring.declare_transient_queue().await?;
    Ok(ResolvedSource {
        queue: queue.clone(),
        distribution_mode: DistributionMode::Move,
        dynamic_queue: Some(queue),
    })
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::endpoint::DeclareError;

    #[test]
    fn test_parse_target() {
        assert_eq!(parse_target("/queue").unwrap(), TargetAddress::Queue(None));
        assert_eq!(
            parse_target("/queue/foo").unwrap(),
            TargetAddress::Queue(Some("foo".to_string()))
        );
        assert_eq!(
            parse_target("/exchange/amq.topic").unwrap(),
            TargetAddress::Exchange {
                name: "amq.topic".to_string(),
                routing_key: None,
            }
        );
        assert_eq!(
            parse_target("/exchange/amq.topic/foo.#").unwrap(),
            TargetAddress::Exchange {
                name: "amq.topic".to_string(),
                routing_key: Some("foo.#".to_string()),
            }
        );
    }

    #[test]
    fn test_parse_target_rejects_malformed() {
        for addr in ["", "queue", "/q", "/queue//", "/exchange", "/exchange/"] {
            assert!(parse_target(addr).is_err(), "{:?} should not parse", addr);
        }
    }

    #[test]
    fn test_parse_source_rejects_target_only_forms() {
        assert!(parse_source("/queue").is_err());
        assert!(parse_source("/exchange/amq.direct").is_err());
        assert_eq!(
            parse_source("/queue/bar").unwrap(),
            SourceAddress::Queue("bar".to_string())
        );
    }

    #[test]
    fn test_render_parse_round_trip() {
        for addr in ["/queue/foo", "/exchange/e1/rk", "/queue/amq.gen-abc123"] {
            let parsed = parse_target(addr).unwrap();
            if let TargetAddress::Queue(Some(name)) = &parsed {
                assert_eq!(parse_target(&queue_address(name)).unwrap(), parsed);
            }
        }
    }

    #[derive(Default)]
    struct FakeDeclaring {
        queues: Vec<String>,
        exchanges: Vec<String>,
        bindings: Vec<(String, String, String)>,
        transient: u32,
    }

    #[async_trait]
    impl DeclaringChannel for FakeDeclaring {
        async fn declare_queue_passive(&mut self, queue: &str) -> Result<(), DeclareError> {
            if self.queues.iter().any(|q| q == queue) {
                Ok(())
            } else {
                Err(DeclareError::NotFound)
            }
        }

        async fn declare_exchange_passive(&mut self, exchange: &str) -> Result<(), DeclareError> {
            if self.exchanges.iter().any(|e| e == exchange) {
                Ok(())
            } else {
                Err(DeclareError::NotFound)
            }
        }

        async fn declare_transient_queue(&mut self) -> Result<String, DeclareError> {
            self.transient += 1;
            let name = format!("amq.gen-{}", self.transient);
            self.queues.push(name.clone());
            Ok(name)
        }

        async fn bind_queue(
            &mut self,
            queue: &str,
            exchange: &str,
            routing_key: &str,
        ) -> Result<(), DeclareError> {
            self.bindings.push((
                queue.to_string(),
                exchange.to_string(),
                routing_key.to_string(),
            ));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_resolve_missing_queue_is_not_found() {
        let mut declaring = FakeDeclaring::default();
        let err = resolve_source(&mut declaring, &SourceAddress::Queue("nope".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, AddressError::NotFound));
    }

    #[tokio::test]
    async fn test_resolve_exchange_source_binds_private_queue() {
        let mut declaring = FakeDeclaring {
            exchanges: vec!["amq.topic".to_string()],
            ..Default::default()
        };
        let resolved = resolve_source(
            &mut declaring,
            &SourceAddress::Exchange {
                name: "amq.topic".to_string(),
                routing_key: "foo.#".to_string(),
            },
        )
        .await
        .unwrap();

        assert!(matches!(
            resolved.distribution_mode,
            DistributionMode::Copy
        ));
        assert_eq!(
            declaring.bindings,
            vec![(
                resolved.queue.clone(),
                "amq.topic".to_string(),
                "foo.#".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn test_resolve_dynamic_target_routes_through_default_exchange() {
        let mut declaring = FakeDeclaring::default();
        let resolved = resolve_dynamic_target(&mut declaring).await.unwrap();
        assert_eq!(resolved.exchange, "");
        assert_eq!(resolved.routing_key.as_deref(), resolved.queue.as_deref());
        assert!(declaring.bindings.is_empty());
    }
}
