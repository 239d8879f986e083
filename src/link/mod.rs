//! Per-link state for both directions of the bridge
//!
//! An incoming link carries peer transfers into broker publishes; an
//! outgoing link carries broker deliveries out as transfers. Links hold
//! state only; the session drives them and talks to the backing channel.

use bytes::{BufMut, BytesMut};
use fe2o3_amqp_types::{
    messaging::{Outcome, Released, Source},
    primitives::Symbol,
};

use crate::endpoint::ConsumerTag;

mod incoming;
mod outgoing;

pub(crate) use incoming::{broker_properties, decode_message, subject, IncomingLink};
pub(crate) use outgoing::OutgoingLink;

pub(crate) const SYMBOL_ACCEPTED: &str = "amqp:accepted:list";
pub(crate) const SYMBOL_REJECTED: &str = "amqp:rejected:list";
pub(crate) const SYMBOL_RELEASED: &str = "amqp:released:list";

const CONSUMER_TAG_PREFIX: &[u8] = b"ctag-";

/// Encodes a link handle into the consumer tag used on `basic.consume`
///
/// The encoding is reversible so that broker-origin events (deliveries,
/// credit-state) can be routed back to the link without extra state: a
/// 5-byte prefix followed by the handle in big-endian.
pub fn encode_consumer_tag(handle: u32) -> ConsumerTag {
    let mut buf = BytesMut::with_capacity(CONSUMER_TAG_PREFIX.len() + 4);
    buf.put_slice(CONSUMER_TAG_PREFIX);
    buf.put_u32(handle);
    buf.freeze()
}

/// Recovers the link handle from a consumer tag produced by
/// [`encode_consumer_tag`]
pub fn decode_consumer_tag(tag: &[u8]) -> Option<u32> {
    let rest = tag.strip_prefix(CONSUMER_TAG_PREFIX)?;
    let bytes: [u8; 4] = rest.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

/// The peer proposed an outcome outside `{accepted, rejected, released}`
#[derive(Debug, thiserror::Error)]
#[error("Outcome {0:?} is not implemented")]
pub(crate) struct UnsupportedOutcome(pub String);

/// Result of outcome negotiation at attach time
#[derive(Debug)]
pub(crate) struct NegotiatedOutcomes {
    pub default_outcome: Outcome,
    /// The peer proposed exactly `{accepted}`
    accepted_only: bool,
    /// The peer explicitly asked for an accepted default
    explicit_accepted_default: bool,
}

impl NegotiatedOutcomes {
    /// Consume in auto-ack mode: the broker forgets deliveries at send and
    /// no disposition traffic follows
    pub fn no_ack(&self) -> bool {
        self.accepted_only && self.explicit_accepted_default
    }
}

/// Validates the source's proposed outcomes against the supported set.
///
/// When the peer omits a default the server default is *released*; the
/// default is taken as *accepted* only when the peer names it.
pub(crate) fn negotiate_outcomes(source: &Source) -> Result<NegotiatedOutcomes, UnsupportedOutcome> {
    let supported = [SYMBOL_ACCEPTED, SYMBOL_REJECTED, SYMBOL_RELEASED];

    let mut accepted_only = false;
    if let Some(proposed) = &source.outcomes {
        for symbol in proposed.0.iter() {
            if !supported.contains(&symbol.as_str()) {
                return Err(UnsupportedOutcome(symbol.as_str().to_string()));
            }
        }
        accepted_only = proposed.0.len() == 1 && proposed.0[0].as_str() == SYMBOL_ACCEPTED;
    }

    let (default_outcome, explicit_accepted_default) = match &source.default_outcome {
        None => (Outcome::Released(Released {}), false),
        Some(outcome @ Outcome::Accepted(_)) => (outcome.clone(), true),
        Some(outcome @ (Outcome::Rejected(_) | Outcome::Released(_))) => (outcome.clone(), false),
        Some(other) => return Err(UnsupportedOutcome(format!("{:?}", other))),
    };

    Ok(NegotiatedOutcomes {
        default_outcome,
        accepted_only,
        explicit_accepted_default,
    })
}

/// Symbols advertised back to the peer in the attach reply
pub(crate) fn supported_outcomes() -> Vec<Symbol> {
    vec![
        Symbol::from(SYMBOL_ACCEPTED),
        Symbol::from(SYMBOL_REJECTED),
        Symbol::from(SYMBOL_RELEASED),
    ]
}

#[cfg(test)]
mod tests {
    use fe2o3_amqp_types::{
        messaging::{Accepted, Source},
        primitives::Array,
    };

    use super::*;

    #[test]
    fn test_consumer_tag_round_trip() {
        for handle in [0u32, 3, 7, 0xDEAD_BEEF, u32::MAX] {
            let tag = encode_consumer_tag(handle);
            assert_eq!(tag.len(), 9);
            assert_eq!(decode_consumer_tag(&tag), Some(handle));
        }
    }

    #[test]
    fn test_consumer_tag_layout() {
        let tag = encode_consumer_tag(3);
        assert_eq!(&tag[..], b"ctag-\x00\x00\x00\x03");
    }

    #[test]
    fn test_decode_rejects_foreign_tags() {
        assert_eq!(decode_consumer_tag(b"ctag-abc"), None);
        assert_eq!(decode_consumer_tag(b"other-\x00\x00\x00\x01"), None);
        assert_eq!(decode_consumer_tag(b"ctag-\x00\x00\x00\x00\x00"), None);
    }

    fn source_with(outcomes: &[&str], default_outcome: Option<Outcome>) -> Source {
        let mut source = Source::default();
        if !outcomes.is_empty() {
            source.outcomes = Some(Array::from(
                outcomes.iter().map(|s| Symbol::from(*s)).collect::<Vec<_>>(),
            ));
        }
        source.default_outcome = default_outcome;
        source
    }

    #[test]
    fn test_default_outcome_is_released() {
        let negotiated = negotiate_outcomes(&source_with(&[], None)).unwrap();
        assert!(matches!(negotiated.default_outcome, Outcome::Released(_)));
        assert!(!negotiated.no_ack());
    }

    #[test]
    fn test_no_ack_requires_explicit_opt_in() {
        let negotiated = negotiate_outcomes(&source_with(&[SYMBOL_ACCEPTED], None)).unwrap();
        assert!(!negotiated.no_ack());

        let negotiated = negotiate_outcomes(&source_with(
            &[SYMBOL_ACCEPTED],
            Some(Outcome::Accepted(Accepted {})),
        ))
        .unwrap();
        assert!(negotiated.no_ack());

        let negotiated = negotiate_outcomes(&source_with(
            &[SYMBOL_ACCEPTED, SYMBOL_RELEASED],
            Some(Outcome::Accepted(Accepted {})),
        ))
        .unwrap();
        assert!(!negotiated.no_ack());
    }

    #[test]
    fn test_unsupported_outcome_is_rejected() {
        let err = negotiate_outcomes(&source_with(
            &[SYMBOL_ACCEPTED, "amqp:modified:list"],
            None,
        ))
        .unwrap_err();
        assert!(err.0.contains("modified"));
    }
}
