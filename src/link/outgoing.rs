//! Outgoing link: broker deliveries on a subscribed queue become transfers

use fe2o3_amqp_types::{definitions::SequenceNo, messaging::Outcome};

use crate::{endpoint::ConsumerTag, serial::serial_add};

/// State of one broker→peer link
#[derive(Debug)]
pub(crate) struct OutgoingLink {
    pub name: String,
    /// Queue the consumer is subscribed to (for exchange sources, the
    /// private auto-delete queue)
    pub queue: String,
    pub consumer_tag: ConsumerTag,
    pub transfer_count: SequenceNo,
    /// 0 means link credit counts messages rather than bytes
    pub transfer_unit: u32,
    /// Deliveries are forgotten by the broker at send; no disposition
    /// traffic follows
    pub no_ack: bool,
    /// Outcome applied when the peer settles without naming one
    pub default_outcome: Outcome,
}

impl OutgoingLink {
    pub fn new(
        name: String,
        queue: String,
        consumer_tag: ConsumerTag,
        no_ack: bool,
        default_outcome: Outcome,
    ) -> Self {
        Self {
            name,
            queue,
            consumer_tag,
            transfer_count: 0,
            transfer_unit: 0,
            no_ack,
            default_outcome,
        }
    }

    pub fn register_transfer(&mut self) {
        self.transfer_count = serial_add(self.transfer_count, 1);
    }
}

#[cfg(test)]
mod tests {
    use fe2o3_amqp_types::messaging::{Outcome, Released};

    use super::*;
    use crate::link::encode_consumer_tag;

    #[test]
    fn test_transfer_count_wraps() {
        let mut link = OutgoingLink::new(
            "out".to_string(),
            "q".to_string(),
            encode_consumer_tag(1),
            false,
            Outcome::Released(Released {}),
        );
        link.transfer_count = u32::MAX;
        link.register_transfer();
        assert_eq!(link.transfer_count, 0);
    }
}
