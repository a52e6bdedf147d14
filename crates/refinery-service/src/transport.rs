//! Transport disposition mapping
//!
//! The queue transport delivers one message at a time and expects an
//! ack/nack decision back. Core outcomes map 1:1; the transport itself
//! (connection handling, redelivery timing) lives outside this crate.

use crate::coordinator::Outcome;

/// What the consumer should tell the broker about a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Done; remove from the queue.
    Ack,
    /// Permanent failure; drop without requeue.
    NackDiscard,
    /// Nothing was committed; requeue for redelivery.
    NackRequeue,
}

impl From<&Outcome> for Disposition {
    fn from(outcome: &Outcome) -> Self {
        match outcome {
            Outcome::Applied => Disposition::Ack,
            Outcome::Rejected { .. } => Disposition::NackDiscard,
            Outcome::RetryRequested { .. } => Disposition::NackRequeue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcomes_map_one_to_one() {
        assert_eq!(Disposition::from(&Outcome::Applied), Disposition::Ack);
        assert_eq!(
            Disposition::from(&Outcome::Rejected {
                reason: "empty key".into()
            }),
            Disposition::NackDiscard
        );
        assert_eq!(
            Disposition::from(&Outcome::RetryRequested {
                reason: "store down".into()
            }),
            Disposition::NackRequeue
        );
    }
}
