use crate::message::MessageWithOffset;

/// Decides which messages a consumer receives. Applied by the consumer's
/// drain loop to every message read from its cursor.
pub trait MessageFilter: Send + Sync {
    fn applies(&self, message: &MessageWithOffset) -> bool;
}

/// Default filter, every message passes.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl MessageFilter for AcceptAll {
    fn applies(&self, _message: &MessageWithOffset) -> bool {
        true
    }
}

/// Adapts a closure into a [`MessageFilter`].
#[derive(Debug, Clone, Copy)]
pub struct PredicateFilter<F>(pub F);

impl<F> MessageFilter for PredicateFilter<F>
where
    F: Fn(&MessageWithOffset) -> bool + Send + Sync,
{
    fn applies(&self, message: &MessageWithOffset) -> bool {
        (self.0)(message)
    }
}
