//! Built-in key authorization policy.

use credstore_provider::{
    AuthorizationContext, AuthorizationReason, DecisionTicket, Key, KeyAuthorizer, KeyDecision,
};
use log::info;

/// Policy used when no site-specific authorizer is configured.
///
/// The first key ever seen claims the store exclusively; once at least one
/// key is authorized, further keys are approved additively. Interactive or
/// remote policies replace this through the plugin registry and answer
/// their tickets whenever they are ready.
#[derive(Debug, Default)]
pub struct DefaultKeyAuthorizer;

impl KeyAuthorizer for DefaultKeyAuthorizer {
    fn query_key_authorization(
        &self,
        key: &Key,
        reason: AuthorizationReason,
        ctx: AuthorizationContext,
    ) -> DecisionTicket {
        let (tx, ticket) = DecisionTicket::channel();
        let decision = if ctx.has_authorized_keys {
            KeyDecision::Approved
        } else {
            KeyDecision::Exclusive
        };
        info!(
            "default policy: {decision:?} for key {} ({reason:?})",
            key.fingerprint()
        );
        tx.send(decision);
        ticket
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(has_authorized_keys: bool) -> AuthorizationContext {
        AuthorizationContext {
            store_is_setup: has_authorized_keys,
            has_authorized_keys,
        }
    }

    #[test]
    fn first_key_claims_the_store() {
        let policy = DefaultKeyAuthorizer;
        let mut ticket = policy.query_key_authorization(
            &Key::from("alpha"),
            AuthorizationReason::SystemStarted,
            ctx(false),
        );
        assert_eq!(ticket.try_decision(), Some(KeyDecision::Exclusive));
    }

    #[test]
    fn later_keys_are_added_alongside() {
        let policy = DefaultKeyAuthorizer;
        let mut ticket = policy.query_key_authorization(
            &Key::from("beta"),
            AuthorizationReason::KeyInserted,
            ctx(true),
        );
        assert_eq!(ticket.try_decision(), Some(KeyDecision::Approved));
    }
}
