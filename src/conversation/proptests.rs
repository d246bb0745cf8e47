//! Property-based tests for the conversation
//!
//! These tests verify the chain invariants hold across arbitrary replies.

use super::*;
use crate::capability::{GET_COUNT, START_COUNT, STOP_COUNT};
use proptest::prelude::*;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::Instant;

// ============================================================================
// Test Helpers
// ============================================================================

fn test_context() -> ConversationContext {
    ConversationContext::new("intersect.resilience.clustering-demo.-.counting-service")
}

fn reply_at(base: Instant, spec: ReplySpec) -> Reply {
    let reply = Reply::new(spec.operation, spec.payload, base + Duration::from_millis(spec.offset_ms));
    if spec.has_error {
        reply.with_error()
    } else {
        reply
    }
}

fn polling_state(base: Instant, last_count: Option<u64>) -> ConversationState {
    ConversationState {
        step: ConversationStep::Polling,
        last_count,
        polling_since: Some(base),
    }
}

#[derive(Debug, Clone)]
struct ReplySpec {
    operation: String,
    payload: Value,
    has_error: bool,
    offset_ms: u64,
}

// ============================================================================
// Arbitrary Generators
// ============================================================================

fn arb_operation() -> impl Strategy<Value = String> {
    prop_oneof![
        Just(START_COUNT.to_string()),
        Just(STOP_COUNT.to_string()),
        Just(GET_COUNT.to_string()),
        "CountingExample\\.[a-z_]{1,12}",
    ]
}

fn arb_payload() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<u64>().prop_map(|n| json!(n)),
        any::<i64>().prop_map(|n| json!(n)),
        "[a-z ]{0,16}".prop_map(Value::String),
        any::<bool>().prop_map(|success| json!({"success": success, "state": {"count": 0, "counting": true}})),
    ]
}

fn arb_reply() -> impl Strategy<Value = ReplySpec> {
    (arb_operation(), arb_payload(), any::<bool>(), 0u64..100_000).prop_map(
        |(operation, payload, has_error, offset_ms)| ReplySpec {
            operation,
            payload,
            has_error,
            offset_ms,
        },
    )
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    /// Only a successful start reply moves the chain out of `AwaitingStart`
    #[test]
    fn awaiting_start_only_advances_on_start_reply(spec in arb_reply()) {
        let base = Instant::now();
        let state = ConversationState::new();
        let is_start = spec.operation == START_COUNT && !spec.has_error;
        let result = transition(&state, &test_context(), reply_at(base, spec));

        if is_start {
            prop_assert!(result.new_state.is_polling());
            prop_assert_eq!(result.action, Action::Advance(test_context().poll_message()));
        } else {
            prop_assert_eq!(result.new_state, state);
            prop_assert_eq!(result.action, Action::Ignore);
        }
    }

    /// Once polling, every reply leads to exactly one more poll
    #[test]
    fn polling_always_sends_next_poll(
        last_count in proptest::option::of(any::<u64>()),
        spec in arb_reply(),
    ) {
        let base = Instant::now();
        let state = polling_state(base, last_count);
        let result = transition(&state, &test_context(), reply_at(base, spec));
        prop_assert!(result.new_state.is_polling());
        prop_assert_eq!(result.action, Action::Advance(test_context().poll_message()));
        prop_assert_eq!(result.new_state.polling_since, state.polling_since);
    }

    /// Transitions never produce a fatal action
    #[test]
    fn no_reply_is_fatal(
        polling in any::<bool>(),
        spec in arb_reply(),
    ) {
        let base = Instant::now();
        let state = if polling {
            polling_state(base, None)
        } else {
            ConversationState::new()
        };
        let result = transition(&state, &test_context(), reply_at(base, spec));
        prop_assert!(!matches!(result.action, Action::Fatal(_)));
    }

    /// Skip reports match the gaps in an arbitrary sequence of counts, and
    /// the last count always tracks the most recent value
    #[test]
    fn skips_follow_count_sequence(values in proptest::collection::vec(0u64..1_000, 1..40)) {
        let base = Instant::now();
        let ctx = test_context();
        let mut state = transition(
            &ConversationState::new(),
            &ctx,
            Reply::new(START_COUNT, json!({"success": true}), base),
        ).new_state;

        let mut previous: Option<u64> = None;
        for value in values {
            let result = transition(&state, &ctx, Reply::new(GET_COUNT, json!(value), base));
            let reported: Vec<u64> = result
                .observations
                .iter()
                .filter_map(|o| match o {
                    Observation::CountSkipped { skipped, .. } => Some(*skipped),
                    _ => None,
                })
                .collect();

            let expected = match previous {
                Some(p) if value > p + 1 => vec![value - p - 1],
                _ => vec![],
            };
            prop_assert_eq!(reported, expected);
            prop_assert_eq!(result.new_state.last_count, Some(value));

            previous = Some(value);
            state = result.new_state;
        }
    }

    /// Resuming never changes which operation the chain is waiting on
    #[test]
    fn resume_matches_step(polling in any::<bool>()) {
        let ctx = test_context();
        let state = if polling {
            polling_state(Instant::now(), Some(3))
        } else {
            ConversationState::new()
        };
        let message = resume_message(&state, &ctx);
        let expected = if polling { GET_COUNT } else { START_COUNT };
        prop_assert_eq!(message.operation.as_str(), expected);
        prop_assert_eq!(message.destination, ctx.service_address);
    }
}
