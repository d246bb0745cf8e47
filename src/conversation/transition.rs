//! Pure state transition function
//!
//! Given the same state and reply this always produces the same result and
//! performs no I/O. Anything odd about a reply is turned into an observation
//! and, once polling, into another poll; nothing here can stall the chain.

use super::{Action, ConversationContext, ConversationState, ConversationStep, Observation, PendingMessage, Reply};
use crate::capability::{GET_COUNT, START_COUNT};
use serde_json::Value;

/// Result of a state transition
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionResult {
    pub new_state: ConversationState,
    pub action: Action,
    pub observations: Vec<Observation>,
}

impl TransitionResult {
    pub fn new(state: ConversationState, action: Action) -> Self {
        Self {
            new_state: state,
            action,
            observations: vec![],
        }
    }

    pub fn with_observation(mut self, observation: Observation) -> Self {
        self.observations.push(observation);
        self
    }
}

pub fn transition(
    state: &ConversationState,
    context: &ConversationContext,
    reply: Reply,
) -> TransitionResult {
    match state.step {
        ConversationStep::AwaitingStart => awaiting_start(state, context, reply),
        ConversationStep::Polling => polling(state, context, reply),
    }
}

/// The message to resend after a reconnect, given where the chain stands
pub fn resume_message(state: &ConversationState, context: &ConversationContext) -> PendingMessage {
    match state.step {
        ConversationStep::AwaitingStart => context.start_message(),
        ConversationStep::Polling => context.poll_message(),
    }
}

fn awaiting_start(
    state: &ConversationState,
    context: &ConversationContext,
    reply: Reply,
) -> TransitionResult {
    if reply.operation != START_COUNT {
        return TransitionResult::new(state.clone(), Action::Ignore).with_observation(
            Observation::IgnoredBeforeStart {
                operation: reply.operation,
            },
        );
    }

    // Stay put; liveness will resend the start request after a reconnect
    if reply.has_error {
        return TransitionResult::new(state.clone(), Action::Ignore)
            .with_observation(Observation::StartRejected {
                payload: reply.payload,
            });
    }

    let already_running = reply.payload.get("success") == Some(&Value::Bool(false));
    let new_state = ConversationState {
        step: ConversationStep::Polling,
        last_count: state.last_count,
        polling_since: state.polling_since.or(Some(reply.received_at)),
    };

    TransitionResult::new(new_state, Action::Advance(context.poll_message()))
        .with_observation(Observation::CounterStarted { already_running })
}

fn polling(
    state: &ConversationState,
    context: &ConversationContext,
    reply: Reply,
) -> TransitionResult {
    let next = Action::Advance(context.poll_message());

    if reply.operation != GET_COUNT {
        return TransitionResult::new(state.clone(), next).with_observation(
            Observation::UnexpectedOperation {
                operation: reply.operation,
            },
        );
    }

    if reply.has_error {
        return TransitionResult::new(state.clone(), next).with_observation(
            Observation::ErrorReply {
                operation: reply.operation,
                payload: reply.payload,
            },
        );
    }

    let Some(value) = reply.payload.as_u64() else {
        return TransitionResult::new(state.clone(), next).with_observation(
            Observation::MalformedPayload {
                operation: reply.operation,
                payload: reply.payload,
            },
        );
    };

    let client_elapsed_secs = state
        .polling_since
        .map_or(0, |since| reply.received_at.saturating_duration_since(since).as_secs());

    let mut result = TransitionResult::new(
        ConversationState {
            last_count: Some(value),
            ..state.clone()
        },
        next,
    );

    let skip = state
        .last_count
        .and_then(|previous| skipped_between(previous, value).map(|skipped| (previous, skipped)));
    if let Some((previous, skipped)) = skip {
        result = result.with_observation(Observation::CountSkipped {
            skipped,
            value,
            previous,
        });
    }

    result.with_observation(Observation::CountObserved {
        value,
        client_elapsed_secs,
    })
}

/// Number of counts missed between two consecutive observations, if any
pub(crate) fn skipped_between(previous: u64, value: u64) -> Option<u64> {
    match value.checked_sub(previous) {
        Some(delta) if delta > 1 => Some(delta - 1),
        _ => None,
    }
}
