//! Stream Events
//!
//! The tagged event stream produced by provider adapters and consumed
//! by the session engine. A stream is finite and single-pass: the
//! adapter spawns a producer task and hands back the receiving end;
//! dropping the receiver aborts the producer (and with it the HTTP
//! connection).

use serde_json::Value;
use tokio::sync::mpsc;

use crate::types::{FinishReason, TokenUsage};

/// Events emitted while a model response streams in.
///
/// Ordering guarantees for one stream: all `TextDelta`s arrive before
/// the `ToolCallComplete`s for the same step, which arrive before the
/// single `FinishStep`. `StreamError` may replace `FinishStep`; after
/// either, no further events follow.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A chunk of assistant text.
    TextDelta(String),
    /// An incremental chunk of a tool call's argument JSON. The name
    /// arrives with the first delta for an id; arguments accumulate as
    /// a raw string across deltas. Deltas for different ids may
    /// interleave.
    ToolCallDelta {
        id: String,
        name: String,
        arguments_delta: String,
    },
    /// A fully assembled tool call. Exactly one per delta id, before
    /// `FinishStep`.
    ToolCallComplete {
        id: String,
        name: String,
        arguments: Value,
    },
    /// Terminates the stream. Exactly one per successful stream.
    FinishStep {
        reason: FinishReason,
        usage: TokenUsage,
    },
    /// Terminates the stream in place of `FinishStep`.
    StreamError { message: String, retryable: bool },
}

/// The receiving end of a provider stream.
pub type EventStream = mpsc::Receiver<StreamEvent>;

/// Channel capacity for provider streams. Large enough that a slow
/// consumer does not stall SSE reads under normal delta sizes.
pub const STREAM_CHANNEL_CAPACITY: usize = 256;

/// Create a stream channel pair with the standard capacity.
pub fn channel() -> (mpsc::Sender<StreamEvent>, EventStream) {
    mpsc::channel(STREAM_CHANNEL_CAPACITY)
}
