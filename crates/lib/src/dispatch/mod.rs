//! Command dispatch: pattern registry, conversations with blocking asks, and the
//! per-backend loop that routes inbound messages to pending asks or handlers.

mod ask;
mod conversation;
mod correlator;
mod dispatcher;
mod jobs;
mod patterns;

pub use ask::Ask;
pub use conversation::{
    Conversation, DispatchLink, DEFAULT_ASK_TIMEOUT, DEFAULT_GIVE_UP_TEXT, DEFAULT_TIMEOUT_TEXT,
    DEFAULT_WRONG_ANSWER_TEXT,
};
pub use correlator::{AbortedAsk, AskCorrelator, Correlation, PendingReply};
pub use dispatcher::{Dispatch, Dispatcher, ABORTED_TEXT, LOOP_RETRY_DELAY};
pub use jobs::{JobGuard, JobRegistry};
pub use patterns::{
    handler, mapping_prefix, matches, Handler, PatternEntry, PatternRegistry,
    DEFAULT_DISPLAY_NAME, HELP_PATTERN, SLASH_HELP_PATTERN,
};
