//! The tutoring workflow: classify inbound messages, drive the per-channel
//! quiz → explain-it-back state machine, and serialize work per channel.

pub mod classify;
pub mod dispatch;
pub mod engine;
pub mod prompts;
pub mod session;

pub use classify::{MessageKind, TranscriptRules};
pub use dispatch::Dispatcher;
pub use engine::{Outcome, TutorConfig, TutorEngine};
pub use prompts::PromptSet;
pub use session::{InMemorySessionStore, Phase, Session, SessionStore};
