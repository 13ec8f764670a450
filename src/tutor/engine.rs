//! Workflow engine: the per-channel quiz → explain-it-back state machine.
//!
//! ```text
//!   NoSession ──transcript──▶ McqPending ──answers──▶ FeynmanPending ──explanation──▶ (deleted)
//!        ▲                        │  challenge fails                         │
//!        └────────────────────────┴──────────────────────────────────────────┘
//! ```
//!
//! A transcript restarts the flow from any state. Every generation failure
//! is reported in the channel and never escapes `handle_message`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::channels::{Channel, IncomingMessage, OutgoingResponse, StatusUpdate};
use crate::llm::LlmGateway;

use super::classify::{self, MessageKind, TranscriptRules};
use super::prompts::{self, PromptSet};
use super::session::{Session, SessionStore};

/// How often the typing indicator is refreshed during a generation.
const TYPING_REFRESH: Duration = Duration::from_secs(8);

/// Where transcripts come from and where the tutor answers.
#[derive(Debug, Clone)]
pub struct TutorConfig {
    pub watch_channel_id: String,
    /// Channel that receives the quiz and hosts the session.
    pub output_channel_id: String,
    /// When set, only this author may post transcripts.
    pub transcript_source_id: Option<String>,
}

impl TutorConfig {
    fn transcript_rules(&self) -> TranscriptRules {
        TranscriptRules {
            watch_channel_id: self.watch_channel_id.clone(),
            source_author_id: self.transcript_source_id.clone(),
        }
    }
}

/// What handling one message did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Not a transcript and not a reply the current phase accepts.
    Ignored,
    /// Quiz posted; session is `McqPending`.
    QuizPosted,
    /// Quiz generation failed; no session.
    QuizFailed,
    /// Answers graded and challenge posted; session is `FeynmanPending`.
    ChallengePosted,
    /// Grading failed; session unchanged.
    GradingFailed,
    /// Grading succeeded but the challenge failed; session deleted.
    ChallengeFailed,
    /// Explanation too short; asked for more, session unchanged.
    ExplanationTooShort,
    /// Explanation graded; session deleted.
    Completed,
    /// Explanation grading failed; session unchanged.
    EvaluationFailed,
    /// A generation succeeded but its result could not be delivered; the
    /// transition it would have announced was not committed.
    DeliveryFailed,
}

/// The tutor state machine.
pub struct TutorEngine {
    config: TutorConfig,
    rules: TranscriptRules,
    prompts: Arc<PromptSet>,
    gateway: LlmGateway,
    store: Arc<dyn SessionStore>,
    channel: Arc<dyn Channel>,
}

impl TutorEngine {
    pub fn new(
        config: TutorConfig,
        prompts: Arc<PromptSet>,
        gateway: LlmGateway,
        store: Arc<dyn SessionStore>,
        channel: Arc<dyn Channel>,
    ) -> Self {
        let rules = config.transcript_rules();
        Self {
            config,
            rules,
            prompts,
            gateway,
            store,
            channel,
        }
    }

    pub fn config(&self) -> &TutorConfig {
        &self.config
    }

    /// Key that serializes processing for `msg`: the channel whose session it
    /// can touch. Transcripts act on the output channel.
    pub fn session_key(&self, msg: &IncomingMessage) -> String {
        if classify::is_transcript(
            msg,
            &self.rules.watch_channel_id,
            self.rules.source_author_id.as_deref(),
        ) {
            self.config.output_channel_id.clone()
        } else {
            msg.channel_id.clone()
        }
    }

    /// Process one inbound message to completion.
    ///
    /// Callers must not run two calls for the same `session_key` at once.
    pub async fn handle_message(&self, msg: &IncomingMessage) -> Outcome {
        let session = self.store.get(&msg.channel_id).await;

        let outcome = match classify::classify(msg, &self.rules, session.as_ref()) {
            MessageKind::Transcript => self.start_quiz(msg).await,
            MessageKind::QuizAnswer => match session {
                Some(session) => self.grade_quiz(msg, session).await,
                None => Outcome::Ignored,
            },
            MessageKind::Explanation => match session {
                Some(session) => self.grade_explanation(msg, session).await,
                None => Outcome::Ignored,
            },
            MessageKind::Ignorable => Outcome::Ignored,
        };

        if outcome != Outcome::Ignored {
            debug!(channel = %msg.channel_id, ?outcome, "Message handled");
        }
        outcome
    }

    // ── Transitions ─────────────────────────────────────────────────

    /// Any state → McqPending.
    async fn start_quiz(&self, msg: &IncomingMessage) -> Outcome {
        let transcript = self.extract_transcript(msg).await;
        let output = self.config.output_channel_id.as_str();

        info!(
            chars = transcript.chars().count(),
            author = msg.author_label(),
            "Transcript received"
        );

        let questions = match self
            .with_typing(output, self.gateway.generate(&self.prompts.quiz, &transcript))
            .await
        {
            Ok(questions) => questions,
            Err(e) => {
                self.emit_error(output, format!("**Error generating quiz:** {e}"))
                    .await;
                return Outcome::QuizFailed;
            }
        };

        let quiz = OutgoingResponse::text(output, prompts::quiz_message(&questions))
            .replying_to(msg);
        if !self.emit(quiz).await {
            return Outcome::DeliveryFailed;
        }

        if let Some(previous) = self.store.get(output).await {
            info!(channel = output, phase = %previous.phase, "Discarding previous session");
        }
        self.store
            .put(output, Session::new(output, transcript, questions))
            .await;

        info!(channel = output, "Quiz posted, waiting for answers");
        Outcome::QuizPosted
    }

    /// McqPending → FeynmanPending, or → deleted if the challenge fails.
    async fn grade_quiz(&self, msg: &IncomingMessage, mut session: Session) -> Outcome {
        let channel_id = msg.channel_id.as_str();
        info!(channel = channel_id, author = msg.author_label(), "Grading quiz answers");

        let input = prompts::grading_input(&session.transcript, &session.quiz_questions, &msg.content);
        let result = match self
            .with_typing(channel_id, self.gateway.generate(&self.prompts.grade, &input))
            .await
        {
            Ok(result) => result,
            Err(e) => {
                self.emit_error(channel_id, format!("**Error grading quiz:** {e}"))
                    .await;
                return Outcome::GradingFailed;
            }
        };

        if !self
            .emit(OutgoingResponse::text(channel_id, result).replying_to(msg))
            .await
        {
            return Outcome::DeliveryFailed;
        }

        info!(channel = channel_id, "Quiz graded, starting Feynman challenge");
        let challenge = match self
            .with_typing(
                channel_id,
                self.gateway.generate(&self.prompts.feynman, &session.transcript),
            )
            .await
        {
            Ok(challenge) => challenge,
            Err(e) => {
                self.emit_error(
                    channel_id,
                    format!("**Error generating Feynman challenge:** {e}"),
                )
                .await;
                self.store.delete(channel_id).await;
                warn!(channel = channel_id, "Session dropped: no challenge to continue with");
                return Outcome::ChallengeFailed;
            }
        };

        if !self
            .emit(OutgoingResponse::text(
                channel_id,
                prompts::challenge_message(&challenge),
            ))
            .await
        {
            return Outcome::DeliveryFailed;
        }

        if let Err(e) = session.begin_feynman(challenge) {
            // Only reachable if the store handed back a Feynman session for a
            // quiz answer, which classify rules out.
            error!(channel = channel_id, error = %e, "Unexpected phase during quiz grading");
            return Outcome::Ignored;
        }
        self.store.put(channel_id, session).await;

        info!(channel = channel_id, "Feynman challenge posted, waiting for explanation");
        Outcome::ChallengePosted
    }

    /// FeynmanPending → deleted.
    async fn grade_explanation(&self, msg: &IncomingMessage, session: Session) -> Outcome {
        let channel_id = msg.channel_id.as_str();

        if !classify::is_substantive_explanation(&msg.content) {
            debug!(channel = channel_id, "Explanation too short, asking again");
            self.emit(OutgoingResponse::text(
                channel_id,
                prompts::EXPLANATION_TOO_SHORT,
            ))
            .await;
            return Outcome::ExplanationTooShort;
        }

        let Some(challenge) = session.feynman_challenge() else {
            return Outcome::Ignored;
        };

        info!(channel = channel_id, author = msg.author_label(), "Evaluating Feynman explanation");
        let input = prompts::explanation_input(&session.transcript, challenge, &msg.content);
        let feedback = match self
            .with_typing(
                channel_id,
                self.gateway.generate(&self.prompts.feynman_grade, &input),
            )
            .await
        {
            Ok(feedback) => feedback,
            Err(e) => {
                self.emit_error(
                    channel_id,
                    format!("**Error evaluating explanation:** {e}"),
                )
                .await;
                return Outcome::EvaluationFailed;
            }
        };

        if !self
            .emit(OutgoingResponse::text(channel_id, feedback).replying_to(msg))
            .await
        {
            return Outcome::DeliveryFailed;
        }

        self.store.delete(channel_id).await;
        let active_sessions = self.store.len().await;
        info!(channel = channel_id, active_sessions, "Session complete");
        Outcome::Completed
    }

    // ── Helpers ─────────────────────────────────────────────────────

    /// Message body plus the text of every `.md` / `.txt` attachment.
    /// Attachments that cannot be fetched are skipped.
    async fn extract_transcript(&self, msg: &IncomingMessage) -> String {
        let mut transcript = msg.content.clone();
        for attachment in &msg.attachments {
            if !classify::is_text_attachment(&attachment.filename) {
                continue;
            }
            match self.channel.fetch_attachment(attachment).await {
                Ok(bytes) => classify::append_attachment_text(&mut transcript, &bytes),
                Err(e) => warn!(
                    filename = %attachment.filename,
                    error = %e,
                    "Skipping unreadable transcript attachment"
                ),
            }
        }
        transcript
    }

    /// Drive `fut` while keeping the typing indicator alive in `channel_id`.
    async fn with_typing<F: Future>(&self, channel_id: &str, fut: F) -> F::Output {
        tokio::pin!(fut);
        let mut ticker = tokio::time::interval(TYPING_REFRESH);
        loop {
            tokio::select! {
                out = &mut fut => return out,
                _ = ticker.tick() => {
                    if let Err(e) = self.channel.send_status(StatusUpdate::Typing, channel_id).await {
                        debug!(channel = channel_id, error = %e, "Typing indicator failed");
                    }
                }
            }
        }
    }

    /// Deliver an artifact. Returns whether it was sent.
    async fn emit(&self, response: OutgoingResponse) -> bool {
        let channel_id = response.channel_id.clone();
        match self.channel.send(response).await {
            Ok(()) => true,
            Err(e) => {
                error!(channel = %channel_id, error = %e, "Failed to deliver message");
                false
            }
        }
    }

    async fn emit_error(&self, channel_id: &str, text: String) {
        warn!(channel = channel_id, "{}", text);
        self.emit(OutgoingResponse::text(channel_id, text)).await;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::channels::{Attachment, MessageStream};
    use crate::error::{ChannelError, LlmError};
    use crate::llm::{CompletionRequest, CompletionResponse, LlmProvider};
    use crate::tutor::session::InMemorySessionStore;

    /// Replays canned results in order.
    struct ScriptedLlm {
        script: Mutex<VecDeque<Result<String, String>>>,
        calls: Mutex<usize>,
    }

    impl ScriptedLlm {
        fn new(script: Vec<Result<&str, &str>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(
                    script
                        .into_iter()
                        .map(|r| r.map(String::from).map_err(String::from))
                        .collect(),
                ),
                calls: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedLlm {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            *self.calls.lock().unwrap() += 1;
            let next = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .expect("unexpected LLM call");
            next.map(|content| CompletionResponse {
                content,
                input_tokens: 0,
                output_tokens: 0,
            })
            .map_err(|reason| LlmError::RequestFailed {
                provider: "scripted".into(),
                reason,
            })
        }
    }

    /// Records sends. Once `fail_after` sends have succeeded, the rest fail.
    #[derive(Default)]
    struct RecordingChannel {
        sent: Mutex<Vec<OutgoingResponse>>,
        fail_after: Option<usize>,
        files: Vec<(String, Vec<u8>)>,
    }

    #[async_trait]
    impl Channel for RecordingChannel {
        fn name(&self) -> &str {
            "recording"
        }
        async fn start(&self) -> Result<MessageStream, ChannelError> {
            Ok(Box::pin(futures::stream::empty()))
        }
        async fn send(&self, response: OutgoingResponse) -> Result<(), ChannelError> {
            let mut sent = self.sent.lock().unwrap();
            if self.fail_after.is_some_and(|n| sent.len() >= n) {
                return Err(ChannelError::SendFailed {
                    name: "recording".into(),
                    reason: "offline".into(),
                });
            }
            sent.push(response);
            Ok(())
        }
        async fn send_status(&self, _: StatusUpdate, _: &str) -> Result<(), ChannelError> {
            Ok(())
        }
        async fn fetch_attachment(&self, a: &Attachment) -> Result<Vec<u8>, ChannelError> {
            self.files
                .iter()
                .find(|(url, _)| url == &a.url)
                .map(|(_, bytes)| bytes.clone())
                .ok_or_else(|| ChannelError::AttachmentFailed {
                    name: "recording".into(),
                    filename: a.filename.clone(),
                    reason: "missing".into(),
                })
        }
        async fn health_check(&self) -> Result<(), ChannelError> {
            Ok(())
        }
        async fn shutdown(&self) -> Result<(), ChannelError> {
            Ok(())
        }
    }

    fn prompts() -> Arc<PromptSet> {
        Arc::new(PromptSet {
            quiz: "QUIZ".into(),
            grade: "GRADE".into(),
            feynman: "FEYNMAN".into(),
            feynman_grade: "FEYNMAN_GRADE".into(),
        })
    }

    fn engine_with(
        llm: Arc<ScriptedLlm>,
        channel: Arc<RecordingChannel>,
        output: &str,
    ) -> (TutorEngine, Arc<InMemorySessionStore>) {
        let store = Arc::new(InMemorySessionStore::new());
        let engine = TutorEngine::new(
            TutorConfig {
                watch_channel_id: "watch".into(),
                output_channel_id: output.into(),
                transcript_source_id: None,
            },
            prompts(),
            LlmGateway::new(llm, 1024),
            store.clone(),
            channel,
        );
        (engine, store)
    }

    #[test]
    fn session_key_routes_transcripts_to_output_channel() {
        let (engine, _) = engine_with(
            ScriptedLlm::new(vec![]),
            Arc::new(RecordingChannel::default()),
            "out",
        );
        let transcript = IncomingMessage::new("watch", "bot", "x".repeat(120));
        let reply = IncomingMessage::new("out", "user", "1A 2B 3C");
        assert_eq!(engine.session_key(&transcript), "out");
        assert_eq!(engine.session_key(&reply), "out");
        let chatter = IncomingMessage::new("watch", "user", "hi");
        assert_eq!(engine.session_key(&chatter), "watch");
    }

    #[test]
    fn handle_message_future_is_send() {
        fn assert_send<T: Send>(_: T) {}
        let (engine, _) = engine_with(
            ScriptedLlm::new(vec![]),
            Arc::new(RecordingChannel::default()),
            "out",
        );
        let msg = IncomingMessage::new("out", "user", "a long enough explanation of it");
        assert_send(engine.handle_message(&msg));
    }

    #[tokio::test]
    async fn transcript_in_watch_channel_lands_in_output_channel() {
        let llm = ScriptedLlm::new(vec![Ok("Q1?")]);
        let channel = Arc::new(RecordingChannel::default());
        let (engine, store) = engine_with(llm, channel.clone(), "out");

        let msg = IncomingMessage::new("watch", "bot", "x".repeat(120)).with_id("m1");
        assert_eq!(engine.handle_message(&msg).await, Outcome::QuizPosted);

        assert!(store.get("watch").await.is_none());
        assert!(store.get("out").await.unwrap().phase.is_mcq());

        let sent = channel.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].channel_id, "out");
        assert_eq!(sent[0].reply_to.as_ref().unwrap().message_id, "m1");
    }

    #[tokio::test]
    async fn transcript_includes_text_attachments_only() {
        let llm = ScriptedLlm::new(vec![Ok("Q")]);
        let channel = Arc::new(RecordingChannel {
            files: vec![
                ("u/notes.md".into(), b"notes body".to_vec()),
                ("u/pic.png".into(), vec![0x89, 0x50]),
            ],
            ..Default::default()
        });
        let (engine, store) = engine_with(llm, channel, "watch");

        let msg = IncomingMessage::new("watch", "bot", "short body")
            .with_attachment(Attachment::new("notes.md", "u/notes.md"))
            .with_attachment(Attachment::new("pic.png", "u/pic.png"))
            .with_attachment(Attachment::new("gone.txt", "u/gone.txt"));
        assert_eq!(engine.handle_message(&msg).await, Outcome::QuizPosted);

        let session = store.get("watch").await.unwrap();
        assert_eq!(session.transcript, "short body\n\nnotes body");
    }

    #[tokio::test]
    async fn undeliverable_quiz_creates_no_session() {
        let llm = ScriptedLlm::new(vec![Ok("Q")]);
        let channel = Arc::new(RecordingChannel {
            fail_after: Some(0),
            ..Default::default()
        });
        let (engine, store) = engine_with(llm, channel, "watch");

        let msg = IncomingMessage::new("watch", "bot", "x".repeat(120));
        assert_eq!(engine.handle_message(&msg).await, Outcome::DeliveryFailed);
        assert!(store.get("watch").await.is_none());
    }

    #[tokio::test]
    async fn bot_replies_are_ignored() {
        let llm = ScriptedLlm::new(vec![]);
        let channel = Arc::new(RecordingChannel::default());
        let (engine, store) = engine_with(llm.clone(), channel, "out");
        store.put("out", Session::new("out", "t", "q")).await;

        let msg = IncomingMessage::new("out", "other-bot", "1A 2B 3C").with_bot_author(true);
        assert_eq!(engine.handle_message(&msg).await, Outcome::Ignored);
        assert_eq!(*llm.calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn undelivered_feedback_keeps_session() {
        let llm = ScriptedLlm::new(vec![Ok("feedback")]);
        let channel = Arc::new(RecordingChannel {
            fail_after: Some(0),
            ..Default::default()
        });
        let (engine, store) = engine_with(llm, channel, "out");
        let mut session = Session::new("out", "t", "q");
        session.begin_feynman("c").unwrap();
        store.put("out", session).await;

        let msg = IncomingMessage::new("out", "user", "a long enough explanation of it");
        assert_eq!(engine.handle_message(&msg).await, Outcome::DeliveryFailed);
        assert!(store.get("out").await.unwrap().phase.is_feynman());
    }

    #[tokio::test]
    async fn undelivered_grading_keeps_quiz_pending() {
        let llm = ScriptedLlm::new(vec![Ok("graded")]);
        let channel = Arc::new(RecordingChannel {
            fail_after: Some(0),
            ..Default::default()
        });
        let (engine, store) = engine_with(llm.clone(), channel, "out");
        store.put("out", Session::new("out", "t", "q")).await;

        let msg = IncomingMessage::new("out", "user", "1A 2B 3C 4D 5A");
        assert_eq!(engine.handle_message(&msg).await, Outcome::DeliveryFailed);

        // No challenge is generated once the grading could not be posted.
        assert_eq!(*llm.calls.lock().unwrap(), 1);
        let session = store.get("out").await.unwrap();
        assert!(session.phase.is_mcq());
        assert_eq!(session.quiz_questions, "q");
    }

    #[tokio::test]
    async fn undelivered_challenge_keeps_quiz_pending() {
        let llm = ScriptedLlm::new(vec![Ok("graded"), Ok("explain osmosis")]);
        let channel = Arc::new(RecordingChannel {
            fail_after: Some(1),
            ..Default::default()
        });
        let (engine, store) = engine_with(llm.clone(), channel.clone(), "out");
        store.put("out", Session::new("out", "t", "q")).await;

        let msg = IncomingMessage::new("out", "user", "1A 2B 3C 4D 5A");
        assert_eq!(engine.handle_message(&msg).await, Outcome::DeliveryFailed);

        assert_eq!(*llm.calls.lock().unwrap(), 2);
        assert_eq!(channel.sent.lock().unwrap().len(), 1);
        let session = store.get("out").await.unwrap();
        assert!(session.phase.is_mcq());
        assert!(session.feynman_challenge().is_none());
    }

    #[tokio::test]
    async fn transcript_during_quiz_restarts_in_same_channel() {
        let llm = ScriptedLlm::new(vec![Ok("new questions")]);
        let channel = Arc::new(RecordingChannel::default());
        let (engine, store) = engine_with(llm, channel, "watch");
        store.put("watch", Session::new("watch", "old transcript", "old questions")).await;

        let msg = IncomingMessage::new("watch", "bot", "n".repeat(120));
        assert_eq!(engine.handle_message(&msg).await, Outcome::QuizPosted);

        let session = store.get("watch").await.unwrap();
        assert!(session.phase.is_mcq());
        assert_eq!(session.transcript, "n".repeat(120));
        assert_eq!(session.quiz_questions, "new questions");
        assert_eq!(store.len().await, 1);
    }
}
