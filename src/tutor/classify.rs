//! Message classification: decides what an inbound message means for the
//! tutor. Everything here is pure.

use crate::channels::IncomingMessage;

use super::session::{Phase, Session};

/// Messages shorter than this without attachments are chatter, not transcripts.
pub const MIN_TRANSCRIPT_CHARS: usize = 100;

/// Letters from {A,B,C,D} needed before text counts as quiz answers.
pub const MIN_ANSWER_LETTERS: usize = 3;

/// Trimmed length an explanation needs before it is graded.
pub const MIN_EXPLANATION_CHARS: usize = 20;

/// Attachment suffixes whose contents are read into the transcript.
const TEXT_ATTACHMENT_SUFFIXES: &[&str] = &[".md", ".txt"];

/// What an inbound message is, given the channel's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Transcript,
    QuizAnswer,
    Explanation,
    Ignorable,
}

/// Which messages count as transcripts.
#[derive(Debug, Clone)]
pub struct TranscriptRules {
    pub watch_channel_id: String,
    /// When set, only this author may post transcripts.
    pub source_author_id: Option<String>,
}

/// A new transcript: watched channel, not from us, from the expected source
/// (if any), and long enough or carrying an attachment.
pub fn is_transcript(
    msg: &IncomingMessage,
    watch_channel_id: &str,
    expected_source_id: Option<&str>,
) -> bool {
    if msg.channel_id != watch_channel_id {
        return false;
    }
    if msg.is_self {
        return false;
    }
    if let Some(source) = expected_source_id {
        if msg.author_id != source {
            return false;
        }
    }
    msg.content.chars().count() >= MIN_TRANSCRIPT_CHARS || !msg.attachments.is_empty()
}

/// A human reply in a channel that has an active session.
pub fn is_session_reply(msg: &IncomingMessage, session: Option<&Session>) -> bool {
    !msg.author_is_bot && session.is_some()
}

/// At least three of A/B/C/D anywhere in the text, case-insensitive.
///
/// "1A 2C 3B 4D 5A" passes, and so does any sentence with enough of those
/// letters in it.
pub fn looks_like_quiz_answer(text: &str) -> bool {
    text.chars()
        .filter(|c| matches!(c.to_ascii_uppercase(), 'A' | 'B' | 'C' | 'D'))
        .count()
        >= MIN_ANSWER_LETTERS
}

pub fn is_substantive_explanation(text: &str) -> bool {
    text.trim().chars().count() >= MIN_EXPLANATION_CHARS
}

/// Classify `msg` against the transcript rules and the channel's session.
///
/// Transcripts win over session replies, so a new transcript always restarts
/// the flow. In the Feynman phase every reply is an explanation; whether it
/// is substantive is the engine's call.
pub fn classify(
    msg: &IncomingMessage,
    rules: &TranscriptRules,
    session: Option<&Session>,
) -> MessageKind {
    if is_transcript(
        msg,
        &rules.watch_channel_id,
        rules.source_author_id.as_deref(),
    ) {
        return MessageKind::Transcript;
    }
    if !is_session_reply(msg, session) {
        return MessageKind::Ignorable;
    }
    match session.map(|s| &s.phase) {
        Some(Phase::McqPending) if looks_like_quiz_answer(&msg.content) => MessageKind::QuizAnswer,
        Some(Phase::FeynmanPending { .. }) => MessageKind::Explanation,
        _ => MessageKind::Ignorable,
    }
}

/// Attachments whose text is folded into the transcript.
pub fn is_text_attachment(filename: &str) -> bool {
    TEXT_ATTACHMENT_SUFFIXES
        .iter()
        .any(|suffix| filename.ends_with(suffix))
}

/// Append attachment bytes to the transcript after a blank line. Invalid
/// UTF-8 is replaced, never rejected.
pub fn append_attachment_text(transcript: &mut String, bytes: &[u8]) {
    transcript.push_str("\n\n");
    transcript.push_str(&String::from_utf8_lossy(bytes));
}
