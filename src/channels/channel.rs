//! Channel trait and the message types that flow through it.

use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;

use crate::error::ChannelError;

/// Stream of inbound messages produced by `Channel::start`.
pub type MessageStream = Pin<Box<dyn Stream<Item = IncomingMessage> + Send>>;

/// A file attached to an inbound message. Bytes are fetched lazily through
/// `Channel::fetch_attachment`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub url: String,
    pub size: Option<u64>,
}

impl Attachment {
    pub fn new(filename: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            url: url.into(),
            size: None,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }
}

/// A message received from a channel.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Platform message id, used for reply references.
    pub id: String,
    pub channel_id: String,
    pub author_id: String,
    pub author_name: Option<String>,
    /// Author is an automated participant.
    pub author_is_bot: bool,
    /// Author is this bot.
    pub is_self: bool,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub received_at: DateTime<Utc>,
}

impl IncomingMessage {
    pub fn new(
        channel_id: impl Into<String>,
        author_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: String::new(),
            channel_id: channel_id.into(),
            author_id: author_id.into(),
            author_name: None,
            author_is_bot: false,
            is_self: false,
            content: content.into(),
            attachments: Vec::new(),
            received_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_author_name(mut self, name: impl Into<String>) -> Self {
        self.author_name = Some(name.into());
        self
    }

    pub fn with_bot_author(mut self, is_bot: bool) -> Self {
        self.author_is_bot = is_bot;
        self
    }

    pub fn with_self_author(mut self, is_self: bool) -> Self {
        self.is_self = is_self;
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Name for log lines: display name if known, id otherwise.
    pub fn author_label(&self) -> &str {
        self.author_name.as_deref().unwrap_or(&self.author_id)
    }
}

/// Reference to an earlier message that a response replies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRef {
    pub channel_id: String,
    pub message_id: String,
}

/// A text artifact to deliver to a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingResponse {
    pub channel_id: String,
    pub content: String,
    pub reply_to: Option<MessageRef>,
}

impl OutgoingResponse {
    pub fn text(channel_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            content: content.into(),
            reply_to: None,
        }
    }

    /// Reply to `msg`. Messages without a platform id are not referenced.
    pub fn replying_to(mut self, msg: &IncomingMessage) -> Self {
        if !msg.id.is_empty() {
            self.reply_to = Some(MessageRef {
                channel_id: msg.channel_id.clone(),
                message_id: msg.id.clone(),
            });
        }
        self
    }
}

/// Out-of-band status shown while work is in progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusUpdate {
    /// "Bot is typing" indicator.
    Typing,
}

/// A messaging platform connection.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Connect and return the stream of inbound messages.
    async fn start(&self) -> Result<MessageStream, ChannelError>;

    /// Deliver a text artifact, splitting it if the platform requires.
    async fn send(&self, response: OutgoingResponse) -> Result<(), ChannelError>;

    /// Show a status indicator in `channel_id`.
    async fn send_status(&self, status: StatusUpdate, channel_id: &str)
    -> Result<(), ChannelError>;

    /// Download the raw bytes of an attachment.
    async fn fetch_attachment(&self, attachment: &Attachment) -> Result<Vec<u8>, ChannelError>;

    async fn health_check(&self) -> Result<(), ChannelError>;

    async fn shutdown(&self) -> Result<(), ChannelError>;
}
