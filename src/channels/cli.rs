//! CLI channel: stdin/stdout REPL for local testing.
//!
//! Every line is a message in channel `cli`. A line of the form
//! `@path/to/notes.md` sends an empty message with that file attached, which
//! is how a transcript is fed in without a chat platform. Those messages come
//! from `CLI_TRANSCRIPT_AUTHOR`; typed lines come from `CLI_USER_AUTHOR`, so a
//! long typed explanation is never mistaken for a new transcript.

use async_trait::async_trait;
use futures::stream;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::channels::{Attachment, Channel, IncomingMessage, MessageStream, OutgoingResponse, StatusUpdate};
use crate::error::ChannelError;

/// Channel id used for every CLI message.
pub const CLI_CHANNEL_ID: &str = "cli";

/// Author of `@file` messages.
pub const CLI_TRANSCRIPT_AUTHOR: &str = "cli-transcript";

/// Author of typed lines.
pub const CLI_USER_AUTHOR: &str = "local-user";

/// A simple CLI channel that reads from stdin and writes to stdout.
pub struct CliChannel;

impl CliChannel {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CliChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// Turn one input line into a message. Returns `None` for blank lines.
pub fn parse_line(line: &str, seq: u64) -> Option<IncomingMessage> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let msg = match line.strip_prefix('@').map(str::trim) {
        Some(path) if !path.is_empty() => {
            let filename = std::path::Path::new(path)
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(path)
                .to_string();
            IncomingMessage::new(CLI_CHANNEL_ID, CLI_TRANSCRIPT_AUTHOR, "")
                .with_author_name("transcript")
                .with_attachment(Attachment::new(filename, path))
        }
        _ => IncomingMessage::new(CLI_CHANNEL_ID, CLI_USER_AUTHOR, line).with_author_name("you"),
    };

    Some(msg.with_id(format!("cli-{seq}")))
}

#[async_trait]
impl Channel for CliChannel {
    fn name(&self) -> &str {
        "cli"
    }

    async fn start(&self) -> Result<MessageStream, ChannelError> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        tokio::spawn(async move {
            let stdin = tokio::io::stdin();
            let reader = BufReader::new(stdin);
            let mut lines = reader.lines();
            let mut seq: u64 = 0;

            eprint!("> ");

            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        seq += 1;
                        let Some(msg) = parse_line(&line, seq) else {
                            eprint!("> ");
                            continue;
                        };
                        if tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break, // EOF
                    Err(e) => {
                        tracing::error!("Error reading stdin: {}", e);
                        break;
                    }
                }
            }
        });

        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|msg| (msg, rx))
        });

        Ok(Box::pin(stream))
    }

    async fn send(&self, response: OutgoingResponse) -> Result<(), ChannelError> {
        println!("\n{}\n", response.content);
        eprint!("> ");
        Ok(())
    }

    async fn send_status(
        &self,
        status: StatusUpdate,
        _channel_id: &str,
    ) -> Result<(), ChannelError> {
        match status {
            StatusUpdate::Typing => eprintln!("⏳ thinking..."),
        }
        Ok(())
    }

    async fn fetch_attachment(&self, attachment: &Attachment) -> Result<Vec<u8>, ChannelError> {
        tokio::fs::read(&attachment.url)
            .await
            .map_err(|e| ChannelError::AttachmentFailed {
                name: "cli".into(),
                filename: attachment.filename.clone(),
                reason: e.to_string(),
            })
    }

    async fn health_check(&self) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ChannelError> {
        Ok(())
    }
}
