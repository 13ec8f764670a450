//! Discord channel: Gateway WebSocket for inbound messages, REST for sends.
//!
//! Native Rust Discord implementation adapted to the tutor's Channel trait
//! (MessageStream, send, send_status, fetch_attachment). Only the pieces the
//! tutor needs are implemented: identify, heartbeat, READY and
//! MESSAGE_CREATE. Resume is not supported; a dropped session re-identifies.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio_tungstenite::tungstenite::Message;

use crate::channels::{
    Attachment, Channel, IncomingMessage, MessageStream, OutgoingResponse, StatusUpdate,
};
use crate::error::ChannelError;

/// Maximum message length for Discord's create-message API, in characters.
pub const DISCORD_MAX_MESSAGE_LENGTH: usize = 2000;

const DISCORD_API_BASE: &str = "https://discord.com/api/v10";
const DISCORD_GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";

/// GUILDS | GUILD_MESSAGES | DIRECT_MESSAGES | MESSAGE_CONTENT.
const GATEWAY_INTENTS: u64 = (1 << 0) | (1 << 9) | (1 << 12) | (1 << 15);

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

// Gateway opcodes.
const OP_DISPATCH: u8 = 0;
const OP_HEARTBEAT: u8 = 1;
const OP_IDENTIFY: u8 = 2;
const OP_RECONNECT: u8 = 7;
const OP_INVALID_SESSION: u8 = 9;
const OP_HELLO: u8 = 10;
const OP_HEARTBEAT_ACK: u8 = 11;

/// Close codes after which reconnecting cannot succeed.
const FATAL_CLOSE_CODES: &[u16] = &[4004, 4010, 4011, 4012, 4013, 4014];

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct GatewayPayload {
    op: u8,
    #[serde(default)]
    d: serde_json::Value,
    s: Option<u64>,
    t: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Hello {
    heartbeat_interval: u64,
}

#[derive(Debug, Deserialize)]
struct Ready {
    user: DiscordUser,
}

#[derive(Debug, Deserialize)]
struct DiscordUser {
    id: String,
    username: String,
    #[serde(default)]
    global_name: Option<String>,
    #[serde(default)]
    bot: bool,
}

#[derive(Debug, Deserialize)]
struct DiscordMessage {
    id: String,
    channel_id: String,
    author: DiscordUser,
    #[serde(default)]
    content: String,
    #[serde(default)]
    attachments: Vec<DiscordAttachment>,
}

#[derive(Debug, Deserialize)]
struct DiscordAttachment {
    filename: String,
    url: String,
    #[serde(default)]
    size: Option<u64>,
}

/// How a gateway session ended.
enum SessionEnd {
    /// Reconnect and identify again.
    Reconnect,
    /// The consumer dropped the message stream.
    ListenerClosed,
    /// Discord rejected the connection for good (bad token, bad intents).
    Fatal(String),
}

// ── Channel ─────────────────────────────────────────────────────────

/// Discord channel: one bot connection.
pub struct DiscordChannel {
    bot_token: SecretString,
    client: reqwest::Client,
}

impl DiscordChannel {
    pub fn new(bot_token: SecretString) -> Self {
        Self {
            bot_token,
            client: reqwest::Client::new(),
        }
    }

    fn api_url(path: &str) -> String {
        format!("{DISCORD_API_BASE}{path}")
    }

    fn auth_header(&self) -> String {
        format!("Bot {}", self.bot_token.expose_secret())
    }

    /// Post a single chunk (≤2000 chars).
    async fn send_chunk(
        &self,
        channel_id: &str,
        content: &str,
        reply_to: Option<&crate::channels::MessageRef>,
    ) -> Result<(), ChannelError> {
        let mut body = serde_json::json!({ "content": content });
        if let Some(reference) = reply_to {
            body["message_reference"] = serde_json::json!({
                "message_id": reference.message_id,
                "channel_id": reference.channel_id,
                "fail_if_not_exists": false,
            });
        }

        let resp = self
            .client
            .post(Self::api_url(&format!("/channels/{channel_id}/messages")))
            .header(reqwest::header::AUTHORIZATION, self.auth_header())
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: "discord".into(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ChannelError::RateLimited {
                name: "discord".into(),
            });
        }

        let err = resp.text().await.unwrap_or_default();
        Err(ChannelError::SendFailed {
            name: "discord".into(),
            reason: format!("create message returned {status}: {err}"),
        })
    }
}

#[async_trait]
impl Channel for DiscordChannel {
    fn name(&self) -> &str {
        "discord"
    }

    async fn start(&self) -> Result<MessageStream, ChannelError> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let token = self.bot_token.clone();

        tokio::spawn(async move {
            loop {
                match run_gateway_session(&token, &tx).await {
                    Ok(SessionEnd::ListenerClosed) => {
                        tracing::info!("Discord listener channel closed");
                        return;
                    }
                    Ok(SessionEnd::Fatal(reason)) => {
                        tracing::error!("Discord gateway rejected the bot: {reason}");
                        return;
                    }
                    Ok(SessionEnd::Reconnect) => {
                        tracing::info!("Discord gateway asked to reconnect");
                    }
                    Err(e) => {
                        tracing::warn!("Discord gateway error: {e}");
                    }
                }
                if tx.is_closed() {
                    return;
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|msg| (msg, rx))
        });

        Ok(Box::pin(stream))
    }

    async fn send(&self, response: OutgoingResponse) -> Result<(), ChannelError> {
        let chunks = split_message(&response.content, DISCORD_MAX_MESSAGE_LENGTH);

        for (i, chunk) in chunks.iter().enumerate() {
            let reference = if i == 0 {
                response.reply_to.as_ref()
            } else {
                None
            };
            self.send_chunk(&response.channel_id, chunk, reference)
                .await?;
        }
        Ok(())
    }

    async fn send_status(
        &self,
        status: StatusUpdate,
        channel_id: &str,
    ) -> Result<(), ChannelError> {
        match status {
            StatusUpdate::Typing => {
                let resp = self
                    .client
                    .post(Self::api_url(&format!("/channels/{channel_id}/typing")))
                    .header(reqwest::header::AUTHORIZATION, self.auth_header())
                    .send()
                    .await
                    .map_err(|e| ChannelError::SendFailed {
                        name: "discord".into(),
                        reason: e.to_string(),
                    })?;
                if !resp.status().is_success() {
                    tracing::debug!(status = ?resp.status(), "Discord typing indicator rejected");
                }
                Ok(())
            }
        }
    }

    async fn fetch_attachment(&self, attachment: &Attachment) -> Result<Vec<u8>, ChannelError> {
        let fail = |reason: String| ChannelError::AttachmentFailed {
            name: "discord".into(),
            filename: attachment.filename.clone(),
            reason,
        };

        let resp = self
            .client
            .get(&attachment.url)
            .send()
            .await
            .map_err(|e| fail(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(fail(format!("download returned {}", resp.status())));
        }

        let bytes = resp.bytes().await.map_err(|e| fail(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    async fn health_check(&self) -> Result<(), ChannelError> {
        let resp = self
            .client
            .get(Self::api_url("/users/@me"))
            .header(reqwest::header::AUTHORIZATION, self.auth_header())
            .send()
            .await
            .map_err(|e| ChannelError::StartupFailed {
                name: "discord".into(),
                reason: e.to_string(),
            })?;

        match resp.status() {
            s if s.is_success() => Ok(()),
            reqwest::StatusCode::UNAUTHORIZED => Err(ChannelError::AuthFailed {
                name: "discord".into(),
                reason: "bot token rejected".into(),
            }),
            s => Err(ChannelError::StartupFailed {
                name: "discord".into(),
                reason: format!("/users/@me returned {s}"),
            }),
        }
    }

    async fn shutdown(&self) -> Result<(), ChannelError> {
        tracing::info!("Discord channel shutting down");
        Ok(())
    }
}

// ── Gateway session ─────────────────────────────────────────────────

/// Run one gateway connection until it drops.
async fn run_gateway_session(
    token: &SecretString,
    tx: &tokio::sync::mpsc::UnboundedSender<IncomingMessage>,
) -> anyhow::Result<SessionEnd> {
    tracing::info!("Discord: connecting to gateway...");
    let (ws_stream, _) = tokio_tungstenite::connect_async(DISCORD_GATEWAY_URL).await?;
    let (mut write, mut read) = ws_stream.split();

    let mut heartbeat: Option<tokio::time::Interval> = None;
    let mut seq: Option<u64> = None;
    let mut self_id: Option<String> = None;

    loop {
        let frame = tokio::select! {
            _ = tick(&mut heartbeat) => {
                write.send(Message::text(heartbeat_payload(seq).to_string())).await?;
                continue;
            }
            frame = read.next() => frame,
        };

        let text = match frame {
            Some(Ok(Message::Text(t))) => t,
            Some(Ok(Message::Close(close))) => {
                let code = close.as_ref().map(|c| u16::from(c.code));
                return Ok(match code {
                    Some(code) if FATAL_CLOSE_CODES.contains(&code) => SessionEnd::Fatal(
                        format!("gateway closed with code {code}"),
                    ),
                    _ => SessionEnd::Reconnect,
                });
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
            None => return Ok(SessionEnd::Reconnect),
        };

        let payload: GatewayPayload = match serde_json::from_str(text.as_str()) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("Discord: unparseable gateway frame: {e}");
                continue;
            }
        };
        if payload.s.is_some() {
            seq = payload.s;
        }

        match payload.op {
            OP_HELLO => {
                let hello: Hello = serde_json::from_value(payload.d)?;
                let period = Duration::from_millis(hello.heartbeat_interval);
                let mut interval =
                    tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                heartbeat = Some(interval);
                write
                    .send(Message::text(identify_payload(token.expose_secret()).to_string()))
                    .await?;
            }
            OP_HEARTBEAT => {
                write.send(Message::text(heartbeat_payload(seq).to_string())).await?;
            }
            OP_HEARTBEAT_ACK => {}
            OP_RECONNECT | OP_INVALID_SESSION => return Ok(SessionEnd::Reconnect),
            OP_DISPATCH => match payload.t.as_deref() {
                Some("READY") => {
                    let ready: Ready = serde_json::from_value(payload.d)?;
                    tracing::info!(
                        "Logged in as {} (ID: {})",
                        ready.user.username,
                        ready.user.id
                    );
                    self_id = Some(ready.user.id);
                }
                Some("MESSAGE_CREATE") => {
                    let message: DiscordMessage = match serde_json::from_value(payload.d) {
                        Ok(m) => m,
                        Err(e) => {
                            tracing::warn!("Discord: malformed MESSAGE_CREATE: {e}");
                            continue;
                        }
                    };
                    let incoming = to_incoming(message, self_id.as_deref());
                    if tx.send(incoming).is_err() {
                        return Ok(SessionEnd::ListenerClosed);
                    }
                }
                _ => {}
            },
            other => tracing::debug!(op = other, "Discord: ignoring gateway opcode"),
        }
    }
}

/// Wait for the next heartbeat, or forever before HELLO arrives.
async fn tick(heartbeat: &mut Option<tokio::time::Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn identify_payload(token: &str) -> serde_json::Value {
    serde_json::json!({
        "op": OP_IDENTIFY,
        "d": {
            "token": token,
            "intents": GATEWAY_INTENTS,
            "properties": {
                "os": std::env::consts::OS,
                "browser": "feynman-tutor",
                "device": "feynman-tutor",
            }
        }
    })
}

fn heartbeat_payload(seq: Option<u64>) -> serde_json::Value {
    serde_json::json!({ "op": OP_HEARTBEAT, "d": seq })
}

fn to_incoming(message: DiscordMessage, self_id: Option<&str>) -> IncomingMessage {
    let is_self = self_id.is_some_and(|id| id == message.author.id);
    let display = message
        .author
        .global_name
        .clone()
        .unwrap_or_else(|| message.author.username.clone());

    let mut incoming = IncomingMessage::new(message.channel_id, message.author.id, message.content)
        .with_id(message.id)
        .with_author_name(display)
        .with_bot_author(message.author.bot)
        .with_self_author(is_self);

    for attachment in message.attachments {
        let mut converted = Attachment::new(attachment.filename, attachment.url);
        if let Some(size) = attachment.size {
            converted = converted.with_size(size);
        }
        incoming = incoming.with_attachment(converted);
    }
    incoming
}

/// Split a message into chunks of at most `max_chars` characters.
///
/// Breaks at the last newline inside the window, otherwise hard-cuts at the
/// limit. Newlines at the start of the remainder are dropped, and chunks that
/// are empty or only whitespace are never produced.
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut remaining = text;

    loop {
        // Byte offset of the first character past the limit, if any.
        let Some(limit) = remaining.char_indices().nth(max_chars).map(|(i, _)| i) else {
            if !remaining.trim().is_empty() {
                chunks.push(remaining.to_string());
            }
            break;
        };

        let window = &remaining[..limit];
        // A newline at position 0 would produce an empty chunk.
        let split_at = match window.rfind('\n') {
            Some(i) if i > 0 => i,
            _ => limit,
        };

        let chunk = &remaining[..split_at];
        if !chunk.trim().is_empty() {
            chunks.push(chunk.to_string());
        }
        remaining = remaining[split_at..].trim_start_matches('\n');
    }

    chunks
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> DiscordChannel {
        DiscordChannel::new(SecretString::from("fake-token"))
    }

    #[test]
    fn discord_channel_name() {
        assert_eq!(channel().name(), "discord");
    }

    #[test]
    fn discord_api_url() {
        assert_eq!(
            DiscordChannel::api_url("/channels/42/messages"),
            "https://discord.com/api/v10/channels/42/messages"
        );
    }

    #[test]
    fn discord_auth_header() {
        assert_eq!(channel().auth_header(), "Bot fake-token");
    }

    // ── Gateway payloads ────────────────────────────────────────────

    #[test]
    fn identify_carries_token_and_intents() {
        let payload = identify_payload("abc");
        assert_eq!(payload["op"], 2);
        assert_eq!(payload["d"]["token"], "abc");
        assert_eq!(payload["d"]["intents"], 37377);
    }

    #[test]
    fn heartbeat_carries_sequence() {
        assert_eq!(heartbeat_payload(Some(7))["d"], 7);
        assert!(heartbeat_payload(None)["d"].is_null());
        assert_eq!(heartbeat_payload(None)["op"], 1);
    }

    #[test]
    fn gateway_payload_parses_dispatch() {
        let raw = r#"{"op":0,"s":3,"t":"MESSAGE_CREATE","d":{"id":"1"}}"#;
        let payload: GatewayPayload = serde_json::from_str(raw).unwrap();
        assert_eq!(payload.op, OP_DISPATCH);
        assert_eq!(payload.s, Some(3));
        assert_eq!(payload.t.as_deref(), Some("MESSAGE_CREATE"));
    }

    #[test]
    fn gateway_payload_parses_hello_without_sequence() {
        let raw = r#"{"op":10,"d":{"heartbeat_interval":41250},"s":null,"t":null}"#;
        let payload: GatewayPayload = serde_json::from_str(raw).unwrap();
        let hello: Hello = serde_json::from_value(payload.d).unwrap();
        assert_eq!(hello.heartbeat_interval, 41250);
        assert!(payload.s.is_none());
    }

    // ── MESSAGE_CREATE conversion ───────────────────────────────────

    fn message_json(author_id: &str, bot: bool) -> DiscordMessage {
        serde_json::from_value(serde_json::json!({
            "id": "m1",
            "channel_id": "c1",
            "author": { "id": author_id, "username": "alice", "bot": bot },
            "content": "hello",
            "attachments": [
                { "filename": "notes.md", "url": "https://cdn.example/notes.md", "size": 12 }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn to_incoming_maps_fields() {
        let msg = to_incoming(message_json("u1", false), Some("bot-self"));
        assert_eq!(msg.id, "m1");
        assert_eq!(msg.channel_id, "c1");
        assert_eq!(msg.author_id, "u1");
        assert_eq!(msg.author_label(), "alice");
        assert_eq!(msg.content, "hello");
        assert!(!msg.author_is_bot);
        assert!(!msg.is_self);
        assert_eq!(msg.attachments.len(), 1);
        assert_eq!(msg.attachments[0].filename, "notes.md");
        assert_eq!(msg.attachments[0].size, Some(12));
    }

    #[test]
    fn to_incoming_flags_self_and_bots() {
        let msg = to_incoming(message_json("bot-self", true), Some("bot-self"));
        assert!(msg.is_self);
        assert!(msg.author_is_bot);
    }

    #[test]
    fn to_incoming_before_ready_is_not_self() {
        let msg = to_incoming(message_json("bot-self", true), None);
        assert!(!msg.is_self);
    }

    #[test]
    fn to_incoming_prefers_global_name() {
        let message: DiscordMessage = serde_json::from_value(serde_json::json!({
            "id": "m1",
            "channel_id": "c1",
            "author": { "id": "u1", "username": "alice99", "global_name": "Alice" },
        }))
        .unwrap();
        let msg = to_incoming(message, None);
        assert_eq!(msg.author_label(), "Alice");
        assert!(msg.content.is_empty());
        assert!(msg.attachments.is_empty());
    }

    // ── Message splitting ───────────────────────────────────────────

    #[test]
    fn split_message_short() {
        assert_eq!(split_message("Hello", 2000), vec!["Hello"]);
    }

    #[test]
    fn split_message_empty_produces_nothing() {
        assert!(split_message("", 2000).is_empty());
    }

    #[test]
    fn split_message_whitespace_only_produces_nothing() {
        assert!(split_message("\n\n", 2000).is_empty());
        assert!(split_message("  \n \t ", 2000).is_empty());
    }

    #[test]
    fn split_message_skips_blank_hard_cut_chunk() {
        let msg = format!("{}{}", " ".repeat(2000), "b".repeat(10));
        let chunks = split_message(&msg, 2000);
        assert_eq!(chunks, vec!["b".repeat(10)]);
    }

    #[test]
    fn split_message_exact_limit() {
        let msg = "a".repeat(2000);
        let chunks = split_message(&msg, 2000);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 2000);
    }

    #[test]
    fn split_message_over_limit_on_newline() {
        let msg = format!("{}\n{}", "a".repeat(1500), "b".repeat(1000));
        let chunks = split_message(&msg, 2000);
        assert_eq!(chunks, vec!["a".repeat(1500), "b".repeat(1000)]);
    }

    #[test]
    fn split_message_uses_last_newline_in_window() {
        let msg = format!("{}\n{}\n{}", "a".repeat(500), "b".repeat(1000), "c".repeat(1000));
        let chunks = split_message(&msg, 2000);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], format!("{}\n{}", "a".repeat(500), "b".repeat(1000)));
        assert_eq!(chunks[1], "c".repeat(1000));
    }

    #[test]
    fn split_message_ignores_spaces() {
        let msg = format!("{} {}", "a".repeat(1500), "b".repeat(1000));
        let chunks = split_message(&msg, 2000);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chars().count(), 2000);
    }

    #[test]
    fn split_message_no_good_split_point() {
        let msg = "a".repeat(4500);
        let chunks = split_message(&msg, 2000);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 2000);
        assert_eq!(chunks[1].len(), 2000);
        assert_eq!(chunks[2].len(), 500);
    }

    #[test]
    fn split_message_drops_leading_newlines_of_remainder() {
        let msg = format!("{}\n\n\n{}", "a".repeat(1999), "b".repeat(10));
        let chunks = split_message(&msg, 2000);
        assert_eq!(chunks, vec!["a".repeat(1999), "b".repeat(10)]);
    }

    #[test]
    fn split_message_leading_newline_hard_cuts() {
        let msg = format!("\n{}", "a".repeat(2500));
        let chunks = split_message(&msg, 2000);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chars().count(), 2000);
        assert!(chunks.iter().all(|c| !c.is_empty()));
    }

    #[test]
    fn split_message_counts_characters_not_bytes() {
        let msg = "é".repeat(2500);
        let chunks = split_message(&msg, 2000);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chars().count(), 2000);
        assert_eq!(chunks[1].chars().count(), 500);
    }

    // ── Network error tests (expected to fail with a fake token) ────

    #[tokio::test]
    async fn fetch_attachment_bad_url_errors() {
        let err = channel()
            .fetch_attachment(&Attachment::new("x.md", "http://127.0.0.1:1/x.md"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::AttachmentFailed { .. }));
    }
}
