//! Instant message handler (§4.5): `iS` (ack response, no echo) and `iT`
//! (noop response, echo). Same multi-frame reassembly discipline as chat,
//! keyed by stream id but on a separate accumulator.

use crate::context::{ConnState, Services};
use crate::registry::UserRegistry;
use byteorder::{BigEndian, WriteBytesExt};
use common::error::{HandlerError, HandlerResult};
use protocol::frame::{read_stream_id, InboundFrame, OutboundFrame};
use protocol::split::{sanitize_ascii, split_message, IM_CHUNK_LEN};
use slog::{info, warn};
use std::sync::Arc;
use std::time::Duration;

const IM_BURST: usize = 10;

/// Builds a delivered-or-echoed IM payload: conversation id, sender name,
/// then the message body (§4.5: "windowId=conversationId, sender, body").
fn im_body(conversation_id: u16, sender: &str, body: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + sender.len() + body.len());
    out.write_u16::<BigEndian>(conversation_id).expect("vec write is infallible");
    out.push(sender.len() as u8);
    out.extend_from_slice(sender.as_bytes());
    out.write_u16::<BigEndian>(body.len() as u16).expect("vec write is infallible");
    out.extend_from_slice(body.as_bytes());
    out
}

pub async fn handle_im(services: &Services, state: &mut ConnState, frame: &InboundFrame) -> HandlerResult<()> {
    let sender = state
        .screenname()
        .ok_or_else(|| HandlerError::Session("iS/iT before sign-on".into()))?
        .to_string();
    let sender_conn = state
        .conn
        .clone()
        .ok_or_else(|| HandlerError::Session("iS/iT with no registered connection".into()))?;

    let echo = frame.token == *b"iT";

    if frame.body.len() < 3 {
        return Err(HandlerError::Transient("IM frame too short".into()));
    }
    let stream_id = read_stream_id(&frame.body).map_err(|e| HandlerError::Transient(e.to_string()))?;
    let is_end = frame.body[2] & 0x01 != 0;
    let chunk = &frame.body[3..];

    let Some(accumulated) = state.im_reassembler.accept(stream_id, chunk, is_end) else {
        return Ok(());
    };

    let fields = services.fdo.extract_stream(&accumulated);
    let message = match fields.get("message") {
        Some(m) => sanitize_ascii(m),
        None => return Err(HandlerError::Transient("IM stream missing message field".into())),
    };

    let response_id: Option<u32> = fields.get("responseId").and_then(|v| v.parse().ok());
    if let Some(rid) = response_id {
        if rid == 0 || rid > 0xFFFF {
            warn!(services.logger, "IM responseId out of 16-bit range, sending anyway";
                "user" => &sender, "response_id" => rid);
        }
    }

    let recipient: Option<String> = match fields.get("recipient").filter(|r| !r.is_empty()) {
        Some(r) => Some(r.clone()),
        None => {
            let rid = match response_id {
                Some(rid) => rid as u16,
                None => return Err(HandlerError::Transient("IM reply missing responseId".into())),
            };
            match services.conv_ids.other_participant(rid, &sender) {
                Some(other) => Some(other),
                None => return Ok(()),
            }
        }
    };
    let Some(recipient) = recipient else { return Ok(()) };

    let conversation_id = services.conv_ids.get_or_create(&sender, &recipient);

    if services.bots.is_bot(&recipient) {
        deliver_bot_im_replies(services, &recipient, &sender, conversation_id, &message);
    } else if let Some(recipient_conn) = services.registry.get_connection(&recipient) {
        if recipient_conn.dod_exclusivity_active() {
            // IMs are dropped, not deferred, while the recipient has DOD
            // exclusivity active (§4.5, §9 open question 4).
        } else {
            for chunk in split_message(&message, IM_CHUNK_LEN) {
                let deliver = OutboundFrame::new(*b"IM", im_body(conversation_id, &sender, &chunk));
                recipient_conn.pacer().enqueue_and_drain(deliver, "IM", IM_BURST);
            }
        }
    }

    if echo {
        for chunk in split_message(&message, IM_CHUNK_LEN) {
            let echoed = OutboundFrame::new(*b"IE", im_body(conversation_id, &sender, &chunk));
            sender_conn.pacer().enqueue_and_drain(echoed, "IM-echo", IM_BURST);
        }
    }

    Ok(())
}

/// Runs the bot pipeline's reply schedule for an IM and delivers each
/// message back to the human side of the conversation (mirrors
/// `chat::deliver_bot_chat_replies`, targeted at one recipient instead of
/// a broadcast).
fn deliver_bot_im_replies(services: &Services, bot: &str, human: &str, conversation_id: u16, message: &str) {
    let scheduled = services.bots.handle_im(human, bot, message);
    for msg in scheduled {
        if msg.delay_ms == 0 {
            deliver_bot_im_message(services, bot, human, conversation_id, &msg.body);
        } else {
            let registry = services.registry.clone();
            let logger = services.logger.clone();
            let bot = bot.to_string();
            let human = human.to_string();
            let body = msg.body.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(msg.delay_ms)).await;
                deliver_bot_im_message_detached(&registry, &logger, &bot, &human, conversation_id, &body);
            });
        }
    }
}

fn deliver_bot_im_message(services: &Services, bot: &str, human: &str, conversation_id: u16, body: &str) {
    deliver_bot_im_message_detached(&services.registry, &services.logger, bot, human, conversation_id, body)
}

fn deliver_bot_im_message_detached(
    registry: &Arc<UserRegistry>,
    logger: &slog::Logger,
    bot: &str,
    human: &str,
    conversation_id: u16,
    body: &str,
) {
    let Some(conn) = registry.get_connection(human) else { return };
    for chunk in split_message(&sanitize_ascii(body), IM_CHUNK_LEN) {
        let frame = OutboundFrame::new(*b"IM", im_body(conversation_id, bot, &chunk));
        conn.pacer().enqueue_and_drain(frame, "IM-bot", IM_BURST);
    }
    info!(logger, "bot IM reply delivered"; "bot" => bot, "to" => human);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ConnState;
    use crate::convid::ConversationIdManager;
    use crate::guest::EphemeralGuestRegistry;
    use crate::ports::{BotPipeline, FdoChunk, ScheduledBotMessage};
    use crate::registry::{DisconnectHandle, UserConnection, UserRegistry};
    use crate::session::Platform;
    use protocol::pacer::PacerHandle;
    use std::collections::HashMap as StdHashMap;
    use std::sync::Mutex;

    #[test]
    fn im_body_round_trips_shape() {
        let body = im_body(10_001, "Bobby", "hi there");
        assert_eq!(u16::from_be_bytes([body[0], body[1]]), 10_001);
        assert_eq!(body[2] as usize, 5);
        assert_eq!(&body[3..8], b"Bobby");
    }

    /// Decodes `key=value;key=value` pairs, matching the shape the
    /// server's real FDO compiler hands IM handlers.
    struct KvFdo;
    impl crate::ports::FdoCompiler for KvFdo {
        fn compile(&self, _source: &str, _token: [u8; 2], _stream_id: u16) -> Vec<FdoChunk> {
            Vec::new()
        }
        fn extract_stream(&self, bytes: &[u8]) -> StdHashMap<String, String> {
            let text = String::from_utf8_lossy(bytes);
            let mut fields = StdHashMap::new();
            for pair in text.split(';') {
                if let Some((k, v)) = pair.split_once('=') {
                    fields.insert(k.to_string(), v.to_string());
                }
            }
            fields
        }
        fn resolve_source(&self, _gid: u32, _low_color: bool) -> Option<String> {
            None
        }
        fn extract_fh_requests(&self, _bytes: &[u8]) -> (u32, Vec<(u16, u32)>) {
            (0, Vec::new())
        }
    }

    struct NullArt;
    impl crate::ports::ArtStore for NullArt {
        fn get(&self, _gid: u32) -> Option<Vec<u8>> {
            None
        }
    }

    struct AlwaysFail;
    impl crate::ports::CredentialStore for AlwaysFail {
        fn verify(&self, _screenname: &str, _password: &str) -> bool {
            false
        }
    }

    /// A bot that echoes every IM it receives straight back to the sender.
    struct EchoBot;
    impl BotPipeline for EchoBot {
        fn is_bot(&self, screenname: &str) -> bool {
            screenname == "ServerBot"
        }
        fn handle_chat(&self, _sender: &str, _message: &str) -> Vec<ScheduledBotMessage> {
            Vec::new()
        }
        fn handle_im(&self, _sender: &str, _recipient: &str, message: &str) -> Vec<ScheduledBotMessage> {
            vec![ScheduledBotMessage { delay_ms: 0, body: format!("echo: {message}") }]
        }
    }

    fn test_services(bots: std::sync::Arc<dyn BotPipeline>) -> Services {
        Services {
            registry: std::sync::Arc::new(UserRegistry::new(slog::Logger::root(slog::Discard, slog::o!()))),
            conv_ids: std::sync::Arc::new(ConversationIdManager::new()),
            guests: std::sync::Arc::new(EphemeralGuestRegistry::new()),
            bots,
            fdo: std::sync::Arc::new(KvFdo),
            art: std::sync::Arc::new(NullArt),
            credentials: std::sync::Arc::new(AlwaysFail),
            idb_reference: Mutex::new(StdHashMap::new()),
            burst: 16,
            co_timeout_secs: 10,
            xfer_xg_timeout_secs: 30,
            allow_ephemeral: false,
            upload_root: std::env::temp_dir(),
            recent_events: Mutex::new(protocol::ring::RingBuffer::new(16)),
            logger: slog::Logger::root(slog::Discard, slog::o!()),
        }
    }

    fn im_frame(token: [u8; 2], stream_id: u16, is_end: bool, chunk: &[u8]) -> InboundFrame {
        let mut body = Vec::with_capacity(3 + chunk.len());
        body.extend_from_slice(&stream_id.to_be_bytes());
        body.push(if is_end { 0x01 } else { 0x00 });
        body.extend_from_slice(chunk);
        InboundFrame { tx: 0, rx: 0, token, body }
    }

    fn disconnect_handle() -> DisconnectHandle {
        tokio::sync::mpsc::unbounded_channel().0
    }

    #[tokio::test]
    async fn bot_im_reply_is_delivered_back_to_sender() {
        let services = test_services(std::sync::Arc::new(EchoBot));
        let mut state = ConnState::new(0);
        let (pacer, mut rx) = PacerHandle::new();
        let conn = UserConnection::new("Bobby".to_string(), pacer, Platform::Unknown, disconnect_handle());
        services.registry.register("Bobby", conn.clone());
        state.session.authenticate("Bobby".to_string(), false);
        state.conn = Some(conn);

        let frame = im_frame(*b"iS", 0x10, true, b"recipient=ServerBot;message=hello bot");
        handle_im(&services, &mut state, &frame).await.unwrap();

        let mut frames = Vec::new();
        while let Ok(bytes) = rx.try_recv() {
            frames.push(bytes);
        }
        assert_eq!(frames.len(), 1, "iS sends no echo, only the bot's scheduled reply");
        assert_eq!(&frames[0][8..10], b"IM");
    }

    #[tokio::test]
    async fn long_im_is_split_at_the_512_char_limit() {
        let services = test_services(std::sync::Arc::new(crate::ports::NullBotPipeline));
        let mut state = ConnState::new(0);
        let (pacer, mut rx) = PacerHandle::new();
        let conn = UserConnection::new("Bobby".to_string(), pacer, Platform::Unknown, disconnect_handle());
        services.registry.register("Bobby", conn.clone());
        let (recipient_pacer, mut recipient_rx) = PacerHandle::new();
        let recipient_conn =
            UserConnection::new("Ann".to_string(), recipient_pacer, Platform::Unknown, disconnect_handle());
        services.registry.register("Ann", recipient_conn);
        state.session.authenticate("Bobby".to_string(), false);
        state.conn = Some(conn);

        let long_message = "a".repeat(1000);
        let body = format!("recipient=Ann;message={long_message}");
        let frame = im_frame(*b"iS", 0x11, true, body.as_bytes());
        handle_im(&services, &mut state, &frame).await.unwrap();

        let mut frames = Vec::new();
        while let Ok(bytes) = recipient_rx.try_recv() {
            frames.push(bytes);
        }
        assert_eq!(frames.len(), 2, "1000 chars split at 512 into two IM frames");
        while rx.try_recv().is_ok() {}
    }
}
