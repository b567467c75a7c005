//! Chat token handler (§4.4): `Aa` (message), `ME`/`CJ` (join request), `CO`
//! (join confirm), `CL` (leave).

use crate::context::{ConnState, Services};
use protocol::frame::{read_stream_id, InboundFrame, OutboundFrame};
use protocol::split::{sanitize_ascii, split_message, CHAT_CHUNK_LEN};
use common::error::{HandlerError, HandlerResult};
use slog::{info, warn};
use std::time::Duration;

/// Builds the `mS CA`/`mS CB` chat notification payload: atom length byte,
/// the "mS" atom tag, a space-prefixed command (`CA`/`CB`), the subject's
/// chat tag, then their screenname (§6).
fn notification_body(command: u8, tag: u8, screenname: &str) -> Vec<u8> {
    let mut tail = Vec::with_capacity(6 + screenname.len());
    tail.extend_from_slice(b"mS");
    tail.push(b' ');
    tail.push(b'C');
    tail.push(command);
    tail.push(tag);
    tail.extend_from_slice(screenname.as_bytes());

    let mut body = Vec::with_capacity(tail.len() + 1);
    body.push(tail.len() as u8);
    body.extend_from_slice(&tail);
    body
}

/// Builds the room snapshot sent to a joiner on CJ/ME: a count byte
/// followed by `(tag, nameLen, name)` entries for every resident bot, every
/// already-seated member (join order), then the joiner themselves.
fn room_snapshot_body(entries: &[(u8, &str)]) -> Vec<u8> {
    let mut body = Vec::with_capacity(1 + entries.len() * 12);
    body.push(entries.len() as u8);
    for (tag, name) in entries {
        body.push(*tag);
        body.push(name.len() as u8);
        body.extend_from_slice(name.as_bytes());
    }
    body
}

pub async fn handle_join(services: &Services, state: &mut ConnState, _frame: &InboundFrame) -> HandlerResult<()> {
    let name = state
        .screenname()
        .ok_or_else(|| HandlerError::Session("CJ/ME before sign-on".into()))?
        .to_string();
    let conn = state
        .conn
        .clone()
        .ok_or_else(|| HandlerError::Session("CJ/ME with no registered connection".into()))?;

    let my_tag = services.registry.assign_global_chat_tag(&name);
    if my_tag < 0 {
        return Err(HandlerError::Fatal("chat tag pool exhausted".into()));
    }

    let mut entries: Vec<(u8, String)> = Vec::new();
    for bot in services.bots.resident_bots() {
        let tag = services.registry.assign_global_chat_tag(&bot);
        if tag >= 0 {
            entries.push((tag as u8, bot));
        }
    }
    for member in services.registry.get_ordered_chat_members() {
        entries.push((
            services.registry.current_chat_tag(member.screenname()).unwrap_or(0),
            member.screenname().to_string(),
        ));
    }
    entries.push((my_tag as u8, name.clone()));

    let entry_refs: Vec<(u8, &str)> = entries.iter().map(|(t, n)| (*t, n.as_str())).collect();
    let snapshot = OutboundFrame::new(*b"CJ", room_snapshot_body(&entry_refs));
    conn.pacer().enqueue_and_drain(snapshot, "room-snapshot", services.burst);

    let generation = conn.begin_chat_join();
    let timeout = Duration::from_secs(services.co_timeout_secs);
    let logger = services.logger.clone();
    let timeout_conn = conn.clone();
    let timeout_name = name.clone();
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        if timeout_conn.chat_join_still_pending(generation) {
            warn!(logger, "chat join confirmation timed out"; "user" => timeout_name);
        }
    });

    Ok(())
}

pub async fn handle_co(services: &Services, state: &mut ConnState, _frame: &InboundFrame) -> HandlerResult<()> {
    let name = state
        .screenname()
        .ok_or_else(|| HandlerError::Session("CO before sign-on".into()))?
        .to_string();
    let conn = state
        .conn
        .clone()
        .ok_or_else(|| HandlerError::Session("CO with no registered connection".into()))?;

    conn.confirm_chat_join();
    let tag = services.registry.assign_global_chat_tag(&name);
    if tag < 0 {
        return Err(HandlerError::Fatal("chat tag pool exhausted".into()));
    }
    conn.set_in_chat(true);

    let frame = OutboundFrame::new(*b"CA", notification_body(b'A', tag as u8, &name));
    let report = services.registry.broadcast_to_chat(&frame, "CA", Some(&name), services.burst);
    info!(services.logger, "chat join confirmed"; "user" => &name, "tag" => tag,
        "broadcast" => report.broadcast);
    services.note_event(format!("chat join {name}"));

    Ok(())
}

pub async fn handle_cl(services: &Services, state: &mut ConnState, _frame: &InboundFrame) -> HandlerResult<()> {
    leave_chat_if_present(services, state, "CL").await;
    Ok(())
}

/// Shared departure path for CL and disconnect (§4.4, §4.9): must run
/// identically from either trigger.
pub async fn leave_chat_if_present(services: &Services, state: &mut ConnState, reason: &'static str) {
    let Some(name) = state.screenname().map(str::to_owned) else { return };
    let Some(conn) = state.conn.clone() else { return };

    conn.clear_chat_join_pending();
    if !conn.in_chat() {
        return;
    }

    let tag = services.registry.current_chat_tag(&name).unwrap_or(0);
    let frame = OutboundFrame::new(*b"CB", notification_body(b'B', tag, &name));
    let report = services.registry.broadcast_to_chat(&frame, "CB", Some(&name), services.burst);

    conn.set_in_chat(false);
    services.registry.release_tag(&name);

    info!(services.logger, "chat departure"; "user" => &name, "reason" => reason,
        "broadcast" => report.broadcast);
    services.note_event(format!("chat leave {name} ({reason})"));
}

pub async fn handle_aa(services: &Services, state: &mut ConnState, frame: &InboundFrame) -> HandlerResult<()> {
    let name = state
        .screenname()
        .ok_or_else(|| HandlerError::Session("Aa before sign-on".into()))?
        .to_string();
    let conn = state
        .conn
        .clone()
        .ok_or_else(|| HandlerError::Session("Aa with no registered connection".into()))?;

    if frame.body.len() < 3 {
        return Err(HandlerError::Transient("Aa frame too short".into()));
    }
    let stream_id = read_stream_id(&frame.body).map_err(|e| HandlerError::Transient(e.to_string()))?;
    let is_end = frame.body[2] & 0x01 != 0;
    let chunk = &frame.body[3..];

    let Some(accumulated) = state.chat_reassembler.accept(stream_id, chunk, is_end) else {
        return Ok(());
    };

    let fields = services.fdo.extract_stream(&accumulated);
    let message = match fields.get("message") {
        Some(m) => sanitize_ascii(m),
        None => return Err(HandlerError::Transient("Aa stream missing message field".into())),
    };

    let Some(tag) = services.registry.current_chat_tag(&name) else {
        return Ok(());
    };

    for part in split_message(&message, CHAT_CHUNK_LEN) {
        let mut body = Vec::with_capacity(1 + part.len());
        body.push(tag);
        body.extend_from_slice(part.as_bytes());
        let aa_frame = OutboundFrame::new(*b"AA", body);

        conn.pacer().enqueue_and_drain(aa_frame.clone(), "AA", services.burst);
        let report = services.registry.broadcast_to_chat(&aa_frame, "AA", Some(&name), services.burst);
        info!(services.logger, "chat broadcast dispatched"; "user" => &name, "broadcast" => report.broadcast);
    }

    deliver_bot_chat_replies(services, &name, &message);
    Ok(())
}

/// Schedules bot replies (§9: "task-producing-list-of-messages; emit the
/// first immediately, schedule the rest via a monotonic timer").
fn deliver_bot_chat_replies(services: &Services, sender: &str, message: &str) {
    let scheduled = services.bots.handle_chat(sender, message);
    for msg in scheduled {
        if msg.delay_ms == 0 {
            broadcast_bot_chat_message(services, sender, &msg.body);
        } else {
            let registry = services.registry.clone();
            let logger = services.logger.clone();
            let burst = services.burst;
            let body = msg.body.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(msg.delay_ms)).await;
                broadcast_bot_chat_message_detached(&registry, &logger, burst, &body);
            });
        }
    }
}

fn broadcast_bot_chat_message(services: &Services, _trigger: &str, body: &str) {
    broadcast_bot_chat_message_detached(&services.registry, &services.logger, services.burst, body)
}

fn broadcast_bot_chat_message_detached(
    registry: &std::sync::Arc<crate::registry::UserRegistry>,
    logger: &slog::Logger,
    burst: usize,
    body: &str,
) {
    // Bot chat output has no single sender tag in this design; bots share
    // tag allocation with human members under their own screenname.
    let report = registry.broadcast_to_chat(
        &OutboundFrame::new(*b"AA", {
            let mut b = vec![1u8];
            b.extend_from_slice(sanitize_ascii(body).as_bytes());
            b
        }),
        "AA-bot",
        None,
        burst,
    );
    info!(logger, "bot chat reply broadcast"; "broadcast" => report.broadcast);
}
