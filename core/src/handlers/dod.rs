//! Download On Demand handler (§4.6): `fh` (form, multi-GID), `f1` (atom
//! stream), `f2` (picture/idb), `K1` (inner-FDO wrapped, echoes a response
//! id). All four share GID resolution, stream id normalization, and IDB
//! drift detection.

use crate::context::{ConnState, Services};
use byteorder::{BigEndian, WriteBytesExt};
use common::error::{HandlerError, HandlerResult};
use protocol::frame::{read_stream_id, short_frame, InboundFrame, OutboundFrame, TYPE_ACK};
use protocol::gid::read_gid_at;
use slog::info;

const DOD_BURST: usize = 10;
/// Substituted whenever the extracted stream id is 0 or 0xFFFF (§4.6).
const DEFAULT_STREAM_ID: u16 = 0x2100;

fn normalize_stream_id(id: u16) -> u16 {
    if id == 0 || id == 0xFFFF {
        DEFAULT_STREAM_ID
    } else {
        id
    }
}

fn conn_low_color(state: &ConnState) -> bool {
    state.session.low_color
}

/// Records the first compiled byte sequence for `gid`, or diffs against it
/// and logs drift as an operational aid (§4.6) — never an error.
fn check_idb_drift(services: &Services, gid: u32, compiled: &[u8]) {
    let mut reference = services.idb_reference.lock().expect("idb reference mutex poisoned");
    match reference.get(&gid) {
        None => {
            reference.insert(gid, compiled.to_vec());
        }
        Some(prev) if prev.as_slice() == compiled => {}
        Some(prev) => {
            let first_diff = prev
                .iter()
                .zip(compiled.iter())
                .position(|(a, b)| a != b)
                .unwrap_or_else(|| prev.len().min(compiled.len()));
            let differing = prev.iter().zip(compiled.iter()).filter(|(a, b)| a != b).count()
                + prev.len().abs_diff(compiled.len());
            let ctx_start = first_diff.saturating_sub(20);
            let prev_ctx = &prev[ctx_start..prev.len().min(first_diff + 20)];
            let new_ctx = &compiled[ctx_start..compiled.len().min(first_diff + 20)];
            info!(services.logger, "IDB drift detected";
                "gid" => gid, "first_diff_offset" => first_diff, "differing_bytes" => differing,
                "prev_context" => format!("{:02x?}", prev_ctx), "new_context" => format!("{:02x?}", new_ctx));
        }
    }
}

pub async fn handle_f2(services: &Services, state: &mut ConnState, frame: &InboundFrame) -> HandlerResult<()> {
    let Some(conn) = state.conn.clone() else {
        return Err(HandlerError::Session("f2 with no registered connection".into()));
    };
    let low_color = conn_low_color(state);
    let stream_id = normalize_stream_id(read_stream_id(&frame.body).unwrap_or(0));

    let Some(gid) = read_gid_at(&frame.body, 2) else {
        conn.pacer().send_raw(short_frame(TYPE_ACK).to_vec());
        return Ok(());
    };

    if let Some(source) = services.fdo.resolve_source(gid, low_color) {
        let processed = services.fdo.preprocess(&source, "default");
        let chunks = services.fdo.compile(&processed, *b"f2", stream_id);
        let payload: Vec<u8> = chunks.into_iter().flatten().collect();
        check_idb_drift(services, gid, &payload);
        send_idb_response(&conn, stream_id, gid, b'a', &payload);
    } else if let Some(bytes) = services.art.get(gid) {
        check_idb_drift(services, gid, &bytes);
        send_idb_response(&conn, stream_id, gid, b'p', &bytes);
    } else {
        conn.pacer().send_raw(short_frame(TYPE_ACK).to_vec());
    }

    Ok(())
}

fn send_idb_response(conn: &crate::registry::UserConnection, stream_id: u16, gid: u32, kind: u8, payload: &[u8]) {
    let mut body = Vec::with_capacity(7 + payload.len());
    body.write_u16::<BigEndian>(stream_id).expect("vec write is infallible");
    body.write_u32::<BigEndian>(gid).expect("vec write is infallible");
    body.push(kind);
    body.extend_from_slice(payload);
    conn.pacer().enqueue_and_drain(OutboundFrame::new(*b"f2", body), "f2", DOD_BURST);
}

pub async fn handle_f1(services: &Services, state: &mut ConnState, frame: &InboundFrame) -> HandlerResult<()> {
    let Some(conn) = state.conn.clone() else {
        return Err(HandlerError::Session("f1 with no registered connection".into()));
    };
    let low_color = conn_low_color(state);
    let stream_id = normalize_stream_id(read_stream_id(&frame.body).unwrap_or(0));

    let Some(gid) = read_gid_at(&frame.body, 10) else {
        send_f1_template(services, &conn, stream_id, "f1 failed");
        return Ok(());
    };

    match services.fdo.resolve_source(gid, low_color) {
        Some(source) => {
            let processed = services.fdo.preprocess(&source, "default");
            let chunks = services.fdo.compile(&processed, *b"f1", stream_id);
            let payload: Vec<u8> = chunks.into_iter().flatten().collect();
            check_idb_drift(services, gid, &payload);
            let mut body = Vec::with_capacity(4 + payload.len());
            body.write_u16::<BigEndian>(stream_id).expect("vec write is infallible");
            body.write_u32::<BigEndian>(gid).expect("vec write is infallible");
            body.extend_from_slice(&payload);
            conn.pacer().enqueue_and_drain(OutboundFrame::new(*b"f1", body), "f1", DOD_BURST);
        }
        None => send_f1_template(services, &conn, stream_id, "f1 empty"),
    }

    Ok(())
}

fn send_f1_template(services: &Services, conn: &crate::registry::UserConnection, stream_id: u16, template: &str) {
    let chunks = services.fdo.compile(template, *b"f1", stream_id);
    let payload: Vec<u8> = chunks.into_iter().flatten().collect();
    conn.pacer().enqueue_and_drain(OutboundFrame::new(*b"f1", payload), "f1-template", DOD_BURST);
}

pub async fn handle_k1(services: &Services, state: &mut ConnState, frame: &InboundFrame) -> HandlerResult<()> {
    let Some(conn) = state.conn.clone() else {
        return Err(HandlerError::Session("K1 with no registered connection".into()));
    };
    let low_color = conn_low_color(state);
    let stream_id = normalize_stream_id(read_stream_id(&frame.body).unwrap_or(0));
    let fields = services.fdo.extract_stream(&frame.body);

    let gid: Option<u32> = fields.get("gid").and_then(|s| s.parse().ok());
    let response_id: u16 = fields.get("responseId").and_then(|s| s.parse().ok()).unwrap_or(0);

    let source = gid.and_then(|g| services.fdo.resolve_source(g, low_color));
    match source {
        Some(source) => {
            let processed = services.fdo.preprocess(&source, "default");
            let chunks = services.fdo.compile(&processed, *b"K1", stream_id);
            let payload: Vec<u8> = chunks.into_iter().flatten().collect();
            if let Some(g) = gid {
                check_idb_drift(services, g, &payload);
            }
            let mut body = Vec::with_capacity(2 + payload.len());
            body.write_u16::<BigEndian>(response_id).expect("vec write is infallible");
            body.extend_from_slice(&payload);
            conn.pacer().enqueue_and_drain(OutboundFrame::new(*b"K1", body), "K1", DOD_BURST);
        }
        None => {
            let chunks = services.fdo.compile("K1 noop", *b"K1", stream_id);
            let payload: Vec<u8> = chunks.into_iter().flatten().collect();
            conn.pacer().enqueue_and_drain(OutboundFrame::new(*b"K1", payload), "K1-noop", DOD_BURST);
        }
    }

    Ok(())
}

pub async fn handle_fh(services: &Services, state: &mut ConnState, frame: &InboundFrame) -> HandlerResult<()> {
    let Some(conn) = state.conn.clone() else {
        return Err(HandlerError::Session("fh with no registered connection".into()));
    };
    let low_color = conn_low_color(state);
    let stream_id = normalize_stream_id(read_stream_id(&frame.body).unwrap_or(0));
    let (form_id, pairs) = services.fdo.extract_fh_requests(&frame.body);

    if pairs.is_empty() {
        conn.pacer().send_raw(short_frame(TYPE_ACK).to_vec());
        return Ok(());
    }

    for (transaction_id, gid) in pairs {
        let payload = match services.fdo.resolve_source(gid, low_color) {
            Some(source) => {
                let processed = services.fdo.preprocess(&source, "default");
                let chunks = services.fdo.compile(&processed, *b"fh", stream_id);
                chunks.into_iter().flatten().collect()
            }
            None => Vec::new(),
        };
        check_idb_drift(services, gid, &payload);

        let mut body = Vec::with_capacity(12 + payload.len());
        body.write_u16::<BigEndian>(stream_id).expect("vec write is infallible");
        body.write_u32::<BigEndian>(form_id).expect("vec write is infallible");
        body.write_u16::<BigEndian>(transaction_id).expect("vec write is infallible");
        body.write_u32::<BigEndian>(gid).expect("vec write is infallible");
        body.extend_from_slice(&payload);
        conn.pacer().enqueue_and_drain(OutboundFrame::new(*b"fh", body), "fh", DOD_BURST);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_id_normalization_substitutes_default() {
        assert_eq!(normalize_stream_id(0), DEFAULT_STREAM_ID);
        assert_eq!(normalize_stream_id(0xFFFF), DEFAULT_STREAM_ID);
        assert_eq!(normalize_stream_id(0x1234), 0x1234);
    }
}
