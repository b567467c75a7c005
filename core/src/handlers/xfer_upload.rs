//! XFER upload (§4.8): client-originated file upload. `th`/`td`/`tf(0x80)`
//! are server-initiated prompts; the client answers with its own `th`/`td`
//! replies, then streams `xd`/`xb` data, ending with `xe` or aborting `xK`.

use crate::registry::UserConnection;
use crate::session::Platform;
use byteorder::{BigEndian, WriteBytesExt};
use common::error::{HandlerError, HandlerResult};
use protocol::encoding::decode;
use protocol::frame::{InboundFrame, OutboundFrame};
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadPhase {
    AwaitingThResponse,
    AwaitingTdResponse,
    AwaitingData,
    ReceivingData,
    Completed,
    Aborted,
    Failed,
}

/// Per-connection choice of opportunistic flow control strategy (§4.8):
/// both MUST be correct-by-construction, so the state machine doesn't care
/// which is active beyond the trigger count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControl {
    EveryNthFrame(u32),
}

impl FlowControl {
    pub fn sixth_frame() -> Self {
        FlowControl::EveryNthFrame(6)
    }

    pub fn eighth_frame_proactive_ack() -> Self {
        FlowControl::EveryNthFrame(8)
    }

    fn should_prompt(&self, frame_count: u32) -> bool {
        match self {
            FlowControl::EveryNthFrame(n) => frame_count > 0 && frame_count.is_multiple_of(*n),
        }
    }
}

struct UploadState {
    phase: UploadPhase,
    resp_token: [u8; 2],
    platform: Platform,
    flow_control: FlowControl,
    filename: Option<String>,
    expected_size: u32,
    received_bytes: u64,
    frame_count: u32,
    target_path: Option<PathBuf>,
    sink: Option<File>,
}

pub struct UploadRegistry {
    state: Option<UploadState>,
}

impl UploadRegistry {
    pub fn new() -> Self {
        UploadRegistry { state: None }
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.state.as_ref().map(|s| s.phase),
            Some(UploadPhase::AwaitingThResponse)
                | Some(UploadPhase::AwaitingTdResponse)
                | Some(UploadPhase::AwaitingData)
                | Some(UploadPhase::ReceivingData)
        )
    }

    pub fn phase(&self) -> Option<UploadPhase> {
        self.state.as_ref().map(|s| s.phase)
    }

    pub fn received_bytes(&self) -> u64 {
        self.state.as_ref().map(|s| s.received_bytes).unwrap_or(0)
    }

    /// Sends `th` (119 B: respToken + 117 reserved bytes) and arms
    /// `AwaitingThResponse`.
    pub fn initiate(&mut self, conn: &UserConnection, resp_token: [u8; 2], platform: Platform, flow_control: FlowControl) {
        let mut body = Vec::with_capacity(119);
        body.extend_from_slice(&resp_token);
        body.resize(119, 0);
        conn.pacer().enqueue_and_drain(OutboundFrame::new(*b"th", body), "th", 4);

        self.state = Some(UploadState {
            phase: UploadPhase::AwaitingThResponse,
            resp_token,
            platform,
            flow_control,
            filename: None,
            expected_size: 0,
            received_bytes: 0,
            frame_count: 0,
            target_path: None,
            sink: None,
        });
    }

    pub fn cancel_all(&mut self) {
        if let Some(state) = self.state.take() {
            cleanup_partial(&state);
        }
    }
}

impl Default for UploadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn cleanup_partial(state: &UploadState) {
    if let Some(path) = &state.target_path {
        let _ = std::fs::remove_file(path);
    }
}

/// Reduces a client-submitted path (which may be an absolute Windows/Mac
/// path, §4.8) to a bare, safe filename: strips directory components and
/// drops anything but `[A-Za-z0-9._-]`, so a target path built by joining
/// this onto `upload_root` can never escape it.
fn sanitize_filename(raw: &str) -> String {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or(raw);
    let cleaned: String =
        base.chars().filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')).collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "upload.bin".to_string()
    } else {
        cleaned
    }
}

/// Builds TD_IN (68 B, §6): respToken + field + 65-byte name.
fn build_td(resp_token: [u8; 2], field: u8, name: &str) -> Vec<u8> {
    let mut body = Vec::with_capacity(68);
    body.extend_from_slice(&resp_token);
    body.push(field);
    let mut name_slot = name.as_bytes().to_vec();
    name_slot.truncate(64);
    name_slot.push(0);
    name_slot.resize(65, 0);
    body.extend_from_slice(&name_slot);
    body
}

/// Builds the TF_IN (87 B, §6) start-upload frame. Windows clients carry
/// the filename with a trailing `NUL`, the `0x90` separator, and the
/// 2-byte response token (§4.8: the NUL pre-empts a client-side crash);
/// Mac clients omit the separator entirely.
fn build_tf_start(size: u32, platform: Platform, name: &str, resp_token: [u8; 2]) -> Vec<u8> {
    let mut body = Vec::with_capacity(87);
    body.push(0x80);
    let size_le = size.to_le_bytes();
    body.extend_from_slice(&size_le[..3]);
    body.push(0);
    body.push(0);
    body.extend_from_slice(&0u16.to_le_bytes());
    body.push(0);
    body.extend_from_slice(&0u16.to_le_bytes());
    body.write_u32::<BigEndian>(0).expect("vec write is infallible");
    body.write_u32::<BigEndian>(0).expect("vec write is infallible");

    let mut name_slot = name.as_bytes().to_vec();
    match platform {
        Platform::Windows => {
            name_slot.truncate(63);
            name_slot.push(0);
            name_slot.push(0x90);
            name_slot.extend_from_slice(&resp_token);
        }
        Platform::Mac | Platform::Unknown => {
            name_slot.truncate(67);
            name_slot.push(0);
        }
    }
    name_slot.resize(68, 0);
    body.extend_from_slice(&name_slot);
    body
}

fn fail(services: &crate::context::Services, conn: &UserConnection, state: &mut Option<UploadState>, message: &str) {
    if let Some(s) = state {
        s.phase = UploadPhase::Failed;
        cleanup_partial(s);
    }
    let mut payload = vec![1u8];
    payload.extend_from_slice(message.as_bytes());
    payload.push(0);
    conn.pacer().enqueue_and_drain(OutboundFrame::new(*b"fX", payload), "fX", 4);
    slog::warn!(services.logger, "upload failed"; "user" => conn.screenname(), "reason" => message);
    services.note_event(format!("upload failed {} ({message})", conn.screenname()));
}

pub async fn handle_tf_start(
    _services: &crate::context::Services,
    _state: &mut crate::context::ConnState,
    _frame: &InboundFrame,
) -> HandlerResult<()> {
    // tf with flag 0x80 is server-initiated (see handle_td_response); a
    // client echoing it back is a protocol violation we simply ignore.
    Ok(())
}

pub async fn handle_th_response(
    services: &crate::context::Services,
    state: &mut crate::context::ConnState,
    frame: &InboundFrame,
) -> HandlerResult<()> {
    let Some(conn) = state.conn.clone() else {
        return Err(HandlerError::Session("th response with no registered connection".into()));
    };
    let upload = &mut state.upload.state;
    let Some(inner) = upload else {
        return Err(HandlerError::Transfer("th response with no upload in flight".into()));
    };
    if inner.phase != UploadPhase::AwaitingThResponse {
        return Err(HandlerError::Transfer("th response outside AwaitingThResponse".into()));
    }

    let nul = frame.body.iter().position(|&b| b == 0).unwrap_or(frame.body.len());
    let filename = String::from_utf8_lossy(&frame.body[..nul]).into_owned();
    inner.filename = Some(filename.clone());
    inner.target_path = Some(services.upload_root.join(sanitize_filename(&filename)));
    inner.phase = UploadPhase::AwaitingTdResponse;

    let td = build_td(inner.resp_token, 0, &filename);
    conn.pacer().enqueue_and_drain(OutboundFrame::new(*b"td", td), "td", 4);
    Ok(())
}

pub async fn handle_td_response(
    services: &crate::context::Services,
    state: &mut crate::context::ConnState,
    frame: &InboundFrame,
) -> HandlerResult<()> {
    let Some(conn) = state.conn.clone() else {
        return Err(HandlerError::Session("td response with no registered connection".into()));
    };

    let size = if frame.body.len() >= 4 {
        u32::from_be_bytes([frame.body[0], frame.body[1], frame.body[2], frame.body[3]])
    } else {
        0
    };
    let rc = frame.body.get(4).copied().unwrap_or(0);

    let filename;
    let resp_token;
    let platform;
    {
        let Some(inner) = &mut state.upload.state else {
            return Err(HandlerError::Transfer("td response with no upload in flight".into()));
        };
        if inner.phase != UploadPhase::AwaitingTdResponse {
            return Err(HandlerError::Transfer("td response outside AwaitingTdResponse".into()));
        }
        if rc != 0 {
            let inner_state = &mut state.upload.state;
            fail(services, &conn, inner_state, "client reported non-zero td rc");
            return Ok(());
        }
        inner.expected_size = size;
        inner.phase = UploadPhase::AwaitingData;
        filename = inner.filename.clone().unwrap_or_default();
        resp_token = inner.resp_token;
        platform = inner.platform;
    }

    let tf = build_tf_start(size, platform, &filename, resp_token);
    conn.pacer().enqueue_and_drain(OutboundFrame::new(*b"tf", tf), "tf-start", 4);
    Ok(())
}

pub async fn handle_data(
    services: &crate::context::Services,
    state: &mut crate::context::ConnState,
    frame: &InboundFrame,
) -> HandlerResult<()> {
    let Some(conn) = state.conn.clone() else {
        return Err(HandlerError::Session("upload data with no registered connection".into()));
    };

    let decoded = decode(&frame.body);
    let prompt_tn;

    {
        let Some(inner) = &mut state.upload.state else {
            return Err(HandlerError::Transfer("upload data with no upload in flight".into()));
        };
        if inner.phase == UploadPhase::AwaitingData {
            inner.phase = UploadPhase::ReceivingData;
            if let Some(path) = &inner.target_path {
                inner.sink = File::create(path).ok();
            }
        }
        if inner.phase != UploadPhase::ReceivingData {
            return Err(HandlerError::Transfer("data frame outside ReceivingData".into()));
        }

        if let Some(sink) = &mut inner.sink {
            if sink.write_all(&decoded).is_err() {
                let inner_state = &mut state.upload.state;
                fail(services, &conn, inner_state, "I/O error writing upload");
                return Ok(());
            }
        }
        inner.received_bytes += decoded.len() as u64;
        inner.frame_count += 1;
        prompt_tn = inner.flow_control.should_prompt(inner.frame_count);
    }

    if prompt_tn {
        conn.pacer().enqueue_and_drain(OutboundFrame::new(*b"tN", Vec::new()), "tN", 4);
    }
    Ok(())
}

pub async fn handle_xe(
    services: &crate::context::Services,
    state: &mut crate::context::ConnState,
    _frame: &InboundFrame,
) -> HandlerResult<()> {
    let Some(conn) = state.conn.clone() else {
        return Err(HandlerError::Session("xe with no registered connection".into()));
    };
    let Some(inner) = &mut state.upload.state else {
        return Err(HandlerError::Transfer("xe with no upload in flight".into()));
    };
    if inner.phase != UploadPhase::ReceivingData {
        return Err(HandlerError::Transfer("xe received outside ReceivingData".into()));
    }
    inner.phase = UploadPhase::Completed;
    if let Some(sink) = inner.sink.take() {
        drop(sink);
    }

    let mut payload = vec![0u8];
    payload.extend_from_slice(b"upload complete");
    payload.push(0);
    conn.pacer().enqueue_and_drain(OutboundFrame::new(*b"fX", payload), "fX", 4);
    slog::info!(services.logger, "upload completed"; "user" => conn.screenname(), "bytes" => inner.received_bytes);
    services.note_event(format!("upload completed {} ({} bytes)", conn.screenname(), inner.received_bytes));
    Ok(())
}

pub async fn handle_xk(
    services: &crate::context::Services,
    state: &mut crate::context::ConnState,
    _frame: &InboundFrame,
) -> HandlerResult<()> {
    if let Some(inner) = &mut state.upload.state {
        inner.phase = UploadPhase::Aborted;
        cleanup_partial(inner);
        inner.sink = None;
        if let Some(conn) = &state.conn {
            services.note_event(format!("upload aborted {}", conn.screenname()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use slog::Discard;
    use tokio::sync::mpsc;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(Discard, slog::o!())
    }

    fn make_conn() -> UserConnection {
        let (pacer, _rx) = protocol::pacer::PacerHandle::new();
        let (tx, _rx2) = mpsc::unbounded_channel();
        UserConnection::new("Bobby".into(), pacer, Platform::Windows, tx)
    }

    #[test]
    fn windows_name_slot_carries_nul_separator_and_token() {
        let slot = build_tf_start(12345, Platform::Windows, "C:\\setup.log", [0xAB, 0xCD]);
        let name_area = &slot[19..];
        let path_bytes = b"C:\\setup.log";
        assert_eq!(&name_area[..path_bytes.len()], path_bytes);
        assert_eq!(name_area[path_bytes.len()], 0);
        assert_eq!(name_area[path_bytes.len() + 1], 0x90);
        assert_eq!(&name_area[path_bytes.len() + 2..path_bytes.len() + 4], [0xAB, 0xCD]);
    }

    #[test]
    fn mac_name_slot_has_no_separator() {
        let slot = build_tf_start(1, Platform::Mac, "file.txt", [0, 0]);
        let name_area = &slot[19..];
        assert_eq!(&name_area[..8], b"file.txt");
        assert_eq!(name_area[8], 0);
    }

    #[tokio::test]
    async fn upload_writes_sanitized_target_path_and_cleans_up_on_abort() {
        let dir = std::env::temp_dir().join(format!("p3upload-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let logger = test_logger();
        let mut services = test_services(&logger);
        services.upload_root = dir.clone();

        let conn = make_conn();
        let mut state = crate::context::ConnState::new(0);
        state.session.authenticate("Bobby".into(), false);
        state.conn = Some(conn.clone());
        state.upload.initiate(&conn, [1, 2], Platform::Windows, FlowControl::sixth_frame());

        let th = InboundFrame { tx: 0, rx: 0, token: *b"th", body: b"..\\..\\evil\0".to_vec() };
        super::handle_th_response(&services, &mut state, &th).await.unwrap();

        let target = state.upload.state.as_ref().unwrap().target_path.clone().unwrap();
        assert_eq!(target, dir.join("evil"));
        assert!(!target.to_string_lossy().contains(".."));

        let mut td_body = 3u32.to_be_bytes().to_vec();
        td_body.push(0);
        let td = InboundFrame { tx: 0, rx: 0, token: *b"td", body: td_body };
        super::handle_td_response(&services, &mut state, &td).await.unwrap();

        let data = InboundFrame { tx: 0, rx: 0, token: *b"xd", body: b"abc".to_vec() };
        super::handle_data(&services, &mut state, &data).await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"abc");

        super::handle_xk(&services, &mut state, &fake_frame()).await.unwrap();
        assert!(!target.exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn abort_leaves_registry_inactive_and_marks_aborted() {
        let mut registry = UploadRegistry::new();
        let conn = make_conn();
        registry.initiate(&conn, [1, 2], Platform::Windows, FlowControl::sixth_frame());
        let logger = test_logger();
        let services = test_services(&logger);
        let mut state = crate::context::ConnState::new(0);
        state.session.authenticate("Bobby".into(), false);
        state.conn = Some(conn.clone());
        state.upload = registry;

        super::handle_xk(&services, &mut state, &fake_frame()).await.unwrap();
        assert_eq!(state.upload.phase(), Some(UploadPhase::Aborted));
    }

    fn fake_frame() -> InboundFrame {
        InboundFrame { tx: 0, rx: 0, token: *b"xK", body: Vec::new() }
    }

    fn test_services(logger: &slog::Logger) -> crate::context::Services {
        use crate::ports::NullBotPipeline;
        struct NullFdo;
        impl crate::ports::FdoCompiler for NullFdo {
            fn compile(&self, _source: &str, _token: [u8; 2], _stream_id: u16) -> Vec<crate::ports::FdoChunk> {
                Vec::new()
            }
            fn extract_stream(&self, _bytes: &[u8]) -> std::collections::HashMap<String, String> {
                std::collections::HashMap::new()
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
        struct NullCredentials;
        impl crate::ports::CredentialStore for NullCredentials {
            fn verify(&self, _screenname: &str, _password: &str) -> bool {
                false
            }
        }
        crate::context::Services {
            registry: std::sync::Arc::new(crate::registry::UserRegistry::new(logger.clone())),
            conv_ids: std::sync::Arc::new(crate::convid::ConversationIdManager::new()),
            guests: std::sync::Arc::new(crate::guest::EphemeralGuestRegistry::new()),
            bots: std::sync::Arc::new(NullBotPipeline),
            fdo: std::sync::Arc::new(NullFdo),
            art: std::sync::Arc::new(NullArt),
            credentials: std::sync::Arc::new(NullCredentials),
            idb_reference: std::sync::Mutex::new(std::collections::HashMap::new()),
            burst: 16,
            co_timeout_secs: 10,
            xfer_xg_timeout_secs: 30,
            allow_ephemeral: false,
            upload_root: std::env::temp_dir(),
            recent_events: std::sync::Mutex::new(protocol::ring::RingBuffer::new(16)),
            logger: logger.clone(),
        }
    }
}
