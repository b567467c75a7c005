//! XFER download (§4.7): server-originated file transfer to the client.
//! `tj`/`tf` are emitted by `initiate`; the dispatcher only routes the
//! client's `xG` (proceed) and `xK` (cancel) back in.

use crate::registry::UserConnection;
use byteorder::{BigEndian, WriteBytesExt};
use common::error::{HandlerError, HandlerResult};
use protocol::encoding::encode;
use protocol::frame::{InboundFrame, OutboundFrame};
use std::time::Duration;
use tokio::time::Instant;

const CHUNK_LEN: usize = 950;
const DEFAULT_XG_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadPhase {
    AwaitingXg,
    SendingData,
    Completed,
    Failed,
    Cancelled,
}

struct DownloadState {
    phase: DownloadPhase,
    chunks: Vec<Vec<u8>>,
    generation: u64,
    xg_deadline: Instant,
}

/// One connection's in-flight download slot (§4.7: "one download in flight
/// per connection").
pub struct DownloadRegistry {
    state: Option<DownloadState>,
}

impl DownloadRegistry {
    pub fn new() -> Self {
        DownloadRegistry { state: None }
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.state.as_ref().map(|s| s.phase),
            Some(DownloadPhase::AwaitingXg) | Some(DownloadPhase::SendingData)
        )
    }

    pub fn phase(&self) -> Option<DownloadPhase> {
        self.state.as_ref().map(|s| s.phase)
    }

    pub fn cancel_all(&mut self) {
        self.state = None;
    }

    /// Builds TJ_IN (67 B, §6): type + fileId + createDate + byteCount +
    /// "lib\0subject" zero-padded to 55 bytes.
    fn build_tj(file_id: [u8; 3], create_date: u32, size: u32, library: &str, subject: &str) -> Vec<u8> {
        let mut body = Vec::with_capacity(67);
        body.push(0);
        body.extend_from_slice(&file_id);
        body.write_u32::<BigEndian>(create_date).expect("vec write is infallible");
        body.write_u32::<BigEndian>(size).expect("vec write is infallible");

        let mut text = Vec::with_capacity(55);
        text.extend_from_slice(library.as_bytes());
        text.push(0);
        text.extend_from_slice(subject.as_bytes());
        text.resize(55, 0);
        body.extend_from_slice(&text);
        body
    }

    /// Builds TF_IN (87 B, §6): flags + size(LE24) + access/type/auxType/
    /// storageType/blocks (all zero) + time + created + 68-byte name slot
    /// (filename, zero-padded, no separator — this is the download path).
    fn build_tf(flags: u8, size: u32, time: u32, created: u32, name: &str) -> Vec<u8> {
        let mut body = Vec::with_capacity(87);
        body.push(flags);
        let size_le = size.to_le_bytes();
        body.extend_from_slice(&size_le[..3]);
        body.push(0); // access
        body.push(0); // type
        body.extend_from_slice(&0u16.to_le_bytes()); // auxType
        body.push(0); // storageType
        body.extend_from_slice(&0u16.to_le_bytes()); // blocks
        body.write_u32::<BigEndian>(time).expect("vec write is infallible");
        body.write_u32::<BigEndian>(created).expect("vec write is infallible");

        let mut name_slot = name.as_bytes().to_vec();
        name_slot.truncate(67);
        name_slot.push(0);
        name_slot.resize(68, 0);
        body.extend_from_slice(&name_slot);
        body
    }

    /// Starts a new download: emits the announce FDO (caller-supplied
    /// bytes), `tj`, `tf`, then arms the `xG` timeout. Fails if a download
    /// is already in flight on this connection.
    #[allow(clippy::too_many_arguments)]
    pub fn initiate(
        &mut self,
        conn: &UserConnection,
        announce: Vec<u8>,
        file_id: [u8; 3],
        create_date: u32,
        payload: &[u8],
        library: &str,
        subject: &str,
        name: &str,
        now_unix: u32,
        timeout_secs: Option<u64>,
        burst: usize,
        logger: &slog::Logger,
    ) -> HandlerResult<()> {
        if self.is_active() {
            return Err(HandlerError::Transfer("download already in flight on this connection".into()));
        }

        conn.pacer().enqueue_and_drain(OutboundFrame::new(*b"tj", announce), "xfer-announce", burst);

        let tj = Self::build_tj(file_id, create_date, payload.len() as u32, library, subject);
        conn.pacer().enqueue_and_drain(OutboundFrame::new(*b"tj", tj), "tj", burst);

        let tf = Self::build_tf(0x20, payload.len() as u32, now_unix, create_date, name);
        conn.pacer().enqueue_and_drain(OutboundFrame::new(*b"tf", tf), "tf", burst);

        let encoded = encode(payload);
        let chunks: Vec<Vec<u8>> = if encoded.is_empty() {
            vec![Vec::new()]
        } else {
            encoded.chunks(CHUNK_LEN).map(|c| c.to_vec()).collect()
        };

        let generation = 1;
        let timeout = Duration::from_secs(timeout_secs.unwrap_or(DEFAULT_XG_TIMEOUT_SECS));
        let xg_deadline = Instant::now() + timeout;
        self.state = Some(DownloadState { phase: DownloadPhase::AwaitingXg, chunks, generation, xg_deadline });

        slog::debug!(logger, "xG timeout armed for download"; "user" => conn.screenname(), "timeout_secs" => timeout.as_secs());

        Ok(())
    }

    /// The connection's `xG` deadline, if a download is still waiting on
    /// it (§5: "XFER download xG timeout 30s configurable marks Failed").
    /// The owning connection task polls this directly in its event loop —
    /// no detached task mutates `DownloadState`, since it isn't shared.
    pub fn xg_deadline(&self) -> Option<(Instant, u64)> {
        self.state.as_ref().filter(|s| s.phase == DownloadPhase::AwaitingXg).map(|s| (s.xg_deadline, s.generation))
    }

    /// Marks the download Failed if its `xG` timer fired while still
    /// `AwaitingXg` for `generation`.
    pub fn expire_if_still_awaiting(&mut self, generation: u64) {
        if let Some(state) = &mut self.state {
            if state.generation == generation && state.phase == DownloadPhase::AwaitingXg {
                state.phase = DownloadPhase::Failed;
            }
        }
    }
}

impl Default for DownloadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn handle_xg(services: &crate::context::Services, state: &mut crate::context::ConnState, _frame: &InboundFrame) -> HandlerResult<()> {
    let Some(conn) = state.conn.clone() else {
        return Err(HandlerError::Session("xG with no registered connection".into()));
    };

    let download = &mut state.download;
    let Some(inner) = &mut download.state else {
        return Err(HandlerError::Transfer("xG with no download in flight".into()));
    };
    if inner.phase != DownloadPhase::AwaitingXg {
        return Err(HandlerError::Transfer("xG received outside AwaitingXg".into()));
    }

    inner.phase = DownloadPhase::SendingData;
    let chunks = std::mem::take(&mut inner.chunks);
    let last = chunks.len().saturating_sub(1);

    for (i, chunk) in chunks.into_iter().enumerate() {
        let token = if i == last { *b"F9" } else { *b"F7" };
        let label = if i == last { "F9" } else { "F7" };
        conn.pacer().enqueue_and_drain(OutboundFrame::new(token, chunk), label, 16);
    }

    download.state.as_mut().unwrap().phase = DownloadPhase::Completed;
    services.note_event(format!("download completed {}", conn.screenname()));
    Ok(())
}

pub async fn handle_xk(services: &crate::context::Services, state: &mut crate::context::ConnState, _frame: &InboundFrame) -> HandlerResult<()> {
    if let Some(s) = state.download.state.as_mut() {
        s.phase = DownloadPhase::Cancelled;
        if let Some(conn) = &state.conn {
            services.note_event(format!("download cancelled {}", conn.screenname()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Platform;
    use slog::Discard;
    use tokio::sync::mpsc;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(Discard, slog::o!())
    }

    fn make_conn() -> UserConnection {
        let (pacer, _rx) = protocol::pacer::PacerHandle::new();
        let (tx, _rx2) = mpsc::unbounded_channel();
        UserConnection::new("Bobby".into(), pacer, Platform::Unknown, tx)
    }

    #[tokio::test]
    async fn happy_path_chunks_2300_byte_file_as_s5_describes() {
        let conn = make_conn();
        let mut registry = DownloadRegistry::new();
        let payload = vec![0x41u8; 2300];
        let logger = test_logger();

        registry
            .initiate(&conn, b"announce".to_vec(), [1, 2, 3], 0, &payload, "lib", "subject", "file.txt", 0, Some(30), 16, &logger)
            .unwrap();
        assert_eq!(registry.phase(), Some(DownloadPhase::AwaitingXg));

        let services_stub_chunks = registry.state.as_ref().unwrap().chunks.len();
        // 2300 bytes of 0x41 need no escaping, so chunk count matches the
        // plain 950-byte split: 950, 950, 400.
        assert_eq!(services_stub_chunks, 3);
        assert_eq!(registry.state.as_ref().unwrap().chunks[2].len(), 400);
    }

    #[tokio::test]
    async fn empty_file_still_produces_one_empty_chunk() {
        let conn = make_conn();
        let mut registry = DownloadRegistry::new();
        let logger = test_logger();
        registry.initiate(&conn, Vec::new(), [0, 0, 0], 0, &[], "lib", "s", "f", 0, Some(30), 16, &logger).unwrap();
        assert_eq!(registry.state.as_ref().unwrap().chunks, vec![Vec::<u8>::new()]);
    }

    #[tokio::test(start_paused = true)]
    async fn xg_timeout_marks_download_failed_when_never_acked() {
        let conn = make_conn();
        let mut registry = DownloadRegistry::new();
        let logger = test_logger();
        registry.initiate(&conn, Vec::new(), [0, 0, 0], 0, b"x", "lib", "s", "f", 0, Some(30), 16, &logger).unwrap();

        let (deadline, generation) = registry.xg_deadline().expect("download awaiting xG has a deadline");
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(Instant::now() >= deadline);

        registry.expire_if_still_awaiting(generation);
        assert_eq!(registry.phase(), Some(DownloadPhase::Failed));
    }

    #[tokio::test]
    async fn xg_ack_before_timeout_leaves_phase_untouched_by_stale_expiry() {
        let conn = make_conn();
        let mut registry = DownloadRegistry::new();
        let logger = test_logger();
        registry.initiate(&conn, Vec::new(), [0, 0, 0], 0, b"x", "lib", "s", "f", 0, Some(30), 16, &logger).unwrap();
        let (_, generation) = registry.xg_deadline().unwrap();

        registry.state.as_mut().unwrap().phase = DownloadPhase::SendingData;
        registry.expire_if_still_awaiting(generation);
        assert_eq!(registry.phase(), Some(DownloadPhase::SendingData));
    }

    #[tokio::test]
    async fn second_initiate_while_awaiting_xg_fails() {
        let conn = make_conn();
        let mut registry = DownloadRegistry::new();
        let logger = test_logger();
        registry.initiate(&conn, Vec::new(), [0, 0, 0], 0, b"x", "lib", "s", "f", 0, Some(30), 16, &logger).unwrap();
        let second = registry.initiate(&conn, Vec::new(), [0, 0, 0], 0, b"x", "lib", "s", "f", 0, Some(30), 16, &logger);
        assert!(second.is_err());
    }
}
