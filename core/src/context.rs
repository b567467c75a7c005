//! Shared collaborators and per-connection state threaded through every
//! token handler (§5: "each TCP connection is served by one logical I/O
//! task"; `Services` is the process-wide shared half, `ConnState` is the
//! task-owned half).

use crate::convid::ConversationIdManager;
use crate::guest::EphemeralGuestRegistry;
use crate::handlers::xfer_download::DownloadRegistry;
use crate::handlers::xfer_upload::UploadRegistry;
use crate::ports::{ArtStore, BotPipeline, CredentialStore, FdoCompiler};
use crate::registry::UserConnection;
use crate::session::Session;
use protocol::reassembly::StreamReassembler;
use protocol::ring::RingBuffer;
use slog::Logger;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Process-wide services, constructed once at startup and shared by every
/// connection task (§9: "pass them as dependencies rather than access them
/// as globals").
pub struct Services {
    pub registry: Arc<crate::registry::UserRegistry>,
    pub conv_ids: Arc<ConversationIdManager>,
    pub guests: Arc<EphemeralGuestRegistry>,
    pub bots: Arc<dyn BotPipeline>,
    pub fdo: Arc<dyn FdoCompiler>,
    pub art: Arc<dyn ArtStore>,
    pub credentials: Arc<dyn CredentialStore>,
    /// IDB reference cache for drift detection (§4.6), shared across
    /// connections since the same GID may be requested by many clients.
    pub idb_reference: Mutex<HashMap<u32, Vec<u8>>>,
    pub burst: usize,
    pub co_timeout_secs: u64,
    pub xfer_xg_timeout_secs: u64,
    /// Gates the fallback authenticator's null-password ephemeral success
    /// (§9 open question 2; decided in DESIGN.md).
    pub allow_ephemeral: bool,
    /// Directory uploaded files are written into (§4.8 "sanitized filename
    /// + a configured upload directory").
    pub upload_root: std::path::PathBuf,
    /// Recent register/unregister, chat join/leave, and XFER phase-change
    /// events, for diagnostics (§9 ring buffer).
    pub recent_events: Mutex<RingBuffer<String>>,
    pub logger: Logger,
}

impl Services {
    /// Appends one line to the recent-events ring buffer. Never logs at
    /// any level itself — callers still use `slog` for that; this just
    /// keeps a bounded in-memory trail a diagnostics command can read back.
    pub fn note_event(&self, event: impl Into<String>) {
        self.recent_events.lock().expect("recent_events mutex poisoned").push(event.into());
    }

    /// The last `n` recorded events, oldest first.
    pub fn recent_events(&self, n: usize) -> Vec<String> {
        self.recent_events.lock().expect("recent_events mutex poisoned").last(n)
    }
}

/// Per-connection state, owned exclusively by that connection's task
/// (§5's shared-resource policy).
pub struct ConnState {
    pub session: Session,
    pub conn: Option<UserConnection>,
    pub chat_reassembler: StreamReassembler,
    pub im_reassembler: StreamReassembler,
    pub download: DownloadRegistry,
    pub upload: UploadRegistry,
}

impl ConnState {
    pub fn new(connected_at_unix: u64) -> Self {
        ConnState {
            session: Session::new(connected_at_unix),
            conn: None,
            chat_reassembler: StreamReassembler::new(),
            im_reassembler: StreamReassembler::new(),
            download: DownloadRegistry::new(),
            upload: UploadRegistry::new(),
        }
    }

    pub fn screenname(&self) -> Option<&str> {
        self.session.screenname()
    }
}
