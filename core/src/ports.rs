//! Trait-object seams for the system's external collaborators (§1 "Out of
//! scope"). The core only ever talks to these traits; concrete
//! implementations (credential store, filesystem FDO templates, etc.) are
//! wired in by the `server` binary crate.

use std::collections::HashMap;

/// Credential store: screenname -> password hash, case-insensitive lookup.
pub trait CredentialStore: Send + Sync {
    fn verify(&self, screenname: &str, password: &str) -> bool;
}

/// A single compiled "P3 chunk" produced by the FDO compiler.
pub type FdoChunk = Vec<u8>;

/// FDO compiler (opaque bytecode compiler, §1): `compile(source, token,
/// stream_id) -> chunks`, `extract_stream(bytes) -> parameters`.
pub trait FdoCompiler: Send + Sync {
    fn compile(&self, source: &str, token: [u8; 2], stream_id: u16) -> Vec<FdoChunk>;

    /// Decodes an accumulated Aa/iS/iT stream's raw bytes into the
    /// parameters the caller needs (chat text, recipient, message body...).
    fn extract_stream(&self, bytes: &[u8]) -> HashMap<String, String>;

    /// Resolves a GID to its FDO template source, preferring a DSL registry
    /// entry over a filesystem template, and the `.bw` low-color variant
    /// when `low_color` is set and one exists (§4.6).
    fn resolve_source(&self, gid: u32, low_color: bool) -> Option<String>;

    /// Button-theme variable substitution, applied before compilation
    /// (§4.6). Default is a no-op for sources with no theme variables.
    fn preprocess(&self, source: &str, _theme: &str) -> String {
        source.to_string()
    }

    /// Decodes an `fh` request stream into its form id and the list of
    /// `(transactionId, gid)` pairs it carries (§4.6).
    fn extract_fh_requests(&self, bytes: &[u8]) -> (u32, Vec<(u16, u32)>);
}

/// Art/asset store: GID -> byte blob.
pub trait ArtStore: Send + Sync {
    fn get(&self, gid: u32) -> Option<Vec<u8>>;
}

/// A message a bot pipeline wants delivered, scheduled relative to the
/// first one (§9: "task-producing-list-of-messages; a scheduler emits the
/// first message immediately and schedules the rest via a monotonic
/// timer").
pub struct ScheduledBotMessage {
    pub delay_ms: u64,
    pub body: String,
}

/// Bot personality pipeline (§1 "out of scope", §4.4/§4.5 dispatch points).
pub trait BotPipeline: Send + Sync {
    fn is_bot(&self, screenname: &str) -> bool;
    fn handle_chat(&self, sender: &str, message: &str) -> Vec<ScheduledBotMessage>;
    fn handle_im(&self, sender: &str, recipient: &str, message: &str) -> Vec<ScheduledBotMessage>;

    /// Screennames of bot personalities always present in the chat room
    /// snapshot (§4.4: "all bots + ordered members + joining user").
    fn resident_bots(&self) -> Vec<String> {
        Vec::new()
    }
}

/// No-op bot pipeline: answers nothing, used when no bot personalities are
/// configured. Keeps the chat/IM handlers' dispatch points exercised and
/// tested without pulling in bot-specific logic (out of scope per §1).
pub struct NullBotPipeline;

impl BotPipeline for NullBotPipeline {
    fn is_bot(&self, _screenname: &str) -> bool {
        false
    }

    fn handle_chat(&self, _sender: &str, _message: &str) -> Vec<ScheduledBotMessage> {
        Vec::new()
    }

    fn handle_im(&self, _sender: &str, _recipient: &str, _message: &str) -> Vec<ScheduledBotMessage> {
        Vec::new()
    }
}
