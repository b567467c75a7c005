//! Filesystem-backed FDO compiler (§1 "out of scope" collaborator, §4.6
//! "A DSL registry keyed by GID takes precedence over filesystem
//! templates"). This stands in for the real bytecode compiler: it reads
//! `.fdo`/`.bw` template files and does button-theme variable
//! substitution, returning opaque chunks rather than real P3 bytecode.
//!
//! The accumulated Aa/iS/iT/K1 stream format the core hands to
//! `extract_stream`/`extract_fh_requests` isn't specified beyond "ask the
//! FDO stream decoder" — both real FDO bytecode and the client's encoder
//! are out of scope here, so this implementation defines and consumes its
//! own minimal wire shapes (documented in DESIGN.md).

use byteorder::{BigEndian, ReadBytesExt};
use p3core::ports::{FdoChunk, FdoCompiler};
use protocol::gid::format_display;
use std::collections::HashMap;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Mutex;

pub struct FilesystemFdoCompiler {
    template_root: PathBuf,
    registry: Mutex<HashMap<u32, String>>,
}

impl FilesystemFdoCompiler {
    pub fn new(template_root: PathBuf) -> Self {
        FilesystemFdoCompiler { template_root, registry: Mutex::new(HashMap::new()) }
    }

    /// Registers a DSL source directly, taking precedence over filesystem
    /// templates for this GID (§4.6). Not yet called from `main` — there's
    /// no DSL pipeline feeding it sources at startup — but part of the
    /// compiler's public surface.
    #[allow(dead_code)]
    pub fn register_source(&self, gid: u32, source: String) {
        self.registry.lock().expect("fdo registry mutex poisoned").insert(gid, source);
    }
}

impl FdoCompiler for FilesystemFdoCompiler {
    fn compile(&self, source: &str, token: [u8; 2], stream_id: u16) -> Vec<FdoChunk> {
        let mut chunk = Vec::with_capacity(4 + source.len());
        chunk.extend_from_slice(&token);
        chunk.extend_from_slice(&stream_id.to_be_bytes());
        chunk.extend_from_slice(source.as_bytes());
        vec![chunk]
    }

    /// Decodes `key=value;key=value` ASCII pairs — a minimal surrogate for
    /// the real stream decoder, sufficient to carry `message`/`recipient`/
    /// `responseId`/`gid` between a test client and the handlers.
    fn extract_stream(&self, bytes: &[u8]) -> HashMap<String, String> {
        let text = String::from_utf8_lossy(bytes);
        let mut fields = HashMap::new();
        for pair in text.split(';') {
            if let Some((key, value)) = pair.split_once('=') {
                fields.insert(key.to_string(), value.to_string());
            }
        }
        fields
    }

    fn resolve_source(&self, gid: u32, low_color: bool) -> Option<String> {
        if let Some(source) = self.registry.lock().expect("fdo registry mutex poisoned").get(&gid) {
            return Some(source.clone());
        }

        let display = format_display(gid);
        if low_color {
            if let Ok(bw) = std::fs::read_to_string(self.template_root.join(format!("{display}.bw"))) {
                return Some(bw);
            }
        }
        std::fs::read_to_string(self.template_root.join(format!("{display}.fdo"))).ok()
    }

    fn preprocess(&self, source: &str, theme: &str) -> String {
        source.replace("${theme}", theme)
    }

    /// Decodes `formId(BE32) + count(BE16) + count*(transactionId(BE16) +
    /// gid(BE32))`.
    fn extract_fh_requests(&self, bytes: &[u8]) -> (u32, Vec<(u16, u32)>) {
        let mut cursor = Cursor::new(bytes);
        let Ok(form_id) = cursor.read_u32::<BigEndian>() else {
            return (0, Vec::new());
        };
        let count = cursor.read_u16::<BigEndian>().unwrap_or(0);

        let mut pairs = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let Ok(transaction_id) = cursor.read_u16::<BigEndian>() else { break };
            let Ok(gid) = cursor.read_u32::<BigEndian>() else { break };
            pairs.push((transaction_id, gid));
        }
        (form_id, pairs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_stream_parses_key_value_pairs() {
        let compiler = FilesystemFdoCompiler::new(PathBuf::from("."));
        let fields = compiler.extract_stream(b"message=hello there;responseId=42");
        assert_eq!(fields.get("message").map(String::as_str), Some("hello there"));
        assert_eq!(fields.get("responseId").map(String::as_str), Some("42"));
    }

    #[test]
    fn registered_source_takes_precedence_over_filesystem() {
        let compiler = FilesystemFdoCompiler::new(PathBuf::from("/nonexistent"));
        compiler.register_source(0x100, "inline source".to_string());
        assert_eq!(compiler.resolve_source(0x100, false).as_deref(), Some("inline source"));
    }

    #[test]
    fn extract_fh_requests_round_trips_pairs() {
        let mut body = Vec::new();
        body.extend_from_slice(&7u32.to_be_bytes());
        body.extend_from_slice(&2u16.to_be_bytes());
        body.extend_from_slice(&1u16.to_be_bytes());
        body.extend_from_slice(&0x100u32.to_be_bytes());
        body.extend_from_slice(&2u16.to_be_bytes());
        body.extend_from_slice(&0x200u32.to_be_bytes());

        let compiler = FilesystemFdoCompiler::new(PathBuf::from("."));
        let (form_id, pairs) = compiler.extract_fh_requests(&body);
        assert_eq!(form_id, 7);
        assert_eq!(pairs, vec![(1, 0x100), (2, 0x200)]);
    }
}
