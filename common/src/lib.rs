pub mod error;
pub mod logging;
pub mod time;

/// Protocol/version identifiers, mirrored after the teacher's `flux`
/// constants, kept here since both `protocol` and `core` reference them.
pub const LISTEN_PORT_DEFAULT: u16 = 5190;
