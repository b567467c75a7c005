//! Root logger construction (§ Ambient Stack / Logging). Built once at
//! startup and threaded down explicitly as a field on the long-lived
//! services rather than reached for as a global, per §9's guidance to pass
//! singletons as dependencies.

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    fn into_severity(self) -> Severity {
        match self {
            LogLevel::Trace => Severity::Trace,
            LogLevel::Debug => Severity::Debug,
            LogLevel::Info => Severity::Info,
            LogLevel::Warning => Severity::Warning,
            LogLevel::Error => Severity::Error,
        }
    }
}

/// Builds the root logger: a terminal destination on stderr at the
/// requested level, matching the teacher's `flux::logging::init` shape.
pub fn init_root_logger(level: LogLevel) -> slog::Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(level.into_severity());
    builder.destination(Destination::Stderr);

    builder.build().expect("terminal logger configuration is always valid")
}
