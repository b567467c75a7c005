//! Session-level authentication (§3 Session, §4.3 Register, §7
//! "Session-level" errors). Distinct from the token dispatcher: a
//! connection has exactly one login attempt before any other token is
//! accepted, so the server calls this directly rather than routing it
//! through `dispatch`.

use crate::context::{ConnState, Services};
use crate::registry::{DisconnectHandle, UserConnection};
use crate::session::Platform;
use common::error::{HandlerError, HandlerResult};
use protocol::pacer::PacerHandle;
use slog::warn;

const MAX_SCREENNAME_LEN: usize = 10;

fn is_valid_screenname(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_SCREENNAME_LEN
        && !name.starts_with('~')
        && name.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Authenticates one connection and, on success, registers it with the
/// user registry, displacing any prior session under the same screenname
/// (§4.3, scenario S1). On failure the caller (the server's connection
/// task) is responsible for sending a rejection and closing the socket.
pub async fn handle_login(
    services: &Services,
    state: &mut ConnState,
    pacer: PacerHandle,
    platform: Platform,
    disconnect: DisconnectHandle,
    screenname: &str,
    password: &str,
) -> HandlerResult<Option<UserConnection>> {
    if !is_valid_screenname(screenname) {
        return Err(HandlerError::Session(format!("invalid screenname `{screenname}`")));
    }

    let (effective_name, ephemeral) = if services.credentials.verify(screenname, password) {
        (screenname.to_string(), false)
    } else if services.allow_ephemeral {
        // §9 open question 2, decided: the fallback authenticator's
        // null-password success is preserved but gated behind config and
        // surfaced in the log rather than left silent. The caller's own
        // screenname is never used as-is here — the session runs under a
        // freshly minted `~GuestNNNN` name (§3 EphemeralGuestRegistry).
        let guest_name = services.guests.allocate()?;
        warn!(services.logger, "ephemeral login minted guest name";
            "requested" => screenname, "guest" => &guest_name, "password_empty" => password.is_empty());
        (guest_name, true)
    } else {
        return Err(HandlerError::Session(format!("authentication failed for `{screenname}`")));
    };

    state.session.authenticate(effective_name.clone(), ephemeral);
    state.session.platform = platform;

    let conn = UserConnection::new(effective_name.clone(), pacer, platform, disconnect);
    let replaced = services.registry.register(&effective_name, conn.clone());
    state.conn = Some(conn);
    services.note_event(format!("register {effective_name}"));

    Ok(replaced)
}
