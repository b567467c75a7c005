//! Per-connection session state (§3). One `Session` per TCP connection;
//! created on accept, destroyed on close, never shared — contrast with
//! `UserConnection` (registry.rs), which is the registry's shared view.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Mac,
    Windows,
    Unknown,
}

/// Opaque data parsed out of the 0xA3 handshake packet. The exact field
/// layout is a detail of that handshake; the core only needs to carry it
/// forward for diagnostics and platform detection.
#[derive(Debug, Clone, Default)]
pub struct InitPacketData {
    pub raw: Vec<u8>,
}

pub struct Session {
    pub router_channel_id: i32,
    screenname: Option<String>,
    password: Option<String>,
    pub authenticated: bool,
    pub ephemeral: bool,
    pub platform: Platform,
    pub init_packet: Option<InitPacketData>,
    pub connected_at_unix: u64,
    /// User preference selecting the `.bw` low-color FDO variant (§4.6).
    pub low_color: bool,
}

impl Session {
    pub fn new(connected_at_unix: u64) -> Self {
        Session {
            router_channel_id: 0,
            screenname: None,
            password: None,
            authenticated: false,
            ephemeral: false,
            platform: Platform::Unknown,
            init_packet: None,
            connected_at_unix,
            low_color: false,
        }
    }

    pub fn screenname(&self) -> Option<&str> {
        self.screenname.as_deref()
    }

    /// Sets the authenticated screenname, upholding the invariant that
    /// `authenticated` implies a screenname is set.
    pub fn authenticate(&mut self, screenname: String, ephemeral: bool) {
        self.screenname = Some(screenname);
        self.authenticated = true;
        self.ephemeral = ephemeral;
    }

    pub fn set_password_for_sso(&mut self, password: String) {
        self.password = Some(password);
    }

    pub fn password_for_sso(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// Clears the password on disconnect (§4.9 cleanup step 6).
    pub fn clear_password(&mut self) {
        self.password = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authenticated_implies_screenname_set() {
        let mut session = Session::new(0);
        assert!(session.screenname().is_none());
        session.authenticate("Bobby".into(), false);
        assert!(session.authenticated);
        assert_eq!(session.screenname(), Some("Bobby"));
    }

    #[test]
    fn disconnect_clears_password() {
        let mut session = Session::new(0);
        session.set_password_for_sso("hunter2".into());
        session.clear_password();
        assert!(session.password_for_sso().is_none());
    }
}
