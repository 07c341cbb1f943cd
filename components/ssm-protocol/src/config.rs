use serde::{Deserialize, Serialize};

/// Where a child's session-management socket lives: either a filesystem
/// path the supervisor should bind, or a raw fd to an already-bound named
/// socket being handed over from another app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SocketLocation {
    /// A filesystem path. An empty string means "auto-generate
    /// `/tmp/rialto-<n>`"; a bare name (no `/`) means "use `/tmp/<name>`".
    Path(String),
    /// An fd of a socket that has already been bound and is being handed
    /// over to this app.
    Fd(i32),
}

/// Configuration supplied by the controller when binding an application to
/// a (possibly preloaded) session server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    pub client_display_name: String,
    pub session_management_socket: Option<SocketLocation>,
}

impl AppConfig {
    pub fn new(client_display_name: impl Into<String>) -> Self {
        AppConfig {
            client_display_name: client_display_name.into(),
            session_management_socket: None,
        }
    }

    pub fn with_socket(mut self, location: SocketLocation) -> Self {
        self.session_management_socket = Some(location);
        self
    }
}

/// Owner/group/mode requested for the named session-management socket.
/// A bit value of `0`, or an empty owner/group string, means "leave as-is"
/// (skip the corresponding `chmod`/`chown`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketPermissions {
    pub owner_bits: u8,
    pub group_bits: u8,
    pub other_bits: u8,
    pub owner_user: Option<String>,
    pub owner_group: Option<String>,
}

impl Default for SocketPermissions {
    fn default() -> Self {
        SocketPermissions {
            owner_bits: 0,
            group_bits: 0,
            other_bits: 0,
            owner_user: None,
            owner_group: None,
        }
    }
}

impl SocketPermissions {
    /// Parses the `socketPermissions` config key: three decimal digits,
    /// each 0..=7, read as owner/group/other like an octal `chmod` triple.
    pub fn from_decimal_digits(value: u32) -> Self {
        let other = (value % 10) as u8;
        let group = ((value / 10) % 10) as u8;
        let owner = ((value / 100) % 10) as u8;
        SocketPermissions {
            owner_bits: owner.min(7),
            group_bits: group.min(7),
            other_bits: other.min(7),
            owner_user: None,
            owner_group: None,
        }
    }

    /// `true` if permissions are unset (the special "do nothing" value).
    pub fn is_unset(&self) -> bool {
        self.owner_bits == 0 && self.group_bits == 0 && self.other_bits == 0
    }

    /// The mode bits as would be passed to `chmod`.
    pub fn mode(&self) -> u32 {
        (self.owner_bits as u32) << 6 | (self.group_bits as u32) << 3 | (self.other_bits as u32)
    }
}

/// Resource caps reported to the child as part of `SetConfiguration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaxResourceCapabilities {
    pub max_playback_sessions: u32,
    pub max_web_audio_players: u32,
}

impl Default for MaxResourceCapabilities {
    fn default() -> Self {
        MaxResourceCapabilities {
            max_playback_sessions: 2,
            max_web_audio_players: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_three_digit_permissions() {
        let perms = SocketPermissions::from_decimal_digits(750);
        assert_eq!(perms.owner_bits, 7);
        assert_eq!(perms.group_bits, 5);
        assert_eq!(perms.other_bits, 0);
        assert_eq!(perms.mode(), 0o750);
    }

    #[test]
    fn zero_permissions_are_unset() {
        assert!(SocketPermissions::from_decimal_digits(0).is_unset());
        assert!(!SocketPermissions::from_decimal_digits(644).is_unset());
    }
}
