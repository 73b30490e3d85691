use derive_more::Display;
use serde::{Deserialize, Serialize};

use super::MediaKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[display(fmt = "host")]
    Host,
    #[display(fmt = "speaker")]
    Speaker,
    #[display(fmt = "listener")]
    Listener,
}

/// Role and permissions assigned by the forwarding server when joining. Read-only locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessGrant {
    pub role: Role,
    /// master switch. when false nothing may be produced regardless of the flags below
    pub can_produce: bool,
    pub can_produce_audio: bool,
    pub can_produce_video: bool,
    pub can_share_screen: bool,
}

impl AccessGrant {
    pub fn for_role(role: Role) -> Self {
        let allowed = !matches!(role, Role::Listener);
        Self {
            role,
            can_produce: allowed,
            can_produce_audio: allowed,
            can_produce_video: allowed,
            can_share_screen: allowed,
        }
    }

    pub fn is_host(&self) -> bool {
        self.role == Role::Host
    }

    pub fn permits(&self, kind: MediaKind) -> bool {
        self.can_produce
            && match kind {
                MediaKind::Audio => self.can_produce_audio,
                MediaKind::Video => self.can_produce_video,
                MediaKind::Screen => self.can_share_screen,
            }
    }
}

impl Default for AccessGrant {
    fn default() -> Self {
        Self::for_role(Role::Speaker)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn listener_cannot_produce() {
        let grant = AccessGrant::for_role(Role::Listener);
        assert!(MediaKind::ALL.iter().all(|k| !grant.permits(*k)));
    }

    #[test]
    fn master_switch_overrides_flags() {
        let mut grant = AccessGrant::for_role(Role::Host);
        assert!(grant.permits(MediaKind::Screen));
        grant.can_produce = false;
        assert!(!grant.permits(MediaKind::Audio));
        assert!(grant.is_host());
    }
}
