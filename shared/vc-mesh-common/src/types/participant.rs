//! Participant Types

use serde::{Deserialize, Serialize};

use super::user::{LocalIdentity, UserId};

/// A room member and their media flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    /// User ID.
    pub user_id: UserId,
    /// Display name.
    pub display_name: String,
    /// Avatar image URL.
    #[serde(default)]
    pub avatar_url: Option<String>,
    /// Microphone is unmuted.
    #[serde(default)]
    pub mic_on: bool,
    /// Camera is sending.
    #[serde(default)]
    pub cam_on: bool,
    /// Screen is being shared.
    #[serde(default)]
    pub screen_on: bool,
    /// Voice activity detected.
    #[serde(default)]
    pub speaking: bool,
}

impl Participant {
    /// Create a participant with every flag off.
    pub fn new(user_id: UserId, display_name: impl Into<String>) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
            avatar_url: None,
            mic_on: false,
            cam_on: false,
            screen_on: false,
            speaking: false,
        }
    }

    /// Apply a partial state update. Returns true if any flag changed.
    pub fn apply(&mut self, update: &StateUpdate) -> bool {
        let before = (self.mic_on, self.cam_on, self.screen_on, self.speaking);

        if let Some(mic_on) = update.mic_on {
            self.mic_on = mic_on;
        }
        if let Some(cam_on) = update.cam_on {
            self.cam_on = cam_on;
        }
        if let Some(screen_on) = update.screen_on {
            self.screen_on = screen_on;
        }
        if let Some(speaking) = update.speaking {
            self.speaking = speaking;
        }

        before != (self.mic_on, self.cam_on, self.screen_on, self.speaking)
    }
}

impl From<&LocalIdentity> for Participant {
    fn from(identity: &LocalIdentity) -> Self {
        Self {
            avatar_url: identity.avatar_url.clone(),
            ..Self::new(identity.user_id, identity.display_name.clone())
        }
    }
}

/// Partial media-flag update for one participant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mic_on: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cam_on: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen_on: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaking: Option<bool>,
}

impl StateUpdate {
    pub const fn mic(on: bool) -> Self {
        Self {
            mic_on: Some(on),
            cam_on: None,
            screen_on: None,
            speaking: None,
        }
    }

    pub const fn camera(on: bool) -> Self {
        Self {
            mic_on: None,
            cam_on: Some(on),
            screen_on: None,
            speaking: None,
        }
    }

    pub const fn screen(on: bool) -> Self {
        Self {
            mic_on: None,
            cam_on: None,
            screen_on: Some(on),
            speaking: None,
        }
    }

    pub const fn speaking(on: bool) -> Self {
        Self {
            mic_on: None,
            cam_on: None,
            screen_on: None,
            speaking: Some(on),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_reports_change() {
        let mut p = Participant::new(UserId(1), "alice");
        assert!(p.apply(&StateUpdate::mic(true)));
        assert!(p.mic_on);
        assert!(!p.apply(&StateUpdate::mic(true)));
    }

    #[test]
    fn test_apply_leaves_absent_flags_untouched() {
        let mut p = Participant::new(UserId(1), "alice");
        p.cam_on = true;
        p.apply(&StateUpdate::screen(true));
        assert!(p.cam_on);
        assert!(p.screen_on);
    }

    #[test]
    fn test_participant_missing_flags_default_off() {
        let p: Participant =
            serde_json::from_str(r#"{"userId":7,"displayName":"bob"}"#).unwrap();
        assert_eq!(p.user_id, UserId(7));
        assert!(!p.mic_on && !p.cam_on && !p.screen_on && !p.speaking);
    }
}
