//! Profile records and their local validation rules.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ActionError;
use crate::models::UserSummary;

pub const DISPLAY_NAME_MIN_LENGTH: usize = 3;
pub const DISPLAY_NAME_MAX_LENGTH: usize = 30;
pub const NAME_MAX_LENGTH: usize = 50;
pub const PASSKEY_MIN_LENGTH: usize = 4;
/// 128 chars accommodates password managers and passphrases.
pub const PASSKEY_MAX_LENGTH: usize = 128;
pub const BIO_MAX_LENGTH: usize = 160;
/// Inline `data:image/...` payloads larger than this belong in object storage.
pub const INLINE_IMAGE_MAX_LENGTH: usize = 1_000_000;

/// Treat an explicit `null` the same as a missing field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// A user profile as held by the remote store.
///
/// The local session keeps a copy of this record; only `id` and
/// `display_name` are required on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub struct UserProfile {
    pub id: String,
    #[serde(rename = "displayName")]
    pub display_name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    // Plaintext shared secret owned by the remote record format.
    #[serde(default, deserialize_with = "null_as_default")]
    pub passkey: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub bio: String,
    #[serde(rename = "profileImage", default)]
    pub profile_image: Option<String>,
    #[serde(rename = "createdAt", default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(rename = "lastLogin", default)]
    pub last_login: Option<DateTime<Utc>>,
    #[serde(rename = "loginCount", default, deserialize_with = "null_as_default")]
    pub login_count: u64,
    #[serde(rename = "likedSongs", default, deserialize_with = "null_as_default")]
    pub liked_songs: BTreeSet<String>,
}

impl UserProfile {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            name: String::new(),
            passkey: String::new(),
            bio: String::new(),
            profile_image: None,
            created_at: None,
            last_login: None,
            login_count: 0,
            liked_songs: BTreeSet::new(),
        }
    }

    pub fn liked_count(&self) -> usize {
        self.liked_songs.len()
    }

    pub fn has_liked(&self, track_id: &str) -> bool {
        self.liked_songs.contains(track_id)
    }

    /// Name shown in lists: the full name when set, otherwise the display name.
    pub fn shown_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.display_name
        } else {
            &self.name
        }
    }

    /// Whether the fields watched by periodic reconciliation differ.
    pub fn sync_fields_differ(&self, other: &UserProfile) -> bool {
        self.display_name != other.display_name
            || self.bio != other.bio
            || self.profile_image != other.profile_image
    }

    /// Compare a candidate passkey against the stored one.
    pub fn passkey_matches(&self, candidate: &str) -> bool {
        !self.passkey.is_empty() && self.passkey == candidate
    }

    pub fn summary(&self) -> UserSummary {
        UserSummary {
            id: self.id.clone(),
            display_name: self.display_name.clone(),
            name: self.name.clone(),
            profile_image: self.profile_image.clone(),
        }
    }
}

/// Sign-up payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewProfile {
    #[serde(rename = "displayName")]
    pub display_name: String,
    pub name: String,
    pub passkey: String,
    #[serde(default)]
    pub bio: String,
    #[serde(rename = "profileImage", default, skip_serializing_if = "Option::is_none")]
    pub profile_image: Option<String>,
}

impl NewProfile {
    pub fn validate(&self) -> Result<(), ActionError> {
        validate_display_name(&self.display_name)?;
        validate_name(&self.name)?;
        validate_passkey(&self.passkey)?;
        validate_bio(&self.bio)?;
        if let Some(ref image) = self.profile_image {
            validate_profile_image(image)?;
        }
        Ok(())
    }
}

/// Partial profile update. `None` fields are left untouched remotely.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileUpdate {
    #[serde(rename = "displayName", default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
    #[serde(rename = "profileImage", default, skip_serializing_if = "Option::is_none")]
    pub profile_image: Option<String>,
}

impl ProfileUpdate {
    pub fn is_empty(&self) -> bool {
        self.display_name.is_none()
            && self.name.is_none()
            && self.bio.is_none()
            && self.profile_image.is_none()
    }

    pub fn validate(&self) -> Result<(), ActionError> {
        if self.is_empty() {
            return Err(ActionError::validation("Nothing to update"));
        }
        if let Some(ref display_name) = self.display_name {
            validate_display_name(display_name)?;
        }
        if let Some(ref name) = self.name {
            validate_name(name)?;
        }
        if let Some(ref bio) = self.bio {
            validate_bio(bio)?;
        }
        if let Some(ref image) = self.profile_image {
            validate_profile_image(image)?;
        }
        Ok(())
    }

    /// Apply the present fields to a local copy.
    pub fn apply_to(&self, profile: &mut UserProfile) {
        if let Some(ref display_name) = self.display_name {
            profile.display_name = display_name.clone();
        }
        if let Some(ref name) = self.name {
            profile.name = name.clone();
        }
        if let Some(ref bio) = self.bio {
            profile.bio = bio.clone();
        }
        if let Some(ref image) = self.profile_image {
            profile.profile_image = Some(image.clone());
        }
    }
}

pub fn validate_display_name(display_name: &str) -> Result<(), ActionError> {
    let len = display_name.chars().count();
    if len < DISPLAY_NAME_MIN_LENGTH || len > DISPLAY_NAME_MAX_LENGTH {
        return Err(ActionError::validation(format!(
            "Display name must be {}-{} characters",
            DISPLAY_NAME_MIN_LENGTH, DISPLAY_NAME_MAX_LENGTH
        )));
    }
    if !display_name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    {
        return Err(ActionError::validation(
            "Display name may only contain letters, digits, '_', '.' and '-'",
        ));
    }
    Ok(())
}

pub fn validate_name(name: &str) -> Result<(), ActionError> {
    if name.trim().is_empty() {
        return Err(ActionError::validation("Name is required"));
    }
    if name.chars().count() > NAME_MAX_LENGTH || name.chars().any(|c| c.is_control()) {
        return Err(ActionError::validation(format!(
            "Name must be at most {} printable characters",
            NAME_MAX_LENGTH
        )));
    }
    Ok(())
}

pub fn validate_passkey(passkey: &str) -> Result<(), ActionError> {
    let len = passkey.chars().count();
    if len < PASSKEY_MIN_LENGTH || len > PASSKEY_MAX_LENGTH {
        return Err(ActionError::validation(format!(
            "Passkey must be {}-{} characters",
            PASSKEY_MIN_LENGTH, PASSKEY_MAX_LENGTH
        )));
    }
    if passkey.chars().any(|c| c.is_control()) {
        return Err(ActionError::validation("Passkey contains invalid characters"));
    }
    Ok(())
}

pub fn validate_bio(bio: &str) -> Result<(), ActionError> {
    if bio.chars().count() > BIO_MAX_LENGTH {
        return Err(ActionError::validation(format!(
            "Bio must be at most {} characters",
            BIO_MAX_LENGTH
        )));
    }
    Ok(())
}

/// Accepts an http(s) URL or an inline `data:image/...;base64,` payload.
pub fn validate_profile_image(image: &str) -> Result<(), ActionError> {
    if image.starts_with("https://") || image.starts_with("http://") {
        return Ok(());
    }
    if let Some(rest) = image.strip_prefix("data:image/") {
        if !rest.contains(";base64,") {
            return Err(ActionError::validation("Inline image must be base64 encoded"));
        }
        if image.len() > INLINE_IMAGE_MAX_LENGTH {
            return Err(ActionError::validation("Inline image is too large, upload it instead"));
        }
        return Ok(());
    }
    Err(ActionError::validation(
        "Profile image must be an http(s) URL or an inline image",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_profile_parses_with_defaults() {
        let json = r#"{"id": "u1", "displayName": "mira"}"#;
        let profile: UserProfile = serde_json::from_str(json).expect("minimal profile");
        assert_eq!(profile.id, "u1");
        assert_eq!(profile.display_name, "mira");
        assert_eq!(profile.bio, "");
        assert_eq!(profile.login_count, 0);
        assert!(profile.liked_songs.is_empty());
        assert_eq!(profile.liked_count(), 0);
    }

    #[test]
    fn test_null_liked_songs_is_empty() {
        let json = r#"{"id": "u1", "displayName": "mira", "likedSongs": null, "bio": null}"#;
        let profile: UserProfile = serde_json::from_str(json).expect("profile with nulls");
        assert!(profile.liked_songs.is_empty());
        assert_eq!(profile.liked_count(), 0);
        assert_eq!(profile.bio, "");
    }

    #[test]
    fn test_full_profile_parses() {
        let json = r#"{
            "id": "u7",
            "displayName": "dj_nova",
            "name": "Nova Reyes",
            "passkey": "hunter22",
            "bio": "synths",
            "profileImage": "https://img.example/nova.png",
            "createdAt": "2024-03-01T10:00:00Z",
            "lastLogin": "2024-05-01T08:30:00Z",
            "loginCount": 12,
            "likedSongs": ["t3", "t1", "t3"]
        }"#;
        let profile: UserProfile = serde_json::from_str(json).expect("full profile");
        assert_eq!(profile.shown_name(), "Nova Reyes");
        assert_eq!(profile.login_count, 12);
        assert_eq!(profile.liked_count(), 2);
        assert!(profile.has_liked("t1"));
        assert!(profile.passkey_matches("hunter22"));
        assert!(!profile.passkey_matches("hunter23"));
    }

    #[test]
    fn test_missing_display_name_is_rejected() {
        let json = r#"{"id": "u1"}"#;
        assert!(serde_json::from_str::<UserProfile>(json).is_err());
    }

    #[test]
    fn test_empty_passkey_never_matches() {
        let profile = UserProfile::new("u1", "mira");
        assert!(!profile.passkey_matches(""));
    }

    #[test]
    fn test_sync_fields_differ() {
        let a = UserProfile::new("u1", "mira");
        let mut b = a.clone();
        assert!(!a.sync_fields_differ(&b));

        b.login_count = 4;
        b.liked_songs.insert("t1".into());
        assert!(!a.sync_fields_differ(&b));

        b.bio = "new bio".into();
        assert!(a.sync_fields_differ(&b));
    }

    #[test]
    fn test_display_name_validation() {
        assert!(validate_display_name("mira").is_ok());
        assert!(validate_display_name("dj.nova_2-x").is_ok());
        assert!(validate_display_name("ab").is_err());
        assert!(validate_display_name(&"a".repeat(31)).is_err());
        assert!(validate_display_name("has space").is_err());
    }

    #[test]
    fn test_passkey_validation() {
        assert!(validate_passkey("abcd").is_ok());
        assert!(validate_passkey("abc").is_err());
        assert!(validate_passkey(&"a".repeat(129)).is_err());
        assert!(validate_passkey("abc\n").is_err());
    }

    #[test]
    fn test_profile_image_validation() {
        assert!(validate_profile_image("https://cdn.example/a.png").is_ok());
        assert!(validate_profile_image("data:image/png;base64,iVBORw0KGgo=").is_ok());
        assert!(validate_profile_image("data:image/png,raw").is_err());
        assert!(validate_profile_image("ftp://example/a.png").is_err());

        let huge = format!("data:image/png;base64,{}", "A".repeat(INLINE_IMAGE_MAX_LENGTH));
        assert!(validate_profile_image(&huge).is_err());
    }

    #[test]
    fn test_profile_update_validation_and_apply() {
        assert!(ProfileUpdate::default().validate().is_err());

        let update = ProfileUpdate {
            bio: Some("late night radio".into()),
            ..Default::default()
        };
        assert!(update.validate().is_ok());

        let mut profile = UserProfile::new("u1", "mira");
        update.apply_to(&mut profile);
        assert_eq!(profile.bio, "late night radio");
        assert_eq!(profile.display_name, "mira");

        let too_long = ProfileUpdate {
            bio: Some("x".repeat(BIO_MAX_LENGTH + 1)),
            ..Default::default()
        };
        assert!(matches!(too_long.validate(), Err(ActionError::Validation(_))));
    }

    #[test]
    fn test_profile_update_serializes_only_present_fields() {
        let update = ProfileUpdate {
            display_name: Some("mira2".into()),
            ..Default::default()
        };
        let json = serde_json::to_value(&update).expect("serialize update");
        assert_eq!(json, serde_json::json!({"displayName": "mira2"}));
    }

    #[test]
    fn test_new_profile_validation() {
        let ok = NewProfile {
            display_name: "mira".into(),
            name: "Mira K".into(),
            passkey: "s3cret".into(),
            bio: String::new(),
            profile_image: None,
        };
        assert!(ok.validate().is_ok());

        let blank_name = NewProfile {
            name: "   ".into(),
            ..ok.clone()
        };
        assert!(blank_name.validate().is_err());
    }
}
