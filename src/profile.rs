//! Profile editing: the text fields and the avatar picture.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::info;

use crate::crop::{self, PixelRect, Rotation};
use crate::data::{Backend, SocialService, StorageService};
use crate::model::{Profile, ProfileUpdate};

/// Folder inside the avatar bucket that holds profile pictures.
pub const AVATAR_FOLDER: &str = "profile-images";

/// Editable copy of a profile. Blank fields are cleared on save.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileForm {
    pub full_name: String,
    pub username: String,
    pub bio: String,
    pub location: String,
    pub website: String,
    pub instagram: String,
    pub twitter: String,
    pub linkedin: String,
}

impl ProfileForm {
    pub fn from_profile(profile: &Profile) -> Self {
        let text = |field: &Option<String>| field.clone().unwrap_or_default();
        Self {
            full_name: text(&profile.full_name),
            username: text(&profile.username),
            bio: text(&profile.bio),
            location: text(&profile.location),
            website: text(&profile.website),
            instagram: text(&profile.instagram),
            twitter: text(&profile.twitter),
            linkedin: text(&profile.linkedin),
        }
    }

    fn to_update(&self) -> ProfileUpdate {
        fn field(value: &str) -> Option<String> {
            let value = value.trim();
            (!value.is_empty()).then(|| value.to_string())
        }
        ProfileUpdate {
            full_name: field(&self.full_name),
            username: field(&self.username),
            bio: field(&self.bio),
            location: field(&self.location),
            website: field(&self.website),
            instagram: field(&self.instagram),
            twitter: field(&self.twitter),
            linkedin: field(&self.linkedin),
        }
    }
}

/// Crop chosen for a new avatar, in the same terms as the post crop queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvatarCrop {
    pub rect: PixelRect,
    pub rendered: (u32, u32),
    pub rotation: Rotation,
}

pub struct ProfileEditor {
    social: Arc<dyn SocialService>,
    storage: Arc<dyn StorageService>,
    bucket: String,
    quality: u8,
}

impl ProfileEditor {
    pub fn new(backend: &Backend, avatar_bucket: impl Into<String>, quality: u8) -> Self {
        Self {
            social: backend.social.clone(),
            storage: backend.storage.clone(),
            bucket: avatar_bucket.into(),
            quality,
        }
    }

    pub fn save(&self, user_id: &str, form: &ProfileForm) -> Result<Profile> {
        let profile = self
            .social
            .update_profile(user_id, &form.to_update())
            .context("save profile")?;
        info!(user_id, "profile saved");
        Ok(profile)
    }

    /// Crops `encoded`, stores it under `profile-images/{user}-{millis}.jpg`
    /// and points the profile at its public URL.
    pub fn update_avatar(&self, user_id: &str, encoded: &[u8], crop: AvatarCrop) -> Result<String> {
        let jpeg = crop::export(encoded, crop.rect, crop.rendered, crop.rotation, self.quality)?;
        let key = format!(
            "{}/{}-{}.jpg",
            AVATAR_FOLDER,
            user_id,
            Utc::now().timestamp_millis()
        );
        self.storage
            .upload_to(&self.bucket, &key, jpeg, "image/jpeg", true)
            .with_context(|| format!("upload avatar {}", key))?;
        let url = self.storage.public_url_in(&self.bucket, &key);
        self.social
            .set_avatar_url(user_id, &url)
            .context("update avatar url")?;
        info!(user_id, key = %key, "avatar updated");
        Ok(url)
    }
}
