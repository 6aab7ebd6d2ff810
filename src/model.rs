use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub instagram: Option<String>,
    #[serde(default)]
    pub twitter: Option<String>,
    #[serde(default)]
    pub linkedin: Option<String>,
}

impl Profile {
    /// Placeholder profile for an identity that never filled one in.
    pub fn placeholder(identity: &Identity) -> Self {
        let username = identity
            .email
            .as_deref()
            .and_then(|email| email.split('@').next())
            .filter(|local| !local.is_empty())
            .map(str::to_string);
        Self {
            id: identity.id.clone(),
            username,
            full_name: Some("User".into()),
            ..Self::default()
        }
    }

    pub fn display_name(&self) -> &str {
        self.full_name
            .as_deref()
            .or(self.username.as_deref())
            .unwrap_or("unknown")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub is_anonymous: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub profiles: Option<Profile>,
    #[serde(default)]
    pub likes: Vec<Like>,
    #[serde(default)]
    pub comments: Vec<Comment>,
    #[serde(default)]
    pub media_files: Vec<MediaFile>,
}

impl Post {
    pub fn liked_by(&self, user_id: &str) -> bool {
        self.likes.iter().any(|like| like.user_id == user_id)
    }

    pub fn author_label(&self) -> &str {
        if self.is_anonymous {
            return "Anonymous";
        }
        self.profiles
            .as_ref()
            .map(Profile::display_name)
            .unwrap_or("unknown")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NewPost {
    pub user_id: String,
    pub content: String,
    pub is_anonymous: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PostUpdate {
    pub content: String,
    pub is_anonymous: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Like {
    pub id: String,
    pub post_id: String,
    pub user_id: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub post_id: String,
    pub user_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub is_edited: bool,
    #[serde(default)]
    pub edited_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub profiles: Option<Profile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewComment {
    pub post_id: String,
    pub user_id: String,
    pub content: String,
    pub parent_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaFile {
    pub id: String,
    pub post_id: String,
    pub user_id: String,
    pub file_path: String,
    pub file_type: MediaKind,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Public URL, filled in by the feed after loading.
    #[serde(default, skip_serializing)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewMediaFile {
    pub post_id: String,
    pub user_id: String,
    pub file_path: String,
    pub file_type: MediaKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Follow {
    pub follower_id: String,
    pub following_id: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub content_type: String,
    pub content_id: String,
    pub reason: String,
    pub reported_by: String,
    pub status: String,
}

/// Editable profile fields. `None` clears the stored value.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProfileUpdate {
    pub full_name: Option<String>,
    pub username: Option<String>,
    pub bio: Option<String>,
    pub location: Option<String>,
    pub website: Option<String>,
    pub instagram: Option<String>,
    pub twitter: Option<String>,
    pub linkedin: Option<String>,
}

impl ProfileUpdate {
    pub fn apply_to(&self, profile: &mut Profile) {
        profile.full_name = self.full_name.clone();
        profile.username = self.username.clone();
        profile.bio = self.bio.clone();
        profile.location = self.location.clone();
        profile.website = self.website.clone();
        profile.instagram = self.instagram.clone();
        profile.twitter = self.twitter.clone();
        profile.linkedin = self.linkedin.clone();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Like,
    Comment,
    Follow,
    Mention,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub content: String,
    #[serde(default)]
    pub reference_id: Option<String>,
    #[serde(default)]
    pub reference_type: Option<String>,
    #[serde(default)]
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewNotification {
    pub user_id: String,
    pub kind: NotificationKind,
    pub content: String,
    pub reference_id: Option<String>,
    pub reference_type: Option<String>,
}

impl NewNotification {
    pub fn new(user_id: impl Into<String>, kind: NotificationKind, content: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            kind,
            content: content.into(),
            reference_id: None,
            reference_type: None,
        }
    }

    /// Points the notification at the row it is about, e.g. `("post", id)`.
    pub fn about(mut self, reference_type: &str, reference_id: &str) -> Self {
        self.reference_type = Some(reference_type.to_string());
        self.reference_id = Some(reference_id.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SignUp {
    pub email: String,
    pub password: String,
    pub full_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StaffRole {
    Admin,
    Staff,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaffMember {
    pub id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub full_name: String,
    pub role: StaffRole,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_login: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StaffUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<StaffRole>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleCategory {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub base_rate: f64,
    #[serde(default)]
    pub creation_fee: f64,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CategoryDraft {
    pub name: String,
    pub description: Option<String>,
    pub base_rate: f64,
    pub creation_fee: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PassStatus {
    Active,
    Expired,
    Cancelled,
}

impl PassStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PassStatus::Active => "active",
            PassStatus::Expired => "expired",
            PassStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryRef {
    pub name: String,
    #[serde(default)]
    pub base_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TollPass {
    pub id: String,
    pub vehicle_number: String,
    pub category_id: String,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub status: PassStatus,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub vehicle_categories: Option<CategoryRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewTollPass {
    pub vehicle_number: String,
    pub category_id: String,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub status: PassStatus,
    pub created_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassRef {
    pub vehicle_number: String,
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub vehicle_categories: Option<CategoryRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    #[serde(default)]
    pub pass_id: Option<String>,
    pub amount: f64,
    pub processed_by: String,
    pub processed_at: DateTime<Utc>,
    pub receipt_number: String,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub toll_passes: Option<PassRef>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewTransaction {
    pub pass_id: Option<String>,
    pub amount: f64,
    pub processed_by: String,
    pub notes: Option<String>,
    pub receipt_number: String,
}
