use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::json;

use crate::model::{
    CategoryDraft, Comment, Follow, Identity, Like, MediaFile, NewComment, NewMediaFile,
    NewNotification, NewPost, NewTollPass, NewTransaction, Notification, Post, PostUpdate,
    Profile, ProfileUpdate, Report, SignUp, StaffMember, StaffUpdate, TollPass, Transaction,
    VehicleCategory,
};
use crate::supabase::{self, Order, Query};

const POST_SELECT: &str = "*, profiles (*), likes (*), comments (*), media_files (*)";
const PASS_SELECT: &str = "*, vehicle_categories (name, base_rate)";
const TRANSACTION_SELECT: &str =
    "*, toll_passes (vehicle_number, category_id, vehicle_categories (name))";
const TRANSACTION_SELECT_INNER: &str =
    "*, toll_passes!inner (vehicle_number, category_id, vehicle_categories (name))";

pub trait AuthService: Send + Sync {
    fn current_user(&self) -> Result<Option<Identity>>;
    fn sign_up(&self, request: &SignUp) -> Result<Identity>;
}

pub trait PostService: Send + Sync {
    fn create_post(&self, post: &NewPost) -> Result<Post>;
    /// Posts newest first with author, likes, comments and media joined.
    /// `from` and `to` are inclusive row offsets.
    fn list_posts(&self, from: usize, to: usize) -> Result<Vec<Post>>;
    fn fetch_post(&self, id: &str) -> Result<Option<Post>>;
    fn update_post(&self, id: &str, update: &PostUpdate) -> Result<()>;
    fn delete_post(&self, id: &str) -> Result<()>;
    fn insert_media(&self, media: &NewMediaFile) -> Result<MediaFile>;
}

pub trait StorageService: Send + Sync {
    /// Stores a post attachment in the media bucket; existing keys are an error.
    fn upload(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()>;
    fn public_url(&self, key: &str) -> String;
    fn upload_to(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
        upsert: bool,
    ) -> Result<()>;
    fn public_url_in(&self, bucket: &str, key: &str) -> String;
}

pub trait SocialService: Send + Sync {
    fn profile(&self, id: &str) -> Result<Option<Profile>>;
    fn create_profile(&self, profile: &Profile) -> Result<Profile>;
    fn update_profile(&self, id: &str, update: &ProfileUpdate) -> Result<Profile>;
    fn set_avatar_url(&self, id: &str, url: &str) -> Result<()>;
    /// Profiles whose id is not in `exclude`.
    fn profiles_excluding(&self, exclude: &[String], limit: usize) -> Result<Vec<Profile>>;
    fn like(&self, post_id: &str, user_id: &str) -> Result<Like>;
    fn unlike(&self, post_id: &str, user_id: &str) -> Result<()>;
    fn comments(&self, post_id: &str) -> Result<Vec<Comment>>;
    fn add_comment(&self, comment: &NewComment) -> Result<Comment>;
    fn edit_comment(&self, id: &str, content: &str, edited_at: DateTime<Utc>) -> Result<()>;
    fn delete_comment(&self, id: &str) -> Result<()>;
    fn follow(&self, follower_id: &str, following_id: &str) -> Result<()>;
    fn unfollow(&self, follower_id: &str, following_id: &str) -> Result<()>;
    fn following(&self, follower_id: &str, limit: Option<usize>) -> Result<Vec<Follow>>;
    fn report(&self, report: &Report) -> Result<()>;
}

pub trait NotificationService: Send + Sync {
    fn create_notification(&self, notification: &NewNotification) -> Result<Notification>;
    /// Newest first.
    fn notifications(&self, user_id: &str, limit: usize) -> Result<Vec<Notification>>;
    fn mark_notification_read(&self, id: &str) -> Result<()>;
    fn mark_all_notifications_read(&self, user_id: &str) -> Result<()>;
    fn unread_notifications(&self, user_id: &str) -> Result<usize>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionFilter {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub vehicle_number: Option<String>,
    pub category_id: Option<String>,
}

pub trait TollService: Send + Sync {
    fn list_staff(&self) -> Result<Vec<StaffMember>>;
    fn update_staff(&self, id: &str, update: &StaffUpdate) -> Result<StaffMember>;
    fn delete_staff(&self, id: &str) -> Result<()>;
    fn list_categories(&self) -> Result<Vec<VehicleCategory>>;
    fn create_category(&self, draft: &CategoryDraft) -> Result<VehicleCategory>;
    fn update_category(&self, id: &str, draft: &CategoryDraft) -> Result<VehicleCategory>;
    fn list_passes(&self) -> Result<Vec<TollPass>>;
    fn create_pass(&self, pass: &NewTollPass) -> Result<TollPass>;
    fn update_pass(&self, id: &str, pass: &NewTollPass) -> Result<TollPass>;
    fn search_active_passes(&self, fragment: &str) -> Result<Vec<TollPass>>;
    fn count_active_passes(&self) -> Result<usize>;
    fn generate_receipt_number(&self) -> Result<String>;
    fn create_transaction(&self, transaction: &NewTransaction) -> Result<Transaction>;
    fn list_transactions(&self, filter: &TransactionFilter) -> Result<Vec<Transaction>>;
}

/// Every service the application talks to, bundled so UI-facing code can
/// depend on interfaces instead of a concrete client.
#[derive(Clone)]
pub struct Backend {
    pub auth: Arc<dyn AuthService>,
    pub posts: Arc<dyn PostService>,
    pub storage: Arc<dyn StorageService>,
    pub social: Arc<dyn SocialService>,
    pub notifications: Arc<dyn NotificationService>,
    pub toll: Arc<dyn TollService>,
}

impl Backend {
    pub fn from_shared<T>(shared: Arc<T>) -> Self
    where
        T: AuthService
            + PostService
            + StorageService
            + SocialService
            + NotificationService
            + TollService
            + 'static,
    {
        Self {
            auth: shared.clone(),
            posts: shared.clone(),
            storage: shared.clone(),
            social: shared.clone(),
            notifications: shared.clone(),
            toll: shared,
        }
    }

    pub fn supabase(client: Arc<supabase::Client>) -> Self {
        Self::from_shared(Arc::new(SupabaseBackend::new(client)))
    }
}

pub struct SupabaseBackend {
    client: Arc<supabase::Client>,
}

impl SupabaseBackend {
    pub fn new(client: Arc<supabase::Client>) -> Self {
        Self { client }
    }
}

impl AuthService for SupabaseBackend {
    fn current_user(&self) -> Result<Option<Identity>> {
        self.client.current_user().context("fetch current user")
    }

    fn sign_up(&self, request: &SignUp) -> Result<Identity> {
        self.client.sign_up(request).context("sign up")
    }
}

impl PostService for SupabaseBackend {
    fn create_post(&self, post: &NewPost) -> Result<Post> {
        self.client.insert("posts", post).context("create post")
    }

    fn list_posts(&self, from: usize, to: usize) -> Result<Vec<Post>> {
        let query = Query::new()
            .select(POST_SELECT)
            .order("created_at", Order::Descending)
            .range(from, to);
        self.client.select("posts", &query).context("fetch posts")
    }

    fn fetch_post(&self, id: &str) -> Result<Option<Post>> {
        let query = Query::new().select(POST_SELECT).eq("id", id);
        self.client.select_one("posts", &query).context("fetch post")
    }

    fn update_post(&self, id: &str, update: &PostUpdate) -> Result<()> {
        let query = Query::new().eq("id", id);
        let _: Vec<serde_json::Value> = self
            .client
            .update("posts", &query, update)
            .context("update post")?;
        Ok(())
    }

    fn delete_post(&self, id: &str) -> Result<()> {
        self.client
            .delete("posts", &Query::new().eq("id", id))
            .context("delete post")
    }

    fn insert_media(&self, media: &NewMediaFile) -> Result<MediaFile> {
        self.client
            .insert("media_files", media)
            .context("record media file")
    }
}

impl StorageService for SupabaseBackend {
    fn upload(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        self.client
            .upload(key, bytes, content_type)
            .context("upload media")
    }

    fn public_url(&self, key: &str) -> String {
        self.client.public_url(key)
    }

    fn upload_to(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
        upsert: bool,
    ) -> Result<()> {
        self.client
            .upload_to(bucket, key, bytes, content_type, upsert)
            .with_context(|| format!("upload to {}", bucket))
    }

    fn public_url_in(&self, bucket: &str, key: &str) -> String {
        self.client.public_url_in(bucket, key)
    }
}

impl SocialService for SupabaseBackend {
    fn profile(&self, id: &str) -> Result<Option<Profile>> {
        self.client
            .select_one("profiles", &Query::new().eq("id", id))
            .context("fetch profile")
    }

    fn create_profile(&self, profile: &Profile) -> Result<Profile> {
        self.client
            .insert("profiles", profile)
            .context("create profile")
    }

    fn update_profile(&self, id: &str, update: &ProfileUpdate) -> Result<Profile> {
        let rows: Vec<Profile> = self
            .client
            .update("profiles", &Query::new().eq("id", id), update)
            .context("update profile")?;
        rows.into_iter()
            .next()
            .with_context(|| format!("profile {} not found", id))
    }

    fn set_avatar_url(&self, id: &str, url: &str) -> Result<()> {
        let _: Vec<serde_json::Value> = self
            .client
            .update(
                "profiles",
                &Query::new().eq("id", id),
                &json!({ "avatar_url": url }),
            )
            .context("update avatar")?;
        Ok(())
    }

    fn profiles_excluding(&self, exclude: &[String], limit: usize) -> Result<Vec<Profile>> {
        let mut query = Query::new().limit(limit);
        if !exclude.is_empty() {
            query = query.not_in("id", exclude);
        }
        self.client
            .select("profiles", &query)
            .context("fetch profiles")
    }

    fn like(&self, post_id: &str, user_id: &str) -> Result<Like> {
        let row = json!({ "post_id": post_id, "user_id": user_id });
        self.client.insert("likes", &row).context("like post")
    }

    fn unlike(&self, post_id: &str, user_id: &str) -> Result<()> {
        let query = Query::new().eq("post_id", post_id).eq("user_id", user_id);
        self.client.delete("likes", &query).context("unlike post")
    }

    fn comments(&self, post_id: &str) -> Result<Vec<Comment>> {
        let query = Query::new()
            .select("*, profiles (*)")
            .eq("post_id", post_id)
            .order("created_at", Order::Ascending);
        self.client
            .select("comments", &query)
            .context("fetch comments")
    }

    fn add_comment(&self, comment: &NewComment) -> Result<Comment> {
        self.client
            .insert("comments", comment)
            .context("add comment")
    }

    fn edit_comment(&self, id: &str, content: &str, edited_at: DateTime<Utc>) -> Result<()> {
        let patch = json!({
            "content": content,
            "is_edited": true,
            "edited_at": edited_at,
        });
        let _: Vec<serde_json::Value> = self
            .client
            .update("comments", &Query::new().eq("id", id), &patch)
            .context("edit comment")?;
        Ok(())
    }

    fn delete_comment(&self, id: &str) -> Result<()> {
        self.client
            .delete("comments", &Query::new().eq("id", id))
            .context("delete comment")
    }

    fn follow(&self, follower_id: &str, following_id: &str) -> Result<()> {
        let row = json!({ "follower_id": follower_id, "following_id": following_id });
        self.client
            .insert_minimal("follows", &row)
            .context("follow user")
    }

    fn unfollow(&self, follower_id: &str, following_id: &str) -> Result<()> {
        let query = Query::new()
            .eq("follower_id", follower_id)
            .eq("following_id", following_id);
        self.client.delete("follows", &query).context("unfollow user")
    }

    fn following(&self, follower_id: &str, limit: Option<usize>) -> Result<Vec<Follow>> {
        let mut query = Query::new().eq("follower_id", follower_id);
        if let Some(limit) = limit {
            query = query.limit(limit);
        }
        self.client
            .select("follows", &query)
            .context("fetch following")
    }

    fn report(&self, report: &Report) -> Result<()> {
        self.client
            .insert_minimal("flagged_content", report)
            .context("report content")
    }
}

impl NotificationService for SupabaseBackend {
    fn create_notification(&self, notification: &NewNotification) -> Result<Notification> {
        let args = json!({
            "p_user_id": notification.user_id,
            "p_type": notification.kind,
            "p_content": notification.content,
            "p_reference_id": notification.reference_id,
            "p_reference_type": notification.reference_type,
        });
        self.client
            .rpc("create_notification", &args)
            .context("create notification")
    }

    fn notifications(&self, user_id: &str, limit: usize) -> Result<Vec<Notification>> {
        let query = Query::new()
            .eq("user_id", user_id)
            .order("created_at", Order::Descending)
            .limit(limit);
        self.client
            .select("notifications", &query)
            .context("fetch notifications")
    }

    fn mark_notification_read(&self, id: &str) -> Result<()> {
        let _: Vec<serde_json::Value> = self
            .client
            .update(
                "notifications",
                &Query::new().eq("id", id),
                &json!({ "is_read": true }),
            )
            .context("mark notification read")?;
        Ok(())
    }

    fn mark_all_notifications_read(&self, user_id: &str) -> Result<()> {
        let query = Query::new().eq("user_id", user_id).eq("is_read", false);
        let _: Vec<serde_json::Value> = self
            .client
            .update("notifications", &query, &json!({ "is_read": true }))
            .context("mark notifications read")?;
        Ok(())
    }

    fn unread_notifications(&self, user_id: &str) -> Result<usize> {
        let query = Query::new().eq("user_id", user_id).eq("is_read", false);
        self.client
            .count("notifications", &query)
            .context("count unread notifications")
    }
}

impl TollService for SupabaseBackend {
    fn list_staff(&self) -> Result<Vec<StaffMember>> {
        let query = Query::new()
            .neq("role", "admin")
            .order("created_at", Order::Descending);
        self.client.select("users", &query).context("fetch staff")
    }

    fn update_staff(&self, id: &str, update: &StaffUpdate) -> Result<StaffMember> {
        let rows: Vec<StaffMember> = self
            .client
            .update("users", &Query::new().eq("id", id), update)
            .context("update staff member")?;
        rows.into_iter()
            .next()
            .with_context(|| format!("staff member {} not found", id))
    }

    fn delete_staff(&self, id: &str) -> Result<()> {
        self.client
            .delete("users", &Query::new().eq("id", id))
            .context("delete staff member")
    }

    fn list_categories(&self) -> Result<Vec<VehicleCategory>> {
        let query = Query::new().order("name", Order::Ascending);
        self.client
            .select("vehicle_categories", &query)
            .context("fetch vehicle categories")
    }

    fn create_category(&self, draft: &CategoryDraft) -> Result<VehicleCategory> {
        self.client
            .insert("vehicle_categories", draft)
            .context("create vehicle category")
    }

    fn update_category(&self, id: &str, draft: &CategoryDraft) -> Result<VehicleCategory> {
        let rows: Vec<VehicleCategory> = self
            .client
            .update("vehicle_categories", &Query::new().eq("id", id), draft)
            .context("update vehicle category")?;
        rows.into_iter()
            .next()
            .with_context(|| format!("vehicle category {} not found", id))
    }

    fn list_passes(&self) -> Result<Vec<TollPass>> {
        let query = Query::new()
            .select(PASS_SELECT)
            .order("created_at", Order::Descending);
        self.client
            .select("toll_passes", &query)
            .context("fetch toll passes")
    }

    fn create_pass(&self, pass: &NewTollPass) -> Result<TollPass> {
        self.client
            .insert("toll_passes", pass)
            .context("create toll pass")
    }

    fn update_pass(&self, id: &str, pass: &NewTollPass) -> Result<TollPass> {
        let rows: Vec<TollPass> = self
            .client
            .update("toll_passes", &Query::new().eq("id", id), pass)
            .context("update toll pass")?;
        rows.into_iter()
            .next()
            .with_context(|| format!("toll pass {} not found", id))
    }

    fn search_active_passes(&self, fragment: &str) -> Result<Vec<TollPass>> {
        let query = Query::new()
            .select(PASS_SELECT)
            .ilike_contains("vehicle_number", fragment)
            .eq("status", "active");
        self.client
            .select("toll_passes", &query)
            .context("search toll passes")
    }

    fn count_active_passes(&self) -> Result<usize> {
        self.client
            .count("toll_passes", &Query::new().eq("status", "active"))
            .context("count active passes")
    }

    fn generate_receipt_number(&self) -> Result<String> {
        self.client
            .rpc("generate_receipt_number", &json!({}))
            .context("generate receipt number")
    }

    fn create_transaction(&self, transaction: &NewTransaction) -> Result<Transaction> {
        self.client
            .insert("transactions", transaction)
            .context("record transaction")
    }

    fn list_transactions(&self, filter: &TransactionFilter) -> Result<Vec<Transaction>> {
        let embedded = filter.vehicle_number.is_some() || filter.category_id.is_some();
        let select = if embedded {
            TRANSACTION_SELECT_INNER
        } else {
            TRANSACTION_SELECT
        };
        let mut query = Query::new().select(select);
        if let Some(from) = filter.from {
            query = query.gte("processed_at", from.to_rfc3339());
        }
        if let Some(to) = filter.to {
            query = query.lte("processed_at", to.to_rfc3339());
        }
        if let Some(vehicle) = &filter.vehicle_number {
            query = query.eq("toll_passes.vehicle_number", vehicle);
        }
        if let Some(category) = &filter.category_id {
            query = query.eq("toll_passes.category_id", category);
        }
        query = query.order("processed_at", Order::Descending);
        self.client
            .select("transactions", &query)
            .context("fetch transactions")
    }
}
