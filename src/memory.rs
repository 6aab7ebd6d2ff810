//! In-process backend holding every table in memory.
//!
//! Used for offline runs and by the test-suite; behaves like the hosted
//! service for the operations the application relies on (ordering,
//! inclusive ranges, joins, receipt numbering).

use std::collections::HashMap;

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use crate::data::{
    AuthService, NotificationService, PostService, SocialService, StorageService, TollService,
    TransactionFilter,
};
use crate::model::{
    CategoryDraft, CategoryRef, Comment, Follow, Identity, Like, MediaFile, NewComment,
    NewMediaFile, NewNotification, NewPost, NewTollPass, NewTransaction, Notification, PassRef,
    PassStatus, Post, PostUpdate, Profile, ProfileUpdate, Report, SignUp, StaffMember, StaffRole,
    StaffUpdate, TollPass, Transaction, VehicleCategory,
};

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

#[derive(Default)]
struct Tables {
    next_id: u64,
    last_stamp: Option<DateTime<Utc>>,
    current_user: Option<Identity>,
    accounts: Vec<Identity>,
    profiles: Vec<Profile>,
    posts: Vec<Post>,
    likes: Vec<Like>,
    comments: Vec<Comment>,
    media: Vec<MediaFile>,
    follows: Vec<Follow>,
    reports: Vec<Report>,
    notifications: Vec<Notification>,
    /// Keyed by (bucket, key).
    objects: HashMap<(String, String), StoredObject>,
    staff: Vec<StaffMember>,
    categories: Vec<VehicleCategory>,
    passes: Vec<TollPass>,
    transactions: Vec<Transaction>,
    receipts: u64,
    uploads_until_failure: Option<usize>,
}

impl Tables {
    fn id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{:06}", prefix, self.next_id)
    }

    /// Strictly increasing timestamps so ordering by creation time is total.
    fn stamp(&mut self) -> DateTime<Utc> {
        let mut now = Utc::now();
        if let Some(last) = self.last_stamp {
            if now <= last {
                now = last + Duration::milliseconds(1);
            }
        }
        self.last_stamp = Some(now);
        now
    }

    fn joined_post(&self, post: &Post) -> Post {
        let mut joined = post.clone();
        joined.profiles = self
            .profiles
            .iter()
            .find(|profile| profile.id == post.user_id)
            .cloned();
        joined.likes = self
            .likes
            .iter()
            .filter(|like| like.post_id == post.id)
            .cloned()
            .collect();
        joined.comments = self
            .comments
            .iter()
            .filter(|comment| comment.post_id == post.id)
            .cloned()
            .collect();
        joined.media_files = self
            .media
            .iter()
            .filter(|media| media.post_id == post.id)
            .cloned()
            .collect();
        joined
    }

    fn category_ref(&self, category_id: &str) -> Option<CategoryRef> {
        self.categories
            .iter()
            .find(|category| category.id == category_id)
            .map(|category| CategoryRef {
                name: category.name.clone(),
                base_rate: category.base_rate,
            })
    }

    fn joined_pass(&self, pass: &TollPass) -> TollPass {
        let mut joined = pass.clone();
        joined.vehicle_categories = self.category_ref(&pass.category_id);
        joined
    }

    fn joined_transaction(&self, transaction: &Transaction) -> Transaction {
        let mut joined = transaction.clone();
        joined.toll_passes = transaction
            .pass_id
            .as_deref()
            .and_then(|id| self.passes.iter().find(|pass| pass.id == id))
            .map(|pass| PassRef {
                vehicle_number: pass.vehicle_number.clone(),
                category_id: Some(pass.category_id.clone()),
                vehicle_categories: self.category_ref(&pass.category_id),
            });
        joined
    }
}

pub struct MemoryBackend {
    tables: Mutex<Tables>,
    bucket: String,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            bucket: "post-media".into(),
        }
    }

    pub fn with_bucket(bucket: impl Into<String>) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            bucket: bucket.into(),
        }
    }

    /// Registers an account and makes it the signed-in identity.
    pub fn sign_in(&self, id: &str, email: &str) -> Identity {
        let identity = Identity {
            id: id.to_string(),
            email: Some(email.to_string()),
        };
        let mut tables = self.tables.lock();
        if !tables.accounts.iter().any(|account| account.id == id) {
            tables.accounts.push(identity.clone());
        }
        tables.current_user = Some(identity.clone());
        identity
    }

    pub fn sign_out(&self) {
        self.tables.lock().current_user = None;
    }

    /// Lets the next `successes` uploads through and fails the one after.
    pub fn fail_upload_after(&self, successes: usize) {
        self.tables.lock().uploads_until_failure = Some(successes);
    }

    /// Object stored under `key` in the media bucket.
    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.object_in(&self.bucket, key)
    }

    pub fn object_in(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.tables
            .lock()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /// Keys in the media bucket, sorted.
    pub fn object_keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self
            .tables
            .lock()
            .objects
            .keys()
            .filter(|(bucket, _)| *bucket == self.bucket)
            .map(|(_, key)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn media_rows(&self) -> Vec<MediaFile> {
        self.tables.lock().media.clone()
    }

    pub fn reports(&self) -> Vec<Report> {
        self.tables.lock().reports.clone()
    }

    pub fn post_count(&self) -> usize {
        self.tables.lock().posts.len()
    }

    pub fn insert_staff(&self, email: &str, full_name: &str, role: StaffRole) -> StaffMember {
        let mut tables = self.tables.lock();
        let member = StaffMember {
            id: tables.id("usr"),
            email: email.to_string(),
            full_name: full_name.to_string(),
            role,
            created_at: Some(tables.stamp()),
            last_login: None,
        };
        tables.staff.push(member.clone());
        member
    }
}

impl AuthService for MemoryBackend {
    fn current_user(&self) -> Result<Option<Identity>> {
        Ok(self.tables.lock().current_user.clone())
    }

    fn sign_up(&self, request: &SignUp) -> Result<Identity> {
        let mut tables = self.tables.lock();
        if tables
            .accounts
            .iter()
            .any(|account| account.email.as_deref() == Some(request.email.as_str()))
        {
            bail!("User already registered");
        }
        let identity = Identity {
            id: tables.id("usr"),
            email: Some(request.email.clone()),
        };
        tables.accounts.push(identity.clone());
        let created_at = Some(tables.stamp());
        tables.staff.push(StaffMember {
            id: identity.id.clone(),
            email: request.email.clone(),
            full_name: request.full_name.clone(),
            role: StaffRole::Staff,
            created_at,
            last_login: None,
        });
        Ok(identity)
    }
}

impl PostService for MemoryBackend {
    fn create_post(&self, post: &NewPost) -> Result<Post> {
        let mut tables = self.tables.lock();
        let row = Post {
            id: tables.id("post"),
            user_id: post.user_id.clone(),
            content: post.content.clone(),
            is_anonymous: post.is_anonymous,
            created_at: tables.stamp(),
            profiles: None,
            likes: Vec::new(),
            comments: Vec::new(),
            media_files: Vec::new(),
        };
        tables.posts.push(row.clone());
        Ok(row)
    }

    fn list_posts(&self, from: usize, to: usize) -> Result<Vec<Post>> {
        let tables = self.tables.lock();
        let mut ordered: Vec<&Post> = tables.posts.iter().collect();
        ordered.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if to < from {
            return Ok(Vec::new());
        }
        Ok(ordered
            .into_iter()
            .skip(from)
            .take(to - from + 1)
            .map(|post| tables.joined_post(post))
            .collect())
    }

    fn fetch_post(&self, id: &str) -> Result<Option<Post>> {
        let tables = self.tables.lock();
        Ok(tables
            .posts
            .iter()
            .find(|post| post.id == id)
            .map(|post| tables.joined_post(post)))
    }

    fn update_post(&self, id: &str, update: &PostUpdate) -> Result<()> {
        let mut tables = self.tables.lock();
        let post = tables
            .posts
            .iter_mut()
            .find(|post| post.id == id)
            .ok_or_else(|| anyhow!("post {} not found", id))?;
        post.content = update.content.clone();
        post.is_anonymous = update.is_anonymous;
        Ok(())
    }

    fn delete_post(&self, id: &str) -> Result<()> {
        let mut tables = self.tables.lock();
        tables.posts.retain(|post| post.id != id);
        tables.likes.retain(|like| like.post_id != id);
        tables.comments.retain(|comment| comment.post_id != id);
        tables.media.retain(|media| media.post_id != id);
        Ok(())
    }

    fn insert_media(&self, media: &NewMediaFile) -> Result<MediaFile> {
        let mut tables = self.tables.lock();
        if !tables.posts.iter().any(|post| post.id == media.post_id) {
            bail!("insert or update on table \"media_files\" violates foreign key constraint");
        }
        let row = MediaFile {
            id: tables.id("media"),
            post_id: media.post_id.clone(),
            user_id: media.user_id.clone(),
            file_path: media.file_path.clone(),
            file_type: media.file_type,
            created_at: Some(tables.stamp()),
            url: None,
        };
        tables.media.push(row.clone());
        Ok(row)
    }
}

impl StorageService for MemoryBackend {
    fn upload(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        self.upload_to(&self.bucket, key, bytes, content_type, false)
    }

    fn public_url(&self, key: &str) -> String {
        self.public_url_in(&self.bucket, key)
    }

    fn upload_to(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
        upsert: bool,
    ) -> Result<()> {
        let mut tables = self.tables.lock();
        match tables.uploads_until_failure {
            Some(0) => {
                tables.uploads_until_failure = None;
                bail!("storage: upload of {} rejected", key);
            }
            Some(remaining) => tables.uploads_until_failure = Some(remaining - 1),
            None => {}
        }
        let slot = (bucket.to_string(), key.to_string());
        if !upsert && tables.objects.contains_key(&slot) {
            bail!("storage: object {} already exists", key);
        }
        tables.objects.insert(
            slot,
            StoredObject {
                bytes,
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    fn public_url_in(&self, bucket: &str, key: &str) -> String {
        format!("memory://{}/{}", bucket, key)
    }
}

impl SocialService for MemoryBackend {
    fn profile(&self, id: &str) -> Result<Option<Profile>> {
        Ok(self
            .tables
            .lock()
            .profiles
            .iter()
            .find(|profile| profile.id == id)
            .cloned())
    }

    fn create_profile(&self, profile: &Profile) -> Result<Profile> {
        let mut tables = self.tables.lock();
        if tables.profiles.iter().any(|existing| existing.id == profile.id) {
            bail!("duplicate key value violates unique constraint \"profiles_pkey\"");
        }
        tables.profiles.push(profile.clone());
        Ok(profile.clone())
    }

    fn update_profile(&self, id: &str, update: &ProfileUpdate) -> Result<Profile> {
        let mut tables = self.tables.lock();
        let profile = tables
            .profiles
            .iter_mut()
            .find(|profile| profile.id == id)
            .ok_or_else(|| anyhow!("profile {} not found", id))?;
        update.apply_to(profile);
        Ok(profile.clone())
    }

    fn set_avatar_url(&self, id: &str, url: &str) -> Result<()> {
        let mut tables = self.tables.lock();
        let profile = tables
            .profiles
            .iter_mut()
            .find(|profile| profile.id == id)
            .ok_or_else(|| anyhow!("profile {} not found", id))?;
        profile.avatar_url = Some(url.to_string());
        Ok(())
    }

    fn profiles_excluding(&self, exclude: &[String], limit: usize) -> Result<Vec<Profile>> {
        Ok(self
            .tables
            .lock()
            .profiles
            .iter()
            .filter(|profile| !exclude.contains(&profile.id))
            .take(limit)
            .cloned()
            .collect())
    }

    fn like(&self, post_id: &str, user_id: &str) -> Result<Like> {
        let mut tables = self.tables.lock();
        if tables
            .likes
            .iter()
            .any(|like| like.post_id == post_id && like.user_id == user_id)
        {
            bail!("duplicate key value violates unique constraint \"likes_post_id_user_id_key\"");
        }
        let like = Like {
            id: tables.id("like"),
            post_id: post_id.to_string(),
            user_id: user_id.to_string(),
            created_at: Some(tables.stamp()),
        };
        tables.likes.push(like.clone());
        Ok(like)
    }

    fn unlike(&self, post_id: &str, user_id: &str) -> Result<()> {
        self.tables
            .lock()
            .likes
            .retain(|like| !(like.post_id == post_id && like.user_id == user_id));
        Ok(())
    }

    fn comments(&self, post_id: &str) -> Result<Vec<Comment>> {
        let tables = self.tables.lock();
        let mut rows: Vec<Comment> = tables
            .comments
            .iter()
            .filter(|comment| comment.post_id == post_id)
            .map(|comment| {
                let mut joined = comment.clone();
                joined.profiles = tables
                    .profiles
                    .iter()
                    .find(|profile| profile.id == comment.user_id)
                    .cloned();
                joined
            })
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(rows)
    }

    fn add_comment(&self, comment: &NewComment) -> Result<Comment> {
        let mut tables = self.tables.lock();
        let row = Comment {
            id: tables.id("comment"),
            post_id: comment.post_id.clone(),
            user_id: comment.user_id.clone(),
            content: comment.content.clone(),
            parent_id: comment.parent_id.clone(),
            is_edited: false,
            edited_at: None,
            created_at: tables.stamp(),
            profiles: None,
        };
        tables.comments.push(row.clone());
        Ok(row)
    }

    fn edit_comment(&self, id: &str, content: &str, edited_at: DateTime<Utc>) -> Result<()> {
        let mut tables = self.tables.lock();
        let comment = tables
            .comments
            .iter_mut()
            .find(|comment| comment.id == id)
            .ok_or_else(|| anyhow!("comment {} not found", id))?;
        comment.content = content.to_string();
        comment.is_edited = true;
        comment.edited_at = Some(edited_at);
        Ok(())
    }

    fn delete_comment(&self, id: &str) -> Result<()> {
        self.tables.lock().comments.retain(|comment| comment.id != id);
        Ok(())
    }

    fn follow(&self, follower_id: &str, following_id: &str) -> Result<()> {
        let mut tables = self.tables.lock();
        if tables
            .follows
            .iter()
            .any(|f| f.follower_id == follower_id && f.following_id == following_id)
        {
            bail!("already following {}", following_id);
        }
        let created_at = Some(tables.stamp());
        tables.follows.push(Follow {
            follower_id: follower_id.to_string(),
            following_id: following_id.to_string(),
            created_at,
        });
        Ok(())
    }

    fn unfollow(&self, follower_id: &str, following_id: &str) -> Result<()> {
        self.tables
            .lock()
            .follows
            .retain(|f| !(f.follower_id == follower_id && f.following_id == following_id));
        Ok(())
    }

    fn following(&self, follower_id: &str, limit: Option<usize>) -> Result<Vec<Follow>> {
        Ok(self
            .tables
            .lock()
            .follows
            .iter()
            .filter(|f| f.follower_id == follower_id)
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    fn report(&self, report: &Report) -> Result<()> {
        self.tables.lock().reports.push(report.clone());
        Ok(())
    }
}

impl NotificationService for MemoryBackend {
    fn create_notification(&self, notification: &NewNotification) -> Result<Notification> {
        let mut tables = self.tables.lock();
        let row = Notification {
            id: tables.id("ntf"),
            user_id: notification.user_id.clone(),
            kind: notification.kind,
            content: notification.content.clone(),
            reference_id: notification.reference_id.clone(),
            reference_type: notification.reference_type.clone(),
            is_read: false,
            created_at: tables.stamp(),
        };
        tables.notifications.push(row.clone());
        Ok(row)
    }

    fn notifications(&self, user_id: &str, limit: usize) -> Result<Vec<Notification>> {
        Ok(self
            .tables
            .lock()
            .notifications
            .iter()
            .rev()
            .filter(|row| row.user_id == user_id)
            .take(limit)
            .cloned()
            .collect())
    }

    fn mark_notification_read(&self, id: &str) -> Result<()> {
        let mut tables = self.tables.lock();
        if let Some(row) = tables.notifications.iter_mut().find(|row| row.id == id) {
            row.is_read = true;
        }
        Ok(())
    }

    fn mark_all_notifications_read(&self, user_id: &str) -> Result<()> {
        for row in self.tables.lock().notifications.iter_mut() {
            if row.user_id == user_id {
                row.is_read = true;
            }
        }
        Ok(())
    }

    fn unread_notifications(&self, user_id: &str) -> Result<usize> {
        Ok(self
            .tables
            .lock()
            .notifications
            .iter()
            .filter(|row| row.user_id == user_id && !row.is_read)
            .count())
    }
}

impl TollService for MemoryBackend {
    fn list_staff(&self) -> Result<Vec<StaffMember>> {
        let mut staff: Vec<StaffMember> = self
            .tables
            .lock()
            .staff
            .iter()
            .filter(|member| member.role != StaffRole::Admin)
            .cloned()
            .collect();
        staff.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(staff)
    }

    fn update_staff(&self, id: &str, update: &StaffUpdate) -> Result<StaffMember> {
        let mut tables = self.tables.lock();
        let member = tables
            .staff
            .iter_mut()
            .find(|member| member.id == id)
            .ok_or_else(|| anyhow!("staff member {} not found", id))?;
        if let Some(name) = &update.full_name {
            member.full_name = name.clone();
        }
        if let Some(role) = update.role {
            member.role = role;
        }
        Ok(member.clone())
    }

    fn delete_staff(&self, id: &str) -> Result<()> {
        self.tables.lock().staff.retain(|member| member.id != id);
        Ok(())
    }

    fn list_categories(&self) -> Result<Vec<VehicleCategory>> {
        let mut categories = self.tables.lock().categories.clone();
        categories.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(categories)
    }

    fn create_category(&self, draft: &CategoryDraft) -> Result<VehicleCategory> {
        let mut tables = self.tables.lock();
        let now = tables.stamp();
        let category = VehicleCategory {
            id: tables.id("cat"),
            name: draft.name.clone(),
            description: draft.description.clone(),
            base_rate: draft.base_rate,
            creation_fee: draft.creation_fee,
            created_at: Some(now),
            updated_at: Some(now),
        };
        tables.categories.push(category.clone());
        Ok(category)
    }

    fn update_category(&self, id: &str, draft: &CategoryDraft) -> Result<VehicleCategory> {
        let mut tables = self.tables.lock();
        let now = tables.stamp();
        let category = tables
            .categories
            .iter_mut()
            .find(|category| category.id == id)
            .ok_or_else(|| anyhow!("vehicle category {} not found", id))?;
        category.name = draft.name.clone();
        category.description = draft.description.clone();
        category.base_rate = draft.base_rate;
        category.creation_fee = draft.creation_fee;
        category.updated_at = Some(now);
        Ok(category.clone())
    }

    fn list_passes(&self) -> Result<Vec<TollPass>> {
        let tables = self.tables.lock();
        let mut passes: Vec<TollPass> = tables
            .passes
            .iter()
            .map(|pass| tables.joined_pass(pass))
            .collect();
        passes.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(passes)
    }

    fn create_pass(&self, pass: &NewTollPass) -> Result<TollPass> {
        let mut tables = self.tables.lock();
        if !tables
            .categories
            .iter()
            .any(|category| category.id == pass.category_id)
        {
            bail!("insert or update on table \"toll_passes\" violates foreign key constraint");
        }
        let row = TollPass {
            id: tables.id("pass"),
            vehicle_number: pass.vehicle_number.clone(),
            category_id: pass.category_id.clone(),
            valid_from: pass.valid_from,
            valid_until: pass.valid_until,
            status: pass.status,
            created_by: pass.created_by.clone(),
            created_at: Some(tables.stamp()),
            vehicle_categories: None,
        };
        tables.passes.push(row.clone());
        Ok(row)
    }

    fn update_pass(&self, id: &str, pass: &NewTollPass) -> Result<TollPass> {
        let mut tables = self.tables.lock();
        let row = tables
            .passes
            .iter_mut()
            .find(|row| row.id == id)
            .ok_or_else(|| anyhow!("toll pass {} not found", id))?;
        row.vehicle_number = pass.vehicle_number.clone();
        row.category_id = pass.category_id.clone();
        row.valid_from = pass.valid_from;
        row.valid_until = pass.valid_until;
        row.status = pass.status;
        row.created_by = pass.created_by.clone();
        Ok(row.clone())
    }

    fn search_active_passes(&self, fragment: &str) -> Result<Vec<TollPass>> {
        let needle = fragment.to_lowercase();
        let tables = self.tables.lock();
        Ok(tables
            .passes
            .iter()
            .filter(|pass| pass.status == PassStatus::Active)
            .filter(|pass| pass.vehicle_number.to_lowercase().contains(&needle))
            .map(|pass| tables.joined_pass(pass))
            .collect())
    }

    fn count_active_passes(&self) -> Result<usize> {
        Ok(self
            .tables
            .lock()
            .passes
            .iter()
            .filter(|pass| pass.status == PassStatus::Active)
            .count())
    }

    fn generate_receipt_number(&self) -> Result<String> {
        let mut tables = self.tables.lock();
        tables.receipts += 1;
        Ok(format!(
            "RCP-{}-{:06}",
            Utc::now().format("%Y%m%d"),
            tables.receipts
        ))
    }

    fn create_transaction(&self, transaction: &NewTransaction) -> Result<Transaction> {
        let mut tables = self.tables.lock();
        let row = Transaction {
            id: tables.id("txn"),
            pass_id: transaction.pass_id.clone(),
            amount: transaction.amount,
            processed_by: transaction.processed_by.clone(),
            processed_at: tables.stamp(),
            receipt_number: transaction.receipt_number.clone(),
            notes: transaction.notes.clone(),
            toll_passes: None,
        };
        tables.transactions.push(row.clone());
        Ok(row)
    }

    fn list_transactions(&self, filter: &TransactionFilter) -> Result<Vec<Transaction>> {
        let tables = self.tables.lock();
        let mut rows: Vec<Transaction> = tables
            .transactions
            .iter()
            .filter(|t| filter.from.map_or(true, |from| t.processed_at >= from))
            .filter(|t| filter.to.map_or(true, |to| t.processed_at <= to))
            .map(|t| tables.joined_transaction(t))
            .filter(|t| match &filter.vehicle_number {
                Some(vehicle) => t
                    .toll_passes
                    .as_ref()
                    .is_some_and(|pass| &pass.vehicle_number == vehicle),
                None => true,
            })
            .filter(|t| match &filter.category_id {
                Some(category) => t
                    .toll_passes
                    .as_ref()
                    .is_some_and(|pass| pass.category_id.as_ref() == Some(category)),
                None => true,
            })
            .collect();
        rows.sort_by(|a, b| b.processed_at.cmp(&a.processed_at));
        Ok(rows)
    }
}
