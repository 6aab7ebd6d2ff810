use anyhow::Result;
use tracing::{debug, info, warn};

use crate::config::UploadConfig;
use crate::data::Backend;
use crate::model::{Identity, MediaKind, NewMediaFile, NewPost, Profile};
use crate::uploads::{AcceptReport, CropQueue, IncomingFile, PendingMedia};

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("write something or attach media before posting")]
    Empty,
    #[error("crop every image before posting")]
    CropPending,
    #[error("a post is already being submitted")]
    InFlight,
    #[error("sign in to post")]
    NotAuthenticated,
    #[error("failed to create post: {0:#}")]
    CreatePost(#[source] anyhow::Error),
    #[error("post {post_id} was created but only {uploaded} media file(s) were attached: {source:#}")]
    PartialUpload {
        post_id: String,
        uploaded: usize,
        #[source]
        source: anyhow::Error,
    },
}

/// Draft post: text, anonymity flag and pending media.
pub struct Composer {
    backend: Backend,
    text: String,
    anonymous: bool,
    queue: CropQueue,
    submitting: bool,
}

impl Composer {
    pub fn new(backend: Backend, limits: UploadConfig) -> Result<Self> {
        Ok(Self {
            backend,
            text: String::new(),
            anonymous: false,
            queue: CropQueue::new(limits)?,
            submitting: false,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn set_text(&mut self, text: impl Into<String>) {
        self.text = text.into();
    }

    pub fn is_anonymous(&self) -> bool {
        self.anonymous
    }

    pub fn set_anonymous(&mut self, anonymous: bool) {
        self.anonymous = anonymous;
    }

    pub fn is_submitting(&self) -> bool {
        self.submitting
    }

    pub fn queue(&self) -> &CropQueue {
        &self.queue
    }

    pub fn queue_mut(&mut self) -> &mut CropQueue {
        &mut self.queue
    }

    pub fn attach(&mut self, files: Vec<IncomingFile>) -> Result<AcceptReport> {
        self.queue.accept(files)
    }

    pub fn can_submit(&self) -> bool {
        self.gate().is_ok()
    }

    /// Creates the post, then uploads each pending item in order.
    /// Returns the new post id; the draft is cleared only on full success.
    pub fn submit(&mut self) -> Result<String, SubmitError> {
        let submission = self.begin_submit()?;
        let result = submission.run();
        self.finish_submit(result)
    }

    /// Closes the gate and snapshots the draft. Until
    /// [`Composer::finish_submit`] is called, further attempts fail with
    /// [`SubmitError::InFlight`].
    pub fn begin_submit(&mut self) -> Result<Submission, SubmitError> {
        self.gate()?;
        self.submitting = true;
        Ok(Submission {
            backend: self.backend.clone(),
            content: self.text.trim().to_string(),
            anonymous: self.anonymous,
            media: self.queue.items().iter().map(Upload::from).collect(),
        })
    }

    /// Reopens the gate; a successful result also clears the draft.
    pub fn finish_submit(
        &mut self,
        result: Result<String, SubmitError>,
    ) -> Result<String, SubmitError> {
        self.submitting = false;
        let post_id = result?;
        self.text.clear();
        self.anonymous = false;
        self.queue.clear();
        info!(%post_id, "post published");
        Ok(post_id)
    }

    fn gate(&self) -> Result<(), SubmitError> {
        if self.submitting {
            return Err(SubmitError::InFlight);
        }
        if self.text.trim().is_empty() && self.queue.is_empty() {
            return Err(SubmitError::Empty);
        }
        if !self.queue.all_eligible() {
            return Err(SubmitError::CropPending);
        }
        Ok(())
    }
}

struct Upload {
    kind: MediaKind,
    mime: String,
    extension: String,
    bytes: Vec<u8>,
}

impl From<&PendingMedia> for Upload {
    fn from(item: &PendingMedia) -> Self {
        Self {
            kind: item.kind(),
            mime: item.mime().to_string(),
            extension: item.extension(),
            bytes: item.bytes().to_vec(),
        }
    }
}

/// A draft taken out of the composer for publishing. Owns its data so it
/// can run away from the composer, e.g. on a worker thread.
pub struct Submission {
    backend: Backend,
    content: String,
    anonymous: bool,
    media: Vec<Upload>,
}

impl Submission {
    pub fn run(self) -> Result<String, SubmitError> {
        let user = self
            .backend
            .auth
            .current_user()
            .map_err(SubmitError::CreatePost)?
            .ok_or(SubmitError::NotAuthenticated)?;
        self.ensure_profile(&user).map_err(SubmitError::CreatePost)?;

        let post = self
            .backend
            .posts
            .create_post(&NewPost {
                user_id: user.id.clone(),
                content: self.content.clone(),
                is_anonymous: self.anonymous,
            })
            .map_err(SubmitError::CreatePost)?;
        debug!(post_id = %post.id, media = self.media.len(), "post row created");

        for (uploaded, item) in self.media.iter().enumerate() {
            if let Err(source) = self.attach_media(&user, &post.id, item) {
                warn!(post_id = %post.id, uploaded, "media upload failed: {:#}", source);
                return Err(SubmitError::PartialUpload {
                    post_id: post.id,
                    uploaded,
                    source,
                });
            }
        }
        Ok(post.id)
    }

    fn ensure_profile(&self, user: &Identity) -> Result<()> {
        if self.backend.social.profile(&user.id)?.is_none() {
            self.backend
                .social
                .create_profile(&Profile::placeholder(user))?;
            info!(user_id = %user.id, "placeholder profile created");
        }
        Ok(())
    }

    fn attach_media(&self, user: &Identity, post_id: &str, item: &Upload) -> Result<()> {
        let key = storage_key(&user.id, post_id, &item.extension);
        self.backend
            .storage
            .upload(&key, item.bytes.clone(), &item.mime)?;
        self.backend.posts.insert_media(&NewMediaFile {
            post_id: post_id.to_string(),
            user_id: user.id.clone(),
            file_path: key,
            file_type: item.kind,
        })?;
        Ok(())
    }
}

/// `{user}/{post}/{token}.{ext}` with a 16-byte random hex token.
pub fn storage_key(user_id: &str, post_id: &str, extension: &str) -> String {
    let token: [u8; 16] = rand::random();
    format!("{}/{}/{}.{}", user_id, post_id, hex::encode(token), extension)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::memory::MemoryBackend;

    fn composer() -> (Arc<MemoryBackend>, Composer) {
        let memory = Arc::new(MemoryBackend::new());
        let composer =
            Composer::new(Backend::from_shared(memory.clone()), UploadConfig::default()).unwrap();
        (memory, composer)
    }

    fn video(name: &str) -> IncomingFile {
        IncomingFile::new(name, "video/mp4", b"\0\0\0\x18ftypmp42".to_vec())
    }

    #[test]
    fn storage_key_layout() {
        let key = storage_key("u1", "p1", "jpg");
        let parts: Vec<_> = key.split('/').collect();
        assert_eq!(parts[0], "u1");
        assert_eq!(parts[1], "p1");
        let (token, ext) = parts[2].split_once('.').unwrap();
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(ext, "jpg");
    }

    #[test]
    fn blank_draft_cannot_submit() {
        let (_memory, mut composer) = composer();
        composer.set_text("   ");
        assert!(!composer.can_submit());
        assert!(matches!(composer.submit(), Err(SubmitError::Empty)));
    }

    #[test]
    fn uncropped_image_blocks_submit() {
        let (memory, mut composer) = composer();
        memory.sign_in("u1", "ana@example.com");
        composer
            .attach(vec![IncomingFile::new("a.png", "image/png", vec![1, 2, 3])])
            .unwrap();
        composer.set_text("look");
        assert!(matches!(composer.submit(), Err(SubmitError::CropPending)));
        assert_eq!(memory.post_count(), 0);
    }

    #[test]
    fn signed_out_user_is_rejected() {
        let (_memory, mut composer) = composer();
        composer.set_text("hello");
        assert!(matches!(
            composer.submit(),
            Err(SubmitError::NotAuthenticated)
        ));
        assert_eq!(composer.text(), "hello");
    }

    #[test]
    fn creates_placeholder_profile_and_clears_draft() {
        let (memory, mut composer) = composer();
        memory.sign_in("u1", "ana@example.com");
        composer.set_text("  hi there ");
        composer.set_anonymous(true);
        composer.attach(vec![video("clip.mp4")]).unwrap();
        let post_id = composer.submit().unwrap();

        let profile = crate::data::SocialService::profile(memory.as_ref(), "u1")
            .unwrap()
            .unwrap();
        assert_eq!(profile.username.as_deref(), Some("ana"));
        assert_eq!(profile.full_name.as_deref(), Some("User"));

        let rows = memory.media_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].file_type, MediaKind::Video);
        assert!(rows[0].file_path.starts_with(&format!("u1/{}/", post_id)));
        assert!(rows[0].file_path.ends_with(".mp4"));
        let stored = memory.object(&rows[0].file_path).unwrap();
        assert_eq!(stored.content_type, "video/mp4");

        assert!(composer.text().is_empty());
        assert!(!composer.is_anonymous());
        assert!(composer.queue().is_empty());
        assert_eq!(composer.queue().live_object_urls(), 0);
    }

    #[test]
    fn failed_upload_keeps_post_and_stops() {
        let (memory, mut composer) = composer();
        memory.sign_in("u1", "ana@example.com");
        composer
            .attach(vec![video("a.mp4"), video("b.mp4"), video("c.mp4")])
            .unwrap();
        memory.fail_upload_after(1);
        match composer.submit() {
            Err(SubmitError::PartialUpload {
                post_id, uploaded, ..
            }) => {
                assert_eq!(uploaded, 1);
                assert!(post_id.starts_with("post-"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(memory.post_count(), 1);
        assert_eq!(memory.media_rows().len(), 1);
        assert_eq!(composer.queue().len(), 3);
        assert!(!composer.is_submitting());
    }

    #[test]
    fn second_submit_is_refused_while_first_is_running() {
        let (memory, mut composer) = composer();
        memory.sign_in("u1", "ana@example.com");
        composer.set_text("once");
        let submission = composer.begin_submit().unwrap();
        assert!(composer.is_submitting());
        assert!(!composer.can_submit());
        assert!(matches!(composer.submit(), Err(SubmitError::InFlight)));
        assert_eq!(memory.post_count(), 0);

        let result = submission.run();
        let post_id = composer.finish_submit(result).unwrap();
        assert!(post_id.starts_with("post-"));
        assert_eq!(memory.post_count(), 1);
        assert!(!composer.is_submitting());
        assert!(composer.text().is_empty());
    }

    #[test]
    fn failed_submission_reopens_gate() {
        let (_memory, mut composer) = composer();
        composer.set_text("draft");
        let submission = composer.begin_submit().unwrap();
        let result = submission.run();
        assert!(matches!(
            composer.finish_submit(result),
            Err(SubmitError::NotAuthenticated)
        ));
        assert!(composer.can_submit());
        assert_eq!(composer.text(), "draft");
    }
}
