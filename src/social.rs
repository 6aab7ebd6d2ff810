use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tracing::{debug, info};

use crate::data::{Backend, PostService, SocialService};
use crate::model::{Comment, Follow, NewComment, Post, PostUpdate, Profile, Report};

/// A comment with its replies, oldest first at every level.
#[derive(Debug, Clone, PartialEq)]
pub struct CommentNode {
    pub comment: Comment,
    pub replies: Vec<CommentNode>,
}

/// Likes, comments, follows and reports on top of the data services.
pub struct Social {
    social: Arc<dyn SocialService>,
    posts: Arc<dyn PostService>,
}

impl Social {
    pub fn new(backend: &Backend) -> Self {
        Self {
            social: backend.social.clone(),
            posts: backend.posts.clone(),
        }
    }

    /// Likes or unlikes `post` for `user_id`, keeping the local copy in
    /// step. Returns whether the post is now liked.
    pub fn toggle_like(&self, post: &mut Post, user_id: &str) -> Result<bool> {
        if post.liked_by(user_id) {
            self.social
                .unlike(&post.id, user_id)
                .with_context(|| format!("social: unlike {}", post.id))?;
            post.likes.retain(|like| like.user_id != user_id);
            debug!(post_id = %post.id, "unliked");
            Ok(false)
        } else {
            let like = self
                .social
                .like(&post.id, user_id)
                .with_context(|| format!("social: like {}", post.id))?;
            post.likes.push(like);
            debug!(post_id = %post.id, "liked");
            Ok(true)
        }
    }

    pub fn list_comments(&self, post_id: &str) -> Result<Vec<Comment>> {
        self.social
            .comments(post_id)
            .with_context(|| format!("social: comments for {}", post_id))
    }

    pub fn add_comment(
        &self,
        post_id: &str,
        user_id: &str,
        content: &str,
        parent_id: Option<&str>,
    ) -> Result<Comment> {
        let content = content.trim();
        if content.is_empty() {
            bail!("comment cannot be empty");
        }
        let comment = self.social.add_comment(&NewComment {
            post_id: post_id.to_string(),
            user_id: user_id.to_string(),
            content: content.to_string(),
            parent_id: parent_id.map(str::to_string),
        })?;
        info!(post_id, comment_id = %comment.id, "comment added");
        Ok(comment)
    }

    pub fn edit_comment(&self, id: &str, content: &str) -> Result<()> {
        let content = content.trim();
        if content.is_empty() {
            bail!("comment cannot be empty");
        }
        self.social
            .edit_comment(id, content, Utc::now())
            .with_context(|| format!("social: edit comment {}", id))
    }

    pub fn delete_comment(&self, id: &str) -> Result<()> {
        self.social
            .delete_comment(id)
            .with_context(|| format!("social: delete comment {}", id))
    }

    pub fn follow(&self, follower_id: &str, target_id: &str) -> Result<()> {
        if follower_id == target_id {
            bail!("you cannot follow yourself");
        }
        self.social.follow(follower_id, target_id)?;
        info!(follower_id, target_id, "followed");
        Ok(())
    }

    pub fn unfollow(&self, follower_id: &str, target_id: &str) -> Result<()> {
        self.social.unfollow(follower_id, target_id)
    }

    pub fn following(&self, user_id: &str, limit: Option<usize>) -> Result<Vec<Follow>> {
        self.social.following(user_id, limit)
    }

    /// Profiles the user does not follow yet, never the user themselves.
    pub fn follow_suggestions(&self, user_id: &str, limit: usize) -> Result<Vec<Profile>> {
        let mut exclude = vec![user_id.to_string()];
        exclude.extend(
            self.social
                .following(user_id, None)?
                .into_iter()
                .map(|follow| follow.following_id),
        );
        self.social
            .profiles_excluding(&exclude, limit)
            .context("social: follow suggestions")
    }

    pub fn report_post(&self, post_id: &str, user_id: &str, reason: &str) -> Result<()> {
        let reason = reason.trim();
        if reason.is_empty() {
            bail!("give a reason for the report");
        }
        self.social.report(&Report {
            content_type: "post".into(),
            content_id: post_id.to_string(),
            reason: reason.to_string(),
            reported_by: user_id.to_string(),
            status: "pending".into(),
        })?;
        info!(post_id, "post reported");
        Ok(())
    }

    /// Saves new content and returns the refreshed post for the feed.
    pub fn edit_post(&self, id: &str, content: &str, anonymous: bool) -> Result<Option<Post>> {
        self.posts
            .update_post(
                id,
                &PostUpdate {
                    content: content.trim().to_string(),
                    is_anonymous: anonymous,
                },
            )
            .with_context(|| format!("social: edit post {}", id))?;
        self.posts.fetch_post(id)
    }

    pub fn delete_post(&self, id: &str) -> Result<()> {
        self.posts
            .delete_post(id)
            .with_context(|| format!("social: delete post {}", id))
    }
}

/// Nests replies under their parents. Replies whose parent is missing are
/// kept as roots.
pub fn comment_thread(comments: &[Comment]) -> Vec<CommentNode> {
    let mut ordered: Vec<&Comment> = comments.iter().collect();
    ordered.sort_by(|a, b| a.created_at.cmp(&b.created_at));

    let known: HashSet<&str> = ordered.iter().map(|comment| comment.id.as_str()).collect();
    let mut children: HashMap<&str, Vec<&Comment>> = HashMap::new();
    let mut roots = Vec::new();
    for comment in ordered {
        match comment.parent_id.as_deref() {
            Some(parent) if known.contains(parent) && parent != comment.id => {
                children.entry(parent).or_default().push(comment)
            }
            _ => roots.push(comment),
        }
    }

    fn build<'a>(
        comment: &'a Comment,
        children: &HashMap<&'a str, Vec<&'a Comment>>,
    ) -> CommentNode {
        let replies = children
            .get(comment.id.as_str())
            .map(|replies| replies.iter().map(|reply| build(reply, children)).collect())
            .unwrap_or_default();
        CommentNode {
            comment: comment.clone(),
            replies,
        }
    }

    roots.into_iter().map(|root| build(root, &children)).collect()
}
