//! In-app notifications for the signed-in user.

use std::sync::Arc;

use anyhow::{bail, Result};
use tracing::{debug, info};

use crate::data::{Backend, NotificationService};
use crate::model::{NewNotification, Notification};

/// How many of the latest notifications the inbox holds.
pub const INBOX_LIMIT: usize = 50;

/// Delivers a notification to `draft.user_id`.
pub fn notify(backend: &Backend, draft: NewNotification) -> Result<Notification> {
    let content = draft.content.trim();
    if content.is_empty() {
        bail!("notification content cannot be empty");
    }
    let draft = NewNotification {
        content: content.to_string(),
        ..draft
    };
    let created = backend.notifications.create_notification(&draft)?;
    info!(user_id = %created.user_id, kind = ?created.kind, "notification sent");
    Ok(created)
}

pub struct Inbox {
    service: Arc<dyn NotificationService>,
    user_id: String,
    items: Vec<Notification>,
    unread: usize,
}

impl Inbox {
    pub fn new(backend: &Backend, user_id: impl Into<String>) -> Self {
        Self {
            service: backend.notifications.clone(),
            user_id: user_id.into(),
            items: Vec::new(),
            unread: 0,
        }
    }

    pub fn items(&self) -> &[Notification] {
        &self.items
    }

    /// Unread count as reported by the backend, which may exceed the
    /// number of loaded items.
    pub fn unread(&self) -> usize {
        self.unread
    }

    pub fn refresh(&mut self) -> Result<()> {
        self.items = self.service.notifications(&self.user_id, INBOX_LIMIT)?;
        self.unread = self.service.unread_notifications(&self.user_id)?;
        debug!(loaded = self.items.len(), unread = self.unread, "inbox refreshed");
        Ok(())
    }

    /// Returns false when the notification is unknown or already read.
    pub fn mark_read(&mut self, id: &str) -> Result<bool> {
        let Some(item) = self.items.iter_mut().find(|item| item.id == id) else {
            return Ok(false);
        };
        if item.is_read {
            return Ok(false);
        }
        self.service.mark_notification_read(id)?;
        item.is_read = true;
        self.unread = self.unread.saturating_sub(1);
        Ok(true)
    }

    pub fn mark_all_read(&mut self) -> Result<()> {
        self.service.mark_all_notifications_read(&self.user_id)?;
        for item in &mut self.items {
            item.is_read = true;
        }
        self.unread = 0;
        Ok(())
    }
}
