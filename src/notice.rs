use std::collections::VecDeque;
use std::fmt::Display;
use std::time::{Duration, Instant};

use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    Success,
    Error,
}

#[derive(Debug, Clone)]
pub struct Notice {
    pub kind: NoticeKind,
    pub message: String,
    pub raised_at: Instant,
}

/// Transient messages shown to the user, each visible for `ttl`.
#[derive(Debug)]
pub struct NoticeBoard {
    ttl: Duration,
    notices: VecDeque<Notice>,
}

impl NoticeBoard {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            notices: VecDeque::new(),
        }
    }

    pub fn success(&mut self, message: impl Into<String>) {
        self.push(NoticeKind::Success, message.into(), Instant::now());
    }

    pub fn error(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!(%message, "surfacing error");
        self.push(NoticeKind::Error, message, Instant::now());
    }

    /// Unwraps `result`, turning an error into an error notice.
    pub fn report<T, E: Display>(&mut self, result: Result<T, E>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                self.error(err.to_string());
                None
            }
        }
    }

    pub fn visible(&mut self, now: Instant) -> Vec<&Notice> {
        self.prune(now);
        self.notices.iter().collect()
    }

    pub fn latest(&self) -> Option<&Notice> {
        self.notices.back()
    }

    pub fn len(&self) -> usize {
        self.notices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notices.is_empty()
    }

    fn push(&mut self, kind: NoticeKind, message: String, now: Instant) {
        self.prune(now);
        self.notices.push_back(Notice {
            kind,
            message,
            raised_at: now,
        });
    }

    fn prune(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.notices
            .retain(|notice| now.saturating_duration_since(notice.raised_at) < ttl);
    }
}
