//! Infinite-scroll feed: fixed-size pages, appended as the end of the
//! list comes into view, with new posts prepended without a refetch.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::data::{Backend, PostService, StorageService};
use crate::model::Post;

/// Memoizing storage-path to public-URL resolver.
pub struct MediaUrls {
    storage: Arc<dyn StorageService>,
    cache: Mutex<HashMap<String, String>>,
}

impl MediaUrls {
    pub fn new(storage: Arc<dyn StorageService>) -> Self {
        Self {
            storage,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn resolve(&self, path: &str) -> String {
        let mut cache = self.cache.lock();
        if let Some(url) = cache.get(path) {
            return url.clone();
        }
        let url = self.storage.public_url(path);
        cache.insert(path.to_string(), url.clone());
        url
    }

    pub fn resolve_post(&self, post: &mut Post) {
        for media in &mut post.media_files {
            media.url = Some(self.resolve(&media.file_path));
        }
    }

    pub fn clear(&self) {
        self.cache.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct FeedPager {
    posts: Arc<dyn PostService>,
    urls: MediaUrls,
    page_size: usize,
    items: Vec<Post>,
    page: usize,
    has_more: bool,
    loading: bool,
}

impl FeedPager {
    pub fn new(backend: &Backend, page_size: usize) -> Self {
        Self {
            posts: backend.posts.clone(),
            urls: MediaUrls::new(backend.storage.clone()),
            page_size: page_size.max(1),
            items: Vec::new(),
            page: 0,
            has_more: true,
            loading: false,
        }
    }

    pub fn items(&self) -> &[Post] {
        &self.items
    }

    pub fn get(&self, id: &str) -> Option<&Post> {
        self.items.iter().find(|post| post.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Post> {
        self.items.iter_mut().find(|post| post.id == id)
    }

    pub fn page(&self) -> usize {
        self.page
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn media_urls(&self) -> &MediaUrls {
        &self.urls
    }

    /// Replaces the list with the first page.
    pub fn load_initial(&mut self) -> Result<usize> {
        self.loading = true;
        let result = self.fetch_page(0);
        self.loading = false;
        let rows = result?;
        let count = rows.len();
        self.items = rows;
        self.page = 1;
        self.has_more = count == self.page_size;
        info!(posts = count, has_more = self.has_more, "feed loaded");
        Ok(count)
    }

    /// Loads the next page when the end-of-list sentinel becomes visible.
    /// Returns how many posts were appended.
    pub fn sentinel_visible(&mut self, visible: bool) -> Result<usize> {
        if !visible || !self.has_more || self.loading {
            return Ok(0);
        }
        self.loading = true;
        let result = self.fetch_page(self.page);
        self.loading = false;
        let rows = result?;
        let count = rows.len();
        self.items.extend(rows);
        self.page += 1;
        if count < self.page_size {
            self.has_more = false;
        }
        debug!(page = self.page, appended = count, "feed page appended");
        Ok(count)
    }

    /// Prepends a freshly created post, leaving loaded pages untouched.
    pub fn post_created(&mut self, id: &str) -> Result<bool> {
        let Some(mut post) = self
            .posts
            .fetch_post(id)
            .with_context(|| format!("feed: fetch post {}", id))?
        else {
            return Ok(false);
        };
        self.urls.resolve_post(&mut post);
        self.items.insert(0, post);
        Ok(true)
    }

    pub fn post_deleted(&mut self, id: &str) -> bool {
        let before = self.items.len();
        self.items.retain(|post| post.id != id);
        self.items.len() != before
    }

    pub fn post_updated(&mut self, mut post: Post) -> bool {
        self.urls.resolve_post(&mut post);
        match self.items.iter_mut().find(|existing| existing.id == post.id) {
            Some(existing) => {
                *existing = post;
                true
            }
            None => false,
        }
    }

    pub fn refresh(&mut self) -> Result<usize> {
        self.load_initial()
    }

    pub fn clear_media_cache(&self) {
        self.urls.clear();
    }

    fn fetch_page(&self, page: usize) -> Result<Vec<Post>> {
        let from = page * self.page_size;
        let to = from + self.page_size - 1;
        let mut rows = self
            .posts
            .list_posts(from, to)
            .with_context(|| format!("feed: load posts {}-{}", from, to))?;
        for post in &mut rows {
            self.urls.resolve_post(post);
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::memory::MemoryBackend;
    use crate::model::{MediaKind, NewMediaFile, NewPost};

    fn seeded(count: usize) -> (Arc<MemoryBackend>, Backend) {
        let memory = Arc::new(MemoryBackend::new());
        for i in 0..count {
            memory
                .create_post(&NewPost {
                    user_id: "u1".into(),
                    content: format!("post {}", i),
                    is_anonymous: false,
                })
                .unwrap();
        }
        let backend = Backend::from_shared(memory.clone());
        (memory, backend)
    }

    #[test]
    fn pages_are_consecutive_and_descending() {
        let (_memory, backend) = seeded(25);
        let mut pager = FeedPager::new(&backend, 10);
        assert_eq!(pager.load_initial().unwrap(), 10);
        assert!(pager.has_more());
        assert_eq!(pager.items()[0].content, "post 24");
        assert_eq!(pager.sentinel_visible(true).unwrap(), 10);
        assert_eq!(pager.items()[10].content, "post 14");
        assert_eq!(pager.sentinel_visible(true).unwrap(), 5);
        assert!(!pager.has_more());
        assert_eq!(pager.page(), 3);
        assert_eq!(pager.sentinel_visible(true).unwrap(), 0);
        assert_eq!(pager.items().len(), 25);
        assert!(pager
            .items()
            .windows(2)
            .all(|pair| pair[0].created_at > pair[1].created_at));
    }

    #[test]
    fn hidden_sentinel_loads_nothing() {
        let (_memory, backend) = seeded(15);
        let mut pager = FeedPager::new(&backend, 10);
        pager.load_initial().unwrap();
        assert_eq!(pager.sentinel_visible(false).unwrap(), 0);
        assert_eq!(pager.page(), 1);
    }

    #[test]
    fn short_first_page_ends_the_feed() {
        let (_memory, backend) = seeded(3);
        let mut pager = FeedPager::new(&backend, 10);
        assert_eq!(pager.load_initial().unwrap(), 3);
        assert!(!pager.has_more());
    }

    #[test]
    fn prepend_keeps_loaded_order() {
        let (memory, backend) = seeded(12);
        let mut pager = FeedPager::new(&backend, 10);
        pager.load_initial().unwrap();
        pager.sentinel_visible(true).unwrap();
        let before: Vec<String> = pager.items().iter().map(|p| p.id.clone()).collect();

        let post = memory
            .create_post(&NewPost {
                user_id: "u1".into(),
                content: "fresh".into(),
                is_anonymous: false,
            })
            .unwrap();
        assert!(pager.post_created(&post.id).unwrap());
        assert_eq!(pager.items()[0].content, "fresh");
        let after: Vec<String> = pager.items()[1..].iter().map(|p| p.id.clone()).collect();
        assert_eq!(before, after);
        assert_eq!(pager.page(), 2);
    }

    #[test]
    fn delete_and_refresh() {
        let (_memory, backend) = seeded(4);
        let mut pager = FeedPager::new(&backend, 10);
        pager.load_initial().unwrap();
        let id = pager.items()[1].id.clone();
        assert!(pager.post_deleted(&id));
        assert!(!pager.post_deleted(&id));
        assert_eq!(pager.items().len(), 3);
        assert_eq!(pager.refresh().unwrap(), 4);
    }

    struct CountingStorage {
        calls: AtomicUsize,
    }

    impl StorageService for CountingStorage {
        fn upload(&self, _key: &str, _bytes: Vec<u8>, _content_type: &str) -> Result<()> {
            Ok(())
        }

        fn public_url(&self, key: &str) -> String {
            self.calls.fetch_add(1, Ordering::SeqCst);
            format!("https://cdn.test/{}", key)
        }

        fn upload_to(
            &self,
            _bucket: &str,
            _key: &str,
            _bytes: Vec<u8>,
            _content_type: &str,
            _upsert: bool,
        ) -> Result<()> {
            Ok(())
        }

        fn public_url_in(&self, bucket: &str, key: &str) -> String {
            format!("https://cdn.test/{}/{}", bucket, key)
        }
    }

    #[test]
    fn media_urls_are_memoized() {
        let storage = Arc::new(CountingStorage {
            calls: AtomicUsize::new(0),
        });
        let urls = MediaUrls::new(storage.clone());
        assert_eq!(urls.resolve("u1/p1/a.jpg"), "https://cdn.test/u1/p1/a.jpg");
        urls.resolve("u1/p1/a.jpg");
        assert_eq!(storage.calls.load(Ordering::SeqCst), 1);
        urls.clear();
        assert!(urls.is_empty());
        urls.resolve("u1/p1/a.jpg");
        assert_eq!(storage.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn loaded_media_carries_public_url() {
        let (memory, backend) = seeded(1);
        let post_id = memory.list_posts(0, 0).unwrap()[0].id.clone();
        memory
            .insert_media(&NewMediaFile {
                post_id,
                user_id: "u1".into(),
                file_path: "u1/x/photo.jpg".into(),
                file_type: MediaKind::Image,
            })
            .unwrap();
        let mut pager = FeedPager::new(&backend, 10);
        pager.load_initial().unwrap();
        let media = &pager.items()[0].media_files[0];
        assert_eq!(
            media.url.as_deref(),
            Some("memory://post-media/u1/x/photo.jpg")
        );
        assert_eq!(pager.media_urls().len(), 1);
    }
}
