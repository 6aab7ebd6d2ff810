//! Pending media for the post composer.
//!
//! Files go through [`CropQueue::accept`]; images then wait for a crop
//! while videos are immediately ready. At most one image is the crop
//! target at a time, and every item carries its own crop state under a
//! stable [`MediaId`].

use std::fmt;
use std::path::Path;

use anyhow::Result;
use tracing::{debug, info};

use crate::config::UploadConfig;
use crate::crop::{self, CropError, CropRect, PixelRect, Rotation, ZOOM_STEP};
use crate::model::MediaKind;
use crate::preview::{self, ObjectUrls, Preview};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaId(String);

impl MediaId {
    fn generate() -> Self {
        let token: [u8; 6] = rand::random();
        Self(hex::encode(token))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MediaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A dropped or selected file, before filtering.
#[derive(Debug, Clone)]
pub struct IncomingFile {
    pub name: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

impl IncomingFile {
    pub fn new(name: impl Into<String>, mime: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime: mime.into(),
            bytes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    Unprocessed,
    Cropping,
    Cropped,
    Ready,
}

#[derive(Debug)]
pub struct PendingMedia {
    id: MediaId,
    name: String,
    mime: String,
    kind: MediaKind,
    bytes: Vec<u8>,
    preview: Preview,
    crop: Option<CropRect>,
    completed: Option<PixelRect>,
    zoom: f32,
    rotation: Rotation,
    rendered: Option<(u32, u32)>,
    state: ItemState,
}

impl PendingMedia {
    pub fn id(&self) -> &MediaId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mime(&self) -> &str {
        &self.mime
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn preview(&self) -> &Preview {
        &self.preview
    }

    pub fn crop(&self) -> Option<CropRect> {
        self.crop
    }

    pub fn completed_crop(&self) -> Option<PixelRect> {
        self.completed
    }

    pub fn zoom(&self) -> f32 {
        self.zoom
    }

    pub fn rotation(&self) -> Rotation {
        self.rotation
    }

    pub fn state(&self) -> ItemState {
        self.state
    }

    /// Cropped images and videos may be submitted.
    pub fn is_eligible(&self) -> bool {
        matches!(self.state, ItemState::Cropped | ItemState::Ready)
    }

    pub fn needs_crop(&self) -> bool {
        self.kind == MediaKind::Image && self.state != ItemState::Cropped
    }

    /// File extension used for the storage key.
    pub fn extension(&self) -> String {
        extension_for(&self.name, &self.mime)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcceptReport {
    pub accepted: Vec<MediaId>,
    pub unsupported: usize,
    pub oversized: usize,
    pub over_limit: usize,
    /// Crop target after the batch was taken in.
    pub cropping: Option<MediaId>,
}

impl AcceptReport {
    pub fn rejected(&self) -> usize {
        self.unsupported + self.oversized + self.over_limit
    }
}

pub struct CropQueue {
    items: Vec<PendingMedia>,
    active: Option<MediaId>,
    limits: UploadConfig,
    urls: ObjectUrls,
}

impl CropQueue {
    pub fn new(limits: UploadConfig) -> Result<Self> {
        Ok(Self {
            items: Vec::new(),
            active: None,
            limits,
            urls: ObjectUrls::new()?,
        })
    }

    pub fn accept(&mut self, files: Vec<IncomingFile>) -> Result<AcceptReport> {
        let mut report = AcceptReport::default();
        let mut first_image: Option<MediaId> = None;

        for file in files {
            let mime = if file.mime.trim().is_empty() {
                tree_magic_mini::from_u8(&file.bytes).to_string()
            } else {
                file.mime.trim().to_ascii_lowercase()
            };
            let Some(kind) = classify(&mime) else {
                report.unsupported += 1;
                continue;
            };
            if file.bytes.len() as u64 > self.limits.max_file_bytes {
                report.oversized += 1;
                continue;
            }
            if self.items.len() >= self.limits.max_files {
                report.over_limit += 1;
                continue;
            }

            let (preview, state) = match kind {
                MediaKind::Image => (
                    Preview::DataUri(preview::data_uri(&mime, &file.bytes)),
                    ItemState::Unprocessed,
                ),
                MediaKind::Video => {
                    let object = self
                        .urls
                        .create(&file.bytes, &extension_for(&file.name, &mime))?;
                    (Preview::ObjectUrl(object), ItemState::Ready)
                }
            };
            let id = MediaId::generate();
            if kind == MediaKind::Image && first_image.is_none() {
                first_image = Some(id.clone());
            }
            report.accepted.push(id.clone());
            self.items.push(PendingMedia {
                id,
                name: file.name,
                mime,
                kind,
                bytes: file.bytes,
                preview,
                crop: None,
                completed: None,
                zoom: 1.0,
                rotation: Rotation::Upright,
                rendered: None,
                state,
            });
        }

        if self.active.is_none() {
            if let Some(id) = first_image {
                self.activate(&id);
            }
        }
        report.cropping = self.active.clone();
        info!(
            accepted = report.accepted.len(),
            rejected = report.rejected(),
            "media batch accepted"
        );
        Ok(report)
    }

    pub fn items(&self) -> &[PendingMedia] {
        &self.items
    }

    pub fn get(&self, id: &MediaId) -> Option<&PendingMedia> {
        self.items.iter().find(|item| &item.id == id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn all_eligible(&self) -> bool {
        self.items.iter().all(PendingMedia::is_eligible)
    }

    pub fn is_modal_open(&self) -> bool {
        self.active.is_some()
    }

    pub fn active(&self) -> Option<&PendingMedia> {
        let id = self.active.as_ref()?;
        self.get(id)
    }

    /// Sets up the default selection once the active image is on screen.
    pub fn image_loaded(
        &mut self,
        rendered_width: u32,
        rendered_height: u32,
    ) -> Result<CropRect, CropError> {
        let aspect = self.limits.aspect_ratio;
        let item = self.active_mut()?;
        let rect = CropRect::centered(rendered_width, rendered_height, aspect);
        item.rendered = Some((rendered_width, rendered_height));
        item.crop = Some(rect);
        item.completed = None;
        Ok(rect)
    }

    pub fn set_crop(&mut self, rect: CropRect) -> Result<CropRect, CropError> {
        let aspect = self.limits.aspect_ratio;
        let item = self.active_mut()?;
        let (width, height) = item.rendered.ok_or(CropError::CropIncomplete)?;
        let fixed = rect.constrained(width, height, aspect);
        item.crop = Some(fixed);
        Ok(fixed)
    }

    /// Commits the current selection, as when the user releases a drag.
    pub fn finalize_crop(&mut self) -> Result<PixelRect, CropError> {
        let item = self.active_mut()?;
        let (width, height) = item.rendered.ok_or(CropError::CropIncomplete)?;
        let rect = item.crop.ok_or(CropError::CropIncomplete)?;
        let pixels = rect.to_pixels(width, height);
        if pixels.is_empty() {
            return Err(CropError::CropIncomplete);
        }
        item.completed = Some(pixels);
        Ok(pixels)
    }

    /// Records a finished selection, held to the configured aspect ratio.
    pub fn complete_crop(&mut self, rect: PixelRect) -> Result<(), CropError> {
        let aspect = self.limits.aspect_ratio;
        let item = self.active_mut()?;
        let rect = match item.rendered {
            Some((width, height)) => CropRect::from(rect)
                .constrained(width, height, aspect)
                .to_pixels(width, height),
            None => rect,
        };
        if rect.is_empty() {
            return Err(CropError::CropIncomplete);
        }
        item.completed = Some(rect);
        Ok(())
    }

    pub fn set_zoom(&mut self, zoom: f32) -> Result<f32, CropError> {
        let item = self.active_mut()?;
        item.zoom = crop::clamp_zoom(zoom);
        Ok(item.zoom)
    }

    pub fn zoom_in(&mut self) -> Result<f32, CropError> {
        let current = self.active().ok_or(CropError::NoActiveItem)?.zoom;
        self.set_zoom(current + ZOOM_STEP)
    }

    pub fn zoom_out(&mut self) -> Result<f32, CropError> {
        let current = self.active().ok_or(CropError::NoActiveItem)?.zoom;
        self.set_zoom(current - ZOOM_STEP)
    }

    /// Turns the active image a quarter clockwise. The rendered frame
    /// swaps axes, so the selection goes back to the default and has to be
    /// finalized again.
    pub fn rotate(&mut self) -> Result<Rotation, CropError> {
        let aspect = self.limits.aspect_ratio;
        let item = self.active_mut()?;
        item.rotation = item.rotation.turned();
        item.completed = None;
        if let Some((width, height)) = item.rendered {
            item.rendered = Some((height, width));
            item.crop = Some(CropRect::centered(height, width, aspect));
        }
        debug!(id = %item.id, degrees = item.rotation.degrees(), "image rotated");
        Ok(item.rotation)
    }

    /// Moves to the next image still waiting for a crop.
    pub fn next(&mut self) -> bool {
        let Some(current) = self.active_index() else {
            return false;
        };
        let target = self.items[current + 1..]
            .iter()
            .find(|item| item.needs_crop())
            .map(|item| item.id.clone());
        match target {
            Some(id) => {
                self.activate(&id);
                true
            }
            None => false,
        }
    }

    /// Moves to the previous image still waiting for a crop.
    pub fn previous(&mut self) -> bool {
        let Some(current) = self.active_index() else {
            return false;
        };
        let target = self.items[..current]
            .iter()
            .rev()
            .find(|item| item.needs_crop())
            .map(|item| item.id.clone());
        match target {
            Some(id) => {
                self.activate(&id);
                true
            }
            None => false,
        }
    }

    /// Replaces the active image with its cropped export and advances to
    /// the next image needing a crop. Returns the new target, `None` once
    /// every image is cropped and the modal has closed.
    pub fn apply_crop(&mut self) -> Result<Option<MediaId>, CropError> {
        let index = self.active_index().ok_or(CropError::NoActiveItem)?;
        let quality = self.limits.jpeg_quality;
        let (rect, rendered, rotation) = {
            let item = &self.items[index];
            let rect = item.completed.ok_or(CropError::CropIncomplete)?;
            let rendered = item.rendered.ok_or(CropError::CropIncomplete)?;
            (rect, rendered, item.rotation)
        };
        let bytes = crop::export(&self.items[index].bytes, rect, rendered, rotation, quality)?;

        let item = &mut self.items[index];
        if let Some(object) = item.preview.object_url() {
            self.urls.revoke(object);
        }
        item.preview = Preview::DataUri(preview::data_uri("image/jpeg", &bytes));
        item.bytes = bytes;
        item.mime = "image/jpeg".into();
        item.name = with_extension(&item.name, "jpg");
        item.rotation = Rotation::Upright;
        item.state = ItemState::Cropped;
        debug!(id = %item.id, width = rect.width, height = rect.height, "crop applied");

        self.active = None;
        let next = self.find_uncropped(index + 1);
        if let Some(id) = &next {
            self.activate(id);
        }
        Ok(next)
    }

    /// Closes the modal; the image stays uncropped and blocks submission.
    pub fn cancel_crop(&mut self) {
        if let Some(index) = self.active_index() {
            self.items[index].state = ItemState::Unprocessed;
        }
        self.active = None;
    }

    pub fn reopen(&mut self) -> Option<MediaId> {
        if self.active.is_none() {
            if let Some(id) = self.find_uncropped(0) {
                self.activate(&id);
            }
        }
        self.active.clone()
    }

    /// Drops an item and releases its preview. Other items are untouched.
    pub fn remove(&mut self, id: &MediaId) -> bool {
        let Some(index) = self.items.iter().position(|item| &item.id == id) else {
            return false;
        };
        let item = self.items.remove(index);
        if let Some(object) = item.preview.object_url() {
            self.urls.revoke(object);
        }
        if self.active.as_ref() == Some(id) {
            self.active = None;
            if let Some(next) = self.find_uncropped(index) {
                self.activate(&next);
            }
        }
        debug!(%id, "pending media removed");
        true
    }

    pub fn clear(&mut self) {
        for item in self.items.drain(..) {
            if let Some(object) = item.preview.object_url() {
                self.urls.revoke(object);
            }
        }
        self.active = None;
    }

    pub fn live_object_urls(&self) -> usize {
        self.urls.live_count()
    }

    pub fn is_object_url_live(&self, preview: &Preview) -> bool {
        preview
            .object_url()
            .is_some_and(|object| self.urls.is_live(object))
    }

    fn active_index(&self) -> Option<usize> {
        let id = self.active.as_ref()?;
        self.items.iter().position(|item| &item.id == id)
    }

    fn active_mut(&mut self) -> Result<&mut PendingMedia, CropError> {
        let index = self.active_index().ok_or(CropError::NoActiveItem)?;
        Ok(&mut self.items[index])
    }

    fn activate(&mut self, id: &MediaId) {
        if let Some(index) = self.active_index() {
            if self.items[index].state == ItemState::Cropping {
                self.items[index].state = ItemState::Unprocessed;
            }
        }
        if let Some(item) = self.items.iter_mut().find(|item| &item.id == id) {
            item.state = ItemState::Cropping;
            self.active = Some(id.clone());
        }
    }

    /// First image needing a crop at or after `start`, wrapping around.
    fn find_uncropped(&self, start: usize) -> Option<MediaId> {
        let start = start.min(self.items.len());
        self.items[start..]
            .iter()
            .chain(self.items[..start].iter())
            .find(|item| item.needs_crop())
            .map(|item| item.id.clone())
    }
}

fn classify(mime: &str) -> Option<MediaKind> {
    if mime.starts_with("image/") {
        Some(MediaKind::Image)
    } else if mime.starts_with("video/") {
        Some(MediaKind::Video)
    } else {
        None
    }
}

fn extension_for(name: &str, mime: &str) -> String {
    if let Some(ext) = Path::new(name).extension().and_then(|ext| ext.to_str()) {
        if !ext.is_empty() {
            return ext.to_ascii_lowercase();
        }
    }
    let subtype = mime.split('/').nth(1).unwrap_or("bin");
    let subtype = subtype.split(';').next().unwrap_or(subtype).trim();
    match subtype {
        "jpeg" => "jpg".into(),
        "quicktime" => "mov".into(),
        "svg+xml" => "svg".into(),
        "" => "bin".into(),
        other => other.to_string(),
    }
}

fn with_extension(name: &str, extension: &str) -> String {
    let path = Path::new(name);
    match path.file_stem().and_then(|stem| stem.to_str()) {
        Some(stem) if !stem.is_empty() => format!("{}.{}", stem, extension),
        _ => format!("image.{}", extension),
    }
}
