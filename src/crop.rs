//! Crop geometry and raster export for pending images.
//!
//! Rectangles are expressed against the image as it is *rendered* on
//! screen. Export maps them onto the decoded image's natural pixel grid.

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImageView};
use serde::{Deserialize, Serialize};

/// Fraction of the shorter rendered side covered by the default crop.
pub const DEFAULT_CROP_FRACTION: f32 = 0.9;
pub const MIN_ZOOM: f32 = 0.1;
pub const MAX_ZOOM: f32 = 3.0;
pub const ZOOM_STEP: f32 = 0.1;

#[derive(Debug, thiserror::Error)]
pub enum CropError {
    #[error("finish selecting a crop area before applying it")]
    CropIncomplete,
    #[error("failed to export cropped image: {0}")]
    CropExportFailed(String),
    #[error("no image is waiting to be cropped")]
    NoActiveItem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CropUnit {
    Percent,
    Pixel,
}

/// Selection as the user sees it; percent units are relative to the
/// rendered width (x, width) and height (y, height).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CropRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub unit: CropUnit,
}

/// Finalized selection in rendered pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CropRect {
    /// Centered selection with the given aspect ratio (width / height),
    /// as large as possible while covering at most 90% of either side.
    /// Sides are whole rendered pixels so the aspect survives the
    /// round trip through percent units.
    pub fn centered(rendered_width: u32, rendered_height: u32, aspect: f32) -> Self {
        if rendered_width == 0 || rendered_height == 0 {
            return Self {
                x: 0.0,
                y: 0.0,
                width: 0.0,
                height: 0.0,
                unit: CropUnit::Percent,
            };
        }
        let (w, h) = (rendered_width as f64, rendered_height as f64);
        let aspect = if aspect > 0.0 { aspect as f64 } else { 1.0 };
        let fraction = DEFAULT_CROP_FRACTION as f64;
        let max_h = (h * fraction).round().max(1.0);
        let mut crop_w = (w * fraction).round().max(1.0);
        let mut crop_h = (crop_w / aspect).round().max(1.0);
        if crop_h > max_h {
            crop_h = max_h;
            crop_w = (crop_h * aspect).round().clamp(1.0, w);
        }
        Self {
            x: ((w - crop_w) / 2.0 / w * 100.0) as f32,
            y: ((h - crop_h) / 2.0 / h * 100.0) as f32,
            width: (crop_w / w * 100.0) as f32,
            height: (crop_h / h * 100.0) as f32,
            unit: CropUnit::Percent,
        }
    }

    /// Default square selection: 90% of the shorter rendered side.
    pub fn default_square(rendered_width: u32, rendered_height: u32) -> Self {
        Self::centered(rendered_width, rendered_height, 1.0)
    }

    pub fn to_pixels(&self, rendered_width: u32, rendered_height: u32) -> PixelRect {
        let (x, y, w, h) = match self.unit {
            CropUnit::Pixel => (self.x, self.y, self.width, self.height),
            CropUnit::Percent => {
                let rw = rendered_width as f32 / 100.0;
                let rh = rendered_height as f32 / 100.0;
                (self.x * rw, self.y * rh, self.width * rw, self.height * rh)
            }
        };
        PixelRect {
            x: x.max(0.0).round() as u32,
            y: y.max(0.0).round() as u32,
            width: w.max(0.0).round() as u32,
            height: h.max(0.0).round() as u32,
        }
        .clamp_to(rendered_width, rendered_height)
    }

    /// Forces the selection to the aspect ratio and inside the rendered
    /// bounds, returning it in pixel units.
    pub fn constrained(&self, rendered_width: u32, rendered_height: u32, aspect: f32) -> Self {
        let px = self.to_pixels(rendered_width, rendered_height);
        let aspect = if aspect > 0.0 { aspect } else { 1.0 };
        let mut width = px.width as f32;
        let mut height = width / aspect;
        if height > px.height as f32 {
            height = px.height as f32;
            width = height * aspect;
        }
        let max_x = (rendered_width as f32 - width).max(0.0);
        let max_y = (rendered_height as f32 - height).max(0.0);
        Self {
            x: (px.x as f32).min(max_x),
            y: (px.y as f32).min(max_y),
            width,
            height,
            unit: CropUnit::Pixel,
        }
    }
}

impl From<PixelRect> for CropRect {
    fn from(rect: PixelRect) -> Self {
        Self {
            x: rect.x as f32,
            y: rect.y as f32,
            width: rect.width as f32,
            height: rect.height as f32,
            unit: CropUnit::Pixel,
        }
    }
}

/// Quarter turns applied to an image before it is cropped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rotation {
    #[default]
    Upright,
    Cw90,
    Cw180,
    Cw270,
}

impl Rotation {
    /// One more quarter turn clockwise, back to upright after 270°.
    pub fn turned(self) -> Self {
        match self {
            Rotation::Upright => Rotation::Cw90,
            Rotation::Cw90 => Rotation::Cw180,
            Rotation::Cw180 => Rotation::Cw270,
            Rotation::Cw270 => Rotation::Upright,
        }
    }

    pub fn degrees(self) -> u16 {
        match self {
            Rotation::Upright => 0,
            Rotation::Cw90 => 90,
            Rotation::Cw180 => 180,
            Rotation::Cw270 => 270,
        }
    }

    pub fn apply(self, image: DynamicImage) -> DynamicImage {
        match self {
            Rotation::Upright => image,
            Rotation::Cw90 => image.rotate90(),
            Rotation::Cw180 => image.rotate180(),
            Rotation::Cw270 => image.rotate270(),
        }
    }
}

impl PixelRect {
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn clamp_to(self, width: u32, height: u32) -> Self {
        let x = self.x.min(width);
        let y = self.y.min(height);
        Self {
            x,
            y,
            width: self.width.min(width - x),
            height: self.height.min(height - y),
        }
    }
}

/// Rendered-to-natural mapping of a crop rectangle, clamped to the image.
pub fn source_region(
    rect: PixelRect,
    rendered: (u32, u32),
    natural: (u32, u32),
) -> Option<PixelRect> {
    let (rendered_w, rendered_h) = rendered;
    let (natural_w, natural_h) = natural;
    if rendered_w == 0 || rendered_h == 0 {
        return None;
    }
    let scale_x = natural_w as f64 / rendered_w as f64;
    let scale_y = natural_h as f64 / rendered_h as f64;
    let region = PixelRect {
        x: (rect.x as f64 * scale_x).round() as u32,
        y: (rect.y as f64 * scale_y).round() as u32,
        width: (rect.width as f64 * scale_x).round() as u32,
        height: (rect.height as f64 * scale_y).round() as u32,
    }
    .clamp_to(natural_w, natural_h);
    if region.is_empty() {
        None
    } else {
        Some(region)
    }
}

pub fn clamp_zoom(zoom: f32) -> f32 {
    let stepped = (zoom / ZOOM_STEP).round() * ZOOM_STEP;
    stepped.clamp(MIN_ZOOM, MAX_ZOOM)
}

/// Cuts `rect` (rendered pixels) out of the encoded image and re-encodes
/// it as a JPEG whose dimensions are exactly `rect.width × rect.height`.
///
/// `rendered` is the on-screen size of the image after `rotation`, so the
/// rotation is applied to the decoded pixels before the rectangle is
/// mapped onto them.
pub fn export(
    encoded: &[u8],
    rect: PixelRect,
    rendered: (u32, u32),
    rotation: Rotation,
    quality: u8,
) -> Result<Vec<u8>, CropError> {
    if rect.is_empty() {
        return Err(CropError::CropExportFailed("crop area is empty".into()));
    }
    let decoded = image::load_from_memory(encoded)
        .map_err(|err| CropError::CropExportFailed(format!("decode: {}", err)))?;
    let decoded = rotation.apply(decoded);
    let region = source_region(rect, rendered, decoded.dimensions()).ok_or_else(|| {
        CropError::CropExportFailed("crop area falls outside the image".into())
    })?;

    let cut = decoded
        .crop_imm(region.x, region.y, region.width, region.height)
        .to_rgb8();
    let canvas = if cut.dimensions() == (rect.width, rect.height) {
        cut
    } else {
        imageops::resize(&cut, rect.width, rect.height, FilterType::Triangle)
    };

    let mut out = Cursor::new(Vec::new());
    {
        let mut encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
        encoder
            .encode_image(&canvas)
            .map_err(|err| CropError::CropExportFailed(format!("encode: {}", err)))?;
    }
    let bytes = out.into_inner();
    if bytes.is_empty() {
        return Err(CropError::CropExportFailed("encoder produced no data".into()));
    }
    Ok(bytes)
}
