use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, Instant};

use campus_hub::composer::{Composer, SubmitError};
use campus_hub::config::{UIConfig, UploadConfig};
use campus_hub::data::Backend;
use campus_hub::memory::MemoryBackend;
use campus_hub::model::MediaKind;
use campus_hub::notice::{NoticeBoard, NoticeKind};
use campus_hub::pager::FeedPager;
use campus_hub::uploads::{IncomingFile, ItemState};
use image::{ImageBuffer, ImageFormat, Rgb};

fn png(width: u32, height: u32) -> Vec<u8> {
    let buffer = ImageBuffer::from_fn(width, height, |x, y| {
        Rgb([(x * 3 % 256) as u8, (y * 5 % 256) as u8, 90])
    });
    let mut out = Cursor::new(Vec::new());
    buffer
        .write_to(&mut out, ImageFormat::Png)
        .expect("encode png");
    out.into_inner()
}

fn image(name: &str) -> IncomingFile {
    IncomingFile::new(name, "image/png", png(120, 80))
}

fn video(name: &str) -> IncomingFile {
    IncomingFile::new(name, "video/mp4", b"\0\0\0\x18ftypmp42isom".to_vec())
}

fn setup() -> (Arc<MemoryBackend>, Backend, Composer) {
    let memory = Arc::new(MemoryBackend::new());
    memory.sign_in("user-1", "sam@example.com");
    let backend = Backend::from_shared(memory.clone());
    let composer = Composer::new(backend.clone(), UploadConfig::default()).expect("composer");
    (memory, backend, composer)
}

/// Crops the active image with the default selection, as the crop modal
/// does when the user accepts it unchanged.
fn accept_default_crop(composer: &mut Composer) {
    let queue = composer.queue_mut();
    queue.image_loaded(60, 40).expect("image loaded");
    queue.finalize_crop().expect("finalize");
    queue.apply_crop().expect("apply");
}

#[test]
fn text_post_lands_at_top_of_feed() {
    let (_memory, backend, mut composer) = setup();
    let mut pager = FeedPager::new(&backend, 10);
    pager.load_initial().expect("initial load");
    assert!(pager.items().is_empty());

    composer.set_text("hello");
    assert!(composer.can_submit());
    let post_id = composer.submit().expect("submit");
    assert!(pager.post_created(&post_id).expect("prepend"));

    let first = &pager.items()[0];
    assert_eq!(first.content, "hello");
    assert!(first.media_files.is_empty());
}

#[test]
fn image_only_post_uploads_one_cropped_object() {
    let (memory, backend, mut composer) = setup();
    composer.attach(vec![image("photo.png")]).expect("attach");
    assert!(composer.queue().is_modal_open());
    assert!(!composer.can_submit());

    accept_default_crop(&mut composer);
    assert!(!composer.queue().is_modal_open());
    assert!(composer.can_submit());

    let post_id = composer.submit().expect("submit");
    let rows = memory.media_rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].post_id, post_id);
    assert_eq!(rows[0].file_type, MediaKind::Image);
    assert!(rows[0].file_path.ends_with(".jpg"));

    let stored = memory.object(&rows[0].file_path).expect("stored object");
    assert_eq!(stored.content_type, "image/jpeg");
    let decoded = image::load_from_memory(&stored.bytes).expect("decode upload");
    // 90% of the 40px rendered height, square.
    assert_eq!((decoded.width(), decoded.height()), (36, 36));

    let mut pager = FeedPager::new(&backend, 10);
    pager.load_initial().expect("load");
    let post = &pager.items()[0];
    assert_eq!(post.content, "");
    assert_eq!(post.media_files.len(), 1);
    assert_eq!(
        post.media_files[0].url.as_deref(),
        Some(format!("memory://post-media/{}", rows[0].file_path).as_str())
    );
}

#[test]
fn crop_modal_cycles_images_in_order() {
    let (memory, _backend, mut composer) = setup();
    composer
        .attach(vec![
            image("one.png"),
            video("clip.mp4"),
            image("two.png"),
            image("three.png"),
        ])
        .expect("attach");

    let mut seen = Vec::new();
    while let Some(active) = composer.queue().active() {
        seen.push(active.name().to_string());
        accept_default_crop(&mut composer);
    }
    assert_eq!(seen, vec!["one.png", "two.png", "three.png"]);
    assert!(!composer.queue().is_modal_open());
    assert_eq!(composer.queue().len(), 4);
    assert!(composer.queue().items().iter().all(|item| item.is_eligible()));
    assert_eq!(composer.queue().items()[1].state(), ItemState::Ready);

    composer.submit().expect("submit");
    let kinds: Vec<MediaKind> = memory.media_rows().iter().map(|m| m.file_type).collect();
    assert_eq!(
        kinds,
        vec![
            MediaKind::Image,
            MediaKind::Video,
            MediaKind::Image,
            MediaKind::Image
        ]
    );
    assert_eq!(memory.object_keys().len(), 4);
}

#[test]
fn partial_upload_leaves_post_behind() {
    let (memory, _backend, mut composer) = setup();
    composer
        .attach(vec![video("a.mp4"), video("b.mp4")])
        .expect("attach");
    memory.fail_upload_after(0);
    let err = composer.submit().expect_err("upload fails");
    match err {
        SubmitError::PartialUpload { uploaded, .. } => assert_eq!(uploaded, 0),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(memory.post_count(), 1);
    assert!(memory.media_rows().is_empty());
    assert!(memory.object_keys().is_empty());
}

#[test]
fn infinite_scroll_reaches_the_end() {
    let (_memory, backend, mut composer) = setup();
    for i in 0..23 {
        composer.set_text(format!("post {i}"));
        composer.submit().expect("submit");
    }
    let mut pager = FeedPager::new(&backend, 10);
    pager.load_initial().expect("load");
    while pager.sentinel_visible(true).expect("page") > 0 {}
    assert!(!pager.has_more());
    assert_eq!(pager.items().len(), 23);
    assert_eq!(pager.items()[0].content, "post 22");
    assert_eq!(pager.items()[22].content, "post 0");
}

#[test]
fn failed_submit_surfaces_a_notice() {
    let (memory, _backend, mut composer) = setup();
    let mut notices = NoticeBoard::new(UIConfig::default().notice_ttl);
    memory.sign_out();
    composer.set_text("draft");
    assert!(notices.report(composer.submit()).is_none());

    let latest = notices.latest().expect("error notice");
    assert_eq!(latest.kind, NoticeKind::Error);
    assert_eq!(composer.text(), "draft");
    let later = Instant::now() + UIConfig::default().notice_ttl + Duration::from_millis(1);
    assert!(notices.visible(later).is_empty());
}
