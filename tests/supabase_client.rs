use std::io::Read;
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use campus_hub::crop::{PixelRect, Rotation};
use campus_hub::data::{Backend, PostService, StorageService, TollService};
use campus_hub::model::{MediaKind, NewMediaFile, NewNotification, NotificationKind};
use campus_hub::notifications::{notify, Inbox};
use campus_hub::profile::{AvatarCrop, ProfileEditor};
use campus_hub::supabase::{Client, ClientConfig};
use tiny_http::{Header, Response, Server};
use url::Url;

struct Recorded {
    method: String,
    url: String,
    headers: Vec<(String, String)>,
    body: String,
}

impl Recorded {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(field, _)| field.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    fn query(&self) -> Vec<(String, String)> {
        Url::parse(&format!("http://fake{}", self.url))
            .expect("request url")
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }
}

type Served = (String, Receiver<Recorded>, thread::JoinHandle<()>);

/// Serves the canned `(status, body)` responses in order, one per request.
fn serve(responses: Vec<(u16, &'static str)>) -> Served {
    serve_with_headers(
        responses
            .into_iter()
            .map(|(status, body)| (status, body, Vec::new()))
            .collect(),
    )
}

fn serve_with_headers(
    responses: Vec<(u16, &'static str, Vec<(&'static str, &'static str)>)>,
) -> Served {
    let server = Server::http("127.0.0.1:0").expect("http server");
    let base = format!("http://{}", server.server_addr());
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        for (status, body, extra) in responses {
            let mut req = match server.recv_timeout(Duration::from_secs(5)) {
                Ok(Some(req)) => req,
                _ => break,
            };
            let mut payload = String::new();
            let _ = req.as_reader().read_to_string(&mut payload);
            let _ = tx.send(Recorded {
                method: req.method().to_string(),
                url: req.url().to_string(),
                headers: req
                    .headers()
                    .iter()
                    .map(|h| {
                        (
                            h.field.as_str().as_str().to_string(),
                            h.value.as_str().to_string(),
                        )
                    })
                    .collect(),
                body: payload,
            });
            let mut response = Response::from_string(body)
                .with_status_code(status)
                .with_header(
                    Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
                        .expect("content type header"),
                );
            for (name, value) in extra {
                response = response.with_header(
                    Header::from_bytes(name.as_bytes(), value.as_bytes()).expect("extra header"),
                );
            }
            let _ = req.respond(response);
        }
    });
    (base, rx, handle)
}

fn client(base: &str) -> Client {
    Client::new(ClientConfig {
        url: base.to_string(),
        anon_key: "anon-key".into(),
        media_bucket: "post-media".into(),
        user_agent: "campus-hub-test".into(),
        timeout: Some(Duration::from_secs(5)),
        http_client: None,
    })
    .expect("client")
}

#[test]
fn feed_page_uses_range_and_joins() {
    let (base, rx, handle) = serve(vec![(
        200,
        r#"[{"id":"p1","user_id":"u1","content":"hi","is_anonymous":false,
             "created_at":"2024-01-01T00:00:00Z","profiles":null,"likes":[],
             "comments":[],"media_files":[]}]"#,
    )]);
    let backend = Backend::supabase(Arc::new(client(&base)));
    let posts = backend.posts.list_posts(10, 19).expect("list posts");
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].content, "hi");

    let req = rx.recv().expect("request");
    assert_eq!(req.method, "GET");
    assert!(req.url.starts_with("/rest/v1/posts?"));
    let query = req.query();
    assert!(query.contains(&(
        "select".into(),
        "*,profiles(*),likes(*),comments(*),media_files(*)".into()
    )));
    assert!(query.contains(&("order".into(), "created_at.desc".into())));
    assert_eq!(req.header("Range"), Some("10-19"));
    assert_eq!(req.header("Range-Unit"), Some("items"));
    assert_eq!(req.header("apikey"), Some("anon-key"));
    assert_eq!(req.header("Authorization"), Some("Bearer anon-key"));
    handle.join().expect("server thread");
}

#[test]
fn upload_then_media_row() {
    let (base, rx, handle) = serve(vec![
        (200, r#"{"Key":"post-media/u1/p1/abc.jpg"}"#),
        (
            201,
            r#"[{"id":"m1","post_id":"p1","user_id":"u1","file_path":"u1/p1/abc.jpg",
                 "file_type":"image"}]"#,
        ),
    ]);
    let backend = Backend::supabase(Arc::new(client(&base)));
    backend
        .storage
        .upload("u1/p1/abc.jpg", b"jpeg-bytes".to_vec(), "image/jpeg")
        .expect("upload");
    let row = backend
        .posts
        .insert_media(&NewMediaFile {
            post_id: "p1".into(),
            user_id: "u1".into(),
            file_path: "u1/p1/abc.jpg".into(),
            file_type: MediaKind::Image,
        })
        .expect("media row");
    assert_eq!(row.file_type, MediaKind::Image);

    let upload = rx.recv().expect("upload request");
    assert_eq!(upload.method, "POST");
    assert_eq!(upload.url, "/storage/v1/object/post-media/u1/p1/abc.jpg");
    assert_eq!(upload.header("Content-Type"), Some("image/jpeg"));
    assert_eq!(upload.body, "jpeg-bytes");

    let insert = rx.recv().expect("insert request");
    assert_eq!(insert.url, "/rest/v1/media_files");
    assert_eq!(insert.header("Prefer"), Some("return=representation"));
    let body: serde_json::Value = serde_json::from_str(&insert.body).expect("json body");
    assert_eq!(body[0]["file_type"], "image");
    assert_eq!(body[0]["post_id"], "p1");
    handle.join().expect("server thread");
}

#[test]
fn backend_message_is_surfaced() {
    let (base, _rx, handle) = serve(vec![(
        409,
        r#"{"message":"duplicate key value violates unique constraint"}"#,
    )]);
    let backend = Backend::supabase(Arc::new(client(&base)));
    let err = backend
        .toll
        .generate_receipt_number()
        .expect_err("conflict");
    let text = format!("{:#}", err);
    assert!(text.contains("api error 409"), "{}", text);
    assert!(text.contains("duplicate key value"), "{}", text);
    handle.join().expect("server thread");
}

#[test]
fn unauthorized_is_named() {
    let (base, _rx, handle) = serve(vec![(401, r#"{"msg":"JWT expired"}"#)]);
    let backend = Backend::supabase(Arc::new(client(&base)));
    let err = backend.posts.list_posts(0, 9).expect_err("unauthorized");
    let text = format!("{:#}", err);
    assert!(text.contains("unauthorized: JWT expired"), "{}", text);
    handle.join().expect("server thread");
}

#[test]
fn receipt_number_comes_from_rpc() {
    let (base, rx, handle) = serve(vec![(200, r#""RCP-20240101-0001""#)]);
    let backend = Backend::supabase(Arc::new(client(&base)));
    assert_eq!(
        backend.toll.generate_receipt_number().expect("receipt"),
        "RCP-20240101-0001"
    );
    let req = rx.recv().expect("rpc request");
    assert_eq!(req.method, "POST");
    assert_eq!(req.url, "/rest/v1/rpc/generate_receipt_number");
    handle.join().expect("server thread");
}

#[test]
fn sign_in_switches_bearer_token() {
    let (base, rx, handle) = serve(vec![
        (
            200,
            r#"{"access_token":"user-token","refresh_token":"r",
                "user":{"id":"u1","email":"ana@example.com"}}"#,
        ),
        (200, r#"{"id":"u1","email":"ana@example.com"}"#),
    ]);
    let client = Arc::new(client(&base));
    let identity = client
        .sign_in_with_password("ana@example.com", "secret")
        .expect("sign in");
    assert_eq!(identity.id, "u1");
    let backend = Backend::supabase(client.clone());
    let current = backend.auth.current_user().expect("current user");
    assert_eq!(current.map(|user| user.id).as_deref(), Some("u1"));

    let token = rx.recv().expect("token request");
    assert!(token.url.starts_with("/auth/v1/token?grant_type=password"));
    let user = rx.recv().expect("user request");
    assert_eq!(user.url, "/auth/v1/user");
    assert_eq!(user.header("Authorization"), Some("Bearer user-token"));
    handle.join().expect("server thread");
}

#[test]
fn signed_out_client_has_no_user() {
    let client = client("http://127.0.0.1:9");
    assert!(client.current_user().expect("no request").is_none());
    assert_eq!(
        StorageService::public_url(
            &campus_hub::data::SupabaseBackend::new(Arc::new(client)),
            "u1/p1/a.jpg"
        ),
        "http://127.0.0.1:9/storage/v1/object/public/post-media/u1/p1/a.jpg"
    );
}

#[test]
fn unread_count_is_an_exact_head_count() {
    let (base, rx, handle) = serve_with_headers(vec![
        (
            200,
            r#"[{"id":"n1","user_id":"u1","type":"follow","content":"Sam followed you",
                 "reference_id":null,"reference_type":null,"is_read":false,
                 "created_at":"2024-01-01T00:00:00Z"}]"#,
            Vec::new(),
        ),
        (200, "", vec![("Content-Range", "*/3")]),
    ]);
    let backend = Backend::supabase(Arc::new(client(&base)));
    let mut inbox = Inbox::new(&backend, "u1");
    inbox.refresh().expect("refresh inbox");
    assert_eq!(inbox.items().len(), 1);
    assert_eq!(inbox.items()[0].kind, NotificationKind::Follow);
    assert_eq!(inbox.unread(), 3);

    let list = rx.recv().expect("list request");
    assert_eq!(list.method, "GET");
    assert!(list.url.starts_with("/rest/v1/notifications?"));
    let query = list.query();
    assert!(query.contains(&("user_id".into(), "eq.u1".into())));
    assert!(query.contains(&("order".into(), "created_at.desc".into())));
    assert!(query.contains(&("limit".into(), "50".into())));

    let count = rx.recv().expect("count request");
    assert_eq!(count.method, "HEAD");
    assert_eq!(count.header("Prefer"), Some("count=exact"));
    let query = count.query();
    assert!(query.contains(&("user_id".into(), "eq.u1".into())));
    assert!(query.contains(&("is_read".into(), "eq.false".into())));
    handle.join().expect("server thread");
}

#[test]
fn notification_goes_through_rpc() {
    let (base, rx, handle) = serve(vec![(
        200,
        r#"{"id":"n9","user_id":"u2","type":"like","content":"Ana liked your post",
            "reference_id":"p1","reference_type":"post","is_read":false,
            "created_at":"2024-01-01T00:00:00Z"}"#,
    )]);
    let backend = Backend::supabase(Arc::new(client(&base)));
    let created = notify(
        &backend,
        NewNotification::new("u2", NotificationKind::Like, "Ana liked your post")
            .about("post", "p1"),
    )
    .expect("notify");
    assert_eq!(created.id, "n9");

    let req = rx.recv().expect("rpc request");
    assert_eq!(req.method, "POST");
    assert_eq!(req.url, "/rest/v1/rpc/create_notification");
    let body: serde_json::Value = serde_json::from_str(&req.body).expect("json body");
    assert_eq!(body["p_user_id"], "u2");
    assert_eq!(body["p_type"], "like");
    assert_eq!(body["p_reference_id"], "p1");
    assert_eq!(body["p_reference_type"], "post");
    handle.join().expect("server thread");
}

#[test]
fn avatar_upload_overwrites_in_avatar_bucket() {
    let (base, rx, handle) = serve(vec![
        (200, r#"{"Key":"avatars/profile-images/u1-1.jpg"}"#),
        (200, "[]"),
    ]);
    let backend = Backend::supabase(Arc::new(client(&base)));
    let editor = ProfileEditor::new(&backend, "avatars", 90);

    let picture = image::RgbImage::from_pixel(30, 30, image::Rgb([0, 90, 180]));
    let mut encoded = std::io::Cursor::new(Vec::new());
    picture
        .write_to(&mut encoded, image::ImageFormat::Png)
        .expect("encode png");
    let url = editor
        .update_avatar(
            "u1",
            encoded.get_ref(),
            AvatarCrop {
                rect: PixelRect {
                    x: 0,
                    y: 0,
                    width: 30,
                    height: 30,
                },
                rendered: (30, 30),
                rotation: Rotation::Upright,
            },
        )
        .expect("avatar");
    assert!(url.starts_with(&format!(
        "{}/storage/v1/object/public/avatars/profile-images/u1-",
        base
    )));

    let upload = rx.recv().expect("upload request");
    assert_eq!(upload.method, "POST");
    assert!(upload
        .url
        .starts_with("/storage/v1/object/avatars/profile-images/u1-"));
    assert!(upload.url.ends_with(".jpg"));
    assert_eq!(upload.header("x-upsert"), Some("true"));
    assert_eq!(upload.header("Content-Type"), Some("image/jpeg"));

    let patch = rx.recv().expect("profile request");
    assert_eq!(patch.method, "PATCH");
    assert!(patch.url.starts_with("/rest/v1/profiles?"));
    assert!(patch.query().contains(&("id".into(), "eq.u1".into())));
    let body: serde_json::Value = serde_json::from_str(&patch.body).expect("json body");
    assert_eq!(body["avatar_url"], url.as_str());
    handle.join().expect("server thread");
}
