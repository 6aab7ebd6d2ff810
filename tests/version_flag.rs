use std::fs;
use std::thread;
use std::time::Duration;

use assert_cmd::Command;
use predicates::prelude::*;
use tiny_http::{Response, Server};

fn campus_hub() -> Command {
    let mut cmd = Command::cargo_bin("campus-hub").expect("binary");
    cmd.env_remove("CAMPUS_HUB_BACKEND__URL")
        .env_remove("CAMPUS_HUB_BACKEND__ANON_KEY")
        .env_remove("CAMPUS_HUB_LOG");
    cmd
}

#[test]
fn prints_version() {
    campus_hub()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn prints_help() {
    campus_hub()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Campus Hub"))
        .stdout(predicate::str::contains("--feed"));
}

#[test]
fn rejects_unknown_flag() {
    campus_hub()
        .arg("--frobnicate")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("unknown argument: --frobnicate"));
}

#[test]
fn feed_requires_backend_url() {
    let dir = tempfile::tempdir().expect("tempdir");
    campus_hub()
        .arg("--config")
        .arg(dir.path().join("missing.yaml"))
        .arg("--feed")
        .assert()
        .failure()
        .stderr(predicate::str::contains("backend.url is not configured"));
}

#[test]
fn feed_prints_latest_posts() {
    let server = Server::http("127.0.0.1:0").expect("http server");
    let base = format!("http://{}", server.server_addr());
    let handle = thread::spawn(move || {
        if let Ok(Some(req)) = server.recv_timeout(Duration::from_secs(10)) {
            let body = r#"[{"id":"p1","user_id":"u1","content":"first light",
                "is_anonymous":false,"created_at":"2024-03-02T08:15:00Z",
                "profiles":{"id":"u1","username":"sam","full_name":"Sam Ortiz"},
                "likes":[{"id":"l1","post_id":"p1","user_id":"u2"}],
                "comments":[],
                "media_files":[{"id":"m1","post_id":"p1","user_id":"u1",
                    "file_path":"u1/p1/a.jpg","file_type":"image"}]}]"#;
            let _ = req.respond(Response::from_string(body));
        }
    });

    let dir = tempfile::tempdir().expect("tempdir");
    campus_hub()
        .env("CAMPUS_HUB_BACKEND__URL", &base)
        .env("CAMPUS_HUB_BACKEND__ANON_KEY", "anon")
        .arg("--config")
        .arg(dir.path().join("missing.yaml"))
        .arg("--feed")
        .assert()
        .success()
        .stdout(predicate::str::contains("2024-03-02 08:15  Sam Ortiz"))
        .stdout(predicate::str::contains("    first light"))
        .stdout(predicate::str::contains(format!(
            "[image] {}/storage/v1/object/public/post-media/u1/p1/a.jpg",
            base
        )))
        .stdout(predicate::str::contains("1 likes, 0 comments"));
    handle.join().expect("server thread");
}

#[test]
fn save_backend_writes_config() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("campus-hub").join("config.yaml");
    campus_hub()
        .arg("--config")
        .arg(&path)
        .arg("--save-backend")
        .arg("https://demo.example.co")
        .arg("anon-key")
        .assert()
        .success()
        .stdout(predicate::str::contains("Saved backend settings"));
    let saved = fs::read_to_string(&path).expect("config written");
    assert!(saved.contains("https://demo.example.co"));
    assert!(saved.contains("anon-key"));
}
