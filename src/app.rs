use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::info;

use crate::config::{self, Config};
use crate::data::Backend;
use crate::logging;
use crate::model::Post;
use crate::pager::FeedPager;
use crate::supabase;

pub const HELP: &str = "Campus Hub - campus feed and toll back-office client.

Usage: campus-hub [--config <path>] <command>

  --feed                       Print the latest page of the feed
  --save-backend <url> <key>   Store the backend project url and anon key
  --config <path>              Read settings from <path>
  --version, -V                Show version and exit
  --help,    -h                Show this help message";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Feed,
    SaveBackend { url: String, anon_key: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub config_file: Option<PathBuf>,
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Version,
    Help,
    Run(Invocation),
}

pub fn parse_args<I, S>(args: I) -> Result<Action>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut args = args.into_iter().map(Into::into);
    let mut config_file = None;
    let mut command = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => return Ok(Action::Version),
            "--help" | "-h" => return Ok(Action::Help),
            "--config" => {
                let path = args.next().context("--config needs a path")?;
                config_file = Some(PathBuf::from(path));
            }
            "--feed" => command = Some(Command::Feed),
            "--save-backend" => {
                let url = args.next().context("--save-backend needs a url")?;
                let anon_key = args.next().context("--save-backend needs an anon key")?;
                command = Some(Command::SaveBackend { url, anon_key });
            }
            other => bail!("unknown argument: {}", other),
        }
    }

    Ok(match command {
        Some(command) => Action::Run(Invocation {
            config_file,
            command,
        }),
        None => Action::Help,
    })
}

pub fn run(invocation: Invocation) -> Result<()> {
    let cfg = config::load(config::LoadOptions {
        config_file: invocation.config_file.clone(),
        env_prefix: None,
    })
    .context("load config")?;
    logging::init(&cfg.log.filter);

    match invocation.command {
        Command::Feed => {
            let backend = connect(&cfg)?;
            let mut pager = FeedPager::new(&backend, cfg.feed.page_size);
            pager.load_initial()?;
            let stdout = io::stdout();
            write_feed(&mut stdout.lock(), pager.items())?;
        }
        Command::SaveBackend { url, anon_key } => {
            let path = config::save_backend_settings(invocation.config_file, &url, &anon_key)?;
            info!(path = %path.display(), "backend settings saved");
            println!("Saved backend settings to {}", path.display());
        }
    }
    Ok(())
}

pub fn connect(cfg: &Config) -> Result<Backend> {
    if cfg.backend.url.trim().is_empty() {
        bail!("backend.url is not configured; run --save-backend or set CAMPUS_HUB_BACKEND__URL");
    }
    let client = supabase::Client::new(supabase::ClientConfig {
        url: cfg.backend.url.clone(),
        anon_key: cfg.backend.anon_key.clone(),
        media_bucket: cfg.backend.media_bucket.clone(),
        user_agent: cfg.backend.user_agent.clone(),
        timeout: Some(cfg.backend.timeout),
        http_client: None,
    })?;
    Ok(Backend::supabase(Arc::new(client)))
}

pub fn write_feed<W: Write>(out: &mut W, posts: &[Post]) -> Result<()> {
    if posts.is_empty() {
        writeln!(out, "No posts yet.")?;
        return Ok(());
    }
    for post in posts {
        writeln!(
            out,
            "{}  {}",
            post.created_at.format("%Y-%m-%d %H:%M"),
            post.author_label()
        )?;
        if !post.content.is_empty() {
            for line in post.content.lines() {
                writeln!(out, "    {}", line)?;
            }
        }
        for media in &post.media_files {
            let location = media.url.as_deref().unwrap_or(&media.file_path);
            writeln!(out, "    [{}] {}", media.file_type.as_str(), location)?;
        }
        writeln!(
            out,
            "    {} likes, {} comments",
            post.likes.len(),
            post.comments.len()
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    use crate::model::{MediaFile, MediaKind, Profile};

    #[test]
    fn parses_commands() {
        assert_eq!(parse_args(["--version"]).unwrap(), Action::Version);
        assert_eq!(parse_args(Vec::<String>::new()).unwrap(), Action::Help);
        assert_eq!(
            parse_args(["--config", "/tmp/c.yaml", "--feed"]).unwrap(),
            Action::Run(Invocation {
                config_file: Some(PathBuf::from("/tmp/c.yaml")),
                command: Command::Feed,
            })
        );
        assert_eq!(
            parse_args(["--save-backend", "https://x.co", "key"]).unwrap(),
            Action::Run(Invocation {
                config_file: None,
                command: Command::SaveBackend {
                    url: "https://x.co".into(),
                    anon_key: "key".into(),
                },
            })
        );
        assert!(parse_args(["--config"]).is_err());
        assert!(parse_args(["--bogus"]).is_err());
    }

    #[test]
    fn feed_lines_hide_anonymous_authors() {
        let post = Post {
            id: "p1".into(),
            user_id: "u1".into(),
            content: "hello".into(),
            is_anonymous: true,
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap(),
            profiles: Some(Profile {
                id: "u1".into(),
                full_name: Some("Ana".into()),
                ..Profile::default()
            }),
            likes: Vec::new(),
            comments: Vec::new(),
            media_files: vec![MediaFile {
                id: "m1".into(),
                post_id: "p1".into(),
                user_id: "u1".into(),
                file_path: "u1/p1/a.jpg".into(),
                file_type: MediaKind::Image,
                created_at: None,
                url: Some("https://cdn/a.jpg".into()),
            }],
        };
        let mut out = Vec::new();
        write_feed(&mut out, &[post]).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("2024-05-01 09:30  Anonymous"));
        assert!(!text.contains("Ana"));
        assert!(text.contains("    hello"));
        assert!(text.contains("[image] https://cdn/a.jpg"));
        assert!(text.contains("0 likes, 0 comments"));
    }

    #[test]
    fn empty_feed_message() {
        let mut out = Vec::new();
        write_feed(&mut out, &[]).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "No posts yet.\n");
    }
}
