#![allow(clippy::uninlined_format_args)]

pub mod app;
pub mod composer;
pub mod config;
pub mod crop;
pub mod data;
pub mod logging;
pub mod memory;
pub mod model;
pub mod notice;
pub mod notifications;
pub mod pager;
pub mod preview;
pub mod profile;
pub mod social;
pub mod supabase;
pub mod toll;
pub mod uploads;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use app::run;
