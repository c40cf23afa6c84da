#![forbid(unsafe_code)]

pub mod client;
pub mod directory;
pub mod pusher;

pub use client::{BanKind, CommandContext, KickClient, MAX_MESSAGE_CHARS, SlowMode};
pub use directory::{BrowserChannelDirectory, ChannelDirectory, VideoInfo};

/// Site origin for REST calls and page navigation.
pub const DEFAULT_BASE_URL: &str = "https://kick.com";
