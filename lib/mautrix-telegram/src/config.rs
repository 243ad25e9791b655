// Copyright 2024 - developers of the `mautrix-telegram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Connector configuration, deserialised from the bridge's YAML config.

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("missing required config field {0}")]
    Missing(&'static str),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Telegram API ID from <https://my.telegram.org>.
    pub app_id: i32,
    /// Telegram API hash from <https://my.telegram.org>.
    pub app_hash: String,
    #[serde(default)]
    pub animated_sticker: AnimatedStickerConfig,
    /// Emit direct-media `mxc://` URIs instead of reuploading files.
    #[serde(default)]
    pub use_direct_media: bool,
    /// Hostname used to mint direct-media URIs.
    #[serde(default)]
    pub direct_media_server: String,
    #[serde(default)]
    pub backfill: BackfillConfig,
}

impl Config {
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.app_id == 0 {
            return Err(ConfigError::Missing("app_id"));
        }
        if self.app_hash.is_empty() {
            return Err(ConfigError::Missing("app_hash"));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnimatedStickerTarget {
    #[default]
    Disable,
    Png,
    Gif,
    Webp,
    Webm,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnimatedStickerConfig {
    #[serde(default)]
    pub target: AnimatedStickerTarget,
    /// Also convert webm (video) stickers to the configured target.
    #[serde(default)]
    pub convert_from_webm: bool,
    #[serde(default)]
    pub args: AnimatedStickerArgs,
}

impl Default for AnimatedStickerConfig {
    fn default() -> Self {
        Self {
            target: AnimatedStickerTarget::Disable,
            convert_from_webm: false,
            args: AnimatedStickerArgs::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnimatedStickerArgs {
    #[serde(default = "default_sticker_size")]
    pub width: u32,
    #[serde(default = "default_sticker_size")]
    pub height: u32,
    #[serde(default = "default_sticker_fps")]
    pub fps: u32,
}

impl Default for AnimatedStickerArgs {
    fn default() -> Self {
        Self {
            width: default_sticker_size(),
            height: default_sticker_size(),
            fps: default_sticker_fps(),
        }
    }
}

fn default_sticker_size() -> u32 {
    256
}

fn default_sticker_fps() -> u32 {
    25
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BackfillConfig {
    #[serde(default)]
    pub queue: BackfillQueueConfig,
}

/// Per-peer-kind overrides for the framework's backfill queue. The queue
/// itself lives in the framework; the connector only answers how deep each
/// chat kind should go.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackfillQueueConfig {
    #[serde(default = "default_backfill_batch")]
    pub batch_size: u32,
    #[serde(default)]
    pub max_batches: i32,
    #[serde(default)]
    pub max_batches_channel: Option<i32>,
    #[serde(default)]
    pub max_batches_chat: Option<i32>,
    #[serde(default)]
    pub max_batches_user: Option<i32>,
}

impl Default for BackfillQueueConfig {
    fn default() -> Self {
        Self {
            batch_size: default_backfill_batch(),
            max_batches: 0,
            max_batches_channel: None,
            max_batches_chat: None,
            max_batches_user: None,
        }
    }
}

impl BackfillQueueConfig {
    pub fn max_batches_for(&self, peer_type: crate::ids::PeerType) -> i32 {
        use crate::ids::PeerType;
        match peer_type {
            PeerType::Channel => self.max_batches_channel,
            PeerType::Chat => self.max_batches_chat,
            PeerType::User => self.max_batches_user,
        }
        .unwrap_or(self.max_batches)
    }
}

fn default_backfill_batch() -> u32 {
    50
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal() {
        let config = Config::parse("app_id: 12345\napp_hash: abcdef0123456789\n").unwrap();
        assert_eq!(config.app_id, 12345);
        assert_eq!(config.animated_sticker.target, AnimatedStickerTarget::Disable);
        assert_eq!(config.animated_sticker.args.width, 256);
        assert!(!config.use_direct_media);
    }

    #[test]
    fn parse_sticker_config() {
        let config = Config::parse(
            "app_id: 12345\n\
             app_hash: abcdef0123456789\n\
             animated_sticker:\n\
             \x20 target: webm\n\
             \x20 convert_from_webm: true\n\
             \x20 args:\n\
             \x20   width: 512\n\
             \x20   height: 512\n\
             \x20   fps: 30\n",
        )
        .unwrap();
        assert_eq!(config.animated_sticker.target, AnimatedStickerTarget::Webm);
        assert!(config.animated_sticker.convert_from_webm);
        assert_eq!(config.animated_sticker.args.fps, 30);
    }

    #[test]
    fn reject_missing_credentials() {
        assert!(matches!(
            Config::parse("app_hash: abc\n"),
            Err(ConfigError::Missing("app_id"))
        ));
        assert!(matches!(
            Config::parse("app_id: 1\n"),
            Err(ConfigError::Missing("app_hash"))
        ));
    }

    #[test]
    fn backfill_overrides() {
        let config = Config::parse(
            "app_id: 1\napp_hash: a\nbackfill:\n  queue:\n    max_batches: 10\n    max_batches_channel: -1\n",
        )
        .unwrap();
        assert_eq!(
            config
                .backfill
                .queue
                .max_batches_for(crate::ids::PeerType::Channel),
            -1
        );
        assert_eq!(
            config
                .backfill
                .queue
                .max_batches_for(crate::ids::PeerType::User),
            10
        );
    }
}
