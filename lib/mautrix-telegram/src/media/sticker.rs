// Copyright 2024 - developers of the `mautrix-telegram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Animated-sticker conversion through external converters.
//!
//! Telegram's animated stickers are gzipped Lottie JSON with the
//! `application/x-tgsticker` MIME type, which no Matrix client renders.
//! `lottieconverter` turns them into a raster or video format; `ffmpeg`
//! covers the webm-input case. Conversion failures are logged and the
//! caller falls back to the original payload, so a missing binary
//! degrades output quality instead of dropping messages.

use std::process::Stdio;

use log::warn;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::{AnimatedStickerConfig, AnimatedStickerTarget};

pub(crate) struct ConvertedSticker {
    pub(crate) data: Vec<u8>,
    pub(crate) mime_type: &'static str,
    /// PNG poster frame, generated for video targets.
    pub(crate) thumbnail: Option<Vec<u8>>,
}

impl AnimatedStickerTarget {
    fn converter_format(self) -> Option<(&'static str, &'static str)> {
        match self {
            Self::Disable => None,
            Self::Png => Some(("png", "image/png")),
            Self::Gif => Some(("gif", "image/gif")),
            Self::Webp => Some(("webp", "image/webp")),
            Self::Webm => Some(("webm", "video/webm")),
        }
    }
}

/// Convert a `.tgs` payload according to the configuration.
///
/// Returns `None` when conversion is disabled or fails for any reason.
pub(crate) async fn convert_tgs(
    data: &[u8],
    config: &AnimatedStickerConfig,
) -> Option<ConvertedSticker> {
    let (format, mime_type) = config.target.converter_format()?;

    let converted = run_lottieconverter(data, format, config).await?;
    let thumbnail = if config.target == AnimatedStickerTarget::Webm {
        run_lottieconverter(data, "png", config)
            .await
            .map(|thumb| thumb.data)
    } else {
        None
    };

    Some(ConvertedSticker {
        data: converted.data,
        mime_type,
        thumbnail,
    })
}

/// Convert a webm (video) sticker to the configured target with ffmpeg.
pub(crate) async fn convert_webm(
    data: &[u8],
    config: &AnimatedStickerConfig,
) -> Option<ConvertedSticker> {
    if !config.convert_from_webm {
        return None;
    }
    let (format, mime_type) = config.target.converter_format()?;
    if format == "webm" {
        return None;
    }

    let mut command = Command::new("ffmpeg");
    command.args(["-hide_banner", "-loglevel", "error", "-i", "pipe:0"]);
    if matches!(format, "png" | "webp") {
        command.args(["-frames:v", "1"]);
    }
    command.args(["-f", if format == "png" { "image2" } else { format }, "pipe:1"]);
    let output = run_converter(&mut command, data, "ffmpeg").await?;

    Some(ConvertedSticker {
        data: output,
        mime_type,
        thumbnail: None,
    })
}

struct RawConversion {
    data: Vec<u8>,
}

async fn run_lottieconverter(
    data: &[u8],
    format: &str,
    config: &AnimatedStickerConfig,
) -> Option<RawConversion> {
    let size = format!("{}x{}", config.args.width, config.args.height);
    let fps = config.args.fps.to_string();
    let output = run_converter(
        Command::new("lottieconverter").args(["-", "-", format, &size, &fps]),
        data,
        "lottieconverter",
    )
    .await?;
    Some(RawConversion { data: output })
}

async fn run_converter(command: &mut Command, input: &[u8], name: &str) -> Option<Vec<u8>> {
    let mut child = match command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            warn!("failed to spawn {name}: {err}");
            return None;
        }
    };

    if let Some(mut stdin) = child.stdin.take() {
        if let Err(err) = stdin.write_all(input).await {
            warn!("failed to feed {name}: {err}");
            return None;
        }
        // Closing stdin lets the converter see EOF and finish.
        drop(stdin);
    }

    match child.wait_with_output().await {
        Ok(output) if output.status.success() && !output.stdout.is_empty() => Some(output.stdout),
        Ok(output) => {
            warn!(
                "{name} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            None
        }
        Err(err) => {
            warn!("failed to wait for {name}: {err}");
            None
        }
    }
}
