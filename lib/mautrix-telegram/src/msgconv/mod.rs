// Copyright 2024 - developers of the `mautrix-telegram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Message conversion between Telegram and Matrix.

pub(crate) mod entities;
pub(crate) mod from_matrix;
pub(crate) mod to_matrix;

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::client::ClientError;
use crate::media::MediaError;

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("media transfer failed: {0}")]
    Media(#[from] MediaError),
    #[error("{0}")]
    Client(#[from] ClientError),
    #[error("message has no convertible content")]
    Empty,
    #[error("unknown reply target {0}")]
    UnknownReplyTarget(String),
    #[error("{operation} failed: {message}")]
    Operation {
        operation: &'static str,
        message: String,
    },
}

/// Hash over a message's remote content, used to detect no-op edits.
///
/// Only the text and a stable identifier of the media enter the hash;
/// anything timestamp-like would defeat idempotence.
pub(crate) fn content_hash(text: &str, media_id: Option<i64>) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    if let Some(media_id) = media_id {
        hasher.update(media_id.to_le_bytes());
    }
    hasher.finalize().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_stable() {
        assert_eq!(content_hash("hi", Some(7)), content_hash("hi", Some(7)));
        assert_ne!(content_hash("hi", Some(7)), content_hash("hi", Some(8)));
        assert_ne!(content_hash("hi", None), content_hash("hi!", None));
    }
}
