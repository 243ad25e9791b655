// Copyright 2024 - developers of the `mautrix-telegram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The Telegram→Matrix media transfer pipeline.
//!
//! Downloads a Telegram file, optionally converts animated stickers,
//! uploads the result to the Matrix media repository, and caches the
//! mapping by a location ID derived from the file descriptor so the same
//! remote file is never transferred twice. Only unencrypted uploads are
//! cached; an encrypted upload is bound to one room's keys.

mod download;
mod sticker;
mod upload;

pub(crate) use download::download;
pub(crate) use upload::upload_to_telegram;

use grammers_tl_types as tl;
use log::{debug, warn};
use mautrix_bridge::{BridgeError, EncryptedFile, RoomId};
use thiserror::Error;

use crate::client::{ClientError, TelegramClient};
use crate::config::AnimatedStickerTarget;
use crate::ids::DirectMediaId;
use crate::store::{CachedFile, StoreError};
use crate::util;

pub(crate) const TGS_MIME: &str = "application/x-tgsticker";

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("download from telegram failed: {0}")]
    Download(ClientError),
    #[error("upload to telegram failed: {0}")]
    Upload(ClientError),
    #[error("telegram rejected an uploaded file part")]
    UploadRejected,
    #[error("server redirected the download to an unsupported CDN")]
    CdnRedirect,
    #[error("matrix upload failed: {0}")]
    Matrix(#[from] BridgeError),
    #[error("media cache: {0}")]
    Store(#[from] StoreError),
    #[error("file has no downloadable location")]
    NoLocation,
}

/// A downloadable Telegram file plus everything needed to derive its
/// stable cache key.
#[derive(Clone, Debug)]
pub(crate) enum FileDescriptor {
    Document(tl::types::Document),
    DocumentThumb {
        document: tl::types::Document,
        thumb_size: String,
    },
    Photo {
        photo: tl::types::Photo,
        thumb_size: String,
    },
    PeerPhoto {
        peer: tl::enums::InputPeer,
        photo_id: i64,
        big: bool,
    },
}

impl FileDescriptor {
    /// The deterministic cache key for this file.
    pub(crate) fn location_id(&self) -> String {
        match self {
            Self::Document(document) => document.id.to_string(),
            Self::DocumentThumb {
                document,
                thumb_size,
            } => format!("{}-{thumb_size}", document.id),
            Self::Photo { photo, thumb_size } => format!("{}-{thumb_size}", photo.id),
            Self::PeerPhoto { photo_id, big, .. } => {
                if *big {
                    format!("{photo_id}-big")
                } else {
                    photo_id.to_string()
                }
            }
        }
    }

    fn input_location(&self) -> tl::enums::InputFileLocation {
        match self {
            Self::Document(document) => tl::types::InputDocumentFileLocation {
                id: document.id,
                access_hash: document.access_hash,
                file_reference: document.file_reference.clone(),
                thumb_size: String::new(),
            }
            .into(),
            Self::DocumentThumb {
                document,
                thumb_size,
            } => tl::types::InputDocumentFileLocation {
                id: document.id,
                access_hash: document.access_hash,
                file_reference: document.file_reference.clone(),
                thumb_size: thumb_size.clone(),
            }
            .into(),
            Self::Photo { photo, thumb_size } => tl::types::InputPhotoFileLocation {
                id: photo.id,
                access_hash: photo.access_hash,
                file_reference: photo.file_reference.clone(),
                thumb_size: thumb_size.clone(),
            }
            .into(),
            Self::PeerPhoto {
                peer,
                photo_id,
                big,
            } => tl::types::InputPeerPhotoFileLocation {
                big: *big,
                peer: peer.clone(),
                photo_id: *photo_id,
            }
            .into(),
        }
    }

    fn dc_id(&self) -> Option<i32> {
        match self {
            Self::Document(document) | Self::DocumentThumb { document, .. } => {
                Some(document.dc_id)
            }
            Self::Photo { photo, .. } => Some(photo.dc_id),
            Self::PeerPhoto { .. } => None,
        }
    }

    fn size_hint(&self) -> Option<i64> {
        match self {
            Self::Document(document) => Some(document.size),
            Self::Photo { photo, thumb_size } => photo_size_bytes(photo, thumb_size),
            Self::DocumentThumb { .. } | Self::PeerPhoto { .. } => None,
        }
    }

    fn declared_mime(&self) -> Option<&str> {
        match self {
            Self::Document(document) => Some(document.mime_type.as_str()),
            _ => None,
        }
    }

    /// Pixel dimensions, when the descriptor knows them.
    pub(crate) fn dimensions(&self) -> Option<(i32, i32)> {
        match self {
            Self::Photo { photo, thumb_size } => photo_size_dimensions(photo, thumb_size),
            _ => None,
        }
    }
}

/// Pick the largest regular size of a photo, returning its type string.
pub(crate) fn largest_photo_size(photo: &tl::types::Photo) -> Option<String> {
    use tl::enums::PhotoSize as P;
    photo
        .sizes
        .iter()
        .filter_map(|size| match size {
            P::Size(s) => Some((s.w * s.h, s.r#type.clone())),
            P::Progressive(s) => Some((s.w * s.h, s.r#type.clone())),
            _ => None,
        })
        .max_by_key(|(area, _)| *area)
        .map(|(_, ty)| ty)
}

fn photo_size_dimensions(photo: &tl::types::Photo, thumb_size: &str) -> Option<(i32, i32)> {
    use tl::enums::PhotoSize as P;
    photo.sizes.iter().find_map(|size| match size {
        P::Size(s) if s.r#type == thumb_size => Some((s.w, s.h)),
        P::Progressive(s) if s.r#type == thumb_size => Some((s.w, s.h)),
        P::PhotoCachedSize(s) if s.r#type == thumb_size => Some((s.w, s.h)),
        _ => None,
    })
}

fn photo_size_bytes(photo: &tl::types::Photo, thumb_size: &str) -> Option<i64> {
    use tl::enums::PhotoSize as P;
    photo.sizes.iter().find_map(|size| match size {
        P::Size(s) if s.r#type == thumb_size => Some(s.size as i64),
        P::Progressive(s) if s.r#type == thumb_size => {
            s.sizes.last().map(|size| *size as i64)
        }
        _ => None,
    })
}

#[derive(Clone, Debug, Default)]
pub(crate) struct TransferOptions<'a> {
    /// Target room; encrypted rooms get encrypted uploads (and no cache).
    pub(crate) room_id: Option<&'a RoomId>,
    pub(crate) filename: Option<String>,
    /// Convert animated stickers according to the bridge config.
    pub(crate) convert_sticker: bool,
}

#[derive(Clone, Debug)]
pub(crate) struct TransferredFile {
    pub(crate) uri: String,
    pub(crate) encryption: Option<EncryptedFile>,
    pub(crate) mime_type: String,
    pub(crate) size: i64,
    pub(crate) width: Option<i32>,
    pub(crate) height: Option<i32>,
    /// Poster frame produced by sticker conversion, not yet uploaded.
    pub(crate) converted_thumbnail: Option<Vec<u8>>,
}

/// Run the full Telegram→Matrix transfer pipeline for one file.
pub(crate) async fn transfer_to_matrix(
    client: &TelegramClient,
    descriptor: &FileDescriptor,
    options: TransferOptions<'_>,
) -> Result<TransferredFile, MediaError> {
    let bridge = client.bridge();
    let location_id = descriptor.location_id();

    let encrypted = match options.room_id {
        Some(room_id) => bridge.is_room_encrypted(room_id).await,
        None => false,
    };

    if !encrypted {
        if let Some(cached) = client.store().get_file(&location_id)? {
            debug!("media cache hit for {location_id}");
            return Ok(TransferredFile {
                uri: cached.mxc,
                encryption: None,
                mime_type: cached.mime_type,
                size: cached.size,
                width: cached.width,
                height: cached.height,
                converted_thumbnail: None,
            });
        }
    }

    let (mut data, file_type) = download(
        client,
        descriptor.input_location(),
        descriptor.dc_id(),
        descriptor.size_hint(),
    )
    .await?;

    // Prefer what the file says about itself over what the server tagged,
    // and only sniff when neither knows.
    let mut mime_type = descriptor
        .declared_mime()
        .map(str::to_string)
        .or_else(|| {
            file_type
                .as_ref()
                .and_then(util::storage_file_type_mime)
                .map(str::to_string)
        })
        .unwrap_or_else(|| util::sniff_mime(&data).to_string());

    let mut converted_thumbnail = None;
    if options.convert_sticker {
        let config = &client.config().animated_sticker;
        let converted = if mime_type == TGS_MIME {
            sticker::convert_tgs(&data, config).await
        } else if mime_type == "video/webm" && config.target != AnimatedStickerTarget::Disable {
            sticker::convert_webm(&data, config).await
        } else {
            None
        };
        // A failed conversion falls back to the original bytes untouched.
        if let Some(converted) = converted {
            data = converted.data;
            mime_type = converted.mime_type.to_string();
            converted_thumbnail = converted.thumbnail;
        }
    }

    let filename = options
        .filename
        .unwrap_or_else(|| format!("file.{}", util::extension_for_mime(&mime_type)));

    let size = data.len() as i64;
    let uploaded = bridge
        .upload_media(options.room_id.filter(|_| encrypted), data, &filename, &mime_type)
        .await?;

    let (width, height) = match descriptor.dimensions() {
        Some((w, h)) => (Some(w), Some(h)),
        None => (None, None),
    };

    if !encrypted {
        let cached = CachedFile {
            id: location_id,
            mxc: uploaded.uri.clone(),
            mime_type: mime_type.clone(),
            size,
            width,
            height,
            thumbnail: matches!(
                descriptor,
                FileDescriptor::DocumentThumb { .. } | FileDescriptor::PeerPhoto { .. }
            ),
        };
        if let Err(err) = client.store().put_file(&cached) {
            // Losing a cache entry only costs a future re-upload.
            warn!("failed to persist media cache entry: {err}");
        }
    }

    Ok(TransferredFile {
        uri: uploaded.uri,
        encryption: uploaded.encryption,
        mime_type,
        size,
        width,
        height,
        converted_thumbnail,
    })
}

/// Mint a direct-media URI that the framework redeems on demand, skipping
/// the download/upload entirely.
pub(crate) fn direct_media_uri(server: &str, id: &DirectMediaId) -> String {
    format!("mxc://{server}/{}", id.encode())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn photo(id: i64) -> tl::types::Photo {
        tl::types::Photo {
            has_stickers: false,
            id,
            access_hash: 1,
            file_reference: Vec::new(),
            date: 0,
            sizes: vec![
                tl::types::PhotoSize {
                    r#type: "m".to_string(),
                    w: 320,
                    h: 240,
                    size: 500,
                }
                .into(),
                tl::types::PhotoSize {
                    r#type: "y".to_string(),
                    w: 640,
                    h: 480,
                    size: 1024,
                }
                .into(),
            ],
            video_sizes: None,
            dc_id: 2,
        }
    }

    #[test]
    fn location_ids_are_stable() {
        let descriptor = FileDescriptor::Photo {
            photo: photo(12345),
            thumb_size: "y".to_string(),
        };
        assert_eq!(descriptor.location_id(), "12345-y");

        let peer_photo = FileDescriptor::PeerPhoto {
            peer: tl::enums::InputPeer::PeerSelf,
            photo_id: 777,
            big: false,
        };
        assert_eq!(peer_photo.location_id(), "777");
    }

    #[test]
    fn largest_size_wins() {
        assert_eq!(largest_photo_size(&photo(1)), Some("y".to_string()));
    }

    #[test]
    fn photo_metadata_lookup() {
        let p = photo(1);
        assert_eq!(photo_size_dimensions(&p, "y"), Some((640, 480)));
        assert_eq!(photo_size_bytes(&p, "m"), Some(500));
        assert_eq!(photo_size_dimensions(&p, "x"), None);
    }

    #[test]
    fn direct_media_round_trip() {
        let id = DirectMediaId {
            peer_type: crate::ids::PeerType::Channel,
            chat_id: 100,
            msg_id: 42,
            thumbnail: false,
        };
        let uri = direct_media_uri("bridge.example.com", &id);
        let media_id = uri.strip_prefix("mxc://bridge.example.com/").unwrap();
        assert_eq!(DirectMediaId::decode(media_id), Ok(id));
    }
}
