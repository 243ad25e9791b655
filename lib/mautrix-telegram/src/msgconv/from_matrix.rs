// Copyright 2024 - developers of the `mautrix-telegram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Matrix → Telegram message conversion and delivery.
//!
//! A Matrix event maps to one of `messages.sendMessage`,
//! `messages.sendMedia`, `messages.editMessage`, `messages.forwardMessages`
//! or `messages.sendReaction`. The returned Telegram message ID must be
//! recorded in the bridge message table before the Matrix event is
//! acknowledged, so the echo coming back through the update stream can be
//! dropped.

use grammers_tl_types as tl;
use log::debug;
use mautrix_bridge::{MatrixMessage, MessageContent, PortalKey};

use crate::client::TelegramClient;
use crate::ids::{self, EmojiId, PeerType};
use crate::media::upload_to_telegram;
use crate::store::ScopedStore;
use crate::util::generate_random_id;

use super::ConvertError;
use super::entities::matrix_html_to_entities;

/// Extra key carrying the source message of a forward, set by clients
/// that support native forwarding through the bridge.
const FORWARD_EXTRA_KEY: &str = "fi.mau.telegram.forward";

pub(crate) struct SentMessage {
    pub(crate) id: i32,
    pub(crate) timestamp: Option<i64>,
}

/// Resolve a portal key to an addressable `InputPeer` using the login's
/// stored access hashes.
pub(crate) fn input_peer_for_portal(
    store: &ScopedStore,
    portal: &PortalKey,
) -> Result<tl::enums::InputPeer, ConvertError> {
    let (peer_type, chat_id) = ids::parse_peer(&portal.id).map_err(|err| {
        ConvertError::Operation {
            operation: "resolve portal peer",
            message: err.to_string(),
        }
    })?;
    match peer_type {
        PeerType::Chat => Ok(tl::types::InputPeerChat { chat_id }.into()),
        PeerType::User => {
            let access_hash = store
                .get_user_access_hash(chat_id)
                .map_err(ConvertError::from_store("resolve portal peer"))?
                .ok_or(ConvertError::Operation {
                    operation: "resolve portal peer",
                    message: format!("no access hash known for user {chat_id}"),
                })?;
            Ok(tl::types::InputPeerUser {
                user_id: chat_id,
                access_hash,
            }
            .into())
        }
        PeerType::Channel => {
            let access_hash = store
                .get_channel_access_hash(chat_id)
                .map_err(ConvertError::from_store("resolve portal peer"))?
                .ok_or(ConvertError::Operation {
                    operation: "resolve portal peer",
                    message: format!("no access hash known for channel {chat_id}"),
                })?;
            Ok(tl::types::InputPeerChannel {
                channel_id: chat_id,
                access_hash,
            }
            .into())
        }
    }
}

impl ConvertError {
    fn from_store(operation: &'static str) -> impl FnOnce(crate::store::StoreError) -> Self {
        move |err| Self::Operation {
            operation,
            message: err.to_string(),
        }
    }
}

/// Extract text and formatting entities from a Matrix content block,
/// resolving mention entities against the stored access hashes.
fn extract_entities(
    store: &ScopedStore,
    content: &MessageContent,
) -> (String, Option<Vec<tl::enums::MessageEntity>>) {
    let (text, entities) = match (&content.format, &content.formatted_body) {
        (Some(format), Some(html)) if format == "org.matrix.custom.html" => {
            matrix_html_to_entities(html)
        }
        _ => (content.body.clone(), Vec::new()),
    };

    let entities: Vec<tl::enums::MessageEntity> = entities
        .into_iter()
        .filter_map(|entity| match entity {
            // Sending a mention requires the target's access hash; without
            // one the pill degrades to its plain text.
            tl::enums::MessageEntity::MentionName(e) => {
                match store.get_user_access_hash(e.user_id) {
                    Ok(Some(access_hash)) => Some(
                        tl::types::InputMessageEntityMentionName {
                            offset: e.offset,
                            length: e.length,
                            user_id: tl::types::InputUser {
                                user_id: e.user_id,
                                access_hash,
                            }
                            .into(),
                        }
                        .into(),
                    ),
                    _ => {
                        debug!("dropping mention of {}: no access hash", e.user_id);
                        None
                    }
                }
            }
            entity => Some(entity),
        })
        .collect();

    (text, if entities.is_empty() { None } else { Some(entities) })
}

fn reply_to_for(msg: &MatrixMessage) -> Result<Option<tl::enums::InputReplyTo>, ConvertError> {
    let Some(reply_to) = &msg.reply_to else {
        return Ok(None);
    };
    let parsed = ids::parse_message_id(reply_to.as_str())
        .map_err(|_| ConvertError::UnknownReplyTarget(reply_to.to_string()))?;
    Ok(Some(
        tl::types::InputReplyToMessage {
            reply_to_msg_id: parsed.msg_id,
            top_msg_id: None,
            reply_to_peer_id: None,
            quote_text: None,
            quote_entities: None,
            quote_offset: None,
            monoforum_peer_id: None,
            todo_item_id: None,
        }
        .into(),
    ))
}

/// Deliver a Matrix message to Telegram, returning the assigned message
/// ID.
pub(crate) async fn send_to_telegram(
    client: &TelegramClient,
    msg: &MatrixMessage,
) -> Result<SentMessage, ConvertError> {
    let store = client.store();
    let peer = input_peer_for_portal(store, &msg.portal)?;

    if let Some(forward_source) = msg.content.extra.get(FORWARD_EXTRA_KEY) {
        if let Some(source) = forward_source.as_str() {
            return forward_to_telegram(client, peer, source).await;
        }
    }

    let (text, entities) = extract_entities(store, &msg.content);
    let reply_to = reply_to_for(msg)?;
    let random_id = generate_random_id();

    let updates = match msg.content.msgtype.as_str() {
        "" | "m.text" | "m.notice" | "m.emote" => {
            client
                .invoke(&tl::functions::messages::SendMessage {
                    no_webpage: false,
                    silent: false,
                    background: false,
                    clear_draft: false,
                    peer,
                    reply_to,
                    message: text,
                    random_id,
                    reply_markup: None,
                    entities,
                    schedule_date: None,
                    schedule_repeat_period: None,
                    send_as: None,
                    noforwards: false,
                    update_stickersets_order: false,
                    invert_media: false,
                    quick_reply_shortcut: None,
                    effect: None,
                    allow_paid_floodskip: false,
                    allow_paid_stars: None,
                    suggested_post: None,
                })
                .await?
        }
        _ => {
            // The body of a media event is its caption only when the
            // filename is carried separately; otherwise it's just the
            // filename and must not be sent as text.
            let (caption, caption_entities) = if msg.content.filename.is_some() {
                (text, entities)
            } else {
                (String::new(), None)
            };
            let media = upload_matrix_media(client, msg).await?;
            client
                .invoke(&tl::functions::messages::SendMedia {
                    silent: false,
                    background: false,
                    clear_draft: false,
                    peer,
                    reply_to,
                    media,
                    message: caption,
                    random_id,
                    reply_markup: None,
                    entities: caption_entities,
                    schedule_date: None,
                    schedule_repeat_period: None,
                    send_as: None,
                    noforwards: false,
                    update_stickersets_order: false,
                    invert_media: false,
                    quick_reply_shortcut: None,
                    effect: None,
                    allow_paid_floodskip: false,
                    allow_paid_stars: None,
                    suggested_post: None,
                })
                .await?
        }
    };

    extract_sent_message(&updates, random_id).ok_or(ConvertError::Operation {
        operation: "send message",
        message: "response did not contain the new message ID".to_string(),
    })
}

/// Apply a Matrix edit to the Telegram message it targets.
pub(crate) async fn edit_on_telegram(
    client: &TelegramClient,
    msg: &MatrixMessage,
    target_msg_id: i32,
) -> Result<(), ConvertError> {
    let store = client.store();
    let peer = input_peer_for_portal(store, &msg.portal)?;
    let (text, entities) = extract_entities(store, &msg.content);

    client
        .invoke(&tl::functions::messages::EditMessage {
            no_webpage: false,
            invert_media: false,
            peer,
            id: target_msg_id,
            message: Some(text),
            media: None,
            reply_markup: None,
            entities,
            schedule_date: None,
            schedule_repeat_period: None,
            quick_reply_shortcut_id: None,
        })
        .await?;
    Ok(())
}

/// Add or retract a reaction.
pub(crate) async fn react_on_telegram(
    client: &TelegramClient,
    portal: &PortalKey,
    target_msg_id: i32,
    emoji: Option<&str>,
) -> Result<(), ConvertError> {
    let peer = input_peer_for_portal(client.store(), portal)?;
    let reaction = emoji.map(|emoji| match EmojiId::parse(emoji) {
        EmojiId::CustomEmoji(document_id) => {
            vec![tl::enums::Reaction::CustomEmoji(
                tl::types::ReactionCustomEmoji { document_id },
            )]
        }
        EmojiId::Unicode(emoticon) => {
            vec![tl::enums::Reaction::Emoji(tl::types::ReactionEmoji {
                emoticon,
            })]
        }
    });

    client
        .invoke(&tl::functions::messages::SendReaction {
            big: false,
            add_to_recent: false,
            peer,
            msg_id: target_msg_id,
            reaction,
        })
        .await?;
    Ok(())
}

async fn forward_to_telegram(
    client: &TelegramClient,
    to_peer: tl::enums::InputPeer,
    source: &str,
) -> Result<SentMessage, ConvertError> {
    let bridge = client.bridge();
    let source_id = mautrix_bridge::MessageId::new(source);
    let original = bridge
        .get_message_by_remote_id(client.login_id(), None, &source_id)
        .await
        .map_err(|err| ConvertError::Operation {
            operation: "forward message",
            message: err.to_string(),
        })?
        .ok_or(ConvertError::Operation {
            operation: "forward message",
            message: format!("source message {source} is not bridged"),
        })?;

    let parsed = ids::parse_message_id(source_id.as_str()).map_err(|err| {
        ConvertError::Operation {
            operation: "forward message",
            message: err.to_string(),
        }
    })?;
    let from_peer = input_peer_for_portal(client.store(), &original.portal)?;
    let random_id = generate_random_id();

    let updates = client
        .invoke(&tl::functions::messages::ForwardMessages {
            silent: false,
            background: false,
            with_my_score: false,
            drop_author: false,
            drop_media_captions: false,
            noforwards: false,
            allow_paid_floodskip: false,
            from_peer,
            id: vec![parsed.msg_id],
            random_id: vec![random_id],
            to_peer,
            top_msg_id: None,
            reply_to: None,
            schedule_date: None,
            schedule_repeat_period: None,
            send_as: None,
            quick_reply_shortcut: None,
            video_timestamp: None,
            allow_paid_stars: None,
            suggested_post: None,
        })
        .await?;

    extract_sent_message(&updates, random_id).ok_or(ConvertError::Operation {
        operation: "forward message",
        message: "response did not contain the new message ID".to_string(),
    })
}

async fn upload_matrix_media(
    client: &TelegramClient,
    msg: &MatrixMessage,
) -> Result<tl::enums::InputMedia, ConvertError> {
    let content = &msg.content;
    let uri = content
        .url
        .clone()
        .or_else(|| content.file.as_ref().map(|file| file.url.clone()))
        .ok_or(ConvertError::Operation {
            operation: "upload media",
            message: "media event carries no content URI".to_string(),
        })?;

    let data = client
        .bridge()
        .download_media(&uri, content.file.as_ref())
        .await
        .map_err(|err| ConvertError::Operation {
            operation: "upload media",
            message: err.to_string(),
        })?;

    let filename = content
        .filename
        .clone()
        .unwrap_or_else(|| content.body.clone());
    let mime_type = content
        .info
        .as_ref()
        .and_then(|info| info.mimetype.clone())
        .unwrap_or_else(|| crate::util::sniff_mime(&data).to_string());

    let file = upload_to_telegram(client, &data, &filename).await?;

    // Plain photos become Telegram photos; everything else is a document
    // with attributes derived from the Matrix info block.
    if content.msgtype == "m.image" && matches!(mime_type.as_str(), "image/jpeg" | "image/png") {
        return Ok(tl::types::InputMediaUploadedPhoto {
            spoiler: false,
            file,
            stickers: None,
            ttl_seconds: None,
        }
        .into());
    }

    let mut attributes = vec![
        tl::enums::DocumentAttribute::Filename(tl::types::DocumentAttributeFilename {
            file_name: filename,
        }),
    ];
    let info = content.info.as_ref();
    match content.msgtype.as_str() {
        "m.video" => {
            attributes.push(
                tl::types::DocumentAttributeVideo {
                    round_message: false,
                    supports_streaming: true,
                    nosound: false,
                    duration: info
                        .and_then(|info| info.duration)
                        .map(|ms| ms as f64 / 1000.0)
                        .unwrap_or(0.0),
                    w: info.and_then(|info| info.width).unwrap_or(0),
                    h: info.and_then(|info| info.height).unwrap_or(0),
                    preload_prefix_size: None,
                    video_start_ts: None,
                    video_codec: None,
                }
                .into(),
            );
        }
        "m.audio" => {
            let voice = content.extra.contains_key("org.matrix.msc3245.voice");
            attributes.push(
                tl::types::DocumentAttributeAudio {
                    voice,
                    duration: info
                        .and_then(|info| info.duration)
                        .map(|ms| ms / 1000)
                        .unwrap_or(0),
                    title: None,
                    performer: None,
                    waveform: None,
                }
                .into(),
            );
        }
        _ => {}
    }

    Ok(tl::types::InputMediaUploadedDocument {
        nosound_video: false,
        force_file: content.msgtype == "m.file",
        spoiler: false,
        file,
        thumb: None,
        mime_type,
        attributes,
        stickers: None,
        video_cover: None,
        video_timestamp: None,
        ttl_seconds: None,
    }
    .into())
}

/// Dig the newly-assigned message ID out of a send response.
fn extract_sent_message(updates: &tl::enums::Updates, random_id: i64) -> Option<SentMessage> {
    match updates {
        tl::enums::Updates::UpdateShortSentMessage(short) => Some(SentMessage {
            id: short.id,
            timestamp: Some(short.date as i64),
        }),
        tl::enums::Updates::Updates(container) => {
            find_message_id(&container.updates, random_id).map(|id| SentMessage {
                id,
                timestamp: Some(container.date as i64),
            })
        }
        tl::enums::Updates::Combined(container) => {
            find_message_id(&container.updates, random_id).map(|id| SentMessage {
                id,
                timestamp: Some(container.date as i64),
            })
        }
        _ => None,
    }
}

fn find_message_id(updates: &[tl::enums::Update], random_id: i64) -> Option<i32> {
    updates.iter().find_map(|update| match update {
        tl::enums::Update::MessageId(u) if u.random_id == random_id => Some(u.id),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[test]
    fn peer_resolution_requires_access_hash() {
        let store = Store::open(":memory:").unwrap().scoped(1);
        let portal = PortalKey::global("channel:100");
        // Unknown hash is an error that names the operation.
        let err = input_peer_for_portal(&store, &portal).unwrap_err();
        assert!(err.to_string().contains("resolve portal peer"));

        store.set_channel_access_hash(100, -42).unwrap();
        match input_peer_for_portal(&store, &portal).unwrap() {
            tl::enums::InputPeer::Channel(peer) => {
                assert_eq!(peer.channel_id, 100);
                assert_eq!(peer.access_hash, -42);
            }
            other => panic!("unexpected peer {other:?}"),
        }
    }

    #[test]
    fn basic_chats_need_no_hash() {
        let store = Store::open(":memory:").unwrap().scoped(1);
        let portal = PortalKey::new("chat:55", "1");
        match input_peer_for_portal(&store, &portal).unwrap() {
            tl::enums::InputPeer::Chat(peer) => assert_eq!(peer.chat_id, 55),
            other => panic!("unexpected peer {other:?}"),
        }
    }

    #[test]
    fn sent_message_extraction() {
        let updates = tl::enums::Updates::Updates(tl::types::Updates {
            updates: vec![
                tl::types::UpdateMessageId {
                    id: 42,
                    random_id: 7,
                }
                .into(),
            ],
            users: Vec::new(),
            chats: Vec::new(),
            date: 1700000000,
            seq: 0,
        });
        let sent = extract_sent_message(&updates, 7).unwrap();
        assert_eq!(sent.id, 42);
        assert_eq!(sent.timestamp, Some(1700000000));
        assert!(extract_sent_message(&updates, 8).is_none());
    }
}
