// Copyright 2024 - developers of the `mautrix-telegram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Telegram → Matrix message conversion.
//!
//! One Telegram message becomes an ordered list of Matrix event parts: a
//! text part for the message body (if any) and a media part for the
//! attachment (if any). Media dispatch is a closed match over the
//! `MessageMedia` variants; anything unknown becomes a tagged notice so
//! nothing is silently dropped.

use std::collections::HashMap;
use std::time::Duration;

use grammers_tl_types as tl;
use log::{debug, warn};
use mautrix_bridge::{
    ConvertedMessage, ConvertedMessagePart, DisappearingSetting, DisappearingType, EventType,
    FileInfo, MessageContent, PortalKey, RoomId,
};
use serde_json::json;

use crate::client::TelegramClient;
use crate::ids::{self, PeerType};
use crate::media::{
    self, FileDescriptor, TransferOptions, TransferredFile, largest_photo_size,
};
use crate::updates::adaptor::ShortMessage;

use super::entities::entities_to_matrix_html;
use super::{ConvertError, content_hash};

/// Everything a single conversion needs to know about its surroundings.
pub(crate) struct ConvertContext<'a> {
    pub(crate) client: &'a TelegramClient,
    pub(crate) portal: &'a PortalKey,
    /// The portal's Matrix room, when one exists already (controls media
    /// encryption).
    pub(crate) room_id: Option<RoomId>,
    /// Channel the message lives in, for the message-ID codec.
    pub(crate) channel_id: Option<i64>,
    /// Peers attached to the update envelope, for mention rendering.
    pub(crate) users: &'a HashMap<i64, tl::types::User>,
    /// Merge a caption into the media event instead of emitting two
    /// parts.
    pub(crate) merge_caption: bool,
}

/// Convert a full `message` constructor.
pub(crate) async fn telegram_to_matrix(
    ctx: &ConvertContext<'_>,
    msg: &tl::types::Message,
) -> Result<ConvertedMessage, ConvertError> {
    let mut parts = Vec::new();

    let entities = msg.entities.clone().unwrap_or_default();
    let custom_emojis = resolve_custom_emojis(
        ctx.client,
        entities.iter().filter_map(|entity| match entity {
            tl::enums::MessageEntity::CustomEmoji(e) => Some(e.document_id),
            _ => None,
        }),
    )
    .await;

    let mut media_id = None;
    if !msg.message.is_empty() {
        let mut content = MessageContent::text(msg.message.clone());
        if let Some(html) = entities_to_matrix_html(&msg.message, &entities, &custom_emojis) {
            content = content.with_html(html);
        }
        if let Some(tl::enums::MessageMedia::WebPage(web)) = &msg.media {
            attach_link_preview(ctx, &mut content, web).await;
        }
        parts.push(ConvertedMessagePart {
            part_id: String::new(),
            event_type: EventType::RoomMessage,
            content,
        });
    }

    // Self-destructing media carries its timer on the media object, not
    // the message.
    let ttl = msg.ttl_period.or_else(|| match &msg.media {
        Some(tl::enums::MessageMedia::Photo(photo)) => photo.ttl_seconds,
        Some(tl::enums::MessageMedia::Document(document)) => document.ttl_seconds,
        _ => None,
    });
    if let Some(media) = &msg.media {
        match convert_media(ctx, msg, media, ttl).await {
            Ok(Some((part, id))) => {
                media_id = id;
                parts.push(part);
            }
            Ok(None) => {}
            Err(err) if parts.is_empty() => return Err(err),
            Err(err) => {
                // The text part can still be delivered on its own.
                warn!("dropping media part of message {}: {err}", msg.id);
            }
        }
    }

    if parts.is_empty() {
        return Err(ConvertError::Empty);
    }

    if ctx.merge_caption {
        merge_caption_parts(&mut parts);
    }

    let reply_to = match &msg.reply_to {
        Some(tl::enums::MessageReplyHeader::Header(header)) => header
            .reply_to_msg_id
            .map(|id| ids::format_message_id(ctx.channel_id, id)),
        _ => None,
    };

    Ok(ConvertedMessage {
        parts,
        reply_to,
        disappear: ttl.map(|seconds| DisappearingSetting {
            kind: DisappearingType::AfterSend,
            timer: Duration::from_secs(seconds as u64),
        }),
        content_hash: content_hash(&msg.message, media_id),
    })
}

/// Convert a text-only message that arrived as `updateShortMessage`.
pub(crate) fn short_to_matrix(short: &ShortMessage) -> ConvertedMessage {
    let mut content = MessageContent::text(short.message.clone());
    if let Some(html) = entities_to_matrix_html(&short.message, &short.entities, &HashMap::new())
    {
        content = content.with_html(html);
    }
    ConvertedMessage {
        parts: vec![ConvertedMessagePart {
            part_id: String::new(),
            event_type: EventType::RoomMessage,
            content,
        }],
        reply_to: short
            .reply_to_msg_id
            .map(|id| ids::format_message_id(None, id)),
        disappear: short.ttl_period.map(|seconds| DisappearingSetting {
            kind: DisappearingType::AfterSend,
            timer: Duration::from_secs(seconds as u64),
        }),
        content_hash: content_hash(&short.message, None),
    }
}

/// Resolve custom emoji documents to `mxc://` URIs through the media
/// pipeline. Failures drop the affected emoji back to its alt text.
pub(crate) async fn resolve_custom_emojis(
    client: &TelegramClient,
    document_ids: impl Iterator<Item = i64>,
) -> HashMap<i64, String> {
    let mut wanted: Vec<i64> = document_ids.collect();
    wanted.sort_unstable();
    wanted.dedup();
    if wanted.is_empty() {
        return HashMap::new();
    }

    let documents = match client
        .invoke(&tl::functions::messages::GetCustomEmojiDocuments {
            document_id: wanted,
        })
        .await
    {
        Ok(documents) => documents,
        Err(err) => {
            warn!("failed to fetch custom emoji documents: {err}");
            return HashMap::new();
        }
    };

    let mut resolved = HashMap::with_capacity(documents.len());
    for document in documents {
        let tl::enums::Document::Document(document) = document else {
            continue;
        };
        let id = document.id;
        let descriptor = FileDescriptor::Document(document);
        match media::transfer_to_matrix(client, &descriptor, TransferOptions::default()).await {
            Ok(file) => {
                resolved.insert(id, file.uri);
            }
            Err(err) => warn!("failed to transfer custom emoji {id}: {err}"),
        }
    }
    resolved
}

/// Resolve a single reaction to `(emoji_id, rendered emoji)`.
///
/// Unicode reactions pass through; custom emoji reactions render as the
/// transferred `mxc://` URI.
pub(crate) async fn resolve_reaction(
    client: &TelegramClient,
    reaction: &tl::enums::Reaction,
) -> Option<(String, String)> {
    match reaction {
        tl::enums::Reaction::Emoji(r) => Some((r.emoticon.clone(), r.emoticon.clone())),
        tl::enums::Reaction::CustomEmoji(r) => {
            let resolved =
                resolve_custom_emojis(client, std::iter::once(r.document_id)).await;
            let uri = resolved.get(&r.document_id)?.clone();
            Some((r.document_id.to_string(), uri))
        }
        _ => None,
    }
}

async fn convert_media(
    ctx: &ConvertContext<'_>,
    msg: &tl::types::Message,
    media: &tl::enums::MessageMedia,
    ttl: Option<i32>,
) -> Result<Option<(ConvertedMessagePart, Option<i64>)>, ConvertError> {
    use tl::enums::MessageMedia as M;

    match media {
        M::Photo(photo_media) => {
            let Some(tl::enums::Photo::Photo(photo)) = &photo_media.photo else {
                return Ok(None);
            };
            let part = convert_photo(ctx, msg, photo, photo_media.spoiler, ttl).await?;
            Ok(Some((part, Some(photo.id))))
        }
        M::Document(document_media) => {
            let Some(tl::enums::Document::Document(document)) = &document_media.document else {
                return Ok(None);
            };
            let part =
                convert_document(ctx, msg, document, document_media.spoiler, ttl).await?;
            Ok(Some((part, Some(document.id))))
        }
        M::Contact(contact) => Ok(Some((convert_contact(ctx, contact), None))),
        M::Geo(geo) => Ok(match &geo.geo {
            tl::enums::GeoPoint::Point(point) => {
                Some((convert_location(point, None, None), None))
            }
            tl::enums::GeoPoint::Empty => None,
        }),
        M::GeoLive(live) => Ok(match &live.geo {
            tl::enums::GeoPoint::Point(point) => Some((
                convert_location(point, Some("Live location"), None),
                None,
            )),
            tl::enums::GeoPoint::Empty => None,
        }),
        M::Venue(venue) => Ok(match &venue.geo {
            tl::enums::GeoPoint::Point(point) => Some((
                convert_location(point, Some(&venue.title), Some(&venue.venue_id)),
                None,
            )),
            tl::enums::GeoPoint::Empty => None,
        }),
        M::Poll(poll) => Ok(Some((convert_poll(poll), None))),
        M::Dice(dice) => Ok(Some((convert_dice(dice), None))),
        M::Game(game) => {
            let tl::enums::Game::Game(game) = &game.game;
            let mut content = MessageContent::notice(format!("Game: {}", game.title));
            content.set_extra("fi.mau.telegram.game", json!({"id": game.id}));
            Ok(Some((notice_part(content), None)))
        }
        // Attached to the text part separately; no media part of its own.
        M::WebPage(_) => Ok(None),
        M::Unsupported => Ok(Some((unsupported_part("unsupported media"), None))),
        M::Story(_) => Ok(Some((unsupported_part("story"), None))),
        M::Invoice(_) => Ok(Some((unsupported_part("invoice"), None))),
        M::Giveaway(_) => Ok(Some((unsupported_part("giveaway"), None))),
        M::GiveawayResults(_) => Ok(Some((unsupported_part("giveaway results"), None))),
        M::Empty => Ok(None),
        other => {
            debug!("unhandled media kind {other:?}");
            Ok(Some((unsupported_part("unknown media"), None)))
        }
    }
}

async fn convert_photo(
    ctx: &ConvertContext<'_>,
    msg: &tl::types::Message,
    photo: &tl::types::Photo,
    spoiler: bool,
    ttl: Option<i32>,
) -> Result<ConvertedMessagePart, ConvertError> {
    let thumb_size = largest_photo_size(photo).unwrap_or_else(|| "y".to_string());
    let descriptor = FileDescriptor::Photo {
        photo: photo.clone(),
        thumb_size,
    };

    let file = transfer_or_direct(ctx, msg, &descriptor, None).await?;
    let filename = format!(
        "{}image.{}",
        disappearing_prefix(ttl),
        crate::util::extension_for_mime(&file.mime_type)
    );

    let mut content = file_content("m.image", &file, &filename);
    apply_spoiler(&mut content, spoiler);
    Ok(ConvertedMessagePart {
        part_id: String::new(),
        event_type: EventType::RoomMessage,
        content,
    })
}

/// What a document's attributes say it is.
#[derive(Default)]
struct DocumentTraits {
    filename: Option<String>,
    video: Option<tl::types::DocumentAttributeVideo>,
    audio: Option<tl::types::DocumentAttributeAudio>,
    sticker: Option<tl::types::DocumentAttributeSticker>,
    animated: bool,
    image_size: Option<(i32, i32)>,
}

fn document_traits(document: &tl::types::Document) -> DocumentTraits {
    let mut traits = DocumentTraits::default();
    for attribute in &document.attributes {
        use tl::enums::DocumentAttribute as A;
        match attribute {
            A::Filename(a) => traits.filename = Some(a.file_name.clone()),
            A::Video(a) => traits.video = Some(a.clone()),
            A::Audio(a) => traits.audio = Some(a.clone()),
            A::Sticker(a) => traits.sticker = Some(a.clone()),
            A::Animated => traits.animated = true,
            A::ImageSize(a) => traits.image_size = Some((a.w, a.h)),
            _ => {}
        }
    }
    traits
}

async fn convert_document(
    ctx: &ConvertContext<'_>,
    msg: &tl::types::Message,
    document: &tl::types::Document,
    spoiler: bool,
    ttl: Option<i32>,
) -> Result<ConvertedMessagePart, ConvertError> {
    let traits = document_traits(document);
    let is_sticker = traits.sticker.is_some();

    let descriptor = FileDescriptor::Document(document.clone());
    let file = transfer_or_direct(ctx, msg, &descriptor, Some(is_sticker)).await?;

    let base_name = traits.filename.clone().unwrap_or_else(|| {
        format!("file.{}", crate::util::extension_for_mime(&file.mime_type))
    });
    let filename = format!("{}{base_name}", disappearing_prefix(ttl));

    let mut info_width = traits.image_size.map(|(w, _)| w);
    let mut info_height = traits.image_size.map(|(_, h)| h);
    let mut duration = None;
    if let Some(video) = &traits.video {
        info_width = Some(video.w);
        info_height = Some(video.h);
        duration = Some((video.duration * 1000.0) as i32);
    }
    if let Some(audio) = &traits.audio {
        duration = Some(audio.duration * 1000);
    }

    let (event_type, mut content) = if let Some(sticker_attrs) = &traits.sticker {
        convert_sticker_content(document, sticker_attrs, &traits, &file, &filename)
    } else if traits.animated || file.mime_type == "image/gif" {
        let mut content = file_content("m.video", &file, &filename);
        for key in [
            "fi.mau.telegram.gif",
            "fi.mau.gif",
            "fi.mau.loop",
            "fi.mau.autoplay",
            "fi.mau.hide_controls",
            "fi.mau.no_audio",
        ] {
            content.set_extra(key, json!(true));
        }
        (EventType::RoomMessage, content)
    } else if traits.video.is_some() {
        (EventType::RoomMessage, file_content("m.video", &file, &filename))
    } else if let Some(audio) = &traits.audio {
        let mut content = file_content("m.audio", &file, &filename);
        let duration_ms = audio.duration * 1000;
        let mut audio_block = serde_json::Map::new();
        audio_block.insert("duration".to_string(), json!(duration_ms));
        if let Some(waveform) = &audio.waveform {
            audio_block.insert("waveform".to_string(), json!(decode_waveform(waveform)));
        }
        content.set_extra(
            "org.matrix.msc1767.audio",
            serde_json::Value::Object(audio_block),
        );
        if audio.voice {
            content.set_extra("org.matrix.msc3245.voice", json!({}));
        } else {
            if let (Some(performer), Some(title)) = (&audio.performer, &audio.title) {
                content.body = format!("{performer} - {title}");
            }
        }
        (EventType::RoomMessage, content)
    } else if file.mime_type.starts_with("image/") {
        (EventType::RoomMessage, file_content("m.image", &file, &filename))
    } else {
        (EventType::RoomMessage, file_content("m.file", &file, &filename))
    };

    if let Some(info) = &mut content.info {
        info.width = info.width.or(info_width);
        info.height = info.height.or(info_height);
        info.duration = duration;
    }

    attach_thumbnail(ctx, document, &file, &mut content).await;
    apply_spoiler(&mut content, spoiler);
    Ok(ConvertedMessagePart {
        part_id: String::new(),
        event_type,
        content,
    })
}

/// Upload and embed a thumbnail: the poster frame produced by sticker
/// conversion if there is one, otherwise the document's own largest
/// server-side thumb. Failures just leave the thumbnail out.
async fn attach_thumbnail(
    ctx: &ConvertContext<'_>,
    document: &tl::types::Document,
    file: &TransferredFile,
    content: &mut MessageContent,
) {
    let uploaded = if let Some(poster) = &file.converted_thumbnail {
        match ctx
            .client
            .bridge()
            .upload_media(None, poster.clone(), "thumbnail.png", "image/png")
            .await
        {
            Ok(uploaded) => Some((uploaded.uri, None, "image/png".to_string(), None)),
            Err(err) => {
                warn!("failed to upload sticker thumbnail: {err}");
                None
            }
        }
    } else if let Some(thumb_size) = document.thumbs.as_ref().and_then(largest_thumb_type) {
        let descriptor = FileDescriptor::DocumentThumb {
            document: document.clone(),
            thumb_size,
        };
        match media::transfer_to_matrix(
            ctx.client,
            &descriptor,
            TransferOptions {
                room_id: ctx.room_id.as_ref(),
                ..Default::default()
            },
        )
        .await
        {
            Ok(thumb) => Some((
                thumb.uri,
                thumb.encryption,
                thumb.mime_type,
                Some((thumb.size, thumb.width, thumb.height)),
            )),
            Err(err) => {
                warn!("failed to transfer thumbnail of document {}: {err}", document.id);
                None
            }
        }
    } else {
        None
    };

    let Some((uri, encryption, mime_type, metadata)) = uploaded else {
        return;
    };
    let info = content.info.get_or_insert_with(Default::default);
    match encryption {
        Some(encryption) => info.thumbnail_file = Some(encryption),
        None => info.thumbnail_url = Some(uri),
    }
    let mut thumb_info = FileInfo {
        mimetype: Some(mime_type),
        ..Default::default()
    };
    if let Some((size, width, height)) = metadata {
        thumb_info.size = Some(size);
        thumb_info.width = width;
        thumb_info.height = height;
    }
    info.thumbnail_info = Some(Box::new(thumb_info));
}

/// Largest regular photo-size among a document's thumbs.
fn largest_thumb_type(thumbs: &Vec<tl::enums::PhotoSize>) -> Option<String> {
    use tl::enums::PhotoSize as P;
    thumbs
        .iter()
        .filter_map(|size| match size {
            P::Size(s) => Some((s.w * s.h, s.r#type.clone())),
            P::Progressive(s) => Some((s.w * s.h, s.r#type.clone())),
            _ => None,
        })
        .max_by_key(|(area, _)| *area)
        .map(|(_, ty)| ty)
}

fn convert_sticker_content(
    document: &tl::types::Document,
    attrs: &tl::types::DocumentAttributeSticker,
    traits: &DocumentTraits,
    file: &TransferredFile,
    filename: &str,
) -> (EventType, MessageContent) {
    let alt = if attrs.alt.is_empty() {
        "sticker".to_string()
    } else {
        attrs.alt.clone()
    };

    // A sticker converted to webm can only render as a video event.
    let (event_type, mut content) = if file.mime_type == "video/webm" {
        let mut content = file_content("m.video", file, filename);
        content.set_extra("fi.mau.loop", json!(true));
        content.set_extra("fi.mau.autoplay", json!(true));
        content.set_extra("fi.mau.hide_controls", json!(true));
        content.set_extra("fi.mau.no_audio", json!(true));
        (EventType::RoomMessage, content)
    } else {
        let mut content = file_content("", file, &alt);
        content.body = alt.clone();
        (EventType::Sticker, content)
    };

    let pack = match &attrs.stickerset {
        tl::enums::InputStickerSet::Id(set) => {
            Some(json!({"id": set.id.to_string(), "access_hash": set.access_hash.to_string()}))
        }
        tl::enums::InputStickerSet::ShortName(set) => {
            Some(json!({"short_name": set.short_name}))
        }
        _ => None,
    };
    let mut sticker_extra = serde_json::Map::new();
    sticker_extra.insert("alt".to_string(), json!(alt));
    sticker_extra.insert("id".to_string(), json!(document.id.to_string()));
    if let Some(pack) = pack {
        sticker_extra.insert("pack".to_string(), pack);
    }
    content.set_extra(
        "fi.mau.telegram.sticker",
        serde_json::Value::Object(sticker_extra),
    );
    if traits.animated || document.mime_type == crate::media::TGS_MIME {
        content.set_extra("fi.mau.telegram.animated_sticker", json!(true));
    }

    (event_type, content)
}

fn convert_contact(
    ctx: &ConvertContext<'_>,
    contact: &tl::types::MessageMediaContact,
) -> ConvertedMessagePart {
    let name = [contact.first_name.as_str(), contact.last_name.as_str()]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(" ");
    let phone = format!("+{}", contact.phone_number.trim_start_matches('+'));

    let body = format!("Shared contact info for {name}: {phone}");
    let html = if contact.user_id != 0 && ctx.users.contains_key(&contact.user_id) {
        Some(format!(
            "Shared contact info for \
             <a href=\"https://matrix.to/#/@telegram_{}\">{name}</a>: {phone}",
            contact.user_id
        ))
    } else {
        None
    };

    let mut content = MessageContent::text(body);
    if let Some(html) = html {
        content = content.with_html(html);
    }
    content.set_extra(
        "fi.mau.telegram.contact",
        json!({
            "user_id": contact.user_id,
            "first_name": contact.first_name,
            "last_name": contact.last_name,
            "phone_number": contact.phone_number,
            "vcard": contact.vcard,
        }),
    );
    ConvertedMessagePart {
        part_id: String::new(),
        event_type: EventType::RoomMessage,
        content,
    }
}

fn convert_location(
    point: &tl::types::GeoPoint,
    description: Option<&str>,
    venue_id: Option<&str>,
) -> ConvertedMessagePart {
    let uri = format!("geo:{},{}", point.lat, point.long);
    let body = description.unwrap_or("Location").to_string();

    let mut content = MessageContent {
        msgtype: "m.location".to_string(),
        body: format!("{body} ({}, {})", point.lat, point.long),
        ..Default::default()
    };
    content.set_extra("geo_uri", json!(uri));
    content.set_extra(
        "org.matrix.msc3488.location",
        json!({"uri": uri, "description": body}),
    );
    if let Some(venue_id) = venue_id {
        content.set_extra("fi.mau.telegram.venue_id", json!(venue_id));
    }
    ConvertedMessagePart {
        part_id: String::new(),
        event_type: EventType::RoomMessage,
        content,
    }
}

fn convert_poll(poll_media: &tl::types::MessageMediaPoll) -> ConvertedMessagePart {
    let tl::enums::Poll::Poll(poll) = &poll_media.poll;
    let tl::enums::TextWithEntities::Entities(question) = &poll.question;

    let mut body = format!("Poll: {}", question.text);
    for (i, answer) in poll.answers.iter().enumerate() {
        let tl::enums::PollAnswer::Answer(answer) = answer;
        let tl::enums::TextWithEntities::Entities(text) = &answer.text;
        body.push_str(&format!("\n{}. {}", i + 1, text.text));
    }
    body.push_str("\n\nVoting is not supported from Matrix.");

    notice_part(MessageContent::notice(body))
}

fn convert_dice(dice: &tl::types::MessageMediaDice) -> ConvertedMessagePart {
    let decoded = decode_dice(&dice.emoticon, dice.value);
    let mut content = MessageContent::text(format!("{} {decoded}", dice.emoticon));
    content.set_extra(
        "fi.mau.telegram.dice",
        json!({"emoticon": dice.emoticon, "value": dice.value}),
    );
    ConvertedMessagePart {
        part_id: String::new(),
        event_type: EventType::RoomMessage,
        content,
    }
}

/// Render a dice roll result the way official clients describe them.
fn decode_dice(emoticon: &str, value: i32) -> String {
    match emoticon {
        "🎰" => {
            // Values 1..=64 encode three reels of four symbols each.
            const REELS: [&str; 4] = ["bar", "berries", "lemon", "seven"];
            let v = (value - 1).clamp(0, 63) as usize;
            format!(
                "{} {} {}",
                REELS[v & 0b11],
                REELS[(v >> 2) & 0b11],
                REELS[(v >> 4) & 0b11]
            )
        }
        "🎳" => match value {
            1 => "miss".to_string(),
            2..=5 => format!("{} pins down", value - 1),
            6 => "strike 🎉".to_string(),
            _ => value.to_string(),
        },
        "⚽" => match value {
            1 => "miss".to_string(),
            2 => "hit the woodwork".to_string(),
            3..=5 => "goal ⚽".to_string(),
            _ => value.to_string(),
        },
        _ => value.to_string(),
    }
}

/// Decode Telegram's packed 5-bit voice waveform into the 0..=1024 range
/// Matrix clients expect.
fn decode_waveform(packed: &[u8]) -> Vec<u16> {
    let count = packed.len() * 8 / 5;
    let mut values = Vec::with_capacity(count);
    for i in 0..count {
        let bit = i * 5;
        let byte = bit / 8;
        let shift = bit % 8;
        let mut value = (packed[byte] >> shift) as u16;
        if shift > 3 && byte + 1 < packed.len() {
            value |= (packed[byte + 1] as u16) << (8 - shift);
        }
        values.push((value & 0b1_1111) * 32);
    }
    values
}

async fn attach_link_preview(
    ctx: &ConvertContext<'_>,
    content: &mut MessageContent,
    web: &tl::types::MessageMediaWebPage,
) {
    let tl::enums::WebPage::Page(page) = &web.webpage else {
        return;
    };

    let mut preview = serde_json::Map::new();
    preview.insert("matched_url".to_string(), json!(page.url));
    if let Some(title) = &page.title {
        preview.insert("og:title".to_string(), json!(title));
    }
    if let Some(description) = &page.description {
        preview.insert("og:description".to_string(), json!(description));
    }
    if let Some(site_name) = &page.site_name {
        preview.insert("og:site_name".to_string(), json!(site_name));
    }
    if let Some(tl::enums::Photo::Photo(photo)) = &page.photo {
        let thumb_size = largest_photo_size(photo).unwrap_or_else(|| "y".to_string());
        let descriptor = FileDescriptor::Photo {
            photo: photo.clone(),
            thumb_size,
        };
        match media::transfer_to_matrix(
            ctx.client,
            &descriptor,
            TransferOptions {
                room_id: ctx.room_id.as_ref(),
                ..Default::default()
            },
        )
        .await
        {
            Ok(file) => {
                preview.insert("og:image".to_string(), json!(file.uri));
                preview.insert("matrix:image:size".to_string(), json!(file.size));
                if let Some(width) = file.width {
                    preview.insert("og:image:width".to_string(), json!(width));
                }
                if let Some(height) = file.height {
                    preview.insert("og:image:height".to_string(), json!(height));
                }
            }
            Err(err) => warn!("failed to transfer link preview image: {err}"),
        }
    }

    content.set_extra(
        "com.beeper.linkpreviews",
        json!([serde_json::Value::Object(preview)]),
    );
}

/// Transfer through the pipeline, or mint a direct-media URI when that is
/// enabled and the target room is unencrypted.
async fn transfer_or_direct(
    ctx: &ConvertContext<'_>,
    msg: &tl::types::Message,
    descriptor: &FileDescriptor,
    sticker: Option<bool>,
) -> Result<TransferredFile, ConvertError> {
    let config = ctx.client.config();
    if config.use_direct_media && !config.direct_media_server.is_empty() {
        let encrypted = match &ctx.room_id {
            Some(room_id) => ctx.client.bridge().is_room_encrypted(room_id).await,
            None => false,
        };
        if !encrypted {
            let (peer_type, chat_id) = ids::parse_peer(&ctx.portal.id)
                .unwrap_or((PeerType::User, 0));
            let direct = crate::ids::DirectMediaId {
                peer_type,
                chat_id,
                msg_id: msg.id,
                thumbnail: false,
            };
            return Ok(TransferredFile {
                uri: media::direct_media_uri(&config.direct_media_server, &direct),
                encryption: None,
                mime_type: descriptor
                    .dimensions()
                    .map(|_| "image/jpeg".to_string())
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
                size: 0,
                width: None,
                height: None,
                converted_thumbnail: None,
            });
        }
    }

    media::transfer_to_matrix(
        ctx.client,
        descriptor,
        TransferOptions {
            room_id: ctx.room_id.as_ref(),
            filename: None,
            convert_sticker: sticker.unwrap_or(false),
        },
    )
    .await
    .map_err(ConvertError::Media)
}

fn file_content(msgtype: &str, file: &TransferredFile, filename: &str) -> MessageContent {
    let mut content = MessageContent {
        msgtype: msgtype.to_string(),
        body: filename.to_string(),
        ..Default::default()
    };
    if file.encryption.is_some() {
        content.file = file.encryption.clone();
    } else {
        content.url = Some(file.uri.clone());
    }
    content.info = Some(FileInfo {
        mimetype: Some(file.mime_type.clone()),
        size: Some(file.size),
        width: file.width,
        height: file.height,
        ..Default::default()
    });
    content
}

fn apply_spoiler(content: &mut MessageContent, spoiler: bool) {
    if spoiler {
        content.set_extra("fi.mau.telegram.spoiler", json!(true));
        content.set_extra(
            "town.robin.msc3725.content_warning",
            json!({"type": "town.robin.msc3725.spoiler"}),
        );
    }
}

fn disappearing_prefix(ttl: Option<i32>) -> &'static str {
    if ttl.is_some() { "disappearing_" } else { "" }
}

fn notice_part(content: MessageContent) -> ConvertedMessagePart {
    ConvertedMessagePart {
        part_id: String::new(),
        event_type: EventType::RoomMessage,
        content,
    }
}

fn unsupported_part(kind: &str) -> ConvertedMessagePart {
    let mut content = MessageContent::notice(format!(
        "This message contains a {kind}, which the bridge cannot convert."
    ));
    content.set_extra("fi.mau.telegram.unsupported", json!(true));
    notice_part(content)
}

/// Fold a leading caption part into the media part that follows it.
fn merge_caption_parts(parts: &mut Vec<ConvertedMessagePart>) {
    if parts.len() != 2 {
        return;
    }
    let mergeable = parts[0].content.msgtype == "m.text"
        && matches!(
            parts[1].content.msgtype.as_str(),
            "m.image" | "m.video" | "m.audio" | "m.file"
        );
    if !mergeable {
        return;
    }

    let caption = parts.remove(0).content;
    let media = &mut parts[0].content;
    media.filename = Some(media.body.clone());
    media.body = caption.body;
    media.format = caption.format;
    media.formatted_body = caption.formatted_body;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dice_decoding() {
        assert_eq!(decode_dice("🎳", 1), "miss");
        assert_eq!(decode_dice("🎳", 6), "strike 🎉");
        assert_eq!(decode_dice("⚽", 3), "goal ⚽");
        // Slot machine jackpot: 64 = all reels showing seven.
        assert_eq!(decode_dice("🎰", 64), "seven seven seven");
        assert_eq!(decode_dice("🎰", 1), "bar bar bar");
        // Plain dice just show the number.
        assert_eq!(decode_dice("🎲", 4), "4");
    }

    #[test]
    fn waveform_decoding() {
        // All-zero input decodes to silence.
        assert_eq!(decode_waveform(&[0, 0, 0, 0, 0]), vec![0; 8]);
        // 0b11111 in the lowest five bits is full volume.
        let values = decode_waveform(&[0b0001_1111]);
        assert_eq!(values[0], 31 * 32);
    }

    #[test]
    fn caption_merging() {
        let mut parts = vec![
            ConvertedMessagePart {
                part_id: String::new(),
                event_type: EventType::RoomMessage,
                content: MessageContent::text("caption").with_html("<em>caption</em>"),
            },
            ConvertedMessagePart {
                part_id: String::new(),
                event_type: EventType::RoomMessage,
                content: MessageContent {
                    msgtype: "m.image".to_string(),
                    body: "image.jpg".to_string(),
                    ..Default::default()
                },
            },
        ];
        merge_caption_parts(&mut parts);
        assert_eq!(parts.len(), 1);
        let content = &parts[0].content;
        assert_eq!(content.msgtype, "m.image");
        assert_eq!(content.body, "caption");
        assert_eq!(content.filename.as_deref(), Some("image.jpg"));
        assert_eq!(content.formatted_body.as_deref(), Some("<em>caption</em>"));
    }

    #[test]
    fn disappearing_filenames() {
        assert_eq!(disappearing_prefix(Some(5)), "disappearing_");
        assert_eq!(disappearing_prefix(None), "");
    }
}
