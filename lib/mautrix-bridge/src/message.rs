// Copyright 2024 - developers of the `mautrix-telegram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Message payloads crossing the connector/framework boundary.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use crate::ids::{EventId, MessageId, PortalKey, RoomId};

/// Matrix event types a converted part can materialise as.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "m.room.message")]
    RoomMessage,
    #[serde(rename = "m.sticker")]
    Sticker,
    #[serde(rename = "m.reaction")]
    Reaction,
}

/// `m.room.message`-shaped content.
///
/// Extra network-specific keys (`fi.mau.telegram.*`, MSC extensions and the
/// like) go into [`MessageContent::extra`], which is flattened into the
/// event on serialisation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageContent {
    /// Empty for event types that carry no `msgtype` (e.g. `m.sticker`).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub msgtype: String,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formatted_body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<EncryptedFile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<FileInfo>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl MessageContent {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            msgtype: "m.text".to_string(),
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn notice(body: impl Into<String>) -> Self {
        Self {
            msgtype: "m.notice".to_string(),
            body: body.into(),
            ..Default::default()
        }
    }

    /// Set the `org.matrix.custom.html` formatted body.
    pub fn with_html(mut self, html: impl Into<String>) -> Self {
        self.format = Some("org.matrix.custom.html".to_string());
        self.formatted_body = Some(html.into());
        self
    }

    pub fn set_extra(&mut self, key: &str, value: serde_json::Value) {
        self.extra.insert(key.to_string(), value);
    }
}

/// The `info` block of media events.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mimetype: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    #[serde(rename = "w", skip_serializing_if = "Option::is_none")]
    pub width: Option<i32>,
    #[serde(rename = "h", skip_serializing_if = "Option::is_none")]
    pub height: Option<i32>,
    /// Milliseconds, for audio/video/voice.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_file: Option<EncryptedFile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_info: Option<Box<FileInfo>>,
}

/// Description of an encrypted upload, matching the `EncryptedFile`
/// structure of the client-server spec.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EncryptedFile {
    pub url: String,
    pub key: serde_json::Value,
    pub iv: String,
    pub hashes: BTreeMap<String, String>,
    pub v: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisappearingType {
    AfterRead,
    AfterSend,
}

/// Disappearing-message behaviour attached to a converted message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DisappearingSetting {
    #[serde(rename = "type")]
    pub kind: DisappearingType,
    pub timer: Duration,
}

/// One Matrix event produced from a remote message.
#[derive(Clone, Debug, PartialEq)]
pub struct ConvertedMessagePart {
    /// Stable sub-identifier when a remote message maps to several events.
    /// Empty for the only (or first) part.
    pub part_id: String,
    pub event_type: EventType,
    pub content: MessageContent,
}

/// The result of converting one remote message.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConvertedMessage {
    pub parts: Vec<ConvertedMessagePart>,
    /// Remote message this one replies to, if any.
    pub reply_to: Option<MessageId>,
    pub disappear: Option<DisappearingSetting>,
    /// Hash over the remote content, used for idempotent edit handling.
    pub content_hash: Vec<u8>,
}

/// A Matrix event handed to the connector for delivery to the remote
/// network.
#[derive(Clone, Debug)]
pub struct MatrixMessage {
    pub event_id: EventId,
    pub room_id: RoomId,
    pub portal: PortalKey,
    pub event_type: EventType,
    pub content: MessageContent,
    /// Target of `m.relates_to` replies, already resolved to the remote
    /// message by the framework's message table.
    pub reply_to: Option<MessageId>,
    /// For edits: the remote message being replaced.
    pub edit_target: Option<MessageId>,
}
