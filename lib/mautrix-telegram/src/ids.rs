// Copyright 2024 - developers of the `mautrix-telegram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Stable string codecs for Telegram identifiers.
//!
//! Everything that ends up as a portal, ghost, login or message key in the
//! bridge database goes through here. The encodings must never change:
//! they are shared with every existing row.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use grammers_tl_types as tl;
use mautrix_bridge::{GhostId, MessageId, PortalKey, UserLoginId};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdError {
    #[error("invalid peer type {0:?}")]
    InvalidPeerType(String),
    #[error("invalid peer type byte {0:#x}")]
    InvalidPeerTypeByte(u8),
    #[error("malformed peer key {0:?}: expected \"<peer_type>:<chat_id>\"")]
    MalformedPeerKey(String),
    #[error("malformed message ID {0:?}: {1}")]
    MalformedMessageId(String, &'static str),
    #[error("malformed user login ID {0:?}")]
    MalformedLoginId(String),
    #[error("malformed direct media ID")]
    MalformedDirectMediaId,
}

/// The three kinds of Telegram peer.
///
/// Broadcast channels and supergroups are both `Channel`; the distinction
/// Telegram makes between them does not affect addressing.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum PeerType {
    User,
    Chat,
    Channel,
}

impl PeerType {
    /// Single-byte encoding used inside binary payloads such as direct
    /// media IDs.
    pub fn to_byte(self) -> u8 {
        match self {
            Self::User => 0x01,
            Self::Chat => 0x02,
            Self::Channel => 0x03,
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self, IdError> {
        match byte {
            0x01 => Ok(Self::User),
            0x02 => Ok(Self::Chat),
            0x03 => Ok(Self::Channel),
            other => Err(IdError::InvalidPeerTypeByte(other)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Chat => "chat",
            Self::Channel => "channel",
        }
    }

    pub fn parse(value: &str) -> Result<Self, IdError> {
        match value {
            "user" => Ok(Self::User),
            "chat" => Ok(Self::Chat),
            "channel" => Ok(Self::Channel),
            other => Err(IdError::InvalidPeerType(other.to_string())),
        }
    }

    pub fn of_peer(peer: &tl::enums::Peer) -> (Self, i64) {
        match peer {
            tl::enums::Peer::User(p) => (Self::User, p.user_id),
            tl::enums::Peer::Chat(p) => (Self::Chat, p.chat_id),
            tl::enums::Peer::Channel(p) => (Self::Channel, p.channel_id),
        }
    }
}

impl fmt::Display for PeerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serialise a peer as `"<peer_type>:<chat_id>"`.
pub fn format_peer(peer_type: PeerType, chat_id: i64) -> String {
    format!("{}:{}", peer_type.as_str(), chat_id)
}

pub fn parse_peer(value: &str) -> Result<(PeerType, i64), IdError> {
    let (ty, id) = value
        .split_once(':')
        .ok_or_else(|| IdError::MalformedPeerKey(value.to_string()))?;
    let peer_type = PeerType::parse(ty)?;
    let chat_id = id
        .parse::<i64>()
        .map_err(|_| IdError::MalformedPeerKey(value.to_string()))?;
    Ok((peer_type, chat_id))
}

/// Compute the portal key for a peer as seen by `receiver`.
///
/// Channel portals are global; user and chat portals are scoped to the
/// receiving login.
pub fn portal_key(peer_type: PeerType, chat_id: i64, receiver: &UserLoginId) -> PortalKey {
    match peer_type {
        PeerType::Channel => PortalKey::global(format_peer(peer_type, chat_id)),
        PeerType::User | PeerType::Chat => {
            PortalKey::new(format_peer(peer_type, chat_id), receiver.as_str())
        }
    }
}

/// Message key within a portal: `"<channel>.<msg>"` for channels, plain
/// `"<msg>"` everywhere else.
pub fn format_message_id(channel_id: Option<i64>, msg_id: i32) -> MessageId {
    match channel_id {
        Some(channel) => MessageId::new(format!("{channel}.{msg_id}")),
        None => MessageId::new(msg_id.to_string()),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParsedMessageId {
    pub channel_id: Option<i64>,
    pub msg_id: i32,
}

pub fn parse_message_id(value: &str) -> Result<ParsedMessageId, IdError> {
    let malformed = |reason| IdError::MalformedMessageId(value.to_string(), reason);
    match value.split_once('.') {
        Some((channel, msg)) => {
            if msg.contains('.') {
                return Err(malformed("more than one separator"));
            }
            Ok(ParsedMessageId {
                channel_id: Some(
                    channel
                        .parse::<i64>()
                        .map_err(|_| malformed("channel part is not an integer"))?,
                ),
                msg_id: msg
                    .parse::<i32>()
                    .map_err(|_| malformed("message part is not a 32-bit integer"))?,
            })
        }
        None => Ok(ParsedMessageId {
            channel_id: None,
            msg_id: value
                .parse::<i32>()
                .map_err(|_| malformed("not a 32-bit integer"))?,
        }),
    }
}

/// Logins are keyed by the Telegram user ID rendered as decimal.
pub fn login_id(user_id: i64) -> UserLoginId {
    UserLoginId::new(user_id.to_string())
}

pub fn parse_login_id(value: &UserLoginId) -> Result<i64, IdError> {
    value
        .as_str()
        .parse::<i64>()
        .map_err(|_| IdError::MalformedLoginId(value.to_string()))
}

/// Ghosts are keyed the same way as logins: the bare Telegram user ID.
pub fn ghost_id(user_id: i64) -> GhostId {
    GhostId::new(user_id.to_string())
}

/// A reaction identifier: either a custom emoji document or a plain
/// unicode emoji. The string form of a custom emoji is its numeric
/// document ID, so anything fully numeric parses as one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EmojiId {
    CustomEmoji(i64),
    Unicode(String),
}

impl EmojiId {
    pub fn parse(value: &str) -> Self {
        match value.parse::<i64>() {
            Ok(document_id) => Self::CustomEmoji(document_id),
            Err(_) => Self::Unicode(value.to_string()),
        }
    }
}

impl fmt::Display for EmojiId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CustomEmoji(document_id) => write!(f, "{document_id}"),
            Self::Unicode(emoji) => f.write_str(emoji),
        }
    }
}

/// Payload of a direct-media content URI.
///
/// Encoded as url-safe base64 over a fixed-layout byte string so the
/// media ID survives inside an `mxc://` URI.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DirectMediaId {
    pub peer_type: PeerType,
    pub chat_id: i64,
    pub msg_id: i32,
    pub thumbnail: bool,
}

impl DirectMediaId {
    pub fn encode(&self) -> String {
        let mut buf = [0u8; 14];
        buf[0] = self.peer_type.to_byte();
        buf[1..9].copy_from_slice(&self.chat_id.to_be_bytes());
        buf[9..13].copy_from_slice(&self.msg_id.to_be_bytes());
        buf[13] = self.thumbnail as u8;
        URL_SAFE_NO_PAD.encode(buf)
    }

    pub fn decode(value: &str) -> Result<Self, IdError> {
        let buf = URL_SAFE_NO_PAD
            .decode(value)
            .map_err(|_| IdError::MalformedDirectMediaId)?;
        if buf.len() != 14 {
            return Err(IdError::MalformedDirectMediaId);
        }
        Ok(Self {
            peer_type: PeerType::from_byte(buf[0])?,
            chat_id: i64::from_be_bytes(buf[1..9].try_into().unwrap()),
            msg_id: i32::from_be_bytes(buf[9..13].try_into().unwrap()),
            thumbnail: match buf[13] {
                0 => false,
                1 => true,
                _ => return Err(IdError::MalformedDirectMediaId),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_peer_round_trip() {
        for peer_type in [PeerType::User, PeerType::Chat, PeerType::Channel] {
            for id in [0i64, 1, -1, 777000, i64::MAX, i64::MIN] {
                let encoded = format_peer(peer_type, id);
                assert_eq!(parse_peer(&encoded), Ok((peer_type, id)));
            }
            assert_eq!(PeerType::from_byte(peer_type.to_byte()), Ok(peer_type));
        }
    }

    #[test]
    fn check_peer_parse_failures() {
        assert!(matches!(
            parse_peer("supergroup:12"),
            Err(IdError::InvalidPeerType(_))
        ));
        assert!(matches!(
            parse_peer("user;12"),
            Err(IdError::MalformedPeerKey(_))
        ));
        assert!(matches!(
            parse_peer("chat:twelve"),
            Err(IdError::MalformedPeerKey(_))
        ));
    }

    #[test]
    fn check_message_id_round_trip() {
        for (channel, msg) in [
            (None, 1),
            (None, i32::MAX),
            (Some(100), 42),
            (Some(i64::MAX), i32::MIN),
        ] {
            let encoded = format_message_id(channel, msg);
            assert_eq!(
                parse_message_id(encoded.as_str()),
                Ok(ParsedMessageId {
                    channel_id: channel,
                    msg_id: msg
                })
            );
        }
    }

    #[test]
    fn check_message_id_ambiguity() {
        assert!(parse_message_id("1.2.3").is_err());
        assert!(parse_message_id("").is_err());
        assert!(parse_message_id("12.").is_err());
        assert!(parse_message_id(".12").is_err());
        // Message IDs are 32-bit; a 64-bit value in the message slot is an
        // error, not a silent truncation.
        assert!(parse_message_id("100.5000000000").is_err());
    }

    #[test]
    fn check_portal_scoping() {
        let receiver = login_id(7777);
        let dm = portal_key(PeerType::User, 123, &receiver);
        assert_eq!(dm.id, "user:123");
        assert_eq!(dm.receiver, "7777");

        let channel = portal_key(PeerType::Channel, 123, &receiver);
        assert_eq!(channel.id, "channel:123");
        assert!(channel.receiver.is_empty());
    }

    #[test]
    fn check_emoji_id() {
        assert_eq!(
            EmojiId::parse("5368324170671202286"),
            EmojiId::CustomEmoji(5368324170671202286)
        );
        assert_eq!(EmojiId::parse("👍"), EmojiId::Unicode("👍".to_string()));
        assert_eq!(EmojiId::parse(""), EmojiId::Unicode(String::new()));
    }

    #[test]
    fn check_direct_media_round_trip() {
        let id = DirectMediaId {
            peer_type: PeerType::Channel,
            chat_id: -1001234567890,
            msg_id: 42,
            thumbnail: true,
        };
        assert_eq!(DirectMediaId::decode(&id.encode()), Ok(id));
        assert!(DirectMediaId::decode("not base64!").is_err());
    }
}
