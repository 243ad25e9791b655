// Copyright 2024 - developers of the `mautrix-telegram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Adapts the various `Updates` envelope shapes into one.
//!
//! > The `updateShortMessage`, `updateShortSentMessage` and
//! > `updateShortChatMessage` constructors [...] should be transformed
//! > to `updateShort` upon receiving.
//!
//! The short-message constructors only ever carry text, so instead of
//! reconstructing a full `message` out of them, they stay a dedicated
//! [`ShortMessage`] item all the way to dispatch.

use grammers_tl_types as tl;
use log::info;

use super::state::{Entry, Gap, NO_SEQ};

/// A plain-text message delivered through one of the `updateShort*`
/// envelopes.
#[derive(Clone, Debug)]
pub(crate) struct ShortMessage {
    pub(crate) out: bool,
    pub(crate) silent: bool,
    pub(crate) id: i32,
    /// `true` for a basic group, `false` for a direct chat.
    pub(crate) is_chat: bool,
    /// The group or the DM partner.
    pub(crate) peer_id: i64,
    /// Sending user; `None` when the bridge user sent it themselves.
    pub(crate) sender_id: Option<i64>,
    pub(crate) message: String,
    pub(crate) entities: Vec<tl::enums::MessageEntity>,
    pub(crate) date: i32,
    pub(crate) reply_to_msg_id: Option<i32>,
    pub(crate) ttl_period: Option<i32>,
    pub(crate) pts: i32,
    pub(crate) pts_count: i32,
}

/// One thing the sequence tracker can apply.
#[derive(Debug)]
pub(crate) enum Applicable {
    Update(tl::enums::Update),
    ShortMessage(Box<ShortMessage>),
    /// Carries only sequence information; the content was already handled
    /// elsewhere (e.g. the response to our own send).
    PtsAck {
        entry: Entry,
        pts: i32,
        pts_count: i32,
    },
}

/// The single envelope shape everything is adapted into, mirroring
/// `updatesCombined`.
#[derive(Debug)]
pub(crate) struct AdaptedUpdates {
    pub(crate) date: i32,
    pub(crate) seq_start: i32,
    pub(crate) seq: i32,
    pub(crate) updates: Vec<Applicable>,
    pub(crate) users: Vec<tl::enums::User>,
    pub(crate) chats: Vec<tl::enums::Chat>,
}

pub(crate) fn adapt(updates: tl::enums::Updates) -> Result<AdaptedUpdates, Gap> {
    Ok(match updates {
        // > `updatesTooLong` indicates that there are too many events
        // > pending to be pushed to the client.
        tl::enums::Updates::TooLong => {
            info!("received updatesTooLong, treating as gap");
            return Err(Gap);
        }
        tl::enums::Updates::UpdateShortMessage(short) => {
            let tl::types::UpdateShortMessage {
                out,
                silent,
                id,
                user_id,
                message,
                pts,
                pts_count,
                date,
                reply_to,
                entities,
                ttl_period,
                ..
            } = short;
            single(
                date,
                Applicable::ShortMessage(Box::new(ShortMessage {
                    out,
                    silent,
                    id,
                    is_chat: false,
                    peer_id: user_id,
                    sender_id: if out { None } else { Some(user_id) },
                    message,
                    entities: entities.unwrap_or_default(),
                    date,
                    reply_to_msg_id: reply_header_msg_id(reply_to.as_ref()),
                    ttl_period,
                    pts,
                    pts_count,
                })),
            )
        }
        tl::enums::Updates::UpdateShortChatMessage(short) => {
            let tl::types::UpdateShortChatMessage {
                out,
                silent,
                id,
                from_id,
                chat_id,
                message,
                pts,
                pts_count,
                date,
                reply_to,
                entities,
                ttl_period,
                ..
            } = short;
            single(
                date,
                Applicable::ShortMessage(Box::new(ShortMessage {
                    out,
                    silent,
                    id,
                    is_chat: true,
                    peer_id: chat_id,
                    sender_id: Some(from_id),
                    message,
                    entities: entities.unwrap_or_default(),
                    date,
                    reply_to_msg_id: reply_header_msg_id(reply_to.as_ref()),
                    ttl_period,
                    pts,
                    pts_count,
                })),
            )
        }
        tl::enums::Updates::UpdateShort(short) => {
            single(short.date, Applicable::Update(short.update))
        }
        tl::enums::Updates::Combined(combined) => AdaptedUpdates {
            date: combined.date,
            seq_start: combined.seq_start,
            seq: combined.seq,
            updates: combined
                .updates
                .into_iter()
                .map(Applicable::Update)
                .collect(),
            users: combined.users,
            chats: combined.chats,
        },
        tl::enums::Updates::Updates(updates) => AdaptedUpdates {
            date: updates.date,
            seq_start: updates.seq,
            seq: updates.seq,
            updates: updates
                .updates
                .into_iter()
                .map(Applicable::Update)
                .collect(),
            users: updates.users,
            chats: updates.chats,
        },
        tl::enums::Updates::UpdateShortSentMessage(short) => single(
            short.date,
            Applicable::PtsAck {
                entry: Entry::Account,
                pts: short.pts,
                pts_count: short.pts_count,
            },
        ),
    })
}

/// Sequence acknowledgement for `messages.affectedMessages`-style results,
/// which carry a pts but are not updates.
pub(crate) fn affected_messages(
    affected: tl::types::messages::AffectedMessages,
) -> AdaptedUpdates {
    single(
        super::state::NO_DATE,
        Applicable::PtsAck {
            entry: Entry::Account,
            pts: affected.pts,
            pts_count: affected.pts_count,
        },
    )
}

fn single(date: i32, item: Applicable) -> AdaptedUpdates {
    AdaptedUpdates {
        date,
        seq_start: NO_SEQ,
        seq: NO_SEQ,
        updates: vec![item],
        users: Vec::new(),
        chats: Vec::new(),
    }
}

fn reply_header_msg_id(reply_to: Option<&tl::enums::MessageReplyHeader>) -> Option<i32> {
    match reply_to {
        Some(tl::enums::MessageReplyHeader::Header(header)) => header.reply_to_msg_id,
        _ => None,
    }
}
