// Copyright 2024 - developers of the `mautrix-telegram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Events flowing from the connector into the framework dispatcher.

use serde_derive::{Deserialize, Serialize};

use crate::ids::{GhostId, MessageId, PortalKey, UserLoginId};
use crate::message::ConvertedMessage;

/// Who caused a remote event.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EventSender {
    /// Set when the event was caused by the bridge user themselves, in
    /// which case the framework uses the user's own Matrix account (double
    /// puppeting) instead of a ghost.
    pub is_from_me: bool,
    pub sender: GhostId,
}

impl EventSender {
    pub fn ghost(sender: GhostId) -> Self {
        Self {
            is_from_me: false,
            sender,
        }
    }

    pub fn me(sender: GhostId) -> Self {
        Self {
            is_from_me: true,
            sender,
        }
    }
}

/// A remote-network event queued for dispatch to a portal.
///
/// The framework guarantees sequential handling per portal; the connector
/// guarantees it queues events for one peer in remote order.
#[derive(Clone, Debug)]
pub enum RemoteEvent {
    Message {
        portal: PortalKey,
        sender: EventSender,
        id: MessageId,
        /// Remote timestamp in unix seconds.
        timestamp: i64,
        message: ConvertedMessage,
    },
    Edit {
        portal: PortalKey,
        sender: EventSender,
        target: MessageId,
        message: ConvertedMessage,
    },
    Reaction {
        portal: PortalKey,
        sender: EventSender,
        target: MessageId,
        /// Stable reaction identifier (emoji or custom emoji document ID).
        emoji_id: String,
        /// What to render: a unicode emoji or an `mxc://` URI.
        emoji: String,
    },
    ReactionRemove {
        portal: PortalKey,
        sender: EventSender,
        target: MessageId,
        emoji_id: String,
    },
    MessageRemove {
        portal: PortalKey,
        targets: Vec<MessageId>,
    },
    /// The portal's remote metadata changed and should be re-synced.
    ChatResync { portal: PortalKey },
}

impl RemoteEvent {
    pub fn portal(&self) -> &PortalKey {
        match self {
            Self::Message { portal, .. }
            | Self::Edit { portal, .. }
            | Self::Reaction { portal, .. }
            | Self::ReactionRemove { portal, .. }
            | Self::MessageRemove { portal, .. }
            | Self::ChatResync { portal } => portal,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BridgeStateEvent {
    Starting,
    Connecting,
    Connected,
    TransientDisconnect,
    UnknownError,
    BadCredentials,
    LoggedOut,
}

/// Connection state reported per login to the framework (and ultimately to
/// clients via the bridge state endpoint).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeState {
    pub state_event: BridgeStateEvent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip)]
    pub user_login: Option<UserLoginId>,
}

impl BridgeState {
    pub fn new(state_event: BridgeStateEvent) -> Self {
        Self {
            state_event,
            error: None,
            message: None,
            user_login: None,
        }
    }

    pub fn with_error(state_event: BridgeStateEvent, error: impl Into<String>) -> Self {
        Self {
            state_event,
            error: Some(error.into()),
            message: None,
            user_login: None,
        }
    }
}
