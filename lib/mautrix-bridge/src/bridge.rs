// Copyright 2024 - developers of the `mautrix-telegram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The handle a connector uses to call back into the framework.

use async_trait::async_trait;
use thiserror::Error;

use crate::event::{BridgeState, RemoteEvent};
use crate::ids::{EventId, GhostId, MessageId, PortalKey, RoomId, UserLoginId};

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("matrix media upload failed: {0}")]
    Upload(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("{0}")]
    Other(String),
}

/// Result of uploading media to the Matrix side.
#[derive(Clone, Debug, PartialEq)]
pub struct UploadedMedia {
    /// `mxc://` content URI.
    pub uri: String,
    /// Present when the upload was encrypted for a specific room, in which
    /// case `uri` points at the ciphertext.
    pub encryption: Option<crate::message::EncryptedFile>,
}

/// Ghost profile data computed by the connector; applying it (profile
/// requests against the homeserver) is the framework's job.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GhostProfile {
    pub id: GhostId,
    pub name: Option<String>,
    /// `mxc://` URI of the avatar, if it changed.
    pub avatar_url: Option<String>,
    pub is_bot: bool,
    /// Opaque identifiers shown in user info (usernames, phone numbers).
    pub identifiers: Vec<String>,
}

/// A row of the framework's message table.
#[derive(Clone, Debug, PartialEq)]
pub struct BridgeMessage {
    pub portal: PortalKey,
    pub id: MessageId,
    pub part_id: String,
    pub event_id: EventId,
    pub sender: GhostId,
}

/// Framework services available to a connector.
///
/// All methods are safe to call from any task. Event queueing preserves
/// per-portal ordering.
#[async_trait]
pub trait Bridge: Send + Sync {
    /// Queue a remote event for dispatch into the portal room.
    async fn queue_remote_event(&self, login: &UserLoginId, event: RemoteEvent);

    /// Upload media to the Matrix media repository. When `room_id` refers
    /// to an encrypted room, the framework encrypts the payload and
    /// returns the decryption info alongside the URI.
    async fn upload_media(
        &self,
        room_id: Option<&RoomId>,
        data: Vec<u8>,
        filename: &str,
        mime_type: &str,
    ) -> Result<UploadedMedia, BridgeError>;

    /// Whether the given room is encrypted (controls media cacheability).
    async fn is_room_encrypted(&self, room_id: &RoomId) -> bool;

    /// Download (and, if `file` is present, decrypt) an `mxc://` URI from
    /// the Matrix media repository.
    async fn download_media(
        &self,
        uri: &str,
        file: Option<&crate::message::EncryptedFile>,
    ) -> Result<Vec<u8>, BridgeError>;

    /// Look up a bridged message by its remote ID. `portal` narrows the
    /// search; without it the whole message table of the login is
    /// consulted (deletions on Telegram's account-wide stream don't say
    /// which chat they happened in).
    async fn get_message_by_remote_id(
        &self,
        login: &UserLoginId,
        portal: Option<&PortalKey>,
        id: &MessageId,
    ) -> Result<Option<BridgeMessage>, BridgeError>;

    /// Look up a bridged message by its Matrix event ID.
    async fn get_message_by_event_id(
        &self,
        event_id: &EventId,
    ) -> Result<Option<BridgeMessage>, BridgeError>;

    /// Record an outgoing (Matrix→remote) message. Must be called before
    /// the Matrix event is acknowledged so the remote echo can be
    /// deduplicated.
    async fn save_message(&self, login: &UserLoginId, message: BridgeMessage)
        -> Result<(), BridgeError>;

    /// Apply computed ghost profile changes.
    async fn update_ghost(&self, profile: GhostProfile);

    /// Report the connection state of a login.
    async fn send_bridge_state(&self, login: &UserLoginId, state: BridgeState);

    /// Register a freshly-completed login with the framework, which
    /// persists it and later asks the connector to load it.
    async fn create_user_login(
        &self,
        user: &crate::ids::MatrixUserId,
        login: crate::login::NewLogin,
    ) -> Result<(), BridgeError>;

    /// All logins belonging to a Matrix user.
    async fn user_logins(&self, user: &crate::ids::MatrixUserId) -> Vec<UserLoginId>;

    /// Look up an existing portal room for the key, if one was created.
    async fn get_portal_room(&self, portal: &PortalKey) -> Option<RoomId>;

    /// Ensure a DM portal room exists for the key and return it.
    async fn create_dm_portal(
        &self,
        login: &UserLoginId,
        portal: &PortalKey,
    ) -> Result<RoomId, BridgeError>;
}
