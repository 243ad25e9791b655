// Copyright 2024 - developers of the `mautrix-telegram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The traits a network connector implements.

use std::sync::Arc;

use async_trait::async_trait;
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::{MatrixUserId, MessageId, UserLoginId};
use crate::login::{LoginError, LoginFlow, LoginProcess};
use crate::message::MatrixMessage;

/// Static metadata about the bridged network.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeName {
    pub display_name: String,
    pub network_url: String,
    pub network_icon: String,
    pub network_id: String,
    pub beeper_bridge_type: String,
    pub default_port: u16,
    pub default_command_prefix: String,
}

/// Feature flags the framework queries before offering functionality.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkCapabilities {
    pub disappearing_messages: bool,
    pub edits: bool,
    pub replies: bool,
    pub formatted_text: bool,
    pub stickers: bool,
    pub voice_messages: bool,
    pub location_messages: bool,
    pub polls_readonly: bool,
    /// Reactions allowed per user per message (0 = unsupported).
    pub max_reactions_per_message: u32,
}

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("unknown login flow {0:?}")]
    UnknownLoginFlow(String),
    #[error("not logged in")]
    NotLoggedIn,
    #[error("{operation} failed: {message}")]
    Operation {
        operation: &'static str,
        message: String,
    },
}

impl ConnectorError {
    pub fn operation(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Operation {
            operation,
            message: message.into(),
        }
    }
}

/// Response to a delivered Matrix message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatrixMessageResponse {
    /// Remote ID assigned to the sent message. Already recorded in the
    /// message table by the connector before this response is returned.
    pub id: MessageId,
    /// Remote timestamp in unix seconds, if the network reported one.
    pub timestamp: Option<i64>,
}

/// Per-login API the framework drives: one instance per authenticated
/// remote account, created by [`NetworkConnector::load_user_login`].
#[async_trait]
pub trait NetworkApi: Send + Sync {
    /// Begin connecting. Non-blocking; connection state is reported
    /// through bridge state events.
    async fn connect(&self);

    /// Disconnect without touching the remote session.
    async fn disconnect(&self);

    /// Invalidate the remote session, then disconnect.
    async fn logout_remote(&self);

    async fn is_logged_in(&self) -> bool;

    async fn handle_matrix_message(
        &self,
        message: &MatrixMessage,
    ) -> Result<MatrixMessageResponse, ConnectorError>;

    async fn handle_matrix_edit(&self, message: &MatrixMessage) -> Result<(), ConnectorError>;

    async fn handle_matrix_reaction(
        &self,
        message: &MatrixMessage,
        target: &MessageId,
        emoji: &str,
    ) -> Result<(), ConnectorError>;

    async fn handle_matrix_reaction_remove(
        &self,
        message: &MatrixMessage,
        target: &MessageId,
    ) -> Result<(), ConnectorError>;
}

/// The single entry point the framework loads.
#[async_trait]
pub trait NetworkConnector: Send + Sync {
    fn name(&self) -> BridgeName;

    fn capabilities(&self) -> NetworkCapabilities;

    fn login_flows(&self) -> Vec<LoginFlow>;

    /// Start an interactive login for the given Matrix user.
    async fn create_login(
        &self,
        user: &MatrixUserId,
        flow_id: &str,
    ) -> Result<Box<dyn LoginProcess>, LoginError>;

    /// Construct (and start connecting) the [`NetworkApi`] for a stored
    /// login. Called once per login at startup and after new logins.
    async fn load_user_login(
        &self,
        login_id: &UserLoginId,
    ) -> Result<Arc<dyn NetworkApi>, ConnectorError>;
}
