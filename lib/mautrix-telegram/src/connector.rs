// Copyright 2024 - developers of the `mautrix-telegram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The network-connector facade the bridge framework loads.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use grammers_tl_types as tl;
use log::{debug, info, warn};
use mautrix_bridge::{
    Bridge, BridgeMessage, BridgeName, ConnectorError, LoginError, LoginFlow, LoginProcess,
    MatrixMessage, MatrixMessageResponse, MatrixUserId, MessageId, NetworkApi,
    NetworkCapabilities, NetworkConnector, PortalKey, RemoteEvent, UserLoginId,
};
use tokio::sync::Mutex;

#[allow(deprecated)]
use grammers_session::storages::TlSession;

use crate::client::{ClientError, TelegramClient};
use crate::config::{Config, ConfigError};
use crate::ids::{self, PeerType};
use crate::login::{FLOW_PHONE, FLOW_QR, PhoneLogin, QrLogin, login_flows};
use crate::msgconv::ConvertError;
use crate::msgconv::from_matrix;
use crate::store::Store;

/// How long a login flow waits for the durable client's first round-trip
/// before giving up on confirmation (the client keeps connecting in the
/// background either way).
const INIT_TIMEOUT: Duration = Duration::from_secs(60);

pub(crate) struct ConnectorInner {
    pub(crate) config: Arc<Config>,
    pub(crate) bridge: Arc<dyn Bridge>,
    pub(crate) store: Arc<Store>,
    pub(crate) clients: Mutex<HashMap<i64, Arc<TelegramLoginApi>>>,
}

/// The Telegram network connector.
#[derive(Clone)]
pub struct TelegramConnector {
    inner: Arc<ConnectorInner>,
}

impl TelegramConnector {
    pub fn new(
        config: Config,
        bridge: Arc<dyn Bridge>,
        store: Arc<Store>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(ConnectorInner {
                config: Arc::new(config),
                bridge,
                store,
                clients: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// The client for a connected login, if any.
    pub(crate) async fn client_for(&self, user_id: i64) -> Option<TelegramClient> {
        self.inner
            .clients
            .lock()
            .await
            .get(&user_id)
            .map(|api| api.client.clone())
    }

    pub(crate) fn shared(&self) -> Arc<ConnectorInner> {
        Arc::clone(&self.inner)
    }

    pub fn bridge(&self) -> &Arc<dyn Bridge> {
        &self.inner.bridge
    }

    /// How many batches the framework's backfill queue should run for a
    /// portal, honouring the per-peer-kind config overrides.
    pub fn backfill_max_batches(&self, portal: &PortalKey) -> i32 {
        match ids::parse_peer(&portal.id) {
            Ok((peer_type, _)) => self.inner.config.backfill.queue.max_batches_for(peer_type),
            Err(_) => self.inner.config.backfill.queue.max_batches,
        }
    }

    /// Bridge-bot command hook. Only `sync` is recognised: it re-runs the
    /// chat sync for the calling login.
    pub async fn handle_bot_command(
        &self,
        login_id: &UserLoginId,
        command: &str,
    ) -> Result<String, ConnectorError> {
        match command.trim() {
            "sync" => {
                let user_id = ids::parse_login_id(login_id).map_err(|err| {
                    ConnectorError::operation("sync", err.to_string())
                })?;
                let client = self
                    .client_for(user_id)
                    .await
                    .ok_or(ConnectorError::NotLoggedIn)?;
                tokio::spawn(sync_chats(client));
                Ok("Resynchronizing chats in the background".to_string())
            }
            other => Err(ConnectorError::operation(
                "bot command",
                format!("unknown command {other:?}"),
            )),
        }
    }
}

impl ConnectorInner {
    /// Bring up the durable client for a login, wait for its first server
    /// round-trip and schedule the initial chat sync.
    pub(crate) async fn activate_login(
        self: &Arc<Self>,
        user_id: i64,
        #[allow(deprecated)] session: Arc<TlSession>,
    ) -> Result<Arc<TelegramLoginApi>, ClientError> {
        let client = TelegramClient::with_session(
            user_id,
            Arc::clone(&self.config),
            Arc::clone(&self.bridge),
            self.store.scoped(user_id),
            session,
        );
        client.connect();
        if tokio::time::timeout(INIT_TIMEOUT, client.wait_initialized())
            .await
            .is_err()
        {
            warn!("client for {user_id} did not initialize in time; continuing anyway");
        }
        tokio::spawn(sync_chats(client.clone()));

        let api = Arc::new(TelegramLoginApi {
            client,
            login_id: ids::login_id(user_id),
        });
        self.clients.lock().await.insert(user_id, Arc::clone(&api));
        Ok(api)
    }
}

#[async_trait]
impl NetworkConnector for TelegramConnector {
    fn name(&self) -> BridgeName {
        BridgeName {
            display_name: "Telegram".to_string(),
            network_url: "https://telegram.org".to_string(),
            network_icon: "mxc://maunium.net/tJCRmUyJDsgRNgqhOgoiHWbX".to_string(),
            network_id: "telegram".to_string(),
            beeper_bridge_type: "telegram".to_string(),
            default_port: 29317,
            default_command_prefix: "!tg".to_string(),
        }
    }

    fn capabilities(&self) -> NetworkCapabilities {
        NetworkCapabilities {
            disappearing_messages: true,
            edits: true,
            replies: true,
            formatted_text: true,
            stickers: true,
            voice_messages: true,
            location_messages: true,
            polls_readonly: true,
            max_reactions_per_message: 1,
        }
    }

    fn login_flows(&self) -> Vec<LoginFlow> {
        login_flows()
    }

    async fn create_login(
        &self,
        user: &MatrixUserId,
        flow_id: &str,
    ) -> Result<Box<dyn LoginProcess>, LoginError> {
        match flow_id {
            FLOW_PHONE => Ok(Box::new(PhoneLogin::new(self.shared(), user.clone()))),
            FLOW_QR => Ok(Box::new(QrLogin::new(self.shared(), user.clone()))),
            other => Err(LoginError::stable(
                "request_body_invalid",
                format!("unknown login flow {other:?}"),
            )),
        }
    }

    async fn load_user_login(
        &self,
        login_id: &UserLoginId,
    ) -> Result<Arc<dyn NetworkApi>, ConnectorError> {
        let user_id = ids::parse_login_id(login_id)
            .map_err(|err| ConnectorError::operation("load login", err.to_string()))?;

        if let Some(existing) = self.inner.clients.lock().await.get(&user_id) {
            let existing: Arc<dyn NetworkApi> = existing.clone();
            return Ok(existing);
        }

        info!("loading user login {login_id}");
        let client = TelegramClient::from_store(
            user_id,
            Arc::clone(&self.inner.config),
            Arc::clone(&self.inner.bridge),
            self.inner.store.scoped(user_id),
        )
        .map_err(|err| ConnectorError::operation("load login", err.to_string()))?;
        client.connect();

        let api = Arc::new(TelegramLoginApi {
            client,
            login_id: login_id.clone(),
        });
        self.inner
            .clients
            .lock()
            .await
            .insert(user_id, Arc::clone(&api));
        Ok(api)
    }
}

/// Per-login API surface driven by the framework.
pub struct TelegramLoginApi {
    client: TelegramClient,
    login_id: UserLoginId,
}

impl TelegramLoginApi {
    fn channel_of_portal(&self, message: &MatrixMessage) -> Option<i64> {
        match ids::parse_peer(&message.portal.id) {
            Ok((PeerType::Channel, chat_id)) => Some(chat_id),
            _ => None,
        }
    }

    fn convert_error(err: ConvertError) -> ConnectorError {
        match err {
            ConvertError::Client(ClientError::LoggedOut(_)) => ConnectorError::NotLoggedIn,
            err => ConnectorError::operation("deliver matrix event", err.to_string()),
        }
    }

    fn target_msg_id(target: &MessageId) -> Result<i32, ConnectorError> {
        ids::parse_message_id(target.as_str())
            .map(|parsed| parsed.msg_id)
            .map_err(|err| ConnectorError::operation("resolve target", err.to_string()))
    }
}

#[async_trait]
impl NetworkApi for TelegramLoginApi {
    async fn connect(&self) {
        self.client.connect();
    }

    async fn disconnect(&self) {
        self.client.disconnect().await;
    }

    async fn logout_remote(&self) {
        self.client.logout_remote().await;
    }

    async fn is_logged_in(&self) -> bool {
        self.client.is_logged_in()
    }

    async fn handle_matrix_message(
        &self,
        message: &MatrixMessage,
    ) -> Result<MatrixMessageResponse, ConnectorError> {
        let sent = from_matrix::send_to_telegram(&self.client, message)
            .await
            .map_err(Self::convert_error)?;

        let id = ids::format_message_id(self.channel_of_portal(message), sent.id);
        // The echo of this message is already on its way back through the
        // update stream; the row must exist before the event is
        // acknowledged or it would be bridged twice.
        self.client
            .bridge()
            .save_message(
                &self.login_id,
                BridgeMessage {
                    portal: message.portal.clone(),
                    id: id.clone(),
                    part_id: String::new(),
                    event_id: message.event_id.clone(),
                    sender: ids::ghost_id(self.client.user_id()),
                },
            )
            .await
            .map_err(|err| ConnectorError::operation("record sent message", err.to_string()))?;

        Ok(MatrixMessageResponse {
            id,
            timestamp: sent.timestamp,
        })
    }

    async fn handle_matrix_edit(&self, message: &MatrixMessage) -> Result<(), ConnectorError> {
        let target = message
            .edit_target
            .as_ref()
            .ok_or_else(|| ConnectorError::operation("edit", "edit without target"))?;
        let msg_id = Self::target_msg_id(target)?;
        from_matrix::edit_on_telegram(&self.client, message, msg_id)
            .await
            .map_err(Self::convert_error)
    }

    async fn handle_matrix_reaction(
        &self,
        message: &MatrixMessage,
        target: &MessageId,
        emoji: &str,
    ) -> Result<(), ConnectorError> {
        let msg_id = Self::target_msg_id(target)?;
        from_matrix::react_on_telegram(&self.client, &message.portal, msg_id, Some(emoji))
            .await
            .map_err(Self::convert_error)
    }

    async fn handle_matrix_reaction_remove(
        &self,
        message: &MatrixMessage,
        target: &MessageId,
    ) -> Result<(), ConnectorError> {
        let msg_id = Self::target_msg_id(target)?;
        from_matrix::react_on_telegram(&self.client, &message.portal, msg_id, None)
            .await
            .map_err(Self::convert_error)
    }
}

/// Walk the dialog list once: store fresh access hashes and channel state
/// and nudge the framework to (re)create each portal.
pub(crate) async fn sync_chats(client: TelegramClient) {
    debug!("syncing chats for {}", client.user_id());
    let request = tl::functions::messages::GetDialogs {
        exclude_pinned: false,
        folder_id: None,
        offset_date: 0,
        offset_id: 0,
        offset_peer: tl::enums::InputPeer::Empty,
        limit: 100,
        hash: 0,
    };

    let (dialogs, chats, users) = match client.invoke(&request).await {
        Ok(tl::enums::messages::Dialogs::Dialogs(d)) => (d.dialogs, d.chats, d.users),
        Ok(tl::enums::messages::Dialogs::Slice(d)) => (d.dialogs, d.chats, d.users),
        Ok(tl::enums::messages::Dialogs::NotModified(_)) => return,
        Err(err) => {
            warn!("chat sync for {} failed: {err}", client.user_id());
            return;
        }
    };

    let store = client.store();
    for user in &users {
        let tl::enums::User::User(user) = user else {
            continue;
        };
        if let (false, Some(access_hash)) = (user.min, user.access_hash) {
            if let Err(err) =
                store.set_user_metadata(user.id, access_hash, user.username.as_deref())
            {
                warn!("failed to store metadata for user {}: {err}", user.id);
            }
        }
        client
            .bridge()
            .update_ghost(crate::ghost::profile_from_user(user))
            .await;
    }
    for chat in &chats {
        if let tl::enums::Chat::Channel(channel) = chat {
            if let (false, Some(access_hash)) = (channel.min, channel.access_hash) {
                if let Err(err) = store.set_channel_access_hash(channel.id, access_hash) {
                    warn!("failed to store access hash for channel {}: {err}", channel.id);
                }
            }
        }
    }

    let login_id = client.login_id().clone();
    for dialog in dialogs {
        let tl::enums::Dialog::Dialog(dialog) = dialog else {
            continue;
        };
        let (peer_type, chat_id) = PeerType::of_peer(&dialog.peer);
        if peer_type == PeerType::Channel {
            if let Some(pts) = dialog.pts {
                // Seed the channel state so the gap manager can fetch
                // differences for it, but never regress a known value.
                match store.get_channel_pts(chat_id) {
                    Ok(None) => {
                        if let Err(err) = store.set_channel_pts(chat_id, pts) {
                            warn!("failed to seed pts for channel {chat_id}: {err}");
                        }
                    }
                    Ok(Some(_)) => {}
                    Err(err) => warn!("failed to read pts for channel {chat_id}: {err}"),
                }
            }
        }
        let portal = ids::portal_key(peer_type, chat_id, &login_id);
        client
            .bridge()
            .queue_remote_event(&login_id, RemoteEvent::ChatResync { portal })
            .await;
    }
    info!("chat sync for {} finished", client.user_id());
}
