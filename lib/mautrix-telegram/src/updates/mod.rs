// Copyright 2024 - developers of the `mautrix-telegram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The update dispatcher and gap manager.
//!
//! Consumes the raw update stream of one login, runs it through the
//! sequence tracker, fills gaps with `updates.getDifference` /
//! `updates.getChannelDifference`, harvests access hashes from every
//! envelope, converts the surviving updates and queues them for the
//! bridge framework. Persisted sequence state only advances after an
//! update was handed off successfully; a crash in between replays the
//! update on the next connect.

pub(crate) mod adaptor;
mod state;

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use grammers_session::updates::UpdatesLike;
use grammers_tl_types as tl;
use log::{debug, error, info, trace, warn};
use mautrix_bridge::{EventSender, MessageId, PortalKey, RemoteEvent};
use tokio::sync::{mpsc, watch};

use crate::client::TelegramClient;
use crate::ghost;
use crate::ids::{self, PeerType};
use crate::msgconv::ConvertError;
use crate::msgconv::to_matrix::{self, ConvertContext};

use adaptor::{AdaptedUpdates, Applicable, ShortMessage};
use state::{Applied, Entry, Gap, MessageBox};

pub(crate) struct UpdateManager {
    client: TelegramClient,
    message_box: MessageBox,
    /// Channels whose access hash we already tried to rehydrate through a
    /// full difference.
    hash_rehydrated: HashSet<i64>,
}

impl UpdateManager {
    pub(crate) fn new(client: TelegramClient) -> Self {
        let store = client.store();
        let state = store.get_update_state().unwrap_or_else(|err| {
            error!("failed to load update state: {err}");
            None
        });
        let channels = store.all_channel_pts().unwrap_or_else(|err| {
            error!("failed to load channel state: {err}");
            Vec::new()
        });
        let mut message_box = MessageBox::load(state, channels);
        if !message_box.is_empty() {
            // Catch up on whatever happened while the bridge was down.
            message_box.force_get_diff();
        }
        Self {
            client,
            message_box,
            hash_rehydrated: HashSet::new(),
        }
    }

    /// The dispatcher loop. Handlers must return quickly; anything heavy
    /// (media transfers) already runs behind its own awaits and never
    /// blocks the socket reader, which only feeds the channel.
    pub(crate) async fn run(
        mut self,
        mut updates: mpsc::UnboundedReceiver<UpdatesLike>,
        mut cancel: watch::Receiver<bool>,
    ) {
        info!("update manager for {} starting", self.client.user_id());
        loop {
            self.fill_gaps().await;

            let mut wait = self.message_box.next_deadline_in();
            if wait.is_zero() {
                // A difference fetch is still pending because it just
                // failed; retry it in a moment instead of spinning.
                wait = Duration::from_secs(1);
            }
            tokio::select! {
                _ = cancel.changed() => break,
                received = updates.recv() => match received {
                    Some(updates_like) => self.handle(updates_like).await,
                    None => break,
                },
                _ = tokio::time::sleep(wait) => {
                    self.message_box.expire_deadlines();
                }
            }
        }
        info!("update manager for {} stopping", self.client.user_id());
    }

    async fn handle(&mut self, updates_like: UpdatesLike) {
        match updates_like {
            UpdatesLike::Updates(updates) => self.process_envelope(updates).await,
            UpdatesLike::ShortSentMessage { update, .. } => {
                // The send path already recorded the message; only the
                // sequence number matters here.
                self.process_envelope(tl::enums::Updates::UpdateShortSentMessage(update))
                    .await
            }
            UpdatesLike::AffectedMessages(affected) => {
                let adapted = adaptor::affected_messages(affected);
                self.apply_and_dispatch(adapted, HashMap::new()).await;
            }
            UpdatesLike::InvitedUsers(_) => {
                trace!("ignoring invited-users result");
            }
            UpdatesLike::Reconnection => {
                debug!("reconnected; fetching difference to cover the downtime");
                self.message_box.force_get_diff();
            }
        }
    }

    async fn process_envelope(&mut self, updates: tl::enums::Updates) {
        let adapted = match adaptor::adapt(updates) {
            Ok(adapted) => adapted,
            Err(Gap) => {
                self.message_box.force_get_diff();
                return;
            }
        };
        let users = self.harvest_peers(&adapted.users, &adapted.chats).await;
        self.apply_and_dispatch(adapted, users).await;
    }

    async fn apply_and_dispatch(
        &mut self,
        adapted: AdaptedUpdates,
        users: HashMap<i64, tl::types::User>,
    ) {
        match self.message_box.process_updates(adapted) {
            Ok(applied) => self.dispatch(applied, &users).await,
            Err(Gap) => {
                // fill_gaps picks the difference up on the next loop turn.
                debug!("envelope opened a gap; difference pending");
            }
        }
    }

    /// Issue any pending difference requests until none are left.
    async fn fill_gaps(&mut self) {
        while let Some(request) = self.message_box.get_difference() {
            debug!("requesting account difference: {request:?}");
            match self.client.invoke(&request).await {
                Ok(difference) => {
                    let (applied, users, chats, done) =
                        self.message_box.apply_difference(difference);
                    let users = self.harvest_peers(&users, &chats).await;
                    self.dispatch(applied, &users).await;
                    if done {
                        break;
                    }
                }
                Err(err) => {
                    warn!("updates.getDifference failed: {err}");
                    return;
                }
            }
        }

        while let Some((channel_id, pts)) = self.message_box.next_channel_diff() {
            if !self.fill_channel_gap(channel_id, pts).await {
                break;
            }
        }
    }

    /// Returns false when no further channel progress can be made now.
    async fn fill_channel_gap(&mut self, channel_id: i64, pts: i32) -> bool {
        let access_hash = match self.client.store().get_channel_access_hash(channel_id) {
            Ok(hash) => hash,
            Err(err) => {
                error!("failed to read access hash for channel {channel_id}: {err}");
                self.message_box.abandon_channel_diff(channel_id, false);
                return false;
            }
        };

        let access_hash = match access_hash {
            Some(hash) => hash,
            // Dropping the update would be unsound: this channel difference
            // may be the only way the bridge learns about the peer. Fetch
            // the full difference once to pick the hash up.
            None if self.hash_rehydrated.insert(channel_id) => {
                info!("missing access hash for channel {channel_id}, fetching difference");
                self.message_box.force_get_diff();
                return false;
            }
            None => {
                warn!("still no access hash for channel {channel_id}, giving up on it");
                self.message_box.abandon_channel_diff(channel_id, true);
                return true;
            }
        };

        let request = self
            .message_box
            .channel_diff_request(channel_id, access_hash, pts);
        debug!("requesting channel difference: {request:?}");
        match self.client.invoke(&request).await {
            Ok(difference) => {
                let (applied, users, chats, _done) = self
                    .message_box
                    .apply_channel_difference(channel_id, difference);
                let users = self.harvest_peers(&users, &chats).await;
                self.dispatch(applied, &users).await;
                true
            }
            Err(err) if err.is("CHANNEL_PRIVATE") || err.is("CHANNEL_INVALID") => {
                info!("cannot fetch difference for channel {channel_id}: {err}");
                self.message_box.abandon_channel_diff(channel_id, true);
                true
            }
            Err(err) => {
                warn!("updates.getChannelDifference for {channel_id} failed: {err}");
                self.message_box.abandon_channel_diff(channel_id, false);
                false
            }
        }
    }

    /// Record access hashes for every peer in an envelope and push ghost
    /// profile updates for the users. Returns the users indexed by ID for
    /// entity enrichment further down.
    async fn harvest_peers(
        &mut self,
        users: &[tl::enums::User],
        chats: &[tl::enums::Chat],
    ) -> HashMap<i64, tl::types::User> {
        let store = self.client.store();
        let bridge = self.client.bridge();
        let mut indexed = HashMap::with_capacity(users.len());

        for user in users {
            let tl::enums::User::User(user) = user else {
                continue;
            };
            // Hashes from min constructors are unusable for addressing.
            if let (false, Some(access_hash)) = (user.min, user.access_hash) {
                if let Err(err) =
                    store.set_user_metadata(user.id, access_hash, user.username.as_deref())
                {
                    warn!("failed to store metadata for user {}: {err}", user.id);
                }
            }
            bridge.update_ghost(ghost::profile_from_user(user)).await;
            indexed.insert(user.id, user.clone());
        }

        for chat in chats {
            match chat {
                tl::enums::Chat::Channel(channel) => {
                    if let (false, Some(access_hash)) = (channel.min, channel.access_hash) {
                        if let Err(err) = store.set_channel_access_hash(channel.id, access_hash) {
                            warn!(
                                "failed to store access hash for channel {}: {err}",
                                channel.id
                            );
                        }
                    }
                }
                tl::enums::Chat::ChannelForbidden(channel) => {
                    if let Err(err) =
                        store.set_channel_access_hash(channel.id, channel.access_hash)
                    {
                        warn!(
                            "failed to store access hash for channel {}: {err}",
                            channel.id
                        );
                    }
                }
                _ => {}
            }
        }

        indexed
    }

    /// Hand applied updates to the framework, committing sequence state
    /// after each successful hand-off and stopping at the first failure.
    async fn dispatch(&mut self, applied: Vec<Applied>, users: &HashMap<i64, tl::types::User>) {
        for Applied { item, state } in applied {
            if let Err(err) = self.dispatch_item(item, users).await {
                warn!("dispatch failed, sequence state not committed: {err}");
                return;
            }
            if let Some((entry, pts)) = state {
                if let Err(err) = self.persist_entry(entry, pts) {
                    error!("failed to persist state for {entry:?}: {err}");
                    return;
                }
            }
        }

        let (date, seq) = self.message_box.date_seq();
        if let Err(err) = self.client.store().set_date_seq(date, seq) {
            error!("failed to persist date/seq: {err}");
        }
    }

    fn persist_entry(&self, entry: Entry, pts: i32) -> Result<(), crate::store::StoreError> {
        let store = self.client.store();
        match entry {
            Entry::Account => store.set_pts(pts),
            Entry::Secret => store.set_qts(pts),
            Entry::Channel(channel_id) => store.set_channel_pts(channel_id, pts),
        }
    }

    async fn dispatch_item(
        &mut self,
        item: Applicable,
        users: &HashMap<i64, tl::types::User>,
    ) -> Result<(), ConvertError> {
        match item {
            Applicable::PtsAck { .. } => Ok(()),
            Applicable::ShortMessage(short) => self.dispatch_short_message(*short).await,
            Applicable::Update(update) => self.dispatch_update(update, users).await,
        }
    }

    async fn dispatch_short_message(&mut self, short: ShortMessage) -> Result<(), ConvertError> {
        let login = self.client.login_id().clone();
        let peer_type = if short.is_chat {
            PeerType::Chat
        } else {
            PeerType::User
        };
        let portal = ids::portal_key(peer_type, short.peer_id, &login);
        let message_id = ids::format_message_id(None, short.id);

        if self.already_bridged(&portal, &message_id).await {
            debug!("dropping echo of short message {message_id}");
            return Ok(());
        }

        let sender = self.sender_for(short.sender_id, short.out);
        let message = to_matrix::short_to_matrix(&short);
        self.client
            .bridge()
            .queue_remote_event(
                &login,
                RemoteEvent::Message {
                    portal,
                    sender,
                    id: message_id,
                    timestamp: short.date as i64,
                    message,
                },
            )
            .await;
        Ok(())
    }

    async fn dispatch_update(
        &mut self,
        update: tl::enums::Update,
        users: &HashMap<i64, tl::types::User>,
    ) -> Result<(), ConvertError> {
        use tl::enums::Update as U;
        match update {
            U::NewMessage(u) => self.dispatch_message(u.message, users, false).await,
            U::NewChannelMessage(u) => self.dispatch_message(u.message, users, false).await,
            U::EditMessage(u) => self.dispatch_message(u.message, users, true).await,
            U::EditChannelMessage(u) => self.dispatch_message(u.message, users, true).await,
            U::DeleteMessages(u) => self.dispatch_deletion(None, u.messages).await,
            U::DeleteChannelMessages(u) => {
                self.dispatch_deletion(Some(u.channel_id), u.messages).await
            }
            U::MessageReactions(u) => self.dispatch_reactions(u).await,
            U::UserName(u) => {
                // Prefer the rich data from the envelope when present.
                let profile = match users.get(&u.user_id) {
                    Some(user) => ghost::profile_from_user(user),
                    None => mautrix_bridge::GhostProfile {
                        id: ids::ghost_id(u.user_id),
                        name: Some(ghost::combine_name(
                            false,
                            u.user_id,
                            Some(&u.first_name),
                            Some(&u.last_name),
                            None,
                        )),
                        ..Default::default()
                    },
                };
                self.client.bridge().update_ghost(profile).await;
                Ok(())
            }
            U::PtsChanged => {
                debug!("updatePtsChanged received, fetching full difference");
                self.message_box.force_get_diff();
                Ok(())
            }
            U::Config => {
                debug!("server configuration changed");
                Ok(())
            }
            U::LoginToken => {
                // Only interesting to an in-flight QR login, which has its
                // own client and listener.
                trace!("ignoring login token update on a logged-in client");
                Ok(())
            }
            other => {
                trace!("ignoring update {other:?}");
                Ok(())
            }
        }
    }

    async fn dispatch_message(
        &mut self,
        message: tl::enums::Message,
        users: &HashMap<i64, tl::types::User>,
        edit: bool,
    ) -> Result<(), ConvertError> {
        let msg = match message {
            tl::enums::Message::Message(msg) => msg,
            tl::enums::Message::Service(_) => {
                // Service messages (joins, title changes, ...) surface as
                // chat resyncs through the framework, not as messages.
                return Ok(());
            }
            tl::enums::Message::Empty(_) => return Ok(()),
        };

        let login = self.client.login_id().clone();
        let (peer_type, chat_id) = PeerType::of_peer(&msg.peer_id);
        let channel_id = (peer_type == PeerType::Channel).then_some(chat_id);
        let portal = ids::portal_key(peer_type, chat_id, &login);
        let message_id = ids::format_message_id(channel_id, msg.id);

        if !edit && self.already_bridged(&portal, &message_id).await {
            debug!("message {message_id} already bridged, dropping echo");
            return Ok(());
        }

        let sender_id = match &msg.from_id {
            Some(tl::enums::Peer::User(user)) => Some(user.user_id),
            // Anonymous admins and channel posts are attributed to the
            // chat itself.
            Some(tl::enums::Peer::Channel(channel)) => Some(channel.channel_id),
            Some(tl::enums::Peer::Chat(chat)) => Some(chat.chat_id),
            // DMs omit from_id; the sender is the other side unless the
            // message is ours.
            None if peer_type == PeerType::User && !msg.out => Some(chat_id),
            None if peer_type == PeerType::Channel => Some(chat_id),
            None => None,
        };
        let sender = self.sender_for(sender_id, msg.out);

        let room_id = self.client.bridge().get_portal_room(&portal).await;
        let ctx = ConvertContext {
            client: &self.client,
            portal: &portal,
            room_id,
            channel_id,
            users,
            merge_caption: false,
        };
        let converted = to_matrix::telegram_to_matrix(&ctx, &msg).await?;

        let event = if edit {
            RemoteEvent::Edit {
                portal,
                sender,
                target: message_id,
                message: converted,
            }
        } else {
            RemoteEvent::Message {
                portal,
                sender,
                id: message_id,
                timestamp: msg.date as i64,
                message: converted,
            }
        };
        self.client.bridge().queue_remote_event(&login, event).await;
        Ok(())
    }

    async fn dispatch_deletion(
        &mut self,
        channel_id: Option<i64>,
        messages: Vec<i32>,
    ) -> Result<(), ConvertError> {
        let login = self.client.login_id().clone();
        let bridge = self.client.bridge();

        match channel_id {
            Some(channel_id) => {
                let portal = ids::portal_key(PeerType::Channel, channel_id, &login);
                let targets = messages
                    .into_iter()
                    .map(|id| ids::format_message_id(Some(channel_id), id))
                    .collect();
                bridge
                    .queue_remote_event(&login, RemoteEvent::MessageRemove { portal, targets })
                    .await;
            }
            None => {
                // Account-wide deletions don't name their chat; group the
                // IDs by the portals the message table knows them in.
                let mut by_portal: HashMap<PortalKey, Vec<MessageId>> = HashMap::new();
                for id in messages {
                    let message_id = ids::format_message_id(None, id);
                    match bridge
                        .get_message_by_remote_id(&login, None, &message_id)
                        .await
                    {
                        Ok(Some(known)) => {
                            by_portal.entry(known.portal).or_default().push(message_id)
                        }
                        Ok(None) => trace!("deletion for unbridged message {message_id}"),
                        Err(err) => {
                            return Err(ConvertError::Operation {
                                operation: "look up deleted message",
                                message: err.to_string(),
                            });
                        }
                    }
                }
                for (portal, targets) in by_portal {
                    bridge
                        .queue_remote_event(&login, RemoteEvent::MessageRemove { portal, targets })
                        .await;
                }
            }
        }
        Ok(())
    }

    async fn dispatch_reactions(
        &mut self,
        update: tl::types::UpdateMessageReactions,
    ) -> Result<(), ConvertError> {
        let login = self.client.login_id().clone();
        let (peer_type, chat_id) = PeerType::of_peer(&update.peer);
        let channel_id = (peer_type == PeerType::Channel).then_some(chat_id);
        let portal = ids::portal_key(peer_type, chat_id, &login);
        let target = ids::format_message_id(channel_id, update.msg_id);

        let tl::enums::MessageReactions::Reactions(reactions) = update.reactions;
        let Some(recent) = reactions.recent_reactions else {
            return Ok(());
        };

        for reaction in recent {
            let tl::enums::MessagePeerReaction::Reaction(reaction) = reaction;
            let sender_id = match &reaction.peer_id {
                tl::enums::Peer::User(user) => Some(user.user_id),
                _ => None,
            };
            let is_me = sender_id == Some(self.client.user_id());
            let Some((emoji_id, emoji)) =
                to_matrix::resolve_reaction(&self.client, &reaction.reaction).await
            else {
                continue;
            };
            self.client
                .bridge()
                .queue_remote_event(
                    &login,
                    RemoteEvent::Reaction {
                        portal: portal.clone(),
                        sender: self.sender_for(sender_id, is_me),
                        target: target.clone(),
                        emoji_id,
                        emoji,
                    },
                )
                .await;
        }
        Ok(())
    }

    async fn already_bridged(&self, portal: &PortalKey, message_id: &MessageId) -> bool {
        matches!(
            self.client
                .bridge()
                .get_message_by_remote_id(self.client.login_id(), Some(portal), message_id)
                .await,
            Ok(Some(_))
        )
    }

    fn sender_for(&self, sender_id: Option<i64>, is_me: bool) -> EventSender {
        match sender_id {
            Some(id) if !is_me => EventSender::ghost(ids::ghost_id(id)),
            Some(id) => EventSender::me(ids::ghost_id(id)),
            None => EventSender::me(ids::ghost_id(self.client.user_id())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use mautrix_bridge::{
        Bridge, BridgeError, BridgeMessage, BridgeState, EventId, GhostProfile, MatrixUserId,
        NewLogin, RoomId, UploadedMedia, UserLoginId,
    };

    use crate::client::TelegramClient;
    use crate::config::Config;
    use crate::store::Store;

    use super::*;

    /// Framework stand-in that records everything the connector hands it.
    #[derive(Default)]
    struct MockBridge {
        events: StdMutex<Vec<RemoteEvent>>,
        messages: StdMutex<Vec<BridgeMessage>>,
    }

    impl MockBridge {
        fn event_count(&self) -> usize {
            self.events.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Bridge for MockBridge {
        async fn queue_remote_event(&self, _login: &UserLoginId, event: RemoteEvent) {
            self.events.lock().unwrap().push(event);
        }

        async fn upload_media(
            &self,
            _room_id: Option<&RoomId>,
            data: Vec<u8>,
            _filename: &str,
            _mime_type: &str,
        ) -> Result<UploadedMedia, BridgeError> {
            Ok(UploadedMedia {
                uri: format!("mxc://example.com/{}", data.len()),
                encryption: None,
            })
        }

        async fn is_room_encrypted(&self, _room_id: &RoomId) -> bool {
            false
        }

        async fn download_media(
            &self,
            _uri: &str,
            _file: Option<&mautrix_bridge::EncryptedFile>,
        ) -> Result<Vec<u8>, BridgeError> {
            Ok(Vec::new())
        }

        async fn get_message_by_remote_id(
            &self,
            _login: &UserLoginId,
            portal: Option<&PortalKey>,
            id: &MessageId,
        ) -> Result<Option<BridgeMessage>, BridgeError> {
            Ok(self
                .messages
                .lock()
                .unwrap()
                .iter()
                .find(|message| {
                    message.id == *id
                        && portal.is_none_or(|portal| message.portal == *portal)
                })
                .cloned())
        }

        async fn get_message_by_event_id(
            &self,
            _event_id: &EventId,
        ) -> Result<Option<BridgeMessage>, BridgeError> {
            Ok(None)
        }

        async fn save_message(
            &self,
            _login: &UserLoginId,
            message: BridgeMessage,
        ) -> Result<(), BridgeError> {
            self.messages.lock().unwrap().push(message);
            Ok(())
        }

        async fn update_ghost(&self, _profile: GhostProfile) {}

        async fn send_bridge_state(&self, _login: &UserLoginId, _state: BridgeState) {}

        async fn create_user_login(
            &self,
            _user: &MatrixUserId,
            _login: NewLogin,
        ) -> Result<(), BridgeError> {
            Ok(())
        }

        async fn user_logins(&self, _user: &MatrixUserId) -> Vec<UserLoginId> {
            Vec::new()
        }

        async fn get_portal_room(&self, _portal: &PortalKey) -> Option<RoomId> {
            None
        }

        async fn create_dm_portal(
            &self,
            _login: &UserLoginId,
            _portal: &PortalKey,
        ) -> Result<RoomId, BridgeError> {
            Err(BridgeError::Other("not implemented".to_string()))
        }
    }

    #[allow(deprecated)]
    fn test_manager(bridge: Arc<MockBridge>) -> UpdateManager {
        use grammers_session::storages::TlSession;

        let store = Store::open(":memory:").unwrap();
        let config = Arc::new(Config {
            app_id: 1,
            app_hash: "hash".to_string(),
            ..Default::default()
        });
        // The client is never connected; the dispatcher only needs its
        // store and bridge handles.
        let bridge: Arc<dyn Bridge> = bridge;
        let client = TelegramClient::with_session(
            7777,
            config,
            bridge,
            store.scoped(7777),
            Arc::new(TlSession::new()),
        );
        UpdateManager::new(client)
    }

    fn short_message(id: i32) -> ShortMessage {
        ShortMessage {
            out: true,
            silent: false,
            id,
            is_chat: false,
            peer_id: 123,
            sender_id: None,
            message: "hello".to_string(),
            entities: Vec::new(),
            date: 1700000000,
            reply_to_msg_id: None,
            ttl_period: None,
            pts: 10,
            pts_count: 1,
        }
    }

    #[tokio::test]
    async fn short_messages_reach_the_bridge() {
        let bridge = Arc::new(MockBridge::default());
        let mut manager = test_manager(Arc::clone(&bridge));

        manager
            .dispatch_short_message(short_message(42))
            .await
            .unwrap();
        assert_eq!(bridge.event_count(), 1);
        match &bridge.events.lock().unwrap()[0] {
            RemoteEvent::Message { id, portal, .. } => {
                assert_eq!(id.as_str(), "42");
                assert_eq!(portal.id, "user:123");
                assert_eq!(portal.receiver, "7777");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn echo_of_sent_message_is_dropped() {
        let bridge = Arc::new(MockBridge::default());
        let mut manager = test_manager(Arc::clone(&bridge));
        let login = UserLoginId::new("7777");

        // The send path records the remote ID before the Matrix event is
        // acknowledged...
        bridge
            .save_message(
                &login,
                BridgeMessage {
                    portal: ids::portal_key(PeerType::User, 123, &login),
                    id: MessageId::new("42"),
                    part_id: String::new(),
                    event_id: EventId::new("$event"),
                    sender: ids::ghost_id(7777),
                },
            )
            .await
            .unwrap();

        // ...so the echo arriving through the update stream is a no-op.
        manager
            .dispatch_short_message(short_message(42))
            .await
            .unwrap();
        assert_eq!(bridge.event_count(), 0);

        // A different message still goes through.
        manager
            .dispatch_short_message(short_message(43))
            .await
            .unwrap();
        assert_eq!(bridge.event_count(), 1);
    }

    #[tokio::test]
    async fn deletions_group_by_portal() {
        let bridge = Arc::new(MockBridge::default());
        let mut manager = test_manager(Arc::clone(&bridge));
        let login = UserLoginId::new("7777");

        for (portal_user, msg_id) in [(1, "10"), (1, "11"), (2, "20")] {
            bridge
                .save_message(
                    &login,
                    BridgeMessage {
                        portal: ids::portal_key(PeerType::User, portal_user, &login),
                        id: MessageId::new(msg_id),
                        part_id: String::new(),
                        event_id: EventId::new(format!("${msg_id}")),
                        sender: ids::ghost_id(7777),
                    },
                )
                .await
                .unwrap();
        }

        manager
            .dispatch_deletion(None, vec![10, 11, 20, 99])
            .await
            .unwrap();

        let events = bridge.events.lock().unwrap();
        let mut totals: Vec<(String, usize)> = events
            .iter()
            .map(|event| match event {
                RemoteEvent::MessageRemove { portal, targets } => {
                    (portal.id.clone(), targets.len())
                }
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        totals.sort();
        // The unbridged ID 99 is dropped; the rest group by portal.
        assert_eq!(totals, vec![("user:1".to_string(), 2), ("user:2".to_string(), 1)]);
    }
}
