// Copyright 2024 - developers of the `mautrix-telegram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The per-login Telegram client.
//!
//! One [`TelegramClient`] exists per authenticated account. It owns the
//! MTProto sender pool, the raw update stream, the persisted session
//! object, and the long-lived tasks that keep all three alive. All API
//! calls from anywhere in the bridge go through [`TelegramClient::invoke`]
//! (or [`TelegramClient::invoke_in_dc`] for calls that must run on a
//! specific datacenter).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
#[allow(deprecated)]
use grammers_session::storages::TlSession;
use grammers_mtsender::{InvocationError, SenderPool, SenderPoolHandle};
use grammers_session::updates::UpdatesLike;
use grammers_tl_types::{self as tl, Deserializable, RemoteCall};
use log::{debug, error, info, warn};
use mautrix_bridge::{Bridge, BridgeState, BridgeStateEvent, UserLoginId};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::ids;
use crate::store::{ScopedStore, StoreError};
use crate::updates::UpdateManager;

/// Errors with a flood-wait at most this long are slept on and retried
/// once; anything above propagates.
const FLOOD_SLEEP_THRESHOLD: Duration = Duration::from_secs(60);

/// How often the session auto-saver flushes the session blob.
const SESSION_SAVE_INTERVAL: Duration = Duration::from_secs(60);

/// RPC error names that mean the session is gone for good.
const AUTH_ERRORS: [&str; 4] = [
    "AUTH_KEY_UNREGISTERED",
    "AUTH_KEY_DUPLICATED",
    "SESSION_REVOKED",
    "USER_DEACTIVATED",
];

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{0}")]
    Invocation(#[from] InvocationError),
    #[error("session storage: {0}")]
    Store(#[from] StoreError),
    #[error("stored session blob is corrupt")]
    BadSession,
    #[error("client is not connected")]
    NotConnected,
    #[error("logged out remotely: {0}")]
    LoggedOut(String),
}

impl ClientError {
    /// Matches on the RPC error name, `grammers` style.
    pub fn is(&self, rpc_error: &str) -> bool {
        match self {
            Self::Invocation(err) => err.is(rpc_error),
            _ => false,
        }
    }
}

pub(crate) struct ClientInner {
    pub(crate) user_id: i64,
    pub(crate) login_id: UserLoginId,
    pub(crate) config: Arc<Config>,
    pub(crate) bridge: Arc<dyn Bridge>,
    pub(crate) store: ScopedStore,
    #[allow(deprecated)]
    pub(crate) session: Arc<TlSession>,
    pub(crate) client: grammers_client::Client,
    pub(crate) pool_handle: SenderPoolHandle,
    // Consumed by `connect`.
    startup: Mutex<Option<Startup>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    initialized: watch::Sender<bool>,
    cancel: watch::Sender<bool>,
    logged_out: AtomicBool,
}

struct Startup {
    runner: BoxFuture<'static, ()>,
    updates: mpsc::UnboundedReceiver<UpdatesLike>,
}

/// Handle to one login's Telegram connection. Cheap to clone; all clones
/// share the same task tree.
#[derive(Clone)]
pub struct TelegramClient(pub(crate) Arc<ClientInner>);

impl TelegramClient {
    /// Build a client from the login's stored session. Does not touch the
    /// network; use [`TelegramClient::connect`] afterwards.
    pub fn from_store(
        user_id: i64,
        config: Arc<Config>,
        bridge: Arc<dyn Bridge>,
        store: ScopedStore,
    ) -> Result<Self, ClientError> {
        #[allow(deprecated)]
        let session = Arc::new(match store.load_session()? {
            Some(blob) => TlSession::load(&blob).map_err(|err| {
                error!("failed to load session blob for {user_id}: {err}");
                ClientError::BadSession
            })?,
            None => TlSession::new(),
        });

        Ok(Self::with_session(user_id, config, bridge, store, session))
    }

    /// Build a client around an existing session object. Used by login
    /// flows, which create the session before the first blob is stored.
    #[allow(deprecated)]
    pub fn with_session(
        user_id: i64,
        config: Arc<Config>,
        bridge: Arc<dyn Bridge>,
        store: ScopedStore,
        session: Arc<TlSession>,
    ) -> Self {
        let pool = SenderPool::new(Arc::clone(&session), config.app_id);
        let client = grammers_client::Client::new(&pool);
        let SenderPool {
            runner,
            handle,
            updates,
        } = pool;

        let (initialized, _) = watch::channel(false);
        let (cancel, _) = watch::channel(false);

        TelegramClient(Arc::new(ClientInner {
            user_id,
            login_id: ids::login_id(user_id),
            config,
            bridge,
            store,
            session,
            client,
            pool_handle: handle,
            startup: Mutex::new(Some(Startup {
                runner: Box::pin(runner.run()),
                updates,
            })),
            tasks: Mutex::new(Vec::new()),
            initialized,
            cancel,
            logged_out: AtomicBool::new(false),
        }))
    }

    pub fn user_id(&self) -> i64 {
        self.0.user_id
    }

    pub fn login_id(&self) -> &UserLoginId {
        &self.0.login_id
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.0.config
    }

    pub fn bridge(&self) -> &Arc<dyn Bridge> {
        &self.0.bridge
    }

    pub fn store(&self) -> &ScopedStore {
        &self.0.store
    }

    pub(crate) fn cancelled(&self) -> watch::Receiver<bool> {
        self.0.cancel.subscribe()
    }

    /// Start the connection. Non-blocking: spawns the sender-pool runner,
    /// the update dispatcher and the session auto-saver, then completes
    /// the first server round-trip in the background. Waiters synchronise
    /// on [`TelegramClient::wait_initialized`].
    pub fn connect(&self) {
        let Some(Startup { runner, updates }) = self.0.startup.lock().unwrap().take() else {
            debug!("connect called twice for {}", self.0.user_id);
            return;
        };

        let mut tasks = self.0.tasks.lock().unwrap();
        tasks.push(tokio::spawn(runner));

        let manager = UpdateManager::new(self.clone());
        tasks.push(tokio::spawn(manager.run(updates, self.cancelled())));

        let this = self.clone();
        tasks.push(tokio::spawn(async move {
            this.auto_save_loop().await;
        }));

        let this = self.clone();
        tasks.push(tokio::spawn(async move {
            this.finish_initialization().await;
        }));
    }

    async fn finish_initialization(&self) {
        self.send_state(BridgeState::new(BridgeStateEvent::Connecting))
            .await;
        // The first round-trip both proves the connection works and seeds
        // the update state when this login has none yet.
        match self.invoke(&tl::functions::updates::GetState {}).await {
            Ok(tl::enums::updates::State::State(state)) => {
                if let Ok(None) = self.0.store.get_update_state() {
                    let row = crate::store::UpdateStateRow {
                        pts: state.pts,
                        qts: state.qts,
                        date: state.date,
                        seq: state.seq,
                    };
                    if let Err(err) = self.0.store.set_update_state(row) {
                        warn!("failed to seed update state for {}: {err}", self.0.user_id);
                    }
                }
                info!("client for {} initialized", self.0.user_id);
                self.0.initialized.send_replace(true);
                self.send_state(BridgeState::new(BridgeStateEvent::Connected))
                    .await;
            }
            Err(err) => {
                // `invoke` already dealt with auth errors; everything else
                // is a transient failure worth reporting but not fatal.
                if !self.0.logged_out.load(Ordering::Relaxed) {
                    warn!("initialization for {} failed: {err}", self.0.user_id);
                    self.send_state(BridgeState::with_error(
                        BridgeStateEvent::TransientDisconnect,
                        err.to_string(),
                    ))
                    .await;
                }
            }
        }
    }

    /// Block until the first server round-trip completed.
    pub async fn wait_initialized(&self) {
        let mut rx = self.0.initialized.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    async fn auto_save_loop(&self) {
        let mut cancel = self.cancelled();
        let mut interval = tokio::time::interval(SESSION_SAVE_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.save_session();
                }
                _ = cancel.changed() => {
                    self.save_session();
                    break;
                }
            }
        }
    }

    /// Serialise the session object back into the store.
    pub fn save_session(&self) {
        if self.0.logged_out.load(Ordering::Relaxed) {
            return;
        }
        let blob = self.0.session.save();
        if let Err(err) = self.0.store.store_session(self.0.user_id, &blob) {
            warn!("failed to save session for {}: {err}", self.0.user_id);
        }
    }

    /// True iff a session blob exists and the server has not invalidated
    /// it since the client connected.
    pub fn is_logged_in(&self) -> bool {
        if self.0.logged_out.load(Ordering::Relaxed) {
            return false;
        }
        matches!(self.0.store.load_session(), Ok(Some(blob)) if !blob.is_empty())
    }

    /// Tear down the task tree and the connection pool. The remote
    /// session stays valid.
    pub async fn disconnect(&self) {
        info!("disconnecting client for {}", self.0.user_id);
        self.0.cancel.send_replace(true);
        self.0.pool_handle.quit();
        let tasks = std::mem::take(&mut *self.0.tasks.lock().unwrap());
        for task in tasks {
            task.abort();
        }
    }

    /// Invalidate the remote session, then tear everything down.
    pub async fn logout_remote(&self) {
        if let Err(err) = self.invoke(&tl::functions::auth::LogOut {}).await {
            warn!("auth.logOut for {} failed: {err}", self.0.user_id);
        }
        self.0.logged_out.store(true, Ordering::Relaxed);
        if let Err(err) = self.0.store.delete_login() {
            warn!("failed to delete login rows for {}: {err}", self.0.user_id);
        }
        self.send_state(BridgeState::new(BridgeStateEvent::LoggedOut))
            .await;
        self.disconnect().await;
    }

    /// Invoke a request on the login's home datacenter.
    ///
    /// Flood waits at or below the threshold are slept on and the request
    /// retried once; a second flood wait propagates. Auth-invalidation
    /// errors mark the login as logged out and tear the client down.
    pub async fn invoke<R: RemoteCall>(&self, request: &R) -> Result<R::Return, ClientError> {
        match self.0.client.invoke(request).await {
            Ok(response) => Ok(response),
            Err(err) => {
                let retry_after = self.handle_invocation_error(err).await?;
                tokio::time::sleep(retry_after).await;
                self.0.client.invoke(request).await.map_err(|err| {
                    warn!("request failed again after flood wait: {err}");
                    ClientError::Invocation(err)
                })
            }
        }
    }

    /// Invoke a request on a specific datacenter. Used for file transfers
    /// pinned to a media DC.
    pub async fn invoke_in_dc<R: RemoteCall>(
        &self,
        dc_id: i32,
        request: &R,
    ) -> Result<R::Return, ClientError> {
        let run = || async {
            let body = self
                .0
                .pool_handle
                .invoke_in_dc(dc_id, request.to_bytes())
                .await?;
            R::Return::from_bytes(&body).map_err(|err| InvocationError::from(err))
        };
        match run().await {
            Ok(response) => Ok(response),
            Err(err) => {
                let retry_after = self.handle_invocation_error(err).await?;
                tokio::time::sleep(retry_after).await;
                run().await.map_err(ClientError::Invocation)
            }
        }
    }

    /// Classify an invocation error: `Ok(duration)` means sleep that long
    /// and retry once, `Err` means propagate (after any side effects).
    async fn handle_invocation_error(
        &self,
        err: InvocationError,
    ) -> Result<Duration, ClientError> {
        if let InvocationError::Rpc(rpc) = &err {
            if rpc.code == 420 {
                let seconds = rpc.value.unwrap_or(0) as u64;
                if seconds <= FLOOD_SLEEP_THRESHOLD.as_secs() {
                    warn!(
                        "flood wait of {seconds}s for {}; sleeping and retrying once",
                        self.0.user_id
                    );
                    return Ok(Duration::from_secs(seconds));
                }
            }
            if AUTH_ERRORS.iter().any(|name| rpc.is(name)) {
                let reason = rpc.name.clone();
                error!("login {} invalidated by server: {reason}", self.0.user_id);
                self.mark_logged_out(&reason).await;
                return Err(ClientError::LoggedOut(reason));
            }
        }
        Err(ClientError::Invocation(err))
    }

    async fn mark_logged_out(&self, reason: &str) {
        if self.0.logged_out.swap(true, Ordering::Relaxed) {
            return;
        }
        if let Err(err) = self.0.store.delete_login() {
            warn!(
                "failed to delete invalidated login {}: {err}",
                self.0.user_id
            );
        }
        self.send_state(BridgeState::with_error(
            BridgeStateEvent::BadCredentials,
            reason,
        ))
        .await;
        self.disconnect().await;
    }

    async fn send_state(&self, mut state: BridgeState) {
        state.user_login = Some(self.0.login_id.clone());
        self.0
            .bridge
            .send_bridge_state(&self.0.login_id, state)
            .await;
    }
}

impl std::fmt::Debug for TelegramClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramClient")
            .field("user_id", &self.0.user_id)
            .finish()
    }
}
