// Copyright 2024 - developers of the `mautrix-telegram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Interactive login flows: phone-code and QR-code.
//!
//! Both flows drive a temporary client over a fresh session; only a
//! completed login persists the session blob and becomes a durable
//! [`crate::client::TelegramClient`]. Cancelling a flow at any step
//! unwinds the temporary connection without leaving anything behind.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use async_trait::async_trait;
use grammers_client::types::{LoginToken, PasswordToken};
use grammers_client::SignInError;
use grammers_mtsender::{SenderPool, SenderPoolHandle};
use grammers_session::updates::UpdatesLike;
use grammers_session::Session as _;
#[allow(deprecated)]
use grammers_session::storages::TlSession;
use grammers_tl_types as tl;
use log::{debug, info, warn};
use mautrix_bridge::{
    LoginDisplay, LoginError, LoginFlow, LoginInputField, LoginInputFieldType, LoginProcess,
    LoginStep, MatrixUserId, NewLogin,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::connector::ConnectorInner;
use crate::store::UpdateStateRow;

pub(crate) const FLOW_PHONE: &str = "phone";
pub(crate) const FLOW_QR: &str = "qr";

const STEP_PHONE: &str = "fi.mau.telegram.phone";
const STEP_CODE: &str = "fi.mau.telegram.code";
const STEP_PASSWORD: &str = "fi.mau.telegram.password";
const STEP_QR: &str = "fi.mau.telegram.qr";
const STEP_COMPLETE: &str = "fi.mau.telegram.complete";

/// Fallback refresh interval when the server doesn't give a usable token
/// expiry.
const QR_REFRESH_FALLBACK: Duration = Duration::from_secs(20);

pub(crate) fn login_flows() -> Vec<LoginFlow> {
    vec![
        LoginFlow {
            id: FLOW_PHONE.to_string(),
            name: "Phone number".to_string(),
            description: "Log in with your phone number and a login code".to_string(),
        },
        LoginFlow {
            id: FLOW_QR.to_string(),
            name: "QR code".to_string(),
            description: "Scan a QR code with a logged-in Telegram app".to_string(),
        },
    ]
}

/// The short-lived client a flow runs on.
#[allow(deprecated)]
struct LoginClient {
    session: Arc<TlSession>,
    client: grammers_client::Client,
    handle: SenderPoolHandle,
    pool_task: JoinHandle<()>,
    updates: mpsc::UnboundedReceiver<UpdatesLike>,
}

impl LoginClient {
    #[allow(deprecated)]
    fn connect(api_id: i32) -> Self {
        let session = Arc::new(TlSession::new());
        let pool = SenderPool::new(Arc::clone(&session), api_id);
        let client = grammers_client::Client::new(&pool);
        let SenderPool {
            runner,
            handle,
            updates,
        } = pool;
        let pool_task = tokio::spawn(runner.run());
        Self {
            session,
            client,
            handle,
            pool_task,
            updates,
        }
    }

    fn shutdown(self) {
        self.handle.quit();
        self.pool_task.abort();
    }
}

/// Finish a login: persist the session, seed the update state, register
/// the login with the framework, and bring the durable client up.
async fn complete_login(
    shared: &Arc<ConnectorInner>,
    user: &MatrixUserId,
    client: LoginClient,
    remote_name: String,
) -> Result<LoginStep, LoginError> {
    let Some(session_user) = client.session.get_user() else {
        client.shutdown();
        return Err(LoginError::stable(
            "create_login_failed",
            "authorization did not record a signed-in user",
        ));
    };
    let user_id = session_user.id;
    info!("login flow for {user} completed as telegram user {user_id}");

    let scoped = shared.store.scoped(user_id);
    scoped
        .store_session(user_id, &client.session.save())
        .map_err(|err| LoginError::stable("create_login_failed", err.to_string()))?;
    if scoped
        .get_update_state()
        .map_err(|err| LoginError::stable("create_login_failed", err.to_string()))?
        .is_none()
    {
        scoped
            .set_update_state(UpdateStateRow::default())
            .map_err(|err| LoginError::stable("create_login_failed", err.to_string()))?;
    }

    let session = Arc::clone(&client.session);
    client.shutdown();

    let login = NewLogin {
        id: crate::ids::login_id(user_id),
        remote_name,
    };
    shared
        .bridge
        .create_user_login(user, login.clone())
        .await
        .map_err(|err| LoginError::stable("create_login_failed", err.to_string()))?;

    // Reuse the already-authorized session for the durable client and
    // kick off the initial chat sync in the background.
    shared
        .activate_login(user_id, session)
        .await
        .map_err(|err| LoginError::stable("start_login_failed", err.to_string()))?;

    Ok(LoginStep::complete(STEP_COMPLETE, login))
}

enum PhoneState {
    WaitingForPhone,
    WaitingForCode(LoginToken),
    WaitingForPassword(Option<PasswordToken>),
    Done,
}

pub(crate) struct PhoneLogin {
    shared: Arc<ConnectorInner>,
    user: MatrixUserId,
    client: Option<LoginClient>,
    state: PhoneState,
    phone: String,
}

impl PhoneLogin {
    pub(crate) fn new(shared: Arc<ConnectorInner>, user: MatrixUserId) -> Self {
        Self {
            shared,
            user,
            client: None,
            state: PhoneState::WaitingForPhone,
            phone: String::new(),
        }
    }

    fn client(&self) -> Result<&LoginClient, LoginError> {
        self.client
            .as_ref()
            .ok_or_else(|| LoginError::stable("no_login", "login client is gone"))
    }
}

#[async_trait]
impl LoginProcess for PhoneLogin {
    async fn start(&mut self) -> Result<LoginStep, LoginError> {
        Ok(LoginStep::user_input(
            STEP_PHONE,
            "Enter your phone number in international format",
            vec![LoginInputField {
                kind: LoginInputFieldType::PhoneNumber,
                id: "phone".to_string(),
                name: "Phone number".to_string(),
            }],
        ))
    }

    async fn submit(
        &mut self,
        mut input: HashMap<String, String>,
    ) -> Result<LoginStep, LoginError> {
        match &self.state {
            PhoneState::WaitingForPhone => {
                let phone = input
                    .remove("phone")
                    .filter(|phone| !phone.is_empty())
                    .ok_or_else(|| LoginError::stable("phone_missing", "phone is required"))?;

                let client = LoginClient::connect(self.shared.config.app_id);
                let token = client
                    .client
                    .request_login_code(&phone, &self.shared.config.app_hash)
                    .await
                    .map_err(|err| {
                        warn!("auth.sendCode for {} failed: {err}", self.user);
                        LoginError::stable("send_code_failed", err.to_string())
                    })?;

                self.phone = phone;
                self.client = Some(client);
                self.state = PhoneState::WaitingForCode(token);
                Ok(LoginStep::user_input(
                    STEP_CODE,
                    "Enter the login code Telegram sent you",
                    vec![LoginInputField {
                        kind: LoginInputFieldType::Code,
                        id: "code".to_string(),
                        name: "Login code".to_string(),
                    }],
                ))
            }
            PhoneState::WaitingForCode(token) => {
                let code = input.remove("code").filter(|code| !code.is_empty()).ok_or_else(
                    || LoginError::stable("phone_code_missing", "login code is required"),
                )?;

                match self.client()?.client.sign_in(token, &code).await {
                    Ok(_user) => {
                        self.state = PhoneState::Done;
                        let client = self.client.take().unwrap();
                        complete_login(&self.shared, &self.user, client, self.phone.clone()).await
                    }
                    Err(SignInError::PasswordRequired(password_token)) => {
                        let hint = password_token.hint().unwrap_or("none").to_string();
                        self.state = PhoneState::WaitingForPassword(Some(password_token));
                        Ok(LoginStep::user_input(
                            STEP_PASSWORD,
                            &format!(
                                "Enter your two-factor authentication password (hint: {hint})"
                            ),
                            vec![LoginInputField {
                                kind: LoginInputFieldType::Password,
                                id: "password".to_string(),
                                name: "Password".to_string(),
                            }],
                        ))
                    }
                    Err(SignInError::InvalidCode) => Err(LoginError::stable(
                        "phone_code_invalid",
                        "the login code is incorrect or expired",
                    )),
                    Err(SignInError::SignUpRequired { .. }) => Err(LoginError::stable(
                        "send_code_failed",
                        "this phone number is not registered on Telegram",
                    )),
                    Err(err) => Err(LoginError::stable("send_code_failed", err.to_string())),
                }
            }
            PhoneState::WaitingForPassword(_) => {
                let password = input
                    .remove("password")
                    .filter(|password| !password.is_empty())
                    .ok_or_else(|| {
                        LoginError::stable("password_missing", "password is required")
                    })?;

                let PhoneState::WaitingForPassword(token) = &mut self.state else {
                    unreachable!();
                };
                let token = token.take().ok_or_else(|| {
                    LoginError::stable("unexpected_step", "password was already submitted")
                })?;

                match self.client()?.client.check_password(token, password).await {
                    Ok(_user) => {
                        self.state = PhoneState::Done;
                        let client = self.client.take().unwrap();
                        complete_login(&self.shared, &self.user, client, self.phone.clone()).await
                    }
                    Err(SignInError::InvalidPassword(token)) => {
                        self.state = PhoneState::WaitingForPassword(Some(token));
                        Err(LoginError::stable(
                            "password_invalid",
                            "the password is incorrect",
                        ))
                    }
                    Err(err) => Err(LoginError::stable("send_code_failed", err.to_string())),
                }
            }
            PhoneState::Done => Err(LoginError::stable(
                "unexpected_step",
                "the login already completed",
            )),
        }
    }

    async fn wait(&mut self) -> Result<LoginStep, LoginError> {
        Err(LoginError::stable(
            "unexpected_step",
            "the phone flow has nothing to wait for",
        ))
    }

    async fn cancel(&mut self) {
        if let Some(client) = self.client.take() {
            client.shutdown();
        }
        self.state = PhoneState::Done;
    }
}

enum QrState {
    New,
    WaitingForScan { expires_at: Option<u64> },
    WaitingForPassword(Option<PasswordToken>),
    Done,
}

pub(crate) struct QrLogin {
    shared: Arc<ConnectorInner>,
    user: MatrixUserId,
    client: Option<LoginClient>,
    state: QrState,
}

impl QrLogin {
    pub(crate) fn new(shared: Arc<ConnectorInner>, user: MatrixUserId) -> Self {
        Self {
            shared,
            user,
            client: None,
            state: QrState::New,
        }
    }

    fn qr_url(token: &[u8]) -> String {
        format!("tg://login?token={}", URL_SAFE_NO_PAD.encode(token))
    }

    fn show_qr(&mut self, token: Vec<u8>, expires: i32) -> LoginStep {
        let now = unix_now();
        let expires_at = (expires as u64 > now).then_some(expires as u64);
        self.state = QrState::WaitingForScan { expires_at };
        LoginStep::display_and_wait(
            STEP_QR,
            "Scan the QR code with Telegram: Settings → Devices → Link Desktop Device",
            LoginDisplay::Qr(Self::qr_url(&token)),
        )
    }

    fn password_step(&mut self, token: Option<PasswordToken>) -> LoginStep {
        let hint = token
            .as_ref()
            .and_then(|token| token.hint())
            .unwrap_or("none")
            .to_string();
        self.state = QrState::WaitingForPassword(token);
        LoginStep::user_input(
            STEP_PASSWORD,
            &format!("Enter your two-factor authentication password (hint: {hint})"),
            vec![LoginInputField {
                kind: LoginInputFieldType::Password,
                id: "password".to_string(),
                name: "Password".to_string(),
            }],
        )
    }

    /// Export (or re-export) the login token and translate the result
    /// into the next step. `Ok(None)` means the login finished.
    async fn export_token(&mut self) -> Result<Option<LoginStep>, LoginError> {
        let config = &self.shared.config;
        let request = tl::functions::auth::ExportLoginToken {
            api_id: config.app_id,
            api_hash: config.app_hash.clone(),
            except_ids: Vec::new(),
        };

        let client = self
            .client
            .as_mut()
            .ok_or_else(|| LoginError::stable("no_login", "login client is gone"))?;

        // The token may have been accepted on another datacenter.
        let result = match client.client.invoke(&request).await {
            Ok(tl::enums::auth::LoginToken::MigrateTo(migrate)) => {
                debug!("QR login migrating to dc {}", migrate.dc_id);
                client.session.set_home_dc_id(migrate.dc_id);
                client
                    .client
                    .invoke(&tl::functions::auth::ImportLoginToken {
                        token: migrate.token,
                    })
                    .await
            }
            other => other,
        };

        match result {
            Ok(tl::enums::auth::LoginToken::Token(token)) => {
                Ok(Some(self.show_qr(token.token, token.expires)))
            }
            Ok(tl::enums::auth::LoginToken::Success(success)) => match success.authorization {
                tl::enums::auth::Authorization::Authorization(auth) => {
                    self.record_authorization(&auth);
                    Ok(None)
                }
                tl::enums::auth::Authorization::SignUpRequired(_) => Err(LoginError::stable(
                    "start_login_failed",
                    "this account is not registered on Telegram",
                )),
            },
            Ok(tl::enums::auth::LoginToken::MigrateTo(_)) => Err(LoginError::stable(
                "start_login_failed",
                "server asked for a second datacenter migration",
            )),
            Err(err) if err.is("SESSION_PASSWORD_NEEDED") => {
                let token = client.client.get_password_token().await.ok();
                Ok(Some(self.password_step(token)))
            }
            Err(err) => Err(LoginError::stable("start_login_failed", err.to_string())),
        }
    }

    /// Remember the authorized user in the temporary session so the
    /// durable client inherits it.
    fn record_authorization(&mut self, auth: &tl::types::auth::Authorization) {
        let Some(client) = self.client.as_ref() else {
            return;
        };
        if let tl::enums::User::User(user) = &auth.user {
            let dc = client.session.home_dc_id();
            client.session.set_user(user.id, dc, user.bot);
        }
    }

    fn remote_name(&self) -> String {
        self.client
            .as_ref()
            .and_then(|client| client.session.get_user())
            .map(|user| user.id.to_string())
            .unwrap_or_default()
    }

    async fn finish(&mut self) -> Result<LoginStep, LoginError> {
        self.state = QrState::Done;
        let client = self
            .client
            .take()
            .ok_or_else(|| LoginError::stable("no_login", "login client is gone"))?;
        let remote_name = self.remote_name();
        complete_login(&self.shared, &self.user, client, remote_name).await
    }
}

#[async_trait]
impl LoginProcess for QrLogin {
    async fn start(&mut self) -> Result<LoginStep, LoginError> {
        self.client = Some(LoginClient::connect(self.shared.config.app_id));
        match self.export_token().await? {
            Some(step) => Ok(step),
            None => self.finish().await,
        }
    }

    async fn submit(&mut self, mut input: HashMap<String, String>) -> Result<LoginStep, LoginError> {
        let QrState::WaitingForPassword(token) = &mut self.state else {
            return Err(LoginError::stable(
                "unexpected_step",
                "the QR flow only takes input for the password step",
            ));
        };
        let password = input
            .remove("password")
            .filter(|password| !password.is_empty())
            .ok_or_else(|| LoginError::stable("password_missing", "password is required"))?;
        let token = token.take().ok_or_else(|| {
            LoginError::stable("unexpected_step", "password was already submitted")
        })?;

        let client = self
            .client
            .as_ref()
            .ok_or_else(|| LoginError::stable("no_login", "login client is gone"))?;
        match client.client.check_password(token, password).await {
            Ok(_user) => self.finish().await,
            Err(SignInError::InvalidPassword(token)) => {
                self.state = QrState::WaitingForPassword(Some(token));
                Err(LoginError::stable(
                    "password_invalid",
                    "the password is incorrect",
                ))
            }
            Err(err) => Err(LoginError::stable("start_login_failed", err.to_string())),
        }
    }

    /// Wait for the token to be scanned, for it to expire (emitting a
    /// fresh QR code), or for the server to demand a password.
    async fn wait(&mut self) -> Result<LoginStep, LoginError> {
        let QrState::WaitingForScan { expires_at } = &self.state else {
            return Err(LoginError::stable(
                "unexpected_step",
                "the QR flow is not waiting for a scan",
            ));
        };

        let refresh_in = expires_at
            .map(|at| Duration::from_secs(at.saturating_sub(unix_now()).clamp(1, 120)))
            .unwrap_or(QR_REFRESH_FALLBACK);

        let client = self
            .client
            .as_mut()
            .ok_or_else(|| LoginError::stable("no_login", "login client is gone"))?;

        // The only update a login client cares about is the login-token
        // push that follows a scan.
        let deadline = tokio::time::sleep(refresh_in);
        tokio::pin!(deadline);
        let scanned = loop {
            tokio::select! {
                _ = &mut deadline => break false,
                received = client.updates.recv() => match received {
                    Some(UpdatesLike::Updates(updates)) if contains_login_token(&updates) => {
                        break true;
                    }
                    Some(_) => continue,
                    None => {
                        return Err(LoginError::stable(
                            "start_login_failed",
                            "login connection closed",
                        ));
                    }
                },
            }
        };

        if scanned {
            debug!("QR token was scanned, exchanging it for an authorization");
        } else {
            debug!("QR token expired, rotating");
        }
        match self.export_token().await? {
            Some(step) => Ok(step),
            None => self.finish().await,
        }
    }

    async fn cancel(&mut self) {
        if let Some(client) = self.client.take() {
            client.shutdown();
        }
        self.state = QrState::Done;
    }
}

fn contains_login_token(updates: &tl::enums::Updates) -> bool {
    let inner: &[tl::enums::Update] = match updates {
        tl::enums::Updates::Updates(container) => &container.updates,
        tl::enums::Updates::Combined(container) => &container.updates,
        tl::enums::Updates::UpdateShort(short) => std::slice::from_ref(&short.update),
        _ => return false,
    };
    inner
        .iter()
        .any(|update| matches!(update, tl::enums::Update::LoginToken))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qr_url_encoding() {
        assert_eq!(
            QrLogin::qr_url(&[0xde, 0xad, 0xbe, 0xef]),
            "tg://login?token=3q2-7w"
        );
    }

    #[test]
    fn login_token_detection() {
        let updates = tl::enums::Updates::UpdateShort(tl::types::UpdateShort {
            update: tl::enums::Update::LoginToken,
            date: 0,
        });
        assert!(contains_login_token(&updates));

        let updates = tl::enums::Updates::UpdateShort(tl::types::UpdateShort {
            update: tl::enums::Update::PtsChanged,
            date: 0,
        });
        assert!(!contains_login_token(&updates));
    }

    #[test]
    fn advertised_flows() {
        let flows = login_flows();
        assert_eq!(flows.len(), 2);
        assert_eq!(flows[0].id, FLOW_PHONE);
        assert_eq!(flows[1].id, FLOW_QR);
    }
}
