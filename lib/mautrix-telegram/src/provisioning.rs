// Copyright 2024 - developers of the `mautrix-telegram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The legacy provisioning API.
//!
//! Kept for callers of the original bridge's HTTP surface: phone login,
//! QR login over WebSocket, contact listing, identifier resolution and DM
//! creation. Exactly one login flow may be in flight per Matrix user; a
//! new `request_code` or QR socket displaces the previous one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use log::{debug, info, warn};
use mautrix_bridge::{
    LoginDisplay, LoginError, LoginProcess, LoginStep, LoginStepType, MatrixUserId,
    NetworkConnector,
};
use serde_derive::Deserialize;
use serde_json::{Value, json};
use tokio::sync::Mutex;

use crate::connector::TelegramConnector;
use crate::ids::{self, PeerType};
use crate::login::{FLOW_PHONE, FLOW_QR};
use crate::media::{self, FileDescriptor, TransferOptions};

use grammers_tl_types as tl;

/// In-flight logins older than this are evicted.
const LOGIN_TIMEOUT: Duration = Duration::from_secs(60 * 60);

struct InflightLogin {
    process: Box<dyn LoginProcess>,
    step: LoginStep,
    started: Instant,
}

#[derive(Clone)]
pub struct ProvisioningApi {
    connector: TelegramConnector,
    logins: Arc<Mutex<HashMap<MatrixUserId, InflightLogin>>>,
}

#[derive(Deserialize)]
struct UserQuery {
    user_id: String,
}

#[derive(Deserialize)]
struct PhoneBody {
    phone: Option<String>,
}

#[derive(Deserialize)]
struct CodeBody {
    code: Option<String>,
}

#[derive(Deserialize)]
struct PasswordBody {
    password: Option<String>,
}

fn error_response(status: StatusCode, errcode: &str, error: &str) -> Response {
    (status, axum::Json(json!({"errcode": errcode, "error": error}))).into_response()
}

fn login_error_response(err: &LoginError) -> Response {
    error_response(StatusCode::BAD_REQUEST, err.code(), &err.to_string())
}

impl ProvisioningApi {
    pub fn new(connector: TelegramConnector) -> Self {
        Self {
            connector,
            logins: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The router to mount under the bridge's `/_matrix/provision` (or
    /// legacy `/provisioning`) prefix.
    pub fn router(self) -> Router {
        Router::new()
            .route("/login/request_code", post(request_code))
            .route("/login/send_code", post(send_code))
            .route("/login/send_password", post(send_password))
            .route("/login/qr", get(qr_login))
            .route("/logout", post(logout))
            .route("/contacts", get(contacts))
            .route("/resolve_identifier/{id}", post(resolve_identifier))
            .route("/pm/{id}", post(start_dm))
            .with_state(self)
    }

    /// Replace any previous in-flight login for the user.
    async fn displace_login(&self, user: &MatrixUserId, replacement: InflightLogin) {
        let mut logins = self.logins.lock().await;
        evict_stale(&mut logins).await;
        if let Some(mut old) = logins.insert(user.clone(), replacement) {
            debug!("displacing previous login flow of {user}");
            old.process.cancel().await;
        }
    }

    async fn with_login<F, T>(&self, user: &MatrixUserId, f: F) -> Result<T, Response>
    where
        F: AsyncFnOnce(&mut InflightLogin) -> Result<T, Response>,
    {
        let mut logins = self.logins.lock().await;
        evict_stale(&mut logins).await;
        let login = logins.get_mut(user).ok_or_else(|| {
            error_response(
                StatusCode::NOT_FOUND,
                "no_login",
                "no login in progress; start with request_code",
            )
        })?;
        let result = f(login).await;
        if result.is_ok() && login.step.kind == LoginStepType::Complete {
            logins.remove(user);
        }
        result
    }
}

async fn evict_stale(logins: &mut HashMap<MatrixUserId, InflightLogin>) {
    let stale: Vec<MatrixUserId> = logins
        .iter()
        .filter(|(_, login)| login.started.elapsed() >= LOGIN_TIMEOUT)
        .map(|(user, _)| user.clone())
        .collect();
    for user in stale {
        info!("evicting timed-out login flow of {user}");
        if let Some(mut login) = logins.remove(&user) {
            login.process.cancel().await;
        }
    }
}

fn step_state(step: &LoginStep) -> &'static str {
    match step.kind {
        LoginStepType::Complete => "logged-in",
        _ if step.step_id.ends_with("password") => "password",
        _ if step.step_id.ends_with("code") => "code",
        _ => "input",
    }
}

async fn request_code(
    State(api): State<ProvisioningApi>,
    Query(query): Query<UserQuery>,
    body: Option<axum::Json<PhoneBody>>,
) -> Response {
    let user = MatrixUserId::new(query.user_id);
    let Some(phone) = body.and_then(|body| body.0.phone).filter(|p| !p.is_empty()) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "phone_missing",
            "request body must contain a phone number",
        );
    };

    let mut process = match api.connector.create_login(&user, FLOW_PHONE).await {
        Ok(process) => process,
        Err(err) => return login_error_response(&err),
    };
    if let Err(err) = process.start().await {
        return login_error_response(&err);
    }

    let step = match process
        .submit(HashMap::from([("phone".to_string(), phone)]))
        .await
    {
        Ok(step) => step,
        Err(err) => return login_error_response(&err),
    };

    let state = step_state(&step);
    api.displace_login(
        &user,
        InflightLogin {
            process,
            step,
            started: Instant::now(),
        },
    )
    .await;
    axum::Json(json!({"state": state})).into_response()
}

async fn submit_field(
    api: &ProvisioningApi,
    user: &MatrixUserId,
    field: &'static str,
    value: Option<String>,
    missing_code: &'static str,
) -> Response {
    let Some(value) = value.filter(|value| !value.is_empty()) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            missing_code,
            &format!("request body must contain {field}"),
        );
    };

    let result = api
        .with_login(user, async |login: &mut InflightLogin| {
            let step = login
                .process
                .submit(HashMap::from([(field.to_string(), value)]))
                .await
                .map_err(|err| login_error_response(&err))?;
            login.step = step.clone();
            Ok(step)
        })
        .await;

    match result {
        Ok(step) => {
            let mut response = json!({"state": step_state(&step)});
            if let Some(complete) = &step.complete {
                response["username"] = json!(complete.remote_name);
            }
            axum::Json(response).into_response()
        }
        Err(response) => response,
    }
}

async fn send_code(
    State(api): State<ProvisioningApi>,
    Query(query): Query<UserQuery>,
    body: Option<axum::Json<CodeBody>>,
) -> Response {
    let user = MatrixUserId::new(query.user_id);
    submit_field(
        &api,
        &user,
        "code",
        body.and_then(|body| body.0.code),
        "phone_code_missing",
    )
    .await
}

async fn send_password(
    State(api): State<ProvisioningApi>,
    Query(query): Query<UserQuery>,
    body: Option<axum::Json<PasswordBody>>,
) -> Response {
    let user = MatrixUserId::new(query.user_id);
    submit_field(
        &api,
        &user,
        "password",
        body.and_then(|body| body.0.password),
        "password_missing",
    )
    .await
}

async fn qr_login(
    State(api): State<ProvisioningApi>,
    Query(query): Query<UserQuery>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let user = MatrixUserId::new(query.user_id);
    upgrade.on_upgrade(move |socket| run_qr_socket(api, user, socket))
}

/// Drive a QR login over a WebSocket: `{"code": url}` for every token
/// rotation, a final `{"success": true/false}`, and password submission
/// from the client when two-factor auth is enabled.
async fn run_qr_socket(api: ProvisioningApi, user: MatrixUserId, mut socket: WebSocket) {
    // The socket owns its process; it still registers in the in-flight
    // map so phone flows and other sockets displace it.
    let mut process = match api.connector.create_login(&user, FLOW_QR).await {
        Ok(process) => process,
        Err(err) => {
            let _ = socket
                .send(WsMessage::Text(
                    json!({"success": false, "error": err.to_string()}).to_string().into(),
                ))
                .await;
            return;
        }
    };

    let mut step = match process.start().await {
        Ok(step) => step,
        Err(err) => {
            let _ = socket
                .send(WsMessage::Text(
                    json!({"success": false, "error": err.to_string()}).to_string().into(),
                ))
                .await;
            return;
        }
    };

    loop {
        match step.kind {
            LoginStepType::DisplayAndWait => {
                if let Some(LoginDisplay::Qr(url)) = &step.display {
                    let sent = socket
                        .send(WsMessage::Text(json!({"code": url}).to_string().into()))
                        .await;
                    if sent.is_err() {
                        process.cancel().await;
                        return;
                    }
                }
                step = match process.wait().await {
                    Ok(step) => step,
                    Err(err) => {
                        let _ = socket
                            .send(WsMessage::Text(
                                json!({"success": false, "error": err.to_string()}).to_string().into(),
                            ))
                            .await;
                        return;
                    }
                };
            }
            LoginStepType::UserInput => {
                // Two-factor auth: ask the client for the password.
                let sent = socket
                    .send(WsMessage::Text(json!({"password_needed": true}).to_string().into()))
                    .await;
                if sent.is_err() {
                    process.cancel().await;
                    return;
                }
                let password = loop {
                    match socket.recv().await {
                        Some(Ok(WsMessage::Text(text))) => {
                            let value: Value =
                                serde_json::from_str(&text).unwrap_or(Value::Null);
                            if let Some(password) =
                                value.get("password").and_then(Value::as_str)
                            {
                                break password.to_string();
                            }
                        }
                        Some(Ok(_)) => continue,
                        _ => {
                            process.cancel().await;
                            return;
                        }
                    }
                };
                step = match process
                    .submit(HashMap::from([("password".to_string(), password)]))
                    .await
                {
                    Ok(step) => step,
                    Err(err) => {
                        let _ = socket
                            .send(WsMessage::Text(
                                json!({"success": false, "error": err.to_string()}).to_string().into(),
                            ))
                            .await;
                        return;
                    }
                };
            }
            LoginStepType::Complete => {
                let username = step
                    .complete
                    .as_ref()
                    .map(|complete| complete.remote_name.clone())
                    .unwrap_or_default();
                let _ = socket
                    .send(WsMessage::Text(
                        json!({"success": true, "username": username}).to_string().into(),
                    ))
                    .await;
                return;
            }
        }
    }
}

async fn logout(State(api): State<ProvisioningApi>, Query(query): Query<UserQuery>) -> Response {
    let user = MatrixUserId::new(query.user_id);
    let mut any = false;
    for login_id in api.connector.bridge().user_logins(&user).await {
        let Ok(user_id) = ids::parse_login_id(&login_id) else {
            continue;
        };
        if let Some(client) = api.connector.client_for(user_id).await {
            client.logout_remote().await;
            any = true;
        }
    }
    axum::Json(json!({"success": any})).into_response()
}

async fn contacts(State(api): State<ProvisioningApi>, Query(query): Query<UserQuery>) -> Response {
    let user = MatrixUserId::new(query.user_id);
    let Some(client) = first_client(&api, &user).await else {
        return error_response(StatusCode::FORBIDDEN, "no_login", "not logged in");
    };

    let response = match client
        .invoke(&tl::functions::contacts::GetContacts { hash: 0 })
        .await
    {
        Ok(tl::enums::contacts::Contacts::Contacts(contacts)) => contacts,
        Ok(tl::enums::contacts::Contacts::NotModified) => {
            return axum::Json(json!({})).into_response();
        }
        Err(err) => {
            return error_response(StatusCode::BAD_GATEWAY, "M_UNKNOWN", &err.to_string());
        }
    };

    let mut result = serde_json::Map::new();
    for user in &response.users {
        let tl::enums::User::User(user) = user else {
            continue;
        };
        let avatar_url = contact_avatar(&client, user).await;
        result.insert(
            user.id.to_string(),
            json!({
                "name": crate::ghost::profile_from_user(user).name,
                "username": user.username,
                "phone": user.phone,
                "is_bot": user.bot,
                "avatar_url": avatar_url,
            }),
        );
    }
    axum::Json(Value::Object(result)).into_response()
}

/// Transfer a contact's profile photo through the media pipeline. Cached
/// after the first call; failures just leave the avatar out.
async fn contact_avatar(
    client: &crate::client::TelegramClient,
    user: &tl::types::User,
) -> Option<String> {
    let photo_id = match &user.photo {
        Some(tl::enums::UserProfilePhoto::Photo(photo)) => photo.photo_id,
        _ => return None,
    };
    let access_hash = user.access_hash?;
    let descriptor = FileDescriptor::PeerPhoto {
        peer: tl::types::InputPeerUser {
            user_id: user.id,
            access_hash,
        }
        .into(),
        photo_id,
        big: true,
    };
    match media::transfer_to_matrix(client, &descriptor, TransferOptions::default()).await {
        Ok(file) => Some(file.uri),
        Err(err) => {
            warn!("failed to transfer avatar of {}: {err}", user.id);
            None
        }
    }
}

/// Resolve a username or phone number to a Telegram user.
async fn resolve(
    client: &crate::client::TelegramClient,
    identifier: &str,
) -> Result<tl::types::User, Response> {
    let stripped = identifier.trim_start_matches('@');
    let users = if stripped.chars().all(|c| c.is_ascii_digit() || c == '+') {
        // Phone numbers resolve through the contact import endpoint.
        match client
            .invoke(&tl::functions::contacts::ResolvePhone {
                phone: stripped.trim_start_matches('+').to_string(),
            })
            .await
        {
            Ok(tl::enums::contacts::ResolvedPeer::Peer(peer)) => peer.users,
            Err(err) => {
                return Err(error_response(
                    StatusCode::NOT_FOUND,
                    "M_NOT_FOUND",
                    &err.to_string(),
                ));
            }
        }
    } else {
        match client
            .invoke(&tl::functions::contacts::ResolveUsername {
                username: stripped.to_string(),
                referer: None,
            })
            .await
        {
            Ok(tl::enums::contacts::ResolvedPeer::Peer(peer)) => peer.users,
            Err(err) => {
                return Err(error_response(
                    StatusCode::NOT_FOUND,
                    "M_NOT_FOUND",
                    &err.to_string(),
                ));
            }
        }
    };

    users
        .into_iter()
        .find_map(|user| match user {
            tl::enums::User::User(user) => Some(user),
            tl::enums::User::Empty(_) => None,
        })
        .ok_or_else(|| {
            error_response(
                StatusCode::NOT_FOUND,
                "M_NOT_FOUND",
                "identifier did not resolve to a user",
            )
        })
}

async fn resolve_identifier(
    State(api): State<ProvisioningApi>,
    Query(query): Query<UserQuery>,
    Path(identifier): Path<String>,
) -> Response {
    let user = MatrixUserId::new(query.user_id);
    let Some(client) = first_client(&api, &user).await else {
        return error_response(StatusCode::FORBIDDEN, "no_login", "not logged in");
    };

    let resolved = match resolve(&client, &identifier).await {
        Ok(resolved) => resolved,
        Err(response) => return response,
    };

    let portal = ids::portal_key(PeerType::User, resolved.id, client.login_id());
    let room_id = client.bridge().get_portal_room(&portal).await;
    axum::Json(json!({
        "id": resolved.id,
        "contact_info": {
            "name": crate::ghost::profile_from_user(&resolved).name,
            "username": resolved.username,
            "phone": resolved.phone,
            "is_bot": resolved.bot,
        },
        "just_created": false,
        "room_id": room_id.map(|room_id| room_id.to_string()),
    }))
    .into_response()
}

async fn start_dm(
    State(api): State<ProvisioningApi>,
    Query(query): Query<UserQuery>,
    Path(identifier): Path<String>,
) -> Response {
    let user = MatrixUserId::new(query.user_id);
    let Some(client) = first_client(&api, &user).await else {
        return error_response(StatusCode::FORBIDDEN, "no_login", "not logged in");
    };

    let resolved = match resolve(&client, &identifier).await {
        Ok(resolved) => resolved,
        Err(response) => return response,
    };

    // Creating the DM needs the access hash later; store it right away.
    if let Some(access_hash) = resolved.access_hash {
        if let Err(err) = client.store().set_user_metadata(
            resolved.id,
            access_hash,
            resolved.username.as_deref(),
        ) {
            warn!("failed to store metadata for user {}: {err}", resolved.id);
        }
    }

    let portal = ids::portal_key(PeerType::User, resolved.id, client.login_id());
    let existing = client.bridge().get_portal_room(&portal).await;
    let just_created = existing.is_none();
    let room_id = match existing {
        Some(room_id) => room_id,
        None => match client
            .bridge()
            .create_dm_portal(client.login_id(), &portal)
            .await
        {
            Ok(room_id) => room_id,
            Err(err) => {
                return error_response(StatusCode::BAD_GATEWAY, "M_UNKNOWN", &err.to_string());
            }
        },
    };

    axum::Json(json!({
        "id": resolved.id,
        "just_created": just_created,
        "room_id": room_id.to_string(),
    }))
    .into_response()
}

async fn first_client(
    api: &ProvisioningApi,
    user: &MatrixUserId,
) -> Option<crate::client::TelegramClient> {
    for login_id in api.connector.bridge().user_logins(user).await {
        if let Ok(user_id) = ids::parse_login_id(&login_id) {
            if let Some(client) = api.connector.client_for(user_id).await {
                return Some(client);
            }
        }
    }
    None
}
