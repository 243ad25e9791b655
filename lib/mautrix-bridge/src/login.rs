// Copyright 2024 - developers of the `mautrix-telegram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Interactive login flows.
//!
//! A connector advertises [`LoginFlow`]s; the framework (or the legacy
//! provisioning API) drives a [`LoginProcess`] through its steps until a
//! [`LoginStepType::Complete`] step carries the [`NewLogin`].

use std::collections::HashMap;

use async_trait::async_trait;
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::UserLoginId;

/// A way to log into the remote network.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginFlow {
    /// Stable identifier, e.g. `phone` or `qr`.
    pub id: String,
    pub name: String,
    pub description: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginStepType {
    /// Ask the user for the listed input fields, then call
    /// [`LoginProcess::submit`].
    UserInput,
    /// Show [`LoginStep::display`] (e.g. a QR code) and call
    /// [`LoginProcess::wait`]. The same step may be re-emitted with fresh
    /// display data while waiting.
    DisplayAndWait,
    Complete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginInputFieldType {
    PhoneNumber,
    Code,
    Password,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginInputField {
    #[serde(rename = "type")]
    pub kind: LoginInputFieldType,
    /// Key to use in the [`LoginProcess::submit`] map.
    pub id: String,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "data")]
pub enum LoginDisplay {
    /// Render the contained URL as a QR code.
    Qr(String),
}

/// Everything the framework needs to persist a completed login.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewLogin {
    pub id: UserLoginId,
    /// Human-readable name of the remote account (phone or username).
    pub remote_name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoginStep {
    pub kind: LoginStepType,
    /// Stable step identifier, e.g. `fi.mau.telegram.code`.
    pub step_id: String,
    pub instructions: String,
    pub fields: Vec<LoginInputField>,
    pub display: Option<LoginDisplay>,
    pub complete: Option<NewLogin>,
}

impl LoginStep {
    pub fn user_input(
        step_id: &str,
        instructions: &str,
        fields: Vec<LoginInputField>,
    ) -> Self {
        Self {
            kind: LoginStepType::UserInput,
            step_id: step_id.to_string(),
            instructions: instructions.to_string(),
            fields,
            display: None,
            complete: None,
        }
    }

    pub fn display_and_wait(step_id: &str, instructions: &str, display: LoginDisplay) -> Self {
        Self {
            kind: LoginStepType::DisplayAndWait,
            step_id: step_id.to_string(),
            instructions: instructions.to_string(),
            fields: Vec::new(),
            display: Some(display),
            complete: None,
        }
    }

    pub fn complete(step_id: &str, login: NewLogin) -> Self {
        Self {
            kind: LoginStepType::Complete,
            step_id: step_id.to_string(),
            instructions: String::new(),
            fields: Vec::new(),
            display: None,
            complete: Some(login),
        }
    }
}

/// Login failures carry a stable machine-readable code so provisioning
/// APIs can translate them without string matching.
#[derive(Debug, Error)]
pub enum LoginError {
    #[error("{code}: {message}")]
    Stable {
        /// One of the documented stable codes (`phone_missing`,
        /// `send_code_failed`, `unexpected_step`, ...).
        code: &'static str,
        message: String,
    },
    #[error("login cancelled")]
    Cancelled,
    #[error("{0}")]
    Internal(String),
}

impl LoginError {
    pub fn stable(code: &'static str, message: impl Into<String>) -> Self {
        Self::Stable {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Stable { code, .. } => code,
            Self::Cancelled => "login_cancelled",
            Self::Internal(_) => "internal_error",
        }
    }
}

/// One in-flight interactive login.
///
/// Implementations own any temporary network clients and must release them
/// on [`LoginProcess::cancel`] as well as on completion.
#[async_trait]
pub trait LoginProcess: Send {
    /// Begin the flow and return the first step.
    async fn start(&mut self) -> Result<LoginStep, LoginError>;

    /// Submit the fields requested by a [`LoginStepType::UserInput`] step.
    async fn submit(&mut self, input: HashMap<String, String>) -> Result<LoginStep, LoginError>;

    /// Wait for a [`LoginStepType::DisplayAndWait`] step to resolve.
    async fn wait(&mut self) -> Result<LoginStep, LoginError>;

    /// Abort the flow, tearing down any temporary connection.
    async fn cancel(&mut self);
}
