// Copyright 2024 - developers of the `mautrix-telegram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Opaque identifier newtypes shared between the framework and connectors.
//!
//! The framework does not interpret any of these beyond equality and
//! ordering; each connector defines its own encoding (and must keep it
//! stable, since the values end up as database keys).

use std::fmt;

use serde_derive::{Deserialize, Serialize};

macro_rules! id_type {
    ( $(#[$doc:meta])* $name:ident ) => {
        $(#[$doc])*
        #[derive(
            Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

id_type! {
    /// Identifier of one authenticated remote account.
    UserLoginId
}
id_type! {
    /// Remote identifier of a message within its portal.
    MessageId
}
id_type! {
    /// Remote identifier of a user, used to derive the ghost Matrix user.
    GhostId
}
id_type! {
    /// A Matrix user ID (`@user:server`).
    MatrixUserId
}
id_type! {
    /// A Matrix room ID (`!room:server`).
    RoomId
}
id_type! {
    /// A Matrix event ID (`$event`).
    EventId
}

/// Key of a portal room.
///
/// `receiver` is empty for portals that are shared between all logins, and
/// set to the owning [`UserLoginId`] for portals scoped to one login
/// (direct chats seen from two accounts are two separate portals).
#[derive(Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortalKey {
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub receiver: String,
}

impl PortalKey {
    pub fn new(id: impl Into<String>, receiver: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            receiver: receiver.into(),
        }
    }

    /// A portal key without receiver, shared by every login.
    pub fn global(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            receiver: String::new(),
        }
    }
}

impl fmt::Display for PortalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.receiver.is_empty() {
            f.write_str(&self.id)
        } else {
            write!(f, "{}/{}", self.id, self.receiver)
        }
    }
}
