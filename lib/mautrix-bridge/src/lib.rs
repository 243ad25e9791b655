// Copyright 2024 - developers of the `mautrix-telegram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Interfaces a network connector implements for, and consumes from, the
//! generic bridge framework.
//!
//! The framework itself (portal room materialisation, the appservice HTTP
//! surface, event dispatch and backfill queueing) lives elsewhere; this
//! crate only defines the seam: the [`NetworkConnector`] and [`NetworkApi`]
//! traits a connector provides, the [`Bridge`] handle it calls back into,
//! and the data types that cross that boundary.

pub mod bridge;
pub mod connector;
pub mod event;
pub mod ids;
pub mod login;
pub mod message;

pub use bridge::{Bridge, BridgeError, BridgeMessage, GhostProfile, UploadedMedia};
pub use connector::{
    BridgeName, ConnectorError, MatrixMessageResponse, NetworkApi, NetworkCapabilities,
    NetworkConnector,
};
pub use event::{BridgeState, BridgeStateEvent, EventSender, RemoteEvent};
pub use ids::{EventId, GhostId, MatrixUserId, MessageId, PortalKey, RoomId, UserLoginId};
pub use login::{
    LoginDisplay, LoginError, LoginFlow, LoginInputField, LoginInputFieldType, LoginProcess,
    LoginStep, LoginStepType, NewLogin,
};
pub use message::{
    ConvertedMessage, ConvertedMessagePart, DisappearingSetting, DisappearingType, EncryptedFile,
    EventType, FileInfo, MatrixMessage, MessageContent,
};
