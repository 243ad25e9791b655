// Copyright 2024 - developers of the `mautrix-telegram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Ghost (puppet) profile computation.
//!
//! The framework owns the ghost users; the connector only computes what
//! their profiles should look like from the Telegram user data it sees.

use grammers_tl_types as tl;
use mautrix_bridge::GhostProfile;

use crate::ids;

/// Display name for a Telegram user, mirroring what official clients
/// show.
pub(crate) fn combine_name(
    deleted: bool,
    id: i64,
    first_name: Option<&str>,
    last_name: Option<&str>,
    username: Option<&str>,
) -> String {
    if deleted {
        return format!("Deleted account {id}");
    }
    let name = [first_name, last_name]
        .iter()
        .flatten()
        .copied()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    if name.is_empty() {
        username.map(str::to_string).unwrap_or_else(|| id.to_string())
    } else {
        name
    }
}

fn identifiers_for(username: Option<&str>, phone: Option<&str>) -> Vec<String> {
    let mut identifiers = Vec::new();
    if let Some(username) = username {
        identifiers.push(format!("telegram:@{username}"));
    }
    if let Some(phone) = phone {
        identifiers.push(format!("tel:+{}", phone.trim_start_matches('+')));
    }
    identifiers
}

/// Compute the ghost profile for a user. The avatar is transferred
/// separately (it needs the media pipeline) and patched in by the caller
/// when it changed.
pub(crate) fn profile_from_user(user: &tl::types::User) -> GhostProfile {
    GhostProfile {
        id: ids::ghost_id(user.id),
        name: Some(combine_name(
            user.deleted,
            user.id,
            user.first_name.as_deref(),
            user.last_name.as_deref(),
            user.username.as_deref(),
        )),
        avatar_url: None,
        is_bot: user.bot,
        identifiers: identifiers_for(user.username.as_deref(), user.phone.as_deref()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_combination() {
        assert_eq!(combine_name(false, 7, Some("First"), None, None), "First");
        assert_eq!(
            combine_name(false, 7, Some("First"), Some("Last"), None),
            "First Last"
        );
        assert_eq!(
            combine_name(false, 7, None, None, Some("someone")),
            "someone"
        );
        assert_eq!(combine_name(false, 7, None, None, None), "7");
    }

    #[test]
    fn deleted_account_fallback() {
        assert_eq!(
            combine_name(true, 42, Some("ignored"), None, None),
            "Deleted account 42"
        );
    }

    #[test]
    fn identifier_rendering() {
        assert_eq!(
            identifiers_for(Some("someone"), Some("15551234567")),
            vec![
                "telegram:@someone".to_string(),
                "tel:+15551234567".to_string()
            ]
        );
        assert_eq!(
            identifiers_for(None, Some("+15551234567")),
            vec!["tel:+15551234567".to_string()]
        );
    }
}
