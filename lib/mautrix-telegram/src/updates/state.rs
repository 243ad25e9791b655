// Copyright 2024 - developers of the `mautrix-telegram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Pure sequence tracking for the update stream.
//!
//! This module decides, for every incoming update, whether it should be
//! applied, dropped as a duplicate, buffered as a possible gap, or force a
//! difference fetch. It performs no I/O: the [`super::UpdateManager`]
//! feeds it envelopes and persists the state transitions it reports.
//!
//! Each entry (the account-wide `pts`, the secondary `qts` stream, and
//! one per channel) may at any time be "getting difference"; while it is,
//! socket updates for it are dropped, because the difference response
//! will contain them. A gap that is not confirmed within half a second
//! becomes a difference fetch; so does prolonged silence.
//!
//! See <https://core.telegram.org/api/updates>.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use grammers_tl_types as tl;
use log::{debug, info, trace};

use crate::store::UpdateStateRow;

use super::adaptor::{AdaptedUpdates, Applicable};

#[cfg(not(test))]
use std::time::Instant;
#[cfg(test)]
pub(crate) use mock_instant::Instant;

/// Telegram sends `seq = 0` when "it doesn't matter"; so do we.
pub(crate) const NO_SEQ: i32 = 0;

/// Updates with `pts = 0` (observed with e.g. `ChannelParticipant`)
/// carry ordering that should be ignored.
pub(crate) const NO_PTS: i32 = 0;

pub(crate) const NO_DATE: i32 = 0;

// > It may be useful to wait up to 0.5 seconds
pub(crate) const POSSIBLE_GAP_TIMEOUT: Duration = Duration::from_millis(500);

/// After this long without any update for an entry, fetch the difference
/// to make sure nothing was lost. Documentation recommends 15 minutes.
pub(crate) const NO_UPDATES_TIMEOUT: Duration = Duration::from_secs(15 * 60);

const USER_CHANNEL_DIFF_LIMIT: i32 = 100;

/// The stream a sequence value belongs to.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Entry {
    /// Account-wide `pts`: private chats and small groups.
    Account,
    /// Account-wide `qts`: encrypted chats and certain bot updates.
    Secret,
    /// Channel-specific `pts`.
    Channel(i64),
}

/// Marker: a gap was detected and a difference fetch is now pending.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Gap;

/// `(pts, pts_count)` information of one update.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PtsInfo {
    pub(crate) entry: Entry,
    pub(crate) pts: i32,
    pub(crate) pts_count: i32,
}

#[derive(Debug)]
struct State {
    pts: i32,
    deadline: Instant,
}

#[derive(Debug)]
struct PossibleGap {
    deadline: Instant,
    /// Pending updates with a larger `pts` that produced the gap.
    updates: Vec<Applicable>,
}

/// An update that passed sequence checks, along with the state value to
/// persist once it has been dispatched.
#[derive(Debug)]
pub(crate) struct Applied {
    pub(crate) item: Applicable,
    pub(crate) state: Option<(Entry, i32)>,
}

/// In-memory mirror of the persisted update state, plus gap bookkeeping.
pub(crate) struct MessageBox {
    map: HashMap<Entry, State>,
    date: i32,
    seq: i32,
    possible_gaps: HashMap<Entry, PossibleGap>,
    getting_diff_for: HashSet<Entry>,
}

fn next_updates_deadline() -> Instant {
    Instant::now() + NO_UPDATES_TIMEOUT
}

impl PtsInfo {
    pub(crate) fn of(item: &Applicable) -> Option<Self> {
        match item {
            Applicable::Update(update) => Self::from_update(update),
            Applicable::ShortMessage(short) => Some(Self {
                entry: Entry::Account,
                pts: short.pts,
                pts_count: short.pts_count,
            }),
            Applicable::PtsAck {
                entry,
                pts,
                pts_count,
            } => Some(Self {
                entry: *entry,
                pts: *pts,
                pts_count: *pts_count,
            }),
        }
    }

    fn from_update(update: &tl::enums::Update) -> Option<Self> {
        use tl::enums::Update as U;
        let info = match update {
            U::NewMessage(u) => Self {
                entry: Entry::Account,
                pts: u.pts,
                pts_count: u.pts_count,
            },
            U::DeleteMessages(u) => Self {
                entry: Entry::Account,
                pts: u.pts,
                pts_count: u.pts_count,
            },
            U::ReadHistoryInbox(u) => Self {
                entry: Entry::Account,
                pts: u.pts,
                pts_count: u.pts_count,
            },
            U::ReadHistoryOutbox(u) => Self {
                entry: Entry::Account,
                pts: u.pts,
                pts_count: u.pts_count,
            },
            U::WebPage(u) => Self {
                entry: Entry::Account,
                pts: u.pts,
                pts_count: u.pts_count,
            },
            U::ReadMessagesContents(u) => Self {
                entry: Entry::Account,
                pts: u.pts,
                pts_count: u.pts_count,
            },
            U::EditMessage(u) => Self {
                entry: Entry::Account,
                pts: u.pts,
                pts_count: u.pts_count,
            },
            U::PinnedMessages(u) => Self {
                entry: Entry::Account,
                pts: u.pts,
                pts_count: u.pts_count,
            },
            U::FolderPeers(u) => Self {
                entry: Entry::Account,
                pts: u.pts,
                pts_count: u.pts_count,
            },
            U::NewChannelMessage(u) => Self {
                entry: Entry::Channel(message_channel_id(&u.message)?),
                pts: u.pts,
                pts_count: u.pts_count,
            },
            U::EditChannelMessage(u) => Self {
                entry: Entry::Channel(message_channel_id(&u.message)?),
                pts: u.pts,
                pts_count: u.pts_count,
            },
            U::DeleteChannelMessages(u) => Self {
                entry: Entry::Channel(u.channel_id),
                pts: u.pts,
                pts_count: u.pts_count,
            },
            U::ChannelWebPage(u) => Self {
                entry: Entry::Channel(u.channel_id),
                pts: u.pts,
                pts_count: u.pts_count,
            },
            U::PinnedChannelMessages(u) => Self {
                entry: Entry::Channel(u.channel_id),
                pts: u.pts,
                pts_count: u.pts_count,
            },
            U::ReadChannelInbox(u) => Self {
                entry: Entry::Channel(u.channel_id),
                pts: u.pts,
                pts_count: 0,
            },
            U::NewEncryptedMessage(u) => Self {
                entry: Entry::Secret,
                pts: u.qts,
                pts_count: 1,
            },
            U::ChatParticipant(u) => Self {
                entry: Entry::Secret,
                pts: u.qts,
                pts_count: 1,
            },
            U::ChannelParticipant(u) => Self {
                entry: Entry::Secret,
                pts: u.qts,
                pts_count: 1,
            },
            U::BotStopped(u) => Self {
                entry: Entry::Secret,
                pts: u.qts,
                pts_count: 1,
            },
            _ => return None,
        };
        // `pts = 0` means the ordering must be ignored for this one.
        if info.pts == NO_PTS {
            None
        } else {
            Some(info)
        }
    }
}

/// The channel an update's message belongs to, if it's a channel message.
pub(crate) fn message_channel_id(message: &tl::enums::Message) -> Option<i64> {
    let peer = match message {
        tl::enums::Message::Empty(m) => m.peer_id.as_ref(),
        tl::enums::Message::Message(m) => Some(&m.peer_id),
        tl::enums::Message::Service(m) => Some(&m.peer_id),
    }?;
    match peer {
        tl::enums::Peer::Channel(c) => Some(c.channel_id),
        _ => None,
    }
}

impl MessageBox {
    /// Reconstruct the box from persisted state.
    pub(crate) fn load(state: Option<UpdateStateRow>, channels: Vec<(i64, i32)>) -> Self {
        trace!("loading message box with state {state:?} + {} channels", channels.len());
        let deadline = next_updates_deadline();
        let state = state.unwrap_or_default();
        let mut map = HashMap::with_capacity(2 + channels.len());
        map.insert(
            Entry::Account,
            State {
                pts: state.pts,
                deadline,
            },
        );
        map.insert(
            Entry::Secret,
            State {
                pts: state.qts,
                deadline,
            },
        );
        map.extend(channels.into_iter().map(|(channel_id, pts)| {
            (Entry::Channel(channel_id), State { pts, deadline })
        }));

        Self {
            map,
            date: state.date.max(1), // zero date breaks getDifference
            seq: state.seq,
            possible_gaps: HashMap::new(),
            getting_diff_for: HashSet::new(),
        }
    }

    /// Current account-wide state, for persisting.
    pub(crate) fn state_row(&self) -> UpdateStateRow {
        UpdateStateRow {
            pts: self.map.get(&Entry::Account).map(|s| s.pts).unwrap_or(NO_PTS),
            qts: self.map.get(&Entry::Secret).map(|s| s.pts).unwrap_or(NO_PTS),
            date: self.date,
            seq: self.seq,
        }
    }

    pub(crate) fn date_seq(&self) -> (i32, i32) {
        (self.date, self.seq)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.map
            .get(&Entry::Account)
            .map(|s| s.pts)
            .unwrap_or(NO_PTS)
            == NO_PTS
    }

    /// Overwrite the account-wide state, e.g. with `updates.getState`
    /// right after login.
    pub(crate) fn set_state(&mut self, state: UpdateStateRow) {
        let deadline = next_updates_deadline();
        self.map.insert(
            Entry::Account,
            State {
                pts: state.pts,
                deadline,
            },
        );
        self.map.insert(
            Entry::Secret,
            State {
                pts: state.qts,
                deadline,
            },
        );
        self.date = state.date.max(1);
        self.seq = state.seq;
    }

    /// Remember a channel's state if no entry existed yet (e.g. when the
    /// channel shows up in a dialog list).
    pub(crate) fn try_set_channel_state(&mut self, channel_id: i64, pts: i32) {
        self.map
            .entry(Entry::Channel(channel_id))
            .or_insert_with(|| State {
                pts,
                deadline: next_updates_deadline(),
            });
    }

    /// Whether the entry is currently fetching its difference.
    pub(crate) fn getting_difference_for(&self, entry: Entry) -> bool {
        self.getting_diff_for.contains(&entry)
    }

    fn try_begin_get_diff(&mut self, entry: Entry) {
        if !self.map.contains_key(&entry) {
            // No state to base a difference request on; the next update
            // for the entry will seed it instead.
            return;
        }
        self.getting_diff_for.insert(entry);
        self.possible_gaps.remove(&entry);
    }

    fn end_get_diff(&mut self, entry: Entry) {
        if !self.getting_diff_for.remove(&entry) {
            panic!("ended get diff for {entry:?} which was not in progress");
        }
        self.reset_deadline(entry, next_updates_deadline());
    }

    fn reset_deadline(&mut self, entry: Entry, deadline: Instant) {
        if let Some(state) = self.map.get_mut(&entry) {
            state.deadline = deadline;
        }
    }

    fn reset_channel_deadline(&mut self, channel_id: i64, timeout: Option<i32>) {
        self.reset_deadline(
            Entry::Channel(channel_id),
            Instant::now()
                + timeout
                    .map(|t| Duration::from_secs(t as _))
                    .unwrap_or(NO_UPDATES_TIMEOUT),
        );
    }

    /// Next instant at which [`MessageBox::expire_deadlines`] wants to run.
    /// While difference fetches are pending it is "now".
    pub(crate) fn next_deadline(&self) -> Instant {
        if !self.getting_diff_for.is_empty() {
            return Instant::now();
        }
        self.possible_gaps
            .values()
            .map(|gap| gap.deadline)
            .chain(self.map.values().map(|state| state.deadline))
            .min()
            .unwrap_or_else(next_updates_deadline)
    }

    /// How long the caller may wait for socket updates before calling
    /// [`MessageBox::expire_deadlines`].
    pub(crate) fn next_deadline_in(&self) -> Duration {
        self.next_deadline().saturating_duration_since(Instant::now())
    }

    /// Promote expired gaps and silent entries to difference fetches.
    pub(crate) fn expire_deadlines(&mut self) {
        let now = Instant::now();

        let expired_gaps: Vec<Entry> = self
            .possible_gaps
            .iter()
            .filter(|(_, gap)| now >= gap.deadline)
            .map(|(entry, _)| *entry)
            .collect();
        for entry in expired_gaps {
            info!("gap was not resolved after waiting for {entry:?}");
            self.try_begin_get_diff(entry);
        }

        let silent: Vec<Entry> = self
            .map
            .iter()
            .filter(|(_, state)| now >= state.deadline)
            .map(|(entry, _)| *entry)
            .collect();
        for entry in silent {
            debug!("too much time has passed without updates for {entry:?}");
            self.try_begin_get_diff(entry);
        }
    }

    /// Force a full difference fetch, used for `updatePtsChanged`,
    /// reconnections and unrecoverable adaptor gaps.
    pub(crate) fn force_get_diff(&mut self) {
        self.try_begin_get_diff(Entry::Account);
    }

    /// Process one adapted envelope.
    ///
    /// Returns the updates that should be dispatched, in order, each with
    /// the state to commit after its dispatch succeeds. A [`Gap`] means
    /// the caller must fetch the difference before anything else.
    pub(crate) fn process_updates(
        &mut self,
        adapted: AdaptedUpdates,
    ) -> Result<Vec<Applied>, Gap> {
        let AdaptedUpdates {
            date,
            seq_start,
            seq,
            updates,
            ..
        } = adapted;

        // > For all the other [not `updates` or `updatesCombined`]
        // > constructors there is no need to check `seq`.
        if seq_start != NO_SEQ {
            match (self.seq + 1).cmp(&seq_start) {
                Ordering::Equal => {}
                Ordering::Greater => {
                    debug!("skipping updates already handled at seq = {}", self.seq);
                    return Ok(Vec::new());
                }
                Ordering::Less => {
                    debug!("gap detected (local seq {}, remote seq {seq_start})", self.seq);
                    self.try_begin_get_diff(Entry::Account);
                    return Err(Gap);
                }
            }
        }

        fn update_sort_key(item: &Applicable) -> i32 {
            match PtsInfo::of(item) {
                Some(info) => info.pts - info.pts_count,
                None => NO_PTS,
            }
        }

        // Telegram can send updates out of order (same `pts`, different
        // `pts_count`), so sort by the value the state had before them.
        let mut updates = updates;
        updates.sort_by_key(update_sort_key);

        let mut result = Vec::with_capacity(updates.len() + self.possible_gaps.len());
        let mut any_pts_applied = false;

        for item in updates {
            let (had_entry, applied) = self.apply_pts_info(item);
            any_pts_applied |= had_entry && applied.as_ref().is_some_and(|a| a.state.is_some());
            if let Some(applied) = applied {
                result.push(applied);
            }
        }

        // > If the updates were applied, local *Updates* state must be
        // > updated with `seq` (unless it's 0) and `date`.
        if any_pts_applied {
            if date != NO_DATE {
                self.date = date;
            }
            if seq != NO_SEQ {
                self.seq = seq;
            }
        }

        if !self.possible_gaps.is_empty() {
            // See if any buffered update can be applied now.
            let keys: Vec<Entry> = self.possible_gaps.keys().copied().collect();
            for key in keys {
                let mut gap = match self.possible_gaps.remove(&key) {
                    Some(gap) => gap,
                    None => continue,
                };
                gap.updates.sort_by_key(update_sort_key);

                for item in gap.updates {
                    // Items that still can't be applied are re-buffered
                    // under a fresh gap entry by apply_pts_info.
                    if let (_, Some(applied)) = self.apply_pts_info(item) {
                        result.push(applied);
                    }
                }
            }

            if self.possible_gaps.is_empty() {
                debug!("successfully resolved gap by waiting");
            }
        }

        Ok(result)
    }

    /// Try to apply a single update's `PtsInfo`.
    ///
    /// Returns whether the update belonged to a tracked entry, and the
    /// applied update (`None` when it was dropped or buffered).
    fn apply_pts_info(&mut self, item: Applicable) -> (bool, Option<Applied>) {
        if let Applicable::Update(tl::enums::Update::ChannelTooLong(u)) = &item {
            let channel_id = u.channel_id;
            info!("received channelTooLong for {channel_id}, fetching its difference");
            self.try_begin_get_diff(Entry::Channel(channel_id));
            return (true, None);
        }

        let info = match PtsInfo::of(&item) {
            Some(info) => info,
            // No sequence info: applicable in any order.
            None => {
                return (
                    false,
                    Some(Applied {
                        item,
                        state: None,
                    }),
                );
            }
        };

        if self.getting_diff_for.contains(&info.entry) {
            debug!(
                "skipping update for {:?} (getting difference, count {}, remote {})",
                info.entry, info.pts_count, info.pts
            );
            // The difference response will include this update.
            return (true, None);
        }

        if let Some(state) = self.map.get(&info.entry) {
            let local_pts = state.pts;
            match (local_pts + info.pts_count).cmp(&info.pts) {
                Ordering::Equal => {}
                Ordering::Greater => {
                    debug!(
                        "skipping update for {:?} (local {}, count {}, remote {})",
                        info.entry, local_pts, info.pts_count, info.pts
                    );
                    return (true, None);
                }
                Ordering::Less => {
                    info!(
                        "gap on update for {:?} (local {}, count {}, remote {})",
                        info.entry, local_pts, info.pts_count, info.pts
                    );
                    self.possible_gaps
                        .entry(info.entry)
                        .or_insert_with(|| PossibleGap {
                            deadline: Instant::now() + POSSIBLE_GAP_TIMEOUT,
                            updates: Vec::new(),
                        })
                        .updates
                        .push(item);
                    return (true, None);
                }
            }
        }
        // No previous state for this entry: the update must be the first
        // one, so accept its `pts` as-is.

        self.map
            .entry(info.entry)
            .or_insert_with(|| State {
                pts: NO_PTS,
                deadline: next_updates_deadline(),
            })
            .pts = info.pts;
        self.reset_deadline(info.entry, next_updates_deadline());

        (
            true,
            Some(Applied {
                item,
                state: Some((info.entry, info.pts)),
            }),
        )
    }
}

/// Getting and applying the account-wide difference.
impl MessageBox {
    pub(crate) fn get_difference(&self) -> Option<tl::functions::updates::GetDifference> {
        for entry in [Entry::Account, Entry::Secret] {
            if self.getting_diff_for.contains(&entry) {
                return Some(tl::functions::updates::GetDifference {
                    pts: self.map[&Entry::Account].pts,
                    pts_limit: None,
                    pts_total_limit: None,
                    date: self.date,
                    qts: self
                        .map
                        .get(&Entry::Secret)
                        .map(|s| s.pts)
                        .unwrap_or(NO_PTS),
                    qts_limit: None,
                });
            }
        }
        None
    }

    /// Apply a difference result. Returns the updates to dispatch plus
    /// the peers the response carried, and whether the fetch is finished.
    pub(crate) fn apply_difference(
        &mut self,
        difference: tl::enums::updates::Difference,
    ) -> (Vec<Applied>, Vec<tl::enums::User>, Vec<tl::enums::Chat>, bool) {
        match difference {
            tl::enums::updates::Difference::Empty(diff) => {
                debug!(
                    "handling empty difference (date = {}, seq = {})",
                    diff.date, diff.seq
                );
                self.date = diff.date;
                self.seq = diff.seq;
                self.finish_account_diff();
                (Vec::new(), Vec::new(), Vec::new(), true)
            }
            tl::enums::updates::Difference::Difference(diff) => {
                debug!("handling full difference: state {:?}", diff.state);
                let (applied, users, chats) = self.apply_difference_type(
                    diff.new_messages,
                    diff.new_encrypted_messages,
                    diff.other_updates,
                    diff.chats,
                    diff.users,
                    diff.state,
                );
                self.finish_account_diff();
                (applied, users, chats, true)
            }
            tl::enums::updates::Difference::Slice(diff) => {
                debug!("handling difference slice: state {:?}", diff.intermediate_state);
                let (applied, users, chats) = self.apply_difference_type(
                    diff.new_messages,
                    diff.new_encrypted_messages,
                    diff.other_updates,
                    diff.chats,
                    diff.users,
                    diff.intermediate_state,
                );
                // Not final: keep fetching from the intermediate state.
                self.getting_diff_for.insert(Entry::Account);
                (applied, users, chats, false)
            }
            tl::enums::updates::Difference::TooLong(diff) => {
                debug!("handling too-long difference (pts = {})", diff.pts);
                if let Some(state) = self.map.get_mut(&Entry::Account) {
                    state.pts = diff.pts;
                }
                self.finish_account_diff();
                (Vec::new(), Vec::new(), Vec::new(), true)
            }
        }
    }

    fn finish_account_diff(&mut self) {
        for entry in [Entry::Account, Entry::Secret] {
            self.getting_diff_for.remove(&entry);
            self.reset_deadline(entry, next_updates_deadline());
        }
    }

    fn apply_difference_type(
        &mut self,
        new_messages: Vec<tl::enums::Message>,
        new_encrypted_messages: Vec<tl::enums::EncryptedMessage>,
        other_updates: Vec<tl::enums::Update>,
        chats: Vec<tl::enums::Chat>,
        users: Vec<tl::enums::User>,
        state: tl::enums::updates::State,
    ) -> (Vec<Applied>, Vec<tl::enums::User>, Vec<tl::enums::Chat>) {
        // The response's own contents must not be skipped as "currently
        // fetching", and they have to replay against the old local state
        // so they come out in order with their commit points. Anything
        // already seen through the socket still drops as a duplicate.
        self.getting_diff_for.remove(&Entry::Account);
        self.getting_diff_for.remove(&Entry::Secret);

        let adapted = AdaptedUpdates {
            date: NO_DATE,
            seq_start: NO_SEQ,
            seq: NO_SEQ,
            updates: other_updates.into_iter().map(Applicable::Update).collect(),
            users: Vec::new(),
            chats: Vec::new(),
        };
        let mut applied = self
            .process_updates(adapted)
            .expect("gap detected while applying difference");

        // The response state is authoritative; it covers whatever the
        // in-order pass could not attribute.
        let tl::enums::updates::State::State(state) = state;
        if let Some(account) = self.map.get_mut(&Entry::Account) {
            account.pts = state.pts;
        }
        if let Some(secret) = self.map.get_mut(&Entry::Secret) {
            secret.pts = state.qts;
        }
        self.date = state.date;
        self.seq = state.seq;

        applied.extend(new_messages.into_iter().map(|message| Applied {
            item: Applicable::Update(
                tl::types::UpdateNewMessage {
                    message,
                    pts: NO_PTS,
                    pts_count: 0,
                }
                .into(),
            ),
            state: None,
        }));
        applied.extend(new_encrypted_messages.into_iter().map(|message| Applied {
            item: Applicable::Update(
                tl::types::UpdateNewEncryptedMessage {
                    message,
                    qts: NO_PTS,
                }
                .into(),
            ),
            state: None,
        }));

        (applied, users, chats)
    }
}

/// Getting and applying channel differences.
impl MessageBox {
    /// Channel that currently needs a difference fetch, with its `pts`.
    pub(crate) fn next_channel_diff(&self) -> Option<(i64, i32)> {
        self.getting_diff_for.iter().find_map(|entry| match entry {
            Entry::Channel(id) => Some((*id, self.map.get(entry).map(|s| s.pts).unwrap_or(NO_PTS))),
            _ => None,
        })
    }

    pub(crate) fn channel_diff_request(
        &self,
        channel_id: i64,
        access_hash: i64,
        pts: i32,
    ) -> tl::functions::updates::GetChannelDifference {
        tl::functions::updates::GetChannelDifference {
            force: false,
            channel: tl::types::InputChannel {
                channel_id,
                access_hash,
            }
            .into(),
            filter: tl::enums::ChannelMessagesFilter::Empty,
            pts,
            limit: USER_CHANNEL_DIFF_LIMIT,
        }
    }

    /// Give up on a channel difference, e.g. because the access hash is
    /// missing or the login was banned from the channel.
    pub(crate) fn abandon_channel_diff(&mut self, channel_id: i64, forget_state: bool) {
        let entry = Entry::Channel(channel_id);
        self.possible_gaps.remove(&entry);
        if self.getting_diff_for.contains(&entry) {
            self.end_get_diff(entry);
        }
        if forget_state {
            // Let the next update for the channel re-seed a correct pts.
            self.map.remove(&entry);
        }
    }

    pub(crate) fn apply_channel_difference(
        &mut self,
        channel_id: i64,
        difference: tl::enums::updates::ChannelDifference,
    ) -> (Vec<Applied>, Vec<tl::enums::User>, Vec<tl::enums::Chat>, bool) {
        let entry = Entry::Channel(channel_id);
        self.possible_gaps.remove(&entry);

        match difference {
            tl::enums::updates::ChannelDifference::Empty(diff) => {
                debug!(
                    "handling empty channel {channel_id} difference (pts = {})",
                    diff.pts
                );
                self.end_get_diff(entry);
                if let Some(state) = self.map.get_mut(&entry) {
                    state.pts = diff.pts;
                }
                (Vec::new(), Vec::new(), Vec::new(), true)
            }
            tl::enums::updates::ChannelDifference::TooLong(diff) => {
                info!("handling too-long channel {channel_id} difference");
                match &diff.dialog {
                    tl::enums::Dialog::Dialog(d) => {
                        if let (Some(state), Some(pts)) = (self.map.get_mut(&entry), d.pts) {
                            state.pts = pts;
                        }
                    }
                    tl::enums::Dialog::Folder(_) => {}
                }
                self.end_get_diff(entry);
                self.reset_channel_deadline(channel_id, diff.timeout);
                // The diff carries only the latest messages; handing the
                // caller a partial window would look like history loss, so
                // nothing is emitted and backfill covers the rest.
                (Vec::new(), diff.users, diff.chats, true)
            }
            tl::enums::updates::ChannelDifference::Difference(diff) => {
                let done = diff.r#final;
                if done {
                    debug!("handling channel {channel_id} difference; no longer getting diff");
                } else {
                    debug!("handling partial channel {channel_id} difference");
                }
                // As with the account difference: replay the contents
                // against the old pts so they emit in order, then trust
                // the response's final pts.
                self.getting_diff_for.remove(&entry);

                let adapted = AdaptedUpdates {
                    date: NO_DATE,
                    seq_start: NO_SEQ,
                    seq: NO_SEQ,
                    updates: diff
                        .other_updates
                        .into_iter()
                        .map(Applicable::Update)
                        .collect(),
                    users: Vec::new(),
                    chats: Vec::new(),
                };
                let mut applied = self
                    .process_updates(adapted)
                    .expect("gap detected while applying channel difference");

                if let Some(state) = self.map.get_mut(&entry) {
                    state.pts = diff.pts;
                }
                if !done {
                    self.getting_diff_for.insert(entry);
                }

                applied.extend(diff.new_messages.into_iter().map(|message| Applied {
                    item: Applicable::Update(
                        tl::types::UpdateNewChannelMessage {
                            message,
                            pts: NO_PTS,
                            pts_count: 0,
                        }
                        .into(),
                    ),
                    state: None,
                }));
                self.reset_channel_deadline(channel_id, diff.timeout);

                (applied, diff.users, diff.chats, done)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod mock_instant {
    //! A controllable clock so gap timeouts can be tested without
    //! sleeping.

    use std::cell::RefCell;
    use std::ops::Add;
    use std::time::Duration;

    thread_local! {
        static NOW: RefCell<Duration> = const { RefCell::new(Duration::ZERO) };
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
    pub(crate) struct Instant(Duration);

    impl Instant {
        pub(crate) fn now() -> Self {
            Self(NOW.with_borrow(|now| *now))
        }

        pub(crate) fn saturating_duration_since(self, earlier: Self) -> Duration {
            self.0.saturating_sub(earlier.0)
        }
    }

    impl Add<Duration> for Instant {
        type Output = Self;

        fn add(self, rhs: Duration) -> Self::Output {
            Self(self.0 + rhs)
        }
    }

    pub(crate) fn reset_time() {
        NOW.with_borrow_mut(|now| *now = Duration::ZERO);
    }

    pub(crate) fn advance_time_by(duration: Duration) {
        NOW.with_borrow_mut(|now| *now += duration);
    }
}

#[cfg(test)]
mod tests {
    use super::super::adaptor;
    use super::*;

    fn empty_state() -> MessageBox {
        mock_instant::reset_time();
        MessageBox::load(None, Vec::new())
    }

    fn loaded_state(pts: i32) -> MessageBox {
        mock_instant::reset_time();
        MessageBox::load(
            Some(UpdateStateRow {
                pts,
                qts: 0,
                date: 100,
                seq: 1,
            }),
            Vec::new(),
        )
    }

    fn delete_update(pts: i32, pts_count: i32) -> tl::enums::Update {
        tl::types::UpdateDeleteMessages {
            messages: Vec::new(),
            pts,
            pts_count,
        }
        .into()
    }

    fn envelope(date: i32, seq: i32, updates: Vec<tl::enums::Update>) -> AdaptedUpdates {
        AdaptedUpdates {
            date,
            seq_start: seq,
            seq,
            updates: updates.into_iter().map(Applicable::Update).collect(),
            users: Vec::new(),
            chats: Vec::new(),
        }
    }

    fn applied_pts(applied: &[Applied]) -> Vec<i32> {
        applied
            .iter()
            .filter_map(|a| a.state.map(|(_, pts)| pts))
            .collect()
    }

    #[test]
    fn in_order_updates_advance_state() {
        let mut message_box = loaded_state(100);

        let applied = message_box
            .process_updates(envelope(NO_DATE, NO_SEQ, vec![delete_update(101, 1)]))
            .unwrap();
        assert_eq!(applied_pts(&applied), vec![101]);

        let applied = message_box
            .process_updates(envelope(NO_DATE, NO_SEQ, vec![delete_update(102, 1)]))
            .unwrap();
        assert_eq!(applied_pts(&applied), vec![102]);
        assert_eq!(message_box.state_row().pts, 102);
    }

    #[test]
    fn duplicate_updates_are_dropped() {
        let mut message_box = loaded_state(100);

        let applied = message_box
            .process_updates(envelope(NO_DATE, NO_SEQ, vec![delete_update(100, 1)]))
            .unwrap();
        assert!(applied.is_empty());
        assert_eq!(message_box.state_row().pts, 100);
    }

    #[test]
    fn gap_is_buffered_then_resolved_by_missing_update() {
        let mut message_box = loaded_state(100);

        // 103 arrives before 101..=102: possible gap, nothing emitted.
        let applied = message_box
            .process_updates(envelope(NO_DATE, NO_SEQ, vec![delete_update(103, 1)]))
            .unwrap();
        assert!(applied.is_empty());
        assert_eq!(message_box.state_row().pts, 100);

        // The missing ones arrive; everything comes out in order.
        let applied = message_box
            .process_updates(envelope(
                NO_DATE,
                NO_SEQ,
                vec![delete_update(102, 1), delete_update(101, 1)],
            ))
            .unwrap();
        assert_eq!(applied_pts(&applied), vec![101, 102, 103]);
        assert_eq!(message_box.state_row().pts, 103);
    }

    #[test]
    fn unresolved_gap_times_out_into_difference() {
        let mut message_box = loaded_state(100);

        message_box
            .process_updates(envelope(NO_DATE, NO_SEQ, vec![delete_update(103, 1)]))
            .unwrap();
        assert_eq!(message_box.get_difference(), None);

        mock_instant::advance_time_by(POSSIBLE_GAP_TIMEOUT);
        message_box.expire_deadlines();

        let request = message_box.get_difference().expect("difference request");
        assert_eq!(request.pts, 100);
        assert_eq!(request.date, 100);
    }

    #[test]
    fn difference_replays_intervening_updates() {
        // Scenario: stored pts = 100, update pts = 103 arrives, the gap
        // times out and the difference returns 101..=103.
        let mut message_box = loaded_state(100);
        message_box
            .process_updates(envelope(NO_DATE, NO_SEQ, vec![delete_update(103, 1)]))
            .unwrap();
        mock_instant::advance_time_by(POSSIBLE_GAP_TIMEOUT);
        message_box.expire_deadlines();
        assert!(message_box.get_difference().is_some());

        // Socket updates for the entry are skipped while fetching.
        let applied = message_box
            .process_updates(envelope(NO_DATE, NO_SEQ, vec![delete_update(104, 1)]))
            .unwrap();
        assert!(applied.is_empty());

        let (applied, _, _, done) = message_box.apply_difference(
            tl::types::updates::Difference {
                new_messages: Vec::new(),
                new_encrypted_messages: Vec::new(),
                other_updates: vec![
                    delete_update(101, 1),
                    delete_update(102, 1),
                    delete_update(103, 1),
                ],
                chats: Vec::new(),
                users: Vec::new(),
                state: tl::types::updates::State {
                    pts: 103,
                    qts: 0,
                    date: 104,
                    seq: 2,
                    unread_count: 0,
                }
                .into(),
            }
            .into(),
        );
        assert!(done);
        // All three come out exactly once, in order; the final state
        // matches the difference's.
        assert_eq!(
            applied
                .iter()
                .map(|a| match &a.item {
                    Applicable::Update(tl::enums::Update::DeleteMessages(u)) => u.pts,
                    other => panic!("unexpected item {other:?}"),
                })
                .collect::<Vec<_>>(),
            vec![101, 102, 103]
        );
        assert_eq!(message_box.state_row().pts, 103);
        assert_eq!(message_box.get_difference(), None);
    }

    #[test]
    fn seq_gap_triggers_difference() {
        let mut message_box = loaded_state(100);
        // seq should be 2 next; 4 means a combined-updates gap.
        let result = message_box.process_updates(envelope(200, 4, vec![delete_update(101, 1)]));
        assert_eq!(result.unwrap_err(), Gap);
        assert!(message_box.get_difference().is_some());
    }

    #[test]
    fn seq_replay_is_ignored() {
        let mut message_box = loaded_state(100);
        let applied = message_box
            .process_updates(envelope(200, 1, vec![delete_update(101, 1)]))
            .unwrap();
        assert!(applied.is_empty());
        assert_eq!(message_box.state_row().pts, 100);
    }

    #[test]
    fn state_never_decreases() {
        let mut message_box = loaded_state(100);
        for pts in [101, 99, 50, 101, 100] {
            let _ = message_box.process_updates(envelope(
                NO_DATE,
                NO_SEQ,
                vec![delete_update(pts, 1)],
            ));
            assert!(message_box.state_row().pts >= 100);
        }
        assert_eq!(message_box.state_row().pts, 101);
    }

    #[test]
    fn channel_updates_use_their_own_pts() {
        mock_instant::reset_time();
        let mut message_box = MessageBox::load(
            Some(UpdateStateRow {
                pts: 100,
                qts: 0,
                date: 100,
                seq: 1,
            }),
            vec![(300, 50)],
        );

        let update = tl::types::UpdateDeleteChannelMessages {
            channel_id: 300,
            messages: Vec::new(),
            pts: 51,
            pts_count: 1,
        };
        let applied = message_box
            .process_updates(envelope(NO_DATE, NO_SEQ, vec![update.into()]))
            .unwrap();
        assert_eq!(
            applied_pts(&applied),
            vec![51],
        );
        assert_eq!(applied[0].state.unwrap().0, Entry::Channel(300));
        // The account-wide pts is untouched.
        assert_eq!(message_box.state_row().pts, 100);
    }

    #[test]
    fn channel_too_long_begins_channel_difference() {
        mock_instant::reset_time();
        let mut message_box = MessageBox::load(None, vec![(300, 50)]);

        let update = tl::types::UpdateChannelTooLong {
            channel_id: 300,
            pts: None,
        };
        let applied = message_box
            .process_updates(envelope(NO_DATE, NO_SEQ, vec![update.into()]))
            .unwrap();
        assert!(applied.is_empty());
        assert_eq!(message_box.next_channel_diff(), Some((300, 50)));
    }

    #[test]
    fn short_sent_message_ack_advances_pts() {
        let mut message_box = loaded_state(100);
        let applied = message_box
            .process_updates(AdaptedUpdates {
                date: 500,
                seq_start: NO_SEQ,
                seq: NO_SEQ,
                updates: vec![Applicable::PtsAck {
                    entry: Entry::Account,
                    pts: 101,
                    pts_count: 1,
                }],
                users: Vec::new(),
                chats: Vec::new(),
            })
            .unwrap();
        assert_eq!(applied_pts(&applied), vec![101]);
        assert_eq!(message_box.state_row().pts, 101);
    }

    #[test]
    fn short_message_adaptor_round_trip() {
        // An updateShortMessage goes through the adaptor and advances pts
        // like any other account-wide update.
        let mut message_box = loaded_state(100);
        let adapted = adaptor::adapt(
            tl::types::UpdateShortMessage {
                out: false,
                mentioned: false,
                media_unread: false,
                silent: false,
                id: 42,
                user_id: 777,
                message: "hi".to_string(),
                pts: 101,
                pts_count: 1,
                date: 1700000000,
                fwd_from: None,
                via_bot_id: None,
                reply_to: None,
                entities: None,
                ttl_period: None,
            }
            .into(),
        )
        .unwrap();
        let applied = message_box.process_updates(adapted).unwrap();
        assert_eq!(applied.len(), 1);
        match &applied[0].item {
            Applicable::ShortMessage(short) => {
                assert_eq!(short.id, 42);
                assert_eq!(short.message, "hi");
            }
            other => panic!("unexpected item {other:?}"),
        }
        assert_eq!(message_box.state_row().pts, 101);
    }

    #[test]
    fn empty_box_reports_empty() {
        let message_box = empty_state();
        assert!(message_box.is_empty());
        assert_eq!(message_box.get_difference(), None);
        assert_eq!(message_box.next_channel_diff(), None);
    }
}
