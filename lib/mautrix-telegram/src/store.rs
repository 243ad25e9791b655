// Copyright 2024 - developers of the `mautrix-telegram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Per-login persistent storage.
//!
//! Holds everything a login needs across restarts: the opaque MTProto
//! session blob, the `(pts, qts, date, seq)` update state, per-channel
//! `pts`, access hashes, and the Telegram→Matrix file cache.
//!
//! Every operation is its own transaction; there is no locking above what
//! the database provides. Methods on [`ScopedStore`] that receive an
//! explicit user ID panic when it differs from the scope owner: a
//! mismatch there is a bug in the caller, never a runtime condition.

use std::path::Path;
use std::sync::{Arc, Mutex};

use log::debug;
use thiserror::Error;

const VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error during {operation}: {source}")]
    Database {
        operation: &'static str,
        source: sqlite::Error,
    },
}

impl StoreError {
    fn during(operation: &'static str) -> impl FnOnce(sqlite::Error) -> Self {
        move |source| Self::Database { operation, source }
    }
}

/// Full update state of one login.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UpdateStateRow {
    pub pts: i32,
    pub qts: i32,
    pub date: i32,
    pub seq: i32,
}

/// A cached Telegram→Matrix file transfer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CachedFile {
    pub id: String,
    pub mxc: String,
    pub mime_type: String,
    pub size: i64,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub thumbnail: bool,
}

struct Database(sqlite::Connection);

struct TransactionGuard<'c>(&'c sqlite::Connection);

impl Drop for TransactionGuard<'_> {
    fn drop(&mut self) {
        let _ = self.0.execute("COMMIT");
    }
}

impl Database {
    fn init(&self) -> sqlite::Result<()> {
        let mut user_version = self
            .fetch_one("PRAGMA user_version", &[], |stmt| stmt.read::<i64, _>(0))?
            .unwrap_or(0);
        if user_version == VERSION {
            return Ok(());
        }

        if user_version == 0 {
            self.migrate_v0_to_v1()?;
            user_version += 1;
        }
        if user_version == VERSION {
            // Can't bind PRAGMA parameters, but `VERSION` is not user input.
            self.0.execute(format!("PRAGMA user_version = {VERSION}"))?;
        }
        Ok(())
    }

    fn migrate_v0_to_v1(&self) -> sqlite::Result<()> {
        debug!("creating telegram store schema");
        let _transaction = self.begin_transaction()?;
        self.0.execute(
            "CREATE TABLE telegram_session (
                user_id INTEGER NOT NULL,
                session_data BLOB NOT NULL,
                PRIMARY KEY (user_id))",
        )?;
        self.0.execute(
            "CREATE TABLE telegram_user_state (
                user_id INTEGER NOT NULL,
                pts INTEGER NOT NULL,
                qts INTEGER NOT NULL,
                date INTEGER NOT NULL,
                seq INTEGER NOT NULL,
                PRIMARY KEY (user_id))",
        )?;
        self.0.execute(
            "CREATE TABLE telegram_channel_state (
                user_id INTEGER NOT NULL,
                channel_id INTEGER NOT NULL,
                pts INTEGER NOT NULL,
                PRIMARY KEY (user_id, channel_id))",
        )?;
        self.0.execute(
            "CREATE TABLE telegram_channel_access_hashes (
                user_id INTEGER NOT NULL,
                channel_id INTEGER NOT NULL,
                access_hash INTEGER NOT NULL,
                PRIMARY KEY (user_id, channel_id))",
        )?;
        self.0.execute(
            "CREATE TABLE telegram_user_metadata (
                receiver_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                access_hash INTEGER NOT NULL,
                username TEXT,
                PRIMARY KEY (receiver_id, user_id))",
        )?;
        self.0.execute(
            "CREATE TABLE telegram_file (
                id TEXT NOT NULL,
                mxc TEXT NOT NULL,
                mime_type TEXT NOT NULL,
                size INTEGER NOT NULL,
                width INTEGER,
                height INTEGER,
                thumbnail INTEGER NOT NULL DEFAULT 0,
                decryption_info TEXT,
                PRIMARY KEY (id))",
        )?;
        Ok(())
    }

    fn begin_transaction(&self) -> sqlite::Result<TransactionGuard<'_>> {
        self.0.execute("BEGIN TRANSACTION")?;
        Ok(TransactionGuard(&self.0))
    }

    fn fetch_one<T, F: FnOnce(sqlite::Statement) -> sqlite::Result<T>>(
        &self,
        statement: &str,
        bindings: &[(&str, sqlite::Value)],
        select: F,
    ) -> sqlite::Result<Option<T>> {
        let mut statement = self.0.prepare(statement)?;
        statement.bind(bindings)?;
        let result = match statement.next()? {
            sqlite::State::Row => Some(select(statement)?),
            sqlite::State::Done => None,
        };
        Ok(result)
    }

    fn fetch_all<T, F: FnMut(&sqlite::Statement) -> sqlite::Result<T>>(
        &self,
        statement: &str,
        bindings: &[(&str, sqlite::Value)],
        mut select: F,
    ) -> sqlite::Result<Vec<T>> {
        let mut result = Vec::new();
        let mut statement = self.0.prepare(statement)?;
        statement.bind(bindings)?;
        while statement.next()? == sqlite::State::Row {
            result.push(select(&statement)?);
        }
        Ok(result)
    }

    fn execute_bound(
        &self,
        statement: &str,
        bindings: &[(&str, sqlite::Value)],
    ) -> sqlite::Result<()> {
        let mut statement = self.0.prepare(statement)?;
        statement.bind(bindings)?;
        while statement.next()? == sqlite::State::Row {}
        Ok(())
    }
}

/// Connection-owning store shared by all logins.
pub struct Store {
    database: Mutex<Database>,
}

impl Store {
    /// Open (and migrate, if needed) the store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Arc<Self>, StoreError> {
        let database = Database(
            sqlite::Connection::open(path).map_err(StoreError::during("open database"))?,
        );
        database
            .init()
            .map_err(StoreError::during("migrate schema"))?;
        Ok(Arc::new(Store {
            database: Mutex::new(database),
        }))
    }

    /// Scope the store to one login.
    pub fn scoped(self: &Arc<Self>, user_id: i64) -> ScopedStore {
        ScopedStore {
            store: Arc::clone(self),
            user_id,
        }
    }

    /// Logins that have a stored session blob.
    pub fn logged_in_user_ids(&self) -> Result<Vec<i64>, StoreError> {
        let db = self.database.lock().unwrap();
        db.fetch_all("SELECT user_id FROM telegram_session", &[], |stmt| {
            stmt.read::<i64, _>("user_id")
        })
        .map_err(StoreError::during("list sessions"))
    }
}

/// A view of the [`Store`] for one login.
#[derive(Clone)]
pub struct ScopedStore {
    store: Arc<Store>,
    user_id: i64,
}

impl ScopedStore {
    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    fn assert_owner(&self, user_id: i64) {
        assert_eq!(
            user_id, self.user_id,
            "store scoped to {} was asked to operate on {}",
            self.user_id, user_id
        );
    }

    // Session blob.

    pub fn load_session(&self) -> Result<Option<Vec<u8>>, StoreError> {
        let db = self.store.database.lock().unwrap();
        db.fetch_one(
            "SELECT session_data FROM telegram_session WHERE user_id = :user_id",
            &[(":user_id", self.user_id.into())],
            |stmt| stmt.read::<Vec<u8>, _>("session_data"),
        )
        .map_err(StoreError::during("load session"))
    }

    pub fn store_session(&self, user_id: i64, session_data: &[u8]) -> Result<(), StoreError> {
        self.assert_owner(user_id);
        let db = self.store.database.lock().unwrap();
        db.execute_bound(
            "INSERT INTO telegram_session (user_id, session_data) VALUES (:user_id, :data)
             ON CONFLICT (user_id) DO UPDATE SET session_data = excluded.session_data",
            &[
                (":user_id", self.user_id.into()),
                (":data", sqlite::Value::Binary(session_data.to_vec())),
            ],
        )
        .map_err(StoreError::during("store session"))
    }

    /// Remove everything the login owns. Used on logout and on server-side
    /// session invalidation.
    pub fn delete_login(&self) -> Result<(), StoreError> {
        let db = self.store.database.lock().unwrap();
        let transaction = db
            .begin_transaction()
            .map_err(StoreError::during("delete login"))?;
        for table in [
            "telegram_session",
            "telegram_user_state",
            "telegram_channel_state",
            "telegram_channel_access_hashes",
        ] {
            db.execute_bound(
                &format!("DELETE FROM {table} WHERE user_id = :user_id"),
                &[(":user_id", self.user_id.into())],
            )
            .map_err(StoreError::during("delete login"))?;
        }
        db.execute_bound(
            "DELETE FROM telegram_user_metadata WHERE receiver_id = :user_id",
            &[(":user_id", self.user_id.into())],
        )
        .map_err(StoreError::during("delete login"))?;
        drop(transaction);
        Ok(())
    }

    // Update state.

    pub fn get_update_state(&self) -> Result<Option<UpdateStateRow>, StoreError> {
        let db = self.store.database.lock().unwrap();
        db.fetch_one(
            "SELECT pts, qts, date, seq FROM telegram_user_state WHERE user_id = :user_id",
            &[(":user_id", self.user_id.into())],
            |stmt| {
                Ok(UpdateStateRow {
                    pts: stmt.read::<i64, _>("pts")? as i32,
                    qts: stmt.read::<i64, _>("qts")? as i32,
                    date: stmt.read::<i64, _>("date")? as i32,
                    seq: stmt.read::<i64, _>("seq")? as i32,
                })
            },
        )
        .map_err(StoreError::during("get update state"))
    }

    pub fn set_update_state(&self, state: UpdateStateRow) -> Result<(), StoreError> {
        let db = self.store.database.lock().unwrap();
        db.execute_bound(
            "INSERT INTO telegram_user_state (user_id, pts, qts, date, seq)
             VALUES (:user_id, :pts, :qts, :date, :seq)
             ON CONFLICT (user_id) DO UPDATE SET
                pts = excluded.pts, qts = excluded.qts,
                date = excluded.date, seq = excluded.seq",
            &[
                (":user_id", self.user_id.into()),
                (":pts", (state.pts as i64).into()),
                (":qts", (state.qts as i64).into()),
                (":date", (state.date as i64).into()),
                (":seq", (state.seq as i64).into()),
            ],
        )
        .map_err(StoreError::during("set update state"))
    }

    fn set_state_column(&self, column: &'static str, value: i32) -> Result<(), StoreError> {
        let db = self.store.database.lock().unwrap();
        db.execute_bound(
            &format!("UPDATE telegram_user_state SET {column} = :value WHERE user_id = :user_id"),
            &[
                (":value", (value as i64).into()),
                (":user_id", self.user_id.into()),
            ],
        )
        .map_err(StoreError::during("set update state column"))
    }

    pub fn set_pts(&self, pts: i32) -> Result<(), StoreError> {
        self.set_state_column("pts", pts)
    }

    pub fn set_qts(&self, qts: i32) -> Result<(), StoreError> {
        self.set_state_column("qts", qts)
    }

    pub fn set_date(&self, date: i32) -> Result<(), StoreError> {
        self.set_state_column("date", date)
    }

    pub fn set_seq(&self, seq: i32) -> Result<(), StoreError> {
        self.set_state_column("seq", seq)
    }

    /// Combined updates carry both values; they are stored in one
    /// statement so a crash can't split them.
    pub fn set_date_seq(&self, date: i32, seq: i32) -> Result<(), StoreError> {
        let db = self.store.database.lock().unwrap();
        db.execute_bound(
            "UPDATE telegram_user_state SET date = :date, seq = :seq WHERE user_id = :user_id",
            &[
                (":date", (date as i64).into()),
                (":seq", (seq as i64).into()),
                (":user_id", self.user_id.into()),
            ],
        )
        .map_err(StoreError::during("set date/seq"))
    }

    // Per-channel pts.

    pub fn get_channel_pts(&self, channel_id: i64) -> Result<Option<i32>, StoreError> {
        let db = self.store.database.lock().unwrap();
        db.fetch_one(
            "SELECT pts FROM telegram_channel_state
             WHERE user_id = :user_id AND channel_id = :channel_id",
            &[
                (":user_id", self.user_id.into()),
                (":channel_id", channel_id.into()),
            ],
            |stmt| Ok(stmt.read::<i64, _>("pts")? as i32),
        )
        .map_err(StoreError::during("get channel pts"))
    }

    pub fn set_channel_pts(&self, channel_id: i64, pts: i32) -> Result<(), StoreError> {
        let db = self.store.database.lock().unwrap();
        db.execute_bound(
            "INSERT INTO telegram_channel_state (user_id, channel_id, pts)
             VALUES (:user_id, :channel_id, :pts)
             ON CONFLICT (user_id, channel_id) DO UPDATE SET pts = excluded.pts",
            &[
                (":user_id", self.user_id.into()),
                (":channel_id", channel_id.into()),
                (":pts", (pts as i64).into()),
            ],
        )
        .map_err(StoreError::during("set channel pts"))
    }

    pub fn all_channel_pts(&self) -> Result<Vec<(i64, i32)>, StoreError> {
        let db = self.store.database.lock().unwrap();
        db.fetch_all(
            "SELECT channel_id, pts FROM telegram_channel_state WHERE user_id = :user_id",
            &[(":user_id", self.user_id.into())],
            |stmt| {
                Ok((
                    stmt.read::<i64, _>("channel_id")?,
                    stmt.read::<i64, _>("pts")? as i32,
                ))
            },
        )
        .map_err(StoreError::during("list channel pts"))
    }

    // Access hashes.

    pub fn get_channel_access_hash(&self, channel_id: i64) -> Result<Option<i64>, StoreError> {
        let db = self.store.database.lock().unwrap();
        db.fetch_one(
            "SELECT access_hash FROM telegram_channel_access_hashes
             WHERE user_id = :user_id AND channel_id = :channel_id",
            &[
                (":user_id", self.user_id.into()),
                (":channel_id", channel_id.into()),
            ],
            |stmt| stmt.read::<i64, _>("access_hash"),
        )
        .map_err(StoreError::during("get channel access hash"))
    }

    pub fn set_channel_access_hash(
        &self,
        channel_id: i64,
        access_hash: i64,
    ) -> Result<(), StoreError> {
        let db = self.store.database.lock().unwrap();
        db.execute_bound(
            "INSERT INTO telegram_channel_access_hashes (user_id, channel_id, access_hash)
             VALUES (:user_id, :channel_id, :access_hash)
             ON CONFLICT (user_id, channel_id) DO UPDATE SET access_hash = excluded.access_hash",
            &[
                (":user_id", self.user_id.into()),
                (":channel_id", channel_id.into()),
                (":access_hash", access_hash.into()),
            ],
        )
        .map_err(StoreError::during("set channel access hash"))
    }

    pub fn get_user_access_hash(&self, user_id: i64) -> Result<Option<i64>, StoreError> {
        let db = self.store.database.lock().unwrap();
        db.fetch_one(
            "SELECT access_hash FROM telegram_user_metadata
             WHERE receiver_id = :receiver_id AND user_id = :user_id",
            &[
                (":receiver_id", self.user_id.into()),
                (":user_id", user_id.into()),
            ],
            |stmt| stmt.read::<i64, _>("access_hash"),
        )
        .map_err(StoreError::during("get user access hash"))
    }

    pub fn set_user_metadata(
        &self,
        user_id: i64,
        access_hash: i64,
        username: Option<&str>,
    ) -> Result<(), StoreError> {
        let db = self.store.database.lock().unwrap();
        db.execute_bound(
            "INSERT INTO telegram_user_metadata (receiver_id, user_id, access_hash, username)
             VALUES (:receiver_id, :user_id, :access_hash, :username)
             ON CONFLICT (receiver_id, user_id) DO UPDATE SET
                access_hash = excluded.access_hash,
                username = coalesce(excluded.username, telegram_user_metadata.username)",
            &[
                (":receiver_id", self.user_id.into()),
                (":user_id", user_id.into()),
                (":access_hash", access_hash.into()),
                (
                    ":username",
                    match username {
                        Some(name) => sqlite::Value::String(name.to_string()),
                        None => sqlite::Value::Null,
                    },
                ),
            ],
        )
        .map_err(StoreError::during("set user metadata"))
    }

    // File cache. The cache is global (Matrix URIs are not per-login), but
    // access goes through the scope for uniformity.

    pub fn get_file(&self, location_id: &str) -> Result<Option<CachedFile>, StoreError> {
        let db = self.store.database.lock().unwrap();
        db.fetch_one(
            "SELECT id, mxc, mime_type, size, width, height, thumbnail
             FROM telegram_file WHERE id = :id",
            &[(":id", sqlite::Value::String(location_id.to_string()))],
            |stmt| {
                Ok(CachedFile {
                    id: stmt.read::<String, _>("id")?,
                    mxc: stmt.read::<String, _>("mxc")?,
                    mime_type: stmt.read::<String, _>("mime_type")?,
                    size: stmt.read::<i64, _>("size")?,
                    width: stmt.read::<Option<i64>, _>("width")?.map(|w| w as i32),
                    height: stmt.read::<Option<i64>, _>("height")?.map(|h| h as i32),
                    thumbnail: stmt.read::<i64, _>("thumbnail")? != 0,
                })
            },
        )
        .map_err(StoreError::during("get cached file"))
    }

    pub fn put_file(&self, file: &CachedFile) -> Result<(), StoreError> {
        let db = self.store.database.lock().unwrap();
        db.execute_bound(
            "INSERT INTO telegram_file (id, mxc, mime_type, size, width, height, thumbnail)
             VALUES (:id, :mxc, :mime_type, :size, :width, :height, :thumbnail)
             ON CONFLICT (id) DO UPDATE SET
                mxc = excluded.mxc, mime_type = excluded.mime_type, size = excluded.size,
                width = excluded.width, height = excluded.height,
                thumbnail = excluded.thumbnail",
            &[
                (":id", sqlite::Value::String(file.id.clone())),
                (":mxc", sqlite::Value::String(file.mxc.clone())),
                (":mime_type", sqlite::Value::String(file.mime_type.clone())),
                (":size", file.size.into()),
                (
                    ":width",
                    match file.width {
                        Some(w) => (w as i64).into(),
                        None => sqlite::Value::Null,
                    },
                ),
                (
                    ":height",
                    match file.height {
                        Some(h) => (h as i64).into(),
                        None => sqlite::Value::Null,
                    },
                ),
                (":thumbnail", (file.thumbnail as i64).into()),
            ],
        )
        .map_err(StoreError::during("put cached file"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_memory() -> Arc<Store> {
        Store::open(":memory:").unwrap()
    }

    #[test]
    fn exercise_session_blob() {
        let store = open_memory();
        let scoped = store.scoped(7777);

        assert_eq!(scoped.load_session().unwrap(), None);
        scoped.store_session(7777, b"blob-1").unwrap();
        assert_eq!(scoped.load_session().unwrap(), Some(b"blob-1".to_vec()));
        scoped.store_session(7777, b"blob-2").unwrap();
        assert_eq!(scoped.load_session().unwrap(), Some(b"blob-2".to_vec()));

        assert_eq!(store.logged_in_user_ids().unwrap(), vec![7777]);
        scoped.delete_login().unwrap();
        assert_eq!(scoped.load_session().unwrap(), None);
        assert!(store.logged_in_user_ids().unwrap().is_empty());
    }

    #[test]
    #[should_panic(expected = "store scoped to 7777")]
    fn reject_foreign_user_id() {
        let store = open_memory();
        store.scoped(7777).store_session(8888, b"blob").unwrap();
    }

    #[test]
    fn exercise_update_state() {
        let store = open_memory();
        let scoped = store.scoped(1);

        assert_eq!(scoped.get_update_state().unwrap(), None);
        scoped
            .set_update_state(UpdateStateRow {
                pts: 1,
                qts: 2,
                date: 3,
                seq: 4,
            })
            .unwrap();
        scoped.set_pts(10).unwrap();
        scoped.set_qts(20).unwrap();
        scoped.set_date_seq(30, 40).unwrap();
        assert_eq!(
            scoped.get_update_state().unwrap(),
            Some(UpdateStateRow {
                pts: 10,
                qts: 20,
                date: 30,
                seq: 40,
            })
        );
    }

    #[test]
    fn exercise_channel_state() {
        let store = open_memory();
        let scoped = store.scoped(1);
        let other = store.scoped(2);

        assert_eq!(scoped.get_channel_pts(100).unwrap(), None);
        scoped.set_channel_pts(100, 7).unwrap();
        scoped.set_channel_pts(200, 9).unwrap();
        other.set_channel_pts(100, 1000).unwrap();
        scoped.set_channel_pts(100, 8).unwrap();

        assert_eq!(scoped.get_channel_pts(100).unwrap(), Some(8));
        let mut all = scoped.all_channel_pts().unwrap();
        all.sort();
        assert_eq!(all, vec![(100, 8), (200, 9)]);
        // Channel state is scoped per login.
        assert_eq!(other.get_channel_pts(100).unwrap(), Some(1000));
    }

    #[test]
    fn exercise_access_hashes() {
        let store = open_memory();
        let scoped = store.scoped(1);

        scoped.set_channel_access_hash(100, -12345).unwrap();
        assert_eq!(scoped.get_channel_access_hash(100).unwrap(), Some(-12345));
        assert_eq!(scoped.get_channel_access_hash(101).unwrap(), None);

        scoped.set_user_metadata(500, 999, Some("someone")).unwrap();
        assert_eq!(scoped.get_user_access_hash(500).unwrap(), Some(999));
        // Username sticks when a later write doesn't carry one.
        scoped.set_user_metadata(500, 1000, None).unwrap();
        assert_eq!(scoped.get_user_access_hash(500).unwrap(), Some(1000));
    }

    #[test]
    fn exercise_file_cache() {
        let store = open_memory();
        let scoped = store.scoped(1);

        assert_eq!(scoped.get_file("P-y").unwrap(), None);
        let file = CachedFile {
            id: "P-y".to_string(),
            mxc: "mxc://example.com/abc".to_string(),
            mime_type: "image/jpeg".to_string(),
            size: 1024,
            width: Some(640),
            height: Some(480),
            thumbnail: false,
        };
        scoped.put_file(&file).unwrap();
        assert_eq!(scoped.get_file("P-y").unwrap(), Some(file.clone()));

        // Upserts are write-contention-safe; the last writer wins.
        let other = store.scoped(2);
        let newer = CachedFile {
            mxc: "mxc://example.com/def".to_string(),
            ..file
        };
        other.put_file(&newer).unwrap();
        assert_eq!(scoped.get_file("P-y").unwrap(), Some(newer));
    }
}
