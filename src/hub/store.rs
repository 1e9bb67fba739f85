//! The hub's embedded store: channels, ACLs, groups, bans and registered
//! users, mutated transactionally and backed up on a schedule.

use crate::acl::{AclEntry, Group};
use crate::ban::Ban;
use crate::channel::{Channel, ChannelTree};
use crate::rpc::RegisteredUserSummary;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Mutex;

const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS channels (
    id          INTEGER PRIMARY KEY,
    parent_id   INTEGER REFERENCES channels(id) ON DELETE CASCADE,
    name        TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    position    INTEGER NOT NULL DEFAULT 0,
    max_users   INTEGER NOT NULL DEFAULT 0,
    inherit_acl INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS channel_links (
    a INTEGER NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
    b INTEGER NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
    PRIMARY KEY (a, b)
);

CREATE TABLE IF NOT EXISTS acl_entries (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    channel_id INTEGER NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
    position   INTEGER NOT NULL,
    user_id    INTEGER,
    grp        TEXT,
    apply_here INTEGER NOT NULL,
    apply_subs INTEGER NOT NULL,
    allow_mask INTEGER NOT NULL,
    deny_mask  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS groups (
    channel_id  INTEGER NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
    name        TEXT NOT NULL,
    inherit     INTEGER NOT NULL,
    inheritable INTEGER NOT NULL,
    PRIMARY KEY (channel_id, name)
);

CREATE TABLE IF NOT EXISTS group_members (
    channel_id INTEGER NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
    group_name TEXT NOT NULL,
    user_id    INTEGER NOT NULL,
    is_remove  INTEGER NOT NULL,
    PRIMARY KEY (channel_id, group_name, user_id, is_remove)
);

CREATE TABLE IF NOT EXISTS bans (
    id         INTEGER PRIMARY KEY,
    address    TEXT,
    mask       INTEGER NOT NULL DEFAULT 128,
    name       TEXT,
    hash       TEXT,
    reason     TEXT NOT NULL DEFAULT '',
    start      INTEGER NOT NULL,
    duration_s INTEGER NOT NULL DEFAULT 0,
    created_by TEXT
);

CREATE TABLE IF NOT EXISTS users (
    user_id      INTEGER PRIMARY KEY,
    name         TEXT NOT NULL UNIQUE,
    texture_blob TEXT,
    comment_blob TEXT,
    last_channel INTEGER,
    last_seen    INTEGER
);

CREATE TABLE IF NOT EXISTS user_certs (
    user_id   INTEGER NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
    cert_hash TEXT NOT NULL,
    PRIMARY KEY (user_id, cert_hash)
);
"#;

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self { conn: Mutex::new(conn) })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>) -> rusqlite::Result<T> {
        let mut conn = self.conn.lock().map_err(|_| rusqlite::Error::InvalidQuery)?;

        f(&mut conn)
    }

    /// Loads the whole channel tree. An empty store yields the default tree
    /// with just the root.
    pub fn load_tree(&self, nesting_limit: u32, count_limit: u32) -> rusqlite::Result<ChannelTree> {
        self.with_conn(|conn| {
            let mut channels = Vec::new();

            {
                let mut stmt =
                    conn.prepare("SELECT id, parent_id, name, description, position, max_users, inherit_acl FROM channels")?;
                let rows = stmt.query_map([], |row| {
                    let id: u32 = row.get(0)?;
                    let parent_id: Option<u32> = row.get(1)?;
                    let name: String = row.get(2)?;

                    let mut channel = Channel::new(id, parent_id, name, false);
                    channel.description = row.get(3)?;
                    channel.position = row.get(4)?;
                    channel.max_users = row.get(5)?;
                    channel.inherit_acl = row.get::<_, i64>(6)? != 0;

                    Ok(channel)
                })?;

                for channel in rows {
                    channels.push(channel?);
                }
            }

            for channel in &mut channels {
                let mut stmt = conn.prepare(
                    "SELECT user_id, grp, apply_here, apply_subs, allow_mask, deny_mask \
                     FROM acl_entries WHERE channel_id = ?1 ORDER BY position",
                )?;
                let rows = stmt.query_map(params![channel.id], |row| {
                    Ok(AclEntry {
                        user_id: row.get(0)?,
                        group: row.get(1)?,
                        apply_here: row.get::<_, i64>(2)? != 0,
                        apply_subs: row.get::<_, i64>(3)? != 0,
                        allow: row.get::<_, i64>(4)? as u32,
                        deny: row.get::<_, i64>(5)? as u32,
                    })
                })?;

                for entry in rows {
                    channel.acl.push(entry?);
                }

                let mut stmt = conn.prepare("SELECT name, inherit, inheritable FROM groups WHERE channel_id = ?1")?;
                let rows = stmt.query_map(params![channel.id], |row| {
                    Ok(Group {
                        name: row.get(0)?,
                        inherit: row.get::<_, i64>(1)? != 0,
                        inheritable: row.get::<_, i64>(2)? != 0,
                        add: BTreeSet::new(),
                        remove: BTreeSet::new(),
                    })
                })?;

                for group in rows {
                    let group = group?;
                    channel.groups.insert(group.name.clone(), group);
                }

                let mut stmt =
                    conn.prepare("SELECT group_name, user_id, is_remove FROM group_members WHERE channel_id = ?1")?;
                let rows = stmt.query_map(params![channel.id], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?, row.get::<_, i64>(2)? != 0))
                })?;

                for row in rows {
                    let (group_name, user_id, is_remove) = row?;

                    if let Some(group) = channel.groups.get_mut(&group_name) {
                        if is_remove {
                            group.remove.insert(user_id);
                        } else {
                            group.add.insert(user_id);
                        }
                    }
                }

                let mut stmt = conn.prepare("SELECT b FROM channel_links WHERE a = ?1")?;
                let rows = stmt.query_map(params![channel.id], |row| row.get::<_, u32>(0))?;

                for linked in rows {
                    channel.links.insert(linked?);
                }
            }

            let mut tree = ChannelTree::new(nesting_limit, count_limit);

            if !channels.is_empty() {
                tree.replace_all(channels);
            }

            Ok(tree)
        })
    }

    /// Upserts one channel with its ACL, groups and links, in a single
    /// transaction. Temporary channels are never persisted.
    pub fn save_channel(&self, channel: &Channel) -> rusqlite::Result<()> {
        if channel.temporary {
            return Ok(());
        }

        self.with_conn(|conn| {
            let tx = conn.transaction()?;

            tx.execute(
                "INSERT INTO channels (id, parent_id, name, description, position, max_users, inherit_acl) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                 ON CONFLICT(id) DO UPDATE SET parent_id = ?2, name = ?3, description = ?4, position = ?5, \
                 max_users = ?6, inherit_acl = ?7",
                params![
                    channel.id,
                    channel.parent_id,
                    channel.name,
                    channel.description,
                    channel.position,
                    channel.max_users,
                    channel.inherit_acl as i64,
                ],
            )?;

            tx.execute("DELETE FROM acl_entries WHERE channel_id = ?1", params![channel.id])?;

            for (position, entry) in channel.acl.iter().enumerate() {
                tx.execute(
                    "INSERT INTO acl_entries (channel_id, position, user_id, grp, apply_here, apply_subs, allow_mask, deny_mask) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        channel.id,
                        position as i64,
                        entry.user_id,
                        entry.group,
                        entry.apply_here as i64,
                        entry.apply_subs as i64,
                        entry.allow as i64,
                        entry.deny as i64,
                    ],
                )?;
            }

            tx.execute("DELETE FROM groups WHERE channel_id = ?1", params![channel.id])?;
            tx.execute("DELETE FROM group_members WHERE channel_id = ?1", params![channel.id])?;

            for group in channel.groups.values() {
                tx.execute(
                    "INSERT INTO groups (channel_id, name, inherit, inheritable) VALUES (?1, ?2, ?3, ?4)",
                    params![channel.id, group.name, group.inherit as i64, group.inheritable as i64],
                )?;

                for user_id in &group.add {
                    tx.execute(
                        "INSERT INTO group_members (channel_id, group_name, user_id, is_remove) VALUES (?1, ?2, ?3, 0)",
                        params![channel.id, group.name, user_id],
                    )?;
                }

                for user_id in &group.remove {
                    tx.execute(
                        "INSERT INTO group_members (channel_id, group_name, user_id, is_remove) VALUES (?1, ?2, ?3, 1)",
                        params![channel.id, group.name, user_id],
                    )?;
                }
            }

            tx.execute("DELETE FROM channel_links WHERE a = ?1 OR b = ?1", params![channel.id])?;

            for linked in &channel.links {
                tx.execute("INSERT INTO channel_links (a, b) VALUES (?1, ?2)", params![channel.id, linked])?;
                tx.execute("INSERT INTO channel_links (a, b) VALUES (?1, ?2)", params![linked, channel.id])?;
            }

            tx.commit()
        })
    }

    pub fn delete_channels(&self, channel_ids: &[u32]) -> rusqlite::Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;

            for channel_id in channel_ids {
                tx.execute("DELETE FROM channels WHERE id = ?1", params![channel_id])?;
                tx.execute("DELETE FROM channel_links WHERE a = ?1 OR b = ?1", params![channel_id])?;
            }

            tx.commit()
        })
    }

    pub fn load_bans(&self) -> rusqlite::Result<Vec<Ban>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, address, mask, name, hash, reason, start, duration_s, created_by FROM bans")?;
            let rows = stmt.query_map([], |row| {
                let address: Option<String> = row.get(1)?;

                Ok(Ban {
                    id: row.get(0)?,
                    address: address.and_then(|raw| raw.parse::<IpAddr>().ok()),
                    mask: row.get::<_, i64>(2)? as u8,
                    name: row.get(3)?,
                    hash: row.get(4)?,
                    reason: row.get(5)?,
                    start: row.get::<_, i64>(6)? as u64,
                    duration_s: row.get::<_, i64>(7)? as u32,
                    created_by: row.get(8)?,
                })
            })?;

            rows.collect()
        })
    }

    /// Replaces the persisted ban list with the given one.
    pub fn save_bans(&self, bans: &[Ban]) -> rusqlite::Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;

            tx.execute("DELETE FROM bans", [])?;

            for ban in bans {
                tx.execute(
                    "INSERT INTO bans (id, address, mask, name, hash, reason, start, duration_s, created_by) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        ban.id,
                        ban.address.map(|ip| ip.to_string()),
                        ban.mask as i64,
                        ban.name,
                        ban.hash,
                        ban.reason,
                        ban.start as i64,
                        ban.duration_s as i64,
                        ban.created_by,
                    ],
                )?;
            }

            tx.commit()
        })
    }

    /// Records a successful login of a registered user.
    pub fn touch_user(&self, user_id: u32, name: &str, cert_hash: Option<&str>, last_channel: Option<u32>) -> rusqlite::Result<()> {
        if user_id == 0 {
            return Ok(());
        }

        self.with_conn(|conn| {
            let tx = conn.transaction()?;

            tx.execute(
                "INSERT INTO users (user_id, name, last_channel, last_seen) VALUES (?1, ?2, ?3, strftime('%s','now')) \
                 ON CONFLICT(user_id) DO UPDATE SET name = ?2, last_seen = strftime('%s','now'), \
                 last_channel = COALESCE(?3, last_channel)",
                params![user_id, name, last_channel],
            )?;

            if let Some(cert_hash) = cert_hash {
                tx.execute(
                    "INSERT OR IGNORE INTO user_certs (user_id, cert_hash) VALUES (?1, ?2)",
                    params![user_id, cert_hash],
                )?;
            }

            tx.commit()
        })
    }

    pub fn last_channel_of(&self, user_id: u32) -> rusqlite::Result<Option<u32>> {
        self.with_conn(|conn| {
            conn.query_row("SELECT last_channel FROM users WHERE user_id = ?1", params![user_id], |row| {
                row.get(0)
            })
            .optional()
            .map(Option::flatten)
        })
    }

    pub fn list_users(&self) -> rusqlite::Result<Vec<RegisteredUserSummary>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT user_id, name, last_seen, last_channel FROM users ORDER BY user_id")?;
            let rows = stmt.query_map([], |row| {
                Ok(RegisteredUserSummary {
                    user_id: row.get(0)?,
                    name: row.get(1)?,
                    last_seen: row.get::<_, Option<i64>>(2)?.map(|seen| seen as u64),
                    last_channel: row.get(3)?,
                })
            })?;

            rows.collect()
        })
    }

    /// Online backup to the configured path.
    pub fn backup_to<P: AsRef<Path>>(&self, path: P) -> rusqlite::Result<()> {
        self.with_conn(|conn| {
            let mut target = Connection::open(path)?;
            let backup = rusqlite::backup::Backup::new(conn, &mut target)?;

            backup.run_to_completion(64, std::time::Duration::from_millis(5), None)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::perm;
    use crate::ban::unix_now;

    fn sample_channel(id: u32, parent: Option<u32>) -> Channel {
        let mut channel = Channel::new(id, parent, format!("channel-{id}"), false);
        channel.description = "described".to_string();
        channel.position = 7;
        channel.max_users = 12;
        channel.acl.push(AclEntry {
            user_id: None,
            group: Some("staff".to_string()),
            apply_here: true,
            apply_subs: false,
            allow: perm::MUTE_DEAFEN,
            deny: perm::SPEAK,
        });
        channel.groups.insert(
            "staff".to_string(),
            Group {
                name: "staff".to_string(),
                inherit: true,
                inheritable: true,
                add: BTreeSet::from([5, 6]),
                remove: BTreeSet::from([7]),
            },
        );

        channel
    }

    #[test]
    fn tree_save_load_roundtrip() {
        let store = Store::open_in_memory().unwrap();

        let root = Channel::new(0, None, "Root".to_string(), false);
        let mut child = sample_channel(3, Some(0));
        let mut other = Channel::new(4, Some(0), "other".to_string(), false);
        child.links.insert(4);
        other.links.insert(3);

        store.save_channel(&root).unwrap();
        store.save_channel(&child).unwrap();
        store.save_channel(&other).unwrap();

        let tree = store.load_tree(10, 100).unwrap();
        assert_eq!(tree.len(), 3);

        let loaded = tree.get(3).unwrap();
        assert_eq!(loaded.name, "channel-3");
        assert_eq!(loaded.description, "described");
        assert_eq!(loaded.position, 7);
        assert_eq!(loaded.max_users, 12);
        assert_eq!(loaded.acl, child.acl);
        assert_eq!(loaded.groups, child.groups);
        assert!(loaded.links.contains(&4));
        assert!(tree.get(4).unwrap().links.contains(&3));
        assert_eq!(tree.chain(3), vec![0, 3]);
    }

    #[test]
    fn saving_twice_yields_identical_state() {
        let store = Store::open_in_memory().unwrap();
        store.save_channel(&Channel::new(0, None, "Root".to_string(), false)).unwrap();

        let channel = sample_channel(2, Some(0));
        store.save_channel(&channel).unwrap();

        let loaded = store.load_tree(10, 100).unwrap().get(2).unwrap().clone();
        store.save_channel(&loaded).unwrap();

        let reloaded = store.load_tree(10, 100).unwrap().get(2).unwrap().clone();
        assert_eq!(reloaded.acl, loaded.acl);
        assert_eq!(reloaded.groups, loaded.groups);
        assert_eq!(reloaded.name, loaded.name);
    }

    #[test]
    fn temporary_channels_are_not_persisted() {
        let store = Store::open_in_memory().unwrap();
        store.save_channel(&Channel::new(0, None, "Root".to_string(), false)).unwrap();
        store.save_channel(&Channel::new(9, Some(0), "temp".to_string(), true)).unwrap();

        assert!(store.load_tree(10, 100).unwrap().get(9).is_none());
    }

    #[test]
    fn channel_delete_cascades() {
        let store = Store::open_in_memory().unwrap();
        store.save_channel(&Channel::new(0, None, "Root".to_string(), false)).unwrap();
        store.save_channel(&sample_channel(3, Some(0))).unwrap();

        store.delete_channels(&[3]).unwrap();

        let tree = store.load_tree(10, 100).unwrap();
        assert!(tree.get(3).is_none());
    }

    #[test]
    fn ban_roundtrip() {
        let store = Store::open_in_memory().unwrap();

        let bans = vec![Ban {
            id: 1,
            address: Some("10.0.0.1".parse().unwrap()),
            mask: 128,
            name: Some("mallory".to_string()),
            hash: Some("cafebabe".to_string()),
            reason: "spam".to_string(),
            start: unix_now(),
            duration_s: 600,
            created_by: Some("admin".to_string()),
        }];

        store.save_bans(&bans).unwrap();
        assert_eq!(store.load_bans().unwrap(), bans);

        store.save_bans(&[]).unwrap();
        assert!(store.load_bans().unwrap().is_empty());
    }

    #[test]
    fn user_bookkeeping() {
        let store = Store::open_in_memory().unwrap();

        store.touch_user(42, "alice", Some("abcd"), Some(3)).unwrap();
        store.touch_user(42, "alice", None, None).unwrap();

        let users = store.list_users().unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].user_id, 42);
        assert_eq!(users[0].name, "alice");
        assert!(users[0].last_seen.is_some());

        // None does not clobber the remembered channel
        assert_eq!(store.last_channel_of(42).unwrap(), Some(3));
        assert_eq!(store.last_channel_of(99).unwrap(), None);

        // guests are never recorded
        store.touch_user(0, "guest", None, None).unwrap();
        assert_eq!(store.list_users().unwrap().len(), 1);
    }
}
