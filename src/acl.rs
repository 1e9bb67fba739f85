//! Permission bitmask, ACL entries, channel groups and the chain evaluator.

use crate::channel::ChannelTree;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

/// Permission bits, wire-compatible with the Mumble clients.
pub mod perm {
    pub const NONE: u32 = 0x0;
    pub const WRITE: u32 = 0x1;
    pub const TRAVERSE: u32 = 0x2;
    pub const ENTER: u32 = 0x4;
    pub const SPEAK: u32 = 0x8;
    pub const MUTE_DEAFEN: u32 = 0x10;
    pub const MOVE: u32 = 0x20;
    pub const MAKE_CHANNEL: u32 = 0x40;
    pub const LINK_CHANNEL: u32 = 0x80;
    pub const WHISPER: u32 = 0x100;
    pub const TEXT_MESSAGE: u32 = 0x200;
    pub const MAKE_TEMP_CHANNEL: u32 = 0x400;
    pub const LISTEN: u32 = 0x800;

    // valid on the root channel only
    pub const KICK: u32 = 0x10000;
    pub const BAN: u32 = 0x20000;
    pub const REGISTER: u32 = 0x40000;
    pub const SELF_REGISTER: u32 = 0x80000;

    pub const CACHED: u32 = 0x8000000;

    /// Granted on every channel before any entry applies.
    pub const DEFAULT: u32 = TRAVERSE | ENTER | SPEAK | WHISPER | TEXT_MESSAGE;
    /// Everything that is meaningful below the root.
    pub const ALL_SUB: u32 = WRITE
        | TRAVERSE
        | ENTER
        | SPEAK
        | MUTE_DEAFEN
        | MOVE
        | MAKE_CHANNEL
        | LINK_CHANNEL
        | WHISPER
        | TEXT_MESSAGE
        | MAKE_TEMP_CHANNEL
        | LISTEN;
    /// Everything, root-only bits included.
    pub const ALL_ROOT: u32 = ALL_SUB | KICK | BAN | REGISTER | SELF_REGISTER;
}

/// One ACL line on a channel. `user_id` and `group` are mutually exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclEntry {
    pub user_id: Option<u32>,
    pub group: Option<String>,
    pub apply_here: bool,
    pub apply_subs: bool,
    pub allow: u32,
    pub deny: u32,
}

/// A named channel group with inheritable membership.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    /// Pull members from the same-named group on the parent channel.
    pub inherit: bool,
    /// Children may pull members from this group.
    pub inheritable: bool,
    pub add: BTreeSet<u32>,
    pub remove: BTreeSet<u32>,
}

/// The identity an ACL decision is evaluated for.
#[derive(Debug, Clone)]
pub struct AclSubject {
    pub session: u32,
    /// Registered user id, 0 for unregistered guests.
    pub user_id: u32,
    pub super_user: bool,
    /// Channel the subject currently occupies.
    pub channel_id: u32,
    pub cert_hash: Option<String>,
}

impl AclSubject {
    pub fn guest(session: u32, channel_id: u32) -> Self {
        Self {
            session,
            user_id: 0,
            super_user: false,
            channel_id,
            cert_hash: None,
        }
    }
}

/// Effective members of `group` evaluated at `channel_id`: inherited members
/// of the same-named parent group (when both sides agree), plus `add`, minus
/// `remove`.
pub fn effective_members(tree: &ChannelTree, channel_id: u32, group: &str) -> BTreeSet<u32> {
    let channel = match tree.get(channel_id) {
        Some(channel) => channel,
        None => return BTreeSet::new(),
    };

    let mut members = match (channel.groups.get(group), channel.parent_id) {
        (Some(def), Some(parent)) if def.inherit => inheritable_members(tree, parent, group),
        (None, Some(parent)) => inheritable_members(tree, parent, group),
        _ => BTreeSet::new(),
    };

    if let Some(def) = channel.groups.get(group) {
        members.extend(def.add.iter().copied());

        for removed in &def.remove {
            members.remove(removed);
        }
    }

    members
}

/// Members that `group` at `channel_id` exposes to inheriting children.
fn inheritable_members(tree: &ChannelTree, channel_id: u32, group: &str) -> BTreeSet<u32> {
    match tree.get(channel_id) {
        Some(channel) => match channel.groups.get(group) {
            Some(def) if !def.inheritable => BTreeSet::new(),
            _ => effective_members(tree, channel_id, group),
        },
        None => BTreeSet::new(),
    }
}

/// Group membership check with the special groups resolved first.
pub fn is_member(tree: &ChannelTree, eval_channel_id: u32, group: &str, subject: &AclSubject) -> bool {
    let (invert, group) = match group.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, group),
    };

    let result = match group {
        "all" => true,
        "auth" => subject.user_id > 0,
        "in" => subject.channel_id == eval_channel_id,
        "out" => subject.channel_id != eval_channel_id,
        _ => {
            if let Some(hash) = group.strip_prefix('$') {
                subject.cert_hash.as_deref() == Some(hash)
            } else {
                subject.user_id > 0 && effective_members(tree, eval_channel_id, group).contains(&subject.user_id)
            }
        }
    };

    result != invert
}

/// Computes the effective permission bitmask of `subject` on `channel_id`
/// along the root-to-channel chain.
pub fn effective_permissions(tree: &ChannelTree, subject: &AclSubject, channel_id: u32) -> u32 {
    if subject.super_user {
        return if channel_id == tree.root_id() { perm::ALL_ROOT } else { perm::ALL_SUB };
    }

    let chain = tree.chain(channel_id);
    let mut granted = perm::DEFAULT;

    for chain_id in &chain {
        let channel = match tree.get(*chain_id) {
            Some(channel) => channel,
            None => continue,
        };

        if !channel.inherit_acl {
            granted = perm::DEFAULT;
        }

        let at_target = *chain_id == channel_id;

        for entry in &channel.acl {
            let applies = if at_target { entry.apply_here } else { entry.apply_subs };

            if !applies {
                continue;
            }

            let matches = match (&entry.user_id, &entry.group) {
                (Some(user_id), _) => subject.user_id > 0 && subject.user_id == *user_id,
                (None, Some(group)) => is_member(tree, *chain_id, group, subject),
                (None, None) => false,
            };

            if !matches {
                continue;
            }

            granted |= entry.allow;
            granted &= !entry.deny;
        }

        // a denied traversal wipes everything below, unless Write holds
        if granted & perm::TRAVERSE == 0 && granted & perm::WRITE == 0 {
            return perm::NONE;
        }
    }

    granted
}

/// Single permission check, honoring the `Write` superset rule.
pub fn check(granted: u32, wanted: u32) -> bool {
    if granted & perm::WRITE != 0 && wanted & (perm::SPEAK | perm::WHISPER) == 0 {
        return true;
    }

    granted & wanted == wanted
}

/// Cache of effective bitmasks keyed by `(session, channel)`, dropped in full
/// on any ACL or tree change.
#[derive(Default)]
pub struct AclCache {
    inner: Mutex<HashMap<(u32, u32), u32>>,
}

impl AclCache {
    pub fn get_or_compute(&self, tree: &ChannelTree, subject: &AclSubject, channel_id: u32) -> u32 {
        let key = (subject.session, channel_id);

        if let Ok(cache) = self.inner.lock() {
            if let Some(granted) = cache.get(&key) {
                return *granted;
            }
        }

        let granted = effective_permissions(tree, subject, channel_id);

        if let Ok(mut cache) = self.inner.lock() {
            cache.insert(key, granted);
        }

        granted
    }

    pub fn has_permission(&self, tree: &ChannelTree, subject: &AclSubject, channel_id: u32, wanted: u32) -> bool {
        check(self.get_or_compute(tree, subject, channel_id), wanted)
    }

    pub fn clear(&self) {
        if let Ok(mut cache) = self.inner.lock() {
            cache.clear();
        }
    }

    /// Drops cached entries for one session only (on disconnect).
    pub fn forget_session(&self, session: u32) {
        if let Ok(mut cache) = self.inner.lock() {
            cache.retain(|(cached_session, _), _| *cached_session != session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelTree;

    fn tree() -> ChannelTree {
        let mut tree = ChannelTree::new(10, 100);
        // 0 = Root, 1 = Lobby, 2 = Lobby/Private
        tree.insert_for_test(1, Some(0), "Lobby");
        tree.insert_for_test(2, Some(1), "Private");
        tree
    }

    fn subject(session: u32, user_id: u32, channel_id: u32) -> AclSubject {
        AclSubject {
            session,
            user_id,
            super_user: false,
            channel_id,
            cert_hash: None,
        }
    }

    fn deny_all(perms: u32) -> AclEntry {
        AclEntry {
            user_id: None,
            group: Some("all".to_string()),
            apply_here: true,
            apply_subs: true,
            allow: 0,
            deny: perms,
        }
    }

    #[test]
    fn default_permissions_without_entries() {
        let tree = tree();
        let granted = effective_permissions(&tree, &subject(1, 0, 0), 2);
        assert_eq!(granted, perm::DEFAULT);
    }

    #[test]
    fn deny_speak_via_all_group() {
        let mut tree = tree();
        tree.get_mut(2).unwrap().acl.push(deny_all(perm::SPEAK));

        let granted = effective_permissions(&tree, &subject(1, 0, 2), 2);
        assert!(!check(granted, perm::SPEAK));
        assert!(check(granted, perm::ENTER));
    }

    #[test]
    fn apply_subs_reaches_descendants_but_apply_here_does_not() {
        let mut tree = tree();
        tree.get_mut(1).unwrap().acl.push(AclEntry {
            user_id: None,
            group: Some("all".to_string()),
            apply_here: false,
            apply_subs: true,
            allow: 0,
            deny: perm::TEXT_MESSAGE,
        });

        let on_parent = effective_permissions(&tree, &subject(1, 0, 1), 1);
        let on_child = effective_permissions(&tree, &subject(1, 0, 2), 2);
        assert!(check(on_parent, perm::TEXT_MESSAGE));
        assert!(!check(on_child, perm::TEXT_MESSAGE));
    }

    #[test]
    fn inherit_acl_false_resets_inherited_entries() {
        let mut tree = tree();
        tree.get_mut(0).unwrap().acl.push(deny_all(perm::SPEAK));
        tree.get_mut(2).unwrap().inherit_acl = false;

        assert!(!check(effective_permissions(&tree, &subject(1, 0, 1), 1), perm::SPEAK));
        assert!(check(effective_permissions(&tree, &subject(1, 0, 2), 2), perm::SPEAK));
    }

    #[test]
    fn denied_traverse_clears_everything() {
        let mut tree = tree();
        tree.get_mut(1).unwrap().acl.push(deny_all(perm::TRAVERSE));

        assert_eq!(effective_permissions(&tree, &subject(1, 0, 2), 2), perm::NONE);
    }

    #[test]
    fn user_entry_beats_group_default() {
        let mut tree = tree();
        tree.get_mut(2).unwrap().acl.push(deny_all(perm::SPEAK));
        tree.get_mut(2).unwrap().acl.push(AclEntry {
            user_id: Some(42),
            group: None,
            apply_here: true,
            apply_subs: false,
            allow: perm::SPEAK,
            deny: 0,
        });

        assert!(check(effective_permissions(&tree, &subject(1, 42, 2), 2), perm::SPEAK));
        assert!(!check(effective_permissions(&tree, &subject(2, 7, 2), 2), perm::SPEAK));
    }

    #[test]
    fn auth_in_out_and_cert_groups() {
        let tree = tree();
        let mut with_cert = subject(1, 5, 2);
        with_cert.cert_hash = Some("abcd".to_string());

        assert!(is_member(&tree, 2, "all", &subject(1, 0, 2)));
        assert!(!is_member(&tree, 2, "auth", &subject(1, 0, 2)));
        assert!(is_member(&tree, 2, "auth", &subject(1, 5, 2)));
        assert!(is_member(&tree, 2, "in", &subject(1, 0, 2)));
        assert!(!is_member(&tree, 2, "in", &subject(1, 0, 1)));
        assert!(is_member(&tree, 2, "out", &subject(1, 0, 1)));
        assert!(is_member(&tree, 2, "$abcd", &with_cert));
        assert!(!is_member(&tree, 2, "$other", &with_cert));
    }

    #[test]
    fn group_membership_inherits_through_the_tree() {
        let mut tree = tree();
        tree.get_mut(1).unwrap().groups.insert(
            "staff".to_string(),
            Group {
                name: "staff".to_string(),
                inherit: false,
                inheritable: true,
                add: [10, 11].into(),
                remove: BTreeSet::new(),
            },
        );
        tree.get_mut(2).unwrap().groups.insert(
            "staff".to_string(),
            Group {
                name: "staff".to_string(),
                inherit: true,
                inheritable: true,
                add: [12].into(),
                remove: [11].into(),
            },
        );

        let members = effective_members(&tree, 2, "staff");
        assert_eq!(members, [10, 12].into());

        // a child that opts out of inheritance starts empty
        tree.get_mut(2).unwrap().groups.get_mut("staff").unwrap().inherit = false;
        assert_eq!(effective_members(&tree, 2, "staff"), [12].into());
    }

    #[test]
    fn group_scoped_acl_entry() {
        let mut tree = tree();
        tree.get_mut(1).unwrap().groups.insert(
            "staff".to_string(),
            Group {
                name: "staff".to_string(),
                inherit: false,
                inheritable: true,
                add: [10].into(),
                remove: BTreeSet::new(),
            },
        );
        tree.get_mut(1).unwrap().acl.push(AclEntry {
            user_id: None,
            group: Some("staff".to_string()),
            apply_here: true,
            apply_subs: true,
            allow: perm::MUTE_DEAFEN,
            deny: 0,
        });

        assert!(check(effective_permissions(&tree, &subject(1, 10, 2), 2), perm::MUTE_DEAFEN));
        assert!(!check(effective_permissions(&tree, &subject(2, 11, 2), 2), perm::MUTE_DEAFEN));
    }

    #[test]
    fn super_user_shortcut() {
        let tree = tree();
        let mut admin = subject(1, 1, 0);
        admin.super_user = true;

        assert_eq!(effective_permissions(&tree, &admin, 0), perm::ALL_ROOT);
        assert_eq!(effective_permissions(&tree, &admin, 2), perm::ALL_SUB);
    }

    #[test]
    fn write_implies_everything_but_voice() {
        assert!(check(perm::WRITE, perm::KICK));
        assert!(check(perm::WRITE, perm::ENTER | perm::MOVE));
        assert!(!check(perm::WRITE, perm::SPEAK));
        assert!(!check(perm::WRITE, perm::WHISPER));
    }

    #[test]
    fn cache_is_stable_until_cleared() {
        let mut tree = tree();
        let cache = AclCache::default();
        let who = subject(1, 0, 2);

        assert!(cache.has_permission(&tree, &who, 2, perm::SPEAK));

        // a tree change without invalidation is not observed...
        tree.get_mut(2).unwrap().acl.push(deny_all(perm::SPEAK));
        assert!(cache.has_permission(&tree, &who, 2, perm::SPEAK));

        // ...until the cache is dropped
        cache.clear();
        assert!(!cache.has_permission(&tree, &who, 2, perm::SPEAK));
    }
}
