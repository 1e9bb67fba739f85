//! The channel tree: parents, links, per-channel ACLs and groups.

use crate::acl::{AclEntry, Group};
use crate::proto::mumble::ChannelState;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use thiserror::Error;

pub const ROOT_CHANNEL_ID: u32 = 0;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TreeError {
    #[error("channel {0} does not exist")]
    UnknownChannel(u32),
    #[error("invalid channel name")]
    BadName,
    #[error("a sibling channel already has that name")]
    DuplicateName,
    #[error("channel nesting limit reached")]
    NestingLimit,
    #[error("channel count limit reached")]
    CountLimit,
    #[error("operation not allowed on the root channel")]
    Root,
    #[error("cannot move a channel below itself")]
    Cycle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: u32,
    /// `None` only for the root.
    pub parent_id: Option<u32>,
    pub name: String,
    pub description: String,
    pub position: i32,
    /// 0 means unlimited.
    pub max_users: u32,
    pub temporary: bool,
    pub inherit_acl: bool,
    pub children: BTreeSet<u32>,
    pub links: BTreeSet<u32>,
    pub acl: Vec<AclEntry>,
    pub groups: HashMap<String, Group>,
    /// Local listening sessions; runtime state, never synced or persisted.
    #[serde(skip)]
    pub listeners: HashSet<u32>,
}

impl Channel {
    pub fn new(id: u32, parent_id: Option<u32>, name: String, temporary: bool) -> Self {
        Self {
            id,
            parent_id,
            name,
            description: String::new(),
            position: 0,
            max_users: 0,
            temporary,
            inherit_acl: true,
            children: BTreeSet::new(),
            links: BTreeSet::new(),
            acl: Vec::new(),
            groups: HashMap::new(),
            listeners: HashSet::new(),
        }
    }

    pub fn get_channel_state(&self) -> ChannelState {
        ChannelState {
            channel_id: Some(self.id),
            parent: self.parent_id,
            name: Some(self.name.clone()),
            links: self.links.iter().copied().collect(),
            description: Some(self.description.clone()),
            links_add: Vec::new(),
            links_remove: Vec::new(),
            temporary: Some(self.temporary),
            position: Some(self.position),
            description_hash: None,
            max_users: Some(self.max_users),
            is_enter_restricted: None,
            can_enter: None,
        }
    }
}

/// Registry of channels keyed by id, rooted at [ROOT_CHANNEL_ID].
///
/// All relations are by id; the tree owns every channel record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelTree {
    channels: HashMap<u32, Channel>,
    pub nesting_limit: u32,
    pub count_limit: u32,
    next_channel_id: u32,
}

impl ChannelTree {
    pub fn new(nesting_limit: u32, count_limit: u32) -> Self {
        let mut channels = HashMap::new();
        channels.insert(ROOT_CHANNEL_ID, Channel::new(ROOT_CHANNEL_ID, None, "Root".to_string(), false));

        Self {
            channels,
            nesting_limit,
            count_limit,
            next_channel_id: 1,
        }
    }

    pub fn root_id(&self) -> u32 {
        ROOT_CHANNEL_ID
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn get(&self, id: u32) -> Option<&Channel> {
        self.channels.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut Channel> {
        self.channels.get_mut(&id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.channels.contains_key(&id)
    }

    pub fn find_by_name(&self, parent_id: u32, name: &str) -> Option<&Channel> {
        self.channels
            .values()
            .find(|channel| channel.parent_id == Some(parent_id) && channel.name == name)
    }

    /// Chain of channel ids from the root down to `id` (inclusive).
    pub fn chain(&self, id: u32) -> Vec<u32> {
        let mut chain = Vec::new();
        let mut cursor = Some(id);

        while let Some(current) = cursor {
            chain.push(current);
            cursor = self.channels.get(&current).and_then(|channel| channel.parent_id);

            if chain.len() > self.channels.len() {
                break;
            }
        }

        chain.reverse();
        chain
    }

    pub fn depth(&self, id: u32) -> u32 {
        self.chain(id).len().saturating_sub(1) as u32
    }

    pub fn is_descendant(&self, ancestor: u32, id: u32) -> bool {
        id != ancestor && self.chain(id).contains(&ancestor)
    }

    /// All ids of the subtree rooted at `id`, the root of the subtree first.
    pub fn subtree(&self, id: u32) -> Vec<u32> {
        let mut result = Vec::new();
        let mut queue = vec![id];

        while let Some(current) = queue.pop() {
            if let Some(channel) = self.channels.get(&current) {
                result.push(current);
                queue.extend(channel.children.iter().copied());
            }
        }

        result
    }

    fn subtree_height(&self, id: u32) -> u32 {
        match self.channels.get(&id) {
            Some(channel) => channel
                .children
                .iter()
                .map(|child| 1 + self.subtree_height(*child))
                .max()
                .unwrap_or(0),
            None => 0,
        }
    }

    /// Channels in broadcast order: root first, then each subtree, children
    /// ordered by id so a parent always precedes its children.
    pub fn iter_broadcast_order(&self) -> Vec<&Channel> {
        let mut result = Vec::with_capacity(self.channels.len());
        let mut queue = std::collections::VecDeque::from([ROOT_CHANNEL_ID]);

        while let Some(current) = queue.pop_front() {
            if let Some(channel) = self.channels.get(&current) {
                result.push(channel);
                queue.extend(channel.children.iter().copied());
            }
        }

        result
    }

    fn validate_name(name: &str) -> Result<(), TreeError> {
        if name.is_empty() || name.len() > 128 || name.trim() != name {
            return Err(TreeError::BadName);
        }

        Ok(())
    }

    /// Creates a channel under `parent_id` with a hub-assigned id.
    pub fn add_channel(&mut self, parent_id: u32, name: &str, temporary: bool) -> Result<u32, TreeError> {
        Self::validate_name(name)?;

        if !self.channels.contains_key(&parent_id) {
            return Err(TreeError::UnknownChannel(parent_id));
        }

        if self.find_by_name(parent_id, name).is_some() {
            return Err(TreeError::DuplicateName);
        }

        if self.channels.len() as u32 >= self.count_limit {
            return Err(TreeError::CountLimit);
        }

        if self.depth(parent_id) + 1 > self.nesting_limit {
            return Err(TreeError::NestingLimit);
        }

        let id = self.next_channel_id;
        self.next_channel_id += 1;

        self.channels.insert(id, Channel::new(id, Some(parent_id), name.to_string(), temporary));

        if let Some(parent) = self.channels.get_mut(&parent_id) {
            parent.children.insert(id);
        }

        Ok(id)
    }

    /// Inserts a channel replica with a hub-assigned id (edge-side sync).
    pub fn insert_synced(&mut self, channel: Channel) {
        let id = channel.id;
        let parent_id = channel.parent_id;

        self.next_channel_id = self.next_channel_id.max(id + 1);
        self.channels.insert(id, channel);

        if let Some(parent_id) = parent_id {
            if let Some(parent) = self.channels.get_mut(&parent_id) {
                parent.children.insert(id);
            }
        }
    }

    /// Removes `id` and its whole subtree, fixing links; returns the removed
    /// ids in removal order (leaves last).
    pub fn remove_channel(&mut self, id: u32) -> Result<Vec<u32>, TreeError> {
        if id == ROOT_CHANNEL_ID {
            return Err(TreeError::Root);
        }

        if !self.channels.contains_key(&id) {
            return Err(TreeError::UnknownChannel(id));
        }

        let removed = self.subtree(id);

        for removed_id in &removed {
            if let Some(channel) = self.channels.remove(removed_id) {
                for linked in channel.links {
                    if let Some(other) = self.channels.get_mut(&linked) {
                        other.links.remove(removed_id);
                    }
                }

                if let Some(parent_id) = channel.parent_id {
                    if let Some(parent) = self.channels.get_mut(&parent_id) {
                        parent.children.remove(removed_id);
                    }
                }
            }
        }

        Ok(removed)
    }

    pub fn move_channel(&mut self, id: u32, new_parent_id: u32) -> Result<(), TreeError> {
        if id == ROOT_CHANNEL_ID {
            return Err(TreeError::Root);
        }

        if !self.channels.contains_key(&new_parent_id) {
            return Err(TreeError::UnknownChannel(new_parent_id));
        }

        if id == new_parent_id || self.is_descendant(id, new_parent_id) {
            return Err(TreeError::Cycle);
        }

        let name = self
            .channels
            .get(&id)
            .ok_or(TreeError::UnknownChannel(id))?
            .name
            .clone();

        if self
            .find_by_name(new_parent_id, &name)
            .map(|sibling| sibling.id != id)
            .unwrap_or(false)
        {
            return Err(TreeError::DuplicateName);
        }

        if self.depth(new_parent_id) + 1 + self.subtree_height(id) > self.nesting_limit {
            return Err(TreeError::NestingLimit);
        }

        let old_parent = self.channels.get(&id).and_then(|channel| channel.parent_id);

        if let Some(old_parent) = old_parent {
            if let Some(parent) = self.channels.get_mut(&old_parent) {
                parent.children.remove(&id);
            }
        }

        if let Some(parent) = self.channels.get_mut(&new_parent_id) {
            parent.children.insert(id);
        }

        if let Some(channel) = self.channels.get_mut(&id) {
            channel.parent_id = Some(new_parent_id);
        }

        Ok(())
    }

    /// Creates the symmetric link between two channels.
    pub fn link_channels(&mut self, a: u32, b: u32) -> Result<(), TreeError> {
        if a == b {
            return Ok(());
        }

        if !self.channels.contains_key(&a) {
            return Err(TreeError::UnknownChannel(a));
        }

        if !self.channels.contains_key(&b) {
            return Err(TreeError::UnknownChannel(b));
        }

        if let Some(channel) = self.channels.get_mut(&a) {
            channel.links.insert(b);
        }

        if let Some(channel) = self.channels.get_mut(&b) {
            channel.links.insert(a);
        }

        Ok(())
    }

    pub fn unlink_channels(&mut self, a: u32, b: u32) {
        if let Some(channel) = self.channels.get_mut(&a) {
            channel.links.remove(&b);
        }

        if let Some(channel) = self.channels.get_mut(&b) {
            channel.links.remove(&a);
        }
    }

    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }

    /// Replaces the whole tree from a hub snapshot (edge full sync).
    pub fn replace_all(&mut self, channels: Vec<Channel>) {
        self.channels.clear();
        self.next_channel_id = 1;

        for mut channel in channels {
            channel.children.clear();
            self.next_channel_id = self.next_channel_id.max(channel.id + 1);
            self.channels.insert(channel.id, channel);
        }

        // rebuild child sets from parent pointers
        let relations: Vec<(u32, u32)> = self
            .channels
            .values()
            .filter_map(|channel| channel.parent_id.map(|parent| (parent, channel.id)))
            .collect();

        for (parent, child) in relations {
            if let Some(parent) = self.channels.get_mut(&parent) {
                parent.children.insert(child);
            }
        }

        if !self.channels.contains_key(&ROOT_CHANNEL_ID) {
            self.channels
                .insert(ROOT_CHANNEL_ID, Channel::new(ROOT_CHANNEL_ID, None, "Root".to_string(), false));
        }
    }

    #[cfg(test)]
    pub fn insert_for_test(&mut self, id: u32, parent_id: Option<u32>, name: &str) {
        self.insert_synced(Channel::new(id, parent_id, name.to_string(), false));
    }
}

impl Default for ChannelTree {
    fn default() -> Self {
        Self::new(10, 1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_exists_from_the_start() {
        let tree = ChannelTree::default();
        assert_eq!(tree.get(0).unwrap().name, "Root");
        assert_eq!(tree.chain(0), vec![0]);
    }

    #[test]
    fn add_and_chain() {
        let mut tree = ChannelTree::default();
        let lobby = tree.add_channel(0, "Lobby", false).unwrap();
        let inner = tree.add_channel(lobby, "Inner", false).unwrap();

        assert_eq!(tree.chain(inner), vec![0, lobby, inner]);
        assert_eq!(tree.depth(inner), 2);
        assert!(tree.get(0).unwrap().children.contains(&lobby));
    }

    #[test]
    fn sibling_names_must_be_unique() {
        let mut tree = ChannelTree::default();
        tree.add_channel(0, "Lobby", false).unwrap();
        assert_eq!(tree.add_channel(0, "Lobby", false), Err(TreeError::DuplicateName));

        // same name under a different parent is fine
        let other = tree.add_channel(0, "Other", false).unwrap();
        assert!(tree.add_channel(other, "Lobby", false).is_ok());
    }

    #[test]
    fn nesting_limit_is_enforced() {
        let mut tree = ChannelTree::new(2, 100);
        let a = tree.add_channel(0, "a", false).unwrap();
        let b = tree.add_channel(a, "b", false).unwrap();
        assert_eq!(tree.add_channel(b, "c", false), Err(TreeError::NestingLimit));
    }

    #[test]
    fn count_limit_is_enforced() {
        let mut tree = ChannelTree::new(10, 3);
        tree.add_channel(0, "a", false).unwrap();
        tree.add_channel(0, "b", false).unwrap();
        assert_eq!(tree.add_channel(0, "c", false), Err(TreeError::CountLimit));
    }

    #[test]
    fn remove_cascades_and_unlinks() {
        let mut tree = ChannelTree::default();
        let a = tree.add_channel(0, "a", false).unwrap();
        let b = tree.add_channel(a, "b", false).unwrap();
        let other = tree.add_channel(0, "other", false).unwrap();
        tree.link_channels(b, other).unwrap();

        let removed = tree.remove_channel(a).unwrap();
        assert!(removed.contains(&a) && removed.contains(&b));
        assert!(!tree.contains(a) && !tree.contains(b));
        assert!(tree.get(other).unwrap().links.is_empty());
        assert!(!tree.get(0).unwrap().children.contains(&a));
    }

    #[test]
    fn root_cannot_be_removed_or_moved() {
        let mut tree = ChannelTree::default();
        assert_eq!(tree.remove_channel(0), Err(TreeError::Root));
        let a = tree.add_channel(0, "a", false).unwrap();
        assert_eq!(tree.move_channel(0, a), Err(TreeError::Root));
    }

    #[test]
    fn move_rejects_cycles() {
        let mut tree = ChannelTree::default();
        let a = tree.add_channel(0, "a", false).unwrap();
        let b = tree.add_channel(a, "b", false).unwrap();

        assert_eq!(tree.move_channel(a, b), Err(TreeError::Cycle));
        assert_eq!(tree.move_channel(a, a), Err(TreeError::Cycle));
    }

    #[test]
    fn move_reparents() {
        let mut tree = ChannelTree::default();
        let a = tree.add_channel(0, "a", false).unwrap();
        let b = tree.add_channel(0, "b", false).unwrap();

        tree.move_channel(b, a).unwrap();
        assert_eq!(tree.chain(b), vec![0, a, b]);
        assert!(!tree.get(0).unwrap().children.contains(&b));
        assert!(tree.get(a).unwrap().children.contains(&b));
    }

    #[test]
    fn links_are_symmetric() {
        let mut tree = ChannelTree::default();
        let a = tree.add_channel(0, "a", false).unwrap();
        let b = tree.add_channel(0, "b", false).unwrap();

        tree.link_channels(a, b).unwrap();
        assert!(tree.get(a).unwrap().links.contains(&b));
        assert!(tree.get(b).unwrap().links.contains(&a));

        tree.unlink_channels(b, a);
        assert!(tree.get(a).unwrap().links.is_empty());
        assert!(tree.get(b).unwrap().links.is_empty());
    }

    #[test]
    fn broadcast_order_is_parent_first() {
        let mut tree = ChannelTree::default();
        let a = tree.add_channel(0, "a", false).unwrap();
        let b = tree.add_channel(a, "b", false).unwrap();
        let c = tree.add_channel(0, "c", false).unwrap();

        let order: Vec<u32> = tree.iter_broadcast_order().iter().map(|channel| channel.id).collect();
        let pos = |id: u32| order.iter().position(|x| *x == id).unwrap();
        assert_eq!(pos(0), 0);
        assert!(pos(a) < pos(b));
        assert!(order.contains(&c));
    }

    #[test]
    fn replace_all_rebuilds_children() {
        let mut tree = ChannelTree::default();
        let mut root = Channel::new(0, None, "Root".to_string(), false);
        root.children.insert(99); // stale relation that must be rebuilt away

        let snapshot = vec![root, Channel::new(5, Some(0), "five".to_string(), false)];
        tree.replace_all(snapshot);

        assert_eq!(tree.get(0).unwrap().children, BTreeSet::from([5]));
        assert_eq!(tree.chain(5), vec![0, 5]);
    }
}
