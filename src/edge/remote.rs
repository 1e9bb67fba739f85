//! The edge's mirror of sessions hosted by other edges, maintained from hub
//! notifications and used to bound inter-edge voice fan-out.

use crate::rpc::RemoteSessionInfo;
use std::collections::{HashMap, HashSet};

#[derive(Default)]
pub struct RemoteDirectory {
    users: HashMap<u32, RemoteSessionInfo>,
    /// channel -> edge -> number of remote sessions hearing that channel.
    channel_edges: HashMap<u32, HashMap<u32, u32>>,
}

fn hearing_channels(info: &RemoteSessionInfo) -> HashSet<u32> {
    let mut channels: HashSet<u32> = info.listening.iter().copied().collect();
    channels.insert(info.channel_id);
    channels
}

impl RemoteDirectory {
    fn add_refs(&mut self, info: &RemoteSessionInfo) {
        for channel in hearing_channels(info) {
            *self.channel_edges.entry(channel).or_default().entry(info.edge_id).or_insert(0) += 1;
        }
    }

    fn drop_refs(&mut self, info: &RemoteSessionInfo) {
        for channel in hearing_channels(info) {
            if let Some(edges) = self.channel_edges.get_mut(&channel) {
                if let Some(count) = edges.get_mut(&info.edge_id) {
                    *count = count.saturating_sub(1);

                    if *count == 0 {
                        edges.remove(&info.edge_id);
                    }
                }

                if edges.is_empty() {
                    self.channel_edges.remove(&channel);
                }
            }
        }
    }

    pub fn upsert(&mut self, info: RemoteSessionInfo) {
        if let Some(old) = self.users.remove(&info.session) {
            self.drop_refs(&old);
        }

        self.add_refs(&info);
        self.users.insert(info.session, info);
    }

    pub fn remove(&mut self, session: u32) -> Option<RemoteSessionInfo> {
        let info = self.users.remove(&session)?;
        self.drop_refs(&info);

        Some(info)
    }

    pub fn get(&self, session: u32) -> Option<&RemoteSessionInfo> {
        self.users.get(&session)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &RemoteSessionInfo> {
        self.users.values()
    }

    /// Edges hosting at least one session that hears `channel`.
    pub fn edges_for_channel(&self, channel: u32) -> Vec<u32> {
        self.channel_edges
            .get(&channel)
            .map(|edges| edges.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Remote sessions that hear `channel` (members or listeners).
    pub fn recipients_in(&self, channel: u32) -> impl Iterator<Item = &RemoteSessionInfo> {
        self.users
            .values()
            .filter(move |info| info.channel_id == channel || info.listening.contains(&channel))
    }

    pub fn clear(&mut self) {
        self.users.clear();
        self.channel_edges.clear();
    }

    /// Rebuilds the directory from a full sync, skipping our own sessions.
    pub fn replace_all(&mut self, sessions: Vec<RemoteSessionInfo>, local_edge_id: u32) {
        self.clear();

        for info in sessions {
            if info.edge_id != local_edge_id {
                self.upsert(info);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(session: u32, edge_id: u32, channel_id: u32, listening: Vec<u32>) -> RemoteSessionInfo {
        RemoteSessionInfo {
            session,
            edge_id,
            channel_id,
            name: format!("user-{session}"),
            listening,
            ..Default::default()
        }
    }

    #[test]
    fn edges_follow_membership() {
        let mut dir = RemoteDirectory::default();
        dir.upsert(info(1, 10, 3, vec![]));
        dir.upsert(info(2, 11, 3, vec![]));
        dir.upsert(info(3, 10, 4, vec![]));

        let mut edges = dir.edges_for_channel(3);
        edges.sort_unstable();
        assert_eq!(edges, vec![10, 11]);
        assert_eq!(dir.edges_for_channel(4), vec![10]);
        assert!(dir.edges_for_channel(9).is_empty());
    }

    #[test]
    fn listening_counts_as_hearing() {
        let mut dir = RemoteDirectory::default();
        dir.upsert(info(1, 10, 3, vec![7]));

        assert_eq!(dir.edges_for_channel(7), vec![10]);
        assert_eq!(dir.recipients_in(7).count(), 1);
    }

    #[test]
    fn move_updates_refcounts() {
        let mut dir = RemoteDirectory::default();
        dir.upsert(info(1, 10, 3, vec![]));
        dir.upsert(info(2, 10, 3, vec![]));

        // one of the two moves away; edge 10 still hears channel 3
        dir.upsert(info(1, 10, 5, vec![]));
        assert_eq!(dir.edges_for_channel(3), vec![10]);

        dir.upsert(info(2, 10, 5, vec![]));
        assert!(dir.edges_for_channel(3).is_empty());
    }

    #[test]
    fn remove_cleans_up() {
        let mut dir = RemoteDirectory::default();
        dir.upsert(info(1, 10, 3, vec![4]));

        let removed = dir.remove(1).unwrap();
        assert_eq!(removed.session, 1);
        assert!(dir.edges_for_channel(3).is_empty());
        assert!(dir.edges_for_channel(4).is_empty());
        assert!(dir.remove(1).is_none());
    }

    #[test]
    fn replace_all_skips_local_edge() {
        let mut dir = RemoteDirectory::default();
        dir.replace_all(vec![info(1, 10, 3, vec![]), info(2, 99, 3, vec![])], 99);

        assert!(dir.get(1).is_some());
        assert!(dir.get(2).is_none());
        assert_eq!(dir.edges_for_channel(3), vec![10]);
    }
}
