use std::collections::HashSet;

/// One channel entry of a whisper/shout target slot.
#[derive(Debug, Clone)]
pub struct ChannelTarget {
    pub channel_id: u32,
    /// Restrict delivery to members of this group, evaluated at the target
    /// channel.
    pub group: Option<String>,
    /// Include channels linked to the target.
    pub links: bool,
    /// Include the target's subtree.
    pub children: bool,
}

/// A session's voice target slot (slots 1..=30 of the header target field).
#[derive(Default, Debug, Clone)]
pub struct VoiceTarget {
    pub sessions: HashSet<u32>,
    pub channels: Vec<ChannelTarget>,
}
