//! Channel membership index — which live discovery connections joined which channels

use crate::channel::Channel;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;

/// Multimap from connection handle to its joined channels, with a reverse
/// index from channel to every member.
///
/// A handle absent from the index has joined nothing. Both directions are
/// kept in sync: empty sets are pruned on either side.
#[derive(Debug, Clone)]
pub struct ChannelIndex<H> {
    by_handle: HashMap<H, HashSet<Channel>>,
    by_channel: HashMap<Channel, HashSet<H>>,
}

impl<H> ChannelIndex<H>
where
    H: Copy + Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            by_handle: HashMap::new(),
            by_channel: HashMap::new(),
        }
    }

    /// Merge `channels` into the handle's set; true if any was newly added
    pub fn join(&mut self, handle: H, channels: &[Channel]) -> bool {
        let mut changed = false;
        for channel in channels {
            let added = self
                .by_handle
                .entry(handle)
                .or_default()
                .insert(channel.clone());
            if added {
                self.by_channel
                    .entry(channel.clone())
                    .or_default()
                    .insert(handle);
                changed = true;
            }
        }
        changed
    }

    /// Remove `channels` from the handle's set; absent ones are ignored
    pub fn leave(&mut self, handle: H, channels: &[Channel]) {
        let Some(joined) = self.by_handle.get_mut(&handle) else {
            return;
        };
        for channel in channels {
            if joined.remove(channel) {
                Self::unlink(&mut self.by_channel, channel, &handle);
            }
        }
        if joined.is_empty() {
            self.by_handle.remove(&handle);
        }
    }

    /// Drop the handle's whole entry and return what it had joined
    pub fn remove(&mut self, handle: H) -> HashSet<Channel> {
        let joined = self.by_handle.remove(&handle).unwrap_or_default();
        for channel in &joined {
            Self::unlink(&mut self.by_channel, channel, &handle);
        }
        joined
    }

    /// Every handle currently joined to `channel`
    pub fn members_of(&self, channel: &Channel) -> HashSet<H> {
        self.by_channel.get(channel).cloned().unwrap_or_default()
    }

    /// Union of the members of every channel in `channels`, minus `excluding`
    pub fn sharing_any(&self, channels: &[Channel], excluding: H) -> HashSet<H> {
        let mut found = HashSet::new();
        for channel in channels {
            if let Some(members) = self.by_channel.get(channel) {
                found.extend(members.iter().copied().filter(|h| *h != excluding));
            }
        }
        found
    }

    pub fn channels_of(&self, handle: H) -> HashSet<Channel> {
        self.by_handle.get(&handle).cloned().unwrap_or_default()
    }

    pub fn contains(&self, handle: H, channel: &Channel) -> bool {
        self.by_handle
            .get(&handle)
            .map_or(false, |joined| joined.contains(channel))
    }

    /// Number of handles with at least one channel
    pub fn len(&self) -> usize {
        self.by_handle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_handle.is_empty()
    }

    fn unlink(by_channel: &mut HashMap<Channel, HashSet<H>>, channel: &Channel, handle: &H) {
        if let Some(members) = by_channel.get_mut(channel) {
            members.remove(handle);
            if members.is_empty() {
                by_channel.remove(channel);
            }
        }
    }
}

impl<H> Default for ChannelIndex<H>
where
    H: Copy + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}
