//! Per-session channel membership and primary arbitration.
//!
//! At most one attached channel is *primary*: the only one whose input is
//! forwarded to the child. Everyone else is a read-only observer.

use crate::channel::ChannelId;

/// Attached channels of one session, in attach order.
///
/// Invariant: `primary`, when set, is always a member.
#[derive(Debug, Default, Clone)]
pub struct ChannelMembership {
    members: Vec<ChannelId>,
    primary: Option<ChannelId>,
}

/// What changed when a channel detached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    /// The channel was primary and has been replaced by this one (or by
    /// nobody, if `None` and `was_primary`).
    pub was_primary: bool,
    pub new_primary: Option<ChannelId>,
    /// No members remain.
    pub now_empty: bool,
}

impl ChannelMembership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a channel. The first channel of a session without a primary
    /// becomes primary. Returns `false` if the channel was already attached.
    pub fn attach(&mut self, channel: ChannelId) -> bool {
        if self.members.contains(&channel) {
            return false;
        }
        if self.primary.is_none() {
            self.primary = Some(channel.clone());
        }
        self.members.push(channel);
        true
    }

    /// Remove a channel, re-electing a primary if needed.
    ///
    /// Returns `None` if the channel was not attached.
    pub fn detach(&mut self, channel: &ChannelId) -> Option<Departure> {
        let pos = self.members.iter().position(|c| c == channel)?;
        self.members.remove(pos);

        let was_primary = self.primary.as_ref() == Some(channel);
        if was_primary {
            // Earliest-attached survivor takes over.
            self.primary = self.members.first().cloned();
        }
        Some(Departure {
            was_primary,
            new_primary: if was_primary { self.primary.clone() } else { None },
            now_empty: self.members.is_empty(),
        })
    }

    /// Hand typing rights to `channel`. Fails if it is not attached.
    pub fn focus(&mut self, channel: &ChannelId) -> bool {
        if !self.members.contains(channel) {
            return false;
        }
        self.primary = Some(channel.clone());
        true
    }

    pub fn is_primary(&self, channel: &ChannelId) -> bool {
        self.primary.as_ref() == Some(channel)
    }

    pub fn contains(&self, channel: &ChannelId) -> bool {
        self.members.contains(channel)
    }

    pub fn primary(&self) -> Option<&ChannelId> {
        self.primary.as_ref()
    }

    pub fn members(&self) -> &[ChannelId] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Drop every member, returning them in attach order.
    pub fn clear(&mut self) -> Vec<ChannelId> {
        self.primary = None;
        std::mem::take(&mut self.members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ChannelId {
        ChannelId::from(s)
    }

    #[test]
    fn test_new_is_empty() {
        let m = ChannelMembership::new();
        assert!(m.is_empty());
        assert!(m.primary().is_none());
    }

    #[test]
    fn test_first_attach_becomes_primary() {
        let mut m = ChannelMembership::new();
        assert!(m.attach(id("c1")));
        assert!(m.attach(id("c2")));
        assert!(m.is_primary(&id("c1")));
        assert!(!m.is_primary(&id("c2")));
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn test_duplicate_attach_is_rejected() {
        let mut m = ChannelMembership::new();
        assert!(m.attach(id("c1")));
        assert!(!m.attach(id("c1")));
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn test_detach_primary_elects_survivor() {
        let mut m = ChannelMembership::new();
        m.attach(id("c1"));
        m.attach(id("c2"));
        m.attach(id("c3"));

        let dep = m.detach(&id("c1")).expect("c1 was attached");
        assert!(dep.was_primary);
        assert_eq!(dep.new_primary, Some(id("c2")));
        assert!(!dep.now_empty);
        assert!(m.is_primary(&id("c2")));
    }

    #[test]
    fn test_detach_observer_keeps_primary() {
        let mut m = ChannelMembership::new();
        m.attach(id("c1"));
        m.attach(id("c2"));

        let dep = m.detach(&id("c2")).unwrap();
        assert!(!dep.was_primary);
        assert!(dep.new_primary.is_none());
        assert!(m.is_primary(&id("c1")));
    }

    #[test]
    fn test_detach_last_clears_primary() {
        let mut m = ChannelMembership::new();
        m.attach(id("c1"));
        let dep = m.detach(&id("c1")).unwrap();
        assert!(dep.was_primary);
        assert!(dep.now_empty);
        assert!(m.primary().is_none());
    }

    #[test]
    fn test_detach_unknown_returns_none() {
        let mut m = ChannelMembership::new();
        m.attach(id("c1"));
        assert!(m.detach(&id("ghost")).is_none());
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn test_focus_reassigns_primary() {
        let mut m = ChannelMembership::new();
        m.attach(id("c1"));
        m.attach(id("c2"));
        assert!(m.focus(&id("c2")));
        assert!(m.is_primary(&id("c2")));
        assert!(!m.is_primary(&id("c1")));
    }

    #[test]
    fn test_focus_requires_membership() {
        let mut m = ChannelMembership::new();
        m.attach(id("c1"));
        assert!(!m.focus(&id("stranger")));
        assert!(m.is_primary(&id("c1")));
    }

    #[test]
    fn test_primary_is_always_a_member() {
        let mut m = ChannelMembership::new();
        let ops: &[(&str, bool)] = &[
            ("a", true), ("b", true), ("a", false), ("c", true),
            ("b", false), ("d", true), ("c", false), ("d", false),
        ];
        for (name, attach) in ops {
            if *attach {
                m.attach(id(name));
            } else {
                m.detach(&id(name));
            }
            if let Some(p) = m.primary() {
                assert!(m.contains(p), "primary {p} not a member");
            } else {
                assert!(m.is_empty());
            }
        }
    }

    #[test]
    fn test_clear_returns_members_in_order() {
        let mut m = ChannelMembership::new();
        m.attach(id("c1"));
        m.attach(id("c2"));
        assert_eq!(m.clear(), vec![id("c1"), id("c2")]);
        assert!(m.is_empty());
        assert!(m.primary().is_none());
    }
}
