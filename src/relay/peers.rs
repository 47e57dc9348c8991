//! Exclusive device/viewer slots

use tracing::info;

use crate::transport::{PeerChannel, PeerId, PeerRole};

/// One slot per role; adopting a peer preempts whoever held the role
#[derive(Debug, Default)]
pub struct PeerTable {
    device: Option<PeerChannel>,
    viewer: Option<PeerChannel>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&mut self, role: PeerRole) -> &mut Option<PeerChannel> {
        match role {
            PeerRole::Device => &mut self.device,
            PeerRole::Viewer => &mut self.viewer,
        }
    }

    /// Make `channel` the current peer for its role
    ///
    /// The previous holder is closed before the new peer is installed and is
    /// returned so the caller can run its disconnect handling.
    pub fn adopt(&mut self, channel: PeerChannel) -> Option<PeerChannel> {
        let role = channel.role();
        let slot = self.slot(role);
        let prior = slot.take();
        if let Some(ref prior) = prior {
            info!(
                "Replacing {} #{} with #{}",
                role,
                prior.id(),
                channel.id()
            );
            prior.close();
        }
        *slot = Some(channel);
        prior
    }

    /// Remove the peer for `role` if it is still `peer_id`
    ///
    /// Returns `None` for stale ids (a preempted peer reporting its own
    /// disconnect after being replaced).
    pub fn release(&mut self, role: PeerRole, peer_id: PeerId) -> Option<PeerChannel> {
        let slot = self.slot(role);
        match slot {
            Some(current) if current.id() == peer_id => slot.take(),
            _ => None,
        }
    }

    /// Current open peer for `role`
    pub fn get(&self, role: PeerRole) -> Option<&PeerChannel> {
        let slot = match role {
            PeerRole::Device => &self.device,
            PeerRole::Viewer => &self.viewer,
        };
        slot.as_ref().filter(|c| !c.is_closed())
    }

    pub fn is_current(&self, role: PeerRole, peer_id: PeerId) -> bool {
        self.get(role).is_some_and(|c| c.id() == peer_id)
    }

    pub fn is_connected(&self, role: PeerRole) -> bool {
        self.get(role).is_some()
    }

    /// Close and drop both peers
    pub fn close_all(&mut self) {
        for channel in [self.device.take(), self.viewer.take()].into_iter().flatten() {
            channel.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(role: PeerRole) -> PeerChannel {
        PeerChannel::open(role, 1024).0
    }

    #[test]
    fn test_adopt_closes_prior_holder() {
        let mut table = PeerTable::new();
        let first = channel(PeerRole::Device);
        let second = channel(PeerRole::Device);

        assert!(table.adopt(first.clone()).is_none());
        assert!(table.is_current(PeerRole::Device, first.id()));

        let prior = table.adopt(second.clone()).unwrap();
        assert_eq!(prior.id(), first.id());
        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert!(table.is_current(PeerRole::Device, second.id()));
    }

    #[test]
    fn test_roles_are_independent() {
        let mut table = PeerTable::new();
        let device = channel(PeerRole::Device);
        let viewer = channel(PeerRole::Viewer);

        table.adopt(device.clone());
        table.adopt(viewer.clone());

        assert!(table.is_connected(PeerRole::Device));
        assert!(table.is_connected(PeerRole::Viewer));
        assert!(!device.is_closed());
        assert!(!viewer.is_closed());
    }

    #[test]
    fn test_release_ignores_stale_ids() {
        let mut table = PeerTable::new();
        let first = channel(PeerRole::Viewer);
        let second = channel(PeerRole::Viewer);
        table.adopt(first.clone());
        table.adopt(second.clone());

        assert!(table.release(PeerRole::Viewer, first.id()).is_none());
        assert!(table.is_current(PeerRole::Viewer, second.id()));

        assert!(table.release(PeerRole::Viewer, second.id()).is_some());
        assert!(!table.is_connected(PeerRole::Viewer));
    }

    #[test]
    fn test_at_most_one_current_per_role_over_any_sequence() {
        let mut table = PeerTable::new();
        let mut all = Vec::new();

        for i in 0..20 {
            let role = if i % 3 == 0 {
                PeerRole::Viewer
            } else {
                PeerRole::Device
            };
            let c = channel(role);
            table.adopt(c.clone());
            all.push(c);
            if i % 5 == 4 {
                let victim = &all[i / 2];
                table.release(victim.role(), victim.id());
            }

            for role in [PeerRole::Device, PeerRole::Viewer] {
                let open_current = all
                    .iter()
                    .filter(|c| c.role() == role && !c.is_closed())
                    .filter(|c| table.is_current(role, c.id()))
                    .count();
                assert!(open_current <= 1);
                let open = all.iter().filter(|c| c.role() == role && !c.is_closed()).count();
                assert!(open <= 1, "more than one open {} channel", role);
            }
        }
    }

    #[test]
    fn test_closed_peer_is_not_reachable() {
        let mut table = PeerTable::new();
        let device = channel(PeerRole::Device);
        table.adopt(device.clone());
        device.close();
        assert!(table.get(PeerRole::Device).is_none());
    }
}
