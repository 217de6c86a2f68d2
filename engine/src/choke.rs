use std::time::{Duration, Instant};
use rand::seq::SliceRandom;
use crate::{p2p::Message, peer::{PeerConnection, PeerKey}, swarm::Swarm};

// Interval between full unchoke rounds.
const ROUND_INTERVAL: Duration = Duration::from_secs(60);

// Allocates upload slots.
// Full rounds give all but one slot to the best rated interested peers and the last one to a
// random choked peer, partial rounds between them only fill or free slots.
#[derive(Debug)]
pub struct ChokeManager {

    upload_slots: usize,

    last_round: Option<Instant>,

    // Peer holding the optimistic slot since the last full round.
    optimistic: Option<PeerKey>,

}

impl ChokeManager {

    pub fn new(upload_slots: usize) -> Self {
        Self {
            upload_slots: upload_slots.max(1),
            last_round: None,
            optimistic: None,
        }
    }

    #[cfg(test)]
    pub fn optimistic(&self) -> Option<PeerKey> {
        self.optimistic
    }

    // Returns the peers that were choked.
    pub fn tick(&mut self, swarm: &mut Swarm, now: Instant) -> Vec<PeerKey> {
        let due = self.last_round.map_or(true, |at| now.saturating_duration_since(at) >= ROUND_INTERVAL);
        if due {
            self.full_round(swarm, now)
        } else {
            Vec::new()
        }
    }

    pub fn full_round(&mut self, swarm: &mut Swarm, now: Instant) -> Vec<PeerKey> {
        self.last_round = Some(now);

        let mut interested = swarm.peers
            .iter()
            .filter(|(_, p)| p.peer_interested)
            .map(|(k, p)| (k, p.rating))
            .collect::<Vec<_>>();
        interested.sort_by(|(_, a), (_, b)| b.cmp_quality(a));

        let regular = self.upload_slots - 1;
        let mut unchoke = interested.iter().take(regular).map(|(k, _)| *k).collect::<Vec<_>>();

        // Prefer a peer we are currently choking so newcomers get a chance.
        let rest = interested.iter().skip(regular).map(|(k, _)| *k).collect::<Vec<_>>();
        let choked_rest = rest.iter().copied().filter(|&k| swarm.peers[k].am_choking).collect::<Vec<_>>();
        let mut rng = rand::thread_rng();
        self.optimistic = choked_rest
            .choose(&mut rng)
            .or_else(|| rest.choose(&mut rng))
            .copied();
        unchoke.extend(self.optimistic);

        tracing::debug!("unchoke round: {} interested, {} unchoked", interested.len(), unchoke.len());
        let mut choked = Vec::new();
        for (key, peer) in swarm.peers.iter_mut() {
            if unchoke.contains(&key) {
                set_choking(peer, false);
            } else if set_choking(peer, true) {
                choked.push(key);
            }
        }
        choked
    }

    // Run when a peer's interest changes or an unchoked peer leaves.
    pub fn partial_round(&mut self, swarm: &mut Swarm) -> Vec<PeerKey> {
        let mut choked = Vec::new();
        for (key, peer) in swarm.peers.iter_mut() {
            if !peer.peer_interested && set_choking(peer, true) {
                choked.push(key);
            }
        }
        if self.optimistic.map_or(false, |k| !swarm.peers.contains_key(k)) {
            self.optimistic = None;
        }

        let unchoked = swarm.peers.values().filter(|p| !p.am_choking).count();
        let free = self.upload_slots.saturating_sub(unchoked);
        if free == 0 {
            return choked;
        }

        let mut waiting = swarm.peers
            .iter()
            .filter(|(_, p)| p.peer_interested && p.am_choking)
            .map(|(k, p)| (k, p.rating))
            .collect::<Vec<_>>();
        waiting.sort_by(|(_, a), (_, b)| b.cmp_quality(a));
        for (key, _) in waiting.into_iter().take(free) {
            set_choking(&mut swarm.peers[key], false);
        }
        choked
    }
}

// Returns true if the state changed.
fn set_choking(peer: &mut PeerConnection, choking: bool) -> bool {
    if peer.am_choking == choking {
        return false;
    }
    peer.am_choking = choking;
    peer.send(if choking { Message::Choke } else { Message::Unchoke });
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;
    use crate::{peer::Rating, swarm::testing};

    fn interested_peers(swarm: &mut Swarm, keys: &mut SlotMap<PeerKey, ()>, n: usize) -> Vec<PeerKey> {
        (0..n)
            .map(|i| {
                let key = testing::add_peer(swarm, keys, &[]);
                let peer = &mut swarm.peers[key];
                peer.peer_interested = true;
                peer.rating = Rating { requested: 10, delivered: i as u64, takebacks: 0 };
                key
            })
            .collect()
    }

    #[test]
    fn test_full_round() {
        let (mut swarm, _disk_rx) = testing::swarm(100, 400);
        let mut keys = SlotMap::with_key();
        let peers = interested_peers(&mut swarm, &mut keys, 6);
        let idle = testing::add_peer(&mut swarm, &mut keys, &[]);
        let mut choke = ChokeManager::new(4);

        let choked = choke.full_round(&mut swarm, Instant::now());
        assert!(choked.is_empty());

        // The three best rated peers plus one optimistic pick.
        for key in &peers[3..] {
            assert!(!swarm.peers[*key].am_choking);
        }
        let optimistic = choke.optimistic().unwrap();
        assert!(peers[..3].contains(&optimistic));
        assert!(!swarm.peers[optimistic].am_choking);
        assert_eq!(swarm.peers.values().filter(|p| !p.am_choking).count(), 4);
        assert!(swarm.peers[idle].am_choking);
    }

    #[test]
    fn test_round_choking_previous_peers() {
        let (mut swarm, _disk_rx) = testing::swarm(100, 400);
        let mut keys = SlotMap::with_key();
        let peers = interested_peers(&mut swarm, &mut keys, 2);
        let mut choke = ChokeManager::new(2);
        let now = Instant::now();
        choke.full_round(&mut swarm, now);
        assert!(peers.iter().all(|k| !swarm.peers[*k].am_choking));

        // Neither round is due yet.
        assert!(choke.tick(&mut swarm, now + Duration::from_secs(1)).is_empty());

        swarm.peers[peers[0]].peer_interested = false;
        swarm.peers[peers[0]].take_outbox();
        let choked = choke.partial_round(&mut swarm);
        assert_eq!(choked, vec![peers[0]]);
        assert_eq!(swarm.peers[peers[0]].take_outbox(), vec![crate::p2p::PeerCommand::Send(Message::Choke)]);
    }

    #[test]
    fn test_partial_round_fills_free_slots_by_rating() {
        let (mut swarm, _disk_rx) = testing::swarm(100, 400);
        let mut keys = SlotMap::with_key();
        let peers = interested_peers(&mut swarm, &mut keys, 3);
        let mut choke = ChokeManager::new(2);

        choke.partial_round(&mut swarm);
        assert!(swarm.peers[peers[0]].am_choking);
        assert!(!swarm.peers[peers[1]].am_choking);
        assert!(!swarm.peers[peers[2]].am_choking);
    }
}
