use crate::{p2p::Message, peer::{PeerConnection, PeerKey}, swarm::Swarm};

#[derive(Debug, Default, Clone, Copy)]
pub struct InterestSlot {

    // Pieces the peer has that we still schedule.
    pub pieces_wanted: usize,

}

// Keeps our interested / not interested state with each peer in line with what it can offer us.
// Counters are updated incrementally, a full recount only happens on a bitfield or a mask change.
#[derive(Debug, Default)]
pub struct InterestTracker;

impl InterestTracker {

    pub fn on_bitfield(&self, swarm: &mut Swarm, key: PeerKey) {
        let scheduled = &swarm.state.scheduled;
        if let Some(peer) = swarm.peers.get_mut(key) {
            peer.interest.pieces_wanted = peer.bitfield.iter_ones().filter(|&idx| scheduled.get(idx)).count();
            update(peer);
        }
    }

    // Peer gained piece `idx`.
    pub fn on_have(&self, swarm: &mut Swarm, key: PeerKey, idx: usize) {
        if !swarm.state.scheduled.get(idx) {
            return;
        }
        if let Some(peer) = swarm.peers.get_mut(key) {
            peer.interest.pieces_wanted += 1;
            update(peer);
        }
    }

    // A scheduled piece became available, every peer holding it has one piece less to offer.
    pub fn on_piece_verified(&self, swarm: &mut Swarm, idx: usize) {
        for peer in swarm.peers.values_mut().filter(|p| p.bitfield.get(idx)) {
            peer.interest.pieces_wanted = peer.interest.pieces_wanted.saturating_sub(1);
            update(peer);
        }
    }

    pub fn recount_all(&self, swarm: &mut Swarm) {
        let keys = swarm.peers.keys().collect::<Vec<_>>();
        for key in keys {
            self.on_bitfield(swarm, key);
        }
    }
}

fn update(peer: &mut PeerConnection) {
    let interested = peer.interest.pieces_wanted > 0;
    if interested == peer.am_interested {
        return;
    }
    peer.am_interested = interested;
    peer.send(if interested { Message::Interested } else { Message::NotInterested });
}
