use std::{collections::VecDeque, net::SocketAddr, sync::Arc, time::{Duration, Instant}};
use tokio::{net::TcpStream, time};
use tokio_util::codec::{Framed, FramedParts};
use futures::{SinkExt, StreamExt, stream::SplitSink};
use crate::{
    bandwidth::REFILL_WAIT,
    block::BlockInfo,
    peer::PeerKey,
    torrent::{CommandToTorrent, TorrentContext},
};
use super::{*, message::*, handshake::*};

type MessageSink = SplitSink<Framed<TcpStream, MessageCodec>, Message>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

// Send a keep alive if nothing else was sent for this long.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(120);

// Drop the peer if nothing was received for this long.
const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(240);

// Drives a single peer socket.
// Only framing, the handshake, keep alives and bandwidth live here, every decision about
// the peer is made by the torrent, which receives each decoded message as a command.
#[derive(Debug)]
pub struct Connection {

    // Handle of this peer in the torrent's arena.
    key: PeerKey,

    // The peer's IP address.
    address: SocketAddr,

    // Context is a read only state accessible by all peers.
    ctx: Arc<TorrentContext>,

    // Commands to the peer.
    peer_rx: PeerRx,

    // Messages waiting to be written to the socket.
    queue: VecDeque<Message>,

    // Received block waiting for download bandwidth, reading pauses until it is forwarded.
    held: Option<Message>,

    // Tokens granted so far towards the held block and the block at the front of the queue.
    // Upload tokens carry over to the next block if the front one is dropped.
    down_granted: u64,

    up_granted: u64,

    last_recv: Instant,

    last_sent: Instant,

}

impl Connection {

    pub fn new(key: PeerKey, address: SocketAddr, ctx: Arc<TorrentContext>, peer_rx: PeerRx) -> Self {
        let now = Instant::now();
        Self {
            key,
            address,
            ctx,
            peer_rx,
            queue: VecDeque::new(),
            held: None,
            down_granted: 0,
            up_granted: 0,
            last_recv: now,
            last_sent: now,
        }
    }

    // Runs the connection to completion, the torrent is always told when it ends.
    #[tracing::instrument(name = "peer", skip_all, fields(address = %self.address))]
    pub async fn start(mut self, inbound_stream: Option<TcpStream>) {
        let error = self.run(inbound_stream).await.err();
        match &error {
            Some(e) => tracing::warn!("session ended: {}", e),
            None => tracing::debug!("session ended"),
        }
        self.ctx.torrent_tx
            .send(CommandToTorrent::PeerDisconnected { key: self.key, error })
            .ok();
    }

    async fn run(&mut self, inbound_stream: Option<TcpStream>) -> Result<()> {

        let inbound = inbound_stream.is_some();
        let stream = if let Some(stream) = inbound_stream {
            stream
        } else {
            let stream = time::timeout(CONNECT_TIMEOUT, TcpStream::connect(self.address))
                .await
                .map_err(|_| PeerError::Timeout)??;
            tracing::trace!("outbound connection successful");
            stream
        };

        let mut socket = Framed::new(stream, HandshakeCodec);
        let id = time::timeout(HANDSHAKE_TIMEOUT, self.exchange_handshake(&mut socket, inbound))
            .await
            .map_err(|_| PeerError::Timeout)??;

        self.ctx.torrent_tx.send(CommandToTorrent::PeerConnected { key: self.key, id })?;
        self.exchange_messages(into_message_framed(socket)).await
    }

    // Returns the peer's id.
    async fn exchange_handshake(&self, socket: &mut Framed<TcpStream, HandshakeCodec>, inbound: bool) -> Result<[u8; 20]> {

        let handshake = Handshake::new(self.ctx.info_hash, self.ctx.client_id);
        if !inbound {
            tracing::trace!("send handshake");
            socket.send(handshake.clone()).await?;
        }

        let peer_handshake = match socket.next().await {
            Some(res) => res?,
            None => return Err(PeerError::NoHandshake),
        };
        tracing::trace!("read: {:?}", peer_handshake);

        if peer_handshake.protocol != PROTOCOL {
            return Err(PeerError::IncorrectProtocol);
        }
        if peer_handshake.info_hash != self.ctx.info_hash {
            return Err(PeerError::IncorrectInfoHash);
        }
        if peer_handshake.peer_id == self.ctx.client_id {
            return Err(PeerError::SelfConnection);
        }

        // Inbound peers get our handshake once theirs checks out.
        if inbound {
            tracing::trace!("send handshake");
            socket.send(handshake).await?;
        }

        tracing::info!("handshake successful, peer connected");
        Ok(peer_handshake.peer_id)
    }

    async fn exchange_messages(&mut self, socket: Framed<TcpStream, MessageCodec>) -> Result<()> {

        let (mut sink, mut stream) = socket.split();
        let mut ticker = time::interval(Duration::from_secs(1));

        loop {
            self.take_bandwidth();
            self.forward_held()?;
            let throttled = self.held.is_some() || self.up_shortfall() > 0;

            tokio::select! {

                // Message from peer.
                msg = stream.next(), if self.held.is_none() => match msg {
                    Some(msg) => self.handle_msg(msg?)?,
                    None => {
                        tracing::info!("connection closed by peer");
                        return Ok(());
                    },
                },

                // Command from the torrent.
                cmd = self.peer_rx.recv() => match cmd {
                    Some(PeerCommand::Send(msg)) => self.enqueue(msg),
                    Some(PeerCommand::Discard(block)) => self.discard(block),
                    Some(PeerCommand::Shutdown) | None => {
                        tracing::debug!("session shutdown");
                        return Ok(());
                    },
                },

                _ = std::future::ready(()), if !self.queue.is_empty() && self.up_shortfall() == 0 => {
                    self.send_next(&mut sink).await?
                },

                // Out of tokens, ask the allocators again shortly.
                _ = time::sleep(REFILL_WAIT), if throttled => {},

                now = ticker.tick() => self.tick(now.into_std())?,

            }
        }
    }

    fn handle_msg(&mut self, msg: Message) -> Result<()> {
        self.last_recv = Instant::now();
        tracing::trace!("read: {}", msg);

        match msg {
            Message::KeepAlive => Ok(()),
            Message::Piece(_) => {
                self.held = Some(msg);
                self.down_granted = 0;
                Ok(())
            },
            _ => self.forward(msg),
        }
    }

    fn forward(&self, msg: Message) -> Result<()> {
        self.ctx.torrent_tx.send(CommandToTorrent::PeerMessage { key: self.key, msg })?;
        Ok(())
    }

    fn forward_held(&mut self) -> Result<()> {
        if self.down_shortfall() == 0 {
            if let Some(msg) = self.held.take() {
                self.down_granted = 0;
                self.forward(msg)?;
            }
        }
        Ok(())
    }

    fn down_shortfall(&self) -> u64 {
        match &self.held {
            Some(Message::Piece(block)) => (block.data.len() as u64).saturating_sub(self.down_granted),
            _ => 0,
        }
    }

    fn up_shortfall(&self) -> u64 {
        match self.queue.front() {
            Some(Message::Piece(block)) => (block.data.len() as u64).saturating_sub(self.up_granted),
            _ => 0,
        }
    }

    // Takes whatever tokens the allocators can spare right now, never waits.
    fn take_bandwidth(&mut self) {
        let down = self.down_shortfall();
        if down > 0 {
            self.down_granted += self.ctx.bandwidth.down.request(down);
        }
        let up = self.up_shortfall();
        if up > 0 {
            self.up_granted += self.ctx.bandwidth.up.request(up);
        }
    }

    fn enqueue(&mut self, msg: Message) {
        // Nothing queued for upload survives choking the peer.
        if msg == Message::Choke {
            self.queue.retain(|m| !matches!(m, Message::Piece(_)));
        }
        self.queue.push_back(msg);
    }

    fn discard(&mut self, block: BlockInfo) {
        self.queue.retain(|m| !matches!(m, Message::Piece(data) if data.info() == block));
    }

    async fn send_next(&mut self, sink: &mut MessageSink) -> Result<()> {
        if let Some(msg) = self.queue.pop_front() {
            if let Message::Piece(block) = &msg {
                self.up_granted = self.up_granted.saturating_sub(block.data.len() as u64);
            }
            tracing::trace!("send: {}", msg);
            sink.send(msg).await?;
            self.last_sent = Instant::now();
        }
        Ok(())
    }

    fn tick(&mut self, now: Instant) -> Result<()> {
        if now.saturating_duration_since(self.last_recv) >= INACTIVITY_TIMEOUT {
            tracing::warn!("disconnecting peer due to inactivity");
            return Err(PeerError::Timeout);
        }
        if self.queue.is_empty() && now.saturating_duration_since(self.last_sent) >= KEEP_ALIVE_INTERVAL {
            self.queue.push_back(Message::KeepAlive);
        }
        Ok(())
    }
}

// Swaps the handshake codec for the message codec.
// Bytes the peer sent straight after its handshake are already in the read buffer and must be kept.
pub(crate) fn into_message_framed(socket: Framed<TcpStream, HandshakeCodec>) -> Framed<TcpStream, MessageCodec> {
    let old = socket.into_parts();
    let mut parts = FramedParts::new::<Message>(old.io, MessageCodec);
    parts.read_buf = old.read_buf;
    parts.write_buf = old.write_buf;
    Framed::from_parts(parts)
}
