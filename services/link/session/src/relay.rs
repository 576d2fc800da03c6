//! Relay: accepts peers, assigns their IDs and forwards messages between them.
//!
//! Peers never talk to each other directly. Every message goes through the
//! relay, which rewrites its source to the sender's assigned ID and forwards it
//! by envelope destination. Destination `0` addresses the relay itself.

use crate::config::RelayConfig;
use crate::endpoint::ProtocolEndpoint;
use crate::error::Result;
use crate::manager::{ASSIGN_PATH, PING_PATH};
use crate::socket::Socket;
use crate::transport::TransportEndpoint;
use link_wire::{status, Message, PeerId, Request, Response, PEER_ID, SOURCE_ID};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use tracing::{debug, info, trace, warn};

/// Relay counters
#[derive(Clone, Debug, Default)]
pub struct RelayStats {
    /// Peers accepted since start
    pub connections_accepted: u64,
    /// Peers dropped after an I/O error or disconnect
    pub disconnects: u64,
    /// Messages forwarded between peers
    pub messages_forwarded: u64,
    /// Requests answered with 404 for an unknown destination
    pub unroutable: u64,
}

/// Message hub for connected peers
pub struct Relay {
    config: RelayConfig,
    listener: Socket,
    clients: BTreeMap<PeerId, ProtocolEndpoint>,
    next_id: u16,
    stats: RelayStats,
}

impl Relay {
    /// Bind and listen on the configured port
    pub fn bind(config: RelayConfig) -> Result<Self> {
        let mut listener = Socket::create(config.listen_port)?;
        listener.listen(config.backlog)?;
        info!("Relay listening on {}", listener.local_addr()?);

        Ok(Self {
            config,
            listener,
            clients: BTreeMap::new(),
            next_id: 1,
            stats: RelayStats::default(),
        })
    }

    /// Listening address
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Connected peers
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// IDs of connected peers
    pub fn clients(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.clients.keys().copied()
    }

    /// Relay counters
    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    /// Accept new peers, forward everything received and flush output
    pub fn update(&mut self) {
        self.accept_clients();

        let mut dead = Vec::new();
        let mut inbound = Vec::new();
        for (id, client) in self.clients.iter_mut() {
            match client.receive_messages() {
                Ok(messages) => inbound.extend(messages.into_iter().map(|m| (*id, m))),
                Err(e) => {
                    debug!("Peer {} receive failed: {}", id, e);
                    dead.push(*id);
                }
            }
        }

        for (from, message) in inbound {
            self.route(from, message);
        }

        for (id, client) in self.clients.iter_mut() {
            if let Err(e) = client.flush() {
                debug!("Peer {} send failed: {}", id, e);
                dead.push(*id);
            }
        }

        for id in dead {
            if self.clients.remove(&id).is_some() {
                info!("Peer {} disconnected", id);
                self.stats.disconnects += 1;
            }
        }
    }

    fn accept_clients(&mut self) {
        loop {
            match self.listener.accept() {
                Ok(Some(socket)) => {
                    let Some(id) = self.allocate_id() else {
                        warn!("No free peer IDs, refusing connection");
                        continue;
                    };
                    let peer_addr = socket.peer_addr().ok();
                    let transport = TransportEndpoint::new(socket, self.config.staging_buffer_size);
                    let endpoint =
                        ProtocolEndpoint::new(Box::new(transport), self.config.max_content_length);
                    info!("Accepted peer {} from {:?}", id, peer_addr);
                    self.clients.insert(id, endpoint);
                    self.stats.connections_accepted += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    break;
                }
            }
        }
    }

    fn allocate_id(&mut self) -> Option<PeerId> {
        for _ in 0..u16::MAX {
            let id = PeerId(self.next_id);
            self.next_id = self.next_id.wrapping_add(1).max(1);
            if !self.clients.contains_key(&id) {
                return Some(id);
            }
        }
        None
    }

    fn route(&mut self, from: PeerId, mut message: Message) {
        let destination = message.envelope().destination;
        if destination == PeerId::UNASSIGNED {
            match message {
                Message::Request(request) => self.handle_relay_request(from, request),
                Message::Response(response) => debug!(
                    "Dropping response {} from {} addressed to the relay",
                    response.envelope.message_id, from
                ),
            }
            return;
        }

        restamp_source(&mut message, from);
        if let Some(client) = self.clients.get_mut(&destination) {
            trace!(
                "Forwarding message {} from {} to {}",
                message.envelope().message_id,
                from,
                destination
            );
            match client.send_message(&message) {
                Ok(()) => self.stats.messages_forwarded += 1,
                Err(e) => warn!("Could not forward message from {} to {}: {}", from, destination, e),
            }
            return;
        }

        match message {
            Message::Request(request) => {
                warn!(
                    "Peer {} sent {} to unknown peer {}",
                    from, request.target, destination
                );
                self.stats.unroutable += 1;
                let reply = Response::reply_to(
                    &request,
                    status::NOT_FOUND,
                    format!("unknown peer {}", destination),
                );
                self.send_to(from, reply.into(), destination);
            }
            Message::Response(response) => debug!(
                "Dropping response {} from {} to unknown peer {}",
                response.envelope.message_id, from, destination
            ),
        }
    }

    fn handle_relay_request(&mut self, from: PeerId, request: Request) {
        let reply = match request.target.as_str() {
            ASSIGN_PATH => {
                debug!("Peer {} requested its ID", from);
                let mut reply = Response::reply_to(&request, status::OK, "")
                    .with_header(PEER_ID, from.to_string());
                reply.envelope.destination = from;
                reply
            }
            PING_PATH => Response::reply_to(&request, status::OK, "pong"),
            target => {
                debug!("Peer {} requested unknown relay path {}", from, target);
                Response::reply_to(&request, status::NOT_FOUND, format!("no relay path {}", target))
            }
        };
        self.send_to(from, reply.into(), PeerId::UNASSIGNED);
    }

    /// Finalize `message` with `source` and queue it to peer `to`
    fn send_to(&mut self, to: PeerId, mut message: Message, source: PeerId) {
        if let Err(e) = message.finalize(source, None) {
            warn!("Could not finalize reply to {}: {}", to, e);
            return;
        }
        if let Some(client) = self.clients.get_mut(&to) {
            if let Err(e) = client.send_message(&message) {
                warn!("Could not queue reply to {}: {}", to, e);
            }
        }
    }
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("listener", &self.listener)
            .field("clients", &self.clients.keys().collect::<Vec<_>>())
            .field("stats", &self.stats)
            .finish()
    }
}

fn restamp_source(message: &mut Message, source: PeerId) {
    message.envelope_mut().source = source;
    let headers = match message {
        Message::Request(request) => &mut request.headers,
        Message::Response(response) => &mut response.headers,
    };
    headers.set(SOURCE_ID, source.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::manager::{ConnectionState, SessionManager};
    use crate::pending::PendingResponse;
    use bytes::Bytes;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    const STEP: Duration = Duration::from_millis(2);

    fn test_relay() -> (Relay, SocketAddr) {
        let relay = Relay::bind(RelayConfig {
            listen_port: 0,
            ..RelayConfig::default()
        })
        .unwrap();
        let port = relay.local_addr().unwrap().port();
        (relay, SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
    }

    fn client(relay_addr: SocketAddr) -> SessionManager {
        let mut manager = SessionManager::new(SessionConfig {
            relay_addr,
            ..SessionConfig::default()
        });
        manager.connect_to_relay();
        manager
    }

    async fn step(relay: &mut Relay, managers: &mut [&mut SessionManager]) {
        relay.update();
        for manager in managers.iter_mut() {
            manager.update(STEP);
        }
        tokio::time::sleep(STEP).await;
    }

    async fn connect_all(relay: &mut Relay, managers: &mut [&mut SessionManager]) {
        for _ in 0..500 {
            step(relay, managers).await;
            if managers.iter().all(|m| m.is_connected()) {
                return;
            }
        }
        panic!("peers did not connect");
    }

    async fn wait_for(
        relay: &mut Relay,
        managers: &mut [&mut SessionManager],
        pending: &PendingResponse,
    ) {
        for _ in 0..500 {
            step(relay, managers).await;
            if !pending.is_pending() {
                return;
            }
        }
        panic!("no response");
    }

    #[tokio::test]
    async fn test_peers_get_distinct_ids() {
        let (mut relay, addr) = test_relay();
        let mut a = client(addr);
        let mut b = client(addr);
        connect_all(&mut relay, &mut [&mut a, &mut b]).await;

        assert!(a.local_id().is_assigned());
        assert!(b.local_id().is_assigned());
        assert_ne!(a.local_id(), b.local_id());
        assert_eq!(relay.client_count(), 2);
    }

    #[tokio::test]
    async fn test_request_response_through_relay() {
        let (mut relay, addr) = test_relay();
        let mut a = client(addr);
        let mut b = client(addr);
        connect_all(&mut relay, &mut [&mut a, &mut b]).await;
        a.register_path("/echo");

        let request = Request::new(a.local_id(), "/echo/hello", "marco");
        let pending = b.send_request(request, Duration::from_secs(5)).unwrap();

        for _ in 0..500 {
            step(&mut relay, &mut [&mut a, &mut b]).await;
            for incoming in a.drain_incoming("/echo") {
                assert_eq!(incoming.source(), b.local_id());
                let reply = Response::reply_to(&incoming, status::OK, incoming.content.clone());
                a.send_response(reply).unwrap();
            }
            if pending.is_obtained() {
                break;
            }
        }

        let response = pending.response().unwrap();
        assert_eq!(response.status_code(), status::OK);
        assert_eq!(response.content, Bytes::from("marco"));
        assert_eq!(response.source(), a.local_id());
        assert_eq!(relay.stats().messages_forwarded, 2);
    }

    #[tokio::test]
    async fn test_unknown_peer_gets_404_from_relay() {
        let (mut relay, addr) = test_relay();
        let mut a = client(addr);
        connect_all(&mut relay, &mut [&mut a]).await;

        let pending = a
            .send_request(Request::new(PeerId(999), "/x", Bytes::new()), Duration::from_secs(5))
            .unwrap();
        wait_for(&mut relay, &mut [&mut a], &pending).await;

        let response = pending.response().unwrap();
        assert_eq!(response.status_code(), status::NOT_FOUND);
        assert_eq!(response.source(), PeerId(999));
        assert_eq!(relay.stats().unroutable, 1);
    }

    #[tokio::test]
    async fn test_relay_answers_ping() {
        let (mut relay, addr) = test_relay();
        let mut a = client(addr);
        connect_all(&mut relay, &mut [&mut a]).await;

        let pending = a
            .send_request(
                Request::new(PeerId::UNASSIGNED, PING_PATH, Bytes::new()),
                Duration::from_secs(5),
            )
            .unwrap();
        wait_for(&mut relay, &mut [&mut a], &pending).await;

        assert_eq!(pending.response().unwrap().content, Bytes::from("pong"));
    }

    #[tokio::test]
    async fn test_disconnected_peer_is_dropped() {
        let (mut relay, addr) = test_relay();
        let mut a = client(addr);
        let mut b = client(addr);
        connect_all(&mut relay, &mut [&mut a, &mut b]).await;

        a.reset();
        assert_eq!(a.state(), ConnectionState::Disconnected);
        for _ in 0..500 {
            step(&mut relay, &mut [&mut b]).await;
            if relay.client_count() == 1 {
                break;
            }
        }

        assert_eq!(relay.clients().collect::<Vec<_>>(), vec![b.local_id()]);
        assert_eq!(relay.stats().disconnects, 1);
    }
}
