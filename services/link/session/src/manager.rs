//! Session manager: request/response correlation over one relay connection.
//!
//! Each destination peer has at most one request in flight. Later requests to
//! the same peer wait in a FIFO queue and go out when the in-flight one is
//! answered or times out. Incoming requests are routed to registered path
//! prefixes; anything unmatched is answered with a 404 so the sender does not
//! wait for its timeout.
//!
//! The manager is driven entirely by [`SessionManager::update`]; nothing here
//! blocks or spawns.

use crate::config::SessionConfig;
use crate::endpoint::{EndpointStats, ProtocolEndpoint};
use crate::error::{Result, SessionError};
use crate::pending::{PendingResponse, SlotRef};
use crate::socket::{ConnectStatus, Socket};
use crate::transport::TransportEndpoint;
use bytes::Bytes;
use link_wire::{status, Message, PeerId, Request, Response, WireError, PEER_ID};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Target the relay answers with a peer ID assignment
pub const ASSIGN_PATH: &str = "/link/assign";

/// Target every peer and the relay answer with `200 pong`
pub const PING_PATH: &str = "/link/ping";

/// Relay connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket
    Disconnected,
    /// TCP connect in progress
    Connecting,
    /// Waiting for the relay to assign a peer ID
    Handshaking,
    /// Peer ID assigned; requests flow
    Connected,
    /// Connection lost or refused; call `reset` to start over
    Failed,
}

/// Session counters
#[derive(Clone, Debug, Default)]
pub struct SessionStats {
    /// Requests written to the send queue
    pub requests_sent: u64,
    /// Responses matched to an in-flight request
    pub responses_obtained: u64,
    /// In-flight requests that ran out of time
    pub timeouts: u64,
    /// Incoming requests answered with 404
    pub unroutable: u64,
    /// Responses that matched no in-flight request
    pub stale_responses: u64,
}

struct InFlight {
    message_id: u32,
    time_left: Duration,
    slot: SlotRef,
}

struct Queued {
    request: Request,
    timeout: Duration,
    slot: SlotRef,
}

#[derive(Default)]
struct Destination {
    in_flight: Option<InFlight>,
    queue: VecDeque<Queued>,
}

struct Handshake {
    message_id: u32,
    time_left: Duration,
}

enum Link {
    Down,
    Connecting(TransportEndpoint),
    Open(ProtocolEndpoint),
}

/// Client side of the relay protocol
pub struct SessionManager {
    config: SessionConfig,
    link: Link,
    state: ConnectionState,
    local_id: PeerId,
    handshake: Option<Handshake>,
    destinations: HashMap<PeerId, Destination>,
    paths: BTreeMap<String, VecDeque<Request>>,
    stats: SessionStats,
}

impl SessionManager {
    /// Create a disconnected manager
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            link: Link::Down,
            state: ConnectionState::Disconnected,
            local_id: PeerId::UNASSIGNED,
            handshake: None,
            destinations: HashMap::new(),
            paths: BTreeMap::new(),
            stats: SessionStats::default(),
        }
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the relay has assigned this side a peer ID
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Peer ID assigned by the relay, `UNASSIGNED` before the handshake
    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    /// Session counters
    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Counters of the open endpoint, if any
    pub fn endpoint_stats(&self) -> Option<&EndpointStats> {
        match &self.link {
            Link::Open(endpoint) => Some(endpoint.stats()),
            _ => None,
        }
    }

    /// Configuration in use
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Start or continue connecting to the relay.
    ///
    /// Never blocks. Call again (or keep calling `update`) until the state
    /// becomes `Connected` or `Failed`.
    pub fn connect_to_relay(&mut self) -> ConnectionState {
        if self.state == ConnectionState::Disconnected {
            self.begin_connect();
        }
        self.poll_connection();
        self.state
    }

    /// Adopt an already-connected endpoint and start the handshake on it
    pub fn attach(&mut self, endpoint: ProtocolEndpoint) {
        debug!("Attaching endpoint {:?}", endpoint);
        self.link = Link::Open(endpoint);
        self.begin_handshake();
    }

    /// Drop the connection and return to `Disconnected`.
    ///
    /// Queued requests survive and go out after the next handshake. In-flight
    /// requests keep their timers and time out normally.
    pub fn reset(&mut self) {
        info!("Resetting relay session (peer {})", self.local_id);
        self.link = Link::Down;
        self.state = ConnectionState::Disconnected;
        self.local_id = PeerId::UNASSIGNED;
        self.handshake = None;
    }

    fn begin_connect(&mut self) {
        match Socket::create(0) {
            Ok(socket) => {
                info!("Connecting to relay at {}", self.config.relay_addr);
                self.link = Link::Connecting(TransportEndpoint::new(
                    socket,
                    self.config.staging_buffer_size,
                ));
                self.state = ConnectionState::Connecting;
            }
            Err(e) => self.fail(e),
        }
    }

    fn poll_connection(&mut self) {
        if self.state != ConnectionState::Connecting {
            return;
        }

        match std::mem::replace(&mut self.link, Link::Down) {
            Link::Connecting(mut transport) => {
                match transport.connect_non_blocking(self.config.relay_addr) {
                    ConnectStatus::Success => {
                        debug!("TCP connection to relay established");
                        let endpoint = ProtocolEndpoint::new(
                            Box::new(transport),
                            self.config.max_content_length,
                        );
                        self.link = Link::Open(endpoint);
                        self.begin_handshake();
                    }
                    ConnectStatus::Pending => self.link = Link::Connecting(transport),
                    ConnectStatus::Error(kind) => {
                        self.fail(SessionError::Connect(io::Error::from(kind)));
                    }
                }
            }
            other => self.link = other,
        }
    }

    fn begin_handshake(&mut self) {
        self.state = ConnectionState::Handshaking;
        self.local_id = PeerId::UNASSIGNED;
        let Link::Open(endpoint) = &mut self.link else {
            return;
        };
        endpoint.set_local_id(PeerId::UNASSIGNED);

        let request = Request::new(PeerId::UNASSIGNED, ASSIGN_PATH, Bytes::new());
        match endpoint.finalize_and_send(request.into(), true) {
            Ok(message_id) => {
                debug!("Sent peer ID request {}", message_id);
                self.handshake = Some(Handshake {
                    message_id,
                    time_left: self.config.handshake_timeout,
                });
            }
            Err(e) => self.fail(e),
        }
    }

    fn complete_handshake(&mut self, response: Response) {
        self.handshake = None;
        if response.status_code() != status::OK {
            self.fail(SessionError::HandshakeRejected(format!(
                "status {}",
                response.status_code()
            )));
            return;
        }

        let assigned = response
            .headers
            .get(PEER_ID)
            .and_then(|value| value.trim().parse::<u16>().ok())
            .map(PeerId)
            .unwrap_or(response.destination());
        if !assigned.is_assigned() {
            self.fail(SessionError::HandshakeRejected(
                "no peer ID in response".to_string(),
            ));
            return;
        }

        if let Link::Open(endpoint) = &mut self.link {
            endpoint.set_local_id(assigned);
        }
        self.local_id = assigned;
        self.state = ConnectionState::Connected;
        info!("Relay assigned peer ID {}", assigned);

        let waiting: Vec<PeerId> = self
            .destinations
            .iter()
            .filter(|(_, destination)| !destination.queue.is_empty())
            .map(|(peer, _)| *peer)
            .collect();
        for peer in waiting {
            self.advance(peer);
        }
    }

    fn fail(&mut self, err: SessionError) {
        error!("Relay session failed: {}", err);
        self.link = Link::Down;
        self.state = ConnectionState::Failed;
        self.handshake = None;
    }

    /// Advance timers by `dt`, progress the connection, process incoming
    /// messages and write pending output.
    pub fn update(&mut self, dt: Duration) {
        self.tick(dt);
        self.poll_connection();
        self.pump_receive();
        self.pump_send();
    }

    fn tick(&mut self, dt: Duration) {
        if let Some(handshake) = &mut self.handshake {
            handshake.time_left = handshake.time_left.saturating_sub(dt);
            if handshake.time_left.is_zero() {
                self.fail(SessionError::HandshakeTimeout);
            }
        }

        let mut expired = Vec::new();
        for (peer, destination) in self.destinations.iter_mut() {
            if let Some(in_flight) = &mut destination.in_flight {
                in_flight.time_left = in_flight.time_left.saturating_sub(dt);
                if let Some(slot) = in_flight.slot.upgrade() {
                    slot.borrow_mut().set_time_left(in_flight.time_left);
                }
                if in_flight.time_left.is_zero() {
                    expired.push(*peer);
                }
            }
        }

        for peer in expired {
            let in_flight = self
                .destinations
                .get_mut(&peer)
                .and_then(|destination| destination.in_flight.take());
            if let Some(in_flight) = in_flight {
                warn!("Request {} to {} timed out", in_flight.message_id, peer);
                if let Some(slot) = in_flight.slot.upgrade() {
                    slot.borrow_mut().time_out();
                }
                self.stats.timeouts += 1;
            }
            self.advance(peer);
        }
    }

    fn pump_receive(&mut self) {
        let Link::Open(endpoint) = &mut self.link else {
            return;
        };
        let messages = match endpoint.receive_messages() {
            Ok(messages) => messages,
            Err(e) => {
                self.fail(e);
                return;
            }
        };

        for message in messages {
            match message {
                Message::Request(request) => self.handle_incoming_request(request),
                Message::Response(response) => self.handle_incoming_response(response),
            }
        }
    }

    fn pump_send(&mut self) {
        let Link::Open(endpoint) = &mut self.link else {
            return;
        };
        if let Err(e) = endpoint.flush() {
            self.fail(e);
        }
    }

    /// Route one incoming request.
    ///
    /// Pings are answered directly. Requests whose target falls under a
    /// registered path are queued there; the rest get a 404.
    pub fn handle_incoming_request(&mut self, request: Request) {
        trace!(
            "Request {} from {} for {}",
            request.envelope.message_id,
            request.source(),
            request.target
        );

        if request.target == PING_PATH {
            self.reply(&request, status::OK, "pong");
            return;
        }
        if request.target == ASSIGN_PATH {
            self.reply(&request, status::NOT_FOUND, "not a relay");
            return;
        }

        match self.match_path(&request.target) {
            Some(path) => {
                debug!("Queued request for {} under {}", request.target, path);
                if let Some(queue) = self.paths.get_mut(&path) {
                    queue.push_back(request);
                }
            }
            None => {
                warn!(
                    "Unroutable request for {} from {}",
                    request.target,
                    request.source()
                );
                self.stats.unroutable += 1;
                let content = format!("no handler for {}", request.target);
                self.reply(&request, status::NOT_FOUND, content);
            }
        }
    }

    fn handle_incoming_response(&mut self, response: Response) {
        let source = response.source();
        let message_id = response.envelope.message_id;

        let answers_handshake = self
            .handshake
            .as_ref()
            .map_or(false, |h| h.message_id == message_id);
        if source == PeerId::UNASSIGNED && answers_handshake {
            self.complete_handshake(response);
            return;
        }

        let matched = self.destinations.get_mut(&source).and_then(|destination| {
            match &destination.in_flight {
                Some(in_flight) if in_flight.message_id == message_id => {
                    destination.in_flight.take()
                }
                _ => None,
            }
        });

        match matched {
            Some(in_flight) => {
                trace!("Response {} from {}", message_id, source);
                match in_flight.slot.upgrade() {
                    Some(slot) => slot.borrow_mut().resolve(response),
                    None => debug!(
                        "Response {} from {} arrived after its handle was dropped",
                        message_id, source
                    ),
                }
                self.stats.responses_obtained += 1;
                self.advance(source);
            }
            None => {
                debug!("Dropping stale response {} from {}", message_id, source);
                self.stats.stale_responses += 1;
            }
        }
    }

    fn reply(&mut self, request: &Request, status_code: u16, content: impl Into<Bytes>) {
        let response = Response::reply_to(request, status_code, content);
        if let Err(e) = self.send_response(response) {
            warn!(
                "Could not answer request {} from {}: {}",
                request.envelope.message_id,
                request.source(),
                e
            );
        }
    }

    /// Send a request, returning a handle to its eventual response.
    ///
    /// The request goes out immediately if its destination is idle and the
    /// session is connected; otherwise it waits its turn. The timeout only
    /// runs while the request is in flight.
    pub fn send_request(&mut self, request: Request, timeout: Duration) -> Result<PendingResponse> {
        if request.is_finalized() {
            return Err(SessionError::Wire(WireError::AlreadyFinalized));
        }

        let peer = request.destination();
        let (handle, slot) = PendingResponse::new(peer, timeout);
        let destination = self.destinations.entry(peer).or_default();
        if destination.in_flight.is_some() || !destination.queue.is_empty() {
            debug!(
                "Request for {} on {} waits behind {} queued",
                request.target,
                peer,
                destination.queue.len() + usize::from(destination.in_flight.is_some())
            );
        }
        destination.queue.push_back(Queued {
            request,
            timeout,
            slot,
        });

        self.advance(peer);
        Ok(handle)
    }

    /// `send_request` with the configured default timeout
    pub fn send_request_default(&mut self, request: Request) -> Result<PendingResponse> {
        let timeout = self.config.default_request_timeout;
        self.send_request(request, timeout)
    }

    /// Finalize and queue a response. Responses are never queued per peer.
    pub fn send_response(&mut self, response: Response) -> Result<()> {
        let Link::Open(endpoint) = &mut self.link else {
            return Err(SessionError::NotConnected);
        };
        endpoint.finalize_and_send(response.into(), false)?;
        Ok(())
    }

    fn advance(&mut self, peer: PeerId) {
        if self.state != ConnectionState::Connected {
            return;
        }
        let Link::Open(endpoint) = &mut self.link else {
            return;
        };
        let Some(destination) = self.destinations.get_mut(&peer) else {
            return;
        };

        while destination.in_flight.is_none() {
            let Some(queued) = destination.queue.pop_front() else {
                break;
            };
            let Some(slot) = queued.slot.upgrade() else {
                debug!("Skipping request to {} whose handle was dropped", peer);
                continue;
            };

            match endpoint.finalize_and_send(queued.request.into(), true) {
                Ok(message_id) => {
                    debug!("Sent request {} to {}", message_id, peer);
                    slot.borrow_mut().mark_transmitted();
                    self.stats.requests_sent += 1;
                    destination.in_flight = Some(InFlight {
                        message_id,
                        time_left: queued.timeout,
                        slot: queued.slot,
                    });
                }
                Err(e) => {
                    warn!("Could not send request to {}: {}", peer, e);
                    slot.borrow_mut().time_out();
                }
            }
        }

        if destination.in_flight.is_none() && destination.queue.is_empty() {
            self.destinations.remove(&peer);
        }
    }

    /// Whether a request to `peer` is currently in flight
    pub fn is_waiting_on(&self, peer: PeerId) -> bool {
        self.destinations
            .get(&peer)
            .map_or(false, |destination| destination.in_flight.is_some())
    }

    /// Requests to `peer` waiting behind the in-flight one
    pub fn queued_requests(&self, peer: PeerId) -> usize {
        self.destinations
            .get(&peer)
            .map_or(0, |destination| destination.queue.len())
    }

    /// Accept incoming requests whose target falls under `prefix`
    pub fn register_path(&mut self, prefix: &str) {
        let path = normalize_path(prefix);
        debug!("Registered path {}", path);
        self.paths.entry(path).or_default();
    }

    /// Whether requests are waiting under a registered path
    pub fn has_incoming(&self, path: &str) -> bool {
        self.paths
            .get(&normalize_path(path))
            .map_or(false, |queue| !queue.is_empty())
    }

    /// Take every request waiting under a registered path, oldest first
    pub fn drain_incoming(&mut self, path: &str) -> Vec<Request> {
        self.paths
            .get_mut(&normalize_path(path))
            .map(|queue| queue.drain(..).collect())
            .unwrap_or_default()
    }

    fn match_path(&self, target: &str) -> Option<String> {
        self.paths
            .keys()
            .filter(|prefix| path_matches(prefix, target))
            .max_by_key(|prefix| prefix.len())
            .cloned()
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("state", &self.state)
            .field("local_id", &self.local_id)
            .field("destinations", &self.destinations.len())
            .field("paths", &self.paths.keys().collect::<Vec<_>>())
            .field("stats", &self.stats)
            .finish()
    }
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Prefix match on a segment boundary: `/chat` matches `/chat` and
/// `/chat/room` but not `/chatroom`.
fn path_matches(prefix: &str, target: &str) -> bool {
    if prefix == "/" {
        return target.starts_with('/');
    }
    match target.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || rest.starts_with('?'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::tests::{memory_endpoint, Wire};
    use crate::pending::ResponseStatus;
    use link_wire::MessageDecoder;
    use std::cell::RefCell;
    use std::rc::Rc;

    const SELF_ID: PeerId = PeerId(1);
    const PEER: PeerId = PeerId(2);

    fn take_sent(wire: &Rc<RefCell<Wire>>) -> Vec<Message> {
        let sent = std::mem::take(&mut wire.borrow_mut().sent);
        let parsed = MessageDecoder::new().parse_messages(&sent);
        assert!(parsed.leftover.is_empty());
        parsed.messages
    }

    fn requests(messages: Vec<Message>) -> Vec<Request> {
        messages
            .into_iter()
            .map(|message| match message {
                Message::Request(request) => request,
                Message::Response(_) => panic!("expected a request"),
            })
            .collect()
    }

    fn responses(messages: Vec<Message>) -> Vec<Response> {
        messages
            .into_iter()
            .map(|message| match message {
                Message::Response(response) => response,
                Message::Request(_) => panic!("expected a response"),
            })
            .collect()
    }

    fn inject(wire: &Rc<RefCell<Wire>>, message: Message) {
        wire.borrow_mut().inbound.push_back(message.encode().unwrap().to_vec());
    }

    fn answer(wire: &Rc<RefCell<Wire>>, request: &Request, from: PeerId, content: &'static str) {
        let mut response: Message = Response::reply_to(request, status::OK, content).into();
        response.finalize(from, None).unwrap();
        inject(wire, response);
    }

    fn incoming(wire: &Rc<RefCell<Wire>>, target: &str, message_id: u32) {
        let mut request: Message = Request::new(SELF_ID, target, "payload").into();
        request.finalize(PEER, Some(message_id)).unwrap();
        inject(wire, request);
    }

    fn connected_manager() -> (SessionManager, Rc<RefCell<Wire>>) {
        let (endpoint, wire) = memory_endpoint();
        let mut manager = SessionManager::new(SessionConfig::default());
        manager.attach(endpoint);
        manager.update(Duration::ZERO);

        let assign = requests(take_sent(&wire)).remove(0);
        assert_eq!(assign.target, ASSIGN_PATH);
        let mut response: Message = Response::reply_to(&assign, status::OK, "")
            .with_header(PEER_ID, SELF_ID.to_string())
            .into();
        response.finalize(PeerId::UNASSIGNED, None).unwrap();
        inject(&wire, response);
        manager.update(Duration::ZERO);

        assert_eq!(manager.state(), ConnectionState::Connected);
        (manager, wire)
    }

    #[test]
    fn test_handshake_assigns_peer_id() {
        let (manager, wire) = connected_manager();
        assert_eq!(manager.local_id(), SELF_ID);
        assert!(manager.is_connected());
        assert!(take_sent(&wire).is_empty());
    }

    #[test]
    fn test_handshake_timeout_fails_session() {
        let (endpoint, _wire) = memory_endpoint();
        let mut manager = SessionManager::new(SessionConfig {
            handshake_timeout: Duration::from_secs(1),
            ..SessionConfig::default()
        });
        manager.attach(endpoint);

        manager.update(Duration::from_millis(600));
        assert_eq!(manager.state(), ConnectionState::Handshaking);
        manager.update(Duration::from_millis(600));
        assert_eq!(manager.state(), ConnectionState::Failed);

        manager.reset();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.local_id(), PeerId::UNASSIGNED);
    }

    #[test]
    fn test_requests_before_handshake_are_held() {
        let (endpoint, wire) = memory_endpoint();
        let mut manager = SessionManager::new(SessionConfig::default());
        manager.attach(endpoint);

        let early = manager
            .send_request(Request::new(PEER, "/early", Bytes::new()), Duration::from_secs(1))
            .unwrap();
        manager.update(Duration::ZERO);
        let sent = requests(take_sent(&wire));
        assert_eq!(sent.len(), 1);
        assert!(!early.is_transmitted());

        let mut response: Message = Response::reply_to(&sent[0], status::OK, "")
            .with_header(PEER_ID, "9")
            .into();
        response.finalize(PeerId::UNASSIGNED, None).unwrap();
        inject(&wire, response);
        manager.update(Duration::ZERO);

        assert!(early.is_transmitted());
        let sent = requests(take_sent(&wire));
        assert_eq!(sent[0].target, "/early");
        assert_eq!(sent[0].source(), PeerId(9));
    }

    #[test]
    fn test_single_flight_per_destination() {
        let (mut manager, wire) = connected_manager();
        let first = manager
            .send_request(Request::new(PEER, "/a", Bytes::new()), Duration::from_secs(5))
            .unwrap();
        let second = manager
            .send_request(Request::new(PEER, "/b", Bytes::new()), Duration::from_secs(5))
            .unwrap();
        manager.update(Duration::ZERO);

        let sent = requests(take_sent(&wire));
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].target, "/a");
        assert!(first.is_transmitted());
        assert!(!second.is_transmitted());
        assert!(manager.is_waiting_on(PEER));
        assert_eq!(manager.queued_requests(PEER), 1);

        answer(&wire, &sent[0], PEER, "done");
        manager.update(Duration::ZERO);

        assert!(first.is_obtained());
        assert_eq!(first.response().unwrap().content, Bytes::from("done"));
        assert!(second.is_transmitted());
        assert_eq!(requests(take_sent(&wire))[0].target, "/b");
    }

    #[test]
    fn test_other_destinations_are_independent() {
        let (mut manager, wire) = connected_manager();
        manager
            .send_request(Request::new(PEER, "/a", Bytes::new()), Duration::from_secs(5))
            .unwrap();
        let other = manager
            .send_request(Request::new(PeerId(3), "/a", Bytes::new()), Duration::from_secs(5))
            .unwrap();
        manager.update(Duration::ZERO);

        assert!(other.is_transmitted());
        assert_eq!(take_sent(&wire).len(), 2);
    }

    #[test]
    fn test_timeout_then_late_response_is_stale() {
        let (mut manager, wire) = connected_manager();
        let first = manager
            .send_request(Request::new(PEER, "/slow", Bytes::new()), Duration::from_secs(1))
            .unwrap();
        let second = manager
            .send_request(Request::new(PEER, "/next", Bytes::new()), Duration::from_secs(1))
            .unwrap();
        manager.update(Duration::ZERO);
        let slow = requests(take_sent(&wire)).remove(0);

        manager.update(Duration::from_millis(400));
        manager.update(Duration::from_millis(400));
        assert!(first.is_pending());
        assert_eq!(first.time_left(), Duration::from_millis(200));

        manager.update(Duration::from_millis(300));
        assert_eq!(first.status(), ResponseStatus::TimedOut);
        assert_eq!(manager.stats().timeouts, 1);
        assert!(second.is_transmitted());

        answer(&wire, &slow, PEER, "too late");
        manager.update(Duration::ZERO);

        assert!(first.is_timed_out());
        assert!(first.response().is_none());
        assert!(second.is_pending());
        assert_eq!(manager.stats().stale_responses, 1);
    }

    #[test]
    fn test_timeout_expires_when_elapsed_equals_limit() {
        let (mut manager, wire) = connected_manager();
        let pending = manager
            .send_request(Request::new(PEER, "/slow", Bytes::new()), Duration::from_secs(1))
            .unwrap();
        manager.update(Duration::ZERO);
        assert_eq!(take_sent(&wire).len(), 1);

        manager.update(Duration::from_millis(500));
        assert!(pending.is_pending());
        assert_eq!(pending.time_left(), Duration::from_millis(500));

        manager.update(Duration::from_millis(500));
        assert_eq!(pending.status(), ResponseStatus::TimedOut);
        assert_eq!(pending.time_left(), Duration::ZERO);
        assert_eq!(manager.stats().timeouts, 1);
    }

    #[test]
    fn test_dropped_handle_is_skipped() {
        let (mut manager, wire) = connected_manager();
        let first = manager
            .send_request(Request::new(PEER, "/a", Bytes::new()), Duration::from_secs(5))
            .unwrap();
        let dropped = manager
            .send_request(Request::new(PEER, "/dropped", Bytes::new()), Duration::from_secs(5))
            .unwrap();
        let third = manager
            .send_request(Request::new(PEER, "/c", Bytes::new()), Duration::from_secs(5))
            .unwrap();
        drop(dropped);
        manager.update(Duration::ZERO);
        let sent = requests(take_sent(&wire));

        answer(&wire, &sent[0], PEER, "ok");
        manager.update(Duration::ZERO);

        assert!(first.is_obtained());
        assert!(third.is_transmitted());
        let sent = requests(take_sent(&wire));
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].target, "/c");
    }

    #[test]
    fn test_dropped_in_flight_keeps_destination_busy() {
        let (mut manager, wire) = connected_manager();
        let first = manager
            .send_request(Request::new(PEER, "/a", Bytes::new()), Duration::from_secs(1))
            .unwrap();
        let second = manager
            .send_request(Request::new(PEER, "/b", Bytes::new()), Duration::from_secs(1))
            .unwrap();
        manager.update(Duration::ZERO);
        take_sent(&wire);
        drop(first);

        manager.update(Duration::from_millis(500));
        assert!(!second.is_transmitted());

        manager.update(Duration::from_millis(500));
        assert!(second.is_transmitted());
    }

    #[test]
    fn test_unroutable_request_gets_404() {
        let (mut manager, wire) = connected_manager();
        manager.register_path("/chat");
        incoming(&wire, "/chatroom", 41);
        manager.update(Duration::ZERO);

        let replies = responses(take_sent(&wire));
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].status_code(), status::NOT_FOUND);
        assert_eq!(replies[0].envelope.message_id, 41);
        assert_eq!(replies[0].destination(), PEER);
        assert_eq!(replies[0].source(), SELF_ID);
        assert_eq!(manager.stats().unroutable, 1);
        assert!(!manager.has_incoming("/chat"));
    }

    #[test]
    fn test_ping_is_answered() {
        let (mut manager, wire) = connected_manager();
        incoming(&wire, PING_PATH, 5);
        manager.update(Duration::ZERO);

        let replies = responses(take_sent(&wire));
        assert_eq!(replies[0].status_code(), status::OK);
        assert_eq!(replies[0].content, Bytes::from("pong"));
    }

    #[test]
    fn test_longest_prefix_wins() {
        let (mut manager, wire) = connected_manager();
        manager.register_path("/chat/");
        manager.register_path("/chat/room");
        for (target, message_id) in ["/chat/room/7", "/chat/lobby", "/chat"].into_iter().zip(1..) {
            incoming(&wire, target, message_id);
            manager.update(Duration::ZERO);
        }

        assert!(take_sent(&wire).is_empty());
        let room: Vec<_> = manager
            .drain_incoming("/chat/room")
            .into_iter()
            .map(|r| r.target)
            .collect();
        assert_eq!(room, vec!["/chat/room/7"]);

        let chat: Vec<_> = manager
            .drain_incoming("/chat")
            .into_iter()
            .map(|r| r.target)
            .collect();
        assert_eq!(chat, vec!["/chat/lobby", "/chat"]);
        assert!(!manager.has_incoming("/chat"));
    }

    #[test]
    fn test_finalized_request_is_rejected() {
        let (mut manager, _wire) = connected_manager();
        let mut message: Message = Request::new(PEER, "/a", Bytes::new()).into();
        message.finalize(SELF_ID, Some(1)).unwrap();
        let Message::Request(request) = message else {
            unreachable!()
        };

        assert!(matches!(
            manager.send_request(request, Duration::from_secs(1)),
            Err(SessionError::Wire(WireError::AlreadyFinalized))
        ));
    }

    #[test]
    fn test_send_response_requires_connection() {
        let mut manager = SessionManager::new(SessionConfig::default());
        let response = Response::new(PEER, status::OK, "x");
        assert!(matches!(
            manager.send_response(response),
            Err(SessionError::NotConnected)
        ));
    }

    #[test]
    fn test_connection_loss_fails_session() {
        let (mut manager, wire) = connected_manager();
        wire.borrow_mut().closed = true;
        manager.update(Duration::ZERO);
        assert_eq!(manager.state(), ConnectionState::Failed);
        assert!(manager.endpoint_stats().is_none());
    }

    #[test]
    fn test_path_matching() {
        assert!(path_matches("/chat", "/chat"));
        assert!(path_matches("/chat", "/chat/room"));
        assert!(path_matches("/chat", "/chat?x=1"));
        assert!(!path_matches("/chat", "/chatroom"));
        assert!(!path_matches("/chat", "/other"));
        assert!(path_matches("/", "/anything"));
        assert_eq!(normalize_path("/chat/"), "/chat");
        assert_eq!(normalize_path("/"), "/");
    }
}
