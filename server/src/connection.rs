//! Connection registry and per-connection state.

use crate::snapshot::SnapshotView;
use log::{info, warn};
use shared::{EntityId, ServerPacket, Vec2};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

pub type ConnectionId = u64;

/// Protocol faults tolerated before the connection is closed.
pub const PROTOCOL_FAULT_LIMIT: u32 = 8;

/// Outbound packets buffered per connection before it is declared too slow.
pub const OUTBOUND_QUEUE_CAP: usize = 64;

/// Silence tolerated before a connection is dropped as idle.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Token check performed on the first message of every connection. The
/// default deployment validates against a static token list handed over by
/// the matchmaker; tests swap in an accept-all.
pub trait AuthValidator: Send + Sync {
    fn validate(&self, token: &str) -> bool;
}

pub struct StaticTokenValidator {
    tokens: Vec<String>,
}

impl StaticTokenValidator {
    pub fn new(tokens: Vec<String>) -> Self {
        Self { tokens }
    }
}

impl AuthValidator for StaticTokenValidator {
    fn validate(&self, token: &str) -> bool {
        self.tokens.iter().any(|t| t == token)
    }
}

pub struct AcceptAllValidator;

impl AuthValidator for AcceptAllValidator {
    fn validate(&self, _token: &str) -> bool {
        true
    }
}

/// Movement/aim intent queued from the network, applied at the next tick.
#[derive(Debug, Clone, Copy)]
pub struct QueuedIntent {
    pub sequence: u32,
    pub move_dir: Vec2,
    pub aim: f32,
    pub fire: bool,
}

pub struct Connection {
    pub id: ConnectionId,
    pub addr: SocketAddr,
    pub authenticated: bool,
    /// Avatar entity, set once a `Join` is honored.
    pub player_id: Option<EntityId>,
    pub view: SnapshotView,
    outbound: mpsc::Sender<ServerPacket>,
    pub pending_intents: Vec<QueuedIntent>,
    pub last_applied_sequence: u32,
    protocol_faults: u32,
    pub last_seen: Instant,
    pub closing: bool,
}

impl Connection {
    pub fn new(id: ConnectionId, addr: SocketAddr, outbound: mpsc::Sender<ServerPacket>) -> Self {
        Self {
            id,
            addr,
            authenticated: false,
            player_id: None,
            view: SnapshotView::new(),
            outbound,
            pending_intents: Vec::new(),
            last_applied_sequence: 0,
            protocol_faults: 0,
            last_seen: Instant::now(),
            closing: false,
        }
    }

    /// Queues a packet for the writer task. A full queue means the client is
    /// not draining fast enough; the connection is marked for closing rather
    /// than letting the queue grow without bound.
    pub fn send(&mut self, packet: ServerPacket) {
        if self.closing {
            return;
        }
        if self.outbound.try_send(packet).is_err() {
            warn!(
                "Connection {} outbound queue full or closed, dropping it",
                self.id
            );
            self.closing = true;
        }
    }

    /// Records a malformed or out-of-order message. Returns true once the
    /// fault budget is spent and the connection should be closed.
    pub fn record_protocol_fault(&mut self, what: &str) -> bool {
        self.protocol_faults += 1;
        warn!(
            "Connection {} protocol fault ({}), {}/{}",
            self.id, what, self.protocol_faults, PROTOCOL_FAULT_LIMIT
        );
        self.protocol_faults >= PROTOCOL_FAULT_LIMIT
    }
}

pub struct ConnectionManager {
    connections: HashMap<ConnectionId, Connection>,
    max_clients: usize,
}

impl ConnectionManager {
    pub fn new(max_clients: usize) -> Self {
        Self {
            connections: HashMap::new(),
            max_clients,
        }
    }

    /// Registers a connection under the id the accept loop assigned it.
    /// Refusal drops `outbound`, which closes the socket's writer task.
    pub fn add_with_id(
        &mut self,
        id: ConnectionId,
        addr: SocketAddr,
        outbound: mpsc::Sender<ServerPacket>,
    ) -> bool {
        if self.connections.len() >= self.max_clients {
            warn!("Refusing connection from {}: server full", addr);
            return false;
        }
        self.connections.insert(id, Connection::new(id, addr, outbound));
        info!("Connection {} registered from {}", id, addr);
        true
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        let removed = self.connections.remove(&id);
        if removed.is_some() {
            info!("Connection {} removed", id);
        }
        removed
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.connections.values_mut()
    }

    /// Connections flagged for closing by the send path or fault budget.
    pub fn closing_ids(&self) -> Vec<ConnectionId> {
        self.connections
            .values()
            .filter(|c| c.closing)
            .map(|c| c.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn test_addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 4000)
    }

    #[test]
    fn test_static_token_validator() {
        let validator = StaticTokenValidator::new(vec!["alpha".to_string(), "beta".to_string()]);
        assert!(validator.validate("alpha"));
        assert!(validator.validate("beta"));
        assert!(!validator.validate("gamma"));
        assert!(!validator.validate(""));
    }

    #[test]
    fn test_manager_enforces_capacity() {
        let mut manager = ConnectionManager::new(2);
        let (tx, _rx) = mpsc::channel(OUTBOUND_QUEUE_CAP);
        assert!(manager.add_with_id(1, test_addr(), tx.clone()));
        assert!(manager.add_with_id(2, test_addr(), tx.clone()));
        assert!(!manager.add_with_id(3, test_addr(), tx));
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn test_remove_returns_the_connection() {
        let mut manager = ConnectionManager::new(8);
        let (tx, _rx) = mpsc::channel(OUTBOUND_QUEUE_CAP);
        manager.add_with_id(1, test_addr(), tx);
        let removed = manager.remove(1).unwrap();
        assert_eq!(removed.id, 1);
        assert!(manager.remove(1).is_none());
    }

    #[test]
    fn test_fault_budget_escalates() {
        let (tx, _rx) = mpsc::channel(OUTBOUND_QUEUE_CAP);
        let mut connection = Connection::new(1, test_addr(), tx);
        for _ in 0..PROTOCOL_FAULT_LIMIT - 1 {
            assert!(!connection.record_protocol_fault("bad packet"));
        }
        assert!(connection.record_protocol_fault("bad packet"));
    }

    #[test]
    fn test_full_outbound_queue_marks_closing() {
        let (tx, _rx) = mpsc::channel(1);
        let mut connection = Connection::new(1, test_addr(), tx);
        connection.send(ServerPacket::Joined { player_id: 1 });
        assert!(!connection.closing);
        // Second send overflows the 1-slot queue
        connection.send(ServerPacket::Joined { player_id: 1 });
        assert!(connection.closing);
    }
}
