//! Authoritative simulation loop.
//!
//! The loop owns the entity table and the connection registry outright.
//! Every tick it drains queued network events, applies intents, runs entity
//! behaviors and interactions, then broadcasts a per-connection delta.

use crate::connection::{
    AuthValidator, ConnectionId, ConnectionManager, QueuedIntent, IDLE_TIMEOUT,
};
use crate::entity::EntityState;
use crate::network::ServerEvent;
use crate::snapshot::build_update;
use crate::table::EntityTable;
use log::{debug, info, warn};
use shared::{ClientPacket, EntityKind, ServerPacket, Vec2, MAX_TICK_DELTA};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};

const PROJECTILE_HIT_RADIUS: f32 = 20.0;
const PROJECTILE_DAMAGE: f32 = 0.25;
const ORB_PICKUP_RADIUS: f32 = 24.0;

pub struct GameServer {
    table: EntityTable,
    connections: ConnectionManager,
    validator: Box<dyn AuthValidator>,
    events_rx: mpsc::UnboundedReceiver<ServerEvent>,
    tick: u64,
    tick_interval: Duration,
    /// Opaque per-game blob handed to clients in `Init`.
    bootstrap: Vec<u8>,
}

impl GameServer {
    pub fn new(
        events_rx: mpsc::UnboundedReceiver<ServerEvent>,
        validator: Box<dyn AuthValidator>,
        tick_interval: Duration,
        max_clients: usize,
    ) -> Self {
        let mut table = EntityTable::new();
        seed_world(&mut table);

        Self {
            table,
            connections: ConnectionManager::new(max_clients),
            validator,
            events_rx,
            tick: 0,
            tick_interval,
            bootstrap: Vec::new(),
        }
    }

    pub fn set_bootstrap(&mut self, blob: Vec<u8>) {
        self.bootstrap = blob;
    }

    /// Runs ticks until the event channel closes.
    pub async fn run(&mut self) {
        let mut ticker = interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // First tick fires immediately
        ticker.tick().await;
        let mut last_tick = Instant::now();

        info!(
            "Simulation running at {}ms per tick",
            self.tick_interval.as_millis()
        );

        loop {
            ticker.tick().await;

            let now = Instant::now();
            let mut dt = (now - last_tick).as_secs_f32();
            last_tick = now;
            if dt > MAX_TICK_DELTA {
                warn!("Tick stalled for {:.3}s, clamping dt", dt);
                dt = MAX_TICK_DELTA;
            }

            if !self.drain_events() {
                info!("Network side gone, stopping simulation");
                break;
            }
            self.step(dt);
            self.broadcast();
            self.cleanup();

            if self.tick % 200 == 0 {
                debug!(
                    "Tick {}: {} entities, {} connections",
                    self.tick,
                    self.table.len(),
                    self.connections.len()
                );
            }
        }
    }

    /// Pulls everything the network queued since the last tick. Returns
    /// false once the channel is closed and drained.
    fn drain_events(&mut self) -> bool {
        loop {
            match self.events_rx.try_recv() {
                Ok(event) => self.handle_event(event),
                Err(mpsc::error::TryRecvError::Empty) => return true,
                Err(mpsc::error::TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn handle_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Connected {
                conn,
                addr,
                outbound,
            } => {
                // A refused registration drops the outbound sender, which
                // ends the writer task and closes the socket.
                self.connections.add_with_id(conn, addr, outbound);
            }
            ServerEvent::Packet { conn, packet } => self.handle_packet(conn, packet),
            ServerEvent::Malformed { conn } => {
                if let Some(connection) = self.connections.get_mut(conn) {
                    if connection.record_protocol_fault("undecodable frame") {
                        connection.closing = true;
                    }
                }
            }
            ServerEvent::Disconnected { conn } => self.drop_connection(conn),
        }
    }

    fn handle_packet(&mut self, conn: ConnectionId, packet: ClientPacket) {
        let connection = match self.connections.get_mut(conn) {
            Some(connection) => connection,
            None => return,
        };
        connection.last_seen = std::time::Instant::now();

        match packet {
            ClientPacket::Auth { token } => {
                if connection.authenticated {
                    if connection.record_protocol_fault("repeated auth") {
                        connection.closing = true;
                    }
                    return;
                }
                if self.validator.validate(&token) {
                    connection.authenticated = true;
                    let init = ServerPacket::Init {
                        tick_interval_ms: self.tick_interval.as_millis() as u64,
                        bootstrap: self.bootstrap.clone(),
                    };
                    connection.send(init);
                    info!("Connection {} authenticated", conn);
                } else {
                    warn!("Connection {} failed auth, closing", conn);
                    connection.closing = true;
                }
            }
            ClientPacket::Join { name } => {
                if !connection.authenticated {
                    if connection.record_protocol_fault("join before auth") {
                        connection.closing = true;
                    }
                    return;
                }
                if connection.player_id.is_some() {
                    if connection.record_protocol_fault("repeated join") {
                        connection.closing = true;
                    }
                    return;
                }
                let player_id = self.table.spawn_player(&name);
                if let Some(connection) = self.connections.get_mut(conn) {
                    connection.player_id = Some(player_id);
                    connection.send(ServerPacket::Joined { player_id });
                }
            }
            ClientPacket::Intent {
                sequence,
                move_dir,
                aim,
                fire,
            } => {
                if !connection.authenticated || connection.player_id.is_none() {
                    if connection.record_protocol_fault("intent without avatar") {
                        connection.closing = true;
                    }
                    return;
                }
                // Movement is a direction, not a speed; anything longer than
                // a unit vector (or non-finite) is a client-side bug
                let valid = move_dir.x.is_finite()
                    && move_dir.y.is_finite()
                    && move_dir.length() <= 1.0 + 1e-3
                    && aim.is_finite();
                if !valid {
                    if connection.record_protocol_fault("invalid intent values") {
                        connection.closing = true;
                    }
                    return;
                }
                connection.pending_intents.push(QueuedIntent {
                    sequence,
                    move_dir,
                    aim,
                    fire,
                });
            }
            ClientPacket::Leave => {
                connection.closing = true;
            }
        }
    }

    /// Applies queued intents, runs behaviors, then resolves interactions.
    fn step(&mut self, dt: f32) {
        self.tick += 1;
        self.apply_intents();
        self.table.update_all(dt);
        self.resolve_projectile_hits();
        self.resolve_orb_pickups();
    }

    fn apply_intents(&mut self) {
        let mut shots: Vec<(shared::EntityId, Vec2, f32)> = Vec::new();

        for connection in self.connections.iter_mut() {
            let player_id = match connection.player_id {
                Some(id) => id,
                None => continue,
            };
            if connection.pending_intents.is_empty() {
                continue;
            }
            let mut intents = std::mem::take(&mut connection.pending_intents);
            intents.sort_unstable_by_key(|i| i.sequence);

            for intent in intents {
                // Stale or replayed sequences are dropped, not re-applied
                if intent.sequence <= connection.last_applied_sequence {
                    continue;
                }
                connection.last_applied_sequence = intent.sequence;

                if let Some(player) = self.table.get_mut(player_id) {
                    if player.state != EntityState::Alive {
                        continue;
                    }
                    player.move_dir = intent.move_dir;
                    player.dir = intent.aim;
                    if intent.fire {
                        shots.push((player_id, player.position, intent.aim));
                    }
                }
            }
        }

        for (owner, position, dir) in shots {
            self.table.spawn_projectile(position, dir, Some(owner));
        }
    }

    fn resolve_projectile_hits(&mut self) {
        let projectiles: Vec<(shared::EntityId, Vec2, Option<shared::EntityId>)> = self
            .table
            .iter()
            .filter(|e| e.kind == EntityKind::Projectile && e.state == EntityState::Alive)
            .map(|e| (e.id, e.position, e.owner))
            .collect();
        let players: Vec<(shared::EntityId, Vec2)> = self
            .table
            .iter()
            .filter(|e| e.kind == EntityKind::Player && e.state == EntityState::Alive)
            .map(|e| (e.id, e.position))
            .collect();

        for (projectile_id, projectile_pos, owner) in projectiles {
            for (player_id, player_pos) in &players {
                // A shot never hits the player who fired it
                if owner == Some(*player_id) {
                    continue;
                }
                if projectile_pos.distance(*player_pos) <= PROJECTILE_HIT_RADIUS {
                    self.table.destroy(projectile_id);
                    if let Some(player) = self.table.get_mut(*player_id) {
                        player.health -= PROJECTILE_DAMAGE;
                        if player.health <= 0.0 {
                            info!("Player {} destroyed", player_id);
                            player.state = EntityState::Destroyed;
                        }
                    }
                    break;
                }
            }
        }
    }

    fn resolve_orb_pickups(&mut self) {
        let orbs: Vec<(shared::EntityId, Vec2, f32)> = self
            .table
            .iter()
            .filter(|e| e.kind == EntityKind::PickupOrb && e.state == EntityState::Alive)
            .map(|e| (e.id, e.position, e.health))
            .collect();
        let players: Vec<(shared::EntityId, Vec2)> = self
            .table
            .iter()
            .filter(|e| e.kind == EntityKind::Player && e.state == EntityState::Alive)
            .map(|e| (e.id, e.position))
            .collect();

        for (orb_id, orb_pos, heal) in orbs {
            for (player_id, player_pos) in &players {
                if orb_pos.distance(*player_pos) <= ORB_PICKUP_RADIUS {
                    self.table.destroy(orb_id);
                    if let Some(player) = self.table.get_mut(*player_id) {
                        player.health = (player.health + heal).min(1.0);
                    }
                    break;
                }
            }
        }
    }

    /// One delta per connection. Empty updates still go out so the client's
    /// staleness watchdog sees a heartbeat every tick.
    fn broadcast(&mut self) {
        let table = &self.table;
        let tick = self.tick;
        for connection in self.connections.iter_mut() {
            if !connection.authenticated {
                continue;
            }
            let update = build_update(&mut connection.view, table, tick);
            connection.send(ServerPacket::Update(update));
        }
    }

    /// Removes idle connections and those flagged for closing, then purges
    /// entities whose destruction every view has now been told about.
    fn cleanup(&mut self) {
        for connection in self.connections.iter_mut() {
            if !connection.closing && connection.last_seen.elapsed() > IDLE_TIMEOUT {
                warn!("Connection {} idle, dropping it", connection.id);
                connection.closing = true;
            }
        }
        for conn in self.connections.closing_ids() {
            self.drop_connection(conn);
        }
        self.table.purge_destroyed();
    }

    fn drop_connection(&mut self, conn: ConnectionId) {
        if let Some(connection) = self.connections.remove(conn) {
            if let Some(player_id) = connection.player_id {
                // Avatar goes away for good; the next broadcast tells
                // everyone who still has a view of it.
                self.table.destroy(player_id);
            }
        }
    }

    #[cfg(test)]
    pub fn table(&self) -> &EntityTable {
        &self.table
    }

    #[cfg(test)]
    pub fn table_mut(&mut self) -> &mut EntityTable {
        &mut self.table
    }

    #[cfg(test)]
    pub fn tick_count(&self) -> u64 {
        self.tick
    }
}

/// Static world content: border props and a scatter of pickup orbs.
fn seed_world(table: &mut EntityTable) {
    table.spawn_static_prop(Vec2::new(200.0, 150.0), 0, "crate");
    table.spawn_static_prop(Vec2::new(600.0, 150.0), 1, "crate");
    table.spawn_static_prop(Vec2::new(400.0, 450.0), 2, "barrel");
    table.spawn_pickup_orb(Vec2::new(100.0, 500.0));
    table.spawn_pickup_orb(Vec2::new(700.0, 100.0));
    table.spawn_pickup_orb(Vec2::new(400.0, 300.0));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{AcceptAllValidator, OUTBOUND_QUEUE_CAP};
    use shared::UpdatePacket;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn test_addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 5000)
    }

    struct Harness {
        server: GameServer,
        events_tx: mpsc::UnboundedSender<ServerEvent>,
    }

    impl Harness {
        fn new() -> Self {
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let server = GameServer::new(
                events_rx,
                Box::new(AcceptAllValidator),
                Duration::from_millis(50),
                8,
            );
            Self { server, events_tx }
        }

        fn connect(&mut self) -> (ConnectionId, mpsc::Receiver<ServerPacket>) {
            static NEXT: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);
            let conn = NEXT.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAP);
            self.events_tx
                .send(ServerEvent::Connected {
                    conn,
                    addr: test_addr(),
                    outbound: tx,
                })
                .unwrap();
            (conn, rx)
        }

        fn send(&mut self, conn: ConnectionId, packet: ClientPacket) {
            self.events_tx
                .send(ServerEvent::Packet { conn, packet })
                .unwrap();
        }

        fn tick(&mut self) {
            self.tick_at(0.05);
        }

        fn tick_at(&mut self, dt: f32) {
            assert!(self.server.drain_events());
            self.server.step(dt);
            self.server.broadcast();
            self.server.cleanup();
        }
    }

    fn drain_updates(rx: &mut mpsc::Receiver<ServerPacket>) -> Vec<UpdatePacket> {
        let mut updates = Vec::new();
        while let Ok(packet) = rx.try_recv() {
            if let ServerPacket::Update(update) = packet {
                updates.push(update);
            }
        }
        updates
    }

    fn join(harness: &mut Harness) -> (ConnectionId, mpsc::Receiver<ServerPacket>) {
        let (conn, rx) = harness.connect();
        harness.send(
            conn,
            ClientPacket::Auth {
                token: "x".to_string(),
            },
        );
        harness.send(
            conn,
            ClientPacket::Join {
                name: "ada".to_string(),
            },
        );
        (conn, rx)
    }

    #[tokio::test]
    async fn test_auth_then_join_produces_avatar() {
        let mut harness = Harness::new();
        let (_conn, mut rx) = join(&mut harness);
        harness.tick();

        let mut saw_init = false;
        let mut player_id = None;
        let mut appeared = 0;
        while let Ok(packet) = rx.try_recv() {
            match packet {
                ServerPacket::Init {
                    tick_interval_ms, ..
                } => {
                    assert_eq!(tick_interval_ms, 50);
                    saw_init = true;
                }
                ServerPacket::Joined { player_id: id } => player_id = Some(id),
                ServerPacket::Update(update) => appeared += update.appeared.len(),
            }
        }
        assert!(saw_init);
        let player_id = player_id.unwrap();
        assert!(harness.server.table().get(player_id).is_some());
        // Bootstrap view covers the seeded world plus the avatar
        assert_eq!(appeared, harness.server.table().len());
    }

    #[tokio::test]
    async fn test_intent_moves_player() {
        let mut harness = Harness::new();
        let (conn, mut rx) = join(&mut harness);
        harness.tick();
        drain_updates(&mut rx);

        let player_id = harness
            .server
            .connections
            .get(conn)
            .unwrap()
            .player_id
            .unwrap();
        let before = harness.server.table().get(player_id).unwrap().position;

        harness.send(
            conn,
            ClientPacket::Intent {
                sequence: 1,
                move_dir: Vec2::new(1.0, 0.0),
                aim: 0.0,
                fire: false,
            },
        );
        harness.tick();

        let after = harness.server.table().get(player_id).unwrap().position;
        assert!(after.x > before.x);

        let updates = drain_updates(&mut rx);
        assert!(updates
            .iter()
            .any(|u| u.updated.iter().any(|d| d.id == player_id)));
    }

    #[tokio::test]
    async fn test_stale_intent_sequence_is_dropped() {
        let mut harness = Harness::new();
        let (conn, _rx) = join(&mut harness);
        harness.tick();

        harness.send(
            conn,
            ClientPacket::Intent {
                sequence: 5,
                move_dir: Vec2::ZERO,
                aim: 0.0,
                fire: false,
            },
        );
        harness.tick();

        let player_id = harness
            .server
            .connections
            .get(conn)
            .unwrap()
            .player_id
            .unwrap();
        let before = harness.server.table().get(player_id).unwrap().position;

        // Replayed older sequence must not move the avatar
        harness.send(
            conn,
            ClientPacket::Intent {
                sequence: 3,
                move_dir: Vec2::new(1.0, 0.0),
                aim: 0.0,
                fire: false,
            },
        );
        harness.tick();
        let after = harness.server.table().get(player_id).unwrap().position;
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_fire_spawns_projectile() {
        let mut harness = Harness::new();
        let (conn, _rx) = join(&mut harness);
        harness.tick();

        let count_before = harness.server.table().len();
        harness.send(
            conn,
            ClientPacket::Intent {
                sequence: 1,
                move_dir: Vec2::ZERO,
                aim: 0.0,
                fire: true,
            },
        );
        harness.tick();
        assert_eq!(harness.server.table().len(), count_before + 1);
    }

    #[tokio::test]
    async fn test_projectile_never_hits_its_shooter() {
        let mut harness = Harness::new();
        let (conn, _rx) = join(&mut harness);
        harness.tick();

        let player_id = harness
            .server
            .connections
            .get(conn)
            .unwrap()
            .player_id
            .unwrap();

        harness.send(
            conn,
            ClientPacket::Intent {
                sequence: 1,
                move_dir: Vec2::ZERO,
                aim: 0.0,
                fire: true,
            },
        );
        // At 30Hz the fresh shot is still inside its shooter's hit radius
        harness.tick_at(1.0 / 30.0);

        let player = harness.server.table().get(player_id).unwrap();
        assert_eq!(player.state, EntityState::Alive);
        assert_eq!(player.health, 1.0);
    }

    #[tokio::test]
    async fn test_projectile_hits_other_players() {
        let mut harness = Harness::new();
        let (shooter_conn, _rx1) = join(&mut harness);
        let (target_conn, _rx2) = join(&mut harness);
        harness.tick();

        let shooter_id = harness
            .server
            .connections
            .get(shooter_conn)
            .unwrap()
            .player_id
            .unwrap();
        let target_id = harness
            .server
            .connections
            .get(target_conn)
            .unwrap()
            .player_id
            .unwrap();
        {
            let table = harness.server.table_mut();
            table.get_mut(shooter_id).unwrap().position = Vec2::new(100.0, 300.0);
            // One tick of projectile travel downrange of the shooter
            table.get_mut(target_id).unwrap().position =
                Vec2::new(100.0 + shared::PROJECTILE_SPEED / 30.0, 300.0);
        }

        harness.send(
            shooter_conn,
            ClientPacket::Intent {
                sequence: 1,
                move_dir: Vec2::ZERO,
                aim: 0.0,
                fire: true,
            },
        );
        harness.tick_at(1.0 / 30.0);

        assert_eq!(harness.server.table().get(shooter_id).unwrap().health, 1.0);
        assert!(harness.server.table().get(target_id).unwrap().health < 1.0);
    }

    #[tokio::test]
    async fn test_idle_connection_is_dropped() {
        use crate::connection::IDLE_TIMEOUT;
        let mut harness = Harness::new();
        let (conn, _rx) = join(&mut harness);
        harness.tick();
        assert!(harness.server.connections.get(conn).is_some());

        harness.server.connections.get_mut(conn).unwrap().last_seen =
            std::time::Instant::now() - IDLE_TIMEOUT - Duration::from_secs(1);
        harness.tick();
        assert!(harness.server.connections.get(conn).is_none());
    }

    #[tokio::test]
    async fn test_init_carries_bootstrap_blob() {
        let mut harness = Harness::new();
        harness.server.set_bootstrap(vec![7, 7, 7]);
        let (_conn, mut rx) = join(&mut harness);
        harness.tick();

        let mut blob = None;
        while let Ok(packet) = rx.try_recv() {
            if let ServerPacket::Init { bootstrap, .. } = packet {
                blob = Some(bootstrap);
            }
        }
        assert_eq!(blob.unwrap(), vec![7, 7, 7]);
    }

    #[tokio::test]
    async fn test_disconnect_destroys_avatar() {
        let mut harness = Harness::new();
        let (watcher_conn, mut watcher_rx) = join(&mut harness);
        let (leaver_conn, _leaver_rx) = join(&mut harness);
        harness.tick();
        drain_updates(&mut watcher_rx);

        let leaver_id = harness
            .server
            .connections
            .get(leaver_conn)
            .unwrap()
            .player_id
            .unwrap();

        harness
            .events_tx
            .send(ServerEvent::Disconnected { conn: leaver_conn })
            .unwrap();
        harness.tick();

        let updates = drain_updates(&mut watcher_rx);
        assert!(updates.iter().any(|u| u.destroyed.contains(&leaver_id)));
        // Purged after broadcast, id gone from the table
        assert!(harness.server.table().get(leaver_id).is_none());
        assert!(harness.server.connections.get(watcher_conn).is_some());
    }

    #[tokio::test]
    async fn test_join_before_auth_is_a_fault() {
        let mut harness = Harness::new();
        let (conn, _rx) = harness.connect();
        harness.send(
            conn,
            ClientPacket::Join {
                name: "eve".to_string(),
            },
        );
        harness.tick();
        assert!(harness
            .server
            .connections
            .get(conn)
            .map(|c| c.player_id.is_none())
            .unwrap_or(true));
    }

    #[tokio::test]
    async fn test_leave_removes_connection() {
        let mut harness = Harness::new();
        let (conn, _rx) = join(&mut harness);
        harness.tick();
        harness.send(conn, ClientPacket::Leave);
        harness.tick();
        assert!(harness.server.connections.get(conn).is_none());
    }

    #[tokio::test]
    async fn test_malformed_frames_exhaust_fault_budget() {
        use crate::connection::PROTOCOL_FAULT_LIMIT;
        let mut harness = Harness::new();
        let (conn, _rx) = join(&mut harness);
        harness.tick();
        for _ in 0..PROTOCOL_FAULT_LIMIT {
            harness.events_tx.send(ServerEvent::Malformed { conn }).unwrap();
        }
        harness.tick();
        assert!(harness.server.connections.get(conn).is_none());
    }

    #[tokio::test]
    async fn test_non_finite_intent_is_rejected() {
        let mut harness = Harness::new();
        let (conn, _rx) = join(&mut harness);
        harness.tick();

        let player_id = harness
            .server
            .connections
            .get(conn)
            .unwrap()
            .player_id
            .unwrap();
        let before = harness.server.table().get(player_id).unwrap().position;

        harness.send(
            conn,
            ClientPacket::Intent {
                sequence: 1,
                move_dir: Vec2::new(f32::NAN, 0.0),
                aim: f32::INFINITY,
                fire: false,
            },
        );
        harness.tick();
        let after = harness.server.table().get(player_id).unwrap().position;
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_orb_pickup_heals_and_destroys_orb() {
        let mut harness = Harness::new();
        let (conn, _rx) = join(&mut harness);
        harness.tick();

        let player_id = harness
            .server
            .connections
            .get(conn)
            .unwrap()
            .player_id
            .unwrap();
        let orb_id = harness.server.table_mut().spawn_pickup_orb(Vec2::ZERO);
        {
            let table = harness.server.table_mut();
            let orb_pos = table.get(orb_id).unwrap().position;
            let player = table.get_mut(player_id).unwrap();
            player.position = orb_pos;
            player.health = 0.5;
        }
        harness.tick();
        harness.tick();

        assert!(harness.server.table().get(orb_id).is_none());
        let health = harness.server.table().get(player_id).unwrap().health;
        assert!(health > 0.5);
    }
}
