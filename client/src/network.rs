//! Client-side session: connect, authenticate, and keep the entity cache
//! fed from the server's update stream.

use crate::cache::ClientEntityCache;
use log::{error, info, warn};
use shared::framing::{read_frame, write_frame};
use shared::wire::{decode_server, encode_client};
use shared::{ClientPacket, EntityId, ServerPacket, Vec2, TICK_INTERVAL_MS};
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::Instant;

/// Ticks of silence tolerated before the session is flagged stale.
const STALE_TICKS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Auth sent, waiting for `Init`.
    Connecting,
    Active,
    /// No update for several tick intervals; the link may be dead.
    Degraded,
    Disconnected,
}

enum PumpOutcome {
    Frame(Vec<u8>),
    IoError(std::io::Error),
    Stale,
}

pub struct ClientConnection {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    pub cache: ClientEntityCache,
    status: ConnectionStatus,
    player_id: Option<EntityId>,
    tick_interval: Duration,
    last_update: Instant,
    last_tick: u64,
    next_sequence: u32,
}

impl ClientConnection {
    /// Opens the session and sends `Auth` as the first message, as the
    /// server requires. `Init` arrives through `pump`.
    pub async fn connect(
        addr: &str,
        token: &str,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        info!("Connected to {}", addr);
        let (reader, mut writer) = stream.into_split();

        let auth = ClientPacket::Auth {
            token: token.to_string(),
        };
        write_frame(&mut writer, &encode_client(&auth)?).await?;

        Ok(Self {
            reader,
            writer,
            cache: ClientEntityCache::new(),
            status: ConnectionStatus::Connecting,
            player_id: None,
            tick_interval: Duration::from_millis(TICK_INTERVAL_MS),
            last_update: Instant::now(),
            last_tick: 0,
            next_sequence: 1,
        })
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn player_id(&self) -> Option<EntityId> {
        self.player_id
    }

    pub fn last_tick(&self) -> u64 {
        self.last_tick
    }

    pub async fn join(
        &mut self,
        name: &str,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let join = ClientPacket::Join {
            name: name.to_string(),
        };
        write_frame(&mut self.writer, &encode_client(&join)?).await?;
        Ok(())
    }

    pub async fn send_intent(
        &mut self,
        move_dir: Vec2,
        aim: f32,
        fire: bool,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let intent = ClientPacket::Intent {
            sequence: self.next_sequence,
            move_dir,
            aim,
            fire,
        };
        self.next_sequence += 1;
        write_frame(&mut self.writer, &encode_client(&intent)?).await?;
        Ok(())
    }

    pub async fn leave(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        write_frame(&mut self.writer, &encode_client(&ClientPacket::Leave)?).await?;
        Ok(())
    }

    /// Waits for the next server message and folds it into the cache.
    /// Returns false once the session is gone for good.
    pub async fn pump(&mut self) -> bool {
        if self.status == ConnectionStatus::Disconnected {
            return false;
        }

        let deadline = self.last_update + self.tick_interval * STALE_TICKS;
        let outcome = tokio::select! {
            result = read_frame(&mut self.reader) => match result {
                Ok(payload) => PumpOutcome::Frame(payload),
                Err(e) => PumpOutcome::IoError(e),
            },
            _ = tokio::time::sleep_until(deadline) => PumpOutcome::Stale,
        };

        match outcome {
            PumpOutcome::Frame(payload) => {
                self.last_update = Instant::now();
                match decode_server(&payload) {
                    Ok(packet) => {
                        if self.status == ConnectionStatus::Degraded {
                            info!("Update stream recovered");
                        }
                        if self.status != ConnectionStatus::Connecting {
                            self.status = ConnectionStatus::Active;
                        }
                        self.handle_packet(packet);
                    }
                    Err(e) => {
                        // The tick is lost: cached state stays as of the
                        // last good update and the session reads degraded
                        // until a decodable frame arrives
                        error!("Dropping undecodable server frame: {}", e);
                        self.status = ConnectionStatus::Degraded;
                    }
                }
                true
            }
            PumpOutcome::IoError(e) => {
                warn!("Connection lost: {}", e);
                self.status = ConnectionStatus::Disconnected;
                self.cache.clear();
                false
            }
            PumpOutcome::Stale => {
                if self.status == ConnectionStatus::Active {
                    warn!(
                        "No update for {} ticks, marking session degraded",
                        STALE_TICKS
                    );
                    self.status = ConnectionStatus::Degraded;
                }
                // Re-arm the watchdog so the next wait is a full window
                self.last_update = Instant::now();
                true
            }
        }
    }

    fn handle_packet(&mut self, packet: ServerPacket) {
        match packet {
            ServerPacket::Init {
                tick_interval_ms, ..
            } => {
                self.tick_interval = Duration::from_millis(tick_interval_ms.max(1));
                self.status = ConnectionStatus::Active;
                info!("Session ready, server ticks every {}ms", tick_interval_ms);
            }
            ServerPacket::Joined { player_id } => {
                self.player_id = Some(player_id);
                info!("Joined as entity {}", player_id);
            }
            ServerPacket::Update(update) => {
                self.last_tick = update.tick;
                self.cache.apply(&update);
            }
        }
    }
}
