//! TCP accept loop and per-connection reader/writer tasks.
//!
//! Network tasks never touch game state. Everything they learn is forwarded
//! to the simulation loop as a `ServerEvent`; everything they send comes out
//! of the connection's bounded outbound queue.

use crate::connection::{ConnectionId, OUTBOUND_QUEUE_CAP};
use log::{debug, error, info, warn};
use shared::framing::{read_frame, write_frame};
use shared::wire::{decode_client, encode_server};
use shared::{ClientPacket, ServerPacket};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Events forwarded from network tasks to the simulation loop.
#[derive(Debug)]
pub enum ServerEvent {
    Connected {
        conn: ConnectionId,
        addr: SocketAddr,
        outbound: mpsc::Sender<ServerPacket>,
    },
    Packet {
        conn: ConnectionId,
        packet: ClientPacket,
    },
    /// A frame arrived but did not decode to any known message.
    Malformed {
        conn: ConnectionId,
    },
    Disconnected {
        conn: ConnectionId,
    },
}

pub struct NetworkServer {
    listener: TcpListener,
    events_tx: mpsc::UnboundedSender<ServerEvent>,
    next_conn_id: Arc<AtomicU64>,
}

impl NetworkServer {
    pub async fn bind(
        addr: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServerEvent>), std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        info!("Server listening on {}", listener.local_addr()?);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok((
            Self {
                listener,
                events_tx,
                next_conn_id: Arc::new(AtomicU64::new(1)),
            },
            events_rx,
        ))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    /// Accepts connections until the event channel closes.
    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    let conn = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
                    debug!("Accepted {} as connection {}", addr, conn);
                    if spawn_connection(stream, addr, conn, self.events_tx.clone()).is_err() {
                        info!("Event channel closed, stopping accept loop");
                        break;
                    }
                }
                Err(e) => {
                    error!("Accept failed: {}", e);
                }
            }
        }
    }
}

fn spawn_connection(
    stream: TcpStream,
    addr: SocketAddr,
    conn: ConnectionId,
    events_tx: mpsc::UnboundedSender<ServerEvent>,
) -> Result<(), ()> {
    if stream.set_nodelay(true).is_err() {
        warn!("Could not set TCP_NODELAY for connection {}", conn);
    }
    let (reader, writer) = stream.into_split();
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAP);

    events_tx
        .send(ServerEvent::Connected {
            conn,
            addr,
            outbound: outbound_tx,
        })
        .map_err(|_| ())?;

    tokio::spawn(read_loop(reader, conn, events_tx));
    tokio::spawn(write_loop(writer, conn, outbound_rx));
    Ok(())
}

/// Reads frames until EOF or error, forwarding each decoded packet. Decode
/// failures are reported as `Malformed` so the loop can apply its fault
/// budget; the stream itself stays framed and usable.
async fn read_loop(
    mut reader: OwnedReadHalf,
    conn: ConnectionId,
    events_tx: mpsc::UnboundedSender<ServerEvent>,
) {
    loop {
        match read_frame(&mut reader).await {
            Ok(payload) => {
                let event = match decode_client(&payload) {
                    Ok(packet) => ServerEvent::Packet { conn, packet },
                    Err(e) => {
                        warn!("Connection {} sent undecodable frame: {}", conn, e);
                        ServerEvent::Malformed { conn }
                    }
                };
                if events_tx.send(event).is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!("Connection {} read ended: {}", conn, e);
                let _ = events_tx.send(ServerEvent::Disconnected { conn });
                return;
            }
        }
    }
}

/// Drains the outbound queue onto the socket. Ends when the queue's sender
/// side is dropped (connection removed) or the socket fails.
async fn write_loop(
    mut writer: OwnedWriteHalf,
    conn: ConnectionId,
    mut outbound_rx: mpsc::Receiver<ServerPacket>,
) {
    while let Some(packet) = outbound_rx.recv().await {
        let bytes = match encode_server(&packet) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Connection {} failed to encode packet: {}", conn, e);
                continue;
            }
        };
        if let Err(e) = write_frame(&mut writer, &bytes).await {
            debug!("Connection {} write ended: {}", conn, e);
            return;
        }
    }
}
