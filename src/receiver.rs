//! Background receiver: blocking reads, packet dispatch, protocol replies.
//!
//! One thread per connection. It announces our protocol version, then reads
//! 8-byte packets until the peer goes away, forwarding sync payloads to the
//! tick loop through the single producer/consumer queue and answering
//! handshake traffic in place.

use std::io::Read;
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::Sender;
use log::{debug, error, info, warn};

use crate::clock::LinkClock;
use crate::connection::{ConnectionRole, LinkConnection};
use crate::error::LinkError;
use crate::packet::{CMD_SYNC1, CMD_SYNC2, PACKET_SIZE, PROTOCOL_VERSION, Packet, PacketKind};
use crate::serial::Registers;

/// Items forwarded from the receiver thread to the tick loop. `Shutdown` is
/// pushed exactly once, when the loop exits, so a tick blocked on the queue
/// observes teardown instead of hanging.
pub(crate) enum Incoming {
    Data { byte: u8, timestamp: u32 },
    Shutdown,
}

pub(crate) struct Receiver {
    connection: LinkConnection,
    regs: Arc<Registers>,
    clock: Arc<LinkClock>,
    tx: Sender<Incoming>,
    /// Set by the tick loop after it sends a sync packet; tells us the next
    /// incoming sync is the answer to our own transfer, which must not be
    /// answered again or the two sides bounce packets forever.
    awaiting_reply: Arc<AtomicBool>,
    version_acknowledged: bool,
    finished: bool,
}

impl Receiver {
    pub(crate) fn new(
        connection: LinkConnection,
        regs: Arc<Registers>,
        clock: Arc<LinkClock>,
        tx: Sender<Incoming>,
        awaiting_reply: Arc<AtomicBool>,
    ) -> Self {
        Self {
            connection,
            regs,
            clock,
            tx,
            awaiting_reply,
            version_acknowledged: false,
            finished: false,
        }
    }

    pub(crate) fn run(mut self, stream: TcpStream) {
        match self.run_loop(stream) {
            Ok(()) => {}
            Err(err @ LinkError::ConnectionTerminated) => info!("{err}"),
            Err(err) => error!("closing link: {err}"),
        }
        self.shut_down();
    }

    fn run_loop(&mut self, mut stream: TcpStream) -> Result<(), LinkError> {
        self.connection
            .send(&Packet::version())
            .map_err(|_| LinkError::ConnectionTerminated)?;

        let mut buf = [0u8; PACKET_SIZE];
        while !self.finished {
            stream
                .read_exact(&mut buf)
                .map_err(|_| LinkError::ConnectionTerminated)?;
            let packet = Packet::from_bytes(&buf);
            // Every packet refreshes the pacing clock, recognized or not.
            self.clock.record_remote(packet.timestamp);

            if let Some(reply) = self.handle(packet)? {
                self.connection
                    .send(&reply)
                    .map_err(|_| LinkError::ConnectionTerminated)?;
            }
        }
        Ok(())
    }

    fn shut_down(&mut self) {
        self.connection.close();
        let _ = self.tx.send(Incoming::Shutdown);
    }

    fn handle(&mut self, packet: Packet) -> Result<Option<Packet>, LinkError> {
        match packet.kind() {
            PacketKind::Version => self.handle_version(packet),
            PacketKind::JoypadUpdate => Ok(None),
            PacketKind::Sync1 | PacketKind::Sync2 => Ok(self.handle_sync(packet)),
            PacketKind::Sync3 => Ok(Some(Packet::sync3_echo(
                packet.b2,
                packet.b3,
                packet.b4,
                self.clock.local(),
            ))),
            PacketKind::Status => Ok(Some(self.handle_status(packet))),
            PacketKind::WantDisconnect => {
                info!("link peer requested disconnect");
                self.finished = true;
                Ok(None)
            }
            PacketKind::Unknown(raw) => {
                warn!("ignoring unknown link packet kind {raw}");
                Ok(None)
            }
        }
    }

    fn handle_version(&mut self, packet: Packet) -> Result<Option<Packet>, LinkError> {
        let got = (packet.b2, packet.b3, packet.b4);
        info!("link peer speaks BGB protocol {}.{}.{}", got.0, got.1, got.2);
        if got != PROTOCOL_VERSION {
            return Err(LinkError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got,
            });
        }
        if self.version_acknowledged {
            return Ok(None);
        }
        self.version_acknowledged = true;
        Ok(Some(Packet::status(self.clock.local())))
    }

    /// Data packet from the peer. The payload and its timestamp always go to
    /// the tick loop. We answer with our own outgoing bit unless this packet
    /// is itself the answer to a sync we sent.
    fn handle_sync(&mut self, packet: Packet) -> Option<Packet> {
        let outgoing_bit = self.regs.sb() >> 7;
        let _ = self.tx.send(Incoming::Data {
            byte: packet.b2,
            timestamp: packet.timestamp,
        });

        if self.awaiting_reply.swap(false, Ordering::AcqRel) {
            return None;
        }
        let kind = match self.connection.role() {
            ConnectionRole::Master => CMD_SYNC1,
            _ => CMD_SYNC2,
        };
        Some(Packet::sync(
            kind,
            outgoing_bit,
            self.regs.sc(),
            self.clock.local(),
        ))
    }

    fn handle_status(&mut self, packet: Packet) -> Packet {
        debug!(
            "link peer status: running={} paused={} supports_reconnect={}",
            packet.b2 & 1 != 0,
            packet.b2 & 2 != 0,
            packet.b2 & 4 != 0,
        );
        // The protocol doc says not to answer status with status, but peers
        // drop the link without it.
        Packet::status(self.clock.local())
    }
}
