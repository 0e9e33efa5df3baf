//! Serial registers and the cycle-driven transfer state machine.
//!
//! The CPU loop calls [`SerialLink::tick`] with the cycles it just executed.
//! Once enough cycles accumulate for the next bit, the scheduler sends our
//! outgoing bit (when SC bit 7 says we drive the clock), then waits for the
//! matching bit from the peer on the queue fed by the receiver thread. Eight
//! bits make one transfer; completion clears SC bit 7 and tells the caller to
//! raise the serial interrupt.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver as QueueReceiver, RecvTimeoutError, unbounded};
use log::{info, warn};

use crate::clock::LinkClock;
use crate::config::LinkConfig;
use crate::connection::{ConnectionRole, LinkConnection, parse_peer_address};
use crate::error::LinkError;
use crate::packet::{CMD_SYNC1, CMD_SYNC2, Packet};
use crate::receiver::{Incoming, Receiver};

/// Emulated CPU frequency in Hz.
pub const CPU_FREQ: u32 = 4_213_440;
/// Serial shift clock in Hz.
pub const SERIAL_FREQ: u32 = 8192;
/// Cycles between bits while this side drives the clock.
pub const CYCLES_PER_BIT: u32 = CPU_FREQ / SERIAL_FREQ;

/// Threshold while externally clocked: large enough that we poll the queue
/// at a leisurely pace and never originate a send of our own.
const EXTERNAL_CLOCK_THRESHOLD: u32 = 1 << 16;

/// An open link line reads all ones.
const SB_DISCONNECTED: u8 = 0xFF;

const SAVE_STATE_LEN: usize = 6;

/// What a single tick accomplished. On `Completed` the caller must raise
/// the serial interrupt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferOutcome {
    None,
    Completed,
}

/// The SB/SC register pair, shared with the receiver thread, which samples
/// both when building sync replies.
#[derive(Debug, Default)]
pub struct Registers {
    sb: AtomicU8,
    sc: AtomicU8,
}

impl Registers {
    pub fn sb(&self) -> u8 {
        self.sb.load(Ordering::Acquire)
    }

    pub fn set_sb(&self, value: u8) {
        self.sb.store(value, Ordering::Release);
    }

    pub fn sc(&self) -> u8 {
        self.sc.load(Ordering::Acquire)
    }

    pub fn set_sc(&self, value: u8) {
        self.sc.store(value, Ordering::Release);
    }
}

struct ActiveLink {
    connection: LinkConnection,
    rx: QueueReceiver<Incoming>,
    receiver: Option<JoinHandle<()>>,
}

/// Game Boy link cable emulation.
pub struct SerialLink {
    regs: Arc<Registers>,
    clock: Arc<LinkClock>,
    awaiting_reply: Arc<AtomicBool>,
    link: Option<ActiveLink>,
    trans_bits: u8,
    cycles_count: u32,
    ts_cycles: u32,
    transfer_timeout: Option<Duration>,
    interrupt_based: bool,
}

impl SerialLink {
    /// Creates the serial device at power-on. A missing, malformed, or
    /// unreachable peer address never fails machine startup; it leaves the
    /// device permanently disconnected instead.
    pub fn new(config: &LinkConfig) -> Self {
        let Some(addr_text) = config.peer_address.as_deref() else {
            info!("no peer address supplied, link cable emulation disabled");
            return Self::disabled(config);
        };
        let addr = match parse_peer_address(addr_text) {
            Ok(addr) => addr,
            Err(err) => {
                warn!("{err}; link cable emulation disabled");
                return Self::disabled(config);
            }
        };
        let result = if config.bind_as_server {
            LinkConnection::bind_and_accept(addr)
        } else {
            LinkConnection::connect(addr)
        };
        match result {
            Ok(connection) => Self::with_connection(&connection, config),
            Err(e) => {
                warn!("link connection to {addr} failed: {e}; link cable emulation disabled");
                Self::disabled(config)
            }
        }
    }

    /// Wraps an established connection. For frontends (and tests) that do
    /// their own socket setup.
    pub fn with_connection(connection: &LinkConnection, config: &LinkConfig) -> Self {
        let mut link = Self::disabled(config);

        let reader = match connection.reader() {
            Ok(reader) => reader,
            Err(e) => {
                warn!("failed to clone link stream: {e}; link cable emulation disabled");
                return link;
            }
        };

        let (tx, rx) = unbounded();
        let receiver = Receiver::new(
            connection.clone(),
            Arc::clone(&link.regs),
            Arc::clone(&link.clock),
            tx,
            Arc::clone(&link.awaiting_reply),
        );
        let handle = thread::Builder::new()
            .name("gblink-receiver".into())
            .spawn(move || receiver.run(reader));
        match handle {
            Ok(handle) => {
                link.link = Some(ActiveLink {
                    connection: connection.clone(),
                    rx,
                    receiver: Some(handle),
                });
            }
            Err(e) => {
                warn!("failed to spawn link receiver: {e}; link cable emulation disabled");
                connection.close();
            }
        }
        link
    }

    fn disabled(config: &LinkConfig) -> Self {
        Self {
            regs: Arc::new(Registers::default()),
            clock: Arc::new(LinkClock::new()),
            awaiting_reply: Arc::new(AtomicBool::new(false)),
            link: None,
            trans_bits: 0,
            cycles_count: 0,
            ts_cycles: 0,
            transfer_timeout: config.transfer_timeout(),
            interrupt_based: config.interrupt_based,
        }
    }

    /// Advances the serial unit by `cycles` executed CPU cycles.
    pub fn tick(&mut self, cycles: u32) -> TransferOutcome {
        if self.link.is_none() {
            self.regs.set_sb(SB_DISCONNECTED);
            return TransferOutcome::None;
        }

        self.cycles_count = self.cycles_count.saturating_add(cycles);
        self.clock.advance(&mut self.ts_cycles, cycles);

        if self.cycles_count < self.bit_threshold() {
            return TransferOutcome::None;
        }
        // Pacing gate: our clock ran past the peer's. Keep the accumulated
        // cycles and retry once a newer packet raises the peer timestamp.
        if !self.clock.transfer_allowed() {
            return TransferOutcome::None;
        }

        if self.regs.sc() & 0x80 != 0 && !self.send_sync_packet() {
            return TransferOutcome::None;
        }

        let Some((byte, _timestamp)) = self.consume_incoming() else {
            return TransferOutcome::None;
        };

        self.regs.set_sb((self.regs.sb() << 1) | (byte & 0x01));
        self.trans_bits += 1;
        self.cycles_count = 0;

        if self.trans_bits == 8 {
            self.trans_bits = 0;
            self.regs.set_sc(self.regs.sc() & 0x7F);
            return TransferOutcome::Completed;
        }
        TransferOutcome::None
    }

    fn bit_threshold(&self) -> u32 {
        if self.link.is_some() && self.regs.sc() & 0x80 != 0 {
            CYCLES_PER_BIT
        } else {
            EXTERNAL_CLOCK_THRESHOLD
        }
    }

    /// Sends our outgoing bit for this exchange and flags the receiver so it
    /// treats the peer's next sync as the answer rather than a new request.
    fn send_sync_packet(&mut self) -> bool {
        let sent = match &self.link {
            Some(active) => {
                let kind = match active.connection.role() {
                    ConnectionRole::Master => CMD_SYNC1,
                    _ => CMD_SYNC2,
                };
                let packet = Packet::sync(
                    kind,
                    self.regs.sb() >> 7,
                    self.regs.sc(),
                    self.clock.local(),
                );
                self.awaiting_reply.store(true, Ordering::Release);
                active.connection.send(&packet).is_ok()
            }
            None => false,
        };
        if !sent {
            warn!("failed to send sync packet, disabling link");
            self.awaiting_reply.store(false, Ordering::Release);
            self.disconnect();
        }
        sent
    }

    /// The cross-thread synchronization point: waits for exactly one
    /// (byte, timestamp) pair from the receiver. Without a configured
    /// timeout this blocks for as long as the peer stays silent, exactly
    /// like the reference protocol.
    fn consume_incoming(&mut self) -> Option<(u8, u32)> {
        let result = match &self.link {
            None => return None,
            Some(active) => match self.transfer_timeout {
                Some(timeout) => active.rx.recv_timeout(timeout),
                None => active.rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            },
        };
        match result {
            Ok(Incoming::Data { byte, timestamp }) => Some((byte, timestamp)),
            Ok(Incoming::Shutdown) => {
                info!("link peer disconnected, disabling link");
                self.disconnect();
                None
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "no link data within {:?}, disabling link",
                    self.transfer_timeout
                );
                self.disconnect();
                None
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.disconnect();
                None
            }
        }
    }

    /// Tears the link down: closes the socket (which unblocks the receiver's
    /// read) and joins the receiver thread. Idempotent; no reconnect.
    pub fn disconnect(&mut self) {
        if let Some(mut active) = self.link.take() {
            active.connection.close();
            if let Some(handle) = active.receiver.take() {
                let _ = handle.join();
            }
            self.regs.set_sb(SB_DISCONNECTED);
        }
    }

    pub fn role(&self) -> ConnectionRole {
        self.link
            .as_ref()
            .map(|active| active.connection.role())
            .unwrap_or(ConnectionRole::Disabled)
    }

    pub fn is_connected(&self) -> bool {
        self.link
            .as_ref()
            .is_some_and(|active| active.connection.is_connected())
    }

    pub fn interrupt_based(&self) -> bool {
        self.interrupt_based
    }

    pub fn sb(&self) -> u8 {
        self.regs.sb()
    }

    pub fn set_sb(&mut self, value: u8) {
        self.regs.set_sb(value);
    }

    pub fn sc(&self) -> u8 {
        self.regs.sc()
    }

    pub fn set_sc(&mut self, value: u8) {
        self.regs.set_sc(value);
    }

    pub fn local_timestamp(&self) -> u32 {
        self.clock.local()
    }

    /// Persists the machine-visible serial state: SB, SC, and the local
    /// timestamp. Transfer progress is not saved; save points sit between
    /// transfers.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SAVE_STATE_LEN);
        out.push(self.regs.sb());
        out.push(self.regs.sc());
        out.extend_from_slice(&self.clock.local().to_le_bytes());
        out
    }

    pub fn deserialize(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        if bytes.len() != SAVE_STATE_LEN {
            return Err(LinkError::MalformedSaveState { len: bytes.len() });
        }
        self.regs.set_sb(bytes[0]);
        self.regs.set_sc(bytes[1]);
        self.clock
            .restore_local(u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]));
        self.trans_bits = 0;
        self.cycles_count = 0;
        self.ts_cycles = 0;
        Ok(())
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TIMESTAMP_WINDOW;
    use std::net::{TcpListener, TcpStream};

    fn disabled_link() -> SerialLink {
        SerialLink::new(&LinkConfig::default())
    }

    /// A link wired to a silent peer socket. Returns the peer's end so the
    /// test controls what, if anything, ever arrives.
    fn linked_pair(role: ConnectionRole) -> (SerialLink, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let ours = TcpStream::connect(addr).unwrap();
        let (theirs, _) = listener.accept().unwrap();

        let connection = LinkConnection::from_stream(ours, role).unwrap();
        let link = SerialLink::with_connection(&connection, &LinkConfig::default());
        (link, theirs)
    }

    #[test]
    fn cycles_per_bit_matches_reference_constants() {
        assert_eq!(CYCLES_PER_BIT, 514);
    }

    #[test]
    fn disabled_device_pins_sb_and_never_transfers() {
        let mut link = disabled_link();
        link.set_sb(0x12);
        link.set_sc(0x81);
        for cycles in [1, 514, 65536, 1 << 21] {
            assert_eq!(link.tick(cycles), TransferOutcome::None);
            assert_eq!(link.sb(), 0xFF);
        }
        assert_eq!(link.role(), ConnectionRole::Disabled);
        assert!(!link.is_connected());
    }

    #[test]
    fn tick_below_threshold_accumulates_without_transfer() {
        let (mut link, _peer) = linked_pair(ConnectionRole::Master);
        link.set_sc(0x81);
        assert_eq!(link.tick(CYCLES_PER_BIT - 1), TransferOutcome::None);
        assert_eq!(link.cycles_count, CYCLES_PER_BIT - 1);
    }

    #[test]
    fn gate_defers_without_consuming_or_resetting_cycles() {
        let (mut link, _peer) = linked_pair(ConnectionRole::Master);
        // Advance the local clock one full window: local=1, peer still 0.
        // The threshold is long reached, but the gate must hold the transfer
        // without blocking on the (empty) queue.
        assert_eq!(link.tick(TIMESTAMP_WINDOW), TransferOutcome::None);
        assert_eq!(link.local_timestamp(), 1);
        assert_eq!(link.cycles_count, TIMESTAMP_WINDOW);
        assert!(link.is_connected());
    }

    #[test]
    fn timeout_degrades_to_disconnected_instead_of_blocking() {
        let (mut link, _peer) = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let addr = listener.local_addr().unwrap();
            let ours = TcpStream::connect(addr).unwrap();
            let (theirs, _) = listener.accept().unwrap();

            let connection = LinkConnection::from_stream(ours, ConnectionRole::Master).unwrap();
            let config = LinkConfig {
                transfer_timeout_ms: Some(50),
                ..LinkConfig::default()
            };
            (SerialLink::with_connection(&connection, &config), theirs)
        };
        link.set_sb(0xA5);
        link.set_sc(0x81);

        // The peer never answers the sync packet.
        assert_eq!(link.tick(CYCLES_PER_BIT), TransferOutcome::None);
        assert_eq!(link.role(), ConnectionRole::Disabled);
        assert_eq!(link.sb(), 0xFF);
        // Later ticks are plain no-ops.
        assert_eq!(link.tick(CYCLES_PER_BIT), TransferOutcome::None);
    }

    #[test]
    fn save_state_round_trips() {
        let mut link = disabled_link();
        link.set_sb(0x3C);
        link.set_sc(0x01);
        let mut acc = 0;
        link.clock.advance(&mut acc, TIMESTAMP_WINDOW * 3);
        let blob = link.serialize();

        let mut restored = disabled_link();
        restored.deserialize(&blob).unwrap();
        assert_eq!(restored.sb(), 0x3C);
        assert_eq!(restored.sc(), 0x01);
        assert_eq!(restored.local_timestamp(), 3);
    }

    #[test]
    fn deserialize_rejects_wrong_length() {
        let mut link = disabled_link();
        assert_eq!(
            link.deserialize(&[0u8; 5]),
            Err(LinkError::MalformedSaveState { len: 5 })
        );
    }
}
