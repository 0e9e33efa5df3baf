//! Game Boy link cable emulation over the BGB network protocol.
//!
//! Two emulator instances (or an emulator and BGB itself) exchange serial
//! data one bit per hardware clock window across a TCP connection, paced by
//! 31-bit timestamps embedded in every packet. The emulator's main loop
//! drives [`serial::SerialLink::tick`]; a background thread owns the
//! blocking network reads. See <https://bgb.bircd.org/bgblink.html> for the
//! protocol.

/// Wrapping timestamp clock pacing the two peers.
pub mod clock;

/// Power-on configuration for the link cable.
pub mod config;

/// TCP connection establishment and the serialized send path.
pub mod connection;

/// Error types.
pub mod error;

/// Fixed 8-byte packet encode/decode.
pub mod packet;

/// Background receiver thread and protocol packet handlers.
mod receiver;

/// Serial registers and the cycle-accurate transfer scheduler.
pub mod serial;
