use thiserror::Error;

/// Errors raised by the link cable core.
///
/// None of these are allowed to take the host process down. The soft ones
/// (bad address, peer gone) degrade the serial device to its disconnected
/// state, where SB reads 0xFF and no interrupts are requested.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// The peer address was not an IPv4 literal of the form `x.y.z.w:port`.
    #[error("peer address must be an IPv4 literal of the form x.y.z.w:port")]
    AddressFormat,

    /// The peer speaks a different protocol revision than we do.
    #[error("BGB protocol version mismatch: expected {expected:?}, got {got:?}")]
    VersionMismatch {
        expected: (u8, u8, u8),
        got: (u8, u8, u8),
    },

    /// The peer closed or reset the connection.
    #[error("link connection terminated by peer")]
    ConnectionTerminated,

    /// A wire packet was not exactly 8 bytes long.
    #[error("link packet must be exactly 8 bytes, got {len}")]
    MalformedPacket { len: usize },

    /// A serialized serial-port state blob had the wrong size.
    #[error("serial save state must be 6 bytes, got {len}")]
    MalformedSaveState { len: usize },
}
