// iox_core is the library implementing the iox relay protocol shared logic.

use std::io;
use std::net::AddrParseError;

use thiserror::Error;

/// A `DescriptorError` indicates a failure to parse or resolve a socket descriptor.
#[derive(Debug, Error)]
pub enum DescriptorError {
    /// The descriptor does not match the `[options '@'] proto['-l'] ':' addr` grammar.
    #[error("invalid socket descriptor \"{0}\"")]
    Malformed(String),
    /// An option character other than `s`, `c`, `x` was used.
    #[error("unknown descriptor option '{0}'")]
    UnknownOption(char),
    /// The protocol name is not one this build supports.
    #[error("unsupported protocol \"{0}\"")]
    UnsupportedProtocol(String),
    /// A `fwd` pairs a reliable endpoint with an unreliable one.
    #[error("cannot forward between a reliable and an unreliable endpoint")]
    ProtocolMismatch,
    /// Encryption was requested (`s` option) without a `-k` key.
    #[error("encryption enabled for a descriptor but no key was provided")]
    MissingKey,
    /// An R2R datagram pair has encryption enabled on exactly one side.
    /// Since every encrypted datagram this crate produces always carries its
    /// IV, a one-sided-encrypted pair could never decrypt correctly; reject
    /// it up front rather than failing silently at the first packet.
    #[error("both sides of a datagram forward must agree on encryption")]
    OneSidedEncryptedDatagram,
    /// A raw key argument was not valid hexadecimal.
    #[error("key must be a hexadecimal string: {0}")]
    InvalidHex(#[from] hex::FromHexError),
    /// Failed to parse a network address.
    #[error("invalid network address: {0}")]
    Addr(#[from] AddrParseError),
    /// No address could be resolved for a descriptor.
    #[error("no address resolved for \"{0}\"")]
    NoAddr(String),
    /// An `std::io::Error` occured while binding or dialing.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// A `NetworkError` indicates a failure on a pipe, context, or control channel.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// An `std::io::Error` occured on the underlying socket.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// The destination accepted fewer bytes than were read from the source.
    #[error("short write: wrote {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },
    /// A control frame could not be resynchronized onto its 4-byte boundary.
    #[error("control channel framing error")]
    Framing,
    /// The remote side sent an unexpected handshake tag.
    #[error("unexpected handshake tag {0:#x}")]
    IllegalHandshake(u8),
    /// The control channel was closed before a graceful CLEANUP was seen.
    #[error("control channel closed unexpectedly")]
    ControlClosed,
}

/// A `Socks5Error` indicates a failure in the SOCKS5 handshake or CONNECT request.
#[derive(Debug, Error)]
pub enum Socks5Error {
    /// The client's declared protocol version was not 5.
    #[error("unsupported SOCKS version {0:#x}, only version 5 is supported")]
    UnsupportedVersion(u8),
    /// The CONNECT request used a command other than CONNECT (1).
    #[error("unsupported command {0:#x}, only CONNECT is supported")]
    UnsupportedCommand(u8),
    /// The CONNECT request used an address type other than IPv4, domain, or IPv6.
    #[error("unsupported address type {0:#x}")]
    UnsupportedAddrType(u8),
    /// A domain name was not valid UTF-8.
    #[error("domain name is not valid UTF-8")]
    InvalidDomain,
    /// The client sent bytes beyond the declared method list or request
    /// header before the server replied.
    #[error("unexpected extra data during SOCKS5 negotiation")]
    UnexpectedExtraData,
    /// An `std::io::Error` occured while reading or writing the handshake.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// A combined error type for the relay engine's public entry points.
#[derive(Debug, Error)]
pub enum Error {
    /// A descriptor failed to parse or resolve.
    #[error("descriptor error: {0}")]
    Descriptor(#[from] DescriptorError),
    /// A network or pipe-level error occured.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),
    /// A SOCKS5 handshake or request error occured.
    #[error("socks5 error: {0}")]
    Socks5(#[from] Socks5Error),
    /// An `std::io::Error` occured directly (not yet classified).
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
