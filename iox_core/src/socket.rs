// Socket descriptor grammar: `[options '@'] proto['-l'] ':' addr`.
//
// `proto` is one of `tcp`, `udp`, or `proxy` (the last naming the control
// side of a reverse-proxy rendezvous). A trailing `-l` on the protocol name
// means "bind and listen" rather than "dial". `options` is zero or more of
// `s` (secret/encrypted), `c` (compress), `x` (multiplex) before an `@`.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use crate::error::DescriptorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Tcp,
    Udp,
    Proxy,
}

impl Proto {
    /// UDP is the only unreliable transport this build speaks; everything
    /// else (TCP, the proxy control channel) is reliable.
    pub fn is_reliable(self) -> bool {
        !matches!(self, Proto::Udp)
    }
}

#[derive(Debug, Clone)]
pub struct Descriptor {
    pub proto: Proto,
    pub is_listener: bool,
    pub secret: bool,
    pub compress: bool,
    pub multiplex: bool,
    pub addr: String,
    raw: String,
}

impl std::fmt::Display for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl Descriptor {
    pub fn parse(s: &str) -> Result<Self, DescriptorError> {
        let raw = s.to_string();
        let lower = s.to_ascii_lowercase();

        let (opts, rest) = match lower.find('@') {
            Some(idx) => (&lower[..idx], &lower[idx + 1..]),
            None => ("", lower.as_str()),
        };

        let mut secret = false;
        let mut compress = false;
        let mut multiplex = false;
        for c in opts.chars() {
            match c {
                's' => secret = true,
                'c' => compress = true,
                'x' => multiplex = true,
                other => return Err(DescriptorError::UnknownOption(other)),
            }
        }

        let colon = rest
            .find(':')
            .ok_or_else(|| DescriptorError::Malformed(raw.clone()))?;
        let proto_part = &rest[..colon];
        let mut addr = rest[colon + 1..].to_string();
        if addr.is_empty() {
            return Err(DescriptorError::Malformed(raw));
        }
        if !addr.contains(':') {
            addr = format!(":{addr}");
        }

        let (proto_name, is_listener) = match proto_part.strip_suffix("-l") {
            Some(stripped) => (stripped, true),
            None => (proto_part, false),
        };

        let proto = match proto_name {
            "tcp" => Proto::Tcp,
            "udp" => Proto::Udp,
            "proxy" => Proto::Proxy,
            other => return Err(DescriptorError::UnsupportedProtocol(other.to_string())),
        };

        Ok(Self {
            proto,
            is_listener,
            secret,
            compress,
            multiplex,
            addr,
            raw,
        })
    }

    pub fn is_proto_reliable(&self) -> bool {
        self.proto.is_reliable()
    }

    pub fn is_proxy_proto(&self) -> bool {
        matches!(self.proto, Proto::Proxy)
    }

    /// Binds a TCP listener for this descriptor's address.
    pub fn get_listener(&self) -> Result<TcpListener, DescriptorError> {
        let addr = normalize_bind_addr(&self.addr)?;
        Ok(TcpListener::bind(addr)?)
    }

    /// Dials a TCP connection to this descriptor's address.
    pub fn get_conn(&self, timeout: Duration) -> Result<TcpStream, DescriptorError> {
        let addr = resolve_one(&self.addr)?;
        Ok(TcpStream::connect_timeout(&addr, timeout)?)
    }

    /// Binds (listener) or dials (non-listener) a UDP socket for this
    /// descriptor's address. A dialed UDP socket is connected to its peer;
    /// a bound one is left unconnected so it can serve arbitrary senders.
    pub fn get_udp_conn(&self) -> Result<UdpSocket, DescriptorError> {
        if self.is_listener {
            let addr = normalize_bind_addr(&self.addr)?;
            Ok(UdpSocket::bind(addr)?)
        } else {
            let sock = UdpSocket::bind("0.0.0.0:0")?;
            let addr = resolve_one(&self.addr)?;
            sock.connect(addr)?;
            Ok(sock)
        }
    }

    /// Accepts one underlying connection and wraps it in a server-side
    /// `StreamMuxer` so a caller can `accept()` further streams out of it
    /// instead of calling `get_listener` again per stream. Callers check
    /// `self.multiplex` before reaching for this instead of `get_listener`.
    pub fn accept_muxed(&self) -> Result<Box<dyn StreamMuxer>, DescriptorError> {
        let listener = self.get_listener()?;
        let (conn, _) = listener.accept()?;
        Ok(Box::new(PassthroughMuxer::new(conn)))
    }

    /// Dials one underlying connection and wraps it in a client-side
    /// `StreamMuxer` so a caller can `open()` further streams out of it on
    /// demand instead of dialing a fresh TCP connection per stream. Callers
    /// check `self.multiplex` before reaching for this instead of `get_conn`.
    pub fn dial_muxed(&self, timeout: Duration) -> Result<Box<dyn StreamMuxer>, DescriptorError> {
        let conn = self.get_conn(timeout)?;
        Ok(Box::new(PassthroughMuxer::new(conn)))
    }
}

fn normalize_bind_addr(addr: &str) -> Result<SocketAddr, DescriptorError> {
    if let Some(port_str) = addr.strip_prefix(':') {
        if !port_str.contains(':') {
            let port: u16 = port_str
                .parse()
                .map_err(|_| DescriptorError::Malformed(addr.to_string()))?;
            return Ok(SocketAddr::new(
                std::net::IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
                port,
            ));
        }
    }
    Ok(addr.parse()?)
}

fn resolve_one(addr: &str) -> Result<SocketAddr, DescriptorError> {
    addr.to_socket_addrs()?
        .next()
        .ok_or_else(|| DescriptorError::NoAddr(addr.to_string()))
}

/// Classifies the result of one `Listener::accept` call so the accept loop
/// can tell a transient per-connection error from a listener that is gone
/// for good, instead of matching on error-kind strings.
pub enum AcceptOutcome<T> {
    New(T),
    Closed,
    Transient(io::Error),
}

pub fn classify_tcp_accept(result: io::Result<(TcpStream, SocketAddr)>) -> AcceptOutcome<(TcpStream, SocketAddr)> {
    match result {
        Ok(pair) => AcceptOutcome::New(pair),
        Err(e) => match e.kind() {
            io::ErrorKind::NotConnected | io::ErrorKind::BrokenPipe => AcceptOutcome::Closed,
            _ => AcceptOutcome::Transient(e),
        },
    }
}

/// A narrow stream-multiplexing interface. Only a trivial pass-through
/// implementation ships with this crate: wiring a real multiplexer (e.g.
/// `yamux`) behind the same trait is future work.
pub trait StreamMuxer: Send {
    fn accept(&mut self) -> io::Result<TcpStream>;
    fn open(&mut self) -> io::Result<TcpStream>;
}

/// A `StreamMuxer` that hands back the single underlying connection it was
/// built from exactly once in either direction, then reports the stream
/// exhausted. Enough to exercise the `x` descriptor option end-to-end
/// without a real multiplexing wire protocol.
pub struct PassthroughMuxer {
    conn: Option<TcpStream>,
}

impl PassthroughMuxer {
    pub fn new(conn: TcpStream) -> Self {
        Self { conn: Some(conn) }
    }
}

impl StreamMuxer for PassthroughMuxer {
    fn accept(&mut self) -> io::Result<TcpStream> {
        self.conn
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "passthrough stream exhausted"))
    }

    fn open(&mut self) -> io::Result<TcpStream> {
        self.accept()
    }
}
