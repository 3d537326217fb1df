// A minimal SOCKS5 server (RFC 1928): no-auth only, CONNECT command only.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use crate::ctx::{new_stream_ctx, Ctx};
use crate::error::Socks5Error;
use crate::log;
use crate::pipe;
use crate::pool::BufferPool;

const VERSION: u8 = 5;
const CMD_CONNECT: u8 = 1;
const ATYP_IPV4: u8 = 1;
const ATYP_DOMAIN: u8 = 3;
const ATYP_IPV6: u8 = 4;

#[derive(Debug, Clone)]
pub enum Target {
    Ipv4(Ipv4Addr, u16),
    Ipv6(Ipv6Addr, u16),
    Domain(String, u16),
}

impl Target {
    pub fn to_host_port(&self) -> String {
        match self {
            Target::Ipv4(ip, port) => format!("{ip}:{port}"),
            Target::Ipv6(ip, port) => format!("{ip}:{port}"),
            Target::Domain(host, port) => format!("{host}:{port}"),
        }
    }
}

fn read_exact_ctx(ctx: &dyn Ctx, buf: &mut [u8]) -> io::Result<()> {
    let mut total = 0;
    while total < buf.len() {
        let n = ctx.read(&mut buf[total..])?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed mid-handshake"));
        }
        total += n;
    }
    Ok(())
}

/// Negotiates the no-auth method and acknowledges it, per RFC 1928 §3.
pub fn handshake(ctx: &dyn Ctx) -> Result<(), Socks5Error> {
    let mut header = [0u8; 2];
    read_exact_ctx(ctx, &mut header)?;
    if header[0] != VERSION {
        return Err(Socks5Error::UnsupportedVersion(header[0]));
    }
    let nmethods = header[1] as usize;
    let mut methods = vec![0u8; nmethods];
    read_exact_ctx(ctx, &mut methods)?;
    if ctx.has_pending()? {
        return Err(Socks5Error::UnexpectedExtraData);
    }
    ctx.write(&[VERSION, 0x00])?;
    Ok(())
}

/// Parses a CONNECT request's target address, per RFC 1928 §4.
pub fn parse_request(ctx: &dyn Ctx) -> Result<Target, Socks5Error> {
    let mut header = [0u8; 4];
    read_exact_ctx(ctx, &mut header)?;
    let (ver, cmd, _rsv, atyp) = (header[0], header[1], header[2], header[3]);

    if ver != VERSION {
        return Err(Socks5Error::UnsupportedVersion(ver));
    }
    if cmd != CMD_CONNECT {
        return Err(Socks5Error::UnsupportedCommand(cmd));
    }

    let target = match atyp {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            read_exact_ctx(ctx, &mut addr)?;
            let mut port = [0u8; 2];
            read_exact_ctx(ctx, &mut port)?;
            Target::Ipv4(Ipv4Addr::from(addr), u16::from_be_bytes(port))
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            read_exact_ctx(ctx, &mut addr)?;
            let mut port = [0u8; 2];
            read_exact_ctx(ctx, &mut port)?;
            Target::Ipv6(Ipv6Addr::from(addr), u16::from_be_bytes(port))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            read_exact_ctx(ctx, &mut len)?;
            let mut domain = vec![0u8; len[0] as usize];
            read_exact_ctx(ctx, &mut domain)?;
            let mut port = [0u8; 2];
            read_exact_ctx(ctx, &mut port)?;
            let domain = String::from_utf8(domain).map_err(|_| Socks5Error::InvalidDomain)?;
            Target::Domain(domain, u16::from_be_bytes(port))
        }
        other => return Err(Socks5Error::UnsupportedAddrType(other)),
    };

    if ctx.has_pending()? {
        return Err(Socks5Error::UnexpectedExtraData);
    }

    Ok(target)
}

fn success_reply(local: Option<std::net::SocketAddr>) -> Vec<u8> {
    let mut rep = vec![VERSION, 0x00, 0x00];
    match local {
        Some(std::net::SocketAddr::V4(a)) => {
            rep.push(ATYP_IPV4);
            rep.extend_from_slice(&a.ip().octets());
            rep.extend_from_slice(&a.port().to_be_bytes());
        }
        Some(std::net::SocketAddr::V6(a)) => {
            rep.push(ATYP_IPV6);
            rep.extend_from_slice(&a.ip().octets());
            rep.extend_from_slice(&a.port().to_be_bytes());
        }
        None => {
            rep.push(ATYP_IPV4);
            rep.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        }
    }
    rep
}

/// `[5, 0x05 (connection refused), 0, 1, 0.0.0.0, 0]` — sent when the
/// upstream dial fails, so the client learns the CONNECT failed instead of
/// the connection simply dying with no reply.
fn failure_reply(ctx: &dyn Ctx) {
    let _ = ctx.write(&[VERSION, 0x05, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0]);
}

/// Runs the full handshake, CONNECT dial, and bidirectional pipe for one
/// accepted SOCKS5 client. Errors are logged and the connection is dropped;
/// this never propagates past the connection boundary.
pub fn handle_connection(ctx: Arc<dyn Ctx>, timeout: Duration, pool: Arc<BufferPool>) {
    if let Err(e) = handshake(ctx.as_ref()) {
        log::warn(&format!("socks5 handshake failed: {e}"));
        return;
    }

    let target = match parse_request(ctx.as_ref()) {
        Ok(t) => t,
        Err(e) => {
            log::warn(&format!("socks5 request parse failed: {e}"));
            failure_reply(ctx.as_ref());
            return;
        }
    };

    let host_port = target.to_host_port();
    let addr = match host_port.to_socket_addrs().ok().and_then(|mut it| it.next()) {
        Some(addr) => addr,
        None => {
            log::warn(&format!("socks5 target did not resolve: {host_port}"));
            failure_reply(ctx.as_ref());
            return;
        }
    };

    let upstream = match TcpStream::connect_timeout(&addr, timeout) {
        Ok(conn) => conn,
        Err(e) => {
            log::warn(&format!("socks5 upstream dial to {host_port} failed: {e}"));
            failure_reply(ctx.as_ref());
            return;
        }
    };

    let local_addr = upstream.local_addr().ok();
    if ctx.write(&success_reply(local_addr)).is_err() {
        return;
    }

    let upstream_ctx: Arc<dyn Ctx> = match new_stream_ctx(upstream, false, None) {
        Ok(s) => Arc::new(s),
        Err(_) => return,
    };

    let _ = pipe::pipe(ctx, upstream_ctx, pool);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctx::StreamCtx;
    use std::net::TcpListener;
    use std::thread;

    fn connected_pair() -> (StreamCtx, StreamCtx) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || listener.accept().unwrap().0);
        let client = TcpStream::connect(addr).unwrap();
        let server_conn = server.join().unwrap();
        (
            StreamCtx::new_plain(client).unwrap(),
            StreamCtx::new_plain(server_conn).unwrap(),
        )
    }

    #[test]
    fn handshake_accepts_no_auth() {
        let (client, server) = connected_pair();
        let t = thread::spawn(move || handshake(&server));
        client.write(&[5, 1, 0]).unwrap();
        t.join().unwrap().unwrap();
        let mut reply = [0u8; 2];
        client.read(&mut reply).unwrap();
        assert_eq!(reply, [5, 0]);
    }

    #[test]
    fn handshake_rejects_bad_version() {
        let (client, server) = connected_pair();
        let t = thread::spawn(move || handshake(&server));
        client.write(&[4, 1, 0]).unwrap();
        let result = t.join().unwrap();
        assert!(matches!(result, Err(Socks5Error::UnsupportedVersion(4))));
    }

    #[test]
    fn handshake_rejects_trailing_bytes() {
        let (client, server) = connected_pair();
        let t = thread::spawn(move || handshake(&server));
        client.write(&[5, 1, 0, 0xAA]).unwrap();
        let result = t.join().unwrap();
        assert!(matches!(result, Err(Socks5Error::UnexpectedExtraData)));
    }

    #[test]
    fn parses_ipv4_connect_request() {
        let (client, server) = connected_pair();
        let t = thread::spawn(move || parse_request(&server));
        client.write(&[5, 1, 0, 1, 127, 0, 0, 1, 0x1F, 0x90]).unwrap();
        let target = t.join().unwrap().unwrap();
        match target {
            Target::Ipv4(ip, port) => {
                assert_eq!(ip, Ipv4Addr::new(127, 0, 0, 1));
                assert_eq!(port, 8080);
            }
            _ => panic!("expected ipv4 target"),
        }
    }

    #[test]
    fn parses_domain_connect_request() {
        let (client, server) = connected_pair();
        let t = thread::spawn(move || parse_request(&server));
        let domain = b"example.com";
        let mut req = vec![5, 1, 0, 3, domain.len() as u8];
        req.extend_from_slice(domain);
        req.extend_from_slice(&443u16.to_be_bytes());
        client.write(&req).unwrap();
        let target = t.join().unwrap().unwrap();
        match target {
            Target::Domain(host, port) => {
                assert_eq!(host, "example.com");
                assert_eq!(port, 443);
            }
            _ => panic!("expected domain target"),
        }
    }

    #[test]
    fn parse_request_rejects_trailing_bytes() {
        let (client, server) = connected_pair();
        let t = thread::spawn(move || parse_request(&server));
        client.write(&[5, 1, 0, 1, 127, 0, 0, 1, 0x1F, 0x90, 0xFF]).unwrap();
        let result = t.join().unwrap();
        assert!(matches!(result, Err(Socks5Error::UnexpectedExtraData)));
    }

    #[test]
    fn rejects_non_connect_command() {
        let (client, server) = connected_pair();
        let t = thread::spawn(move || parse_request(&server));
        client.write(&[5, 2, 0, 1, 0, 0, 0, 0, 0, 0]).unwrap();
        let result = t.join().unwrap();
        assert!(matches!(result, Err(Socks5Error::UnsupportedCommand(2))));
    }

    #[test]
    fn rejects_unknown_address_type() {
        let (client, server) = connected_pair();
        let t = thread::spawn(move || parse_request(&server));
        client.write(&[5, 1, 0, 0x7F, 0, 0, 0, 0, 0, 0]).unwrap();
        let result = t.join().unwrap();
        assert!(matches!(result, Err(Socks5Error::UnsupportedAddrType(0x7F))));
    }
}
