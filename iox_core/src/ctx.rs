// Endpoint context: wraps a stream or datagram socket with optional
// encryption behind one uniform `Ctx` interface, so the pipe engine and the
// SOCKS5 handler don't need to know whether they're talking to a TCP stream
// or a UDP socket, encrypted or not.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, UdpSocket};
use std::sync::{Arc, Mutex};

use crate::crypto::{Cipher, KeyMaterial, NONCE_LEN};
use crate::error::NetworkError;

/// A readable/writable endpoint. Methods take `&self` so a `Ctx` can be
/// shared (via `Arc`) between the two directions of a pipe without forcing
/// both directions onto the same thread.
pub trait Ctx: Send + Sync {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&self, buf: &[u8]) -> io::Result<usize>;
    /// Best-effort teardown used to unblock a peer direction's blocking
    /// read once the other direction has finished. A no-op for contexts
    /// with no natural shutdown (datagram sockets).
    fn shutdown(&self);
    /// Reports whether bytes are already sitting in the transport's receive
    /// buffer beyond what a caller has consumed so far, without blocking and
    /// without consuming them. Protocols that must reject trailing garbage
    /// sent ahead of a reply (SOCKS5) use this between reading a declared-
    /// length field and sending their response. Contexts with no meaningful
    /// notion of buffered-but-unread bytes (datagrams) report `false`.
    fn has_pending(&self) -> io::Result<bool> {
        Ok(false)
    }
}

struct StreamCipherPair {
    encrypt: Mutex<Cipher>,
    decrypt: Mutex<Cipher>,
}

/// A TCP-backed endpoint. The read and write halves are independent clones
/// of the same socket so one direction's blocking read never stalls the
/// other direction's write.
pub struct StreamCtx {
    reader: Mutex<TcpStream>,
    writer: Mutex<TcpStream>,
    cipher: Option<StreamCipherPair>,
}

impl StreamCtx {
    pub fn new_plain(conn: TcpStream) -> io::Result<Self> {
        let reader = conn.try_clone()?;
        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(conn),
            cipher: None,
        })
    }

    /// Performs a fresh-nonce handshake over `conn` (write our random IV,
    /// read the peer's) before constructing the per-session ciphers. This is
    /// what makes the stream's encryption per-session rather than the
    /// deterministic pair-cipher `new_cipher_pair` produces.
    pub fn new_encrypted(conn: TcpStream, keymat: &KeyMaterial) -> Result<Self, NetworkError> {
        let mut writer = conn.try_clone()?;
        let mut reader = conn;

        let enc_iv = KeyMaterial::random_nonce();
        writer.write_all(&enc_iv)?;
        let mut dec_iv = [0u8; NONCE_LEN];
        reader.read_exact(&mut dec_iv)?;

        let encrypt = keymat.new_cipher(&enc_iv);
        let decrypt = keymat.new_cipher(&dec_iv);

        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            cipher: Some(StreamCipherPair {
                encrypt: Mutex::new(encrypt),
                decrypt: Mutex::new(decrypt),
            }),
        })
    }
}

impl Ctx for StreamCtx {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.reader.lock().unwrap().read(buf)?;
        if n > 0 {
            if let Some(c) = &self.cipher {
                c.decrypt.lock().unwrap().xor_inplace(&mut buf[..n]);
            }
        }
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        match &self.cipher {
            Some(c) => {
                let mut tmp = buf.to_vec();
                c.encrypt.lock().unwrap().xor_inplace(&mut tmp);
                self.writer.lock().unwrap().write(&tmp)
            }
            None => self.writer.lock().unwrap().write(buf),
        }
    }

    fn shutdown(&self) {
        let _ = self.writer.lock().unwrap().shutdown(Shutdown::Both);
    }

    fn has_pending(&self) -> io::Result<bool> {
        let reader = self.reader.lock().unwrap();
        reader.set_nonblocking(true)?;
        let mut probe = [0u8; 1];
        let result = reader.peek(&mut probe);
        reader.set_nonblocking(false)?;
        match result {
            Ok(n) => Ok(n > 0),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Builds a `StreamCtx`, dispatching to the plain or encrypted constructor.
pub fn new_stream_ctx(
    conn: TcpStream,
    encrypted: bool,
    keymat: Option<&KeyMaterial>,
) -> Result<StreamCtx, NetworkError> {
    if encrypted {
        let keymat = keymat.expect("encrypted stream context requires key material");
        StreamCtx::new_encrypted(conn, keymat)
    } else {
        Ok(StreamCtx::new_plain(conn)?)
    }
}

/// A UDP-backed endpoint. `connected` sockets have a single fixed peer
/// (reached via `connect`); unconnected sockets serve arbitrary senders and
/// cache the most recent sender's address to route subsequent writes.
pub struct DatagramCtx {
    sock: UdpSocket,
    encrypted: bool,
    connected: bool,
    keymat: Option<Arc<KeyMaterial>>,
    last_peer: Mutex<Option<std::net::SocketAddr>>,
}

impl DatagramCtx {
    pub fn new(sock: UdpSocket, encrypted: bool, connected: bool, keymat: Option<Arc<KeyMaterial>>) -> Self {
        Self {
            sock,
            encrypted,
            connected,
            keymat,
            last_peer: Mutex::new(None),
        }
    }
}

impl Ctx for DatagramCtx {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = if self.connected {
            self.sock.recv(buf)?
        } else {
            let (n, addr) = self.sock.recv_from(buf)?;
            *self.last_peer.lock().unwrap() = Some(addr);
            n
        };

        if !self.encrypted {
            return Ok(n);
        }
        if n < NONCE_LEN {
            // Packet too small to carry a trailing nonce; drop it.
            return Ok(0);
        }

        let split = n - NONCE_LEN;
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&buf[split..n]);
        let keymat = self
            .keymat
            .as_ref()
            .expect("encrypted datagram context requires key material");
        let mut cipher = keymat.new_cipher(&nonce);
        cipher.xor_inplace(&mut buf[..split]);
        Ok(split)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let payload = if self.encrypted {
            let keymat = self
                .keymat
                .as_ref()
                .expect("encrypted datagram context requires key material");
            let nonce = KeyMaterial::random_nonce();
            let mut cipher = keymat.new_cipher(&nonce);
            let mut out = buf.to_vec();
            cipher.xor_inplace(&mut out);
            out.extend_from_slice(&nonce);
            out
        } else {
            buf.to_vec()
        };

        if self.connected {
            self.sock.send(&payload)
        } else {
            let peer = *self.last_peer.lock().unwrap();
            match peer {
                Some(addr) => self.sock.send_to(&payload, addr),
                None => Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "no peer address registered yet",
                )),
            }
        }
    }

    fn shutdown(&self) {
        // Datagram forwarders run forever; there is nothing to tear down.
    }
}

pub fn new_datagram_ctx(
    sock: UdpSocket,
    encrypted: bool,
    connected: bool,
    keymat: Option<Arc<KeyMaterial>>,
) -> DatagramCtx {
    DatagramCtx::new(sock, encrypted, connected, keymat)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn plain_stream_ctx_round_trips() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (conn, _) = listener.accept().unwrap();
            let ctx = StreamCtx::new_plain(conn).unwrap();
            let mut buf = [0u8; 5];
            let n = ctx.read(&mut buf).unwrap();
            ctx.write(&buf[..n]).unwrap();
        });
        let client = TcpStream::connect(addr).unwrap();
        let ctx = StreamCtx::new_plain(client).unwrap();
        ctx.write(b"hello").unwrap();
        let mut buf = [0u8; 5];
        ctx.read(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        server.join().unwrap();
    }

    #[test]
    fn encrypted_stream_ctx_round_trips() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let keymat_server = Arc::new(KeyMaterial::expand(b"shared"));
        let keymat_client = Arc::clone(&keymat_server);

        let server = thread::spawn(move || {
            let (conn, _) = listener.accept().unwrap();
            let ctx = StreamCtx::new_encrypted(conn, &keymat_server).unwrap();
            let mut buf = [0u8; 11];
            let n = ctx.read(&mut buf).unwrap();
            ctx.write(&buf[..n]).unwrap();
        });

        let client = TcpStream::connect(addr).unwrap();
        let ctx = StreamCtx::new_encrypted(client, &keymat_client).unwrap();
        ctx.write(b"hello world").unwrap();
        let mut buf = [0u8; 11];
        ctx.read(&mut buf).unwrap();
        assert_eq!(&buf, b"hello world");
        server.join().unwrap();
    }

    #[test]
    fn encrypted_datagram_round_trips_with_trailing_nonce() {
        let server_sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        let server_addr = server_sock.local_addr().unwrap();
        let client_sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        client_sock.connect(server_addr).unwrap();

        let keymat = Arc::new(KeyMaterial::expand(b"udp secret"));

        let client_ctx = DatagramCtx::new(client_sock, true, true, Some(Arc::clone(&keymat)));
        let server_ctx = DatagramCtx::new(server_sock, true, false, Some(keymat));

        client_ctx.write(b"ping").unwrap();
        let mut buf = [0u8; 64];
        let n = server_ctx.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");

        server_ctx.write(b"pong").unwrap();
        let mut buf2 = [0u8; 64];
        let n2 = client_ctx.read(&mut buf2).unwrap();
        assert_eq!(&buf2[..n2], b"pong");
    }

    #[test]
    fn has_pending_detects_trailing_bytes_without_blocking() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (conn, _) = listener.accept().unwrap();
            StreamCtx::new_plain(conn).unwrap()
        });
        let mut client = TcpStream::connect(addr).unwrap();
        let server_ctx = server.join().unwrap();

        assert!(!server_ctx.has_pending().unwrap());

        client.write_all(b"extra").unwrap();
        // Give the write a moment to land in the peer's receive buffer.
        thread::sleep(std::time::Duration::from_millis(50));
        assert!(server_ctx.has_pending().unwrap());
    }

    #[test]
    fn undersized_encrypted_datagram_is_dropped() {
        let server_sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        let server_addr = server_sock.local_addr().unwrap();
        let client_sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        client_sock.connect(server_addr).unwrap();

        let keymat = Arc::new(KeyMaterial::expand(b"udp secret"));
        let server_ctx = DatagramCtx::new(server_sock, true, false, Some(keymat));

        client_sock.send(&[1, 2, 3]).unwrap();
        let mut buf = [0u8; 64];
        let n = server_ctx.read(&mut buf).unwrap();
        assert_eq!(n, 0);
    }
}
