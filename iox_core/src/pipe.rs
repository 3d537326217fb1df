// Copy & pipe engine: a generic byte-count-preserving copy between two
// `Ctx`s, a bidirectional pipe with first-completion teardown, and the two
// UDP forwarders (connected and unconnected).

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use crate::ctx::Ctx;
use crate::error::NetworkError;
use crate::pool::BufferPool;

pub const TCP_BUFFER_SIZE: usize = 0x8000;
pub const UDP_BUFFER_SIZE: usize = 0xFFE3;
pub const UDP_CHANNEL_CAPACITY: usize = 0x800;

pub const UDP_INIT_PACKET: [u8; 4] = [0xCC, 0xDD, 0xEE, 0xFF];

/// Copies from `src` to `dst` until `src` reports EOF (a `read` of zero
/// bytes), returning the total bytes written. A short write from `dst` is a
/// hard error: the engine never pads a destination's idea of the stream.
pub fn copy(dst: &dyn Ctx, src: &dyn Ctx, pool: &BufferPool) -> Result<u64, NetworkError> {
    let mut buf = pool.acquire();
    let mut written = 0u64;
    loop {
        let nr = src.read(buf.as_mut_slice())?;
        if nr == 0 {
            return Ok(written);
        }
        let nw = dst.write(&buf.as_slice()[..nr])?;
        written += nw as u64;
        if nw < nr {
            return Err(NetworkError::ShortWrite {
                written: nw,
                expected: nr,
            });
        }
    }
}

/// Runs both directions of a bidirectional pipe in parallel. The first
/// direction to finish (EOF or error) shuts down both endpoints so the
/// other direction's blocked read unblocks; this is not a drain, the peer
/// direction's in-flight copy is abandoned as soon as it next returns.
pub fn pipe(a: Arc<dyn Ctx>, b: Arc<dyn Ctx>, pool: Arc<BufferPool>) -> (Result<u64, NetworkError>, Result<u64, NetworkError>) {
    let (tx, rx) = mpsc::channel::<()>();
    let tx2 = tx.clone();

    let a1 = Arc::clone(&a);
    let b1 = Arc::clone(&b);
    let pool1 = Arc::clone(&pool);
    let a2 = Arc::clone(&a);
    let b2 = Arc::clone(&b);

    thread::scope(|s| {
        let h1 = s.spawn(move || {
            let result = copy(b1.as_ref(), a1.as_ref(), pool1.as_ref());
            let _ = tx.send(());
            result
        });
        let h2 = s.spawn(move || {
            let result = copy(a2.as_ref(), b2.as_ref(), pool.as_ref());
            let _ = tx2.send(());
            result
        });

        let _ = rx.recv();
        a.shutdown();
        b.shutdown();

        (h1.join().unwrap(), h2.join().unwrap())
    })
}

/// Forwards datagrams between two endpoints that already have a well-known
/// peer (both dialed, or a listener whose one client sends first). Runs
/// forever; there is no normal termination path.
pub fn forward_udp_connected(a: Arc<dyn Ctx>, b: Arc<dyn Ctx>) {
    let a1 = Arc::clone(&a);
    let b1 = Arc::clone(&b);
    thread::spawn(move || udp_loop(a1.as_ref(), b1.as_ref()));
    thread::spawn(move || udp_loop(b.as_ref(), a.as_ref()));
}

fn udp_loop(src: &dyn Ctx, dst: &dyn Ctx) {
    let mut buf = vec![0u8; UDP_BUFFER_SIZE];
    loop {
        let n = match src.read(&mut buf) {
            Ok(n) if n > 0 => n,
            Ok(_) => continue,
            Err(_) => continue,
        };
        if n == 4 && buf[..4] == UDP_INIT_PACKET {
            continue;
        }
        let _ = dst.write(&buf[..n]);
    }
}

/// Forwards datagrams between two endpoints where neither side's peer is
/// known ahead of time. Each side's reader latches its own peer address on
/// the first packet it receives; the writer for that side blocks until the
/// latch fires before it starts draining its bounded queue, so a reply can
/// never be sent before we know who to send it to.
pub fn forward_udp_unconnected(a: Arc<dyn Ctx>, b: Arc<dyn Ctx>) {
    let (tx_to_b, rx_to_b) = mpsc::sync_channel::<Vec<u8>>(UDP_CHANNEL_CAPACITY);
    let (tx_to_a, rx_to_a) = mpsc::sync_channel::<Vec<u8>>(UDP_CHANNEL_CAPACITY);
    let (addr_a_tx, addr_a_rx) = mpsc::sync_channel::<()>(1);
    let (addr_b_tx, addr_b_rx) = mpsc::sync_channel::<()>(1);

    {
        let a = Arc::clone(&a);
        thread::spawn(move || reader_loop(a.as_ref(), tx_to_b, addr_a_tx));
    }
    {
        let b = Arc::clone(&b);
        thread::spawn(move || reader_loop(b.as_ref(), tx_to_a, addr_b_tx));
    }
    {
        let a = Arc::clone(&a);
        thread::spawn(move || {
            let _ = addr_a_rx.recv();
            for packet in rx_to_a {
                let _ = a.write(&packet);
            }
        });
    }
    thread::spawn(move || {
        let _ = addr_b_rx.recv();
        for packet in rx_to_b {
            let _ = b.write(&packet);
        }
    });
}

fn reader_loop(src: &dyn Ctx, forward_to: mpsc::SyncSender<Vec<u8>>, registered: mpsc::SyncSender<()>) {
    let mut buf = vec![0u8; UDP_BUFFER_SIZE];
    let mut latched = false;
    loop {
        let n = match src.read(&mut buf) {
            Ok(n) if n > 0 => n,
            Ok(_) => continue,
            Err(_) => continue,
        };
        if !latched {
            latched = true;
            let _ = registered.try_send(());
        }
        if n == 4 && buf[..4] == UDP_INIT_PACKET {
            continue;
        }
        if forward_to.send(buf[..n].to_vec()).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctx::{new_datagram_ctx, StreamCtx};
    use std::net::{TcpListener, TcpStream, UdpSocket};
    use std::time::Duration;

    #[test]
    fn copy_preserves_bytes_and_stops_at_eof() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (conn, _) = listener.accept().unwrap();
            conn
        });
        let client = TcpStream::connect(addr).unwrap();
        let server_conn = server.join().unwrap();

        let src: Arc<dyn Ctx> = Arc::new(StreamCtx::new_plain(client).unwrap());
        let sink_listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let sink_addr = sink_listener.local_addr().unwrap();
        let sink_server = thread::spawn(move || {
            let (conn, _) = sink_listener.accept().unwrap();
            let mut buf = vec![0u8; 64];
            let mut total = Vec::new();
            loop {
                use std::io::Read;
                let n = conn.try_clone().unwrap().read(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                total.extend_from_slice(&buf[..n]);
            }
            total
        });
        let sink_client = TcpStream::connect(sink_addr).unwrap();
        let dst: Arc<dyn Ctx> = Arc::new(StreamCtx::new_plain(sink_client).unwrap());

        use std::io::Write;
        (&server_conn).write_all(b"payload").unwrap();
        drop(server_conn);

        let pool = BufferPool::new(TCP_BUFFER_SIZE);
        let written = copy(dst.as_ref(), src.as_ref(), &pool).unwrap();
        assert_eq!(written, 7);
        dst.shutdown();
        assert_eq!(sink_server.join().unwrap(), b"payload");
    }

    #[test]
    fn pipe_tears_down_when_one_side_closes() {
        let listener_a = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr_a = listener_a.local_addr().unwrap();
        let listener_b = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr_b = listener_b.local_addr().unwrap();

        let accept_a = thread::spawn(move || listener_a.accept().unwrap().0);
        let accept_b = thread::spawn(move || listener_b.accept().unwrap().0);

        let client_a = TcpStream::connect(addr_a).unwrap();
        let client_b = TcpStream::connect(addr_b).unwrap();
        let server_a = accept_a.join().unwrap();
        let server_b = accept_b.join().unwrap();

        let a: Arc<dyn Ctx> = Arc::new(StreamCtx::new_plain(server_a).unwrap());
        let b: Arc<dyn Ctx> = Arc::new(StreamCtx::new_plain(server_b).unwrap());
        let pool = Arc::new(BufferPool::new(TCP_BUFFER_SIZE));

        drop(client_a);
        drop(client_b);

        let (r1, r2) = pipe(a, b, pool);
        assert!(r1.is_ok());
        assert!(r2.is_ok());
    }

    #[test]
    fn udp_connected_forward_relays_both_directions() {
        // client <-> (ctx_a = "local") <-> (ctx_b = "remote") <-> upstream
        let local_sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        let local_addr = local_sock.local_addr().unwrap();
        let remote_sock = UdpSocket::bind("127.0.0.1:0").unwrap();

        let upstream = UdpSocket::bind("127.0.0.1:0").unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        remote_sock.connect(upstream_addr).unwrap();

        let ctx_local: Arc<dyn Ctx> = Arc::new(new_datagram_ctx(local_sock, false, false, None));
        let ctx_remote: Arc<dyn Ctx> = Arc::new(new_datagram_ctx(remote_sock, false, true, None));

        forward_udp_connected(Arc::clone(&ctx_local), Arc::clone(&ctx_remote));

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.connect(local_addr).unwrap();
        client.send(b"ping").unwrap();

        let mut buf = [0u8; 16];
        upstream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let (n, upstream_peer) = upstream.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");

        upstream.send_to(b"pong", upstream_peer).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut buf2 = [0u8; 16];
        let n2 = client.recv(&mut buf2).unwrap();
        assert_eq!(&buf2[..n2], b"pong");
    }
}
