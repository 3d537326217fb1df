// The six operation modes: three `fwd` submodes (L2R, L2L, R2R) and three
// `proxy` submodes (LP, RP, RPL2L). Each takes already-parsed descriptors
// and a shared `Config`/`BufferPool`.

use std::net::TcpStream;
use std::process;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use iox_core::config::Config;
use iox_core::control::{self, Frame, CMD_CLEANUP, CMD_CONNECT_ME, CMD_HANDSHAKE, CLIENT_HANDSHAKE, MAX_CONNECTION, SERVER_HANDSHAKE};
use iox_core::ctx::{self, Ctx};
use iox_core::log;
use iox_core::pipe::{self, TCP_BUFFER_SIZE};
use iox_core::pool::BufferPool;
use iox_core::socket::{classify_tcp_accept, AcceptOutcome, Descriptor, StreamMuxer};
use iox_core::socks5;

use crate::error::{CliError, Result};

/// Backoff between failed dial retries in the modes that dial forever
/// (`R2R`) rather than failing out.
const RETRY_BACKOFF: Duration = Duration::from_millis(1500);

pub enum FwdPlan {
    L2R(Descriptor, Descriptor),
    L2L(Descriptor, Descriptor),
    R2R(Descriptor, Descriptor),
}

pub enum ProxyPlan {
    Lp(Descriptor),
    Rp(Descriptor),
    Rpl2l(Descriptor, Descriptor),
}

pub fn select_fwd(descs: &[Descriptor]) -> Result<FwdPlan> {
    if descs.len() != 2 {
        return Err(CliError::FwdArity);
    }
    if descs[0].is_proto_reliable() != descs[1].is_proto_reliable() {
        return Err(iox_core::DescriptorError::ProtocolMismatch.into());
    }
    Ok(match (descs[0].is_listener, descs[1].is_listener) {
        (true, true) => FwdPlan::L2L(descs[0].clone(), descs[1].clone()),
        (false, false) => FwdPlan::R2R(descs[0].clone(), descs[1].clone()),
        (true, false) => FwdPlan::L2R(descs[0].clone(), descs[1].clone()),
        (false, true) => FwdPlan::L2R(descs[1].clone(), descs[0].clone()),
    })
}

pub fn select_proxy(descs: &[Descriptor]) -> Result<ProxyPlan> {
    match descs.len() {
        1 if descs[0].is_listener => Ok(ProxyPlan::Lp(descs[0].clone())),
        1 => Ok(ProxyPlan::Rp(descs[0].clone())),
        2 => {
            let (control_desc, local_desc) = if descs[0].is_proxy_proto() {
                (descs[0].clone(), descs[1].clone())
            } else {
                (descs[1].clone(), descs[0].clone())
            };
            Ok(ProxyPlan::Rpl2l(control_desc, local_desc))
        }
        _ => Err(CliError::ProxyArity),
    }
}

fn make_stream_ctx(conn: TcpStream, encrypted: bool, cfg: &Config) -> Option<Arc<dyn Ctx>> {
    match ctx::new_stream_ctx(conn, encrypted, cfg.key_material()) {
        Ok(c) => Some(Arc::new(c)),
        Err(e) => {
            log::warn(&format!("failed to establish stream context: {e}"));
            None
        }
    }
}

/// `fwd`: one side listens, the other is dialed per accepted connection.
pub fn local_to_remote(cfg: &Config, local: &Descriptor, remote: &Descriptor) -> Result<()> {
    if !local.is_proto_reliable() {
        return udp_local_to_remote(cfg, local, remote);
    }

    let listener = local.get_listener()?;
    let pool = Arc::new(BufferPool::new(TCP_BUFFER_SIZE));
    log::success(&format!("listening on {local}, forwarding to {remote}"));

    loop {
        match classify_tcp_accept(listener.accept()) {
            AcceptOutcome::New((conn, _)) => {
                let cfg = cfg.clone();
                let remote = remote.clone();
                let local_encrypted = local.secret;
                let remote_encrypted = remote.secret;
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    let local_ctx = match make_stream_ctx(conn, local_encrypted, &cfg) {
                        Some(c) => c,
                        None => return,
                    };
                    let remote_conn = match remote.get_conn(cfg.timeout) {
                        Ok(c) => c,
                        Err(e) => {
                            log::warn(&format!("dial to {remote} failed: {e}"));
                            return;
                        }
                    };
                    let remote_ctx = match make_stream_ctx(remote_conn, remote_encrypted, &cfg) {
                        Some(c) => c,
                        None => return,
                    };
                    let _ = pipe::pipe(local_ctx, remote_ctx, pool);
                });
            }
            AcceptOutcome::Closed => return Ok(()),
            AcceptOutcome::Transient(e) => log::warn(&format!("accept error: {e}")),
        }
    }
}

fn udp_local_to_remote(cfg: &Config, local: &Descriptor, remote: &Descriptor) -> Result<()> {
    let local_sock = local.get_udp_conn()?;
    let remote_sock = remote.get_udp_conn()?;
    log::success(&format!("forwarding UDP {local} <-> {remote}"));

    let local_ctx: Arc<dyn Ctx> = Arc::new(ctx::new_datagram_ctx(local_sock, local.secret, false, cfg.key.clone()));
    let remote_ctx: Arc<dyn Ctx> = Arc::new(ctx::new_datagram_ctx(remote_sock, remote.secret, true, cfg.key.clone()));

    pipe::forward_udp_connected(local_ctx, remote_ctx);

    // The forwarder threads run forever; park this one.
    loop {
        thread::sleep(Duration::from_secs(3600));
    }
}

/// `fwd`: both sides listen; each accepted pair on both listeners is piped
/// together. Two independent completion signals (one `std::thread::scope`
/// join per side) replace a single shared channel with side-band tagging.
pub fn local_to_local(cfg: &Config, a: &Descriptor, b: &Descriptor) -> Result<()> {
    let listener_a = a.get_listener()?;
    let listener_b = b.get_listener()?;
    let pool = Arc::new(BufferPool::new(TCP_BUFFER_SIZE));
    log::success(&format!("bridging {a} <-> {b}"));

    loop {
        let (conn_a, conn_b) = thread::scope(|s| {
            let ha = s.spawn(|| accept_retrying(&listener_a));
            let hb = s.spawn(|| accept_retrying(&listener_b));
            (ha.join().unwrap(), hb.join().unwrap())
        });

        let cfg = cfg.clone();
        let a_encrypted = a.secret;
        let b_encrypted = b.secret;
        let pool = Arc::clone(&pool);
        thread::spawn(move || {
            let ctx_a = match make_stream_ctx(conn_a, a_encrypted, &cfg) {
                Some(c) => c,
                None => return,
            };
            let ctx_b = match make_stream_ctx(conn_b, b_encrypted, &cfg) {
                Some(c) => c,
                None => return,
            };
            let _ = pipe::pipe(ctx_a, ctx_b, pool);
        });
    }
}

fn accept_retrying(listener: &std::net::TcpListener) -> TcpStream {
    loop {
        match listener.accept() {
            Ok((conn, _)) => return conn,
            Err(e) => log::warn(&format!("accept error: {e}")),
        }
    }
}

/// `fwd`: both sides are dialed, retried forever on failure.
pub fn remote_to_remote(cfg: &Config, a: &Descriptor, b: &Descriptor) -> Result<()> {
    if !a.is_proto_reliable() && a.secret != b.secret {
        return Err(iox_core::DescriptorError::OneSidedEncryptedDatagram.into());
    }

    let pool = Arc::new(BufferPool::new(TCP_BUFFER_SIZE));
    log::success(&format!("bridging {a} <-> {b} (dialed)"));

    loop {
        let (conn_a, conn_b) = thread::scope(|s| {
            let ha = s.spawn(|| dial_retrying(a, cfg.timeout, cfg.verbose));
            let hb = s.spawn(|| dial_retrying(b, cfg.timeout, cfg.verbose));
            (ha.join().unwrap(), hb.join().unwrap())
        });

        let cfg = cfg.clone();
        let a_encrypted = a.secret;
        let b_encrypted = b.secret;
        let pool = Arc::clone(&pool);
        thread::spawn(move || {
            let ctx_a = match make_stream_ctx(conn_a, a_encrypted, &cfg) {
                Some(c) => c,
                None => return,
            };
            let ctx_b = match make_stream_ctx(conn_b, b_encrypted, &cfg) {
                Some(c) => c,
                None => return,
            };
            let _ = pipe::pipe(ctx_a, ctx_b, pool);
        });
    }
}

/// Opens up to `n` worker streams out of a single multiplexed connection to
/// `remote`. `PassthroughMuxer` only ever yields one real stream; further
/// `open()` calls are logged and the remaining workers for this frame are
/// dropped, rather than falling back to a raw dial that would defeat the
/// point of multiplexing.
fn spawn_muxed_workers(remote: &Descriptor, cfg: &Config, pool: &Arc<BufferPool>, n: u8) {
    let mut muxer = match remote.dial_muxed(cfg.timeout) {
        Ok(m) => m,
        Err(e) => {
            log::warn(&format!("multiplexed dial to {remote} failed: {e}"));
            return;
        }
    };
    for _ in 0..n {
        let conn = match muxer.open() {
            Ok(c) => c,
            Err(e) => {
                log::warn(&format!("multiplexed stream to {remote} exhausted: {e}"));
                return;
            }
        };
        let cfg = cfg.clone();
        let pool = Arc::clone(pool);
        let secret = remote.secret;
        thread::spawn(move || {
            if let Some(ctx) = make_stream_ctx(conn, secret, &cfg) {
                socks5::handle_connection(ctx, cfg.timeout, pool);
            }
        });
    }
}

fn dial_retrying(desc: &Descriptor, timeout: Duration, verbose: bool) -> TcpStream {
    loop {
        match desc.get_conn(timeout) {
            Ok(conn) => return conn,
            Err(e) => {
                log::info(verbose, &format!("connect to {desc} failed ({e}), retrying"));
                thread::sleep(RETRY_BACKOFF);
            }
        }
    }
}

/// `proxy`: a plain local SOCKS5 listener.
pub fn proxy_local(cfg: &Config, local: &Descriptor) -> Result<()> {
    let listener = local.get_listener()?;
    let pool = Arc::new(BufferPool::new(TCP_BUFFER_SIZE));
    log::success(&format!("socks5 proxy listening on {local}"));

    loop {
        match classify_tcp_accept(listener.accept()) {
            AcceptOutcome::New((conn, _)) => {
                let cfg = cfg.clone();
                let encrypted = local.secret;
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    if let Some(ctx) = make_stream_ctx(conn, encrypted, &cfg) {
                        socks5::handle_connection(ctx, cfg.timeout, pool);
                    }
                });
            }
            AcceptOutcome::Closed => return Ok(()),
            AcceptOutcome::Transient(e) => log::warn(&format!("accept error: {e}")),
        }
    }
}

/// `proxy`: the NAT-bound side of a reverse proxy. Dials the rendezvous,
/// performs the control handshake, then spawns one worker stream per unit
/// requested by each `CONNECT_ME` frame.
pub fn proxy_remote(cfg: &Config, remote: &Descriptor) -> Result<()> {
    let conn = remote.get_conn(cfg.timeout)?;
    let mut ctl_write = conn.try_clone()?;
    let mut ctl_read = conn;

    control::write_frame(
        &mut ctl_write,
        Frame {
            cmd: CMD_HANDSHAKE,
            n: CLIENT_HANDSHAKE,
        },
    )?;
    let resp = control::read_frame(&mut ctl_read)?;
    if !(resp.cmd == CMD_HANDSHAKE && resp.n == SERVER_HANDSHAKE) {
        return Err(iox_core::NetworkError::IllegalHandshake(resp.n).into());
    }
    log::success("control handshake complete");

    let pool = Arc::new(BufferPool::new(TCP_BUFFER_SIZE));

    loop {
        let frame = match control::read_frame(&mut ctl_read) {
            Ok(f) => f,
            Err(e) => {
                log::warn(&format!("control channel closed: {e}"));
                process::exit(1);
            }
        };
        match frame.cmd {
            c if c == CMD_CONNECT_ME => {
                let remote = remote.clone();
                let cfg = cfg.clone();
                let pool = Arc::clone(&pool);
                let n = frame.n;
                thread::spawn(move || {
                    if remote.multiplex {
                        spawn_muxed_workers(&remote, &cfg, &pool, n);
                    } else {
                        for _ in 0..n {
                            let remote = remote.clone();
                            let cfg = cfg.clone();
                            let pool = Arc::clone(&pool);
                            thread::spawn(move || {
                                let conn = match remote.get_conn(cfg.timeout) {
                                    Ok(c) => c,
                                    Err(e) => {
                                        log::warn(&format!("worker dial to {remote} failed: {e}"));
                                        return;
                                    }
                                };
                                if let Some(ctx) = make_stream_ctx(conn, remote.secret, &cfg) {
                                    socks5::handle_connection(ctx, cfg.timeout, pool);
                                }
                            });
                        }
                    }
                });
            }
            c if c == CMD_CLEANUP => {
                log::success("received CLEANUP, exiting");
                process::exit(0);
            }
            other => log::warn(&format!("unexpected control command {other}")),
        }
    }
}

/// `proxy`: the public rendezvous side of a reverse proxy, pairing accepted
/// local connections with on-demand worker streams requested over the
/// control channel.
pub fn proxy_rendezvous(cfg: &Config, control_desc: &Descriptor, local_desc: &Descriptor) -> Result<()> {
    let control_listener = control_desc.get_listener()?;
    let local_listener = local_desc.get_listener()?;
    log::success(&format!(
        "rendezvous listening: control={control_desc} local={local_desc}"
    ));

    let (ctl_conn, _) = control_listener.accept()?;
    let mut ctl_write = ctl_conn.try_clone()?;
    let mut ctl_read = ctl_conn;

    loop {
        let frame = control::read_frame(&mut ctl_read)?;
        if frame.cmd == CMD_HANDSHAKE && frame.n == CLIENT_HANDSHAKE {
            control::write_frame(
                &mut ctl_write,
                Frame {
                    cmd: CMD_HANDSHAKE,
                    n: SERVER_HANDSHAKE,
                },
            )?;
            break;
        }
    }
    log::success("control handshake complete");

    let ctl_write = Arc::new(Mutex::new(ctl_write));

    {
        let ctl_write = Arc::clone(&ctl_write);
        ctrlc::set_handler(move || {
            let mut w = ctl_write.lock().unwrap();
            let _ = control::write_frame(
                &mut *w,
                Frame {
                    cmd: CMD_CLEANUP,
                    n: 0,
                },
            );
            log::success("received SIGINT, sent CLEANUP, exiting");
            process::exit(0);
        })
        .expect("failed to install SIGINT handler");
    }

    {
        let mut watch = ctl_read.try_clone()?;
        thread::spawn(move || loop {
            match control::read_frame(&mut watch) {
                Ok(f) if f.cmd == CMD_CLEANUP => {
                    log::success("remote sent CLEANUP, exiting");
                    process::exit(0);
                }
                Ok(_) => {}
                Err(_) => {
                    log::warn("control channel closed, exiting");
                    process::exit(1);
                }
            }
        });
    }

    let (local_tx, local_rx) = mpsc::sync_channel::<TcpStream>(MAX_CONNECTION);

    {
        let ctl_write = Arc::clone(&ctl_write);
        let local_tx = local_tx.clone();
        thread::spawn(move || {
            for conn in local_listener.incoming() {
                match conn {
                    Ok(conn) => {
                        if local_tx.send(conn).is_err() {
                            break;
                        }
                        let mut w = ctl_write.lock().unwrap();
                        if control::write_frame(
                            &mut *w,
                            Frame {
                                cmd: CMD_CONNECT_ME,
                                n: 1,
                            },
                        )
                        .is_err()
                        {
                            log::warn("control channel closed, exiting");
                            process::exit(1);
                        }
                    }
                    Err(e) => log::warn(&format!("local accept error: {e}")),
                }
            }
        });
    }

    let pool = Arc::new(BufferPool::new(TCP_BUFFER_SIZE));

    for worker in control_listener.incoming() {
        match worker {
            Ok(worker_conn) => {
                let local_conn = match local_rx.recv() {
                    Ok(c) => c,
                    Err(_) => break,
                };
                let cfg = cfg.clone();
                let pool = Arc::clone(&pool);
                let control_encrypted = control_desc.secret;
                let local_encrypted = local_desc.secret;
                thread::spawn(move || {
                    let worker_ctx = match make_stream_ctx(worker_conn, control_encrypted, &cfg) {
                        Some(c) => c,
                        None => return,
                    };
                    let local_ctx = match make_stream_ctx(local_conn, local_encrypted, &cfg) {
                        Some(c) => c,
                        None => return,
                    };
                    let _ = pipe::pipe(worker_ctx, local_ctx, pool);
                });
            }
            Err(e) => log::warn(&format!("worker accept error: {e}")),
        }
    }

    Ok(())
}
