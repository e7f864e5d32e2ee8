//! Event loop (§4.3): a thin wrapper over the platform readiness primitive.
//!
//! Rather than hand-roll an epoll wrapper, this layers the domain-specific
//! bookkeeping the spec actually asks for (fd registration across a
//! dynamically changing set of clients and PTYs, one-shot deadline-ordered
//! timers) on top of `tokio`'s reactor, already part of the teacher's stack.
//! The loop runs on a `current_thread` runtime (configured in `main.rs`), so
//! "the loop is single-threaded; all callbacks run on the main thread"
//! (§4.3) is enforced by the runtime, not just by convention: nothing here
//! is `tokio::spawn`ed onto another worker thread.
//!
//! Accepting connections reuses the teacher's `SocketServer::run` shape
//! (unlink stale socket, bind, set 0600, loop accepting) from `src/socket.rs`,
//! but accepted connections are registered into this same loop's readiness
//! set instead of being `tokio::spawn`ed onto separate tasks, since §5
//! requires the main thread to be the sole mutator of client state.

use crate::client::ClientSession;
use crate::codec::{self, Message};
use crate::rpc;
use crate::server::Server;
use anyhow::{Context, Result};
use futures::future::{select_all, BoxFuture, FutureExt};
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::net::UnixListener;
use tracing::{debug, error, info, warn};

enum Event {
    Accept(std::io::Result<tokio::net::UnixStream>),
    ClientReadable(u64),
    PtyReadable(u64),
    TimerFired,
}

/// A raw fd we don't own; used only to register a PTY's notify-pipe read end
/// with tokio's reactor for one readiness wait at a time.
#[derive(Clone, Copy)]
struct BorrowedRawFd(RawFd);

impl AsRawFd for BorrowedRawFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

pub async fn run(server: &mut Server, socket_path: &str) -> Result<()> {
    let path = Path::new(socket_path);
    if path.exists() {
        // §6: a socket path left behind is only "stale" if nothing answers
        // on it. A successful connect means another vtmuxd (or something
        // else) is already listening there — refuse to clobber it rather
        // than unlinking a live server's socket out from under it.
        if tokio::net::UnixStream::connect(path).await.is_ok() {
            anyhow::bail!("a server is already listening at {socket_path}");
        }
        std::fs::remove_file(path).context("failed to remove stale socket")?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("failed to create socket directory")?;
    }
    let listener = UnixListener::bind(socket_path).context("failed to bind socket")?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        if let Err(e) = std::fs::set_permissions(socket_path, perms) {
            warn!("failed to set socket permissions: {e}");
        }
    }
    info!("listening at {socket_path}");

    loop {
        flush_outbound(server);
        reap_dead_clients(server);
        if let Some(exited) = reap_dead_ptys(server) {
            for (pty_id, status) in exited {
                let _ = server.close_pty_with_status(pty_id, status);
            }
        }

        let event = wait_for_event(server, &listener).await;

        match event {
            Event::Accept(Ok(stream)) => {
                let id = server.alloc_client_id();
                server.clients.insert(id, ClientSession::new(id, stream));
                debug!("client {id} connected");
            }
            Event::Accept(Err(e)) => error!("accept error: {e}"),
            Event::ClientReadable(client_id) => handle_client_readable(server, client_id),
            Event::PtyReadable(pty_id) => handle_pty_readable(server, pty_id),
            Event::TimerFired => {
                let now = Instant::now();
                let fired = server.scheduler.fire_due(now);
                for pty_id in fired {
                    server.render_pty(pty_id);
                }
            }
        }
    }
}

async fn wait_for_event(server: &Server, listener: &UnixListener) -> Event {
    let mut futs: Vec<BoxFuture<'_, Event>> = Vec::new();

    // `UnixListener::accept` is documented cancel-safe, so it can sit
    // directly in the select set alongside the other readiness futures
    // without losing an already-accepted connection if another branch wins.
    futs.push(
        async {
            let result = listener.accept().await.map(|(stream, _addr)| stream);
            Event::Accept(result)
        }
        .boxed(),
    );

    for (&client_id, client) in server.clients.iter() {
        if !client.alive {
            continue;
        }
        let fut = async move {
            let _ = client.stream.readable().await;
            Event::ClientReadable(client_id)
        };
        futs.push(fut.boxed());
    }

    for (&pty_id, handle) in server.ptys.iter() {
        let raw = handle.notify_read_fd();
        let fut = async move {
            if let Ok(async_fd) = AsyncFd::with_interest(BorrowedRawFd(raw), Interest::READABLE) {
                let _ = async_fd.readable().await;
            }
            Event::PtyReadable(pty_id)
        };
        futs.push(fut.boxed());
    }

    let deadline = server.scheduler.next_deadline();
    let timer = async move {
        match deadline {
            Some(d) => tokio::time::sleep_until(tokio::time::Instant::from_std(d)).await,
            None => tokio::time::sleep(Duration::from_secs(3600)).await,
        }
        Event::TimerFired
    };
    futs.push(timer.boxed());

    let (event, _idx, _rest) = select_all(futs).await;
    event
}

fn handle_client_readable(server: &mut Server, client_id: u64) {
    let mut buf = [0u8; 65536];
    let mut closed = false;

    loop {
        let n = {
            let client = match server.clients.get(&client_id) {
                Some(c) => c,
                None => return,
            };
            match client.stream.try_read(&mut buf) {
                Ok(0) => {
                    closed = true;
                    0
                }
                Ok(n) => n,
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("client {client_id} read error: {e}");
                    closed = true;
                    0
                }
            }
        };
        if closed {
            break;
        }
        if let Some(client) = server.clients.get_mut(&client_id) {
            client.decode_buf.extend_from_slice(&buf[..n]);
        }
        drain_decode_buffer(server, client_id);
    }

    if closed {
        server.remove_client(client_id);
        debug!("client {client_id} disconnected");
    }
}

fn drain_decode_buffer(server: &mut Server, client_id: u64) {
    loop {
        let decoded = {
            let client = match server.clients.get(&client_id) {
                Some(c) => c,
                None => return,
            };
            codec::decode(&client.decode_buf)
        };

        match decoded {
            Ok(Some((msg, consumed))) => {
                if let Some(client) = server.clients.get_mut(&client_id) {
                    client.decode_buf.drain(..consumed);
                }
                dispatch(server, client_id, msg);
            }
            Ok(None) => break,
            Err(e) => {
                warn!("client {client_id} sent malformed frame: {e}");
                if let Some(client) = server.clients.get_mut(&client_id) {
                    client.alive = false;
                }
                break;
            }
        }
    }
}

fn dispatch(server: &mut Server, client_id: u64, msg: Message) {
    match msg {
        Message::Request { msgid, method, params } => {
            let (error, result) = rpc::handle_request(server, client_id, &method, &params);
            let response = rpc::respond(msgid, error, result);
            let mut bytes = Vec::new();
            codec::encode(&response, &mut bytes);
            if let Some(client) = server.clients.get_mut(&client_id) {
                if !client.queue_outbound(&bytes) {
                    client.alive = false;
                }
            }
        }
        Message::Notification { method, params } => {
            rpc::handle_notification(server, &method, &params);
        }
        Message::Response { .. } => {
            warn!("client {client_id} sent a response frame; ignoring");
        }
    }
}

fn handle_pty_readable(server: &mut Server, pty_id: u64) {
    if let Some(handle) = server.ptys.get(&pty_id) {
        handle.drain_notify_pipe();
    } else {
        return;
    }
    let now = Instant::now();
    let decision = server.scheduler.on_notify(pty_id, now);
    if matches!(decision, crate::frame::Decision::RenderNow) {
        server.render_pty(pty_id);
    }
}

/// Drain every client's outbound queue with a few best-effort attempts,
/// giving the kernel a chance to accept the bytes. Used during graceful
/// shutdown (§4.7) so the `pty_exit` notifications queued by
/// `Server::shutdown` actually reach clients before the socket is unlinked.
pub async fn flush_all_outbound(server: &mut Server) {
    for _ in 0..20 {
        flush_outbound(server);
        if server.clients.values().all(|c| c.outbound.is_empty()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn flush_outbound(server: &mut Server) {
    let ids: Vec<u64> = server.clients.keys().copied().collect();
    for id in ids {
        let client = match server.clients.get_mut(&id) {
            Some(c) => c,
            None => continue,
        };
        if !client.alive || client.outbound.is_empty() {
            continue;
        }
        let bytes: Vec<u8> = client.outbound.iter().copied().collect();
        match client.stream.try_write(&bytes) {
            Ok(n) => {
                client.outbound.drain(..n);
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => {
                warn!("client {id} write error: {e}");
                client.alive = false;
            }
        }
    }
}

fn reap_dead_clients(server: &mut Server) {
    let dead: Vec<u64> = server
        .clients
        .iter()
        .filter(|(_, c)| !c.alive)
        .map(|(&id, _)| id)
        .collect();
    for id in dead {
        server.remove_client(id);
    }
}

/// Returns the set of PTYs whose child has exited, paired with the exit
/// status `waitpid` reported, for the caller to run the full shutdown path
/// on (§4.2, §7).
fn reap_dead_ptys(server: &mut Server) -> Option<Vec<(u64, i32)>> {
    let mut exited = Vec::new();
    for (&id, handle) in server.ptys.iter() {
        if !handle.is_running() {
            let status = handle.check_child().unwrap_or(0);
            exited.push((id, status));
        }
    }
    if exited.is_empty() {
        None
    } else {
        Some(exited)
    }
}
