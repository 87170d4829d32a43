//! Per-profile proxy server
//!
//! Owns the listener, the concurrency semaphore, the session tracker, and
//! the per-connection workers. A worker authenticates the client locally,
//! borrows a backend session, and then degrades into a dumb byte pipe until
//! either side goes away.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::backend::BackendConn;
use super::handshake::authenticate_client;
use super::pool::BackendPool;
use super::tracker::SessionTracker;
use crate::config::Profile;
use crate::error::{compact_err, ProxyError, Result};
use crate::protocol::mysql::packets::{ErrPacket, ER_CON_COUNT_ERROR};
use crate::protocol::mysql::parser::{build_err_packet, read_packet, write_packet};

/// How long to wait for the client's first command before giving up on
/// sending it a protocol-correct backend-unavailable error.
const BACKEND_UNAVAILABLE_READ_WINDOW: Duration = Duration::from_secs(2);

/// Extra drain window granted after force-closing sessions on shutdown.
const FORCE_CLOSE_GRACE: Duration = Duration::from_secs(2);

pub struct ProxyServer {
    profile: Profile,
    pool: Arc<BackendPool>,
    shutdown_timeout: Duration,
    max_conns: usize,
    sem: Arc<Semaphore>,
    next_session_id: AtomicU64,
    tracker: Arc<SessionTracker>,
}

impl ProxyServer {
    pub fn new(
        profile: Profile,
        pool: Arc<BackendPool>,
        shutdown_timeout: Duration,
        max_conns: usize,
    ) -> Self {
        let max_conns = if max_conns == 0 {
            crate::config::MAX_CONNS_HARD_LIMIT
        } else {
            max_conns
        };
        Self {
            profile,
            pool,
            shutdown_timeout,
            max_conns,
            sem: Arc::new(Semaphore::new(max_conns)),
            next_session_id: AtomicU64::new(0),
            tracker: Arc::new(SessionTracker::new()),
        }
    }

    pub fn tracker(&self) -> Arc<SessionTracker> {
        Arc::clone(&self.tracker)
    }

    /// Serve until `shutdown` fires, then drain workers (bounded by the
    /// shutdown timeout, with a force-close fallback). The pool is closed on
    /// every exit path.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let result = self.run_inner(&shutdown).await;
        self.pool.close();
        result
    }

    async fn run_inner(self: &Arc<Self>, shutdown: &CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(&self.profile.listen_addr)
            .await
            .map_err(|e| {
                ProxyError::Connection(format!("bind {}: {}", self.profile.listen_addr, e))
            })?;
        info!(
            profile = %self.profile.name,
            listen_addr = %self.profile.listen_addr,
            rds_host = %self.profile.rds_host,
            rds_port = self.profile.rds_port,
            max_conns = self.max_conns,
            "proxy listening"
        );

        let mut workers: JoinSet<()> = JoinSet::new();

        loop {
            let (stream, addr) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                },
            };

            let permit = tokio::select! {
                _ = shutdown.cancelled() => {
                    drop(stream);
                    return Ok(());
                }
                acquired = Arc::clone(&self.sem).acquire_owned() => match acquired {
                    Ok(permit) => permit,
                    Err(_) => break, // semaphore closed, not reachable in practice
                },
            };

            let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed) + 1;
            let kill = self.tracker.track_client(session_id, addr);
            let server = Arc::clone(self);
            let worker_shutdown = shutdown.clone();
            workers.spawn(async move {
                // The permit is owned by the task, so a panicking worker
                // still releases its slot.
                let _permit = permit;
                server
                    .handle_conn(stream, addr, session_id, kill, worker_shutdown)
                    .await;
            });
        }

        drop(listener);

        let drained = tokio::select! {
            _ = drain_workers(&mut workers) => true,
            _ = tokio::time::sleep(self.shutdown_timeout) => false,
        };
        if !drained {
            let (active_count, oldest_age) = self.tracker.active_summary();
            let forced = self.tracker.force_close_all();
            warn!(
                active_count,
                oldest_age_ms = oldest_age.as_millis() as u64,
                forced_closes = forced,
                "shutdown timeout hit; forcing active connection close"
            );
            tokio::select! {
                _ = drain_workers(&mut workers) => {}
                _ = tokio::time::sleep(FORCE_CLOSE_GRACE) => {}
            }
        }
        Ok(())
    }

    async fn handle_conn(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
        session_id: u64,
        kill: CancellationToken,
        shutdown: CancellationToken,
    ) {
        let started = Instant::now();
        info!(session_id, client = %addr, "connection accepted");

        tokio::select! {
            // Force-close during shutdown: dropping the session future drops
            // both sockets.
            _ = kill.cancelled() => {
                debug!(session_id, "session force-closed during shutdown");
            }
            _ = self.serve_session(stream, session_id, &shutdown) => {}
        }

        self.tracker.untrack(session_id);
        info!(
            session_id,
            duration_ms = started.elapsed().as_millis() as u64,
            "connection closed"
        );
    }

    async fn serve_session(
        &self,
        mut stream: TcpStream,
        session_id: u64,
        shutdown: &CancellationToken,
    ) {
        if let Err(e) = authenticate_client(&mut stream, &self.profile, session_id as u32).await {
            warn!(session_id, error = %compact_err(&e), "client auth failed");
            return;
        }

        let backend = match self.pool.borrow(shutdown).await {
            Ok(backend) => backend,
            Err(e) => {
                error!(session_id, error = %compact_err(&e), "backend unavailable");
                respond_backend_unavailable(&mut stream).await;
                return;
            }
        };
        self.tracker.track_backend(session_id, backend.peer_addr());
        debug!(session_id, backend = %backend.peer_addr(), "backend connection acquired");

        // Backend sessions are single-use: the pipe consumes this one and
        // both sockets are dropped when it returns.
        let (bytes_up, bytes_down, err) = pipe(stream, backend).await;
        match err {
            Some(e) => {
                warn!(session_id, error = %e, bytes_up, bytes_down, "pipe ended with error")
            }
            None => info!(session_id, bytes_up, bytes_down, "pipe finished"),
        }
    }
}

async fn drain_workers(workers: &mut JoinSet<()>) {
    while workers.join_next().await.is_some() {}
}

/// Best-effort protocol-correct error response when no backend session could
/// be acquired: wait for one client command packet, then answer it with ERR.
async fn respond_backend_unavailable(stream: &mut TcpStream) {
    match timeout(BACKEND_UNAVAILABLE_READ_WINDOW, read_packet(stream)).await {
        Ok(Ok((seq, _command))) => {
            let err = ErrPacket::new(ER_CON_COUNT_ERROR, "backend unavailable");
            let _ = write_packet(stream, seq.wrapping_add(1), &build_err_packet(&err)).await;
        }
        _ => {}
    }
}

/// Stream raw bytes both ways until either side finishes.
///
/// Returns (client->backend bytes, backend->client bytes, first non-benign
/// error). The first direction to finish cancels the other so neither side
/// lingers on a half-open peer.
async fn pipe(client: TcpStream, backend: BackendConn) -> (u64, u64, Option<std::io::Error>) {
    let stop = CancellationToken::new();
    let (client_read, client_write) = tokio::io::split(client);
    let (backend_read, backend_write) = tokio::io::split(backend.into_stream());

    let up = tokio::spawn(copy_half(
        client_read,
        backend_write,
        "client->backend",
        stop.clone(),
    ));
    let down = tokio::spawn(copy_half(
        backend_read,
        client_write,
        "backend->client",
        stop,
    ));

    let (up_res, down_res) = tokio::join!(up, down);
    let (bytes_up, up_err) = up_res.unwrap_or((0, None));
    let (bytes_down, down_err) = down_res.unwrap_or((0, None));

    let err = [up_err, down_err]
        .into_iter()
        .flatten()
        .find(|e| !is_conn_close_err(e));
    (bytes_up, bytes_down, err)
}

/// Copy one direction until EOF, an error, or the other direction stops.
async fn copy_half<R, W>(
    mut reader: R,
    mut writer: W,
    direction: &'static str,
    stop: CancellationToken,
) -> (u64, Option<std::io::Error>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 8192];
    let mut total = 0u64;

    let err = loop {
        let n = tokio::select! {
            _ = stop.cancelled() => break None,
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    debug!("{}: EOF after {} bytes", direction, total);
                    break None;
                }
                Ok(n) => n,
                Err(e) => break Some(e),
            },
        };
        trace!("{}: {} bytes", direction, n);
        if let Err(e) = writer.write_all(&buf[..n]).await {
            break Some(e);
        }
        if let Err(e) = writer.flush().await {
            break Some(e);
        }
        total += n as u64;
    };

    // Unblock the opposite direction and push a FIN to our peer.
    stop.cancel();
    let _ = writer.shutdown().await;

    (total, err)
}

/// Classify errors that just mean "the connection went away".
///
/// Kind matching covers tokio/std; the substring checks keep classification
/// stable for wrapped errors whose kind is lost.
pub fn is_conn_close_err(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::UnexpectedEof
        | ErrorKind::BrokenPipe
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected => true,
        _ => {
            let msg = err.to_string();
            msg.contains("connection reset by peer")
                || msg.contains("broken pipe")
                || msg.contains("use of closed network connection")
                || msg.contains("read/write on closed pipe")
        }
    }
}
