//! SSH tunnels shared by every router connection to the same host.
//!
//! A [`TunnelPool`] caches one tunnel per `host:port`. Each stream opened
//! through a tunnel holds a user count on it and refreshes its last-used
//! timestamp on every byte read or written. The GC sweep only tears down
//! tunnels with no users whose last traffic is older than the idle
//! threshold.
//!
//! The default [`SshProcessConnector`] runs the system `ssh` client with a
//! local port forward, after checking the target against the configured
//! known-hosts file.

use crate::socket::BoxedStream;
use async_trait::async_trait;
use dashmap::DashMap;
use pamr_types::config::TunnelConfig;
use pamr_types::{PamrError, PamrResult};
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// An established tunnel able to open streams to its target.
#[async_trait]
pub trait TunnelTransport: Send + Sync {
    /// Open a new byte stream to the target through the tunnel.
    async fn open_stream(&self) -> PamrResult<BoxedStream>;

    /// Tear the tunnel down.
    async fn close(&self);
}

/// Establishes tunnels.
#[async_trait]
pub trait TunnelConnector: Send + Sync + 'static {
    async fn establish(&self, host: &str, port: u16) -> PamrResult<Arc<dyn TunnelTransport>>;
}

/// A cached tunnel.
pub struct Tunnel {
    key: String,
    transport: Arc<dyn TunnelTransport>,
    users: AtomicUsize,
    last_used: Mutex<Instant>,
}

impl Tunnel {
    fn new(key: String, transport: Arc<dyn TunnelTransport>) -> Self {
        Self {
            key,
            transport,
            users: AtomicUsize::new(0),
            last_used: Mutex::new(Instant::now()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Streams currently open through this tunnel.
    pub fn users(&self) -> usize {
        self.users.load(Ordering::SeqCst)
    }

    pub fn last_used(&self) -> Instant {
        *self.last_used.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn touch(&self) {
        *self.last_used.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn acquire(&self) {
        self.users.fetch_add(1, Ordering::SeqCst);
        self.touch();
    }

    fn release(&self) {
        self.users.fetch_sub(1, Ordering::SeqCst);
        self.touch();
    }

    fn is_idle(&self, now: Instant, threshold: Duration) -> bool {
        self.users() == 0 && now.saturating_duration_since(self.last_used()) > threshold
    }
}

/// Stream carried by a pooled tunnel. Dropping it releases the tunnel.
pub struct TunneledStream {
    inner: BoxedStream,
    tunnel: Arc<Tunnel>,
}

impl Drop for TunneledStream {
    fn drop(&mut self) {
        self.tunnel.release();
    }
}

impl AsyncRead for TunneledStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if matches!(poll, Poll::Ready(Ok(()))) && buf.filled().len() > before {
            self.tunnel.touch();
        }
        poll
    }
}

impl AsyncWrite for TunneledStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write(cx, data);
        if matches!(poll, Poll::Ready(Ok(n)) if n > 0) {
            self.tunnel.touch();
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Cache of tunnels keyed by `host:port`.
pub struct TunnelPool {
    connector: Arc<dyn TunnelConnector>,
    tunnels: DashMap<String, Arc<Tunnel>>,
    /// Per-host creation locks so a host never gets two tunnels while other
    /// hosts connect in parallel.
    establishing: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    idle_threshold: Duration,
}

impl TunnelPool {
    pub fn new(connector: Arc<dyn TunnelConnector>, idle_threshold: Duration) -> Self {
        Self {
            connector,
            tunnels: DashMap::new(),
            establishing: DashMap::new(),
            idle_threshold,
        }
    }

    /// Pool with the GC sweep running every `gc_period`, if set.
    ///
    /// The sweep task stops once the pool is dropped.
    pub fn start(
        connector: Arc<dyn TunnelConnector>,
        idle_threshold: Duration,
        gc_period: Option<Duration>,
    ) -> Arc<Self> {
        let pool = Arc::new(Self::new(connector, idle_threshold));
        if let Some(period) = gc_period {
            let weak = Arc::downgrade(&pool);
            tokio::spawn(gc_loop(weak, period));
            debug!(?period, ?idle_threshold, "Tunnel GC started");
        }
        pool
    }

    /// Open a stream to `host:port`, reusing a cached tunnel when there is one.
    pub async fn connect(&self, host: &str, port: u16) -> PamrResult<TunneledStream> {
        let tunnel = self.get_or_create(host, port).await?;
        let opened = tunnel.transport.open_stream().await;
        match opened {
            Ok(inner) => Ok(TunneledStream { inner, tunnel }),
            Err(e) => {
                tunnel.release();
                // A tunnel that cannot open streams is dead; drop it so the
                // next attempt builds a fresh one.
                if let Some((_, dead)) = self
                    .tunnels
                    .remove_if(&tunnel.key, |_, t| Arc::ptr_eq(t, &tunnel) && t.users() == 0)
                {
                    dead.transport.close().await;
                }
                Err(e)
            }
        }
    }

    /// Cached tunnel for `host:port`, or a new one. The returned tunnel has
    /// already been acquired by the caller.
    async fn get_or_create(&self, host: &str, port: u16) -> PamrResult<Arc<Tunnel>> {
        let key = format!("{host}:{port}");
        if let Some(tunnel) = self.acquire_cached(&key) {
            return Ok(tunnel);
        }

        let lock = Arc::clone(&*self.establishing.entry(key.clone()).or_default());
        let _creating = lock.lock().await;
        if let Some(tunnel) = self.acquire_cached(&key) {
            return Ok(tunnel);
        }

        info!(target_host = %key, "Opening SSH tunnel");
        let transport = self.connector.establish(host, port).await?;
        let tunnel = Arc::new(Tunnel::new(key.clone(), transport));
        tunnel.acquire();
        self.tunnels.insert(key, Arc::clone(&tunnel));
        Ok(tunnel)
    }

    // Acquire while holding the shard guard so a concurrent sweep cannot
    // collect the tunnel between lookup and acquire.
    fn acquire_cached(&self, key: &str) -> Option<Arc<Tunnel>> {
        self.tunnels.get(key).map(|entry| {
            entry.acquire();
            Arc::clone(entry.value())
        })
    }

    /// Remove idle tunnels from the cache as of `now` and return them.
    pub fn collect_idle(&self, now: Instant) -> Vec<Arc<Tunnel>> {
        let candidates: Vec<String> = self
            .tunnels
            .iter()
            .filter(|entry| entry.value().is_idle(now, self.idle_threshold))
            .map(|entry| entry.key().clone())
            .collect();
        candidates
            .into_iter()
            .filter_map(|key| {
                self.tunnels
                    .remove_if(&key, |_, t| t.is_idle(now, self.idle_threshold))
                    .map(|(_, tunnel)| tunnel)
            })
            .collect()
    }

    /// Tear down idle tunnels. Returns how many were closed.
    pub async fn sweep(&self) -> usize {
        let idle = self.collect_idle(Instant::now());
        for tunnel in &idle {
            info!(target_host = %tunnel.key, "Closing idle SSH tunnel");
            tunnel.transport.close().await;
        }
        idle.len()
    }

    /// Number of cached tunnels.
    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    /// Close every tunnel regardless of use.
    pub async fn close_all(&self) {
        let keys: Vec<String> = self.tunnels.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, tunnel)) = self.tunnels.remove(&key) {
                tunnel.transport.close().await;
            }
        }
    }
}

async fn gc_loop(pool: Weak<TunnelPool>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(pool) = pool.upgrade() else {
            debug!("Tunnel pool dropped, GC stopping");
            return;
        };
        let closed = pool.sweep().await;
        if closed > 0 {
            debug!(closed, remaining = pool.len(), "Tunnel GC sweep");
        }
    }
}

// ---------------------------------------------------------------------------
// Host key verification
// ---------------------------------------------------------------------------

/// Check that `known_hosts` has an entry for `host` on `port`.
///
/// Plain entries (`host`, `host,alias`, `[host]:port`) are matched here.
/// When the file only holds hashed entries (`|1|...`) the decision is left
/// to `ssh` itself, which runs with `StrictHostKeyChecking=yes`.
pub fn verify_known_host(known_hosts: &Path, host: &str, port: u16) -> PamrResult<()> {
    let fail = |reason: String| PamrError::HostKeyVerification {
        host: host.to_string(),
        reason,
    };
    let content = std::fs::read_to_string(known_hosts)
        .map_err(|e| fail(format!("cannot read {}: {e}", known_hosts.display())))?;

    let wanted = if port == 22 {
        host.to_string()
    } else {
        format!("[{host}]:{port}")
    };
    let mut hashed = false;
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let mut patterns = fields.next().unwrap_or_default();
        if patterns.starts_with('@') {
            // @cert-authority / @revoked marker
            if patterns == "@revoked" {
                continue;
            }
            patterns = fields.next().unwrap_or_default();
        }
        if patterns.starts_with("|1|") {
            hashed = true;
            continue;
        }
        if patterns.split(',').any(|p| p == wanted) {
            return Ok(());
        }
    }
    if hashed {
        debug!(host, "known_hosts is hashed, deferring host key check to ssh");
        return Ok(());
    }
    Err(fail(format!(
        "no entry for {wanted} in {}",
        known_hosts.display()
    )))
}

/// Private keys in `dir`: every file with a matching `.pub` sibling.
pub fn private_keys(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut keys: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter(|p| p.extension().map_or(true, |ext| ext != "pub"))
        .filter(|p| {
            let mut public = p.clone().into_os_string();
            public.push(".pub");
            Path::new(&public).is_file()
        })
        .collect();
    keys.sort();
    keys
}

// ---------------------------------------------------------------------------
// System ssh connector
// ---------------------------------------------------------------------------

/// Runs `ssh -N -L` to forward a local port to the router port on the remote host.
pub struct SshProcessConnector {
    config: TunnelConfig,
    program: String,
}

impl SshProcessConnector {
    pub fn new(config: TunnelConfig) -> Self {
        Self {
            config,
            program: "ssh".to_string(),
        }
    }

    fn command_args(&self, host: &str, port: u16, local_port: u16) -> Vec<String> {
        let mut args = vec![
            "-N".to_string(),
            "-L".to_string(),
            format!("127.0.0.1:{local_port}:127.0.0.1:{port}"),
            "-p".to_string(),
            self.config.port.to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "ExitOnForwardFailure=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=yes".to_string(),
            "-o".to_string(),
            format!("UserKnownHostsFile={}", self.config.known_hosts.display()),
            "-o".to_string(),
            format!(
                "ConnectTimeout={}",
                self.config.connect_timeout().as_secs().max(1)
            ),
        ];
        for key in private_keys(&self.config.key_dir) {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }
        if let Some(user) = &self.config.username {
            args.push("-l".to_string());
            args.push(user.clone());
        }
        args.push(host.to_string());
        args
    }
}

#[async_trait]
impl TunnelConnector for SshProcessConnector {
    async fn establish(&self, host: &str, port: u16) -> PamrResult<Arc<dyn TunnelTransport>> {
        verify_known_host(&self.config.known_hosts, host, self.config.port)?;

        let tunnel_err = |reason: String| PamrError::Tunnel {
            host: host.to_string(),
            reason,
        };

        // Reserve a free local port, then hand it to ssh.
        let local_port = {
            let spare = TcpListener::bind("127.0.0.1:0").await?;
            spare.local_addr()?.port()
        };

        let mut child = tokio::process::Command::new(&self.program)
            .args(self.command_args(host, port, local_port))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| tunnel_err(format!("failed to start {}: {e}", self.program)))?;

        let deadline = Instant::now() + self.config.connect_timeout();
        loop {
            if let Some(status) = child.try_wait()? {
                let mut stderr = String::new();
                if let Some(mut pipe) = child.stderr.take() {
                    let _ = pipe.read_to_string(&mut stderr).await;
                }
                let stderr = stderr.trim();
                if stderr.contains("Host key verification failed") {
                    return Err(PamrError::HostKeyVerification {
                        host: host.to_string(),
                        reason: stderr.to_string(),
                    });
                }
                return Err(tunnel_err(format!("ssh exited with {status}: {stderr}")));
            }
            if TcpStream::connect(("127.0.0.1", local_port)).await.is_ok() {
                break;
            }
            if Instant::now() >= deadline {
                let _ = child.kill().await;
                return Err(tunnel_err(format!(
                    "forward not ready after {} ms",
                    self.config.connect_timeout_ms
                )));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        info!(host, port, local_port, "SSH tunnel established");
        Ok(Arc::new(SshTunnel {
            local_port,
            child: tokio::sync::Mutex::new(child),
        }))
    }
}

struct SshTunnel {
    local_port: u16,
    child: tokio::sync::Mutex<tokio::process::Child>,
}

#[async_trait]
impl TunnelTransport for SshTunnel {
    async fn open_stream(&self) -> PamrResult<BoxedStream> {
        let stream = TcpStream::connect(("127.0.0.1", self.local_port)).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    async fn close(&self) {
        let mut child = self.child.lock().await;
        if let Err(e) = child.kill().await {
            warn!(local_port = self.local_port, "Failed to stop ssh: {e}");
        }
    }
}
