//! Transports an agent can use to reach its router.
//!
//! A [`SocketFactory`] turns `host:port` into a connected byte stream. The
//! agent never cares which kind it got.

use crate::tunnel::{SshProcessConnector, TunnelPool};
use async_trait::async_trait;
use dashmap::DashMap;
use pamr_types::config::{AgentConfig, SocketFactoryKind};
use pamr_types::{PamrError, PamrResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info};

/// A connected byte stream to the router.
pub trait RouterStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> RouterStream for T {}

pub type BoxedStream = Box<dyn RouterStream>;

/// Produces connected streams to a router.
#[async_trait]
pub trait SocketFactory: Send + Sync + 'static {
    async fn connect(&self, host: &str, port: u16) -> PamrResult<BoxedStream>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Direct TCP.
#[derive(Debug, Clone)]
pub struct PlainSocketFactory {
    /// Bound on a single connection attempt.
    pub attempt_timeout: Duration,
}

impl Default for PlainSocketFactory {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

#[async_trait]
impl SocketFactory for PlainSocketFactory {
    async fn connect(&self, host: &str, port: u16) -> PamrResult<BoxedStream> {
        let stream = tokio::time::timeout(self.attempt_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| PamrError::Timeout(self.attempt_timeout.as_millis() as u64))??;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    fn name(&self) -> &'static str {
        "plain"
    }
}

/// Every connection goes through a pooled SSH tunnel.
pub struct SshSocketFactory {
    pool: Arc<TunnelPool>,
}

impl SshSocketFactory {
    pub fn new(pool: Arc<TunnelPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SocketFactory for SshSocketFactory {
    async fn connect(&self, host: &str, port: u16) -> PamrResult<BoxedStream> {
        Ok(Box::new(self.pool.connect(host, port).await?))
    }

    fn name(&self) -> &'static str {
        "ssh"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Plain,
    Tunnel,
}

/// Direct TCP first, SSH tunnel as fallback.
///
/// The path that last worked for a `host:port` is tried first next time.
/// Host key failures are never papered over by the fallback.
pub struct PlainThenSshSocketFactory {
    plain: Arc<dyn SocketFactory>,
    ssh: Arc<dyn SocketFactory>,
    routes: DashMap<String, Route>,
}

impl PlainThenSshSocketFactory {
    pub fn new(plain: Arc<dyn SocketFactory>, ssh: Arc<dyn SocketFactory>) -> Self {
        Self {
            plain,
            ssh,
            routes: DashMap::new(),
        }
    }

    async fn try_route(&self, route: Route, host: &str, port: u16) -> PamrResult<BoxedStream> {
        match route {
            Route::Plain => self.plain.connect(host, port).await,
            Route::Tunnel => self.ssh.connect(host, port).await,
        }
    }
}

#[async_trait]
impl SocketFactory for PlainThenSshSocketFactory {
    async fn connect(&self, host: &str, port: u16) -> PamrResult<BoxedStream> {
        let key = format!("{host}:{port}");
        let first = self.routes.get(&key).map_or(Route::Plain, |r| *r);
        let second = match first {
            Route::Plain => Route::Tunnel,
            Route::Tunnel => Route::Plain,
        };

        let first_err = match self.try_route(first, host, port).await {
            Ok(stream) => return Ok(stream),
            Err(e @ PamrError::HostKeyVerification { .. }) => return Err(e),
            Err(e) => e,
        };
        debug!(target_host = %key, ?first, "Route failed, trying the other one: {first_err}");

        let stream = self.try_route(second, host, port).await?;
        info!(target_host = %key, route = ?second, "Switched router route");
        self.routes.insert(key, second);
        Ok(stream)
    }

    fn name(&self) -> &'static str {
        "ssh+plain"
    }
}

/// Build the factory selected by `config.socket_factory`.
///
/// Must be called inside a Tokio runtime: SSH variants start the tunnel GC.
pub fn socket_factory(config: &AgentConfig) -> Arc<dyn SocketFactory> {
    let plain: Arc<dyn SocketFactory> = Arc::new(PlainSocketFactory::default());
    let tunneled = || -> Arc<dyn SocketFactory> {
        let connector = Arc::new(SshProcessConnector::new(config.tunnel.clone()));
        let pool = TunnelPool::start(
            connector,
            config.tunnel.gc_idle(),
            config.tunnel.gc_period(),
        );
        Arc::new(SshSocketFactory::new(pool))
    };
    match config.socket_factory {
        SocketFactoryKind::Plain => plain,
        SocketFactoryKind::Ssh => tunneled(),
        SocketFactoryKind::SshWithPlainFirst => {
            Arc::new(PlainThenSshSocketFactory::new(plain, tunneled()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    struct CountingFactory {
        calls: AtomicUsize,
        fail_with: Option<fn() -> PamrError>,
    }

    impl CountingFactory {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail_with: None,
            })
        }

        fn failing(err: fn() -> PamrError) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail_with: Some(err),
            })
        }
    }

    #[async_trait]
    impl SocketFactory for CountingFactory {
        async fn connect(&self, _host: &str, _port: u16) -> PamrResult<BoxedStream> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.fail_with {
                Some(err) => Err(err()),
                None => {
                    let (near, _far) = tokio::io::duplex(16);
                    Ok(Box::new(near))
                }
            }
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    #[tokio::test]
    async fn test_plain_connects_to_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let factory = PlainSocketFactory::default();
        assert!(factory.connect("127.0.0.1", port).await.is_ok());
    }

    #[tokio::test]
    async fn test_plain_refused_is_an_error() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let factory = PlainSocketFactory::default();
        assert!(factory.connect("127.0.0.1", port).await.is_err());
    }

    #[tokio::test]
    async fn test_fallback_remembers_working_route() {
        let plain = CountingFactory::failing(|| PamrError::ConnectionLost);
        let ssh = CountingFactory::ok();
        let factory = PlainThenSshSocketFactory::new(plain.clone(), ssh.clone());

        factory.connect("h", 1).await.unwrap();
        factory.connect("h", 1).await.unwrap();
        assert_eq!(plain.calls.load(Ordering::SeqCst), 1);
        assert_eq!(ssh.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_plain_success_never_touches_ssh() {
        let plain = CountingFactory::ok();
        let ssh = CountingFactory::ok();
        let factory = PlainThenSshSocketFactory::new(plain.clone(), ssh.clone());
        factory.connect("h", 1).await.unwrap();
        assert_eq!(ssh.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_host_key_failure_is_not_bypassed() {
        let plain = CountingFactory::ok();
        let ssh = CountingFactory::failing(|| PamrError::HostKeyVerification {
            host: "h".into(),
            reason: "mismatch".into(),
        });
        let factory = PlainThenSshSocketFactory::new(plain.clone(), ssh.clone());
        factory.routes.insert("h:1".into(), Route::Tunnel);
        assert!(matches!(
            factory.connect("h", 1).await,
            Err(PamrError::HostKeyVerification { .. })
        ));
        assert_eq!(plain.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_factory_selection() {
        let mut config = AgentConfig::default();
        assert_eq!(socket_factory(&config).name(), "plain");
        config.socket_factory = SocketFactoryKind::SshWithPlainFirst;
        config.tunnel.gc_period_ms = 0;
        assert_eq!(socket_factory(&config).name(), "ssh+plain");
    }
}
