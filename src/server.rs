//! TCP listener for pixel flood clients.
//!
//! Accepts connections, registers each one with the shared `ServerState`
//! and runs its command loop on a separate task.

use crate::config::Config;
use crate::framebuffer::Framebuffer;
use crate::handler;
use crate::state::ServerState;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

/// Listen backlog
const BACKLOG: i32 = 1024;

/// Wait after an accept failure that is not specific to one connection
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Server instance
pub struct Server {
    listener: TcpListener,
    framebuffer: Arc<Framebuffer>,
    state: Arc<ServerState>,
    connection_limit: Arc<Semaphore>,
    max_line_length: usize,
}

/// Cloneable handle used to stop a running server.
#[derive(Clone)]
pub struct ServerHandle {
    state: Arc<ServerState>,
}

impl Server {
    /// Bind the listening socket.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(config: &Config, framebuffer: Arc<Framebuffer>) -> io::Result<Self> {
        let addr: SocketAddr = config
            .listen
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let listener = TcpListener::from_std(create_listener(addr)?)?;
        info!(address = %listener.local_addr()?, "Server listening");

        Ok(Server {
            listener,
            framebuffer,
            state: ServerState::new(config.max_connections),
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
            max_line_length: config.max_line_length,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn framebuffer(&self) -> &Arc<Framebuffer> {
        &self.framebuffer
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            state: Arc::clone(&self.state),
        }
    }

    /// Accept connections until stopped. The listening socket is closed when
    /// this returns.
    pub async fn run(self) -> io::Result<()> {
        let mut shutdown = self.state.subscribe();

        // Held across failed accepts so a failure does not cycle the slot
        let mut slot: Option<OwnedSemaphorePermit> = None;

        while !self.state.is_stopping() {
            // Wait for a connection slot
            let permit = match slot.take() {
                Some(permit) => permit,
                None => tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    permit = Arc::clone(&self.connection_limit).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                },
            };

            let accepted = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "New connection");

                    let (stream, registration) = match self.register(stream) {
                        Ok(Some(registered)) => registered,
                        Ok(None) => {
                            debug!(peer = %peer, "Refusing connection during shutdown");
                            break;
                        }
                        Err(e) => {
                            warn!(peer = %peer, error = %e, "Failed to register connection");
                            continue;
                        }
                    };

                    let framebuffer = Arc::clone(&self.framebuffer);
                    let shutdown = self.state.subscribe();
                    let max_line_length = self.max_line_length;

                    tokio::spawn(async move {
                        handler::handle_connection(
                            stream,
                            peer,
                            &framebuffer,
                            shutdown,
                            max_line_length,
                        )
                        .await;
                        drop(registration);
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    slot = Some(permit);
                    if !backoff(&e, &mut shutdown).await {
                        break;
                    }
                }
            }
        }

        info!("Accept loop stopped");
        Ok(())
    }

    /// Register a freshly accepted stream. The registry keeps a duplicate of
    /// the socket so shutdown can close it from outside the handler.
    fn register(
        &self,
        stream: TcpStream,
    ) -> io::Result<Option<(TcpStream, crate::state::Registration)>> {
        let stream = stream.into_std()?;
        let Some(registration) = self.state.register(&stream)? else {
            return Ok(None);
        };
        Ok(Some((TcpStream::from_std(stream)?, registration)))
    }
}

impl ServerHandle {
    /// Stop accepting and close every open connection.
    ///
    /// Safe to call more than once and from any thread.
    pub fn stop(&self) {
        if self.state.close_all() {
            info!("Server stopping");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.state.is_stopping()
    }

    /// Number of currently open connections.
    pub fn connection_count(&self) -> usize {
        self.state.len()
    }
}

/// Errors that only affect the connection being accepted.
fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

/// Pause after a failed accept. Anything other than a per-connection error
/// (typically running out of file descriptors) fails again immediately, so
/// wait before retrying. Returns `false` if shutdown began while waiting.
async fn backoff(e: &io::Error, shutdown: &mut watch::Receiver<bool>) -> bool {
    if is_connection_error(e) {
        return true;
    }

    tokio::select! {
        biased;
        _ = shutdown.changed() => false,
        _ = tokio::time::sleep(ACCEPT_BACKOFF) => true,
    }
}

/// Create a non-blocking listener with `SO_REUSEADDR`.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framebuffer::Color;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn test_config() -> Config {
        Config {
            listen: "127.0.0.1:0".to_string(),
            width: 64,
            height: 64,
            max_line_length: 64,
            max_connections: 16,
            workers: None,
            log_level: "info".to_string(),
        }
    }

    type Running = (SocketAddr, Arc<Framebuffer>, ServerHandle, JoinHandle<io::Result<()>>);

    fn start(config: &Config) -> Running {
        let framebuffer = Arc::new(Framebuffer::new(config.width, config.height).unwrap());
        let server = Server::bind(config, Arc::clone(&framebuffer)).unwrap();
        let addr = server.local_addr().unwrap();
        let handle = server.handle();
        let task = tokio::spawn(server.run());
        (addr, framebuffer, handle, task)
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        timeout(WAIT, async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_bind_invalid_address() {
        let mut config = test_config();
        config.listen = "not an address".to_string();
        let framebuffer = Arc::new(Framebuffer::new(1, 1).unwrap());

        let err = Server::bind(&config, framebuffer).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_bind_address_in_use() {
        let config = test_config();
        let framebuffer = Arc::new(Framebuffer::new(1, 1).unwrap());
        let first = Server::bind(&config, Arc::clone(&framebuffer)).unwrap();

        let mut taken = test_config();
        taken.listen = first.local_addr().unwrap().to_string();
        assert!(Server::bind(&taken, framebuffer).is_err());
    }

    #[tokio::test]
    async fn test_clients_set_pixels() {
        let config = test_config();
        let (addr, fb, handle, task) = start(&config);

        let mut a = TcpStream::connect(addr).await.unwrap();
        let mut b = TcpStream::connect(addr).await.unwrap();
        a.write_all(b"PX 1 2 FF0000\ngarbage\nPX 3 4 00FF00\n").await.unwrap();
        b.write_all(b"PX 5 6 0000ff\r\nPX 1000 1000 FFFFFF\n").await.unwrap();

        wait_for(|| {
            fb.get(1, 2) == Color::new(255, 0, 0)
                && fb.get(3, 4) == Color::new(0, 255, 0)
                && fb.get(5, 6) == Color::new(0, 0, 255)
        })
        .await;

        handle.stop();
        timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_no_response_is_written() {
        let config = test_config();
        let (addr, fb, handle, task) = start(&config);

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"PX 0 0 ABCDEF\nnonsense\n").await.unwrap();
        wait_for(|| fb.get(0, 0) == Color::new(0xAB, 0xCD, 0xEF)).await;

        // Shutdown closes the connection; nothing but end-of-stream arrives
        handle.stop();
        let mut buf = Vec::new();
        let n = timeout(WAIT, client.read_to_end(&mut buf)).await.unwrap().unwrap();
        assert_eq!(n, 0);

        timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stop_closes_connections_and_listener() {
        let config = test_config();
        let (addr, _fb, handle, task) = start(&config);

        let mut clients = Vec::new();
        for _ in 0..3 {
            clients.push(TcpStream::connect(addr).await.unwrap());
        }
        wait_for(|| handle.connection_count() == 3).await;

        handle.stop();
        assert!(handle.is_stopped());
        timeout(WAIT, task).await.unwrap().unwrap().unwrap();

        for client in &mut clients {
            let mut buf = [0u8; 16];
            let result = timeout(WAIT, client.read(&mut buf)).await.unwrap();
            assert!(matches!(result, Ok(0) | Err(_)));
        }

        wait_for(|| handle.connection_count() == 0).await;
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let config = test_config();
        let (_addr, _fb, handle, task) = start(&config);

        handle.stop();
        handle.clone().stop();
        timeout(WAIT, task).await.unwrap().unwrap().unwrap();
        handle.stop();
        assert!(handle.is_stopped());
    }

    #[tokio::test]
    async fn test_stop_before_run() {
        let config = test_config();
        let framebuffer = Arc::new(Framebuffer::new(4, 4).unwrap());
        let server = Server::bind(&config, framebuffer).unwrap();

        server.handle().stop();
        timeout(WAIT, server.run()).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_client_disconnect_deregisters() {
        let config = test_config();
        let (addr, _fb, handle, task) = start(&config);

        let client = TcpStream::connect(addr).await.unwrap();
        wait_for(|| handle.connection_count() == 1).await;

        drop(client);
        wait_for(|| handle.connection_count() == 0).await;

        handle.stop();
        timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_long_line_closes_only_that_connection() {
        let config = test_config();
        let (addr, fb, handle, task) = start(&config);

        let mut hostile = TcpStream::connect(addr).await.unwrap();
        let mut polite = TcpStream::connect(addr).await.unwrap();
        wait_for(|| handle.connection_count() == 2).await;

        hostile.write_all(&[b'7'; 256]).await.unwrap();
        let mut buf = [0u8; 16];
        let result = timeout(WAIT, hostile.read(&mut buf)).await.unwrap();
        assert!(matches!(result, Ok(0) | Err(_)));

        polite.write_all(b"PX 9 9 123456\n").await.unwrap();
        wait_for(|| fb.get(9, 9) == Color::new(0x12, 0x34, 0x56)).await;
        wait_for(|| handle.connection_count() == 1).await;

        handle.stop();
        timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    }

    #[test]
    fn test_connection_errors_classified() {
        assert!(is_connection_error(&io::ErrorKind::ConnectionAborted.into()));
        assert!(is_connection_error(&io::ErrorKind::ConnectionReset.into()));
        // EMFILE
        assert!(!is_connection_error(&io::Error::from_raw_os_error(24)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_on_fd_exhaustion() {
        let (_tx, mut rx) = watch::channel(false);
        let emfile = io::Error::from_raw_os_error(24);

        let started = tokio::time::Instant::now();
        assert!(backoff(&emfile, &mut rx).await);
        assert!(started.elapsed() >= ACCEPT_BACKOFF);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_backoff_on_connection_error() {
        let (_tx, mut rx) = watch::channel(false);
        let aborted = io::Error::from(io::ErrorKind::ConnectionAborted);

        let started = tokio::time::Instant::now();
        assert!(backoff(&aborted, &mut rx).await);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_backoff_interrupted_by_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        let emfile = io::Error::from_raw_os_error(24);

        let waiting = tokio::spawn(async move { backoff(&emfile, &mut rx).await });
        tx.send_replace(true);

        assert!(!timeout(WAIT, waiting).await.unwrap().unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_clients_union() {
        const CLIENTS: u16 = 8;

        let config = test_config();
        let (addr, fb, handle, task) = start(&config);

        // Client `c` owns column `c`
        let writers: Vec<_> = (0..CLIENTS)
            .map(|c| {
                tokio::spawn(async move {
                    let mut stream = TcpStream::connect(addr).await.unwrap();
                    let mut payload = String::new();
                    for y in 0..64 {
                        payload.push_str(&format!("PX {} {} {:02X}{:02X}80\n", c, y, c + 1, y));
                    }
                    stream.write_all(payload.as_bytes()).await.unwrap();
                    stream.shutdown().await.unwrap();
                })
            })
            .collect();

        for writer in writers {
            writer.await.unwrap();
        }

        wait_for(|| {
            (0..CLIENTS)
                .all(|c| (0..64u16).all(|y| fb.get(c, y) == Color::new(c as u8 + 1, y as u8, 0x80)))
        })
        .await;

        handle.stop();
        timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    }
}
