//! SSH session management.
//!
//! The appliance admits exactly one administrative session, so all commands
//! funnel through a single authenticated channel owned by a dedicated
//! worker thread. Async callers submit commands over an mpsc queue and
//! await a oneshot reply; the worker serializes execution in FIFO order.
//! While the session is down the worker reconnects with exponential
//! backoff and in-flight commands fail fast as retriable.

use std::io::Read;
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use base64::Engine;
use parking_lot::Mutex;
use ssh2::Session;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::error::{Result, ShellError};

/// How the worker connects and authenticates to the appliance.
#[derive(Clone)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    /// PEM private key path; password auth is used when absent.
    pub private_key: Option<PathBuf>,
    pub password: Option<String>,
    /// Base64 of the appliance's host public key, pinned at deploy time.
    pub pinned_host_key: Option<String>,
    /// Lab-only escape hatch: accept any host key.
    pub insecure_skip_host_key: bool,
    pub connect_timeout: Duration,
    /// libssh2 keepalive probe interval; keeps idle sessions alive across
    /// NAT/firewall state timeouts.
    pub keepalive_interval: Duration,
}

// Manual impl so credentials never end up in logs.
impl std::fmt::Debug for SshConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("private_key", &self.private_key)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("insecure_skip_host_key", &self.insecure_skip_host_key)
            .finish_non_exhaustive()
    }
}

impl SshConfig {
    pub fn new(host: String, username: String) -> Self {
        Self {
            host,
            port: 22,
            username,
            private_key: None,
            password: None,
            pinned_host_key: None,
            insecure_skip_host_key: false,
            connect_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(15),
        }
    }
}

/// Seam between the worker loop and the wire. The production transport is
/// [`SshTransport`]; tests substitute a scripted fake.
pub trait ShellTransport: Send {
    fn exec(&mut self, command: &str) -> Result<String>;
}

/// Produces a fresh transport on each (re)connection attempt.
pub type TransportFactory = Box<dyn FnMut() -> Result<Box<dyn ShellTransport>> + Send>;

/// Live SSH session to the appliance shell.
pub struct SshTransport {
    session: Session,
}

impl SshTransport {
    pub fn connect(cfg: &SshConfig) -> Result<Self> {
        use std::net::ToSocketAddrs;

        let addr = format!("{}:{}", cfg.host, cfg.port);
        let resolved = addr
            .to_socket_addrs()
            .map_err(|e| ShellError::Unavailable(format!("resolve {addr}: {e}")))?
            .next()
            .ok_or_else(|| ShellError::Unavailable(format!("no address for {addr}")))?;
        // Only the connect itself is bounded; established-session reads
        // may legitimately run long (full-copy snapshots).
        let stream = TcpStream::connect_timeout(&resolved, cfg.connect_timeout)
            .map_err(|e| ShellError::Unavailable(format!("connect {addr}: {e}")))?;

        let mut session = Session::new()
            .map_err(|e| ShellError::Unavailable(format!("session init: {e}")))?;
        session.set_tcp_stream(stream);
        session
            .handshake()
            .map_err(|e| ShellError::Unavailable(format!("ssh handshake: {e}")))?;

        Self::verify_host_key(cfg, &session)?;

        if let Some(key_path) = &cfg.private_key {
            session
                .userauth_pubkey_file(&cfg.username, None, key_path, None)
                .map_err(|e| ShellError::Unauthenticated(format!("pubkey auth: {e}")))?;
        } else if let Some(password) = &cfg.password {
            session
                .userauth_password(&cfg.username, password)
                .map_err(|e| ShellError::Unauthenticated(format!("password auth: {e}")))?;
        } else {
            return Err(ShellError::Unauthenticated(
                "no private key or password configured".into(),
            ));
        }
        if !session.authenticated() {
            return Err(ShellError::Unauthenticated("authentication rejected".into()));
        }

        session.set_keepalive(true, cfg.keepalive_interval.as_secs() as u32);
        info!(host = %cfg.host, port = cfg.port, user = %cfg.username, "appliance shell session established");
        Ok(Self { session })
    }

    fn verify_host_key(cfg: &SshConfig, session: &Session) -> Result<()> {
        let (actual, _key_type) = session
            .host_key()
            .ok_or_else(|| ShellError::Unauthenticated("appliance sent no host key".into()))?;

        match &cfg.pinned_host_key {
            Some(pinned) => {
                let expected = base64::engine::general_purpose::STANDARD
                    .decode(pinned.trim())
                    .map_err(|e| {
                        ShellError::Unauthenticated(format!("pinned host key is not base64: {e}"))
                    })?;
                if actual != expected.as_slice() {
                    return Err(ShellError::Unauthenticated(
                        "appliance host key does not match pinned key".into(),
                    ));
                }
                Ok(())
            }
            None if cfg.insecure_skip_host_key => {
                warn!(
                    host = %cfg.host,
                    "INSECURE: accepting unverified appliance host key; do not use outside a lab"
                );
                Ok(())
            }
            None => Err(ShellError::Unauthenticated(
                "no pinned host key configured (set one, or opt into insecure mode)".into(),
            )),
        }
    }
}

impl ShellTransport for SshTransport {
    fn exec(&mut self, command: &str) -> Result<String> {
        let mut channel = self
            .session
            .channel_session()
            .map_err(|e| ShellError::Unavailable(format!("open channel: {e}")))?;
        channel
            .exec(command)
            .map_err(|e| ShellError::Unavailable(format!("exec: {e}")))?;

        let mut stdout = String::new();
        channel
            .read_to_string(&mut stdout)
            .map_err(|e| ShellError::Unavailable(format!("read: {e}")))?;
        let mut stderr = String::new();
        channel
            .stderr()
            .read_to_string(&mut stderr)
            .map_err(|e| ShellError::Unavailable(format!("read stderr: {e}")))?;
        channel
            .wait_close()
            .map_err(|e| ShellError::Unavailable(format!("close: {e}")))?;

        // The shell reports failures inline rather than via exit status;
        // merge the streams and let the parser classify.
        if !stderr.is_empty() {
            stdout.push('\n');
            stdout.push_str(&stderr);
        }
        Ok(stdout)
    }
}

struct Request {
    command: String,
    reply: oneshot::Sender<Result<String>>,
}

/// Clonable async handle to the worker thread.
pub struct ShellChannel {
    tx: Mutex<mpsc::Sender<Request>>,
}

impl ShellChannel {
    /// Execute one command through the serial session.
    pub async fn exec(&self, command: String) -> Result<String> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .lock()
            .send(Request {
                command,
                reply: reply_tx,
            })
            .map_err(|_| ShellError::Unavailable("shell worker stopped".into()))?;
        reply_rx
            .await
            .map_err(|_| ShellError::Unavailable("shell worker dropped request".into()))?
    }
}

/// Spawn the session worker. The thread exits when every [`ShellChannel`]
/// handle has been dropped.
pub fn spawn_worker(factory: TransportFactory) -> Arc<ShellChannel> {
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("appliance-shell".into())
        .spawn(move || worker_loop(rx, factory))
        .expect("spawn appliance-shell worker");
    Arc::new(ShellChannel { tx: Mutex::new(tx) })
}

fn reconnect_backoff() -> backoff::ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_secs(1))
        .with_multiplier(2.0)
        .with_randomization_factor(0.1)
        .with_max_interval(Duration::from_secs(60))
        .with_max_elapsed_time(None)
        .build()
}

fn worker_loop(rx: mpsc::Receiver<Request>, mut factory: TransportFactory) {
    let mut transport: Option<Box<dyn ShellTransport>> = None;
    let mut backoff = reconnect_backoff();
    let mut next_attempt = Instant::now();

    loop {
        // Poll the queue with a short timeout so reconnection makes
        // progress during idle periods.
        match rx.recv_timeout(Duration::from_millis(500)) {
            Ok(req) => {
                maybe_reconnect(&mut transport, &mut factory, &mut backoff, &mut next_attempt);
                let result = match transport.as_mut() {
                    Some(t) => {
                        debug!(command = %req.command, "executing appliance command");
                        let result = t.exec(&req.command);
                        if matches!(result, Err(ShellError::Unavailable(_))) {
                            error!("appliance session lost; reconnecting in background");
                            transport = None;
                            backoff.reset();
                            next_attempt = Instant::now();
                        }
                        result
                    }
                    None => Err(ShellError::Unavailable(
                        "appliance session down, reconnection in progress".into(),
                    )),
                };
                let _ = req.reply.send(result);
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                maybe_reconnect(&mut transport, &mut factory, &mut backoff, &mut next_attempt);
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                debug!("all shell handles dropped; worker exiting");
                break;
            }
        }
    }
}

fn maybe_reconnect(
    transport: &mut Option<Box<dyn ShellTransport>>,
    factory: &mut TransportFactory,
    backoff: &mut backoff::ExponentialBackoff,
    next_attempt: &mut Instant,
) {
    if transport.is_some() || Instant::now() < *next_attempt {
        return;
    }
    match factory() {
        Ok(t) => {
            *transport = Some(t);
            backoff.reset();
        }
        Err(e) => {
            let delay = backoff
                .next_backoff()
                .unwrap_or_else(|| Duration::from_secs(60));
            warn!(error = %e, retry_in = ?delay, "appliance reconnect failed");
            *next_attempt = Instant::now() + delay;
        }
    }
}
