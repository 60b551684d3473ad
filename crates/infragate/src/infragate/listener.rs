use std::{
    net::SocketAddr,
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
    task::JoinHandle,
};

use crate::infragate::{error::GatewayError, net};

const BACKOFF_INITIAL: Duration = Duration::from_millis(5);
const BACKOFF_MAX: Duration = Duration::from_secs(1);
const ERROR_LOG_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Created,
    Accepting,
    Draining,
    Closed,
}

impl ListenerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Accepting => "accepting",
            Self::Draining => "draining",
            Self::Closed => "closed",
        }
    }
}

/// Receives accepted connections. Implementations must not block.
pub trait Dispatch: Send + Sync + 'static {
    fn dispatch(&self, stream: TcpStream, peer: SocketAddr, listen_addr: Arc<str>);
}

/// A bound listen socket and its accept task.
#[derive(Debug)]
pub struct ListenerHandle {
    listen_addr: Arc<str>,
    local_addr: SocketAddr,
    stop: watch::Sender<bool>,
    state: watch::Receiver<ListenerState>,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn listen_addr(&self) -> &str {
        &self.listen_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ListenerState> {
        self.state.clone()
    }

    /// Stop accepting and wait until the socket is released.
    /// Connections already handed to the dispatcher keep running.
    pub async fn close(self) {
        let _ = self.stop.send(true);
        if let Err(err) = self.task.await {
            tracing::warn!(listen_addr = %self.listen_addr, err = %err, "listener: accept task failed");
        }
    }
}

/// Bind `listen_addr` and start its accept loop.
///
/// `running` counts live accept loops. The loop holds `dispatch` weakly and exits
/// once the dispatcher is gone.
pub async fn bind(
    listen_addr: &str,
    dispatch: Weak<dyn Dispatch>,
    running: Arc<watch::Sender<usize>>,
) -> Result<ListenerHandle, GatewayError> {
    let bind_addr = net::normalize_bind_addr(listen_addr);
    let ln = TcpListener::bind(bind_addr.as_ref())
        .await
        .map_err(|source| GatewayError::Bind {
            addr: listen_addr.to_string(),
            source,
        })?;
    let local_addr = ln.local_addr().map_err(|source| GatewayError::Bind {
        addr: listen_addr.to_string(),
        source,
    })?;

    let listen_addr: Arc<str> = Arc::from(listen_addr);
    let (stop_tx, stop_rx) = watch::channel(false);
    let (state_tx, state_rx) = watch::channel(ListenerState::Created);

    running.send_modify(|n| *n += 1);
    let task = tokio::spawn(accept_loop(
        ln,
        listen_addr.clone(),
        dispatch,
        stop_rx,
        state_tx,
        running,
    ));

    tracing::info!(listen_addr = %listen_addr, local_addr = %local_addr, "listener: bound");

    Ok(ListenerHandle {
        listen_addr,
        local_addr,
        stop: stop_tx,
        state: state_rx,
        task,
    })
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    // A dropped handle counts as a stop request.
    let _ = stop.wait_for(|v| *v).await;
}

async fn accept_loop(
    ln: TcpListener,
    listen_addr: Arc<str>,
    dispatch: Weak<dyn Dispatch>,
    mut stop: watch::Receiver<bool>,
    state: watch::Sender<ListenerState>,
    running: Arc<watch::Sender<usize>>,
) {
    state.send_replace(ListenerState::Accepting);
    let mut backoff = AcceptBackoff::new();

    loop {
        let accepted = tokio::select! {
            biased;
            _ = stopped(&mut stop) => break,
            res = ln.accept() => res,
        };

        match accepted {
            Ok((stream, peer)) => {
                backoff.reset();
                let Some(d) = dispatch.upgrade() else {
                    break;
                };
                if tracing::enabled!(tracing::Level::DEBUG) {
                    tracing::debug!(client = %peer, listen_addr = %listen_addr, "listener: accepted");
                }
                d.dispatch(stream, peer, listen_addr.clone());
            }
            Err(err) => {
                let delay = backoff.next_delay();
                if let Some(suppressed) = backoff.should_log(Instant::now()) {
                    tracing::warn!(
                        listen_addr = %listen_addr,
                        err = %err,
                        suppressed,
                        retry_in = %humantime::format_duration(delay),
                        "listener: accept failed"
                    );
                }
                tokio::select! {
                    biased;
                    _ = stopped(&mut stop) => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    state.send_replace(ListenerState::Draining);
    drop(ln);
    state.send_replace(ListenerState::Closed);
    running.send_modify(|n| *n = n.saturating_sub(1));
    tracing::info!(listen_addr = %listen_addr, "listener: closed");
}

/// Exponential accept-retry delay with throttled error logging.
#[derive(Debug)]
pub struct AcceptBackoff {
    delay: Option<Duration>,
    last_log: Option<Instant>,
    suppressed: u64,
}

impl AcceptBackoff {
    pub fn new() -> Self {
        Self {
            delay: None,
            last_log: None,
            suppressed: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let next = match self.delay {
            None => BACKOFF_INITIAL,
            Some(d) => (d * 2).min(BACKOFF_MAX),
        };
        self.delay = Some(next);
        next
    }

    pub fn reset(&mut self) {
        self.delay = None;
    }

    /// `Some(suppressed)` when an error should be logged now, carrying the number
    /// of errors swallowed since the previous log line.
    pub fn should_log(&mut self, now: Instant) -> Option<u64> {
        match self.last_log {
            Some(last) if now.duration_since(last) < ERROR_LOG_INTERVAL => {
                self.suppressed += 1;
                None
            }
            _ => {
                self.last_log = Some(now);
                Some(std::mem::take(&mut self.suppressed))
            }
        }
    }
}
