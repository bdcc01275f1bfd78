//! Resilient outbound connections.
//!
//! A [`ReconnectClient`] dials its target with backoff, hands every
//! established stream to a [`ConnectionHandler`] and redials when the
//! handler returns or a disconnect is requested. Only [`stop`] or an
//! expired dial timeout ends the loop.
//!
//! [`stop`]: ReconnectClient::stop

mod backoff;

pub use backoff::Backoff;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::time::Instant;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::address::Address;
use crate::peer::protocol::ProtocolError;
use crate::transport::{self, BoxedStream};

/// How long a handler gets to wind down after abort before it is cancelled.
const ABORT_GRACE: Duration = Duration::from_secs(1);

/// Fires (flips to `true`) when the client tears the connection down.
pub type AbortSignal = watch::Receiver<bool>;

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), ProtocolError>> + Send>>;

/// Owns the wire protocol of one established connection.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn handle(&self, stream: BoxedStream, abort: AbortSignal) -> HandlerFuture;
}

/// Connection state of a [`ReconnectClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Dialing,
    Connected,
    Stopped,
}

impl ClientState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ClientState::Dialing,
            2 => ClientState::Connected,
            3 => ClientState::Stopped,
            _ => ClientState::Disconnected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Request {
    Disconnect,
    Stop,
}

const REQ_NONE: u8 = 0;
const REQ_DISCONNECT: u8 = 1;
const REQ_STOP: u8 = 2;

type FailureCallback = Box<dyn Fn() + Send + Sync>;

struct Inner {
    address: Address,
    tls: Option<TlsConnector>,
    handler: Arc<dyn ConnectionHandler>,

    timeout: Option<Duration>,
    on_failed: Option<FailureCallback>,

    // single-slot control mailbox; a pending stop is never overwritten
    request: AtomicU8,
    notify: Notify,

    state: AtomicU8,
    started: AtomicBool,
}

/// Reconnecting client for one remote address.
#[derive(Clone)]
pub struct ReconnectClient {
    inner: Arc<Inner>,
}

impl ReconnectClient {
    pub fn new(
        address: Address,
        tls: Option<TlsConnector>,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Self {
        Self::build(address, tls, handler, None, None)
    }

    /// Like [`ReconnectClient::new`], but gives up once `timeout` passes
    /// without a successful dial and calls `on_failed`.
    pub fn with_timeout(
        address: Address,
        tls: Option<TlsConnector>,
        handler: Arc<dyn ConnectionHandler>,
        timeout: Duration,
        on_failed: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self::build(address, tls, handler, Some(timeout), Some(Box::new(on_failed)))
    }

    fn build(
        address: Address,
        tls: Option<TlsConnector>,
        handler: Arc<dyn ConnectionHandler>,
        timeout: Option<Duration>,
        on_failed: Option<FailureCallback>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                address,
                tls,
                handler,
                timeout,
                on_failed,
                request: AtomicU8::new(REQ_NONE),
                notify: Notify::new(),
                state: AtomicU8::new(ClientState::Disconnected as u8),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Launch the connection loop. Calling this more than once has no effect.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(inner.run());
    }

    /// Drop the current connection and redial.
    pub fn disconnect(&self) {
        let _ = self.inner.request.compare_exchange(
            REQ_NONE,
            REQ_DISCONNECT,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.inner.notify.notify_one();
    }

    /// Shut down permanently, aborting any dial or connection in progress.
    pub fn stop(&self) {
        self.inner.request.store(REQ_STOP, Ordering::Release);
        self.inner.notify.notify_one();
    }

    pub fn connected(&self) -> bool {
        self.state() == ClientState::Connected
    }

    pub fn state(&self) -> ClientState {
        ClientState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn target(&self) -> &Address {
        &self.inner.address
    }
}

impl Inner {
    async fn run(self: Arc<Self>) {
        let target = self.address.to_string();
        let mut init_delay = false;
        loop {
            if self.connect(&target, init_delay).await {
                break;
            }
            info!(target = %target, "Reconnecting");
            init_delay = true;
        }
        self.set_state(ClientState::Stopped);
        debug!(target = %target, "Connection loop stopped");
    }

    /// Run one connection to completion. Returns true when the loop must end.
    async fn connect(&self, target: &str, init_delay: bool) -> bool {
        let Some(stream) = self.dial(target, init_delay).await else {
            return true;
        };

        self.set_state(ClientState::Connected);
        info!(target = %target, "Connected");

        let (abort_tx, abort_rx) = watch::channel(false);
        let mut task = tokio::spawn(self.handler.handle(stream, abort_rx));

        let stop = tokio::select! {
            result = &mut task => {
                match result {
                    Ok(Err(e)) => warn!(target = %target, error = %e, "Failed to handle connection"),
                    Err(e) => warn!(target = %target, error = %e, "Connection handler panicked"),
                    Ok(Ok(())) => {}
                }
                // a stop that arrived while the handler was finishing still wins
                self.take_request() == Some(Request::Stop)
            }
            request = self.next_request() => request == Request::Stop,
        };

        let _ = abort_tx.send(true);
        if !task.is_finished() && tokio::time::timeout(ABORT_GRACE, &mut task).await.is_err() {
            task.abort();
        }

        self.set_state(ClientState::Disconnected);
        info!(target = %target, "Disconnected");
        stop
    }

    async fn dial(&self, target: &str, init_delay: bool) -> Option<BoxedStream> {
        self.set_state(ClientState::Dialing);

        let mut backoff = Backoff::default();
        if init_delay {
            backoff.init();
        }
        let deadline = self.timeout.map(|t| Instant::now() + t);

        loop {
            let sleep = tokio::time::sleep(backoff.delay());
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    request = self.next_request() => match request {
                        Request::Stop => {
                            debug!(target = %target, "Aborting connection");
                            return None;
                        }
                        Request::Disconnect => {
                            debug!(target = %target, "Not connected; ignoring disconnection request");
                        }
                    },
                    _ = wait_deadline(deadline) => {
                        self.fail(target);
                        return None;
                    }
                }
            }

            debug!(target = %target, "Connecting");
            let result = tokio::select! {
                result = transport::dial(&self.address, self.tls.as_ref()) => result,
                request = self.next_request() => match request {
                    Request::Stop => {
                        debug!(target = %target, "Aborting connection");
                        return None;
                    }
                    Request::Disconnect => continue,
                },
                _ = wait_deadline(deadline) => {
                    self.fail(target);
                    return None;
                }
            };

            match result {
                Ok(stream) => return Some(stream),
                Err(e) => {
                    backoff.fail();
                    warn!(
                        target = %target,
                        error = %e,
                        retry_in = ?backoff.delay(),
                        "Failed to connect"
                    );
                }
            }
        }
    }

    fn fail(&self, target: &str) {
        debug!(target = %target, "Connection timed out");
        if let Some(on_failed) = &self.on_failed {
            on_failed();
        }
    }

    fn take_request(&self) -> Option<Request> {
        match self.request.swap(REQ_NONE, Ordering::AcqRel) {
            REQ_STOP => {
                // stop is sticky so later waits observe it as well
                self.request.store(REQ_STOP, Ordering::Release);
                Some(Request::Stop)
            }
            REQ_DISCONNECT => Some(Request::Disconnect),
            _ => None,
        }
    }

    async fn next_request(&self) -> Request {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(request) = self.take_request() {
                return request;
            }
            notified.await;
        }
    }

    fn set_state(&self, state: ClientState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
