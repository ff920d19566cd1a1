//! Per-request connection state machine
//!
//! Each request runs as its own task and owns its socket, buffers and
//! timers outright. The task walks through [`State`] until the transport is
//! shut down; dropping the task drops everything it owns, so no timer or
//! readiness registration can outlive it.
//!
//! ```text
//! Connecting ──► TlsHandshake ──► AwaitingHeader ──► StreamingBody ──► Closing
//!      │        (gemini only)     (gemini only)            ▲              ▲
//!      └───────────────────────────────────────────────────┘              │
//!                        any state ──► Error ─────────────────────────────┘
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::mpsc;

use super::resolver::{ResolveError, Resolver};
use super::stream::{BufferedStream, Transport};
use super::tls::{Handshaker, TlsError};
use crate::protocol::{ClientIdentity, Message, RequestId};
use crate::scheme::gemini::{self, HeaderError};
use crate::scheme::Scheme;

/// Which part of a connection attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStep {
    Socket,
    Connect,
}

impl std::fmt::Display for ConnectStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectStep::Socket => f.write_str("socket"),
            ConnectStep::Connect => f.write_str("connect"),
        }
    }
}

/// Request failures; the `Display` text is what the consumer sees
#[derive(Error, Debug)]
pub enum RequestError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("can't connect to {host}: {step}: {source}")]
    Connect {
        host: String,
        step: ConnectStep,
        #[source]
        source: io::Error,
    },

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("handshake failed: {0}")]
    Handshake(#[from] TlsError),

    #[error("{0}")]
    Reply(#[from] HeaderError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Commands addressed to a live request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    TrustVerdict(bool),
    Proceed,
    Stop,
}

/// What to fetch, as carried by a Fetch message
#[derive(Debug, Clone)]
pub struct FetchParams {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub request: Vec<u8>,
    pub identity: Option<ClientIdentity>,
}

/// Services and limits shared by every request
#[derive(Clone)]
pub struct RequestContext {
    pub resolver: Arc<dyn Resolver>,
    pub handshaker: Arc<dyn Handshaker>,
    pub handshake_timeout: Duration,
    pub connect_timeout: Option<Duration>,
    pub chunk_size: usize,
}

/// Lifecycle of a request; only the variants that own a transport carry it
enum State {
    Connecting,
    TlsHandshake {
        tcp: TcpStream,
    },
    AwaitingHeader {
        stream: BufferedStream,
    },
    StreamingBody {
        stream: BufferedStream,
    },
    Closing {
        stream: Option<BufferedStream>,
        /// Emit EndOfStream on entry
        notify: bool,
    },
    Error {
        error: RequestError,
        stream: Option<BufferedStream>,
    },
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::Connecting => "CONNECTING",
            State::TlsHandshake { .. } => "TLS_HANDSHAKE",
            State::AwaitingHeader { .. } => "AWAITING_HEADER",
            State::StreamingBody { .. } => "STREAMING_BODY",
            State::Closing { .. } => "CLOSING",
            State::Error { .. } => "ERROR",
        }
    }

    /// Give up on whatever the state was doing, keeping its transport
    fn abandon(self) -> State {
        let stream = match self {
            State::Connecting => None,
            State::TlsHandshake { tcp } => Some(BufferedStream::new(Transport::Plain(tcp))),
            State::AwaitingHeader { stream } | State::StreamingBody { stream } => Some(stream),
            State::Closing { stream, .. } | State::Error { stream, .. } => stream,
        };
        State::Closing {
            stream,
            notify: false,
        }
    }
}

/// The request's view of its control queue
struct Inbox {
    id: RequestId,
    rx: mpsc::UnboundedReceiver<Control>,
}

impl Inbox {
    /// Drive `fut` to completion unless a Stop arrives first
    ///
    /// Verdicts and proceeds are meaningless while `fut` runs and are
    /// dropped. A closed queue counts as Stop.
    async fn or_stop<F: Future>(&mut self, fut: F) -> Option<F::Output> {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                biased;
                control = self.rx.recv() => match control {
                    Some(Control::Stop) | None => return None,
                    Some(other) => {
                        tracing::warn!("Request {}: ignoring unexpected {:?}", self.id, other);
                    }
                },
                out = &mut fut => return Some(out),
            }
        }
    }

    /// Park until the trust verdict; `None` if stopped instead
    async fn verdict(&mut self) -> Option<bool> {
        loop {
            match self.rx.recv().await {
                Some(Control::TrustVerdict(accept)) => return Some(accept),
                Some(Control::Stop) | None => return None,
                Some(Control::Proceed) => {
                    tracing::warn!("Request {}: Proceed before trust verdict", self.id);
                }
            }
        }
    }

    /// Park until the consumer decides about the body
    async fn proceed(&mut self) -> bool {
        loop {
            match self.rx.recv().await {
                Some(Control::Proceed) => return true,
                Some(Control::Stop) | None => return false,
                Some(Control::TrustVerdict(_)) => {
                    tracing::warn!(
                        "Request {}: stray trust verdict while awaiting Proceed",
                        self.id
                    );
                }
            }
        }
    }

    /// Stop accepting commands; the id is free for reuse from now on
    fn close(&mut self) {
        self.rx.close();
    }
}

/// One in-flight fetch
pub struct Request {
    id: RequestId,
    params: FetchParams,
    ctx: Arc<RequestContext>,
    inbox: Inbox,
    events: mpsc::Sender<Message>,
    /// The consumer has gone away; nothing more can be reported
    detached: bool,
}

impl Request {
    pub fn new(
        id: RequestId,
        params: FetchParams,
        ctx: Arc<RequestContext>,
        control: mpsc::UnboundedReceiver<Control>,
        events: mpsc::Sender<Message>,
    ) -> Self {
        Self {
            id,
            params,
            ctx,
            inbox: Inbox { id, rx: control },
            events,
            detached: false,
        }
    }

    /// Run the request to completion
    pub async fn run(mut self) {
        tracing::info!(
            "Request {}: {}://{}:{}",
            self.id,
            self.params.scheme,
            self.params.host,
            self.params.port
        );

        let mut state = State::Connecting;
        loop {
            let from = state.name();
            state = match state {
                State::Connecting => self.connect().await,
                State::TlsHandshake { tcp } => self.tls_handshake(tcp).await,
                State::AwaitingHeader { stream } => self.await_header(stream).await,
                State::StreamingBody { stream } => self.stream_body(stream).await,
                State::Error { error, stream } => self.fail(error, stream).await,
                State::Closing { stream, notify } => {
                    self.close(stream, notify).await;
                    break;
                }
            };

            if self.detached && !matches!(state, State::Closing { .. }) {
                state = state.abandon();
            }
            tracing::debug!("Request {}: {} -> {}", self.id, from, state.name());
        }

        tracing::debug!("Request {}: released", self.id);
    }

    async fn emit(&mut self, message: Message) -> bool {
        if !self.detached && self.events.send(message).await.is_err() {
            tracing::warn!("Request {}: consumer gone", self.id);
            self.detached = true;
        }
        !self.detached
    }

    async fn connect(&mut self) -> State {
        let host = self.params.host.clone();
        let resolve = self.ctx.resolver.resolve(&host, self.params.port);
        let candidates: VecDeque<SocketAddr> = match self.inbox.or_stop(resolve).await {
            None => return stopped(None),
            Some(Err(e)) => return State::Error { error: e.into(), stream: None },
            Some(Ok(addrs)) => addrs.into(),
        };

        let mut last_error = None;
        for addr in candidates {
            let socket = if addr.is_ipv4() {
                TcpSocket::new_v4()
            } else {
                TcpSocket::new_v6()
            };
            let socket = match socket {
                Ok(socket) => socket,
                Err(e) => {
                    tracing::debug!("Request {}: socket for {} failed: {}", self.id, addr, e);
                    last_error = Some((ConnectStep::Socket, e));
                    continue;
                }
            };

            let limit = self.ctx.connect_timeout;
            let attempt = async move {
                match limit {
                    Some(limit) => tokio::time::timeout(limit, socket.connect(addr))
                        .await
                        .unwrap_or_else(|_| Err(io::ErrorKind::TimedOut.into())),
                    None => socket.connect(addr).await,
                }
            };

            match self.inbox.or_stop(attempt).await {
                None => return stopped(None),
                Some(Ok(tcp)) => {
                    tracing::debug!("Request {}: connected to {}", self.id, addr);
                    return if self.params.scheme.uses_tls() {
                        State::TlsHandshake { tcp }
                    } else {
                        let stream = BufferedStream::new(Transport::Plain(tcp));
                        self.send_request(stream).await
                    };
                }
                Some(Err(e)) => {
                    tracing::debug!("Request {}: connect to {} failed: {}", self.id, addr, e);
                    last_error = Some((ConnectStep::Connect, e));
                }
            }
        }

        let error = match last_error {
            Some((step, source)) => RequestError::Connect { host, step, source },
            None => ResolveError::NoAddresses { host }.into(),
        };
        State::Error { error, stream: None }
    }

    async fn tls_handshake(&mut self, tcp: TcpStream) -> State {
        let handshake = self.ctx.handshaker.handshake(
            &self.params.host,
            tcp,
            self.params.identity.as_ref(),
        );
        let timed = tokio::time::timeout(self.ctx.handshake_timeout, handshake);

        let (transport, fingerprint) = match self.inbox.or_stop(timed).await {
            None => return stopped(None),
            Some(Err(_)) => {
                return State::Error {
                    error: RequestError::HandshakeTimeout,
                    stream: None,
                };
            }
            Some(Ok(Err(e))) => return State::Error { error: e.into(), stream: None },
            Some(Ok(Ok(done))) => done,
        };
        let stream = BufferedStream::new(transport);

        tracing::debug!("Request {}: peer certificate {}", self.id, fingerprint);
        if !self.emit(Message::TrustCheck { id: self.id, fingerprint }).await {
            return stream_closing(stream, false);
        }

        match self.inbox.verdict().await {
            Some(true) => self.send_request(stream).await,
            Some(false) => {
                tracing::info!("Request {}: certificate rejected", self.id);
                stream_closing(stream, true)
            }
            None => stopped(Some(stream)),
        }
    }

    /// Write the wire request, then move on to the reply
    async fn send_request(&mut self, mut stream: BufferedStream) -> State {
        stream.queue(&self.params.request);
        match self.inbox.or_stop(stream.flush_out()).await {
            None => stopped(Some(stream)),
            Some(Err(e)) => State::Error { error: e.into(), stream: Some(stream) },
            Some(Ok(())) if self.params.scheme.has_header() => State::AwaitingHeader { stream },
            Some(Ok(())) => State::StreamingBody { stream },
        }
    }

    async fn await_header(&mut self, mut stream: BufferedStream) -> State {
        let header = loop {
            match gemini::scan_header(stream.buffered()) {
                Err(e) => return State::Error { error: e.into(), stream: Some(stream) },
                Ok(Some((header, used))) => {
                    stream.consume(used);
                    break header;
                }
                Ok(None) if stream.is_eof() => {
                    return State::Error {
                        error: HeaderError::Truncated.into(),
                        stream: Some(stream),
                    };
                }
                Ok(None) => {}
            }

            match self.inbox.or_stop(stream.fill()).await {
                None => return stopped(Some(stream)),
                Some(Err(e)) => return State::Error { error: e.into(), stream: Some(stream) },
                Some(Ok(_)) => {}
            }
        };

        tracing::info!("Request {}: {} {}", self.id, header.status, header.meta);
        let has_body = header.has_body();
        let reply = Message::ReplyHeader {
            id: self.id,
            status: header.status,
            meta: header.meta,
        };
        if !self.emit(reply).await {
            return stream_closing(stream, false);
        }

        if !has_body {
            return stream_closing(stream, true);
        }
        if self.inbox.proceed().await {
            State::StreamingBody { stream }
        } else {
            stopped(Some(stream))
        }
    }

    async fn stream_body(&mut self, mut stream: BufferedStream) -> State {
        loop {
            while !stream.buffered().is_empty() {
                let data = stream.drain(self.ctx.chunk_size).to_vec();
                let send = self.events.send(Message::BodyChunk { id: self.id, data });
                match self.inbox.or_stop(send).await {
                    None => return stopped(Some(stream)),
                    Some(Err(_)) => {
                        self.detached = true;
                        return stream_closing(stream, false);
                    }
                    Some(Ok(())) => {}
                }
            }

            // Nothing left to wait for once the peer has shut down
            if !stream.readiness().read {
                return stream_closing(stream, true);
            }

            match self.inbox.or_stop(stream.fill()).await {
                None => return stopped(Some(stream)),
                Some(Err(e)) => return State::Error { error: e.into(), stream: Some(stream) },
                Some(Ok(_)) => {}
            }
        }
    }

    async fn fail(&mut self, error: RequestError, stream: Option<BufferedStream>) -> State {
        tracing::warn!("Request {}: {}", self.id, error);
        self.inbox.close();
        self.emit(Message::error(self.id, error.to_string())).await;
        State::Closing {
            stream,
            notify: false,
        }
    }

    async fn close(&mut self, stream: Option<BufferedStream>, notify: bool) {
        self.inbox.close();
        if notify {
            self.emit(Message::EndOfStream { id: self.id }).await;
        }

        let Some(mut stream) = stream else {
            return;
        };
        let dropped = stream.discard();
        if dropped > 0 {
            tracing::debug!("Request {}: discarded {} undelivered bytes", self.id, dropped);
        }

        // A peer that never completes close_notify must not pin the request
        match tokio::time::timeout(self.ctx.handshake_timeout, stream.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!("Request {}: shutdown error: {}", self.id, e),
            Err(_) => tracing::debug!("Request {}: shutdown timed out", self.id),
        }

        let (read, written) = stream.traffic();
        tracing::debug!(
            "Request {}: closed {} transport, {} bytes in, {} bytes out",
            self.id,
            if stream.get_ref().is_tls() { "tls" } else { "plain" },
            read,
            written
        );
    }
}

fn stopped(stream: Option<BufferedStream>) -> State {
    State::Closing {
        stream,
        notify: true,
    }
}

fn stream_closing(stream: BufferedStream, notify: bool) -> State {
    State::Closing {
        stream: Some(stream),
        notify,
    }
}
