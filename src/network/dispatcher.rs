//! Dispatcher - routes channel messages to live requests
//!
//! The dispatcher owns the registry of live requests. It is the only code
//! that touches the registry and runs on the same single thread as the
//! requests, so no locking is involved. Each request is a task; commands
//! reach it through its own FIFO queue.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::request::{Control, FetchParams, Request, RequestContext};
use crate::protocol::{Message, RequestId};

/// Dispatcher errors
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Outbound channel closed")]
    OutboundClosed,
}

pub type DispatchResult<T> = Result<T, DispatchError>;

/// Why the dispatcher stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// A Quit message arrived
    Quit,
    /// The inbound channel reached its end
    ChannelClosed,
    /// SIGINT or equivalent
    Interrupted,
}

/// Registry entry for a live request
struct Slot {
    /// Distinguishes successive requests that reuse an id
    serial: u64,
    control: mpsc::UnboundedSender<Control>,
    task: JoinHandle<()>,
}

impl Slot {
    /// The request no longer takes commands (it has reported its end)
    fn is_retired(&self) -> bool {
        self.control.is_closed()
    }
}

/// Live requests keyed by id
#[derive(Default)]
pub struct Registry {
    slots: HashMap<RequestId, Slot>,
    next_serial: u64,
}

impl Registry {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.slots.get(&id).is_some_and(|slot| !slot.is_retired())
    }

    /// Send a command to a live request; unknown ids are ignored
    fn deliver(&self, id: RequestId, control: Control) -> bool {
        match self.slots.get(&id) {
            Some(slot) => slot.control.send(control).is_ok(),
            None => false,
        }
    }

    /// Forget a finished request, unless the id was reused in the meantime
    fn release(&mut self, id: RequestId, serial: u64) {
        if self.slots.get(&id).is_some_and(|slot| slot.serial == serial) {
            self.slots.remove(&id);
        }
    }

    fn abort_all(&mut self) {
        for (_, slot) in self.slots.drain() {
            slot.task.abort();
        }
    }
}

/// Single-threaded message router
pub struct Dispatcher {
    ctx: Arc<RequestContext>,
    registry: Registry,
    finished_tx: mpsc::UnboundedSender<(RequestId, u64)>,
    finished_rx: mpsc::UnboundedReceiver<(RequestId, u64)>,
}

impl Dispatcher {
    pub fn new(ctx: RequestContext) -> Self {
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        Self {
            ctx: Arc::new(ctx),
            registry: Registry::default(),
            finished_tx,
            finished_rx,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Serve until Quit, the end of the inbound channel, or `interrupt`
    ///
    /// All live requests are aborted on the way out.
    pub async fn run<F>(
        &mut self,
        mut inbound: mpsc::Receiver<Message>,
        outbound: mpsc::Sender<Message>,
        interrupt: F,
    ) -> DispatchResult<Shutdown>
    where
        F: std::future::Future<Output = ()>,
    {
        tokio::pin!(interrupt);

        let reason = loop {
            tokio::select! {
                message = inbound.recv() => match message {
                    Some(Message::Quit) => break Shutdown::Quit,
                    Some(message) => self.handle(message, &outbound),
                    None => break Shutdown::ChannelClosed,
                },
                Some((id, serial)) = self.finished_rx.recv() => {
                    self.registry.release(id, serial);
                }
                _ = outbound.closed() => {
                    self.registry.abort_all();
                    return Err(DispatchError::OutboundClosed);
                }
                _ = &mut interrupt => break Shutdown::Interrupted,
            }
        };

        if self.registry.is_empty() {
            tracing::info!("Dispatcher stopping ({:?})", reason);
        } else {
            tracing::info!(
                "Dispatcher stopping ({:?}), aborting {} live request(s)",
                reason,
                self.registry.len()
            );
            self.registry.abort_all();
        }
        Ok(reason)
    }

    /// Route one inbound message
    fn handle(&mut self, message: Message, outbound: &mpsc::Sender<Message>) {
        match message {
            Message::Fetch {
                id,
                scheme,
                host,
                port,
                request,
                identity,
            } => {
                let params = FetchParams {
                    scheme,
                    host,
                    port,
                    request,
                    identity,
                };
                self.start(id, params, outbound.clone());
            }
            Message::TrustVerdict { id, accept } => self.route(id, Control::TrustVerdict(accept)),
            Message::Proceed { id } => self.route(id, Control::Proceed),
            Message::Stop { id } => self.route(id, Control::Stop),
            other => {
                tracing::warn!(
                    "Ignoring outbound-only message {:#04x} for request {:?}",
                    other.type_id(),
                    other.request_id()
                );
            }
        }
    }

    fn route(&self, id: RequestId, control: Control) {
        if !self.registry.deliver(id, control) {
            tracing::debug!("{:?} for unknown request {}, ignored", control, id);
        }
    }

    fn start(&mut self, id: RequestId, params: FetchParams, outbound: mpsc::Sender<Message>) {
        if self.registry.contains(id) {
            tracing::warn!("Fetch for request {} which is still live, ignored", id);
            return;
        }

        let serial = self.registry.next_serial;
        self.registry.next_serial += 1;

        let (control, control_rx) = mpsc::unbounded_channel();
        let request = Request::new(id, params, self.ctx.clone(), control_rx, outbound);
        let finished = self.finished_tx.clone();
        let task = tokio::spawn(async move {
            request.run().await;
            let _ = finished.send((id, serial));
        });

        // A retired request with the same id keeps shutting down on its own
        self.registry.slots.insert(
            id,
            Slot {
                serial,
                control,
                task,
            },
        );
    }
}
