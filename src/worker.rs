//! Single-threaded request processing
//!
//! Every table is owned by one [`Processor`], which lives on a dedicated worker thread
//! and handles requests strictly in the order they were sent.
//! Nothing else touches the table, so the table itself needs no locking.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};
use crate::resource::ResourceChangedEvent;
use crate::traits::ResourceChangedListener;

/// Where a worker sends the answer to a blocking request
pub type Responder<T> = oneshot::Sender<T>;

/// The worker-side half of a manager
pub(crate) trait Processor: Send + 'static {
    type Request: Send + 'static;

    /// Handle one request. Failures are logged here, they never reach the sender
    fn process(&mut self, request: Self::Request);

    /// A short name of the request, for logs
    fn describe(request: &Self::Request) -> &'static str;

    /// Roll back a transaction that the last request left open.
    /// Returns whether there was one
    fn abort_open_transaction(&mut self) -> bool;
}

/// Answer a blocking request. The sender may have given up waiting, which is only worth a log line
pub(crate) fn reply<T>(responder: Responder<T>, value: T, request: &'static str) {
    if responder.send(value).is_err() {
        log::debug!("Nobody waits for the {} response anymore", request);
    }
}

enum Envelope<R> {
    Request(R),
    Shutdown,
}

/// A cloneable way to queue requests, also used by a worker to send requests to itself
pub(crate) struct Mailbox<R> {
    name: &'static str,
    sender: mpsc::UnboundedSender<Envelope<R>>,
}

impl<R> Clone for Mailbox<R> {
    fn clone(&self) -> Self {
        Self { name: self.name, sender: self.sender.clone() }
    }
}

impl<R> Mailbox<R> {
    pub fn send(&self, request: R) -> Result<()> {
        self.sender
            .send(Envelope::Request(request))
            .map_err(|_| Error::WorkerGone(self.name))
    }
}

pub(crate) struct Inbox<R> {
    receiver: mpsc::UnboundedReceiver<Envelope<R>>,
}

/// Create the queue of a worker. The mailbox can be handed to the processor before the worker starts
pub(crate) fn queue<R>(name: &'static str) -> (Mailbox<R>, Inbox<R>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (Mailbox { name, sender }, Inbox { receiver })
}


/// Queues the notifications of the resource store as requests,
/// so that they are processed in order with everything else
pub(crate) struct ChangeForwarder<R> {
    mailbox: Mailbox<R>,
    wrap: fn(ResourceChangedEvent) -> R,
}

impl<R> ChangeForwarder<R> {
    pub fn new(mailbox: Mailbox<R>, wrap: fn(ResourceChangedEvent) -> R) -> Self {
        Self { mailbox, wrap }
    }
}

impl<R: Send + 'static> ResourceChangedListener for ChangeForwarder<R> {
    fn resource_changed(&self, event: ResourceChangedEvent) {
        if event.is_empty() {
            return;
        }
        if let Err(err) = self.mailbox.send((self.wrap)(event)) {
            log::warn!("Dropping a resource change: {}", err);
        }
    }
}


/// A running worker thread and the way to reach it
pub(crate) struct Worker<P: Processor> {
    name: &'static str,
    mailbox: Mailbox<P::Request>,
    closed: AtomicBool,
    thread: Mutex<Option<JoinHandle<P>>>,
}

impl<P: Processor> Worker<P> {
    pub fn spawn(name: &'static str, processor: P, mailbox: Mailbox<P::Request>, inbox: Inbox<P::Request>) -> Result<Self> {
        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(name, processor, inbox))?;
        log::info!("{} worker started", name);
        Ok(Self {
            name, mailbox,
            closed: AtomicBool::new(false),
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Queue a request without waiting for it
    pub fn send(&self, request: P::Request) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed(self.name));
        }
        self.mailbox.send(request)
    }

    /// Queue a request that carries a responder, and wait for its response.
    ///
    /// The wait is bounded: a worker that does not answer in time is considered wedged.
    pub async fn request<T, F>(&self, build: F, timeout: Duration) -> Result<T>
    where
        F: FnOnce(Responder<T>) -> P::Request,
    {
        let (responder, response) = oneshot::channel();
        let request = build(responder);
        let description = P::describe(&request);
        self.send(request)?;

        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(Error::WorkerGone(self.name)),
            Err(_) => {
                log::error!("{}: waited too long ({:?}) for a {} response", self.name, timeout, description);
                Err(Error::Timeout { request: description, waited: timeout })
            },
        }
    }

    /// Refuse further requests, let the worker drain its queue, and get the processor back
    pub fn shutdown(&self) -> Result<P> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(Error::Closed(self.name));
        }
        // The worker may be gone already, in which case join() tells us how it went
        let _ = self.mailbox.sender.send(Envelope::Shutdown);

        let thread = self.thread.lock().unwrap_or_else(PoisonError::into_inner).take();
        match thread {
            None => Err(Error::WorkerGone(self.name)),
            Some(handle) => handle.join().map_err(|_| Error::WorkerGone(self.name)),
        }
    }
}


fn run<P: Processor>(name: &'static str, mut processor: P, mut inbox: Inbox<P::Request>) -> P {
    while let Some(envelope) = inbox.receiver.blocking_recv() {
        match envelope {
            Envelope::Request(request) => handle(name, &mut processor, request),
            Envelope::Shutdown => {
                inbox.receiver.close();
                // Requests a worker sent to itself may still be queued
                while let Ok(envelope) = inbox.receiver.try_recv() {
                    if let Envelope::Request(request) = envelope {
                        handle(name, &mut processor, request);
                    }
                }
                break;
            },
        }
    }
    log::info!("{} worker stopped", name);
    processor
}

fn handle<P: Processor>(name: &'static str, processor: &mut P, request: P::Request) {
    let description = P::describe(&request);
    let started = Instant::now();
    log::debug!("{}: processing {}", name, description);

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| processor.process(request)));
    if let Err(payload) = outcome {
        log::error!("{}: INVALID TERMINATION while processing {}: {}", name, description, panic_message(&payload));
    }
    if processor.abort_open_transaction() {
        log::error!("{}: {}", name, Error::TransactionLeftOpen(description));
    }

    log::debug!("{}: {} done in {:?}", name, description, started.elapsed());
}

fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
