//! Connection driver task.
//!
//! A single task owns the link, the pending table and the reconnect state.
//! [`Client`](super::Client) handles reach it through an unbounded command
//! channel, so every state change happens on one task and in one order.

use bytes::Bytes;
use chrono::Utc;
use futures::future::BoxFuture;
use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};
use tokio_util::sync::CancellationToken;

use super::pending::{Completion, PendingTable};
use super::reconnect::Backoff;
use super::{ConnectionState, Notification, CONNECTION_TOPIC};
use crate::dispatcher::{Context, Dispatcher, Topic};
use crate::envelope::{try_unpack_as, Candidate, Envelope};
use crate::transport::{Link, Transport};
use crate::types::{Config, Error, RequestId};

pub(super) enum Command {
    Connect,
    Send {
        bytes: Bytes,
    },
    Request {
        id: RequestId,
        bytes: Bytes,
        completion: Box<dyn Completion>,
    },
}

enum Event {
    Command(Command),
    Connected(std::io::Result<Link>),
    Frame(Bytes),
    Closed,
    RetryDue,
    Sweep,
    Stopped,
}

type ConnectAttempt = BoxFuture<'static, std::io::Result<Link>>;

pub(super) struct Driver<N> {
    url: String,
    transport: Arc<dyn Transport>,
    dispatcher: Arc<Dispatcher<Notification<N>>>,
    push: Vec<Candidate<N>>,
    pending: PendingTable,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    commands: mpsc::UnboundedReceiver<Command>,
    link: Option<Link>,
    connecting: Option<ConnectAttempt>,
    retry: Option<Pin<Box<Sleep>>>,
    backoff: Backoff,
    sweep: Interval,
    request_timeout: Option<Duration>,
    /// Cleared by shutdown or when the backoff runs out of attempts.
    wants_connection: bool,
    cancel: CancellationToken,
}

impl<N: Topic + Send + Sync + 'static> Driver<N> {
    pub(super) fn new(
        config: &Config,
        transport: Arc<dyn Transport>,
        dispatcher: Arc<Dispatcher<Notification<N>>>,
        push: Vec<Candidate<N>>,
        commands: mpsc::UnboundedReceiver<Command>,
        state_tx: watch::Sender<ConnectionState>,
        cancel: CancellationToken,
    ) -> Self {
        let request_timeout = config.requests.timeout;
        // Ticks even without a timeout so abandoned requests get pruned.
        let period = config.requests.sweep_interval;
        let mut sweep = tokio::time::interval_at(Instant::now() + period, period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self {
            url: config.connection.url.clone(),
            transport,
            dispatcher,
            push,
            pending: PendingTable::new(),
            state: ConnectionState::Disconnected,
            state_tx,
            commands,
            link: None,
            connecting: None,
            retry: None,
            backoff: Backoff::new(&config.reconnect),
            sweep,
            request_timeout,
            wants_connection: false,
            cancel,
        }
    }

    pub(super) async fn run(mut self) {
        tracing::debug!(url = %self.url, "client driver started");

        loop {
            match self.next_event().await {
                Event::Stopped => break,
                Event::Command(command) => self.on_command(command),
                Event::Connected(result) => {
                    self.connecting = None;
                    match result {
                        Ok(link) => self.on_open(link),
                        Err(e) => {
                            tracing::warn!(
                                url = %self.url,
                                attempt = self.backoff.attempts(),
                                error = %e,
                                "connect attempt failed"
                            );
                            self.schedule_attempt();
                        }
                    }
                }
                Event::Frame(bytes) => self.on_frame(&bytes),
                Event::Closed => self.on_close("connection closed"),
                Event::RetryDue => {
                    self.retry = None;
                    self.start_connect();
                }
                Event::Sweep => self.on_sweep(),
            }
        }

        self.teardown();
    }

    async fn next_event(&mut self) -> Event {
        tokio::select! {
            _ = self.cancel.cancelled() => Event::Stopped,
            command = self.commands.recv() => match command {
                Some(command) => Event::Command(command),
                None => Event::Stopped, // every handle dropped
            },
            result = connect_attempt(&mut self.connecting) => Event::Connected(result),
            frame = next_frame(&mut self.link) => match frame {
                Some(bytes) => Event::Frame(bytes),
                None => Event::Closed,
            },
            _ = retry_timer(&mut self.retry) => Event::RetryDue,
            _ = self.sweep.tick() => Event::Sweep,
        }
    }

    // =========================================================================
    // Commands
    // =========================================================================

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect => {
                if self.link.is_some() || self.connecting.is_some() || self.retry.is_some() {
                    tracing::debug!(url = %self.url, "connect ignored, already connected or connecting");
                    return;
                }
                self.wants_connection = true;
                self.backoff.reset();
                self.schedule_attempt();
            }
            Command::Send { bytes } => match &self.link {
                Some(link) => {
                    if let Err(e) = link.outbound.try_send(bytes) {
                        tracing::warn!(error = %e, "dropping outbound message");
                    }
                }
                None => tracing::debug!("dropping outbound message while disconnected"),
            },
            Command::Request {
                id,
                bytes,
                mut completion,
            } => {
                let Some(link) = &self.link else {
                    completion.reject(Error::connection_closed(format!(
                        "request {} issued while disconnected",
                        id
                    )));
                    return;
                };
                let outbound = link.outbound.clone();

                if self.pending.register(id.clone(), completion).is_err() {
                    return;
                }
                match outbound.try_send(bytes) {
                    Ok(()) => {
                        tracing::trace!(request_id = %id, pending = self.pending.len(), "request sent");
                    }
                    Err(e) => {
                        self.pending.reject(
                            &id,
                            Error::connection_closed(format!("failed to send request {}: {}", id, e)),
                        );
                    }
                }
            }
        }
    }

    // =========================================================================
    // Connection lifecycle
    // =========================================================================

    fn start_connect(&mut self) {
        tracing::debug!(url = %self.url, attempt = self.backoff.attempts(), "connecting");
        let transport = self.transport.clone();
        let url = self.url.clone();
        self.connecting = Some(Box::pin(async move { transport.connect(&url).await }));
    }

    /// Start or schedule the next attempt if a connection is wanted and none is underway.
    fn schedule_attempt(&mut self) {
        if !self.wants_connection
            || self.link.is_some()
            || self.connecting.is_some()
            || self.retry.is_some()
        {
            return;
        }

        match self.backoff.next_delay() {
            Some(delay) if delay.is_zero() => self.start_connect(),
            Some(delay) => {
                tracing::debug!(url = %self.url, delay = ?delay, "reconnect scheduled");
                self.retry = Some(Box::pin(tokio::time::sleep(delay)));
            }
            None => {
                tracing::error!(
                    url = %self.url,
                    attempts = self.backoff.attempts(),
                    "giving up on reconnecting"
                );
                self.wants_connection = false;
            }
        }
    }

    fn on_open(&mut self, link: Link) {
        tracing::info!(url = %self.url, "connected");
        self.link = Some(link);
        self.backoff.reset();
        self.transition(ConnectionState::Connected);
    }

    fn on_close(&mut self, reason: &str) {
        self.link = None;
        let rejected = self.pending.reject_all(reason);
        tracing::info!(url = %self.url, rejected, "{}", reason);
        self.transition(ConnectionState::Disconnected);
        self.schedule_attempt();
    }

    fn transition(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        self.state = state;
        self.state_tx.send_replace(state);
        self.dispatcher
            .publish(&Notification::Connection(state), &Context::local());
    }

    fn teardown(&mut self) {
        self.wants_connection = false;
        self.connecting = None;
        self.retry = None;
        self.link = None;

        let mut rejected = self.pending.reject_all("client shut down");
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let Command::Request { mut completion, .. } = command {
                completion.reject(Error::connection_closed("client shut down"));
                rejected += 1;
            }
        }

        self.transition(ConnectionState::Disconnected);
        tracing::info!(url = %self.url, rejected, "client driver stopped");
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    pub(super) fn on_frame(&mut self, bytes: &[u8]) {
        let envelope = match Envelope::decode(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(len = bytes.len(), error = %e, "dropping malformed frame");
                return;
            }
        };

        match &envelope.header.request_id {
            Some(id) => {
                if let Ok(elapsed) = self.pending.resolve(id, &envelope.content) {
                    tracing::trace!(
                        request_id = %id,
                        type_tag = %envelope.content.type_tag,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "response received"
                    );
                }
            }
            None => self.on_push(&envelope),
        }
    }

    fn on_push(&self, envelope: &Envelope) {
        let Some((message, tag)) = try_unpack_as(&envelope.content, &self.push) else {
            tracing::warn!(
                type_tag = %envelope.content.type_tag,
                "dropping push that matches no known payload"
            );
            return;
        };

        if message.topic() == CONNECTION_TOPIC {
            tracing::warn!(type_tag = %tag, topic = CONNECTION_TOPIC, "dropping push on reserved topic");
            return;
        }

        let context = Context {
            type_tag: Some(tag.to_string()),
            sent_at: Some(envelope.header.timestamp),
            received_at: Utc::now(),
        };
        let notification = Notification::Push(message);
        let delivered = self.dispatcher.publish(&notification, &context);
        tracing::trace!(topic = %notification.topic(), type_tag = %tag, delivered, "push published");
    }

    fn on_sweep(&mut self) {
        let abandoned = self.pending.prune_abandoned();
        if abandoned > 0 {
            tracing::debug!(abandoned, "pruned requests nobody is waiting for");
        }

        let Some(timeout) = self.request_timeout else {
            return;
        };
        let expired = self.pending.sweep_expired(Instant::now(), timeout);
        if expired > 0 {
            tracing::warn!(expired, timeout = ?timeout, "requests timed out");
        }
    }
}

async fn connect_attempt(attempt: &mut Option<ConnectAttempt>) -> std::io::Result<Link> {
    match attempt {
        Some(fut) => fut.await,
        None => pending().await,
    }
}

async fn next_frame(link: &mut Option<Link>) -> Option<Bytes> {
    match link {
        Some(link) => link.inbound.recv().await,
        None => pending().await,
    }
}

async fn retry_timer(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}
