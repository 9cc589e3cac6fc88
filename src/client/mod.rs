//! Connection manager.
//!
//! [`Client`] is a cheap, cloneable handle onto a background driver task
//! that owns one logical connection:
//!
//! ```text
//!   Client ──commands──► Driver ──frames──► Transport link
//!     ▲                    │  ▲                  │
//!     │ oneshot            │  └──── frames ──────┘
//!     └── responses ───────┤
//!                          └── Notification ──► Dispatcher ──► listeners
//! ```
//!
//! Requests are correlated by a fresh [`RequestId`](crate::types::RequestId)
//! and settle exactly once: with the decoded response, or with
//! `ConnectionClosed` / `RequestTimeout`. Frames without a request id are
//! server pushes; they are decoded against the push candidates and
//! published to the dispatcher under the message's own topic.
//! Connection state changes are published under [`CONNECTION_TOPIC`].

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

mod driver;
pub mod pending;
pub mod reconnect;

pub use pending::{completion, Completion, PendingRequest, PendingTable, Response};
pub use reconnect::Backoff;

use crate::dispatcher::{Dispatcher, Listener, Subscription, Topic};
use crate::envelope::{self, Candidate, Header, Payload};
use crate::transport::Transport;
use crate::types::{Config, Error, RequestId, Result};
use driver::{Command, Driver};

/// Topic under which connection state changes are published.
///
/// Reserved: pushes whose payload topic is `"connection"` are dropped.
pub const CONNECTION_TOPIC: &str = "connection";

/// Whether the client currently has an open link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// What the client publishes to its dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification<N> {
    /// Published under [`CONNECTION_TOPIC`].
    Connection(ConnectionState),
    /// Server push, published under the message's own topic.
    Push(N),
}

impl<N: Topic> Topic for Notification<N> {
    fn topic(&self) -> &str {
        match self {
            Notification::Connection(_) => CONNECTION_TOPIC,
            Notification::Push(message) => message.topic(),
        }
    }
}

/// Handle onto a running connection driver.
///
/// Clones share the same connection. The driver stops on [`shutdown`](Client::shutdown)
/// or once every handle is dropped.
pub struct Client<N> {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    dispatcher: Arc<Dispatcher<Notification<N>>>,
    cancel: CancellationToken,
}

impl<N: Topic + Send + Sync + 'static> Client<N> {
    /// Spawn the driver on the current tokio runtime.
    ///
    /// `push` lists the payloads a server push may carry, in priority order.
    /// The client starts disconnected; call [`connect`](Client::connect).
    /// Fails with `Error::Config` if `config` does not validate.
    pub fn spawn(
        config: &Config,
        transport: Arc<dyn Transport>,
        dispatcher: Arc<Dispatcher<Notification<N>>>,
        push: Vec<Candidate<N>>,
    ) -> Result<Self> {
        config.validate()?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let cancel = CancellationToken::new();

        let driver = Driver::new(
            config,
            transport,
            dispatcher.clone(),
            push,
            commands_rx,
            state_tx,
            cancel.clone(),
        );
        tokio::spawn(driver.run());

        Ok(Self {
            commands: commands_tx,
            state: state_rx,
            dispatcher,
            cancel,
        })
    }

    /// Open the connection. No-op while connected or connecting.
    ///
    /// Returns once the command is queued; watch [`state`](Client::state) or
    /// subscribe to [`CONNECTION_TOPIC`] to learn when the link is up.
    pub fn connect(&self) -> Result<()> {
        self.submit(Command::Connect)
    }

    /// Fire-and-forget send. Dropped silently while disconnected.
    pub fn send<P: Payload>(&self, payload: &P) -> Result<()> {
        self.send_as(payload, P::TYPE_TAG)
    }

    /// [`send`](Client::send) with an explicit type tag.
    pub fn send_as<T: Serialize + ?Sized>(&self, payload: &T, type_tag: &str) -> Result<()> {
        let bytes = envelope::encode(payload, type_tag, Header::push())?;
        self.submit(Command::Send {
            bytes: Bytes::from(bytes),
        })
    }

    /// Send `payload` and wait for the response correlated to it.
    pub async fn request<Req: Payload, Resp: Payload>(&self, payload: &Req) -> Result<Resp> {
        self.request_as(payload, Req::TYPE_TAG, Candidate::<Resp>::exact())
            .await
    }

    /// [`request`](Client::request) with an explicit type tag and response decoder.
    ///
    /// Fails with `ConnectionClosed` immediately if the client is not
    /// connected. A response whose payload `expected` cannot decode is
    /// dropped and the request keeps waiting.
    pub async fn request_as<T, R>(&self, payload: &T, type_tag: &str, expected: Candidate<R>) -> Result<R>
    where
        T: Serialize + ?Sized,
        R: Send + 'static,
    {
        let id = RequestId::new();
        let bytes = envelope::encode(payload, type_tag, Header::request(id.clone()))?;
        let (completion, response) = pending::completion(expected);

        self.submit(Command::Request {
            id: id.clone(),
            bytes: Bytes::from(bytes),
            completion,
        })?;

        response.await.map_err(|_| {
            Error::connection_closed(format!("request {} abandoned by stopped client", id))
        })?
    }

    /// Register `listener` for `topic` on the shared dispatcher.
    pub fn subscribe(
        &self,
        topic: impl Into<String>,
        listener: Arc<dyn Listener<Notification<N>>>,
    ) -> Subscription {
        self.dispatcher.subscribe(topic, listener)
    }

    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        self.dispatcher.unsubscribe(subscription)
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher<Notification<N>>> {
        &self.dispatcher
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Stop the driver. Pending requests fail with `ConnectionClosed`.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn submit(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::connection_closed("client driver has stopped"))
    }
}

impl<N> Clone for Client<N> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            state: self.state.clone(),
            dispatcher: self.dispatcher.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<N> fmt::Debug for Client<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("state", &*self.state.borrow())
            .field("stopped", &self.cancel.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Context;
    use crate::envelope::{AnyPayload, Envelope};
    use crate::transport::{MemoryAcceptor, MemoryTransport, PeerLink};
    use crate::types::ReconnectConfig;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    // =========================================================================
    // Fixtures
    // =========================================================================

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct GetRequest {
        key: String,
    }

    impl Payload for GetRequest {
        const TYPE_TAG: &'static str = "qmq.WebGetRequest";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct GetResponse {
        value: String,
    }

    impl Payload for GetResponse {
        const TYPE_TAG: &'static str = "qmq.WebGetResponse";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct ValueChanged {
        key: String,
        value: String,
    }

    impl Payload for ValueChanged {
        const TYPE_TAG: &'static str = "qmq.WebNotification";
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Push {
        ValueChanged(ValueChanged),
    }

    impl Topic for Push {
        fn topic(&self) -> &str {
            match self {
                Push::ValueChanged(v) => &v.key,
            }
        }
    }

    struct Harness {
        client: Client<Push>,
        acceptor: MemoryAcceptor,
        events: mpsc::UnboundedReceiver<Notification<Push>>,
    }

    fn harness(config: Config) -> Harness {
        let (transport, acceptor) = MemoryTransport::new();
        let client = Client::spawn(
            &config,
            Arc::new(transport),
            Arc::new(Dispatcher::new()),
            vec![Candidate::of(Push::ValueChanged)],
        )
        .unwrap();

        let (tx, events) = mpsc::unbounded_channel();
        let recorder: Arc<dyn Listener<Notification<Push>>> = Arc::new(
            move |_: &str, n: &Notification<Push>, _: &Context| -> Result<()> {
                let _ = tx.send(n.clone());
                Ok(())
            },
        );
        client.subscribe(CONNECTION_TOPIC, recorder.clone());
        client.subscribe("foo", recorder);

        Harness {
            client,
            acceptor,
            events,
        }
    }

    async fn connect(h: &mut Harness) -> PeerLink {
        h.client.connect().unwrap();
        let peer = h.acceptor.accept().await.unwrap();
        assert_eq!(
            h.events.recv().await.unwrap(),
            Notification::Connection(ConnectionState::Connected)
        );
        peer
    }

    async fn next_envelope(peer: &mut PeerLink) -> Envelope {
        Envelope::decode(&peer.inbound.recv().await.unwrap()).unwrap()
    }

    async fn reply<P: Payload>(peer: &PeerLink, to: &Envelope, payload: &P) {
        let header = Header {
            request_id: to.header.request_id.clone(),
            timestamp: Utc::now(),
        };
        let envelope = Envelope::new(header, AnyPayload::pack(payload).unwrap());
        peer.outbound
            .send(Bytes::from(envelope.encode().unwrap()))
            .await
            .unwrap();
    }

    fn get(client: &Client<Push>, key: &str) -> tokio::task::JoinHandle<Result<GetResponse>> {
        let client = client.clone();
        let request = GetRequest {
            key: key.to_string(),
        };
        tokio::spawn(async move { client.request::<GetRequest, GetResponse>(&request).await })
    }

    // =========================================================================
    // Requests
    // =========================================================================

    #[tokio::test]
    async fn test_request_resolves_with_correlated_response() {
        let mut h = harness(Config::default());
        let mut peer = connect(&mut h).await;

        let pending = get(&h.client, "foo");
        let request = next_envelope(&mut peer).await;
        assert_eq!(request.content.type_tag, "qmq.WebGetRequest");
        assert!(request.header.request_id.is_some());
        assert_eq!(
            request.content.unpack::<GetRequest>().unwrap(),
            GetRequest {
                key: "foo".to_string()
            }
        );

        reply(
            &peer,
            &request,
            &GetResponse {
                value: "bar".to_string(),
            },
        )
        .await;

        assert_eq!(
            pending.await.unwrap().unwrap(),
            GetResponse {
                value: "bar".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_out_of_order_responses_match_by_id() {
        let mut h = harness(Config::default());
        let mut peer = connect(&mut h).await;

        let keys = ["a", "b", "c"];
        let handles: Vec<_> = keys.iter().map(|k| get(&h.client, k)).collect();

        let mut requests = Vec::new();
        for _ in 0..keys.len() {
            requests.push(next_envelope(&mut peer).await);
        }
        for request in requests.iter().rev() {
            let key = request.content.unpack::<GetRequest>().unwrap().key;
            reply(
                &peer,
                request,
                &GetResponse {
                    value: key.to_uppercase(),
                },
            )
            .await;
        }

        for (key, handle) in keys.iter().zip(handles) {
            assert_eq!(handle.await.unwrap().unwrap().value, key.to_uppercase());
        }
    }

    #[tokio::test]
    async fn test_spawn_rejects_zero_sweep_interval() {
        let mut config = Config::default();
        config.requests.timeout = Some(Duration::from_secs(1));
        config.requests.sweep_interval = Duration::ZERO;

        let (transport, acceptor) = MemoryTransport::new();
        let result = Client::<Push>::spawn(
            &config,
            Arc::new(transport),
            Arc::new(Dispatcher::new()),
            vec![Candidate::of(Push::ValueChanged)],
        );

        assert!(matches!(result, Err(Error::Config(_))));
        assert_eq!(acceptor.attempts(), 0);
    }

    #[tokio::test]
    async fn test_request_while_disconnected_fails_fast() {
        let h = harness(Config::default());
        let err = h
            .client
            .request::<GetRequest, GetResponse>(&GetRequest {
                key: "foo".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed(_)));
    }

    #[tokio::test]
    async fn test_mismatched_response_keeps_request_pending() {
        let mut h = harness(Config::default());
        let mut peer = connect(&mut h).await;

        let pending = get(&h.client, "foo");
        let request = next_envelope(&mut peer).await;

        reply(
            &peer,
            &request,
            &ValueChanged {
                key: "foo".to_string(),
                value: "wrong kind".to_string(),
            },
        )
        .await;
        reply(
            &peer,
            &request,
            &GetResponse {
                value: "bar".to_string(),
            },
        )
        .await;

        assert_eq!(pending.await.unwrap().unwrap().value, "bar");
    }

    #[tokio::test]
    async fn test_garbage_and_stray_frames_leave_connection_usable() {
        let mut h = harness(Config::default());
        let mut peer = connect(&mut h).await;

        let pending = get(&h.client, "foo");
        let request = next_envelope(&mut peer).await;

        peer.outbound
            .send(Bytes::from_static(b"\x00\x01 definitely not an envelope"))
            .await
            .unwrap();
        let stray = Envelope::new(
            Header::request(RequestId::new()),
            AnyPayload::pack(&GetResponse {
                value: "nobody asked".to_string(),
            })
            .unwrap(),
        );
        peer.outbound
            .send(Bytes::from(stray.encode().unwrap()))
            .await
            .unwrap();
        reply(
            &peer,
            &request,
            &GetResponse {
                value: "bar".to_string(),
            },
        )
        .await;

        assert_eq!(pending.await.unwrap().unwrap().value, "bar");
        assert!(h.client.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_request_times_out() {
        let mut config = Config::default();
        config.requests.timeout = Some(Duration::from_millis(200));
        config.requests.sweep_interval = Duration::from_millis(50);

        let mut h = harness(config);
        let _peer = connect(&mut h).await;

        let started = tokio::time::Instant::now();
        let err = get(&h.client, "silence").await.unwrap().unwrap_err();
        assert!(matches!(err, Error::RequestTimeout(_)));
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    // =========================================================================
    // Fire-and-forget and pushes
    // =========================================================================

    #[tokio::test]
    async fn test_send_is_dropped_while_disconnected() {
        let mut h = harness(Config::default());
        h.client
            .send(&GetRequest {
                key: "lost".to_string(),
            })
            .unwrap();

        let mut peer = connect(&mut h).await;
        h.client
            .send(&GetRequest {
                key: "kept".to_string(),
            })
            .unwrap();

        let envelope = next_envelope(&mut peer).await;
        assert_eq!(envelope.header.request_id, None);
        assert_eq!(envelope.content.unpack::<GetRequest>().unwrap().key, "kept");
        assert!(peer.inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_push_published_under_its_topic() {
        let mut h = harness(Config::default());
        let peer = connect(&mut h).await;

        let unknown = Envelope::new(
            Header::push(),
            AnyPayload::pack_as(&"?", "qmq.Unrecognized").unwrap(),
        );
        peer.outbound
            .send(Bytes::from(unknown.encode().unwrap()))
            .await
            .unwrap();

        let change = ValueChanged {
            key: "foo".to_string(),
            value: "42".to_string(),
        };
        let push = Envelope::new(Header::push(), AnyPayload::pack(&change).unwrap());
        peer.outbound
            .send(Bytes::from(push.encode().unwrap()))
            .await
            .unwrap();

        assert_eq!(
            h.events.recv().await.unwrap(),
            Notification::Push(Push::ValueChanged(change))
        );
    }

    // =========================================================================
    // Connection lifecycle
    // =========================================================================

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let mut h = harness(Config::default());
        h.client.connect().unwrap();
        h.client.connect().unwrap();
        let _peer = connect(&mut h).await;
        h.client.connect().unwrap();

        tokio::task::yield_now().await;
        assert!(h.acceptor.try_accept().is_none());
        assert_eq!(h.acceptor.attempts(), 1);
        assert_eq!(h.client.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_disconnect_rejects_pending_and_reconnects() {
        let mut h = harness(Config::default());
        let mut peer = connect(&mut h).await;

        let first = get(&h.client, "one");
        let second = get(&h.client, "two");
        next_envelope(&mut peer).await;
        next_envelope(&mut peer).await;

        drop(peer);

        assert!(matches!(first.await.unwrap(), Err(Error::ConnectionClosed(_))));
        assert!(matches!(second.await.unwrap(), Err(Error::ConnectionClosed(_))));
        assert_eq!(
            h.events.recv().await.unwrap(),
            Notification::Connection(ConnectionState::Disconnected)
        );

        // First retry after a drop is immediate.
        let mut peer = h.acceptor.accept().await.unwrap();
        assert_eq!(
            h.events.recv().await.unwrap(),
            Notification::Connection(ConnectionState::Connected)
        );

        let pending = get(&h.client, "again");
        let request = next_envelope(&mut peer).await;
        reply(
            &peer,
            &request,
            &GetResponse {
                value: "back".to_string(),
            },
        )
        .await;
        assert_eq!(pending.await.unwrap().unwrap().value, "back");
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_connects_back_off_then_give_up() {
        let mut config = Config::default();
        config.reconnect = ReconnectConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
            max_attempts: Some(3),
        };

        let mut h = harness(config);
        h.acceptor.set_refusing(true);
        h.client.connect().unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.acceptor.attempts(), 1);
        tokio::time::sleep(Duration::from_millis(100)).await; // t=150ms
        assert_eq!(h.acceptor.attempts(), 2);
        tokio::time::sleep(Duration::from_millis(200)).await; // t=350ms
        assert_eq!(h.acceptor.attempts(), 3);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.acceptor.attempts(), 3);
        assert_eq!(h.client.state(), ConnectionState::Disconnected);

        // An explicit connect starts a fresh schedule.
        h.acceptor.set_refusing(false);
        let _peer = connect(&mut h).await;
        assert_eq!(h.acceptor.attempts(), 4);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_pending_and_reports_disconnected() {
        let mut h = harness(Config::default());
        let mut peer = connect(&mut h).await;
        let mut state = h.client.watch_state();
        assert_eq!(*state.borrow_and_update(), ConnectionState::Connected);

        let pending = get(&h.client, "foo");
        next_envelope(&mut peer).await;

        h.client.shutdown();

        assert!(matches!(pending.await.unwrap(), Err(Error::ConnectionClosed(_))));
        state.changed().await.unwrap();
        assert_eq!(*state.borrow(), ConnectionState::Disconnected);
        assert_eq!(
            h.events.recv().await.unwrap(),
            Notification::Connection(ConnectionState::Disconnected)
        );

        let err = h.client.connect().unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed(_)));
    }

    #[tokio::test]
    async fn test_unsubscribed_listener_stops_receiving() {
        let mut h = harness(Config::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = h.client.subscribe(
            CONNECTION_TOPIC,
            Arc::new(
                move |_: &str, n: &Notification<Push>, _: &Context| -> Result<()> {
                    let _ = tx.send(n.clone());
                    Ok(())
                },
            ),
        );

        let peer = connect(&mut h).await;
        assert_eq!(
            rx.recv().await.unwrap(),
            Notification::Connection(ConnectionState::Connected)
        );

        assert!(h.client.unsubscribe(&subscription));
        drop(peer);
        assert_eq!(
            h.events.recv().await.unwrap(),
            Notification::Connection(ConnectionState::Disconnected)
        );
        assert!(rx.try_recv().is_err());
    }
}
