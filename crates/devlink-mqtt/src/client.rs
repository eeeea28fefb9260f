use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use devlink::error::{Error, ErrorKind, Result};
use devlink::transport::{Dispatcher, Transport};

use rumqttc::v5::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, mqttbytes::QoS,
    mqttbytes::v5::Packet,
};

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use tokio_util::sync::CancellationToken;

use tracing::{debug, error, info, warn};

use crate::config::MqttConfig;

// Maximum time given to the event loop to send the disconnection packet.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
enum Outbound {
    Subscribe(String),
    Publish {
        topic: String,
        payload: Vec<u8>,
        retain: bool,
    },
}

// Connection state shared between the client and its event loop.
struct Session {
    client_id: String,
    dispatcher: Arc<Dispatcher>,
    connected: Arc<AtomicBool>,
    stopping: AtomicBool,
}

impl Session {
    fn connected(&self) {
        if !self.connected.swap(true, Ordering::SeqCst) {
            info!("Client `{}` connected", self.client_id);
        }
        self.dispatcher.on_connect();
    }

    fn disconnected(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            warn!("Client `{}` disconnected", self.client_id);
            self.dispatcher.on_disconnect();
        }
    }

    fn message(&self, topic: &[u8], payload: &[u8]) {
        let Ok(topic) = std::str::from_utf8(topic) else {
            warn!("Client `{}` dropped a message on a non UTF-8 topic", self.client_id);
            return;
        };

        if !self.dispatcher.dispatch(topic, payload) {
            debug!("No handler for `{topic}`, message discarded");
        }
    }

    // Returns `false` once the event loop must terminate.
    fn handle(&self, event: std::result::Result<Event, ConnectionError>) -> bool {
        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => self.connected(),
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                self.message(&publish.topic, &publish.payload);
            }
            Ok(Event::Incoming(Packet::Disconnect(_))) => self.disconnected(),
            Ok(_) => {}
            Err(e) => {
                if self.stopping.load(Ordering::SeqCst) {
                    self.disconnected();
                    return false;
                }
                error!("Client `{}` connection error: {e}", self.client_id);
                self.disconnected();
            }
        }
        true
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    session: Arc<Session>,
    reconnect_delay: Duration,
    cancellation_token: CancellationToken,
) {
    loop {
        tokio::select! {
            // Use the cancellation token to stop the loop
            () = cancellation_token.cancelled() => { break; }
            // Poll the `MQTT` event coming from the network
            event = eventloop.poll() => {
                let failed = event.is_err();
                if !session.handle(event) {
                    break;
                }
                if failed
                    && cancellation_token
                        .run_until_cancelled(tokio::time::sleep(reconnect_delay))
                        .await
                        .is_none()
                {
                    break;
                }
            }
        }
    }
    session.disconnected();
    drop(eventloop);
}

async fn run_outbound(
    client: AsyncClient,
    receiver: flume::Receiver<Outbound>,
    cancellation_token: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancellation_token.cancelled() => { break; }
            outbound = receiver.recv_async() => {
                let Ok(outbound) = outbound else {
                    break;
                };

                let result = match outbound {
                    Outbound::Subscribe(topic) => {
                        debug!("Subscribing to `{topic}`");
                        client.subscribe(topic, QoS::AtLeastOnce).await
                    }
                    Outbound::Publish { topic, payload, retain } => {
                        client.publish(topic, QoS::AtLeastOnce, retain, payload).await
                    }
                };

                if let Err(e) = result {
                    error!("Impossible to send the request to the broker: {e}");
                }
            }
        }
    }
    drop(client);
}

struct Running {
    client: AsyncClient,
    session: Arc<Session>,
    cancellation_token: CancellationToken,
    event_loop: JoinHandle<()>,
    outbound: JoinHandle<()>,
}

/// An `MQTT` v5 [`Transport`].
///
/// Requests are queued and sent by a background task, so publishing never
/// blocks. Incoming messages are handed to a [`Dispatcher`] in arrival order.
///
/// The client reconnects on its own after a connection error. Every
/// (re)connection is reported to the dispatcher handlers, which subscribe
/// their topics again.
pub struct MqttClient {
    config: MqttConfig,
    connected: Arc<AtomicBool>,
    sender: flume::Sender<Outbound>,
    receiver: flume::Receiver<Outbound>,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for MqttClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttClient")
            .field("client_id", &self.config.client_id)
            .field("hostname", &self.config.hostname)
            .field("port", &self.config.port)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl MqttClient {
    /// Creates a [`MqttClient`].
    ///
    /// The client does not connect until [`MqttClient::start`] is called.
    #[must_use]
    pub fn new(config: MqttConfig) -> Self {
        let (sender, receiver) = flume::unbounded();
        Self {
            config,
            connected: Arc::new(AtomicBool::new(false)),
            sender,
            receiver,
            running: Mutex::new(None),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &MqttConfig {
        &self.config
    }

    /// Whether the client has been started and not stopped.
    #[must_use]
    pub fn is_running(&self) -> bool {
        lock(&self.running).is_some()
    }

    /// Connects to the broker and starts handing messages to `dispatcher`.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::Transport`] when the client is already
    /// running or when no `tokio` runtime is available.
    pub fn start(&self, dispatcher: Arc<Dispatcher>) -> Result<()> {
        let handle = Handle::try_current().map_err(|e| {
            error!("Impossible to start client `{}`: {e}", self.config.client_id);
            Error::new(ErrorKind::Transport, format!("No runtime available: {e}"))
        })?;

        let mut running = lock(&self.running);
        if running.is_some() {
            return Err(Error::new(
                ErrorKind::Transport,
                format!("Client `{}` is already running", self.config.client_id),
            ));
        }

        let (client, eventloop) = AsyncClient::new(self.options(), self.config.channel_capacity);
        let cancellation_token = CancellationToken::new();
        let session = Arc::new(Session {
            client_id: self.config.client_id.clone(),
            dispatcher,
            connected: self.connected.clone(),
            stopping: AtomicBool::new(false),
        });

        let event_loop = handle.spawn(run_event_loop(
            eventloop,
            session.clone(),
            self.config.reconnect_delay(),
            cancellation_token.clone(),
        ));
        let outbound = handle.spawn(run_outbound(
            client.clone(),
            self.receiver.clone(),
            cancellation_token.clone(),
        ));

        info!(
            "Client `{}` connecting to {}:{}",
            self.config.client_id, self.config.hostname, self.config.port
        );

        *running = Some(Running {
            client,
            session,
            cancellation_token,
            event_loop,
            outbound,
        });
        Ok(())
    }

    /// Disconnects from the broker and stops the background tasks.
    ///
    /// Stopping a client which is not running does nothing.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::Transport`] when the disconnection cannot be
    /// requested. The background tasks are stopped anyway.
    pub async fn stop(&self) -> Result<()> {
        let running = lock(&self.running).take();
        let Some(Running {
            client,
            session,
            cancellation_token,
            event_loop,
            outbound,
        }) = running
        else {
            return Ok(());
        };

        session.stopping.store(true, Ordering::SeqCst);

        let mut result = Ok(());
        let mut tasks = vec![outbound];
        if self.is_connected() {
            result = client.disconnect().await.map_err(|e| {
                error!("Impossible to disconnect client `{}`: {e}", self.config.client_id);
                Error::new(ErrorKind::Transport, format!("Disconnection failed: {e}"))
            });

            let mut event_loop = event_loop;
            if tokio::time::timeout(DISCONNECT_TIMEOUT, &mut event_loop)
                .await
                .is_err()
            {
                debug!("Client `{}` disconnection timed out", self.config.client_id);
                tasks.push(event_loop);
            }
        } else {
            tasks.push(event_loop);
        }

        cancellation_token.cancel();
        for task in tasks {
            if let Err(e) = task.await
                && !e.is_cancelled()
            {
                error!("Client `{}` task failed: {e}", self.config.client_id);
            }
        }

        session.disconnected();
        info!("Client `{}` stopped", self.config.client_id);
        result
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(
            self.config.client_id.clone(),
            self.config.hostname.clone(),
            self.config.port,
        );
        let _ = options
            .set_keep_alive(self.config.keep_alive())
            .set_clean_start(self.config.clean_start);
        if let Some(user_name) = &self.config.user_name {
            let _ = options.set_credentials(
                user_name.clone(),
                self.config.user_pwd.clone().unwrap_or_default(),
            );
        }
        options
    }

    fn enqueue(&self, outbound: Outbound) -> Result<()> {
        self.sender.send(outbound).map_err(|e| {
            error!("Client `{}` cannot queue a request: {e}", self.config.client_id);
            Error::new(ErrorKind::PublishFailure, format!("Request not queued: {e}"))
        })
    }
}

impl Transport for MqttClient {
    fn subscribe(&self, topic: &str) -> Result<()> {
        if !self.is_connected() {
            debug!("Subscription to `{topic}` deferred until the client is connected");
            return Ok(());
        }
        self.enqueue(Outbound::Subscribe(topic.into()))
    }

    fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::new(
                ErrorKind::PublishFailure,
                format!(
                    "Client `{}` is not connected, cannot publish on `{topic}`",
                    self.config.client_id
                ),
            ));
        }
        self.enqueue(Outbound::Publish {
            topic: topic.into(),
            payload: payload.to_vec(),
            retain,
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use devlink::error::ErrorKind;
    use devlink::transport::{Dispatcher, MessageHandler, Transport};

    use crate::config::MqttConfig;

    use super::{MqttClient, Outbound, Session};

    #[derive(Default)]
    struct Handler {
        messages: Mutex<Vec<String>>,
        connections: AtomicUsize,
        disconnections: AtomicUsize,
    }

    impl MessageHandler for Handler {
        fn topics(&self) -> Vec<String> {
            vec!["zigbee2mqtt/lamp".into()]
        }

        fn on_message(&self, topic: &str, payload: &[u8]) {
            self.messages
                .lock()
                .unwrap()
                .push(format!("{topic}:{}", String::from_utf8_lossy(payload)));
        }

        fn on_connect(&self) {
            let _ = self.connections.fetch_add(1, Ordering::SeqCst);
        }

        fn on_disconnect(&self) {
            let _ = self.disconnections.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn session() -> (Session, Arc<Handler>) {
        let handler = Arc::new(Handler::default());
        let dispatcher = Arc::new(Dispatcher::new());
        dispatcher.register(handler.clone());
        let session = Session {
            client_id: "test".into(),
            dispatcher,
            connected: Arc::new(AtomicBool::new(false)),
            stopping: AtomicBool::new(false),
        };
        (session, handler)
    }

    #[test]
    fn session_reports_connections() {
        let (session, handler) = session();

        session.connected();
        session.connected();
        assert!(session.connected.load(Ordering::SeqCst));
        assert_eq!(handler.connections.load(Ordering::SeqCst), 2);

        session.disconnected();
        session.disconnected();
        assert!(!session.connected.load(Ordering::SeqCst));
        assert_eq!(handler.disconnections.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn session_dispatches_messages() {
        let (session, handler) = session();

        session.message(b"zigbee2mqtt/lamp", br#"{"state":"ON"}"#);
        session.message(b"zigbee2mqtt/other", b"{}");
        session.message(&[0xff, 0xfe], b"{}");

        assert_eq!(
            *handler.messages.lock().unwrap(),
            [r#"zigbee2mqtt/lamp:{"state":"ON"}"#]
        );
    }

    #[test]
    fn disconnected_client() {
        let client = MqttClient::new(MqttConfig::new("test"));

        assert!(!client.is_connected());
        assert!(!client.is_running());
        assert_eq!(
            client.publish("zigbee2mqtt/lamp/set", b"{}", false).unwrap_err().kind(),
            ErrorKind::PublishFailure
        );

        // Subscriptions are sent again by the handlers once connected.
        client.subscribe("zigbee2mqtt/lamp").unwrap();
        assert!(client.receiver.is_empty());
    }

    #[test]
    fn connected_client_queues_requests() {
        let client = MqttClient::new(MqttConfig::new("test"));
        client.connected.store(true, Ordering::SeqCst);

        client.subscribe("zigbee2mqtt/lamp").unwrap();
        client.publish("zigbee2mqtt/lamp/set", b"{}", false).unwrap();

        let requests: Vec<Outbound> = client.receiver.drain().collect();
        assert!(matches!(&requests[0], Outbound::Subscribe(topic) if topic == "zigbee2mqtt/lamp"));
        assert!(matches!(
            &requests[1],
            Outbound::Publish { topic, payload, retain: false }
                if topic == "zigbee2mqtt/lamp/set" && payload == b"{}"
        ));
    }

    #[test]
    fn start_requires_runtime() {
        let client = MqttClient::new(MqttConfig::new("test"));
        let error = client.start(Arc::new(Dispatcher::new())).unwrap_err();

        assert_eq!(error.kind(), ErrorKind::Transport);
        assert!(!client.is_running());
    }

    #[tokio::test]
    async fn start_and_stop() {
        let client = MqttClient::new(MqttConfig::new("test").broker("127.0.0.1", 1));
        let dispatcher = Arc::new(Dispatcher::new());

        client.start(dispatcher.clone()).unwrap();
        assert!(client.is_running());
        assert_eq!(
            client.start(dispatcher).unwrap_err().kind(),
            ErrorKind::Transport
        );

        client.stop().await.unwrap();
        assert!(!client.is_running());
        assert!(!client.is_connected());
        client.stop().await.unwrap();
    }
}
