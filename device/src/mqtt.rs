use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    thread,
    time::Duration,
};

use rumqttc::{Client, Connection, Event, Incoming, MqttOptions, QoS};
use tracing::{info, warn};

use voicebox_common::{MqttEndpoint, MqttInbox, MqttLink};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_DELAY: Duration = Duration::from_secs(2);
const REQUEST_CAPACITY: usize = 64;

/// Broker link built on the blocking rumqttc client.
pub struct RumqttLink {
    endpoint: MqttEndpoint,
    client: Option<Client>,
    connected: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
}

impl RumqttLink {
    pub fn new(endpoint: MqttEndpoint) -> Self {
        Self {
            endpoint,
            client: None,
            connected: Arc::new(AtomicBool::new(false)),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    fn options(&self) -> MqttOptions {
        let endpoint = &self.endpoint;
        let mut options =
            MqttOptions::new(endpoint.client_id.clone(), endpoint.host.clone(), endpoint.port);
        options.set_keep_alive(Duration::from_secs(60));
        if !endpoint.username.is_empty() {
            options.set_credentials(endpoint.username.clone(), endpoint.password.clone());
        }
        options
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        self.connected.store(false, Ordering::Relaxed);
        if let Some(client) = self.client.take() {
            let _ = client.disconnect();
        }
    }
}

impl MqttLink for RumqttLink {
    fn connect(&mut self, inbox: Arc<MqttInbox>) -> Result<(), String> {
        self.shutdown();
        self.stop = Arc::new(AtomicBool::new(false));

        let (client, connection) = Client::new(self.options(), REQUEST_CAPACITY);
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let receiver = Receiver {
            client: client.clone(),
            topics: subscriptions(&self.endpoint),
            inbox,
            connected: Arc::clone(&self.connected),
            stop: Arc::clone(&self.stop),
            ready: ready_tx,
        };
        thread::Builder::new()
            .name("mqtt-rx".into())
            .spawn(move || receiver.run(connection))
            .map_err(|err| format!("failed to spawn mqtt receiver: {err}"))?;
        self.client = Some(client);

        info!(
            "connecting to mqtt broker {}:{} as `{}`",
            self.endpoint.host, self.endpoint.port, self.endpoint.client_id
        );
        let outcome = match ready_rx.recv_timeout(CONNECT_TIMEOUT) {
            Ok(outcome) => outcome,
            Err(_) => Err("timed out waiting for broker".to_string()),
        };
        if outcome.is_err() {
            self.shutdown();
        }
        outcome
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), String> {
        let Some(client) = self.client.as_ref() else {
            return Err("not connected".to_string());
        };
        client
            .publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .map_err(|err| err.to_string())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

impl Drop for RumqttLink {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn subscriptions(endpoint: &MqttEndpoint) -> Vec<String> {
    let topic = endpoint.subscribe_topic.trim_end_matches('/');
    vec![topic.to_string(), format!("{topic}/audio")]
}

struct Receiver {
    client: Client,
    topics: Vec<String>,
    inbox: Arc<MqttInbox>,
    connected: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    ready: mpsc::SyncSender<Result<(), String>>,
}

impl Receiver {
    fn run(self, mut connection: Connection) {
        for event in connection.iter() {
            if self.stop.load(Ordering::Relaxed) {
                break;
            }
            match event {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    // Clean sessions drop subscriptions on every reconnect.
                    for topic in &self.topics {
                        if let Err(err) = self.client.subscribe(topic.as_str(), QoS::AtMostOnce) {
                            warn!("mqtt subscribe to {topic} failed: {err}");
                        }
                    }
                    self.connected.store(true, Ordering::Relaxed);
                    let _ = self.ready.try_send(Ok(()));
                    self.inbox.on_connected();
                }
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    self.inbox.on_publish(&message.topic, &message.payload);
                }
                Ok(_) => {}
                Err(err) => {
                    let reason = err.to_string();
                    if self.connected.swap(false, Ordering::Relaxed) {
                        self.inbox.on_connection_lost(&reason);
                    } else {
                        let _ = self.ready.try_send(Err(reason.clone()));
                    }
                    if self.stop.load(Ordering::Relaxed) {
                        break;
                    }
                    warn!("mqtt poll error: {reason}");
                    thread::sleep(RECONNECT_DELAY);
                }
            }
        }
        info!("mqtt receiver stopped");
    }
}
