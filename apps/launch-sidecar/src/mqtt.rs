use crate::error::BusError;
use crate::relay::{RelayMessage, RelayPublisher, Subscription};
use bytes::Bytes;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_CAPACITY: usize = 32;

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keepalive: Duration,
    pub client_id: String,
}

impl MqttSettings {
    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        options.set_keep_alive(self.keepalive);
        if let Some(username) = &self.username {
            options.set_credentials(username.clone(), self.password.clone().unwrap_or_default());
        }
        options
    }
}

/// Polls until the broker acknowledges the connection.
async fn await_connack(eventloop: &mut EventLoop) -> Result<(), BusError> {
    let handshake = async {
        loop {
            if let Event::Incoming(Incoming::ConnAck(_)) = eventloop.poll().await? {
                return Ok::<(), BusError>(());
            }
        }
    };
    timeout(CONNECT_TIMEOUT, handshake)
        .await
        .map_err(|_| BusError::ConnectTimeout)?
}

/// Publishing side of the relay bus backed by an MQTT broker.
#[derive(Debug, Clone)]
pub struct MqttRelay {
    client: AsyncClient,
}

impl MqttRelay {
    /// Connects and keeps the event loop polled in the background. The
    /// returned handle finishes only if the task panics.
    pub async fn connect(settings: &MqttSettings) -> Result<(Self, JoinHandle<()>), BusError> {
        let (client, mut eventloop) = AsyncClient::new(settings.options(), REQUEST_CAPACITY);
        await_connack(&mut eventloop).await?;
        tracing::info!(host = %settings.host, port = settings.port, "connected to relay broker");

        let handle = tokio::spawn(async move {
            loop {
                if let Err(err) = eventloop.poll().await {
                    tracing::warn!(error = %err, "relay broker connection error");
                    sleep(Duration::from_secs(2)).await;
                }
            }
        });
        Ok((Self { client }, handle))
    }
}

impl RelayPublisher for MqttRelay {
    /// Queues without waiting. While the broker is unreachable the request
    /// queue fills up and further messages fail instead of blocking the caller.
    async fn publish(&self, channel: &str, message: &RelayMessage) -> Result<(), BusError> {
        let payload = message.encode()?;
        self.client.try_publish(channel, QoS::AtMostOnce, false, payload)?;
        Ok(())
    }
}

/// Subscribes to `channel`. The first connection must succeed; after that
/// the listener reconnects on its own and resubscribes. It stops once the
/// returned subscription is dropped.
pub async fn subscribe(settings: &MqttSettings, channel: &str) -> Result<Subscription, BusError> {
    let (client, mut eventloop) = AsyncClient::new(settings.options(), REQUEST_CAPACITY);
    await_connack(&mut eventloop).await?;
    client.subscribe(channel, QoS::AtMostOnce).await?;
    tracing::info!(channel = %channel, "subscribed to relay channel");

    let (tx, rx) = mpsc::unbounded_channel();
    let settings = settings.clone();
    let channel = channel.to_string();
    tokio::spawn(async move {
        run_listener(settings, channel, client, eventloop, tx).await;
    });
    Ok(Subscription::Remote(rx))
}

async fn run_listener(
    settings: MqttSettings,
    channel: String,
    mut client: AsyncClient,
    mut eventloop: EventLoop,
    tx: mpsc::UnboundedSender<Bytes>,
) {
    loop {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    if tx.send(publish.payload).is_err() {
                        tracing::debug!(channel = %channel, "relay subscriber dropped; stopping listener");
                        let _ = client.disconnect().await;
                        return;
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "relay connection dropped; reconnecting");
                    break;
                }
            }
        }

        loop {
            if tx.is_closed() {
                return;
            }
            sleep(Duration::from_secs(1)).await;
            let (next_client, next_eventloop) =
                AsyncClient::new(settings.options(), REQUEST_CAPACITY);
            match next_client.subscribe(channel.clone(), QoS::AtMostOnce).await {
                Ok(()) => {
                    tracing::info!(channel = %channel, "resubscribed to relay channel");
                    client = next_client;
                    eventloop = next_eventloop;
                    break;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "failed to subscribe to relay channel; retrying");
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    }
}
