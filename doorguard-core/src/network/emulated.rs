use crate::config::BusConfig;
use crate::network::{check_topic, BusError, BusMessage, CommandBus};
use async_trait::async_trait;
use log::{debug, warn};
use rand::{thread_rng, Rng};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, Duration, Instant};

const SUBSCRIBER_BUFFER: usize = 64;

#[derive(Debug)]
struct QueuedMessage {
    message: BusMessage,
    delivery_time: Instant,
}

type Subscribers = Arc<Mutex<HashMap<String, Vec<mpsc::Sender<BusMessage>>>>>;

/// In-process broker with delivery latency and message loss, standing in for
/// the site's MQTT-style broker.
#[derive(Clone, Debug)]
pub struct EmulatedBroker {
    config: BusConfig,
    subscribers: Subscribers,
    // Messages waiting out their delivery delay
    queue: Arc<Mutex<Vec<QueuedMessage>>>,
    delivery_task: Arc<tokio::task::JoinHandle<()>>,
}

impl EmulatedBroker {
    pub fn new(config: BusConfig) -> Self {
        let subscribers: Subscribers = Arc::new(Mutex::new(HashMap::new()));
        let queue = Arc::new(Mutex::new(Vec::new()));
        let tick = Duration::from_millis(config.tick_interval_ms.unwrap_or(5));

        let handle = tokio::spawn(Self::delivery_loop(tick, Arc::clone(&subscribers), Arc::clone(&queue)));

        EmulatedBroker { config, subscribers, queue, delivery_task: Arc::new(handle) }
    }

    async fn delivery_loop(tick: Duration, subscribers: Subscribers, queue: Arc<Mutex<Vec<QueuedMessage>>>) {
        debug!("[EmulatedBroker] Delivery task started.");
        loop {
            let now = Instant::now();
            let ready: Vec<QueuedMessage> = {
                let mut queue = queue.lock().await;
                let (ready, pending): (Vec<_>, Vec<_>) = queue.drain(..).partition(|m| m.delivery_time <= now);
                *queue = pending;
                ready
            };

            if !ready.is_empty() {
                let mut subs = subscribers.lock().await;
                for queued in ready {
                    let Some(targets) = subs.get_mut(&queued.message.topic) else {
                        debug!("[EmulatedBroker] No subscribers on {}; message discarded.", queued.message.topic);
                        continue;
                    };
                    targets.retain(|tx| !tx.is_closed());
                    for tx in targets.iter() {
                        if let Err(e) = tx.try_send(queued.message.clone()) {
                            warn!("[EmulatedBroker] Failed to deliver on {}: {}", queued.message.topic, e);
                        }
                    }
                }
            }

            sleep(tick).await;
        }
    }

    /// Stops delivery; queued messages are lost.
    pub fn shutdown(&self) {
        self.delivery_task.abort();
    }

    pub async fn pending(&self) -> usize {
        self.queue.lock().await.len()
    }
}

#[async_trait]
impl CommandBus for EmulatedBroker {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        check_topic(topic)?;
        if self.delivery_task.is_finished() {
            return Err(BusError::Unavailable("broker stopped".into()));
        }

        let config = &self.config;
        if config.drop_rate > 0.0 && thread_rng().gen::<f64>() < config.drop_rate {
            debug!("[EmulatedBroker] Dropping message on {}.", topic);
            return Ok(());
        }

        let delay_ms = if config.min_delay_ms >= config.max_delay_ms {
            config.min_delay_ms
        } else {
            thread_rng().gen_range(config.min_delay_ms..=config.max_delay_ms)
        };
        debug!("[EmulatedBroker] Queuing message on {} with delay {}ms.", topic, delay_ms);
        self.queue.lock().await.push(QueuedMessage {
            message: BusMessage { topic: topic.to_string(), payload },
            delivery_time: Instant::now() + Duration::from_millis(delay_ms),
        });
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<BusMessage>, BusError> {
        check_topic(topic)?;
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers.lock().await.entry(topic.to_string()).or_default().push(tx);
        debug!("[EmulatedBroker] New subscriber on {}", topic);
        Ok(rx)
    }
}
