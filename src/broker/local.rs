//! In-memory broker.
//!
//! Emulates the parts of SNS and SQS the crate relies on:
//! - topics fan out to subscribed queues, wrapping each message in an
//!   SNS notification envelope;
//! - received messages stay hidden for the visibility timeout and reappear
//!   with a fresh receipt handle unless deleted;
//! - receives long-poll up to the requested wait time.
//!
//! Fault injection and inspection helpers make failure paths testable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map, Value};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;

use super::{
    BrokerError, MessageAttribute, QueueClient, ReceiveRequest, ReceivedMessage, Result,
    TopicClient, TopicSubscription, ATTR_QUEUE_ARN, ATTR_TOPIC_ARN, ATTR_VISIBILITY_TIMEOUT,
    PROTOCOL_SQS,
};
use crate::config::BrokerConfig;

/// Upper bound on a single long-poll wait slice.
const POLL_SLICE: Duration = Duration::from_millis(25);

/// Number of calls made to the mutating broker operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub create_topic: usize,
    pub create_queue: usize,
    pub subscribe: usize,
    pub publish: usize,
    pub delete_message: usize,
}

struct Topic {
    name: String,
    subscriptions: Vec<TopicSubscription>,
}

struct StoredMessage {
    message_id: String,
    body: String,
    receipt_handle: Option<String>,
    visible_at: Instant,
}

impl StoredMessage {
    fn new(body: String) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            body,
            receipt_handle: None,
            visible_at: Instant::now(),
        }
    }

    fn is_visible(&self, now: Instant) -> bool {
        self.visible_at <= now
    }
}

struct Queue {
    name: String,
    attributes: HashMap<String, String>,
    messages: Vec<StoredMessage>,
}

#[derive(Default)]
struct State {
    /// Keyed by topic ARN.
    topics: HashMap<String, Topic>,
    /// Keyed by queue URL.
    queues: HashMap<String, Queue>,
    counts: CallCounts,
}

/// In-memory SNS/SQS stand-in.
pub struct LocalBroker {
    region: String,
    account_id: String,
    state: Mutex<State>,
    arrivals: Notify,
    fail_next_receives: AtomicUsize,
    fail_on_publish: AtomicBool,
    fail_on_lookup: AtomicBool,
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::from_config(&BrokerConfig::default())
    }
}

impl LocalBroker {
    pub fn new(region: impl Into<String>, account_id: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            account_id: account_id.into(),
            state: Mutex::new(State::default()),
            arrivals: Notify::new(),
            fail_next_receives: AtomicUsize::new(0),
            fail_on_publish: AtomicBool::new(false),
            fail_on_lookup: AtomicBool::new(false),
        }
    }

    /// Broker whose ARNs use the configured region and account.
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self::new(&config.region, &config.account_id)
    }

    fn topic_arn(&self, name: &str) -> String {
        format!("arn:aws:sns:{}:{}:{}", self.region, self.account_id, name)
    }

    fn queue_arn(&self, name: &str) -> String {
        format!("arn:aws:sqs:{}:{}:{}", self.region, self.account_id, name)
    }

    fn queue_url(&self, name: &str) -> String {
        format!(
            "https://sqs.{}.amazonaws.com/{}/{}",
            self.region, self.account_id, name
        )
    }

    // ------------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------------

    /// Make the next `count` receive calls fail with a service error.
    pub fn fail_next_receives(&self, count: usize) {
        self.fail_next_receives.store(count, Ordering::SeqCst);
    }

    /// Make topic publishes fail until reset.
    pub fn set_fail_on_publish(&self, fail: bool) {
        self.fail_on_publish.store(fail, Ordering::SeqCst);
    }

    /// Make topic and queue lookups fail with a service error (not "not found").
    pub fn set_fail_on_lookup(&self, fail: bool) {
        self.fail_on_lookup.store(fail, Ordering::SeqCst);
    }

    fn take_receive_failure(&self) -> bool {
        self.fail_next_receives
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn check_lookup(&self) -> Result<()> {
        if self.fail_on_lookup.load(Ordering::SeqCst) {
            return Err(BrokerError::Service("Injected lookup failure".to_string()));
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    /// Messages stored in the queue, visible or leased.
    pub async fn queue_depth(&self, queue_url: &str) -> usize {
        let state = self.state.lock().await;
        state
            .queues
            .get(queue_url)
            .map_or(0, |q| q.messages.len())
    }

    /// Messages currently leased and hidden by their visibility timeout.
    pub async fn in_flight(&self, queue_url: &str) -> usize {
        let now = Instant::now();
        let state = self.state.lock().await;
        state.queues.get(queue_url).map_or(0, |q| {
            q.messages.iter().filter(|m| !m.is_visible(now)).count()
        })
    }

    pub async fn queue_attributes(&self, queue_url: &str) -> Option<HashMap<String, String>> {
        let state = self.state.lock().await;
        state.queues.get(queue_url).map(|q| q.attributes.clone())
    }

    pub async fn subscription_count(&self, topic_arn: &str) -> usize {
        let state = self.state.lock().await;
        state
            .topics
            .get(topic_arn)
            .map_or(0, |t| t.subscriptions.len())
    }

    pub async fn call_counts(&self) -> CallCounts {
        self.state.lock().await.counts
    }

    async fn try_receive(
        &self,
        queue_url: &str,
        request: &ReceiveRequest,
    ) -> Result<Vec<ReceivedMessage>> {
        let now = Instant::now();
        let visibility = Duration::from_secs(request.visibility_timeout_secs.max(0) as u64);
        let max = request.max_messages.max(1) as usize;

        let mut state = self.state.lock().await;
        let queue = state
            .queues
            .get_mut(queue_url)
            .ok_or_else(|| BrokerError::NotFound(queue_url.to_string()))?;

        let received = queue
            .messages
            .iter_mut()
            .filter(|m| m.is_visible(now))
            .take(max)
            .map(|m| {
                let receipt_handle = uuid::Uuid::new_v4().to_string();
                m.receipt_handle = Some(receipt_handle.clone());
                m.visible_at = now + visibility;
                ReceivedMessage {
                    message_id: m.message_id.clone(),
                    receipt_handle,
                    body: m.body.clone(),
                    attributes: HashMap::new(),
                }
            })
            .collect();

        Ok(received)
    }
}

fn notification_envelope(
    message_id: &str,
    topic_arn: &str,
    message: &str,
    attributes: &[MessageAttribute],
) -> String {
    let attributes: Map<String, Value> = attributes
        .iter()
        .map(|a| (a.name.clone(), json!({"Type": "String", "Value": a.value})))
        .collect();

    json!({
        "Type": "Notification",
        "MessageId": message_id,
        "TopicArn": topic_arn,
        "Message": message,
        "Timestamp": Utc::now().to_rfc3339(),
        "MessageAttributes": attributes,
    })
    .to_string()
}

#[async_trait]
impl TopicClient for LocalBroker {
    async fn get_topic_attributes(&self, topic_arn: &str) -> Result<HashMap<String, String>> {
        self.check_lookup()?;
        let state = self.state.lock().await;
        let topic = state
            .topics
            .get(topic_arn)
            .ok_or_else(|| BrokerError::NotFound(topic_arn.to_string()))?;

        Ok(HashMap::from([
            (ATTR_TOPIC_ARN.to_string(), topic_arn.to_string()),
            ("DisplayName".to_string(), topic.name.clone()),
            (
                "SubscriptionsConfirmed".to_string(),
                topic.subscriptions.len().to_string(),
            ),
        ]))
    }

    async fn create_topic(&self, name: &str) -> Result<String> {
        let arn = self.topic_arn(name);
        let mut state = self.state.lock().await;
        state.counts.create_topic += 1;
        state.topics.entry(arn.clone()).or_insert_with(|| Topic {
            name: name.to_string(),
            subscriptions: Vec::new(),
        });
        debug!(topic = %name, arn = %arn, "Local topic created");
        Ok(arn)
    }

    async fn list_subscriptions(&self, topic_arn: &str) -> Result<Vec<TopicSubscription>> {
        let state = self.state.lock().await;
        state
            .topics
            .get(topic_arn)
            .map(|t| t.subscriptions.clone())
            .ok_or_else(|| BrokerError::NotFound(topic_arn.to_string()))
    }

    async fn subscribe(&self, topic_arn: &str, protocol: &str, endpoint: &str) -> Result<String> {
        let mut state = self.state.lock().await;
        state.counts.subscribe += 1;
        let topic = state
            .topics
            .get_mut(topic_arn)
            .ok_or_else(|| BrokerError::NotFound(topic_arn.to_string()))?;

        let subscription_arn = format!("{}:{}", topic_arn, uuid::Uuid::new_v4());
        topic.subscriptions.push(TopicSubscription {
            subscription_arn: subscription_arn.clone(),
            protocol: protocol.to_string(),
            endpoint: endpoint.to_string(),
        });
        Ok(subscription_arn)
    }

    async fn publish(
        &self,
        topic_arn: &str,
        message: &str,
        attributes: &[MessageAttribute],
    ) -> Result<String> {
        if self.fail_on_publish.load(Ordering::SeqCst) {
            return Err(BrokerError::Service("Injected publish failure".to_string()));
        }

        let message_id = uuid::Uuid::new_v4().to_string();
        let mut state = self.state.lock().await;
        state.counts.publish += 1;

        let endpoints: Vec<String> = state
            .topics
            .get(topic_arn)
            .ok_or_else(|| BrokerError::NotFound(topic_arn.to_string()))?
            .subscriptions
            .iter()
            .filter(|s| s.protocol == PROTOCOL_SQS)
            .map(|s| s.endpoint.clone())
            .collect();

        let body = notification_envelope(&message_id, topic_arn, message, attributes);
        let mut delivered = 0;
        for queue in state.queues.values_mut() {
            let arn = queue.attributes.get(ATTR_QUEUE_ARN);
            if arn.is_some_and(|arn| endpoints.contains(arn)) {
                queue.messages.push(StoredMessage::new(body.clone()));
                delivered += 1;
            }
        }
        drop(state);

        self.arrivals.notify_waiters();
        debug!(topic_arn = %topic_arn, delivered, "Local topic fan-out");
        Ok(message_id)
    }
}

#[async_trait]
impl QueueClient for LocalBroker {
    async fn get_queue_url(&self, name: &str) -> Result<String> {
        self.check_lookup()?;
        let url = self.queue_url(name);
        let state = self.state.lock().await;
        if state.queues.contains_key(&url) {
            Ok(url)
        } else {
            Err(BrokerError::NotFound(name.to_string()))
        }
    }

    async fn create_queue(
        &self,
        name: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<String> {
        let url = self.queue_url(name);
        let arn = self.queue_arn(name);
        let mut state = self.state.lock().await;
        state.counts.create_queue += 1;
        state.queues.entry(url.clone()).or_insert_with(|| {
            let mut attrs = attributes.clone();
            attrs.insert(ATTR_QUEUE_ARN.to_string(), arn);
            attrs
                .entry(ATTR_VISIBILITY_TIMEOUT.to_string())
                .or_insert_with(|| "30".to_string());
            Queue {
                name: name.to_string(),
                attributes: attrs,
                messages: Vec::new(),
            }
        });
        debug!(queue = %name, url = %url, "Local queue created");
        Ok(url)
    }

    async fn get_queue_arn(&self, queue_url: &str) -> Result<String> {
        let state = self.state.lock().await;
        let queue = state
            .queues
            .get(queue_url)
            .ok_or_else(|| BrokerError::NotFound(queue_url.to_string()))?;
        queue
            .attributes
            .get(ATTR_QUEUE_ARN)
            .cloned()
            .ok_or_else(|| BrokerError::Service(format!("Queue {} has no ARN", queue.name)))
    }

    async fn set_queue_attributes(
        &self,
        queue_url: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let queue = state
            .queues
            .get_mut(queue_url)
            .ok_or_else(|| BrokerError::NotFound(queue_url.to_string()))?;
        queue
            .attributes
            .extend(attributes.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn send_message(&self, queue_url: &str, body: &str) -> Result<String> {
        let message = StoredMessage::new(body.to_string());
        let message_id = message.message_id.clone();
        {
            let mut state = self.state.lock().await;
            let queue = state
                .queues
                .get_mut(queue_url)
                .ok_or_else(|| BrokerError::NotFound(queue_url.to_string()))?;
            queue.messages.push(message);
        }
        self.arrivals.notify_waiters();
        Ok(message_id)
    }

    async fn receive_messages(
        &self,
        queue_url: &str,
        request: &ReceiveRequest,
    ) -> Result<Vec<ReceivedMessage>> {
        if self.take_receive_failure() {
            return Err(BrokerError::Service("Injected receive failure".to_string()));
        }

        let deadline = Instant::now() + Duration::from_secs(request.wait_time_secs.max(0) as u64);
        loop {
            let received = self.try_receive(queue_url, request).await?;
            let now = Instant::now();
            if !received.is_empty() || now >= deadline {
                return Ok(received);
            }
            // Wake on arrival, or periodically so expiring leases are noticed.
            let slice = (deadline - now).min(POLL_SLICE);
            let _ = tokio::time::timeout(slice, self.arrivals.notified()).await;
        }
    }

    async fn delete_message(&self, queue_url: &str, receipt_handle: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.counts.delete_message += 1;
        let queue = state
            .queues
            .get_mut(queue_url)
            .ok_or_else(|| BrokerError::NotFound(queue_url.to_string()))?;

        let position = queue
            .messages
            .iter()
            .position(|m| m.receipt_handle.as_deref() == Some(receipt_handle))
            .ok_or_else(|| {
                BrokerError::Service(format!("Receipt handle is invalid: {}", receipt_handle))
            })?;
        queue.messages.remove(position);
        Ok(())
    }
}
