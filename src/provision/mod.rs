//! Idempotent topic, queue and subscription provisioning.
//!
//! Services call these at every startup. Each operation looks the resource
//! up first and creates it only when the broker reports it missing, so
//! repeated calls produce the same handles and no duplicates.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info};

use crate::broker::{
    BrokerError, QueueClient, TopicClient, ATTR_MESSAGE_RETENTION_PERIOD, ATTR_POLICY,
    ATTR_VISIBILITY_TIMEOUT, PROTOCOL_SQS,
};
use crate::config::{BrokerConfig, ProvisioningConfig};

/// Principal that delivers topic messages to queues.
const SNS_PRINCIPAL: &str = "sns.amazonaws.com";

/// Provisioning failures other than the expected "not found".
#[derive(Debug, thiserror::Error)]
pub enum InfrastructureError {
    #[error("Failed to ensure topic {name}: {source}")]
    Topic { name: String, source: BrokerError },

    #[error("Failed to ensure queue {name}: {source}")]
    Queue { name: String, source: BrokerError },

    #[error("Failed to subscribe queue {queue} to {topic}: {source}")]
    Subscription {
        queue: String,
        topic: String,
        source: BrokerError,
    },
}

pub type Result<T> = std::result::Result<T, InfrastructureError>;

/// A topic that exists on the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicHandle {
    pub name: String,
    pub arn: String,
}

/// A queue that exists on the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueHandle {
    pub name: String,
    pub url: String,
}

/// A queue subscribed to a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    pub arn: String,
    pub queue_arn: String,
    pub topic_arn: String,
    /// False when an existing subscription was reused.
    pub created: bool,
}

/// Creates missing broker resources.
pub struct Provisioner {
    topics: Arc<dyn TopicClient>,
    queues: Arc<dyn QueueClient>,
    broker: BrokerConfig,
    provisioning: ProvisioningConfig,
}

impl Provisioner {
    pub fn new(
        topics: Arc<dyn TopicClient>,
        queues: Arc<dyn QueueClient>,
        broker: BrokerConfig,
        provisioning: ProvisioningConfig,
    ) -> Self {
        Self {
            topics,
            queues,
            broker,
            provisioning,
        }
    }

    /// Deterministic ARN of a topic in the configured region and account.
    pub fn topic_arn(&self, name: &str) -> String {
        format!(
            "arn:aws:sns:{}:{}:{}",
            self.broker.region, self.broker.account_id, name
        )
    }

    pub async fn ensure_topic(&self, name: &str) -> Result<TopicHandle> {
        let topic_error = |source| InfrastructureError::Topic {
            name: name.to_string(),
            source,
        };

        let arn = self.topic_arn(name);
        let arn = match self.topics.get_topic_attributes(&arn).await {
            Ok(_) => {
                debug!(topic = %name, arn = %arn, "Topic exists");
                arn
            }
            Err(BrokerError::NotFound(_)) => {
                let created = self.topics.create_topic(name).await.map_err(topic_error)?;
                info!(topic = %name, arn = %created, "Created topic");
                created
            }
            Err(e) => return Err(topic_error(e)),
        };

        Ok(TopicHandle {
            name: name.to_string(),
            arn,
        })
    }

    pub async fn ensure_queue(&self, name: &str) -> Result<QueueHandle> {
        let queue_error = |source| InfrastructureError::Queue {
            name: name.to_string(),
            source,
        };

        let url = match self.queues.get_queue_url(name).await {
            Ok(url) => {
                debug!(queue = %name, url = %url, "Queue exists");
                url
            }
            Err(BrokerError::NotFound(_)) => {
                let attributes = HashMap::from([
                    (
                        ATTR_MESSAGE_RETENTION_PERIOD.to_string(),
                        self.provisioning.message_retention_secs.to_string(),
                    ),
                    (
                        ATTR_VISIBILITY_TIMEOUT.to_string(),
                        self.provisioning.visibility_timeout_secs.to_string(),
                    ),
                ]);
                let created = self
                    .queues
                    .create_queue(name, &attributes)
                    .await
                    .map_err(queue_error)?;
                info!(queue = %name, url = %created, "Created queue");
                created
            }
            Err(e) => return Err(queue_error(e)),
        };

        Ok(QueueHandle {
            name: name.to_string(),
            url,
        })
    }

    /// Ensure `queue_name` exists and receives everything published to `topic`.
    pub async fn ensure_subscription(
        &self,
        queue_name: &str,
        topic: &TopicHandle,
    ) -> Result<(QueueHandle, SubscriptionHandle)> {
        let (queue, mut subscriptions) = self
            .ensure_subscriptions(queue_name, std::slice::from_ref(topic))
            .await?;
        let subscription = subscriptions.pop().ok_or_else(|| InfrastructureError::Subscription {
            queue: queue_name.to_string(),
            topic: topic.name.clone(),
            source: BrokerError::Service("No subscription returned".to_string()),
        })?;
        Ok((queue, subscription))
    }

    /// Ensure `queue_name` exists and is subscribed to every topic in `topics`.
    ///
    /// Reuses subscriptions whose endpoint is already the queue, then applies
    /// one queue policy letting exactly these topics deliver to it. With no
    /// topics the queue is ensured and its policy left untouched.
    pub async fn ensure_subscriptions(
        &self,
        queue_name: &str,
        topics: &[TopicHandle],
    ) -> Result<(QueueHandle, Vec<SubscriptionHandle>)> {
        let queue = self.ensure_queue(queue_name).await?;
        let topic_names = topics
            .iter()
            .map(|t| t.name.as_str())
            .collect::<Vec<_>>()
            .join(",");

        let queue_arn = self
            .queues
            .get_queue_arn(&queue.url)
            .await
            .map_err(|source| InfrastructureError::Subscription {
                queue: queue_name.to_string(),
                topic: topic_names.clone(),
                source,
            })?;

        let mut subscriptions = Vec::with_capacity(topics.len());
        for topic in topics {
            subscriptions.push(self.subscribe_queue(queue_name, &queue_arn, topic).await?);
        }

        // A policy with an empty SourceArn list is invalid.
        if topics.is_empty() {
            debug!(queue = %queue_name, "No topics to subscribe, leaving policy unchanged");
            return Ok((queue, subscriptions));
        }

        let topic_arns: Vec<&str> = topics.iter().map(|t| t.arn.as_str()).collect();
        let policy = queue_policy(&queue_arn, &topic_arns);
        self.queues
            .set_queue_attributes(&queue.url, &HashMap::from([(ATTR_POLICY.to_string(), policy)]))
            .await
            .map_err(|source| InfrastructureError::Subscription {
                queue: queue_name.to_string(),
                topic: topic_names,
                source,
            })?;

        Ok((queue, subscriptions))
    }

    async fn subscribe_queue(
        &self,
        queue_name: &str,
        queue_arn: &str,
        topic: &TopicHandle,
    ) -> Result<SubscriptionHandle> {
        let subscription_error = |source| InfrastructureError::Subscription {
            queue: queue_name.to_string(),
            topic: topic.name.clone(),
            source,
        };

        let existing = self
            .topics
            .list_subscriptions(&topic.arn)
            .await
            .map_err(subscription_error)?
            .into_iter()
            .find(|s| s.endpoint == queue_arn);

        let (arn, created) = match existing {
            Some(subscription) => {
                debug!(
                    queue = %queue_name,
                    topic = %topic.name,
                    subscription_arn = %subscription.subscription_arn,
                    "Subscription exists"
                );
                (subscription.subscription_arn, false)
            }
            None => {
                let arn = self
                    .topics
                    .subscribe(&topic.arn, PROTOCOL_SQS, queue_arn)
                    .await
                    .map_err(subscription_error)?;
                info!(
                    queue = %queue_name,
                    topic = %topic.name,
                    subscription_arn = %arn,
                    "Subscribed queue to topic"
                );
                (arn, true)
            }
        };

        Ok(SubscriptionHandle {
            arn,
            queue_arn: queue_arn.to_string(),
            topic_arn: topic.arn.clone(),
            created,
        })
    }
}

/// Policy allowing only the given topics to send to the queue.
pub fn queue_policy(queue_arn: &str, topic_arns: &[&str]) -> String {
    let source_arn = match topic_arns {
        [single] => json!(single),
        many => json!(many),
    };

    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": {"Service": SNS_PRINCIPAL},
            "Action": "sqs:SendMessage",
            "Resource": queue_arn,
            "Condition": {
                "ArnEquals": {"aws:SourceArn": source_arn}
            }
        }]
    })
    .to_string()
}

#[cfg(test)]
mod tests;
