//! AWS SNS/SQS broker.
//!
//! Thin adapter from the broker traits to the AWS SDK clients. Works against
//! real AWS or LocalStack (set `endpoint_url`).

use std::collections::HashMap;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_sns::Client as SnsClient;
use aws_sdk_sqs::types::QueueAttributeName;
use aws_sdk_sqs::Client as SqsClient;
use tracing::info;

use super::{
    BrokerError, MessageAttribute, QueueClient, ReceiveRequest, ReceivedMessage, Result,
    TopicClient, TopicSubscription,
};
use crate::config::BrokerConfig;

fn service_error<E>(context: &str, err: E) -> BrokerError
where
    E: std::error::Error,
{
    BrokerError::Service(format!(
        "{}: {}",
        context,
        aws_sdk_sns::error::DisplayErrorContext(err)
    ))
}

fn sqs_attributes(attributes: &HashMap<String, String>) -> HashMap<QueueAttributeName, String> {
    attributes
        .iter()
        .map(|(k, v)| (QueueAttributeName::from(k.as_str()), v.clone()))
        .collect()
}

/// SNS and SQS clients sharing one AWS configuration.
#[derive(Clone)]
pub struct AwsBroker {
    sns: SnsClient,
    sqs: SqsClient,
}

impl AwsBroker {
    /// Load AWS configuration and build both clients.
    pub async fn connect(config: &BrokerConfig) -> Self {
        let mut aws_config_builder = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));

        if let Some(ref endpoint) = config.endpoint_url {
            aws_config_builder = aws_config_builder.endpoint_url(endpoint);
        }

        let aws_config = aws_config_builder.load().await;

        info!(
            region = %config.region,
            endpoint = ?config.endpoint_url,
            "Connected to AWS SNS/SQS"
        );

        Self {
            sns: SnsClient::new(&aws_config),
            sqs: SqsClient::new(&aws_config),
        }
    }
}

#[async_trait]
impl TopicClient for AwsBroker {
    async fn get_topic_attributes(&self, topic_arn: &str) -> Result<HashMap<String, String>> {
        match self
            .sns
            .get_topic_attributes()
            .topic_arn(topic_arn)
            .send()
            .await
        {
            Ok(output) => Ok(output.attributes().cloned().unwrap_or_default()),
            Err(e) => {
                if e.as_service_error()
                    .is_some_and(|se| se.is_not_found_exception())
                {
                    Err(BrokerError::NotFound(topic_arn.to_string()))
                } else {
                    Err(service_error("Failed to get topic attributes", e))
                }
            }
        }
    }

    async fn create_topic(&self, name: &str) -> Result<String> {
        let output = self
            .sns
            .create_topic()
            .name(name)
            .send()
            .await
            .map_err(|e| service_error("Failed to create SNS topic", e))?;

        output
            .topic_arn()
            .map(str::to_string)
            .ok_or_else(|| BrokerError::Service("SNS create_topic returned no ARN".to_string()))
    }

    async fn list_subscriptions(&self, topic_arn: &str) -> Result<Vec<TopicSubscription>> {
        let mut subscriptions = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let output = self
                .sns
                .list_subscriptions_by_topic()
                .topic_arn(topic_arn)
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|e| service_error("Failed to list subscriptions", e))?;

            subscriptions.extend(output.subscriptions().iter().map(|s| TopicSubscription {
                subscription_arn: s.subscription_arn().unwrap_or_default().to_string(),
                protocol: s.protocol().unwrap_or_default().to_string(),
                endpoint: s.endpoint().unwrap_or_default().to_string(),
            }));

            match output.next_token() {
                Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                _ => break,
            }
        }

        Ok(subscriptions)
    }

    async fn subscribe(&self, topic_arn: &str, protocol: &str, endpoint: &str) -> Result<String> {
        let output = self
            .sns
            .subscribe()
            .topic_arn(topic_arn)
            .protocol(protocol)
            .endpoint(endpoint)
            .return_subscription_arn(true)
            .send()
            .await
            .map_err(|e| service_error("Failed to subscribe queue to topic", e))?;

        output
            .subscription_arn()
            .map(str::to_string)
            .ok_or_else(|| BrokerError::Service("SNS subscribe returned no ARN".to_string()))
    }

    async fn publish(
        &self,
        topic_arn: &str,
        message: &str,
        attributes: &[MessageAttribute],
    ) -> Result<String> {
        use aws_sdk_sns::types::MessageAttributeValue;

        let mut attrs = HashMap::new();
        for attribute in attributes {
            attrs.insert(
                attribute.name.clone(),
                MessageAttributeValue::builder()
                    .data_type("String")
                    .string_value(&attribute.value)
                    .build()
                    .map_err(|e| service_error("Failed to build attribute", e))?,
            );
        }

        let output = self
            .sns
            .publish()
            .topic_arn(topic_arn)
            .message(message)
            .set_message_attributes(Some(attrs))
            .send()
            .await
            .map_err(|e| service_error("Failed to publish to SNS", e))?;

        Ok(output.message_id().unwrap_or_default().to_string())
    }
}

#[async_trait]
impl QueueClient for AwsBroker {
    async fn get_queue_url(&self, name: &str) -> Result<String> {
        match self.sqs.get_queue_url().queue_name(name).send().await {
            Ok(output) => output
                .queue_url()
                .map(str::to_string)
                .ok_or_else(|| BrokerError::Service("SQS get_queue_url returned no URL".to_string())),
            Err(e) => {
                if e.as_service_error()
                    .is_some_and(|se| se.is_queue_does_not_exist())
                {
                    Err(BrokerError::NotFound(name.to_string()))
                } else {
                    Err(service_error("Failed to get queue URL", e))
                }
            }
        }
    }

    async fn create_queue(
        &self,
        name: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<String> {
        let output = self
            .sqs
            .create_queue()
            .queue_name(name)
            .set_attributes(Some(sqs_attributes(attributes)))
            .send()
            .await
            .map_err(|e| service_error("Failed to create SQS queue", e))?;

        output
            .queue_url()
            .map(str::to_string)
            .ok_or_else(|| BrokerError::Service("SQS create_queue returned no URL".to_string()))
    }

    async fn get_queue_arn(&self, queue_url: &str) -> Result<String> {
        let output = self
            .sqs
            .get_queue_attributes()
            .queue_url(queue_url)
            .attribute_names(QueueAttributeName::QueueArn)
            .send()
            .await
            .map_err(|e| service_error("Failed to get queue ARN", e))?;

        output
            .attributes()
            .and_then(|attrs| attrs.get(&QueueAttributeName::QueueArn))
            .cloned()
            .ok_or_else(|| BrokerError::Service("Queue has no ARN attribute".to_string()))
    }

    async fn set_queue_attributes(
        &self,
        queue_url: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<()> {
        self.sqs
            .set_queue_attributes()
            .queue_url(queue_url)
            .set_attributes(Some(sqs_attributes(attributes)))
            .send()
            .await
            .map_err(|e| service_error("Failed to set queue attributes", e))?;
        Ok(())
    }

    async fn send_message(&self, queue_url: &str, body: &str) -> Result<String> {
        let output = self
            .sqs
            .send_message()
            .queue_url(queue_url)
            .message_body(body)
            .send()
            .await
            .map_err(|e| service_error("Failed to send message", e))?;

        Ok(output.message_id().unwrap_or_default().to_string())
    }

    async fn receive_messages(
        &self,
        queue_url: &str,
        request: &ReceiveRequest,
    ) -> Result<Vec<ReceivedMessage>> {
        let output = self
            .sqs
            .receive_message()
            .queue_url(queue_url)
            .max_number_of_messages(request.max_messages)
            .wait_time_seconds(request.wait_time_secs)
            .visibility_timeout(request.visibility_timeout_secs)
            .message_attribute_names("All")
            .send()
            .await
            .map_err(|e| service_error("Failed to receive messages", e))?;

        let messages = output
            .messages()
            .iter()
            .filter_map(|m| {
                // Without a receipt handle the message can never be deleted.
                let receipt_handle = m.receipt_handle()?.to_string();
                let attributes = m
                    .message_attributes()
                    .map(|attrs| {
                        attrs
                            .iter()
                            .filter_map(|(k, v)| {
                                v.string_value().map(|s| (k.clone(), s.to_string()))
                            })
                            .collect()
                    })
                    .unwrap_or_default();

                Some(ReceivedMessage {
                    message_id: m.message_id().unwrap_or_default().to_string(),
                    receipt_handle,
                    body: m.body().unwrap_or_default().to_string(),
                    attributes,
                })
            })
            .collect();

        Ok(messages)
    }

    async fn delete_message(&self, queue_url: &str, receipt_handle: &str) -> Result<()> {
        self.sqs
            .delete_message()
            .queue_url(queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| service_error("Failed to delete message", e))?;
        Ok(())
    }
}
