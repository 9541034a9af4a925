use super::*;
use crate::broker::LocalBroker;

fn provisioner(broker: &Arc<LocalBroker>) -> Provisioner {
    Provisioner::new(
        broker.clone(),
        broker.clone(),
        BrokerConfig::default(),
        ProvisioningConfig::default(),
    )
}

#[test]
fn test_topic_arn_is_deterministic() {
    let broker = Arc::new(LocalBroker::default());
    let provisioner = Provisioner::new(
        broker.clone(),
        broker,
        BrokerConfig {
            region: "eu-west-1".to_string(),
            account_id: "123456789012".to_string(),
            endpoint_url: None,
        },
        ProvisioningConfig::default(),
    );
    assert_eq!(
        provisioner.topic_arn("auth-events"),
        "arn:aws:sns:eu-west-1:123456789012:auth-events"
    );
}

// ============================================================================
// Topics
// ============================================================================

#[tokio::test]
async fn test_ensure_topic_creates_once() {
    let broker = Arc::new(LocalBroker::default());
    let provisioner = provisioner(&broker);

    let first = provisioner.ensure_topic("auth-events").await.unwrap();
    let second = provisioner.ensure_topic("auth-events").await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first.arn, provisioner.topic_arn("auth-events"));
    assert_eq!(broker.call_counts().await.create_topic, 1);
}

#[tokio::test]
async fn test_ensure_topic_propagates_lookup_failure() {
    let broker = Arc::new(LocalBroker::default());
    broker.set_fail_on_lookup(true);
    let provisioner = provisioner(&broker);

    let err = provisioner.ensure_topic("auth-events").await.unwrap_err();

    assert!(matches!(
        err,
        InfrastructureError::Topic {
            source: BrokerError::Service(_),
            ..
        }
    ));
    assert_eq!(broker.call_counts().await.create_topic, 0);
}

// ============================================================================
// Queues
// ============================================================================

#[tokio::test]
async fn test_ensure_queue_creates_once_with_attributes() {
    let broker = Arc::new(LocalBroker::default());
    let provisioner = provisioner(&broker);

    let first = provisioner.ensure_queue("accounts-events").await.unwrap();
    let second = provisioner.ensure_queue("accounts-events").await.unwrap();

    assert_eq!(first, second);
    assert_eq!(broker.call_counts().await.create_queue, 1);

    let attributes = broker.queue_attributes(&first.url).await.unwrap();
    assert_eq!(attributes[ATTR_MESSAGE_RETENTION_PERIOD], "345600");
    assert_eq!(attributes[ATTR_VISIBILITY_TIMEOUT], "60");
}

#[tokio::test]
async fn test_ensure_queue_propagates_lookup_failure() {
    let broker = Arc::new(LocalBroker::default());
    broker.set_fail_on_lookup(true);
    let provisioner = provisioner(&broker);

    let err = provisioner.ensure_queue("accounts-events").await.unwrap_err();
    assert!(matches!(err, InfrastructureError::Queue { .. }));
}

// ============================================================================
// Subscriptions
// ============================================================================

#[tokio::test]
async fn test_ensure_subscription_is_idempotent() {
    let broker = Arc::new(LocalBroker::default());
    let provisioner = provisioner(&broker);
    let topic = provisioner.ensure_topic("auth-events").await.unwrap();

    let (queue, first) = provisioner
        .ensure_subscription("accounts-events", &topic)
        .await
        .unwrap();
    let (queue_again, second) = provisioner
        .ensure_subscription("accounts-events", &topic)
        .await
        .unwrap();

    assert_eq!(queue, queue_again);
    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.arn, second.arn);
    assert_eq!(first.topic_arn, topic.arn);
    assert_eq!(broker.subscription_count(&topic.arn).await, 1);
    assert_eq!(broker.call_counts().await.subscribe, 1);
    assert_eq!(broker.call_counts().await.create_queue, 1);
}

#[tokio::test]
async fn test_subscription_sets_topic_scoped_policy() {
    let broker = Arc::new(LocalBroker::default());
    let provisioner = provisioner(&broker);
    let topic = provisioner.ensure_topic("auth-events").await.unwrap();

    let (queue, subscription) = provisioner
        .ensure_subscription("accounts-events", &topic)
        .await
        .unwrap();

    let attributes = broker.queue_attributes(&queue.url).await.unwrap();
    let policy: serde_json::Value = serde_json::from_str(&attributes[ATTR_POLICY]).unwrap();
    let statement = &policy["Statement"][0];
    assert_eq!(statement["Effect"], "Allow");
    assert_eq!(statement["Principal"]["Service"], "sns.amazonaws.com");
    assert_eq!(statement["Action"], "sqs:SendMessage");
    assert_eq!(statement["Resource"], subscription.queue_arn.as_str());
    assert_eq!(
        statement["Condition"]["ArnEquals"]["aws:SourceArn"],
        topic.arn.as_str()
    );
}

#[tokio::test]
async fn test_one_queue_on_two_topics() {
    let broker = Arc::new(LocalBroker::default());
    let provisioner = provisioner(&broker);
    let auth = provisioner.ensure_topic("auth-events").await.unwrap();
    let billing = provisioner.ensure_topic("billing-events").await.unwrap();

    let (queue, subscriptions) = provisioner
        .ensure_subscriptions("accounts-events", &[auth.clone(), billing.clone()])
        .await
        .unwrap();

    assert_eq!(subscriptions.len(), 2);
    assert!(subscriptions.iter().all(|s| s.created));
    assert_eq!(subscriptions[0].queue_arn, subscriptions[1].queue_arn);

    let attributes = broker.queue_attributes(&queue.url).await.unwrap();
    let policy: serde_json::Value = serde_json::from_str(&attributes[ATTR_POLICY]).unwrap();
    assert_eq!(
        policy["Statement"][0]["Condition"]["ArnEquals"]["aws:SourceArn"],
        serde_json::json!([auth.arn, billing.arn])
    );

    // A later single-topic call reuses the existing subscription.
    let (_, again) = provisioner
        .ensure_subscription("accounts-events", &billing)
        .await
        .unwrap();
    assert!(!again.created);
}

#[tokio::test]
async fn test_subscription_to_missing_topic_fails() {
    let broker = Arc::new(LocalBroker::default());
    let provisioner = provisioner(&broker);
    let ghost = TopicHandle {
        name: "ghost".to_string(),
        arn: provisioner.topic_arn("ghost"),
    };

    let err = provisioner
        .ensure_subscription("accounts-events", &ghost)
        .await
        .unwrap_err();

    match err {
        InfrastructureError::Subscription { queue, topic, source } => {
            assert_eq!(queue, "accounts-events");
            assert_eq!(topic, "ghost");
            assert!(source.is_not_found());
        }
        other => panic!("Expected subscription error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_no_topics_leaves_policy_unset() {
    let broker = Arc::new(LocalBroker::default());
    let provisioner = provisioner(&broker);

    let (queue, subscriptions) = provisioner
        .ensure_subscriptions("accounts-events", &[])
        .await
        .unwrap();

    assert!(subscriptions.is_empty());
    let attributes = broker.queue_attributes(&queue.url).await.unwrap();
    assert!(!attributes.contains_key(ATTR_POLICY));
    assert_eq!(broker.call_counts().await.subscribe, 0);
}
