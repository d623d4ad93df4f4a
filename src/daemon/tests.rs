use super::*;
use crate::aws::mock::{MockCall, MockOp};
use crate::aws::MockAws;
use crate::config::TaggingRule;
use crate::utils::shutdown;

const QUEUE: &str = "tagd-events";
const QUEUE_URL: &str = "https://sqs.local/000000000000/tagd-events";
const QUEUE_ARN: &str = "arn:aws:sqs:us-east-1:000000000000:tagd-events";
const TOPIC_ARN: &str = "arn:aws:sns:us-east-1:000000000000:asg-events";

fn launch_body(group: &str, event: &str, instance_id: &str) -> String {
    let inner = serde_json::json!({
        "AutoScalingGroupName": group,
        "Event": event,
        "Cause": "scale out",
        "EC2InstanceId": instance_id,
        "Time": "2024-05-01T10:00:00Z",
    });
    serde_json::json!({
        "Type": "Notification",
        "Subject": "Auto Scaling: launch",
        "Time": "2024-05-01T10:00:01Z",
        "Message": inner.to_string(),
    })
    .to_string()
}

fn rule(pattern: &str, tags: &[(&str, &str)]) -> TaggingRule {
    TaggingRule {
        asg_name: pattern.to_string(),
        tags: tags
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        key_prefix: Vec::new(),
    }
}

fn account() -> MockAws {
    MockAws::new()
        .with_queue(QUEUE, QUEUE_URL, QUEUE_ARN)
        .with_topic(TOPIC_ARN)
        .with_group("my-asg-nodes", &["i-1", "i-2"])
        .with_group("unrelated", &["i-9"])
        .with_volumes("i-1", &["vol-a", "vol-b"])
}

async fn daemon(aws: &Arc<MockAws>, config: Config) -> Daemon {
    Daemon::new(config, Collaborators::shared(aws.clone()))
        .await
        .unwrap()
}

fn message(receipt: &str, body: &str) -> RawMessage {
    RawMessage {
        receipt_handle: Some(receipt.to_string()),
        body: Some(body.to_string()),
    }
}

#[tokio::test]
async fn test_new_resolves_matching_groups() {
    let aws = Arc::new(account());
    let daemon = daemon(&aws, Config::for_test(QUEUE, vec![rule("my-asg*", &[])])).await;

    assert_eq!(daemon.watched_groups(), vec!["my-asg-nodes"]);
    assert_eq!(
        daemon.tagger("my-asg-nodes").map(|t| t.group().name.as_str()),
        Some("my-asg-nodes")
    );
    assert!(daemon.tagger("unrelated").is_none());
    assert_eq!(daemon.state(), DaemonState::Resolving);
    assert_eq!(daemon.channel().url(), QUEUE_URL);
}

#[tokio::test]
async fn test_new_fails_when_group_listing_fails() {
    let aws = Arc::new(account());
    aws.set_failing(MockOp::ListGroups, true).await;

    let result = Daemon::new(
        Config::for_test(QUEUE, vec![rule("*", &[])]),
        Collaborators::shared(aws),
    )
    .await;

    assert!(matches!(result, Err(DaemonError::GroupListing(_))));
}

#[tokio::test]
async fn test_process_launch_tags_volumes() {
    let aws = Arc::new(account());
    let daemon = daemon(&aws, Config::for_test(QUEUE, vec![rule("my-asg*", &[("team", "storage")])])).await;
    let (_handle, mut shutdown) = shutdown::channel();

    let outcome = daemon
        .process_message(
            &message("r1", &launch_body("my-asg-nodes", INSTANCE_LAUNCH_EVENT, "i-1")),
            &mut shutdown,
        )
        .await;

    assert_eq!(
        outcome,
        MessageOutcome::Tagged {
            group: "my-asg-nodes".to_string(),
            instance_id: "i-1".to_string(),
            volumes: 2,
        }
    );
}

#[tokio::test]
async fn test_process_acknowledges_before_acting() {
    let aws = Arc::new(account());
    let daemon = daemon(&aws, Config::for_test(QUEUE, vec![rule("my-asg*", &[])])).await;
    let (_handle, mut shutdown) = shutdown::channel();

    daemon
        .process_message(
            &message("r1", &launch_body("my-asg-nodes", INSTANCE_LAUNCH_EVENT, "i-1")),
            &mut shutdown,
        )
        .await;

    let calls = aws.calls().await;
    assert_eq!(calls.first(), Some(&MockCall::Delete("r1".to_string())));
    assert!(calls.iter().any(|c| matches!(c, MockCall::CreateTags { .. })));
}

#[tokio::test]
async fn test_process_malformed_envelope_is_acknowledged_once() {
    let aws = Arc::new(account());
    let daemon = daemon(&aws, Config::for_test(QUEUE, vec![rule("my-asg*", &[])])).await;
    let (_handle, mut shutdown) = shutdown::channel();

    let outcome = daemon
        .process_message(&message("r1", "not json"), &mut shutdown)
        .await;

    assert_eq!(outcome, MessageOutcome::MalformedEnvelope);
    assert_eq!(aws.calls().await, vec![MockCall::Delete("r1".to_string())]);
}

#[tokio::test]
async fn test_process_malformed_payload() {
    let aws = Arc::new(account());
    let daemon = daemon(&aws, Config::for_test(QUEUE, vec![rule("my-asg*", &[])])).await;
    let (_handle, mut shutdown) = shutdown::channel();
    let body = serde_json::json!({ "Type": "Notification", "Message": "{oops" }).to_string();

    let outcome = daemon
        .process_message(&message("r1", &body), &mut shutdown)
        .await;

    assert_eq!(outcome, MessageOutcome::MalformedPayload);
    assert_eq!(aws.calls().await, vec![MockCall::Delete("r1".to_string())]);
}

#[tokio::test]
async fn test_process_unmanaged_group_makes_no_tag_calls() {
    let aws = Arc::new(account());
    let daemon = daemon(&aws, Config::for_test(QUEUE, vec![rule("my-asg*", &[])])).await;
    let (_handle, mut shutdown) = shutdown::channel();

    let outcome = daemon
        .process_message(
            &message("r1", &launch_body("unrelated", INSTANCE_LAUNCH_EVENT, "i-9")),
            &mut shutdown,
        )
        .await;

    assert_eq!(outcome, MessageOutcome::UnmanagedGroup("unrelated".to_string()));
    assert!(aws.tag_writes().await.is_empty());
}

#[tokio::test]
async fn test_process_non_launch_event_makes_no_tag_calls() {
    let aws = Arc::new(account());
    let daemon = daemon(&aws, Config::for_test(QUEUE, vec![rule("my-asg*", &[])])).await;
    let (_handle, mut shutdown) = shutdown::channel();

    let outcome = daemon
        .process_message(
            &message(
                "r1",
                &launch_body("my-asg-nodes", "autoscaling:EC2_INSTANCE_TERMINATE", "i-1"),
            ),
            &mut shutdown,
        )
        .await;

    assert_eq!(
        outcome,
        MessageOutcome::IgnoredEvent("autoscaling:EC2_INSTANCE_TERMINATE".to_string())
    );
    assert!(aws.tag_writes().await.is_empty());
}

#[tokio::test]
async fn test_process_tagging_failure_is_reported() {
    let aws = Arc::new(account());
    aws.set_failing(MockOp::CreateTags, true).await;
    let daemon = daemon(&aws, Config::for_test(QUEUE, vec![rule("my-asg*", &[])])).await;
    let (_handle, mut shutdown) = shutdown::channel();

    let outcome = daemon
        .process_message(
            &message("r1", &launch_body("my-asg-nodes", INSTANCE_LAUNCH_EVENT, "i-1")),
            &mut shutdown,
        )
        .await;

    assert!(matches!(outcome, MessageOutcome::TaggingFailed { .. }));
}

#[tokio::test]
async fn test_process_delete_failure_still_processes() {
    let aws = Arc::new(account());
    aws.set_failing(MockOp::Delete, true).await;
    let daemon = daemon(&aws, Config::for_test(QUEUE, vec![rule("my-asg*", &[])])).await;
    let (_handle, mut shutdown) = shutdown::channel();

    let outcome = daemon
        .process_message(
            &message("r1", &launch_body("my-asg-nodes", INSTANCE_LAUNCH_EVENT, "i-1")),
            &mut shutdown,
        )
        .await;

    assert!(matches!(outcome, MessageOutcome::Tagged { volumes: 2, .. }));
}

#[tokio::test]
async fn test_process_message_without_body() {
    let aws = Arc::new(account());
    let daemon = daemon(&aws, Config::for_test(QUEUE, vec![])).await;
    let (_handle, mut shutdown) = shutdown::channel();
    let raw = RawMessage {
        receipt_handle: Some("r1".to_string()),
        body: None,
    };

    let outcome = daemon.process_message(&raw, &mut shutdown).await;

    assert_eq!(outcome, MessageOutcome::EmptyBody);
    assert_eq!(aws.calls().await, vec![MockCall::Delete("r1".to_string())]);
}

#[tokio::test]
async fn test_backfill_skips_group_that_fails_listing() {
    let aws = Arc::new(
        account()
            .with_group("my-asg-masters", &["i-3"])
            .with_volumes("i-3", &["vol-c"]),
    );
    aws.set_failing_group("my-asg-nodes").await;
    let daemon = daemon(&aws, Config::for_test(QUEUE, vec![rule("my-asg*", &[])])).await;

    let handled = daemon.backfill().await;

    assert_eq!(handled, 1);
    assert_eq!(
        aws.tag_writes().await,
        vec![(vec!["vol-c".to_string()], crate::tagger::TagSet::new())]
    );
}

#[tokio::test]
async fn test_run_with_topic_subscribes_and_enables_notifications() {
    let aws = Arc::new(account().with_group("my-asg-masters", &[]));
    aws.set_failing_group("my-asg-masters").await;
    let mut config = Config::for_test(QUEUE, vec![rule("my-asg*", &[])]);
    config.topic_arn = Some(TOPIC_ARN.to_string());
    let mut daemon = daemon(&aws, config).await;
    let (handle, shutdown) = shutdown::channel();
    handle.trigger();

    daemon.run(shutdown).await.unwrap();

    assert_eq!(daemon.state(), DaemonState::Stopped);
    assert!(daemon.channel().subscription_arn().is_some());
    let calls = aws.calls().await;
    assert_eq!(calls[0], MockCall::QueueArn(QUEUE_URL.to_string()));
    assert_eq!(
        calls[1],
        MockCall::Subscribe {
            topic_arn: TOPIC_ARN.to_string(),
            queue_arn: QUEUE_ARN.to_string(),
        }
    );
    let notified: Vec<&str> = calls
        .iter()
        .filter_map(|c| match c {
            MockCall::PutNotifications { group, .. } => Some(group.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(notified, vec!["my-asg-masters", "my-asg-nodes"]);
}

#[tokio::test]
async fn test_run_without_topic_skips_subscription() {
    let aws = Arc::new(account());
    let mut daemon = daemon(&aws, Config::for_test(QUEUE, vec![rule("my-asg*", &[])])).await;
    let (handle, shutdown) = shutdown::channel();
    handle.trigger();

    daemon.run(shutdown).await.unwrap();

    assert!(aws.calls().await.is_empty());
}

#[tokio::test]
async fn test_run_fails_when_subscribe_fails() {
    let aws = Arc::new(account());
    aws.set_failing(MockOp::Subscribe, true).await;
    let mut config = Config::for_test(QUEUE, vec![rule("my-asg*", &[])]);
    config.topic_arn = Some(TOPIC_ARN.to_string());
    let mut daemon = daemon(&aws, config).await;
    let (_handle, shutdown) = shutdown::channel();

    let result = daemon.run(shutdown).await;

    assert!(matches!(result, Err(DaemonError::Subscribe(_))));
    assert_eq!(daemon.state(), DaemonState::Subscribing);
    assert_eq!(
        result.unwrap_err().to_string(),
        "Failed to subscribe to topic: Service error: Mock Subscribe failure"
    );
}

#[tokio::test]
async fn test_run_stops_when_shutdown_handle_dropped() {
    let aws = Arc::new(account());
    let mut daemon = daemon(&aws, Config::for_test(QUEUE, vec![rule("my-asg*", &[])])).await;
    let (handle, shutdown) = shutdown::channel();
    drop(handle);

    tokio::time::timeout(std::time::Duration::from_secs(5), daemon.run(shutdown))
        .await
        .expect("daemon kept running after its shutdown handle was dropped")
        .unwrap();

    assert_eq!(daemon.state(), DaemonState::Stopped);
    assert!(!aws.calls().await.contains(&MockCall::Receive));
}

#[tokio::test]
async fn test_poll_once_surfaces_receive_failure() {
    let aws = Arc::new(account());
    aws.set_failing(MockOp::Receive, true).await;
    let daemon = daemon(&aws, Config::for_test(QUEUE, vec![])).await;
    let (_handle, mut shutdown) = shutdown::channel();

    let result = daemon.poll_once(&mut shutdown).await;

    assert!(result.is_err());
}
