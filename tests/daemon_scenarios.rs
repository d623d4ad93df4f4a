//! End-to-end daemon scenarios against the in-memory AWS stand-in.
//!
//! Run with: cargo test --test daemon_scenarios

use std::sync::Arc;
use std::time::Duration;

use tagd::aws::mock::{MockCall, MockOp};
use tagd::aws::{MockAws, INSTANCE_LAUNCH_EVENT};
use tagd::channel::ChannelError;
use tagd::config::{Config, TaggingRule};
use tagd::daemon::{Collaborators, Daemon, DaemonError, DaemonState};
use tagd::tagger::TagSet;
use tagd::utils::shutdown;

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

fn static_tags() -> TagSet {
    [
        ("team".to_string(), "storage".to_string()),
        ("managed-by".to_string(), "tagd".to_string()),
    ]
    .into_iter()
    .collect()
}

fn config(backfill: bool) -> Config {
    Config::for_test(
        QUEUE,
        vec![TaggingRule {
            asg_name: "my-asg*".to_string(),
            tags: static_tags(),
            key_prefix: Vec::new(),
        }],
    )
    .with_settings(QUEUE, None, backfill)
}

/// Wait until `done` holds, polling the mock.
async fn wait_for<F, Fut>(mut done: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !done().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_launch_event_tags_all_attached_volumes() {
    let aws = Arc::new(
        MockAws::new()
            .with_queue(QUEUE, QUEUE_URL, QUEUE_ARN)
            .with_group("my-asg-nodes", &[])
            .with_volumes("i-1", &["vol-1", "vol-2"]),
    );
    aws.push_message(
        "r1",
        &launch_body("my-asg-nodes", INSTANCE_LAUNCH_EVENT, "i-1"),
    )
    .await;

    let mut daemon = Daemon::new(config(false), Collaborators::shared(aws.clone()))
        .await
        .unwrap();
    assert_eq!(daemon.watched_groups(), vec!["my-asg-nodes"]);

    let (handle, shutdown) = shutdown::channel();
    let task = tokio::spawn(async move {
        let result = daemon.run(shutdown).await;
        (daemon, result)
    });

    let probe = aws.clone();
    wait_for(|| {
        let probe = probe.clone();
        async move { !probe.tag_writes().await.is_empty() }
    })
    .await;
    handle.trigger();

    let (daemon, result) = task.await.unwrap();
    result.unwrap();
    assert_eq!(daemon.state(), DaemonState::Stopped);

    assert_eq!(
        aws.tag_writes().await,
        vec![(vec!["vol-1".to_string(), "vol-2".to_string()], static_tags())]
    );
    assert_eq!(aws.pending_messages().await, 0);
}

#[tokio::test]
async fn test_missing_queue_fails_before_subscription() {
    let aws = Arc::new(
        MockAws::new()
            .with_topic(TOPIC_ARN)
            .with_group("my-asg-nodes", &[]),
    );
    let config = config(false).with_settings(QUEUE, Some(TOPIC_ARN.to_string()), false);

    let result = Daemon::new(config, Collaborators::shared(aws.clone())).await;

    match result {
        Err(DaemonError::Channel(ChannelError::QueueMissing(name))) => assert_eq!(name, QUEUE),
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("daemon started without a queue"),
    }
    assert!(!aws
        .calls()
        .await
        .iter()
        .any(|c| matches!(c, MockCall::Subscribe { .. })));
}

#[tokio::test]
async fn test_backfill_handles_every_member_once() {
    let aws = Arc::new(
        MockAws::new()
            .with_queue(QUEUE, QUEUE_URL, QUEUE_ARN)
            .with_group("my-asg-nodes", &["i-1", "i-2", "i-3"])
            .with_volumes("i-1", &["vol-1"])
            .with_volumes("i-2", &["vol-2"])
            .with_volumes("i-3", &["vol-3"]),
    );
    aws.push_message(
        "r1",
        &launch_body("my-asg-nodes", INSTANCE_LAUNCH_EVENT, "i-4"),
    )
    .await;

    let mut daemon = Daemon::new(config(true), Collaborators::shared(aws.clone()))
        .await
        .unwrap();
    let (handle, shutdown) = shutdown::channel();
    handle.trigger();

    daemon.run(shutdown).await.unwrap();

    let handled: Vec<String> = aws
        .calls()
        .await
        .into_iter()
        .filter_map(|c| match c {
            MockCall::AttachedVolumes(instance_id) => Some(instance_id),
            _ => None,
        })
        .collect();
    assert_eq!(handled, vec!["i-1", "i-2", "i-3"]);
    assert_eq!(aws.tag_writes().await.len(), 3);
    assert_eq!(aws.pending_messages().await, 1);
}

#[tokio::test]
async fn test_receive_failures_do_not_stop_the_loop() {
    let aws = Arc::new(
        MockAws::new()
            .with_queue(QUEUE, QUEUE_URL, QUEUE_ARN)
            .with_group("my-asg-nodes", &[])
            .with_volumes("i-1", &["vol-1"]),
    );
    aws.set_failing(MockOp::Receive, true).await;

    let mut daemon = Daemon::new(config(false), Collaborators::shared(aws.clone()))
        .await
        .unwrap();
    let (handle, shutdown) = shutdown::channel();
    let task = tokio::spawn(async move { daemon.run(shutdown).await });

    let probe = aws.clone();
    wait_for(|| {
        let probe = probe.clone();
        async move {
            probe
                .calls()
                .await
                .iter()
                .any(|c| matches!(c, MockCall::Receive))
        }
    })
    .await;

    aws.set_failing(MockOp::Receive, false).await;
    aws.push_message(
        "r1",
        &launch_body("my-asg-nodes", INSTANCE_LAUNCH_EVENT, "i-1"),
    )
    .await;

    let probe = aws.clone();
    wait_for(|| {
        let probe = probe.clone();
        async move { !probe.tag_writes().await.is_empty() }
    })
    .await;
    handle.trigger();

    task.await.unwrap().unwrap();
}
