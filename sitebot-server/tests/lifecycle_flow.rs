mod common;

use chrono::{Duration as ChronoDuration, Utc};
use sitebot_core::{InstanceState, PrId};
use sitebot_server::reaper::reap_idle_instances;
use sitebot_server::test_support::FakeBuilder;
use std::time::Duration;

use common::{advance, Harness, HarnessOptions};

fn immediate() -> HarnessOptions {
    HarnessOptions {
        pull_request_delay: Duration::ZERO,
        ..HarnessOptions::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_pull_request_waits_for_archive_delay() {
    let h = Harness::new(HarnessOptions::default());
    assert_eq!(h.pull_request("opened", 1), 1);

    advance(14_999).await;
    assert!(h.builder.calls().await.is_empty());
    assert!(!h.state.manager.check_for_instance(PrId(1)).await);

    advance(2).await;
    assert_eq!(h.builder.calls().await, vec!["provision 1"]);
    let record = h.state.manager.get_instance(PrId(1)).await.unwrap();
    assert_eq!(record.state, InstanceState::Running);
    assert_eq!(record.assigned_port(), 9000);

    let comments = h.sink.comments_for(PrId(1)).await;
    assert_eq!(comments.len(), 1);
    assert!(comments[0].starts_with("Hey there, @alice!"));
    assert!(comments[0].contains("http://preview.example.com:9000"));
}

#[tokio::test(start_paused = true)]
async fn test_comments_are_handled_without_delay() {
    let h = Harness::new(HarnessOptions::default());
    assert_eq!(h.comment(1, "@preview-bot status"), 1);

    advance(1).await;
    let comments = h.sink.comments_for(PrId(1)).await;
    assert_eq!(comments.len(), 1);
    assert!(comments[0].contains("There is no preview running"));
}

#[tokio::test(start_paused = true)]
async fn test_stop_cancels_pending_synchronize() {
    let h = Harness::new(HarnessOptions::default());
    h.pull_request("opened", 1);
    advance(15_001).await;

    h.pull_request("synchronize", 1);
    advance(1_000).await;
    assert_eq!(h.state.scheduler.pending_count(), 1);

    h.comment(1, "@preview-bot stop");
    advance(1).await;
    assert_eq!(h.state.scheduler.pending_count(), 0);
    assert!(!h.state.manager.check_for_instance(PrId(1)).await);

    advance(20_000).await;
    assert_eq!(h.builder.calls().await, vec!["provision 1", "teardown 1"]);
    assert!(!h.state.manager.check_for_instance(PrId(1)).await);
    assert_eq!(h.state.manager.registry().free_ports().await, 20);
}

#[tokio::test(start_paused = true)]
async fn test_closed_releases_ports() {
    let h = Harness::new(immediate());
    h.pull_request("opened", 1);
    advance(1).await;
    h.pull_request("opened", 2);
    advance(1).await;
    assert_eq!(h.state.manager.registry().free_ports().await, 18);

    h.pull_request("closed", 1);
    advance(1).await;
    assert!(!h.state.manager.check_for_instance(PrId(1)).await);
    assert!(h.state.manager.check_for_instance(PrId(2)).await);
    assert_eq!(h.state.manager.registry().free_ports().await, 19);

    // The freed port is the lowest one again
    h.pull_request("opened", 3);
    advance(1).await;
    let record = h.state.manager.get_instance(PrId(3)).await.unwrap();
    assert_eq!(record.assigned_port(), 9000);
}

#[tokio::test(start_paused = true)]
async fn test_closed_without_instance_is_a_no_op() {
    let h = Harness::new(immediate());
    h.pull_request("closed", 7);
    advance(1).await;

    assert!(h.state.manager.registry().list().await.is_empty());
    assert_eq!(h.state.manager.registry().free_ports().await, 20);
    assert!(h.sink.comments().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_synchronize_without_instance_matches_opened_then_synchronize() {
    let fresh = Harness::new(immediate());
    fresh.pull_request("synchronize", 1);
    advance(1).await;

    let replayed = Harness::new(immediate());
    replayed.pull_request("opened", 1);
    advance(1).await;
    replayed.pull_request("synchronize", 1);
    advance(1).await;

    let a = fresh.state.manager.get_instance(PrId(1)).await.unwrap();
    let b = replayed.state.manager.get_instance(PrId(1)).await.unwrap();
    assert_eq!(a.state, InstanceState::Running);
    assert_eq!(a.state, b.state);
    assert_eq!(a.ports, b.ports);
    assert_eq!(a.data, b.data);
}

#[tokio::test(start_paused = true)]
async fn test_live_instances_never_share_ports() {
    let h = Harness::new(HarnessOptions {
        pull_request_delay: Duration::ZERO,
        block_size: 2,
        ..HarnessOptions::default()
    });
    for pr in 1..=6 {
        h.pull_request("opened", pr);
        h.pull_request("opened", pr);
    }
    advance(1).await;

    let records = h.state.manager.registry().list().await;
    assert_eq!(records.len(), 6);
    for (i, a) in records.iter().enumerate() {
        assert_eq!(a.ports.len(), 2);
        for b in &records[i + 1..] {
            assert!(!a.ports.overlaps(&b.ports), "{} and {}", a.ports, b.ports);
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_operations_for_one_pr_never_interleave() {
    let h = Harness::new(HarnessOptions {
        pull_request_delay: Duration::ZERO,
        builder: FakeBuilder::with_delay(Duration::from_secs(5)),
        ..HarnessOptions::default()
    });
    h.pull_request("opened", 1);
    h.pull_request("synchronize", 1);
    h.pull_request("opened", 1);
    h.pull_request("opened", 2);

    // PR 2 is not held up behind PR 1
    advance(100).await;
    assert_eq!(h.builder.calls().await.len(), 2);

    advance(20_000).await;
    assert_eq!(h.builder.calls().await.len(), 4);
    assert_eq!(h.builder.overlapping_calls(), 0);
    for pr in [1, 2] {
        let record = h.state.manager.get_instance(PrId(pr)).await.unwrap();
        assert_eq!(record.state, InstanceState::Running);
    }
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_pool_reports_no_resources() {
    let h = Harness::new(HarnessOptions {
        pull_request_delay: Duration::ZERO,
        max_port: 9000,
        ..HarnessOptions::default()
    });
    h.pull_request("opened", 1);
    advance(1).await;
    h.pull_request("opened", 2);
    advance(1).await;

    assert!(!h.state.manager.check_for_instance(PrId(2)).await);
    let comments = h.sink.comments_for(PrId(2)).await;
    assert_eq!(comments.len(), 1);
    assert!(comments[0].contains("every preview slot is taken"));
}

#[tokio::test(start_paused = true)]
async fn test_failed_build_is_reported_and_retried_on_push() {
    let h = Harness::new(immediate());
    h.builder.fail_next("npm ERR! missing script: start").await;
    h.pull_request("opened", 1);
    advance(1).await;

    let record = h.state.manager.get_instance(PrId(1)).await.unwrap();
    assert_eq!(record.state, InstanceState::Failed);
    let comments = h.sink.comments_for(PrId(1)).await;
    assert!(comments[0].contains("npm ERR! missing script: start"));

    h.pull_request("synchronize", 1);
    advance(1).await;
    let record = h.state.manager.get_instance(PrId(1)).await.unwrap();
    assert_eq!(record.state, InstanceState::Running);
    assert_eq!(record.assigned_port(), 9000);
}

#[tokio::test(start_paused = true)]
async fn test_build_output_with_template_markers_is_still_reported() {
    let h = Harness::new(immediate());
    h.builder
        .fail_next("template error near ~~{ in src/_layouts/post.html")
        .await;
    h.pull_request("opened", 1);
    advance(1).await;

    let record = h.state.manager.get_instance(PrId(1)).await.unwrap();
    assert_eq!(record.state, InstanceState::Failed);
    let comments = h.sink.comments_for(PrId(1)).await;
    assert_eq!(comments.len(), 1);
    assert!(comments[0].contains("src/_layouts/post.html"));
}

#[tokio::test(start_paused = true)]
async fn test_unhandled_pull_request_action_does_nothing() {
    let h = Harness::new(immediate());
    assert_eq!(h.pull_request("edited", 1), 1);
    advance(1).await;

    assert!(h.builder.calls().await.is_empty());
    assert!(!h.state.manager.check_for_instance(PrId(1)).await);
    assert!(h.sink.comments().await.is_empty());
    assert_eq!(h.state.manager.registry().free_ports().await, 20);
    assert_eq!(h.state.scheduler.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_reaper_removes_idle_instances() {
    let h = Harness::new(immediate());
    h.pull_request("opened", 1);
    advance(1).await;

    let manager = &h.state.manager;
    let threshold = ChronoDuration::hours(12);
    assert!(reap_idle_instances(manager, threshold, Utc::now()).await.is_empty());

    let later = Utc::now() + ChronoDuration::hours(13);
    assert_eq!(reap_idle_instances(manager, threshold, later).await, vec![PrId(1)]);
    assert!(!manager.check_for_instance(PrId(1)).await);
    assert_eq!(manager.registry().free_ports().await, 20);

    let comments = h.sink.comments_for(PrId(1)).await;
    assert!(comments
        .last()
        .unwrap()
        .contains("saw no deployments for 12 hours"));
}
