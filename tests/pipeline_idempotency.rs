//! End-to-end pipeline runs over the in-memory broker.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    capture_logs, topic, unlimited_quota, wait_until, FakeRenderer, FakeSummarizer, Harness, BASE,
};
use techletter::adapters::HtmlParser;
use techletter::domain::{Post, PostEvent, PostId, Stage};
use techletter::eventbus::{
    shutdown_channel, Envelope, EventBusError, HandlerError, MemoryBroker, Publisher, Shutdown,
};
use techletter::pipeline::{
    EventEmitter, PostStore, QuotaSettings, SqlitePostStore, StageError, StageHandlers,
    StageOutcome, SummaryQuota,
};
use techletter::{Aggregator, NewPost, RegisterResult};

const PROCESSOR_GROUP: &str = "processor";
const LINK: &str = "https://blog.example.com/posts/1";

fn new_post(link: &str) -> NewPost {
    NewPost {
        blog_name: "Example Engineering".to_string(),
        title: "Scaling queues".to_string(),
        link: link.to_string(),
    }
}

async fn register(harness: &Harness, link: &str) -> PostId {
    let aggregator = Aggregator::new(harness.store.clone(), harness.emitter.clone());
    match aggregator
        .register_link(new_post(link), &Shutdown::never())
        .await
        .unwrap()
    {
        RegisterResult::Created(id) => id,
        other => panic!("expected a new post, got {:?}", other),
    }
}

async fn stage_of(harness: &Harness, id: &PostId) -> Option<Stage> {
    harness.store.find(id).await.unwrap().map(|p| p.stage)
}

fn event_types(broker: &MemoryBroker) -> Vec<&'static str> {
    broker
        .records(BASE)
        .iter()
        .map(|r| {
            Envelope::from_bytes(&r.payload)
                .unwrap()
                .decode::<PostEvent>()
                .unwrap()
                .type_name()
        })
        .collect()
}

#[tokio::test]
async fn test_link_runs_through_every_stage() {
    let mut harness = Harness::new(FakeRenderer::default(), unlimited_quota());
    harness.start();

    let id = register(&harness, LINK).await;

    assert!(wait_until(Duration::from_secs(5), || async {
        stage_of(&harness, &id).await == Some(Stage::Summarized)
    })
    .await);
    assert!(wait_until(Duration::from_secs(2), || async {
        harness.broker.lag(PROCESSOR_GROUP, BASE) == 0
    })
    .await);

    let post = harness.store.find(&id).await.unwrap().unwrap();
    assert!(post.rendered_html.as_deref().unwrap().contains("<article>"));
    assert!(post.plain_text.as_deref().unwrap().contains("Body of"));
    assert_eq!(
        post.thumbnail_url.as_deref(),
        Some("https://blog.example.com/cover.png")
    );
    let summary = post.summary.unwrap();
    assert_eq!(summary.model_name, "fake-model");
    assert_eq!(summary.categories, vec!["engineering".to_string()]);

    assert_eq!(
        event_types(&harness.broker),
        vec![
            "post.created",
            "post.html_rendered",
            "post.text_parsed",
            "post.summarized"
        ]
    );
    assert_eq!(harness.renderer.calls(), 1);
    assert_eq!(harness.summarizer.calls(), 1);
    assert_eq!(harness.quota.used_today().unwrap(), 1);

    harness.stop().await;
}

#[tokio::test]
async fn test_redelivered_events_do_not_repeat_work() {
    let mut harness = Harness::new(FakeRenderer::default(), unlimited_quota());
    harness.start();

    let id = register(&harness, LINK).await;
    assert!(wait_until(Duration::from_secs(5), || async {
        stage_of(&harness, &id).await == Some(Stage::Summarized)
    })
    .await);

    // Replay every stage trigger as if the broker redelivered them
    let post = harness.store.find(&id).await.unwrap().unwrap();
    let shutdown = Shutdown::never();
    for event in [
        PostEvent::created(&post, "replay"),
        PostEvent::html_rendered(&post.id, &post.link, "replay"),
        PostEvent::text_parsed(&post.id, &post.link, None, "replay"),
    ] {
        harness.emitter.emit(&event, &shutdown).await.unwrap();
    }

    // 4 original events, 3 replays, and the text_parsed replay re-announces
    // the stored summary
    assert!(wait_until(Duration::from_secs(5), || async {
        harness.broker.records(BASE).len() == 8 && harness.broker.lag(PROCESSOR_GROUP, BASE) == 0
    })
    .await);

    assert_eq!(harness.renderer.calls(), 1);
    assert_eq!(harness.summarizer.calls(), 1);
    assert_eq!(harness.quota.used_today().unwrap(), 1);
    let types = event_types(&harness.broker);
    assert_eq!(types.iter().filter(|t| **t == "post.summarized").count(), 2);
    assert_eq!(types.iter().filter(|t| **t == "post.html_rendered").count(), 2);
    assert!(harness.broker.records(&topic().retry_topic(1).unwrap()).is_empty());

    // Registering the finished link again announces nothing
    let aggregator = Aggregator::new(harness.store.clone(), harness.emitter.clone());
    let again = aggregator
        .register_link(new_post(LINK), &shutdown)
        .await
        .unwrap();
    assert_eq!(again, RegisterResult::AlreadyExists(id, Stage::Summarized));

    harness.stop().await;
}

#[tokio::test]
async fn test_failed_render_is_retried_then_completes() {
    let mut harness = Harness::new(FakeRenderer::failing(1), unlimited_quota());
    harness.start();

    let id = register(&harness, LINK).await;

    assert!(wait_until(Duration::from_secs(5), || async {
        stage_of(&harness, &id).await == Some(Stage::Summarized)
    })
    .await);

    assert_eq!(harness.renderer.calls(), 2);
    let retried = harness.broker.records(&topic().retry_topic(1).unwrap());
    assert_eq!(retried.len(), 1);
    let envelope = Envelope::from_bytes(&retried[0].payload).unwrap();
    assert_eq!(envelope.retry, 1);
    assert!(envelope
        .last_error
        .as_deref()
        .unwrap()
        .contains("renderer unavailable"));
    assert!(harness.broker.records(&topic().dlq()).is_empty());

    harness.stop().await;
}

#[tokio::test]
async fn test_exhausted_daily_quota_skips_summary() {
    let (logs, _guard) = capture_logs();
    let quota = QuotaSettings {
        requests_per_day: 1,
        requests_per_minute: 0,
    };
    let mut harness = Harness::new(FakeRenderer::default(), quota);
    harness.start();

    let first = register(&harness, "https://blog.example.com/posts/1").await;
    assert!(wait_until(Duration::from_secs(5), || async {
        stage_of(&harness, &first).await == Some(Stage::Summarized)
    })
    .await);

    let second = register(&harness, "https://blog.example.com/posts/2").await;
    assert!(wait_until(Duration::from_secs(5), || async {
        stage_of(&harness, &second).await == Some(Stage::Parsed)
            && harness.broker.lag(PROCESSOR_GROUP, BASE) == 0
    })
    .await);

    // The skipped summary is acknowledged, not retried
    assert_eq!(stage_of(&harness, &second).await, Some(Stage::Parsed));
    assert_eq!(harness.summarizer.calls(), 1);
    assert!(harness.broker.records(&topic().retry_topic(1).unwrap()).is_empty());
    assert!(harness.broker.records(&topic().dlq()).is_empty());
    assert!(logs.contents().contains("Daily summary quota exhausted"));

    harness.stop().await;
}

#[tokio::test]
async fn test_unknown_event_type_is_acknowledged() {
    let mut harness = Harness::new(FakeRenderer::default(), unlimited_quota());
    harness.start();

    let envelope = Envelope::from_event(&serde_json::json!({
        "type": "post.archived",
        "post_id": "0000000000000000"
    }))
    .unwrap();
    Publisher::new(harness.broker.clone())
        .publish(BASE, &envelope, &Shutdown::never())
        .await
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || async {
        harness.broker.lag(PROCESSOR_GROUP, BASE) == 0
    })
    .await);
    assert!(harness.broker.records(&topic().retry_topic(1).unwrap()).is_empty());
    assert_eq!(harness.renderer.calls(), 0);

    harness.stop().await;
}

#[tokio::test]
async fn test_stages_against_sqlite_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqlitePostStore::open(&dir.path().join("posts.db")).unwrap());
    let broker = Arc::new(MemoryBroker::new());
    let renderer = Arc::new(FakeRenderer::default());
    let summarizer = Arc::new(FakeSummarizer::default());
    let emitter = EventEmitter::new(Publisher::new(broker.clone()), topic(), "processor");
    let stages = StageHandlers::new(
        store.clone(),
        renderer.clone(),
        Arc::new(HtmlParser::default()),
        summarizer.clone(),
        Arc::new(SummaryQuota::new(&unlimited_quota())),
        emitter,
    );
    let shutdown = Shutdown::never();

    let post = Post::new("Example Engineering", "Scaling queues", LINK);
    assert!(store.insert_if_absent(&post).await.unwrap());

    let created = created_event(&post);
    assert_eq!(
        stages.handle_created(&created, &shutdown).await.unwrap(),
        StageOutcome::Completed
    );
    assert_eq!(
        stages.handle_created(&created, &shutdown).await.unwrap(),
        StageOutcome::AlreadyDone
    );
    assert_eq!(renderer.calls(), 1);

    let PostEvent::HtmlRendered(rendered) = PostEvent::html_rendered(&post.id, LINK, "test") else {
        unreachable!()
    };
    assert_eq!(
        stages.handle_rendered(&rendered, &shutdown).await.unwrap(),
        StageOutcome::Completed
    );

    let PostEvent::TextParsed(parsed) = PostEvent::text_parsed(&post.id, LINK, None, "test") else {
        unreachable!()
    };
    assert_eq!(
        stages.handle_parsed(&parsed, &shutdown).await.unwrap(),
        StageOutcome::Completed
    );
    assert_eq!(
        stages.handle_parsed(&parsed, &shutdown).await.unwrap(),
        StageOutcome::AlreadyDone
    );
    assert_eq!(summarizer.calls(), 1);

    // Reopening the database sees the finished post
    drop(stages);
    drop(store);
    let reopened = SqlitePostStore::open(&dir.path().join("posts.db")).unwrap();
    let stored = reopened.find(&post.id).await.unwrap().unwrap();
    assert_eq!(stored.stage, Stage::Summarized);
    assert!(stored.summary.is_some());

    // Each repeated trigger found the post at its target stage and re-emitted
    assert_eq!(
        event_types(&broker),
        vec![
            "post.html_rendered",
            "post.html_rendered",
            "post.text_parsed",
            "post.summarized",
            "post.summarized"
        ]
    );
}

fn created_event(post: &Post) -> techletter::domain::PostCreated {
    let PostEvent::Created(created) = PostEvent::created(post, "test") else {
        unreachable!()
    };
    created
}

#[tokio::test]
async fn test_shutdown_during_render_still_emits_next_event() {
    let harness = Harness::new(FakeRenderer::default(), unlimited_quota());
    let post = Post::new("Example Engineering", "Scaling queues", LINK);
    assert!(harness.store.insert_if_absent(&post).await.unwrap());

    let (trigger, shutdown) = shutdown_channel();
    trigger.trigger();

    let outcome = harness
        .stages
        .handle_created(&created_event(&post), &shutdown)
        .await
        .unwrap();
    assert_eq!(outcome, StageOutcome::Completed);
    assert_eq!(stage_of(&harness, &post.id).await, Some(Stage::Rendered));
    assert_eq!(event_types(&harness.broker), vec!["post.html_rendered"]);
}

#[tokio::test]
async fn test_lost_emit_is_recovered_on_redelivery() {
    let harness = Harness::new(FakeRenderer::default(), unlimited_quota());
    let post = Post::new("Example Engineering", "Scaling queues", LINK);
    assert!(harness.store.insert_if_absent(&post).await.unwrap());
    let created = created_event(&post);

    harness.broker.fail_next_publishes(BASE, 1);
    let err = harness
        .stages
        .handle_created(&created, &Shutdown::never())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StageError::Emit {
            event: "post.html_rendered",
            source: EventBusError::Broker(_)
        }
    ));
    assert!(matches!(HandlerError::from(err), HandlerError::Failed(_)));

    // The stage is stored but nothing was announced yet
    assert_eq!(stage_of(&harness, &post.id).await, Some(Stage::Rendered));
    assert!(harness.broker.records(BASE).is_empty());

    let outcome = harness
        .stages
        .handle_created(&created, &Shutdown::never())
        .await
        .unwrap();
    assert_eq!(outcome, StageOutcome::AlreadyDone);
    assert_eq!(event_types(&harness.broker), vec!["post.html_rendered"]);
    assert_eq!(harness.renderer.calls(), 1);
}

#[tokio::test]
async fn test_failed_emit_retries_until_pipeline_completes() {
    let mut harness = Harness::new(FakeRenderer::default(), unlimited_quota());
    harness.start();

    let id = register(&harness, LINK).await;
    // Let post.created land, then reject the next announcement once
    assert!(wait_until(Duration::from_secs(2), || async {
        harness.broker.records(BASE).len() == 1
    })
    .await);
    harness.broker.fail_next_publishes(BASE, 1);

    assert!(wait_until(Duration::from_secs(5), || async {
        stage_of(&harness, &id).await == Some(Stage::Summarized)
    })
    .await);
    assert_eq!(harness.summarizer.calls(), 1);
    assert!(harness.broker.records(&topic().dlq()).is_empty());

    harness.stop().await;
}
