//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use techletter::adapters::{HtmlParser, Renderer, Summarizer, SummaryOutput};
use techletter::domain::PostEvent;
use techletter::eventbus::{
    shutdown_channel, Dispatcher, MemoryBroker, Publisher, RetryLadder, RetryReinjector,
    Shutdown, ShutdownTrigger, Topic,
};
use techletter::pipeline::{
    EventEmitter, MemoryPostStore, PostEventRouter, QuotaSettings, StageHandlers, SummaryQuota,
};
use tokio::task::JoinHandle;
use tracing_subscriber::fmt::MakeWriter;

pub const BASE: &str = "test.post.events";
pub const TICK: Duration = Duration::from_millis(10);

pub fn short_ladder() -> RetryLadder {
    RetryLadder::new(vec![Duration::from_millis(20), Duration::from_millis(40)])
}

pub fn topic() -> Topic {
    Topic::new(BASE, short_ladder())
}

/// Poll `check` until it holds or `timeout` passes
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(TICK).await;
    }
}

/// Renderer that fails a configurable number of times first
#[derive(Default)]
pub struct FakeRenderer {
    pub calls: AtomicUsize,
    pub failures_left: AtomicUsize,
}

impl FakeRenderer {
    pub fn failing(times: usize) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            failures_left: AtomicUsize::new(times),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Renderer for FakeRenderer {
    fn name(&self) -> &str {
        "fake"
    }

    async fn render(&self, link: &str) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            anyhow::bail!("renderer unavailable");
        }
        Ok(format!(
            "<html><head><meta property=\"og:image\" content=\"/cover.png\"></head>\
             <body><article><h1>Title</h1><p>Body of {}</p></article></body></html>",
            link
        ))
    }
}

#[derive(Default)]
pub struct FakeSummarizer {
    pub calls: AtomicUsize,
}

impl FakeSummarizer {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Summarizer for FakeSummarizer {
    fn name(&self) -> &str {
        "fake-model"
    }

    async fn summarize(&self, text: &str) -> anyhow::Result<SummaryOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(SummaryOutput {
            categories: vec!["engineering".to_string()],
            tags: vec!["test".to_string()],
            summary: format!("{} chars", text.len()),
            model_name: None,
            tokens_used: None,
        })
    }
}

pub fn unlimited_quota() -> QuotaSettings {
    QuotaSettings {
        requests_per_day: 0,
        requests_per_minute: 0,
    }
}

/// Processor and retry worker wired over one in-memory broker
pub struct Harness {
    pub broker: Arc<MemoryBroker>,
    pub store: Arc<MemoryPostStore>,
    pub renderer: Arc<FakeRenderer>,
    pub summarizer: Arc<FakeSummarizer>,
    pub quota: Arc<SummaryQuota>,
    pub emitter: EventEmitter,
    pub stages: Arc<StageHandlers>,
    trigger: ShutdownTrigger,
    pub shutdown: Shutdown,
    tasks: Vec<JoinHandle<()>>,
}

impl Harness {
    pub fn new(renderer: FakeRenderer, quota: QuotaSettings) -> Self {
        let broker = Arc::new(MemoryBroker::new());
        let store = Arc::new(MemoryPostStore::new());
        let renderer = Arc::new(renderer);
        let summarizer = Arc::new(FakeSummarizer::default());
        let quota = Arc::new(SummaryQuota::new(&quota));
        let emitter = EventEmitter::new(Publisher::new(broker.clone()), topic(), "processor");
        let stages = Arc::new(StageHandlers::new(
            store.clone(),
            renderer.clone(),
            Arc::new(HtmlParser::default()),
            summarizer.clone(),
            quota.clone(),
            emitter.clone(),
        ));
        let (trigger, shutdown) = shutdown_channel();

        Self {
            broker,
            store,
            renderer,
            summarizer,
            quota,
            emitter,
            stages,
            trigger,
            shutdown,
            tasks: Vec::new(),
        }
    }

    /// Start the dispatcher and the retry reinjector
    pub fn start(&mut self) {
        let publisher = Publisher::new(self.broker.clone());
        let router = Arc::new(PostEventRouter::new(self.stages.clone()));

        let dispatcher = Dispatcher::<PostEvent>::new(
            self.broker.clone(),
            publisher.clone(),
            topic(),
            "processor",
            router,
        )
        .with_poll_timeout(TICK)
        .with_error_backoff(TICK);

        let reinjector = RetryReinjector::new(self.broker.clone(), publisher, topic(), "retry-worker")
            .with_poll_timeout(TICK)
            .with_error_backoff(TICK)
            .with_wait_bounds(Duration::from_millis(5), Duration::from_millis(20));

        let shutdown = self.shutdown.clone();
        self.tasks.push(tokio::spawn(async move {
            dispatcher.run(shutdown).await.unwrap();
        }));
        let shutdown = self.shutdown.clone();
        self.tasks.push(tokio::spawn(async move {
            reinjector.run(shutdown).await.unwrap();
        }));
    }

    pub async fn stop(mut self) {
        self.trigger.trigger();
        for task in self.tasks.drain(..) {
            task.await.unwrap();
        }
    }
}

/// In-memory log sink for a scoped tracing subscriber
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl std::io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedLogs;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Route tracing output of the current thread into a buffer
pub fn capture_logs() -> (CapturedLogs, tracing::subscriber::DefaultGuard) {
    let logs = CapturedLogs::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(logs.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .finish();
    let guard = tracing::subscriber::set_default(subscriber);
    (logs, guard)
}
