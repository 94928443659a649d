//! Command-line interface for techletter.
//!
//! Provides the long-running services (processor, retry worker) plus
//! operational commands for ingesting links, provisioning topics and
//! inspecting posts.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::task::JoinSet;
use tracing::{error, info, info_span, warn};

use crate::adapters::{CommandSummarizer, HtmlParser, HttpFeedFetcher, HttpRenderer};
use crate::aggregate::{Aggregator, NewPost, RegisterResult};
use crate::config::{self, ResolvedConfig};
use crate::domain::{PostEvent, PostId};
use crate::eventbus::{
    ensure_topics, retry_worker_group, shutdown_channel, Broker, Dispatcher, Publisher,
    RetryReinjector, Shutdown, ShutdownTrigger, Topic,
};
use crate::pipeline::{
    EventEmitter, PostEventRouter, PostStore, SqlitePostStore, StageHandlers, SummaryQuota,
};

/// Broker support compiled into this binary, shown under `--help`
#[cfg(feature = "kafka")]
const BROKER_HELP: &str = "Broker: Kafka (built with the `kafka` feature).";

#[cfg(not(feature = "kafka"))]
const BROKER_HELP: &str = "Broker: none. This binary was built without the `kafka` feature, so \
processor, retry-worker, aggregate and topics exit with an error. Rebuild with \
`cargo build --features kafka` (needs librdkafka build tools).";

/// techletter - at-least-once RSS post processing over Kafka
#[derive(Parser, Debug)]
#[command(name = "techletter")]
#[command(author, version, about, long_about = None, after_help = BROKER_HELP)]
pub struct Cli {
    /// Config file (default: discover .techletter/config.yaml)
    #[arg(long, global = true, env = "TECHLETTER_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Consume post events and run the render/parse/summarize stages (needs `kafka`)
    Processor,

    /// Move due retry records back to their base topics (needs `kafka`)
    RetryWorker,

    /// Collect feeds and register links as new posts (needs `kafka`)
    Aggregate {
        #[command(subcommand)]
        command: AggregateCommands,
    },

    /// Manage bus topics (needs `kafka`)
    Topics {
        #[command(subcommand)]
        command: TopicCommands,
    },

    /// Show the stage and outputs of a post
    Status {
        /// Post ID, or the article link
        post: String,
    },

    /// List recently updated posts
    Posts {
        /// Maximum number of posts to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show resolved configuration (debug)
    Config,
}

#[derive(Subcommand, Debug)]
pub enum AggregateCommands {
    /// Poll the configured blog feeds and register new links
    Run {
        /// Run a single collection pass and exit
        #[arg(long)]
        once: bool,
    },

    /// Register one article link
    Ingest {
        /// Article URL
        link: String,

        /// Article title (defaults to the link)
        #[arg(long)]
        title: Option<String>,

        /// Blog or feed name
        #[arg(long, default_value = "manual")]
        blog: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum TopicCommands {
    /// Create base, retry and DLQ topics for every configured base topic
    Ensure,

    /// List topics known to the broker
    List,
}

impl Cli {
    /// Resolve configuration for this invocation
    pub fn load_config(&self) -> Result<ResolvedConfig> {
        config::load(self.config.as_deref())
    }

    /// Execute the CLI command
    pub async fn execute(self, config: ResolvedConfig) -> Result<()> {
        match self.command {
            Commands::Processor => run_processor(&config).await,
            Commands::RetryWorker => run_retry_worker(&config).await,
            Commands::Aggregate { command } => match command {
                AggregateCommands::Run { once } => run_feed_collection(&config, once).await,
                AggregateCommands::Ingest { link, title, blog } => {
                    ingest_link(&config, link, title, blog).await
                }
            },
            Commands::Topics { command } => match command {
                TopicCommands::Ensure => ensure_all_topics(&config).await,
                TopicCommands::List => list_topics(&config).await,
            },
            Commands::Status { post } => show_status(&config, &post).await,
            Commands::Posts { limit } => list_posts(&config, limit).await,
            Commands::Config => show_config(&config),
        }
    }
}

/// Connect to the configured broker
#[cfg(feature = "kafka")]
fn connect_broker(config: &ResolvedConfig) -> Result<Arc<dyn Broker>> {
    let broker = crate::eventbus::KafkaBroker::connect(&config.settings.eventbus.brokers)
        .context("Failed to connect to Kafka")?;
    Ok(Arc::new(broker))
}

#[cfg(not(feature = "kafka"))]
fn connect_broker(_config: &ResolvedConfig) -> Result<Arc<dyn Broker>> {
    anyhow::bail!("techletter was built without Kafka support; rebuild with `--features kafka`")
}

fn open_store(config: &ResolvedConfig) -> Result<Arc<dyn PostStore>> {
    let store = SqlitePostStore::open(&config.store_path)
        .with_context(|| format!("Failed to open post store: {}", config.store_path.display()))?;
    Ok(Arc::new(store))
}

fn publisher(broker: Arc<dyn Broker>, config: &ResolvedConfig) -> Publisher {
    Publisher::new(broker).with_ack_timeout(config.settings.eventbus.publish_timeout())
}

/// Resolve on SIGINT or SIGTERM
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Trigger shutdown on a signal, then wait for every loop to return
async fn supervise(trigger: ShutdownTrigger, mut tasks: JoinSet<Result<()>>) -> Result<()> {
    let mut failure = None;

    tokio::select! {
        _ = wait_for_signal() => info!("Shutdown signal received"),
        Some(joined) = tasks.join_next() => {
            // A loop ended on its own: stop the others too
            if let Err(e) = flatten(joined) {
                error!(error = %e, "Worker loop failed");
                failure = Some(e);
            }
        }
    }
    trigger.trigger();

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = flatten(joined) {
            error!(error = %e, "Worker loop failed");
            failure.get_or_insert(e);
        }
    }
    info!("All loops stopped");

    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn flatten(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    joined.context("Worker task panicked")?
}

async fn provision(broker: &dyn Broker, topics: &[Topic], config: &ResolvedConfig) {
    let bus = &config.settings.eventbus;
    for topic in topics {
        if let Err(e) = ensure_topics(broker, topic, bus.base_partitions, bus.dlq_partitions).await {
            // Topics may already be managed externally
            warn!(base = topic.base(), error = %e, "Topic provisioning failed, continuing");
        }
    }
}

/// Run the stage processor until a shutdown signal
async fn run_processor(config: &ResolvedConfig) -> Result<()> {
    let settings = &config.settings;
    let topics = settings.eventbus.topics()?;
    let broker = connect_broker(config)?;
    provision(broker.as_ref(), &topics, config).await;

    let store = open_store(config)?;
    let renderer = Arc::new(HttpRenderer::new(&settings.renderer)?);
    let parser = Arc::new(HtmlParser::default());
    let summarizer = Arc::new(CommandSummarizer::new(&settings.summarizer));
    let quota = Arc::new(SummaryQuota::new(&settings.summary_quota));
    let publisher = publisher(broker.clone(), config);

    let (trigger, shutdown) = shutdown_channel();
    let mut tasks: JoinSet<Result<()>> = JoinSet::new();

    for topic in topics {
        let emitter = EventEmitter::new(publisher.clone(), topic.clone(), "processor");
        let stages = Arc::new(StageHandlers::new(
            store.clone(),
            renderer.clone(),
            parser.clone(),
            summarizer.clone(),
            quota.clone(),
            emitter,
        ));
        let router = Arc::new(PostEventRouter::new(stages));
        let span = info_span!("processor", topic = %topic.base());
        let dispatcher = Dispatcher::<PostEvent>::new(
            broker.clone(),
            publisher.clone(),
            topic,
            settings.eventbus.group_id.clone(),
            router,
        )
        .with_poll_timeout(settings.eventbus.poll_timeout())
        .with_span(span);

        let loop_shutdown = shutdown.clone();
        tasks.spawn(async move { dispatcher.run(loop_shutdown).await.map_err(Into::into) });
    }

    info!(group = %settings.eventbus.group_id, "Processor running");
    supervise(trigger, tasks).await
}

/// Run one reinjector per base topic until a shutdown signal
async fn run_retry_worker(config: &ResolvedConfig) -> Result<()> {
    let settings = &config.settings;
    let topics = settings.eventbus.topics()?;
    let broker = connect_broker(config)?;
    provision(broker.as_ref(), &topics, config).await;

    let publisher = publisher(broker.clone(), config);
    let (min_wait, max_wait) = settings.eventbus.reinject_wait_bounds();
    let (trigger, shutdown) = shutdown_channel();
    let mut tasks: JoinSet<Result<()>> = JoinSet::new();

    for topic in topics {
        let group = retry_worker_group(&settings.eventbus.group_id, topic.base());
        let reinjector = RetryReinjector::new(broker.clone(), publisher.clone(), topic, group)
            .with_poll_timeout(settings.eventbus.poll_timeout())
            .with_wait_bounds(min_wait, max_wait);

        let loop_shutdown = shutdown.clone();
        tasks.spawn(async move { reinjector.run(loop_shutdown).await.map_err(Into::into) });
    }

    info!("Retry worker running");
    supervise(trigger, tasks).await
}

fn aggregator(config: &ResolvedConfig) -> Result<Aggregator> {
    let topic = config
        .settings
        .eventbus
        .topics()?
        .into_iter()
        .next()
        .context("No base topic configured")?;

    let broker = connect_broker(config)?;
    let emitter = EventEmitter::new(publisher(broker, config), topic, "aggregate");
    Ok(Aggregator::new(open_store(config)?, emitter))
}

/// Collect feeds now and then every interval until a shutdown signal
async fn run_feed_collection(config: &ResolvedConfig, once: bool) -> Result<()> {
    let settings = &config.settings;
    let aggregator = aggregator(config)?;
    let fetcher = HttpFeedFetcher::new(&settings.feeds)?;
    let blogs = settings.blogs.clone();
    let batch_size = settings.feeds.batch_size;

    if once {
        let report = aggregator
            .collect_feeds(&fetcher, &blogs, batch_size, &Shutdown::never())
            .await;
        println!(
            "Created {}, re-announced {}, seen {}, failed feeds {}",
            report.created, report.requeued, report.items_seen, report.feeds_failed
        );
        return Ok(());
    }

    let interval = settings.feeds.interval();
    let (trigger, shutdown) = shutdown_channel();
    let mut tasks: JoinSet<Result<()>> = JoinSet::new();
    tasks.spawn(async move {
        loop {
            aggregator
                .collect_feeds(&fetcher, &blogs, batch_size, &shutdown)
                .await;
            if !shutdown.sleep(interval).await {
                return Ok(());
            }
        }
    });

    info!(blogs = settings.blogs.len(), interval = ?interval, "Feed collection running");
    supervise(trigger, tasks).await
}

/// Register a link and print the outcome
async fn ingest_link(
    config: &ResolvedConfig,
    link: String,
    title: Option<String>,
    blog: String,
) -> Result<()> {
    let aggregator = aggregator(config)?;

    let new_post = NewPost {
        blog_name: blog,
        title: title.unwrap_or_else(|| link.clone()),
        link,
    };

    let (_trigger, shutdown) = shutdown_channel();
    match aggregator.register_link(new_post, &shutdown).await? {
        RegisterResult::Created(id) => println!("Created post {}", id),
        RegisterResult::Requeued(id) => println!("Post {} was pending; re-announced", id),
        RegisterResult::AlreadyExists(id, stage) => {
            println!("Post {} already exists (stage: {})", id, stage)
        }
    }
    Ok(())
}

async fn ensure_all_topics(config: &ResolvedConfig) -> Result<()> {
    let bus = &config.settings.eventbus;
    let broker = connect_broker(config)?;
    for topic in bus.topics()? {
        ensure_topics(broker.as_ref(), &topic, bus.base_partitions, bus.dlq_partitions)
            .await
            .with_context(|| format!("Failed to ensure topics for {}", topic.base()))?;
        println!("{}", topic.base());
        for retry in topic.retry_topics() {
            println!("{}", retry);
        }
        println!("{}", topic.dlq());
    }
    Ok(())
}

async fn list_topics(config: &ResolvedConfig) -> Result<()> {
    let broker = connect_broker(config)?;
    for name in broker.list_topics().await? {
        println!("{}", name);
    }
    Ok(())
}

/// Show one post; accepts either a post id or its link
async fn show_status(config: &ResolvedConfig, post: &str) -> Result<()> {
    let store = open_store(config)?;
    let id = if post.contains("://") {
        PostId::from_link(post)
    } else {
        PostId::new(post)
    };

    let Some(post) = store.find(&id).await? else {
        anyhow::bail!("Post not found: {}", id);
    };

    println!("Post ID: {}", post.id);
    println!("Title: {}", post.title);
    println!("Blog: {}", post.blog_name);
    println!("Link: {}", post.link);
    println!("Stage: {}", post.stage);
    println!("Created: {}", post.created_at);
    println!("Updated: {}", post.updated_at);
    if let Some(html) = &post.rendered_html {
        println!("Rendered HTML: {} bytes", html.len());
    }
    if let Some(text) = &post.plain_text {
        println!("Plain text: {} chars", text.chars().count());
    }
    if let Some(thumbnail) = &post.thumbnail_url {
        println!("Thumbnail: {}", thumbnail);
    }
    if let Some(summary) = &post.summary {
        println!("\nSummary ({}):", summary.model_name);
        println!("  Categories: {}", summary.categories.join(", "));
        println!("  Tags: {}", summary.tags.join(", "));
        println!("  {}", summary.summary);
    }

    Ok(())
}

async fn list_posts(config: &ResolvedConfig, limit: usize) -> Result<()> {
    let store = open_store(config)?;
    let posts = store.recent(limit).await?;

    if posts.is_empty() {
        println!("No posts found");
        return Ok(());
    }

    println!("{:<18} {:<12} {:<20} {}", "POST ID", "STAGE", "UPDATED", "TITLE");
    println!("{}", "-".repeat(80));
    for post in posts {
        println!(
            "{:<18} {:<12} {:<20} {}",
            post.id,
            post.stage,
            post.updated_at.format("%Y-%m-%d %H:%M:%S"),
            post.title
        );
    }
    Ok(())
}

/// Show resolved configuration
fn show_config(config: &ResolvedConfig) -> Result<()> {
    println!("techletter configuration");
    println!("========================\n");
    match &config.config_file {
        Some(path) => println!("Config file: {}", path.display()),
        None => println!("Config file: (none found, using defaults)"),
    }
    println!("Store:       {}\n", config.store_path.display());

    let yaml = serde_yaml::to_string(&config.settings).context("Failed to render configuration")?;
    println!("{}", yaml);

    println!("Topics:");
    for topic in config.settings.eventbus.topics()? {
        println!("  {}", topic.base());
        for retry in topic.retry_topics() {
            println!("    {}", retry);
        }
        println!("    {}", topic.dlq());
    }
    Ok(())
}
