//! PostgreSQL change source.
//!
//! Changes are captured by row-level triggers into a sink table, and each
//! sink insert is relayed over `LISTEN/NOTIFY` on [`CHANGE_CHANNEL`]. See
//! [`bootstrap`] for the objects installed in the database.

pub mod bootstrap;
pub mod decode;

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgListener, PgPoolOptions};
use sqlx::PgPool;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use syncdb_proto::{Notification, Source};

use super::{conduit, ChangeSource, NotificationReceiver, NotificationSender, Shutdown, SourceHandle};
use crate::error::Result;
use crate::retry::{Backoff, RetryConfig, RetryPolicy};

pub use bootstrap::{BootstrapReport, TriggerFailure, CHANGE_CHANNEL, SINK_TABLE};
pub use decode::{decode_payload, SinkRow};

/// Default `application_name` of the source's connections.
pub const DEFAULT_APPLICATION_NAME: &str = "syncdb";

/// Default schema scanned for tables.
pub const DEFAULT_SCHEMA: &str = "public";

/// Default number of tables instrumented concurrently.
pub const DEFAULT_BOOTSTRAP_CONCURRENCY: usize = 4;

/// Default period between scans for newly created tables.
pub const DEFAULT_RESCAN_INTERVAL: Duration = Duration::from_secs(60);

/// Configuration for the PostgreSQL source.
#[derive(Debug, Clone)]
pub struct RelationalConfig {
    /// Connection string.
    pub url: String,
    /// Schema whose tables are watched.
    pub schema: String,
    /// Pool size; the listener takes one connection of its own.
    pub max_connections: u32,
    /// `application_name` reported by every connection.
    pub application_name: String,
    /// Tables instrumented concurrently during bootstrap and rescans.
    pub bootstrap_concurrency: usize,
    /// Period between scans for new tables, `None` disables rescans.
    pub rescan_interval: Option<Duration>,
    /// Reconnect policy for the listener.
    pub reconnect: RetryConfig,
    /// Output conduit capacity.
    pub conduit_capacity: usize,
}

impl RelationalConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            schema: DEFAULT_SCHEMA.to_string(),
            max_connections: 8,
            application_name: DEFAULT_APPLICATION_NAME.to_string(),
            bootstrap_concurrency: DEFAULT_BOOTSTRAP_CONCURRENCY,
            rescan_interval: Some(DEFAULT_RESCAN_INTERVAL),
            reconnect: RetryConfig::default(),
            conduit_capacity: super::DEFAULT_CONDUIT_CAPACITY,
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn with_application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = name.into();
        self
    }

    pub fn with_bootstrap_concurrency(mut self, concurrency: usize) -> Self {
        self.bootstrap_concurrency = concurrency.max(1);
        self
    }

    pub fn with_rescan_interval(mut self, interval: Option<Duration>) -> Self {
        self.rescan_interval = interval.filter(|d| !d.is_zero());
        self
    }

    pub fn with_reconnect(mut self, reconnect: RetryConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_conduit_capacity(mut self, capacity: usize) -> Self {
        self.conduit_capacity = capacity;
        self
    }
}

/// PostgreSQL change source.
pub struct RelationalSource {
    config: RelationalConfig,
}

impl RelationalSource {
    pub fn new(config: RelationalConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RelationalConfig {
        &self.config
    }

    /// Connect, run the bootstrap and spawn the listener loop.
    pub async fn open(self) -> Result<(SourceHandle, NotificationReceiver)> {
        let config = self.config;

        let options: PgConnectOptions = config.url.parse()?;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options.application_name(&config.application_name))
            .await?;
        info!(schema = %config.schema, "connected to postgres");

        bootstrap::bootstrap(&pool, &config.schema, config.bootstrap_concurrency).await?;

        let listener = subscribe(&pool).await?;
        info!(channel = CHANGE_CHANNEL, "listening for relational changes");

        let (tx, rx) = conduit(config.conduit_capacity);
        let (shutdown_tx, shutdown) = Shutdown::channel();
        let backoff = Backoff::new(RetryPolicy::new(config.reconnect.clone()));

        let worker = ListenerLoop {
            pool,
            listener,
            tx,
            shutdown,
            backoff,
            config,
        };
        let task = tokio::spawn(worker.run());

        Ok((SourceHandle::new(Source::Relational, shutdown_tx, task), rx))
    }
}

#[async_trait]
impl ChangeSource for RelationalSource {
    fn kind(&self) -> Source {
        Source::Relational
    }

    async fn start(self: Box<Self>) -> Result<(SourceHandle, NotificationReceiver)> {
        (*self).open().await
    }
}

struct ListenerLoop {
    pool: PgPool,
    listener: PgListener,
    tx: NotificationSender,
    shutdown: Shutdown,
    backoff: Backoff,
    config: RelationalConfig,
}

impl ListenerLoop {
    async fn run(mut self) {
        let mut rescan = self.config.rescan_interval.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval
        });

        loop {
            tokio::select! {
                _ = self.shutdown.triggered() => break,
                _ = next_tick(&mut rescan) => self.rescan().await,
                received = self.listener.try_recv() => {
                    let keep_going = match received {
                        Ok(Some(notification)) => {
                            self.backoff.reset();
                            self.forward(notification.payload()).await
                        }
                        Ok(None) => self.reconnect("connection lost").await,
                        Err(e) => self.reconnect(&e.to_string()).await,
                    };
                    if !keep_going {
                        break;
                    }
                }
            }
        }

        self.pool.close().await;
        info!("relational listener stopped");
    }

    /// Decode and forward one relayed sink row. Returns `false` once the
    /// conduit has no receiver.
    async fn forward(&mut self, payload: &str) -> bool {
        match self.resolve(payload).await {
            Ok(notification) => {
                debug!(
                    collection = %notification.collection,
                    operation = %notification.operation,
                    "relational change captured"
                );
                self.tx.send(notification).await.is_ok()
            }
            Err(e) => {
                warn!(error = %e, "skipping undecodable sink row");
                true
            }
        }
    }

    /// Decode a payload, reading `data` back from the sink for rows that
    /// were relayed without it.
    async fn resolve(&self, payload: &str) -> Result<Notification> {
        let mut row = SinkRow::parse(payload)?;
        if row.needs_data() {
            if let Some(id) = row.id {
                debug!(id, table = %row.table_name, "fetching oversized sink row");
                row.data = bootstrap::fetch_sink_data(&self.pool, id).await?;
            }
        }
        row.into_notification()
    }

    /// Replace the listener with a fresh subscription, waiting between
    /// attempts. The retry budget starts over once a subscription succeeds.
    /// Returns `false` when retries are exhausted or shutdown was requested.
    async fn reconnect(&mut self, reason: &str) -> bool {
        warn!(reason, "relational listener interrupted");
        loop {
            let Some(delay) = self.backoff.next() else {
                error!(
                    reason,
                    attempts = self.backoff.attempts(),
                    "relational listener giving up after repeated failures"
                );
                return false;
            };
            debug!(
                attempt = self.backoff.attempts(),
                delay_ms = delay.as_millis() as u64,
                "reconnecting relational listener"
            );
            if !self.shutdown.sleep(delay).await {
                return false;
            }

            match subscribe(&self.pool).await {
                Ok(listener) => {
                    info!(attempt = self.backoff.attempts(), "relational listener reconnected");
                    self.listener = listener;
                    self.backoff.reset();
                    return true;
                }
                Err(e) => warn!(
                    error = %e,
                    attempt = self.backoff.attempts(),
                    "failed to reconnect relational listener"
                ),
            }
        }
    }

    async fn rescan(&mut self) {
        if self.shutdown.is_triggered() {
            return;
        }
        match bootstrap::instrument_tables(
            &self.pool,
            &self.config.schema,
            self.config.bootstrap_concurrency,
        )
        .await
        {
            Ok(report) if !report.instrumented.is_empty() => {
                info!(tables = ?report.instrumented, "instrumented tables created since startup");
            }
            Ok(_) => debug!("table rescan found nothing new"),
            Err(e) => warn!(error = %e, "table rescan failed"),
        }
    }
}

/// Open a listener on [`CHANGE_CHANNEL`].
async fn subscribe(pool: &PgPool) -> Result<PgListener> {
    let mut listener = PgListener::connect_with(pool).await?;
    listener.listen(CHANGE_CHANNEL).await?;
    Ok(listener)
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
