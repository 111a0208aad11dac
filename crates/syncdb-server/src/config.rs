use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use syncdb_core::source::relational::{DEFAULT_BOOTSTRAP_CONCURRENCY, DEFAULT_SCHEMA};
use syncdb_core::{
    DocumentConfig, HistoryLostPolicy, HubConfig, OverflowPolicy, RelationalConfig, RetryConfig,
};

/// Environment file loaded before the arguments are parsed.
pub const ENV_FILE: &str = "app.env";

#[derive(Debug, Parser)]
#[command(name = "syncdb-server")]
#[command(about = "Stream PostgreSQL and MongoDB changes to browsers over Server-Sent Events")]
#[command(version)]
pub struct Args {
    /// PostgreSQL connection string; the relational source is disabled when unset
    #[arg(long, env = "PG_URL")]
    pub pg_url: Option<String>,

    /// MongoDB connection string (replica set); the document source is disabled when unset
    #[arg(long, env = "MONGO_URL")]
    pub mongo_url: Option<String>,

    /// Address to listen on
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8085")]
    pub listen: SocketAddr,

    /// Basic auth user for the stream endpoint
    #[arg(long, env = "AUTH_USER", default_value = "admin")]
    pub auth_user: String,

    /// Basic auth password for the stream endpoint
    #[arg(long, env = "AUTH_PASSWORD", default_value = "admin", hide_env_values = true)]
    pub auth_password: String,

    /// Page served at `/`
    #[arg(long, env = "INDEX_FILE", default_value = "./index.html")]
    pub index_file: PathBuf,

    /// Frames buffered per subscriber before the overflow policy applies
    #[arg(long, default_value_t = syncdb_core::hub::DEFAULT_OUTBOX_CAPACITY)]
    pub outbox_capacity: usize,

    /// What to drop when a subscriber's buffer is full
    #[arg(long, value_enum, default_value_t = OverflowArg::DropOldest)]
    pub overflow_policy: OverflowArg,

    /// Notifications buffered ahead of the hub
    #[arg(long, default_value_t = syncdb_core::hub::DEFAULT_PUBLISH_QUEUE)]
    pub publish_queue: usize,

    /// PostgreSQL schema whose tables are watched
    #[arg(long, default_value = DEFAULT_SCHEMA)]
    pub pg_schema: String,

    /// Tables instrumented concurrently
    #[arg(long, default_value_t = DEFAULT_BOOTSTRAP_CONCURRENCY)]
    pub bootstrap_concurrency: usize,

    /// Seconds between scans for new tables (0 disables)
    #[arg(long, default_value_t = 60)]
    pub rescan_interval_secs: u64,

    /// Consecutive reconnect attempts before a source gives up
    #[arg(long, default_value_t = 10)]
    pub reconnect_max_retries: u32,

    /// File keeping the MongoDB resume token across restarts (in memory when unset)
    #[arg(long, env = "RESUME_TOKEN_PATH")]
    pub resume_token_path: Option<PathBuf>,

    /// What to do when the MongoDB resume point has left the oplog
    #[arg(long, value_enum, default_value_t = HistoryLostArg::Fail)]
    pub on_history_lost: HistoryLostArg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OverflowArg {
    DropOldest,
    DropNewest,
}

impl From<OverflowArg> for OverflowPolicy {
    fn from(arg: OverflowArg) -> Self {
        match arg {
            OverflowArg::DropOldest => OverflowPolicy::DropOldest,
            OverflowArg::DropNewest => OverflowPolicy::DropNewest,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum HistoryLostArg {
    Fail,
    RestartFromNow,
}

impl From<HistoryLostArg> for HistoryLostPolicy {
    fn from(arg: HistoryLostArg) -> Self {
        match arg {
            HistoryLostArg::Fail => HistoryLostPolicy::Fail,
            HistoryLostArg::RestartFromNow => HistoryLostPolicy::RestartFromNow,
        }
    }
}

/// Credentials accepted on the stream endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            user: "admin".to_string(),
            password: "admin".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub credentials: Credentials,
    pub index_file: PathBuf,
    pub hub: HubConfig,
    pub relational: Option<RelationalConfig>,
    pub document: Option<DocumentConfig>,
    pub resume_token_path: Option<PathBuf>,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        let reconnect = RetryConfig {
            max_retries: args.reconnect_max_retries,
            ..RetryConfig::default()
        };

        let relational = args.pg_url.filter(|url| !url.is_empty()).map(|url| {
            RelationalConfig::new(url)
                .with_schema(args.pg_schema)
                .with_bootstrap_concurrency(args.bootstrap_concurrency)
                .with_rescan_interval(Some(Duration::from_secs(args.rescan_interval_secs)))
                .with_reconnect(reconnect.clone())
        });

        let document = args.mongo_url.filter(|url| !url.is_empty()).map(|url| {
            DocumentConfig::new(url)
                .with_reconnect(reconnect)
                .with_history_lost(args.on_history_lost.into())
        });

        Self {
            listen: args.listen,
            credentials: Credentials {
                user: args.auth_user,
                password: args.auth_password,
            },
            index_file: args.index_file,
            hub: HubConfig::default()
                .with_outbox_capacity(args.outbox_capacity)
                .with_overflow_policy(args.overflow_policy.into())
                .with_publish_queue(args.publish_queue),
            relational,
            document,
            resume_token_path: args.resume_token_path,
        }
    }
}

impl ServerConfig {
    /// Configuration with no sources, for embedding the router.
    pub fn new(listen: SocketAddr) -> Self {
        Self {
            listen,
            credentials: Credentials::default(),
            index_file: PathBuf::from("./index.html"),
            hub: HubConfig::default(),
            relational: None,
            document: None,
            resume_token_path: None,
        }
    }

    pub fn has_sources(&self) -> bool {
        self.relational.is_some() || self.document.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> ServerConfig {
        let mut argv = vec!["syncdb-server"];
        argv.extend_from_slice(args);
        Args::try_parse_from(argv).unwrap().into()
    }

    #[test]
    fn test_defaults() {
        let config = parse(&["--pg-url", "postgres://localhost/app"]);

        assert_eq!(config.listen, "0.0.0.0:8085".parse::<SocketAddr>().unwrap());
        assert_eq!(config.credentials, Credentials::default());
        assert_eq!(config.index_file, PathBuf::from("./index.html"));
        assert_eq!(config.hub.outbox_capacity, 256);
        assert_eq!(config.hub.overflow_policy, OverflowPolicy::DropOldest);
        assert_eq!(config.hub.publish_queue, 1024);

        let relational = config.relational.unwrap();
        assert_eq!(relational.schema, "public");
        assert_eq!(relational.rescan_interval, Some(Duration::from_secs(60)));
        assert!(config.document.is_none());
    }

    #[test]
    fn test_source_options() {
        let config = parse(&[
            "--pg-url",
            "postgres://localhost/app",
            "--mongo-url",
            "mongodb://localhost:27017/?replicaSet=rs0",
            "--rescan-interval-secs",
            "0",
            "--reconnect-max-retries",
            "3",
            "--overflow-policy",
            "drop-newest",
            "--on-history-lost",
            "restart-from-now",
        ]);

        assert_eq!(config.hub.overflow_policy, OverflowPolicy::DropNewest);

        let relational = config.relational.unwrap();
        assert_eq!(relational.rescan_interval, None);
        assert_eq!(relational.reconnect.max_retries, 3);

        let document = config.document.unwrap();
        assert_eq!(document.history_lost, HistoryLostPolicy::RestartFromNow);
        assert_eq!(document.reconnect.max_retries, 3);
    }

    #[test]
    fn test_empty_url_disables_source() {
        let config = parse(&["--pg-url", "", "--mongo-url", "mongodb://localhost"]);
        assert!(config.relational.is_none());
        assert!(config.document.is_some());
        assert!(config.has_sources());
    }

    #[test]
    fn test_rejects_unknown_policy() {
        let result = Args::try_parse_from(["syncdb-server", "--overflow-policy", "block"]);
        assert!(result.is_err());
    }
}
