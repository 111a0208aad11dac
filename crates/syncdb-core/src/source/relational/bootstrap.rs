//! Trigger-based change capture setup.
//!
//! Every statement here is safe to re-run: the sink uses `IF NOT EXISTS`,
//! functions use `CREATE OR REPLACE`, and triggers are created only after
//! checking `pg_trigger` for one with the same name.

use futures::StreamExt;
use sqlx::PgPool;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Sink table that accumulates captured row changes.
pub const SINK_TABLE: &str = "notification";

/// Channel the relay trigger notifies on.
pub const CHANGE_CHANNEL: &str = "notification_changes";

/// Trigger function attached to every watched table.
pub const CAPTURE_FUNCTION: &str = "notify_changes";

/// Trigger on the sink that relays new rows to [`CHANGE_CHANNEL`].
pub const RELAY_TRIGGER: &str = "notification_changes";

/// Prefix of the per-table capture trigger names.
pub const TABLE_TRIGGER_PREFIX: &str = "notify_changes_trigger_";

/// Longest identifier PostgreSQL keeps (NAMEDATALEN - 1).
const MAX_IDENTIFIER_LEN: usize = 63;

const CREATE_SINK_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS notification (
    id serial primary key,
    table_name varchar(100) not null,
    operation varchar(10) not null,
    data jsonb not null,
    created_at timestamp default now()
)
"#;

// Deletes report only the key columns of OLD: the primary key, or else the
// first unique index whose columns are all NOT NULL. Tables with neither
// fall back to the whole old row.
const CREATE_CAPTURE_FUNCTION: &str = r#"
CREATE OR REPLACE FUNCTION notify_changes() RETURNS trigger AS $$
DECLARE
    key_index oid;
    key_data jsonb;
BEGIN
    IF (TG_OP = 'INSERT') THEN
        INSERT INTO notification (table_name, operation, data)
        VALUES (TG_TABLE_NAME, 'INSERT', to_jsonb(NEW));
        RETURN NEW;
    ELSIF (TG_OP = 'UPDATE') THEN
        INSERT INTO notification (table_name, operation, data)
        VALUES (TG_TABLE_NAME, 'UPDATE', to_jsonb(NEW));
        RETURN NEW;
    ELSIF (TG_OP = 'DELETE') THEN
        SELECT i.indexrelid
          INTO key_index
          FROM pg_index i
         WHERE i.indrelid = TG_RELID
           AND i.indisunique
           AND i.indpred IS NULL
           AND i.indexprs IS NULL
           AND NOT EXISTS (
               SELECT 1 FROM pg_attribute a
                WHERE a.attrelid = i.indrelid
                  AND a.attnum = ANY(i.indkey)
                  AND NOT a.attnotnull)
         ORDER BY i.indisprimary DESC, i.indnatts, i.indexrelid
         LIMIT 1;

        IF key_index IS NOT NULL THEN
            SELECT jsonb_object_agg(a.attname, to_jsonb(OLD) -> a.attname)
              INTO key_data
              FROM pg_index i
              JOIN pg_attribute a
                ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
             WHERE i.indexrelid = key_index;
        END IF;

        INSERT INTO notification (table_name, operation, data)
        VALUES (TG_TABLE_NAME, 'DELETE', COALESCE(key_data, to_jsonb(OLD)));
        RETURN OLD;
    END IF;
    RETURN NULL;
END;
$$ LANGUAGE plpgsql
"#;

// NOTIFY payloads must stay under 8000 bytes. Larger rows are relayed
// without `data`, which the listener then reads back from the sink by id.
const CREATE_RELAY_FUNCTION: &str = r#"
CREATE OR REPLACE FUNCTION notify_notification_changes() RETURNS trigger AS $$
DECLARE
    payload text := row_to_json(NEW)::text;
BEGIN
    IF octet_length(payload) >= 8000 THEN
        payload := json_build_object(
            'id', NEW.id,
            'table_name', NEW.table_name,
            'operation', NEW.operation,
            'created_at', NEW.created_at
        )::text;
    END IF;
    PERFORM pg_notify('notification_changes', payload);
    RETURN NEW;
END;
$$ LANGUAGE plpgsql
"#;

const CREATE_RELAY_TRIGGER: &str = r#"
CREATE TRIGGER notification_changes
AFTER INSERT ON notification
FOR EACH ROW EXECUTE FUNCTION notify_notification_changes()
"#;

const LIST_TABLES: &str = r#"
SELECT table_name::text
FROM information_schema.tables
WHERE table_schema = $1
  AND table_type = 'BASE TABLE'
  AND table_name <> $2
ORDER BY table_name
"#;

const FETCH_SINK_DATA: &str = "SELECT data::text FROM notification WHERE id = $1";

const TRIGGER_EXISTS: &str = r#"
SELECT EXISTS (
    SELECT 1 FROM pg_trigger
    WHERE tgrelid = to_regclass($1) AND tgname = $2 AND NOT tgisinternal
)
"#;

/// How a single table ended up after attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableOutcome {
    /// The capture trigger was created by this run.
    Instrumented,
    /// The table already carried the capture trigger.
    AlreadyInstrumented,
}

/// A table whose capture trigger could not be attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerFailure {
    /// Table name.
    pub table: String,
    /// Error reported by the store.
    pub error: String,
}

/// Per-table results of one instrumentation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootstrapReport {
    /// Tables that received a capture trigger in this pass.
    pub instrumented: Vec<String>,
    /// Tables that already had one.
    pub already_instrumented: Vec<String>,
    /// Tables where attachment failed.
    pub failures: Vec<TriggerFailure>,
}

impl BootstrapReport {
    /// Record the outcome for one table.
    pub fn record(&mut self, table: String, outcome: Result<TableOutcome>) {
        match outcome {
            Ok(TableOutcome::Instrumented) => self.instrumented.push(table),
            Ok(TableOutcome::AlreadyInstrumented) => self.already_instrumented.push(table),
            Err(e) => self.failures.push(TriggerFailure {
                table,
                error: e.to_string(),
            }),
        }
    }

    /// Number of tables examined.
    pub fn total(&self) -> usize {
        self.instrumented.len() + self.already_instrumented.len() + self.failures.len()
    }

    /// Whether every table ended up instrumented.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Sort every list by table name; attachment completes out of order.
    fn sort(&mut self) {
        self.instrumented.sort();
        self.already_instrumented.sort();
        self.failures.sort_by(|a, b| a.table.cmp(&b.table));
    }
}

/// Quote an identifier the way `quote_ident` does.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Schema-qualified, quoted relation name.
pub fn qualified_name(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

/// Name of the capture trigger for `table`, truncated the way PostgreSQL
/// truncates identifiers so existence checks match what was stored.
pub fn trigger_name(table: &str) -> String {
    let mut name = format!("{}{}", TABLE_TRIGGER_PREFIX, table);
    if name.len() > MAX_IDENTIFIER_LEN {
        let mut cut = MAX_IDENTIFIER_LEN;
        while !name.is_char_boundary(cut) {
            cut -= 1;
        }
        name.truncate(cut);
    }
    name
}

fn create_trigger_sql(schema: &str, table: &str) -> String {
    format!(
        "CREATE TRIGGER {} AFTER INSERT OR UPDATE OR DELETE ON {} FOR EACH ROW EXECUTE PROCEDURE {}()",
        quote_ident(&trigger_name(table)),
        qualified_name(schema, table),
        CAPTURE_FUNCTION,
    )
}

async fn execute(pool: &PgPool, step: &'static str, sql: &str) -> Result<()> {
    sqlx::raw_sql(sql)
        .execute(pool)
        .await
        .map_err(|source| Error::Bootstrap { step, source })?;
    debug!(step, "bootstrap step applied");
    Ok(())
}

async fn trigger_exists(pool: &PgPool, relation: &str, trigger: &str) -> Result<bool> {
    let exists: bool = sqlx::query_scalar(TRIGGER_EXISTS)
        .bind(relation)
        .bind(trigger)
        .fetch_one(pool)
        .await?;
    Ok(exists)
}

/// Create the sink table and the capture function.
pub async fn install_sink(pool: &PgPool) -> Result<()> {
    execute(pool, "create sink table", CREATE_SINK_TABLE).await?;
    execute(pool, "create capture function", CREATE_CAPTURE_FUNCTION).await?;
    Ok(())
}

/// Create the relay function and attach it to the sink.
pub async fn install_relay(pool: &PgPool) -> Result<()> {
    execute(pool, "create relay function", CREATE_RELAY_FUNCTION).await?;

    if trigger_exists(pool, &quote_ident(SINK_TABLE), RELAY_TRIGGER).await? {
        debug!("relay trigger already present");
        return Ok(());
    }
    execute(pool, "create relay trigger", CREATE_RELAY_TRIGGER).await
}

/// Read the captured `data` of sink row `id`, for rows relayed without it.
pub async fn fetch_sink_data(pool: &PgPool, id: i64) -> Result<Option<serde_json::Value>> {
    let raw: Option<String> = sqlx::query_scalar(FETCH_SINK_DATA)
        .bind(id)
        .fetch_optional(pool)
        .await?;
    raw.map(|raw| {
        serde_json::from_str(&raw)
            .map_err(|e| Error::Decode(format!("invalid sink data for row {}: {}", id, e)))
    })
    .transpose()
}

/// List the base tables of `schema`, excluding the sink.
pub async fn list_tables(pool: &PgPool, schema: &str) -> Result<Vec<String>> {
    let tables: Vec<String> = sqlx::query_scalar(LIST_TABLES)
        .bind(schema)
        .bind(SINK_TABLE)
        .fetch_all(pool)
        .await?;
    Ok(tables)
}

/// Attach the capture trigger to one table unless it already has it.
pub async fn attach_trigger(pool: &PgPool, schema: &str, table: &str) -> Result<TableOutcome> {
    let relation = qualified_name(schema, table);
    if trigger_exists(pool, &relation, &trigger_name(table)).await? {
        return Ok(TableOutcome::AlreadyInstrumented);
    }

    sqlx::raw_sql(&create_trigger_sql(schema, table))
        .execute(pool)
        .await?;
    Ok(TableOutcome::Instrumented)
}

/// Attach capture triggers to every table of `schema`.
///
/// At most `concurrency` attachments run at once. Each table's result is
/// captured in the report; a failing table never stops the others. Only a
/// failure to list the tables is returned as an error.
pub async fn instrument_tables(
    pool: &PgPool,
    schema: &str,
    concurrency: usize,
) -> Result<BootstrapReport> {
    let tables = list_tables(pool, schema).await?;

    let outcomes: Vec<(String, Result<TableOutcome>)> = futures::stream::iter(tables)
        .map(|table| {
            let pool = pool.clone();
            let schema = schema.to_string();
            async move {
                let outcome = attach_trigger(&pool, &schema, &table).await;
                (table, outcome)
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let mut report = BootstrapReport::default();
    for (table, outcome) in outcomes {
        match &outcome {
            Ok(TableOutcome::Instrumented) => info!(table = %table, "capture trigger attached"),
            Ok(TableOutcome::AlreadyInstrumented) => {
                debug!(table = %table, "capture trigger already attached")
            }
            Err(e) => warn!(table = %table, error = %e, "failed to attach capture trigger"),
        }
        report.record(table, outcome);
    }
    report.sort();

    Ok(report)
}

/// Run the full startup protocol.
///
/// Failures creating the sink, the functions or the relay trigger are
/// returned; per-table failures are only reported.
pub async fn bootstrap(pool: &PgPool, schema: &str, concurrency: usize) -> Result<BootstrapReport> {
    install_sink(pool).await?;
    let report = instrument_tables(pool, schema, concurrency).await?;
    install_relay(pool).await?;

    info!(
        schema,
        tables = report.total(),
        instrumented = report.instrumented.len(),
        already_instrumented = report.already_instrumented.len(),
        failed = report.failures.len(),
        "relational bootstrap complete"
    );

    Ok(report)
}
