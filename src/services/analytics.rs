//! Read-only analytics: a safe query builder, pre-built named queries, and
//! result rendering (table, JSON, CSV, JSONL).
//!
//! Named queries are written with `$N` placeholders and flow through the
//! storage adapter's parameter normalization, so optional filters reuse a
//! placeholder instead of duplicating bindings.

use chrono::{DateTime, Duration, Utc};
use comfy_table::{presets, ContentArrangement, Table};
use serde_json::{json, Value};
use sqlx::{Column, Row, SqlitePool};

use crate::adapters::sqlite::{bind_values, format_datetime, normalize};
use crate::domain::errors::{CoreError, CoreResult};

/// Hard cap applied to raw SQL passed through the CLI.
pub const RAW_QUERY_LIMIT: u32 = 1000;

// -- safe builder --

/// Composable read-only query builder; emits `SELECT` and nothing else.
#[derive(Debug, Clone, Default)]
pub struct QueryBuilder {
    selects: Vec<String>,
    from: Option<String>,
    wheres: Vec<String>,
    group_by: Vec<String>,
    order_by: Vec<String>,
    limit: Option<u32>,
}

impl QueryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(mut self, expr: &str) -> Self {
        self.selects.push(expr.to_string());
        self
    }

    pub fn from(mut self, table: &str) -> Self {
        self.from = Some(table.to_string());
        self
    }

    pub fn where_clause(mut self, clause: &str) -> Self {
        self.wheres.push(clause.to_string());
        self
    }

    pub fn group_by(mut self, expr: &str) -> Self {
        self.group_by.push(expr.to_string());
        self
    }

    pub fn order_by(mut self, expr: &str) -> Self {
        self.order_by.push(expr.to_string());
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn build(&self) -> CoreResult<String> {
        let from = self
            .from
            .as_ref()
            .ok_or_else(|| CoreError::Invalid("query builder needs a FROM table".to_string()))?;
        if self.selects.is_empty() {
            return Err(CoreError::Invalid("query builder needs at least one SELECT".to_string()));
        }
        for fragment in self
            .selects
            .iter()
            .chain(self.wheres.iter())
            .chain(self.group_by.iter())
            .chain(self.order_by.iter())
            .chain(std::iter::once(from))
        {
            if fragment.contains(';') {
                return Err(CoreError::Invalid(format!("fragment contains ';': {fragment}")));
            }
        }

        let mut sql = format!("SELECT {} FROM {}", self.selects.join(", "), from);
        if !self.wheres.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&self.wheres.join(" AND "));
        }
        if !self.group_by.is_empty() {
            sql.push_str(" GROUP BY ");
            sql.push_str(&self.group_by.join(", "));
        }
        if !self.order_by.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&self.order_by.join(", "));
        }
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        Ok(sql)
    }
}

/// Refuse anything but a single `SELECT` / `WITH` statement.
pub fn ensure_read_only(sql: &str) -> CoreResult<()> {
    let stripped = strip_leading_comments(sql.trim());
    let head: String = stripped.chars().take(6).collect::<String>().to_ascii_uppercase();
    if !(head.starts_with("SELECT") || head.starts_with("WITH")) {
        return Err(CoreError::Invalid("only SELECT queries are allowed".to_string()));
    }
    // A semicolon may only terminate the statement.
    if let Some(pos) = stripped.find(';') {
        if !stripped[pos + 1..].trim().is_empty() {
            return Err(CoreError::Invalid("multiple statements are not allowed".to_string()));
        }
    }
    Ok(())
}

fn strip_leading_comments(mut sql: &str) -> &str {
    loop {
        sql = sql.trim_start();
        if let Some(rest) = sql.strip_prefix("--") {
            sql = rest.split_once('\n').map_or("", |(_, tail)| tail);
        } else if let Some(rest) = sql.strip_prefix("/*") {
            sql = rest.split_once("*/").map_or("", |(_, tail)| tail);
        } else {
            return sql;
        }
    }
}

// -- time filters --

/// Parse a relative time filter (`7d`, `12h`, `30m`) into an absolute
/// lower bound.
pub fn parse_time_filter(raw: &str) -> CoreResult<DateTime<Utc>> {
    let raw = raw.trim();
    let (digits, unit) = raw.split_at(raw.len().saturating_sub(1));
    let amount: i64 = digits
        .parse()
        .map_err(|_| CoreError::Invalid(format!("bad time filter: '{raw}' (want Nd, Nh, or Nm)")))?;
    if amount < 0 {
        return Err(CoreError::Invalid(format!("negative time filter: '{raw}'")));
    }
    let duration = match unit {
        "d" => Duration::days(amount),
        "h" => Duration::hours(amount),
        "m" => Duration::minutes(amount),
        _ => {
            return Err(CoreError::Invalid(format!(
                "bad time filter unit in '{raw}' (want d, h, or m)"
            )))
        }
    };
    Ok(Utc::now() - duration)
}

// -- named queries --

#[derive(Debug, Clone, Default)]
pub struct AnalyticsFilters {
    pub project: Option<String>,
    pub since: Option<String>,
    pub until: Option<String>,
    pub epic: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PreparedQuery {
    pub name: &'static str,
    pub description: &'static str,
    pub sql: String,
    pub parameters: Vec<Value>,
}

/// `(name, description)` pairs for `db list`.
pub fn named_queries() -> Vec<(&'static str, &'static str)> {
    NAMED.iter().map(|(name, description, _)| (*name, *description)).collect()
}

type QueryFn = fn(&Bounds) -> (String, Vec<Value>);

struct Bounds {
    project: String,
    epic: String,
    since_ms: i64,
    until_ms: i64,
    since_ts: String,
    until_ts: String,
}

static NAMED: &[(&str, &str, QueryFn)] = &[
    ("agent-activity", "Event counts and first/last activity per agent", agent_activity),
    ("failed-decompositions", "Unsuccessful decompositions by strategy", failed_decompositions),
    ("strategy-success-rates", "Success percentage by decomposition strategy", strategy_success_rates),
    ("lock-contention", "Reservation counts and mean hold time per path", lock_contention),
    ("message-latency", "p50/p95/p99 delivery-to-read latency", message_latency),
    ("task-duration", "p50/p95/p99 open-to-close duration of cells", task_duration),
    ("scope-violations", "Writes outside reserved scopes per agent", scope_violations),
    ("checkpoint-frequency", "Checkpoints saved per agent per day", checkpoint_frequency),
    ("recovery-success", "Recovery attempt outcomes", recovery_success),
    ("human-feedback", "Human feedback entries by sentiment", human_feedback),
];

/// Resolve a named analytics query against the supplied filters.
pub fn prepare(name: &str, filters: &AnalyticsFilters) -> CoreResult<PreparedQuery> {
    let &(query_name, description, build) = NAMED
        .iter()
        .find(|(n, _, _)| *n == name)
        .ok_or_else(|| CoreError::not_found("analytics query", name))?;

    let since = filters.since.as_deref().map(parse_time_filter).transpose()?;
    let until = filters.until.as_deref().map(parse_time_filter).transpose()?;

    let bounds = Bounds {
        project: filters.project.clone().unwrap_or_default(),
        epic: filters.epic.clone().unwrap_or_default(),
        since_ms: since.map_or(0, |t| t.timestamp_millis()),
        until_ms: until.map_or(i64::MAX, |t| t.timestamp_millis()),
        since_ts: since.map_or_else(|| "0000".to_string(), format_datetime),
        until_ts: until.map_or_else(|| "9999".to_string(), format_datetime),
    };

    let (sql, parameters) = build(&bounds);
    Ok(PreparedQuery { name: query_name, description, sql, parameters })
}

const AGENT_EXPR: &str = "COALESCE(json_extract(data, '$.agent_name'), json_extract(data, '$.name'), \
                          json_extract(data, '$.from_agent'), json_extract(data, '$.holder'))";

fn agent_activity(b: &Bounds) -> (String, Vec<Value>) {
    (
        format!(
            "SELECT {AGENT_EXPR} AS agent, COUNT(*) AS events, \
                    MIN(timestamp) AS first_seen_ms, MAX(timestamp) AS last_seen_ms, \
                    MAX(timestamp) - MIN(timestamp) AS active_span_ms \
             FROM events \
             WHERE ($1 = '' OR project_key = $1) AND timestamp >= $2 AND timestamp <= $3 \
               AND {AGENT_EXPR} IS NOT NULL \
             GROUP BY agent ORDER BY events DESC"
        ),
        vec![json!(b.project), json!(b.since_ms), json!(b.until_ms)],
    )
}

fn failed_decompositions(b: &Bounds) -> (String, Vec<Value>) {
    (
        "SELECT json_extract(data, '$.strategy') AS strategy, COUNT(*) AS failures, \
                AVG(json_extract(data, '$.duration_ms')) AS avg_duration_ms \
         FROM events \
         WHERE event_type = 'decomposition_completed' \
           AND json_extract(data, '$.success') = 0 \
           AND ($1 = '' OR project_key = $1) AND timestamp >= $2 AND timestamp <= $3 \
         GROUP BY strategy ORDER BY failures DESC"
            .to_string(),
        vec![json!(b.project), json!(b.since_ms), json!(b.until_ms)],
    )
}

fn strategy_success_rates(b: &Bounds) -> (String, Vec<Value>) {
    (
        "SELECT json_extract(data, '$.strategy') AS strategy, \
                SUM(CASE WHEN json_extract(data, '$.success') THEN 1 ELSE 0 END) AS successes, \
                SUM(CASE WHEN json_extract(data, '$.success') THEN 0 ELSE 1 END) AS failures, \
                ROUND(100.0 * SUM(CASE WHEN json_extract(data, '$.success') THEN 1 ELSE 0 END) / COUNT(*), 1) AS success_pct \
         FROM events \
         WHERE event_type = 'decomposition_completed' \
           AND ($1 = '' OR project_key = $1) AND timestamp >= $2 AND timestamp <= $3 \
         GROUP BY strategy ORDER BY success_pct DESC"
            .to_string(),
        vec![json!(b.project), json!(b.since_ms), json!(b.until_ms)],
    )
}

fn lock_contention(b: &Bounds) -> (String, Vec<Value>) {
    (
        "SELECT path_pattern, COUNT(*) AS reservations, \
                AVG((julianday(COALESCE(released_at, expires_at)) - julianday(created_at)) * 86400000.0) AS avg_hold_ms \
         FROM reservations \
         WHERE ($1 = '' OR project_key = $1) AND created_at >= $2 AND created_at <= $3 \
         GROUP BY path_pattern ORDER BY reservations DESC"
            .to_string(),
        vec![json!(b.project), json!(b.since_ts), json!(b.until_ts)],
    )
}

fn message_latency(b: &Bounds) -> (String, Vec<Value>) {
    (
        "WITH durations AS ( \
             SELECT (julianday(r.read_at) - julianday(m.created_at)) * 86400000.0 AS ms, \
                    ROW_NUMBER() OVER (ORDER BY julianday(r.read_at) - julianday(m.created_at)) AS rn \
             FROM message_recipients r JOIN messages m ON m.id = r.message_id \
             WHERE r.read_at IS NOT NULL \
               AND ($1 = '' OR m.project_key = $1) AND m.created_at >= $2 AND m.created_at <= $3 \
         ), total AS (SELECT COUNT(*) AS n FROM durations) \
         SELECT (SELECT n FROM total) AS delivered, \
                (SELECT ms FROM durations, total WHERE rn = MAX(1, CAST(n * 0.50 AS INTEGER))) AS p50_ms, \
                (SELECT ms FROM durations, total WHERE rn = MAX(1, CAST(n * 0.95 AS INTEGER))) AS p95_ms, \
                (SELECT ms FROM durations, total WHERE rn = MAX(1, CAST(n * 0.99 AS INTEGER))) AS p99_ms"
            .to_string(),
        vec![json!(b.project), json!(b.since_ts), json!(b.until_ts)],
    )
}

fn task_duration(b: &Bounds) -> (String, Vec<Value>) {
    (
        "WITH durations AS ( \
             SELECT (julianday(closed_at) - julianday(created_at)) * 86400000.0 AS ms, \
                    ROW_NUMBER() OVER (ORDER BY julianday(closed_at) - julianday(created_at)) AS rn \
             FROM cells \
             WHERE closed_at IS NOT NULL AND deleted_at IS NULL \
               AND ($1 = '' OR project_key = $1) \
               AND ($4 = '' OR parent_id = $4) \
               AND created_at >= $2 AND created_at <= $3 \
         ), total AS (SELECT COUNT(*) AS n FROM durations) \
         SELECT (SELECT n FROM total) AS closed, \
                (SELECT ms FROM durations, total WHERE rn = MAX(1, CAST(n * 0.50 AS INTEGER))) AS p50_ms, \
                (SELECT ms FROM durations, total WHERE rn = MAX(1, CAST(n * 0.95 AS INTEGER))) AS p95_ms, \
                (SELECT ms FROM durations, total WHERE rn = MAX(1, CAST(n * 0.99 AS INTEGER))) AS p99_ms"
            .to_string(),
        vec![json!(b.project), json!(b.since_ts), json!(b.until_ts), json!(b.epic)],
    )
}

fn scope_violations(b: &Bounds) -> (String, Vec<Value>) {
    (
        format!(
            "SELECT {AGENT_EXPR} AS agent, json_extract(data, '$.path') AS path, COUNT(*) AS violations \
             FROM events \
             WHERE event_type = 'scope_violation' \
               AND ($1 = '' OR project_key = $1) AND timestamp >= $2 AND timestamp <= $3 \
             GROUP BY agent, path ORDER BY violations DESC"
        ),
        vec![json!(b.project), json!(b.since_ms), json!(b.until_ms)],
    )
}

fn checkpoint_frequency(b: &Bounds) -> (String, Vec<Value>) {
    (
        format!(
            "SELECT {AGENT_EXPR} AS agent, date(timestamp / 1000, 'unixepoch') AS day, COUNT(*) AS checkpoints \
             FROM events \
             WHERE event_type = 'checkpoint_saved' \
               AND ($1 = '' OR project_key = $1) AND timestamp >= $2 AND timestamp <= $3 \
             GROUP BY agent, day ORDER BY day DESC, agent"
        ),
        vec![json!(b.project), json!(b.since_ms), json!(b.until_ms)],
    )
}

fn recovery_success(b: &Bounds) -> (String, Vec<Value>) {
    (
        "SELECT json_extract(data, '$.outcome') AS outcome, COUNT(*) AS attempts \
         FROM events \
         WHERE event_type = 'recovery_attempted' \
           AND ($1 = '' OR project_key = $1) AND timestamp >= $2 AND timestamp <= $3 \
         GROUP BY outcome ORDER BY attempts DESC"
            .to_string(),
        vec![json!(b.project), json!(b.since_ms), json!(b.until_ms)],
    )
}

fn human_feedback(b: &Bounds) -> (String, Vec<Value>) {
    (
        "SELECT json_extract(data, '$.sentiment') AS sentiment, COUNT(*) AS entries \
         FROM events \
         WHERE event_type = 'human_feedback' \
           AND ($1 = '' OR project_key = $1) AND timestamp >= $2 AND timestamp <= $3 \
         GROUP BY sentiment ORDER BY entries DESC"
            .to_string(),
        vec![json!(b.project), json!(b.since_ms), json!(b.until_ms)],
    )
}

// -- execution --

/// Column-ordered result rows; JSON objects lose SQL column order, so the
/// renderers work from this instead.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

#[derive(Clone)]
pub struct AnalyticsService {
    pool: SqlitePool,
}

impl AnalyticsService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn run(&self, prepared: &PreparedQuery) -> CoreResult<ResultSet> {
        self.execute(&prepared.sql, &prepared.parameters).await
    }

    /// Raw SQL entry point: read-only, hard-capped at `RAW_QUERY_LIMIT`.
    pub async fn run_raw(&self, sql: &str) -> CoreResult<ResultSet> {
        ensure_read_only(sql)?;
        let capped = format!(
            "SELECT * FROM ({}) LIMIT {RAW_QUERY_LIMIT}",
            sql.trim().trim_end_matches(';')
        );
        self.execute(&capped, &[]).await
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> CoreResult<ResultSet> {
        let (sql, binds) = normalize(sql, params)?;
        let rows = bind_values(sqlx::query(&sql), &binds)?
            .fetch_all(&self.pool)
            .await
            .map_err(|e| CoreError::Invalid(format!("query failed: {e}")))?;

        let mut result = ResultSet::default();
        let Some(first) = rows.first() else {
            return Ok(result);
        };
        result.columns = first.columns().iter().map(|c| c.name().to_string()).collect();

        for row in &rows {
            let mut values = Vec::with_capacity(result.columns.len());
            for index in 0..result.columns.len() {
                values.push(decode_column(row, index));
            }
            result.rows.push(values);
        }
        Ok(result)
    }
}

fn decode_column(row: &sqlx::sqlite::SqliteRow, index: usize) -> Value {
    if let Ok(value) = row.try_get::<Option<i64>, _>(index) {
        return value.map_or(Value::Null, Value::from);
    }
    if let Ok(value) = row.try_get::<Option<f64>, _>(index) {
        return value.map_or(Value::Null, Value::from);
    }
    if let Ok(value) = row.try_get::<Option<String>, _>(index) {
        return value.map_or(Value::Null, Value::from);
    }
    Value::Null
}

// -- rendering --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Csv,
    Jsonl,
}

impl OutputFormat {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "table" => Some(Self::Table),
            "json" => Some(Self::Json),
            "csv" => Some(Self::Csv),
            "jsonl" => Some(Self::Jsonl),
            _ => None,
        }
    }
}

pub fn render(result: &ResultSet, format: OutputFormat) -> String {
    match format {
        OutputFormat::Table => render_table(result),
        OutputFormat::Json => serde_json::to_string_pretty(&to_objects(result)).unwrap_or_default(),
        OutputFormat::Csv => render_csv(result),
        OutputFormat::Jsonl => to_objects(result)
            .iter()
            .map(|o| serde_json::to_string(o).unwrap_or_default())
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

fn to_objects(result: &ResultSet) -> Vec<Value> {
    result
        .rows
        .iter()
        .map(|row| {
            let mut object = serde_json::Map::new();
            for (column, value) in result.columns.iter().zip(row.iter()) {
                object.insert(column.clone(), value.clone());
            }
            Value::Object(object)
        })
        .collect()
}

fn render_table(result: &ResultSet) -> String {
    if result.columns.is_empty() {
        return "(no rows)".to_string();
    }
    let mut table = Table::new();
    table
        .load_preset(presets::ASCII_MARKDOWN)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(result.columns.clone());
    for row in &result.rows {
        table.add_row(row.iter().map(value_to_text));
    }
    table.to_string()
}

fn render_csv(result: &ResultSet) -> String {
    let mut lines = Vec::with_capacity(result.rows.len() + 1);
    lines.push(result.columns.iter().map(|c| csv_field(c)).collect::<Vec<_>>().join(","));
    for row in &result.rows {
        lines.push(row.iter().map(|v| csv_field(&value_to_text(v))).collect::<Vec<_>>().join(","));
    }
    lines.join("\r\n")
}

/// RFC 4180: quote fields containing commas, quotes, or newlines; double
/// embedded quotes.
fn csv_field(raw: &str) -> String {
    if raw.contains(',') || raw.contains('"') || raw.contains('\n') || raw.contains('\r') {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_assembles_clauses_in_order() {
        let sql = QueryBuilder::new()
            .select("agent")
            .select("COUNT(*) AS n")
            .from("events")
            .where_clause("project_key = 'p'")
            .group_by("agent")
            .order_by("n DESC")
            .limit(10)
            .build()
            .unwrap();
        assert_eq!(
            sql,
            "SELECT agent, COUNT(*) AS n FROM events WHERE project_key = 'p' GROUP BY agent ORDER BY n DESC LIMIT 10"
        );
    }

    #[test]
    fn builder_rejects_embedded_statements() {
        let result = QueryBuilder::new()
            .select("1; DROP TABLE events")
            .from("events")
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn read_only_guard() {
        assert!(ensure_read_only("SELECT 1").is_ok());
        assert!(ensure_read_only("  with x as (select 1) select * from x").is_ok());
        assert!(ensure_read_only("-- note\nSELECT 1;").is_ok());
        assert!(ensure_read_only("DELETE FROM events").is_err());
        assert!(ensure_read_only("SELECT 1; DROP TABLE events").is_err());
        assert!(ensure_read_only("PRAGMA journal_mode = DELETE").is_err());
    }

    #[test]
    fn time_filters_parse() {
        let day = parse_time_filter("1d").unwrap();
        assert!((Utc::now() - day).num_hours() >= 23);
        assert!(parse_time_filter("12h").is_ok());
        assert!(parse_time_filter("30m").is_ok());
        assert!(parse_time_filter("7w").is_err());
        assert!(parse_time_filter("d").is_err());
        assert!(parse_time_filter("").is_err());
    }

    #[test]
    fn unknown_named_query_is_not_found() {
        assert!(prepare("nope", &AnalyticsFilters::default()).is_err());
    }

    #[test]
    fn every_named_query_prepares() {
        let filters = AnalyticsFilters {
            project: Some("/p".to_string()),
            since: Some("7d".to_string()),
            until: None,
            epic: Some("epic-1".to_string()),
        };
        for (name, _) in named_queries() {
            let prepared = prepare(name, &filters).unwrap();
            assert!(!prepared.sql.is_empty(), "{name} produced empty sql");
        }
    }

    #[test]
    fn csv_quotes_embedded_separators() {
        let result = ResultSet {
            columns: vec!["a".to_string(), "b".to_string()],
            rows: vec![vec![
                Value::from("plain"),
                Value::from("has,comma and \"quote\"\nand newline"),
            ]],
        };
        let csv = render_csv(&result);
        assert_eq!(
            csv,
            "a,b\r\nplain,\"has,comma and \"\"quote\"\"\nand newline\""
        );
    }

    #[test]
    fn jsonl_renders_one_object_per_row() {
        let result = ResultSet {
            columns: vec!["n".to_string()],
            rows: vec![vec![Value::from(1)], vec![Value::from(2)]],
        };
        let jsonl = render(&result, OutputFormat::Jsonl);
        assert_eq!(jsonl, "{\"n\":1}\n{\"n\":2}");
    }
}
