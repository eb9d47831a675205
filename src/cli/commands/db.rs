//! `hivemind db` subcommands: the read-only query runner.

use anyhow::{bail, Result};

use crate::services::analytics::{
    self, named_queries, AnalyticsFilters, AnalyticsService, OutputFormat,
};

pub async fn handle_list(json: bool) -> Result<()> {
    let queries = named_queries();
    if json {
        let items: Vec<serde_json::Value> = queries
            .iter()
            .map(|(name, description)| serde_json::json!({ "name": name, "description": description }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    for (name, description) in queries {
        println!("{name:24} {description}");
    }
    Ok(())
}

pub async fn handle_query(service: &AnalyticsService, sql: &str, json: bool) -> Result<()> {
    let result = service.run_raw(sql).await?;
    let format = if json { OutputFormat::Json } else { OutputFormat::Table };
    println!("{}", analytics::render(&result, format));
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub async fn handle_analytics(
    service: &AnalyticsService,
    name: &str,
    since: Option<String>,
    until: Option<String>,
    project: Option<String>,
    epic: Option<String>,
    format: &str,
    json: bool,
) -> Result<()> {
    let Some(mut output) = OutputFormat::from_str(format) else {
        bail!("unknown format '{format}' (want table, json, csv, or jsonl)");
    };
    if json {
        output = OutputFormat::Json;
    }

    let filters = AnalyticsFilters { project, since, until, epic };
    let prepared = analytics::prepare(name, &filters)?;
    tracing::debug!(name = prepared.name, sql = %prepared.sql, "running analytics query");

    let result = service.run(&prepared).await?;
    println!("{}", analytics::render(&result, output));
    Ok(())
}
