use crate::error::MigrationError;
use crate::table_types::{spec_for, TableTypeCode};
use anyhow::{Context, Result};
use chrono::{Local, NaiveDate, TimeZone};
use sqlx::{PgPool, Row};
use std::collections::HashSet;

/// What the caller wants migrated: a calendar range and a set of families.
#[derive(Debug, Clone)]
pub struct DiscoveryRequest {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub types: Vec<TableTypeCode>,
}

/// One partition to migrate, as found in the source catalog. Bounds are
/// epoch milliseconds for every family; the timestamp representation only
/// appears in DDL literals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionDescriptor {
    pub parent: String,
    pub child: String,
    pub code: TableTypeCode,
    pub from_date: i64,
    pub to_date: i64,
    pub cluster_index: bool,
    pub estimated_rows: Option<i64>,
}

/// Translates a calendar range into millisecond bounds at local midnight:
/// 00:00:00.000 on the first day through 23:59:59.999 on the last.
pub fn day_range_millis(start: NaiveDate, end: NaiveDate) -> Result<(i64, i64)> {
    let start_naive = start.and_hms_opt(0, 0, 0).context("building range start")?;
    let end_naive = end
        .and_hms_milli_opt(23, 59, 59, 999)
        .context("building range end")?;
    let start_ms = Local
        .from_local_datetime(&start_naive)
        .earliest()
        .context("resolving range start in the local timezone")?
        .timestamp_millis();
    let end_ms = Local
        .from_local_datetime(&end_naive)
        .earliest()
        .context("resolving range end in the local timezone")?
        .timestamp_millis();
    Ok((start_ms, end_ms))
}

fn validate(request: &DiscoveryRequest) -> Result<()> {
    if request.types.is_empty() {
        return Err(MigrationError::Validation("no table types selected".to_string()).into());
    }
    if request.start > request.end {
        return Err(MigrationError::Validation(format!(
            "invalid date range: {} is after {}",
            request.start, request.end
        ))
        .into());
    }
    Ok(())
}

/// Queries the source catalog for partitions overlapping the range.
///
/// Pure with respect to source state: the same request against the same
/// catalog yields the same descriptors, in `(table_data, from_date)` order.
/// An empty result is a valid outcome, not an error.
pub async fn discover_partitions(
    source: &PgPool,
    request: &DiscoveryRequest,
) -> Result<Vec<PartitionDescriptor>> {
    validate(request)?;
    let (range_start, range_end) = day_range_millis(request.start, request.end)?;
    let mut codes: Vec<String> = Vec::new();
    for code in &request.types {
        let text = code.as_str().to_string();
        if !codes.contains(&text) {
            codes.push(text);
        }
    }
    let rows = sqlx::query(
        "SELECT table_name, table_data, from_date, to_date, cluster_index
         FROM partition_table_info
         WHERE table_data = ANY($1)
           AND use_flag = true
           AND from_date <= $2
           AND to_date >= $3
         ORDER BY table_data, from_date;",
    )
    .bind(&codes)
    .bind(range_end)
    .bind(range_start)
    .fetch_all(source)
    .await
    .with_context(|| "querying partition_table_info")?;

    let mut seen = HashSet::new();
    let mut descriptors = Vec::with_capacity(rows.len());
    for row in rows {
        let child: String = row.try_get("table_name")?;
        // overlapping catalog ranges list a partition once
        if !seen.insert(child.clone()) {
            continue;
        }
        let code_text: String = row.try_get("table_data")?;
        let code = TableTypeCode::parse(&code_text)?;
        let from_date: i64 = row.try_get("from_date")?;
        let to_date: i64 = row.try_get("to_date")?;
        if from_date > to_date {
            return Err(MigrationError::Validation(format!(
                "catalog row for {child} has from_date > to_date"
            ))
            .into());
        }
        descriptors.push(PartitionDescriptor {
            parent: spec_for(code).parent.to_string(),
            child,
            code,
            from_date,
            to_date,
            cluster_index: row.try_get("cluster_index")?,
            estimated_rows: None,
        });
    }
    Ok(descriptors)
}

/// Best-effort row estimates from planner statistics. Never authoritative
/// and never an error: a partition that cannot be estimated keeps `None`.
pub async fn attach_row_estimates(source: &PgPool, descriptors: &mut [PartitionDescriptor]) {
    for descriptor in descriptors.iter_mut() {
        let estimate: Result<Option<i64>, sqlx::Error> =
            sqlx::query_scalar("SELECT reltuples::bigint FROM pg_class WHERE relname = $1;")
                .bind(&descriptor.child)
                .fetch_optional(source)
                .await;
        if let Ok(Some(rows)) = estimate {
            if rows >= 0 {
                descriptor.estimated_rows = Some(rows);
            }
        }
    }
}
