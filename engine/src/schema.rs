use crate::bus::TruncateDecision;
use crate::connect::count_rows;
use crate::discovery::PartitionDescriptor;
use crate::error::MigrationError;
use crate::logging::SessionLogger;
use crate::table_types::{spec_for, Dispatch, TableTypeSpec};
use crate::worker::WorkerControl;
use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{PgPool, Row};

/// Whether a populated child may be truncated without asking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyMode {
    /// Truncate immediately (streaming COPY engine).
    Auto,
    /// Ask the observer and block for the answer (row-batch engine).
    Confirm,
}

pub fn parent_table_ddl(spec: &TableTypeSpec) -> String {
    let columns = spec
        .columns
        .iter()
        .map(|c| format!("{} {}", c.name, c.kind.sql_type()))
        .collect::<Vec<_>>()
        .join(", ");
    format!("CREATE TABLE IF NOT EXISTS {} ({});", spec.parent, columns)
}

pub fn parent_index_ddl(spec: &TableTypeSpec) -> Vec<(String, String)> {
    spec.parent_indexes
        .iter()
        .map(|index| {
            (
                index.name.to_string(),
                format!(
                    "CREATE INDEX {} ON {} ({});",
                    index.name,
                    spec.parent,
                    index.columns.join(", ")
                ),
            )
        })
        .collect()
}

pub fn trigger_function_name(spec: &TableTypeSpec) -> String {
    format!("{}_partition_insert", spec.parent)
}

pub fn trigger_name(spec: &TableTypeSpec) -> String {
    format!("{}_insert_trigger", spec.parent)
}

/// PL/pgSQL function routing a parent insert into the `_YYMMDD` child named
/// by the row's date. Written against the 9.3 dialect.
pub fn trigger_function_ddl(spec: &TableTypeSpec) -> String {
    format!(
        "CREATE OR REPLACE FUNCTION {function}() RETURNS trigger AS $$\n\
         DECLARE\n\
         \x20   child_name text;\n\
         BEGIN\n\
         \x20   child_name := '{parent}_' || to_char(to_timestamp(NEW.{date_column} / 1000.0), 'YYMMDD');\n\
         \x20   EXECUTE 'INSERT INTO ' || quote_ident(child_name) || ' VALUES ($1.*)' USING NEW;\n\
         \x20   RETURN NULL;\n\
         END;\n\
         $$ LANGUAGE plpgsql;",
        function = trigger_function_name(spec),
        parent = spec.parent,
        date_column = spec.date_column,
    )
}

pub fn trigger_ddl(spec: &TableTypeSpec) -> String {
    format!(
        "CREATE TRIGGER {trigger} BEFORE INSERT ON {parent} \
         FOR EACH ROW EXECUTE PROCEDURE {function}();",
        trigger = trigger_name(spec),
        parent = spec.parent,
        function = trigger_function_name(spec),
    )
}

/// Child DDL: range CHECK plus primary key, inheriting the parent columns.
pub fn child_table_ddl(spec: &TableTypeSpec, desc: &PartitionDescriptor) -> Result<String> {
    Ok(format!(
        "CREATE TABLE {child} (\
         CHECK ({date_column} BETWEEN {from} AND {to}), \
         PRIMARY KEY ({pk})\
         ) INHERITS ({parent});",
        child = desc.child,
        date_column = spec.date_column,
        from = spec.date_bound_literal(desc.from_date)?,
        to = spec.date_bound_literal(desc.to_date)?,
        pk = spec.primary_key_list(),
        parent = spec.parent,
    ))
}

/// Rules are named after the child they route to, so monthly children yield
/// the `rule_<parent>_<YYMM>` shape and daily children stay collision-free.
pub fn rule_name(child: &str) -> String {
    format!("rule_{child}")
}

pub fn rule_ddl(spec: &TableTypeSpec, desc: &PartitionDescriptor) -> Result<String> {
    Ok(format!(
        "CREATE RULE {rule} AS ON INSERT TO {parent} \
         WHERE (new.{date_column} BETWEEN {from} AND {to}) \
         DO INSTEAD INSERT INTO {child} VALUES (NEW.*);",
        rule = rule_name(&desc.child),
        parent = spec.parent,
        date_column = spec.date_column,
        from = spec.date_bound_literal(desc.from_date)?,
        to = spec.date_bound_literal(desc.to_date)?,
        child = desc.child,
    ))
}

async fn table_exists(
    tr: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    table: &str,
) -> Result<bool> {
    let row = sqlx::query("SELECT 1 FROM pg_class WHERE relname = $1 AND relkind = 'r';")
        .bind(table)
        .fetch_optional(&mut **tr)
        .await
        .with_context(|| format!("checking for table {table}"))?;
    Ok(row.is_some())
}

/// Compares an existing table against the registry shape; a mismatch is a
/// schema conflict, not something to repair silently.
async fn verify_table_shape(
    tr: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    table: &str,
    spec: &TableTypeSpec,
) -> Result<()> {
    let rows = sqlx::query(
        "SELECT column_name, data_type
         FROM information_schema.columns
         WHERE table_schema = 'public' AND table_name = $1
         ORDER BY ordinal_position;",
    )
    .bind(table)
    .fetch_all(&mut **tr)
    .await
    .with_context(|| format!("reading columns of {table}"))?;
    if rows.len() != spec.columns.len() {
        return Err(MigrationError::SchemaConflict {
            table: table.to_string(),
            reason: format!(
                "expected {} columns, found {}",
                spec.columns.len(),
                rows.len()
            ),
        }
        .into());
    }
    for (row, expected) in rows.iter().zip(spec.columns) {
        let name: String = row.try_get("column_name")?;
        let data_type: String = row.try_get("data_type")?;
        if name != expected.name || data_type != expected.kind.information_schema_type() {
            return Err(MigrationError::SchemaConflict {
                table: table.to_string(),
                reason: format!(
                    "column {name} {data_type} does not match expected {} {}",
                    expected.name,
                    expected.kind.information_schema_type()
                ),
            }
            .into());
        }
    }
    Ok(())
}

async fn ensure_parent(
    tr: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    spec: &TableTypeSpec,
) -> Result<()> {
    sqlx::query(&parent_table_ddl(spec))
        .execute(&mut **tr)
        .await
        .with_context(|| format!("creating parent table {}", spec.parent))?;
    verify_table_shape(tr, spec.parent, spec).await?;
    for (index_name, ddl) in parent_index_ddl(spec) {
        // CREATE INDEX IF NOT EXISTS is not available on 9.3 targets
        let existing = sqlx::query("SELECT 1 FROM pg_indexes WHERE indexname = $1;")
            .bind(&index_name)
            .fetch_optional(&mut **tr)
            .await
            .with_context(|| format!("checking for index {index_name}"))?;
        if existing.is_none() {
            sqlx::query(&ddl)
                .execute(&mut **tr)
                .await
                .with_context(|| format!("creating index {index_name}"))?;
        }
    }
    Ok(())
}

async fn ensure_trigger(
    tr: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    spec: &TableTypeSpec,
) -> Result<()> {
    let existing = sqlx::query(
        "SELECT 1 FROM pg_trigger WHERE tgname = $1 AND tgrelid = $2::regclass;",
    )
    .bind(trigger_name(spec))
    .bind(spec.parent)
    .fetch_optional(&mut **tr)
    .await
    .with_context(|| format!("checking for trigger on {}", spec.parent))?;
    if existing.is_some() {
        return Ok(());
    }
    sqlx::query(&trigger_function_ddl(spec))
        .execute(&mut **tr)
        .await
        .with_context(|| format!("creating {}", trigger_function_name(spec)))?;
    sqlx::query(&trigger_ddl(spec))
        .execute(&mut **tr)
        .await
        .with_context(|| format!("creating trigger on {}", spec.parent))?;
    Ok(())
}

async fn ensure_child(
    tr: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    spec: &TableTypeSpec,
    desc: &PartitionDescriptor,
) -> Result<()> {
    if table_exists(tr, &desc.child).await? {
        return verify_table_shape(tr, &desc.child, spec).await;
    }
    sqlx::query(&child_table_ddl(spec, desc)?)
        .execute(&mut **tr)
        .await
        .with_context(|| format!("creating child table {}", desc.child))?;
    Ok(())
}

async fn ensure_rule(
    tr: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    spec: &TableTypeSpec,
    desc: &PartitionDescriptor,
) -> Result<()> {
    let name = rule_name(&desc.child);
    let existing = sqlx::query("SELECT 1 FROM pg_rules WHERE tablename = $1 AND rulename = $2;")
        .bind(spec.parent)
        .bind(&name)
        .fetch_optional(&mut **tr)
        .await
        .with_context(|| format!("checking for rule {name}"))?;
    if existing.is_some() {
        sqlx::query(&format!("DROP RULE {} ON {};", name, spec.parent))
            .execute(&mut **tr)
            .await
            .with_context(|| format!("dropping stale rule {name}"))?;
    }
    sqlx::query(&rule_ddl(spec, desc)?)
        .execute(&mut **tr)
        .await
        .with_context(|| format!("creating rule {name}"))?;
    Ok(())
}

/// Keeps the target's catalog in step with the source for migrated ranges.
async fn mirror_catalog_row(
    tr: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    desc: &PartitionDescriptor,
) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS partition_table_info(
                  table_name varchar(100),
                  table_data varchar(10),
                  from_date int8,
                  to_date int8,
                  use_flag bool,
                  save_date timestamp,
                  cluster_index bool);",
    )
    .execute(&mut **tr)
    .await
    .with_context(|| "creating partition_table_info on the target")?;
    // 9.3 targets have no ON CONFLICT; delete-then-insert inside the
    // partition transaction gives the same upsert.
    sqlx::query("DELETE FROM partition_table_info WHERE table_name = $1;")
        .bind(&desc.child)
        .execute(&mut **tr)
        .await
        .with_context(|| "clearing stale catalog row")?;
    sqlx::query(
        "INSERT INTO partition_table_info(table_name, table_data, from_date, to_date,
                                          use_flag, save_date, cluster_index)
         VALUES($1,$2,$3,$4,true,$5,$6);",
    )
    .bind(&desc.child)
    .bind(desc.code.as_str())
    .bind(desc.from_date)
    .bind(desc.to_date)
    .bind(Utc::now().naive_utc())
    .bind(desc.cluster_index)
    .execute(&mut **tr)
    .await
    .with_context(|| "mirroring catalog row")?;
    Ok(())
}

/// Brings the target up to the point where the partition can receive rows:
/// parent, dispatch mechanism, child and catalog row, all inside one
/// transaction so partial creates roll back together.
pub async fn ensure_target_schema(target: &PgPool, desc: &PartitionDescriptor) -> Result<()> {
    let spec = spec_for(desc.code);
    let mut tr = target.begin().await?;
    sqlx::query("SET LOCAL statement_timeout = 60000;")
        .execute(&mut *tr)
        .await
        .with_context(|| "bounding DDL statement timeout")?;
    ensure_parent(&mut tr, spec).await?;
    if spec.dispatch == Dispatch::Trigger {
        ensure_trigger(&mut tr, spec).await?;
    }
    ensure_child(&mut tr, spec, desc).await?;
    if spec.dispatch == Dispatch::Rules {
        ensure_rule(&mut tr, spec, desc).await?;
    }
    mirror_catalog_row(&mut tr, desc).await?;
    tr.commit()
        .await
        .with_context(|| format!("committing schema for {}", desc.child))?;
    Ok(())
}

pub async fn truncate_partition(target: &PgPool, child: &str) -> Result<()> {
    sqlx::query(&format!("TRUNCATE TABLE ONLY {child};"))
        .execute(target)
        .await
        .with_context(|| format!("truncating {child}"))?;
    Ok(())
}

/// Makes sure the child is empty before the copy starts.
///
/// A populated child is truncated outright in [`ReadyMode::Auto`]; in
/// [`ReadyMode::Confirm`] the observer is asked first and a decline fails
/// the partition.
pub async fn ensure_partition_ready(
    target: &PgPool,
    control: &mut WorkerControl,
    logger: &SessionLogger,
    child: &str,
    mode: ReadyMode,
) -> Result<()> {
    let existing = count_rows(target, child).await?;
    if existing == 0 {
        return Ok(());
    }
    match mode {
        ReadyMode::Auto => {
            logger.info(
                "schema",
                format!("{child} holds {existing} rows, truncating"),
            );
            truncate_partition(target, child).await
        }
        ReadyMode::Confirm => {
            logger.info(
                "schema",
                format!("{child} holds {existing} rows, asking before truncate"),
            );
            match control.request_truncate(child, existing).await? {
                TruncateDecision::Approve => truncate_partition(target, child).await,
                TruncateDecision::Deny => Err(MigrationError::ConfirmationDenied.into()),
            }
        }
    }
}
