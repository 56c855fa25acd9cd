use anyhow::{bail, Context, Result};
use chrono::{Local, TimeZone};
use sqlx::postgres::PgRow;
use sqlx::Row;

/// Catalog code of a partitioned family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableTypeCode {
    Ph,
    Th,
    Ed,
    Rt,
}

impl TableTypeCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ph => "PH",
            Self::Th => "TH",
            Self::Ed => "ED",
            Self::Rt => "RT",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_uppercase().as_str() {
            "PH" => Ok(Self::Ph),
            "TH" => Ok(Self::Th),
            "ED" => Ok(Self::Ed),
            "RT" => Ok(Self::Rt),
            other => bail!("unknown table type '{other}'"),
        }
    }

    pub fn all() -> &'static [TableTypeCode] {
        &[Self::Ph, Self::Th, Self::Ed, Self::Rt]
    }
}

impl std::fmt::Display for TableTypeCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type of the partitioning date column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateKind {
    /// `int8` holding epoch milliseconds.
    EpochMillis,
    /// `timestamp without time zone`.
    Timestamp,
}

/// How the parent dispatches inserts into children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// One `BEFORE INSERT` trigger building the child name dynamically.
    Trigger,
    /// One static rule per partition.
    Rules,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Int8,
    Int4,
    Varchar(u16),
    Bool,
    Float8,
    Timestamp,
}

impl ColumnKind {
    pub fn sql_type(self) -> String {
        match self {
            Self::Int8 => "int8".into(),
            Self::Int4 => "int4".into(),
            Self::Varchar(n) => format!("varchar({n})"),
            Self::Bool => "bool".into(),
            Self::Float8 => "float8".into(),
            Self::Timestamp => "timestamp".into(),
        }
    }

    /// Name reported by `information_schema.columns.data_type`, used to
    /// verify the shape of a pre-existing child.
    pub fn information_schema_type(self) -> &'static str {
        match self {
            Self::Int8 => "bigint",
            Self::Int4 => "integer",
            Self::Varchar(_) => "character varying",
            Self::Bool => "boolean",
            Self::Float8 => "double precision",
            Self::Timestamp => "timestamp without time zone",
        }
    }

    pub fn decode(self, row: &PgRow, index: usize) -> Result<CellValue> {
        Ok(match self {
            Self::Int8 => CellValue::Int8(row.try_get(index)?),
            Self::Int4 => CellValue::Int4(row.try_get(index)?),
            Self::Varchar(_) => CellValue::Text(row.try_get(index)?),
            Self::Bool => CellValue::Bool(row.try_get(index)?),
            Self::Float8 => CellValue::Float8(row.try_get(index)?),
            Self::Timestamp => CellValue::Timestamp(row.try_get(index)?),
        })
    }
}

/// One decoded cell, carried between the batched SELECT and the bulk INSERT.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Int8(Option<i64>),
    Int4(Option<i32>),
    Text(Option<String>),
    Bool(Option<bool>),
    Float8(Option<f64>),
    Timestamp(Option<chrono::NaiveDateTime>),
}

impl CellValue {
    /// Rough wire size, used for the MB/s rate.
    pub fn approx_size(&self) -> usize {
        match self {
            Self::Text(Some(s)) => s.len(),
            _ => 8,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub kind: ColumnKind,
}

#[derive(Debug, Clone, Copy)]
pub struct IndexSpec {
    pub name: &'static str,
    pub columns: &'static [&'static str],
}

/// Static description of one partitioned family: everything the schema
/// builder and the engines need to know about its tables.
#[derive(Debug, Clone, Copy)]
pub struct TableTypeSpec {
    pub code: TableTypeCode,
    pub parent: &'static str,
    pub columns: &'static [ColumnSpec],
    pub date_column: &'static str,
    pub date_kind: DateKind,
    pub dispatch: Dispatch,
    pub primary_key: &'static [&'static str],
    /// Batched reads order by this key so that offsets stay stable.
    pub order_key: &'static [&'static str],
    pub parent_indexes: &'static [IndexSpec],
}

impl TableTypeSpec {
    pub fn column_list(&self) -> String {
        self.columns
            .iter()
            .map(|c| c.name)
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn order_key_list(&self) -> String {
        self.order_key.join(", ")
    }

    pub fn primary_key_list(&self) -> String {
        self.primary_key.join(", ")
    }

    /// Renders one bound of the partition range the way the family's date
    /// column expects it: a bare ms literal, or a quoted timestamp.
    pub fn date_bound_literal(&self, millis: i64) -> Result<String> {
        match self.date_kind {
            DateKind::EpochMillis => Ok(millis.to_string()),
            DateKind::Timestamp => {
                let local = Local
                    .timestamp_millis_opt(millis)
                    .single()
                    .with_context(|| format!("converting {millis} to a local timestamp"))?;
                Ok(format!(
                    "'{}'::timestamp without time zone",
                    local.format("%Y-%m-%d %H:%M:%S")
                ))
            }
        }
    }
}

const PH_COLUMNS: &[ColumnSpec] = &[
    ColumnSpec {
        name: "path_id",
        kind: ColumnKind::Int8,
    },
    ColumnSpec {
        name: "issued_date",
        kind: ColumnKind::Int8,
    },
    ColumnSpec {
        name: "changed_value",
        kind: ColumnKind::Varchar(100),
    },
    ColumnSpec {
        name: "connection_status",
        kind: ColumnKind::Bool,
    },
];

const ED_COLUMNS: &[ColumnSpec] = &[
    ColumnSpec {
        name: "sensor_id",
        kind: ColumnKind::Int8,
    },
    ColumnSpec {
        name: "issued_date",
        kind: ColumnKind::Timestamp,
    },
    ColumnSpec {
        name: "station_id",
        kind: ColumnKind::Varchar(20),
    },
    ColumnSpec {
        name: "value",
        kind: ColumnKind::Float8,
    },
    ColumnSpec {
        name: "co2",
        kind: ColumnKind::Float8,
    },
    ColumnSpec {
        name: "cost",
        kind: ColumnKind::Float8,
    },
];

const RT_COLUMNS: &[ColumnSpec] = &[
    ColumnSpec {
        name: "path_id",
        kind: ColumnKind::Int8,
    },
    ColumnSpec {
        name: "issued_date",
        kind: ColumnKind::Int8,
    },
    ColumnSpec {
        name: "value",
        kind: ColumnKind::Float8,
    },
    ColumnSpec {
        name: "status",
        kind: ColumnKind::Int4,
    },
    ColumnSpec {
        name: "quality",
        kind: ColumnKind::Int4,
    },
    ColumnSpec {
        name: "min_value",
        kind: ColumnKind::Float8,
    },
    ColumnSpec {
        name: "max_value",
        kind: ColumnKind::Float8,
    },
    ColumnSpec {
        name: "avg_value",
        kind: ColumnKind::Float8,
    },
    ColumnSpec {
        name: "std_dev",
        kind: ColumnKind::Float8,
    },
    ColumnSpec {
        name: "sample_count",
        kind: ColumnKind::Int8,
    },
];

const PH_ORDER_KEY: &[&str] = &["path_id", "issued_date"];
const ED_ORDER_KEY: &[&str] = &["sensor_id", "issued_date", "station_id"];

pub const PH_SPEC: TableTypeSpec = TableTypeSpec {
    code: TableTypeCode::Ph,
    parent: "point_history",
    columns: PH_COLUMNS,
    date_column: "issued_date",
    date_kind: DateKind::EpochMillis,
    dispatch: Dispatch::Trigger,
    primary_key: PH_ORDER_KEY,
    order_key: PH_ORDER_KEY,
    parent_indexes: &[IndexSpec {
        name: "point_history_path_idx",
        columns: PH_ORDER_KEY,
    }],
};

pub const TH_SPEC: TableTypeSpec = TableTypeSpec {
    code: TableTypeCode::Th,
    parent: "trend_history",
    columns: PH_COLUMNS,
    date_column: "issued_date",
    date_kind: DateKind::EpochMillis,
    dispatch: Dispatch::Rules,
    primary_key: PH_ORDER_KEY,
    order_key: PH_ORDER_KEY,
    parent_indexes: &[IndexSpec {
        name: "trend_history_path_idx",
        columns: PH_ORDER_KEY,
    }],
};

pub const ED_SPEC: TableTypeSpec = TableTypeSpec {
    code: TableTypeCode::Ed,
    parent: "environment_data",
    columns: ED_COLUMNS,
    date_column: "issued_date",
    date_kind: DateKind::Timestamp,
    dispatch: Dispatch::Rules,
    primary_key: ED_ORDER_KEY,
    order_key: ED_ORDER_KEY,
    parent_indexes: &[IndexSpec {
        name: "environment_data_sensor_idx",
        columns: &["sensor_id", "station_id"],
    }],
};

pub const RT_SPEC: TableTypeSpec = TableTypeSpec {
    code: TableTypeCode::Rt,
    parent: "realtime_data",
    columns: RT_COLUMNS,
    date_column: "issued_date",
    date_kind: DateKind::EpochMillis,
    dispatch: Dispatch::Rules,
    primary_key: PH_ORDER_KEY,
    order_key: PH_ORDER_KEY,
    parent_indexes: &[IndexSpec {
        name: "realtime_data_path_idx",
        columns: PH_ORDER_KEY,
    }],
};

pub fn spec_for(code: TableTypeCode) -> &'static TableTypeSpec {
    match code {
        TableTypeCode::Ph => &PH_SPEC,
        TableTypeCode::Th => &TH_SPEC,
        TableTypeCode::Ed => &ED_SPEC,
        TableTypeCode::Rt => &RT_SPEC,
    }
}
