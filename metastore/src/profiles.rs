use crate::metadata_db::MetadataDb;
use crate::vault::Vault;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;

/// Compatibility mode of the target deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompatMode {
    Auto,
    V9_3,
    V16,
}

impl CompatMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::V9_3 => "v9_3",
            Self::V16 => "v16",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "auto" => Ok(Self::Auto),
            "v9_3" => Ok(Self::V9_3),
            "v16" => Ok(Self::V16),
            other => bail!("unknown compatibility mode '{other}'"),
        }
    }
}

/// One side of a profile: how to reach a database.
///
/// The password is sealed by the vault before it touches disk and is
/// excluded from the serialized form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    #[serde(skip)]
    pub password: String,
    pub sslmode: String,
}

/// A stored source/target pair. Profiles outlive runs.
#[derive(Debug, Clone)]
pub struct ConnectionProfile {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub source: ConnectionConfig,
    pub target: ConnectionConfig,
    pub compat_mode: CompatMode,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Listing row without secrets.
#[derive(Debug, Clone)]
pub struct ProfileSummary {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub compat_mode: CompatMode,
    pub updated_at: DateTime<Utc>,
}

/// Input for [`insert_profile`].
#[derive(Debug, Clone)]
pub struct NewProfile {
    pub name: String,
    pub description: String,
    pub source: ConnectionConfig,
    pub target: ConnectionConfig,
    pub compat_mode: CompatMode,
}

pub async fn insert_profile(db: &MetadataDb, vault: &Vault, profile: &NewProfile) -> Result<i64> {
    let now = Utc::now();
    let source_config =
        serde_json::to_string(&profile.source).with_context(|| "serializing source config")?;
    let target_config =
        serde_json::to_string(&profile.target).with_context(|| "serializing target config")?;
    let source_secret = vault.seal(&profile.source.password)?;
    let target_secret = vault.seal(&profile.target.password)?;
    let result = sqlx::query(
        "INSERT INTO profiles(name, description, source_config, source_secret,
                              target_config, target_secret, compat_mode, created_at, updated_at)
         VALUES($1,$2,$3,$4,$5,$6,$7,$8,$9);",
    )
    .bind(&profile.name)
    .bind(&profile.description)
    .bind(&source_config)
    .bind(&source_secret)
    .bind(&target_config)
    .bind(&target_secret)
    .bind(profile.compat_mode.as_str())
    .bind(now)
    .bind(now)
    .execute(&db.write_pool)
    .await
    .with_context(|| format!("inserting profile '{}'", profile.name))?;
    Ok(result.last_insert_rowid())
}

fn profile_from_row(row: &sqlx::sqlite::SqliteRow, vault: &Vault) -> Result<ConnectionProfile> {
    let source_config: String = row.try_get("source_config")?;
    let target_config: String = row.try_get("target_config")?;
    let mut source: ConnectionConfig =
        serde_json::from_str(&source_config).with_context(|| "parsing source config")?;
    let mut target: ConnectionConfig =
        serde_json::from_str(&target_config).with_context(|| "parsing target config")?;
    let source_secret: Vec<u8> = row.try_get("source_secret")?;
    let target_secret: Vec<u8> = row.try_get("target_secret")?;
    source.password = vault.open(&source_secret)?;
    target.password = vault.open(&target_secret)?;
    let compat: String = row.try_get("compat_mode")?;
    Ok(ConnectionProfile {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        source,
        target,
        compat_mode: CompatMode::parse(&compat)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Loads a profile with decrypted passwords; the caller keeps them in memory
/// only for the duration of a run.
pub async fn get_profile_by_name(
    db: &MetadataDb,
    vault: &Vault,
    name: &str,
) -> Result<Option<ConnectionProfile>> {
    let row = sqlx::query(
        "SELECT id, name, description, source_config, source_secret,
                target_config, target_secret, compat_mode, created_at, updated_at
         FROM profiles
         WHERE name = $1;",
    )
    .bind(name)
    .fetch_optional(&db.read_pool)
    .await
    .with_context(|| format!("loading profile '{name}'"))?;
    match row {
        Some(row) => Ok(Some(profile_from_row(&row, vault)?)),
        None => Ok(None),
    }
}

pub async fn list_profiles(db: &MetadataDb) -> Result<Vec<ProfileSummary>> {
    let rows = sqlx::query(
        "SELECT id, name, description, compat_mode, updated_at
         FROM profiles
         ORDER BY name;",
    )
    .fetch_all(&db.read_pool)
    .await
    .with_context(|| "listing profiles")?;
    let mut summaries = Vec::with_capacity(rows.len());
    for row in rows {
        let compat: String = row.try_get("compat_mode")?;
        summaries.push(ProfileSummary {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            compat_mode: CompatMode::parse(&compat)?,
            updated_at: row.try_get("updated_at")?,
        });
    }
    Ok(summaries)
}

pub async fn update_profile(
    db: &MetadataDb,
    vault: &Vault,
    id: i64,
    profile: &NewProfile,
) -> Result<()> {
    let source_config =
        serde_json::to_string(&profile.source).with_context(|| "serializing source config")?;
    let target_config =
        serde_json::to_string(&profile.target).with_context(|| "serializing target config")?;
    let source_secret = vault.seal(&profile.source.password)?;
    let target_secret = vault.seal(&profile.target.password)?;
    sqlx::query(
        "UPDATE profiles
         SET name = $1, description = $2, source_config = $3, source_secret = $4,
             target_config = $5, target_secret = $6, compat_mode = $7, updated_at = $8
         WHERE id = $9;",
    )
    .bind(&profile.name)
    .bind(&profile.description)
    .bind(&source_config)
    .bind(&source_secret)
    .bind(&target_config)
    .bind(&target_secret)
    .bind(profile.compat_mode.as_str())
    .bind(Utc::now())
    .bind(id)
    .execute(&db.write_pool)
    .await
    .with_context(|| format!("updating profile '{}'", profile.name))?;
    Ok(())
}

/// Deletes a profile and, through cascade, its runs, checkpoints and logs.
pub async fn delete_profile(db: &MetadataDb, name: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM profiles WHERE name = $1;")
        .bind(name)
        .execute(&db.write_pool)
        .await
        .with_context(|| format!("deleting profile '{name}'"))?;
    Ok(result.rows_affected() > 0)
}
