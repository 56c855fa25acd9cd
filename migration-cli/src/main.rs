//! partmig CLI
//!
//! Thin observer over the migration engine: renders progress and log events,
//! answers truncate prompts and forwards Ctrl-C as a stop command.

// crate-specific lint exceptions:
//#![]

mod observer;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use observer::observe;
use partmig_engine::bus;
use partmig_engine::run::{execute_run, resume_run, EngineKind, RunRequest};
use partmig_engine::table_types::TableTypeCode;
use partmig_metastore::app_paths::AppPaths;
use partmig_metastore::logs::entries_for_session;
use partmig_metastore::metadata_db::{connect_to_metadata_db, MetadataDb};
use partmig_metastore::profiles::{
    delete_profile, get_profile_by_name, insert_profile, list_profiles, update_profile,
    CompatMode, ConnectionConfig, ConnectionProfile, NewProfile,
};
use partmig_metastore::runs::{incomplete_for, list_recent_runs, RunStatus};
use partmig_metastore::vault::Vault;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[clap(name = "partmig")]
#[clap(about = "Partition migration tool for legacy PostgreSQL deployments", version, author)]
#[clap(arg_required_else_help(true))]
struct Cli {
    /// Override the storage root (defaults to the platform data directory)
    #[clap(long, env = "MIGRATION_APP_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage connection profiles
    Profile {
        #[clap(subcommand)]
        action: ProfileAction,
    },
    /// Execute a migration run
    Run {
        #[clap(long)]
        profile: String,
        /// First day of the range (YYYY-MM-DD)
        #[clap(long)]
        from: NaiveDate,
        /// Last day of the range, inclusive
        #[clap(long)]
        to: NaiveDate,
        /// Comma-separated table types: PH,TH,ED,RT
        #[clap(long, default_value = "PH")]
        types: String,
        /// copy | row-batch
        #[clap(long, default_value = "copy")]
        engine: String,
        /// Keep going after a partition fails
        #[clap(long)]
        continue_on_error: bool,
        /// Answer truncate prompts with yes
        #[clap(long)]
        assume_yes: bool,
    },
    /// Resume the latest incomplete run for a profile
    Resume {
        #[clap(long)]
        profile: String,
        #[clap(long)]
        continue_on_error: bool,
        #[clap(long)]
        assume_yes: bool,
    },
    /// Show recent runs
    History {
        #[clap(long, default_value_t = 20)]
        limit: i64,
    },
    /// Show stored log entries for a run session
    Logs {
        session: String,
        #[clap(long, default_value_t = 200)]
        limit: i64,
    },
}

#[derive(Subcommand, Debug)]
enum ProfileAction {
    /// Register a source/target pair
    Add {
        name: String,
        /// Overwrite an existing profile of the same name
        #[clap(long)]
        replace: bool,
        #[clap(long, default_value = "")]
        description: String,
        #[clap(long)]
        source_host: String,
        #[clap(long, default_value_t = 5432)]
        source_port: u16,
        #[clap(long)]
        source_db: String,
        #[clap(long)]
        source_user: String,
        /// Falls back to PARTMIG_SOURCE_PASSWORD
        #[clap(long, env = "PARTMIG_SOURCE_PASSWORD", hide_env_values = true)]
        source_password: String,
        #[clap(long, default_value = "prefer")]
        source_sslmode: String,
        #[clap(long)]
        target_host: String,
        #[clap(long, default_value_t = 5432)]
        target_port: u16,
        #[clap(long)]
        target_db: String,
        #[clap(long)]
        target_user: String,
        /// Falls back to PARTMIG_TARGET_PASSWORD
        #[clap(long, env = "PARTMIG_TARGET_PASSWORD", hide_env_values = true)]
        target_password: String,
        #[clap(long, default_value = "prefer")]
        target_sslmode: String,
        /// auto | v9_3 | v16
        #[clap(long, default_value = "auto")]
        compat_mode: String,
    },
    /// List profiles
    List,
    /// Delete a profile and, with it, its run history
    Remove { name: String },
}

fn parse_types(input: &str) -> Result<Vec<TableTypeCode>> {
    let mut types = Vec::new();
    for part in input.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let code = TableTypeCode::parse(part)?;
        if !types.contains(&code) {
            types.push(code);
        }
    }
    if types.is_empty() {
        bail!("no table types selected");
    }
    Ok(types)
}

fn exit_code(status: RunStatus) -> ExitCode {
    match status {
        RunStatus::Completed => ExitCode::SUCCESS,
        RunStatus::Canceled => ExitCode::from(3),
        _ => ExitCode::from(2),
    }
}

async fn load_profile(db: &MetadataDb, vault: &Vault, name: &str) -> Result<ConnectionProfile> {
    get_profile_by_name(db, vault, name)
        .await?
        .with_context(|| format!("no profile named '{name}'"))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Cli::parse();
    let paths = match args.data_dir {
        Some(dir) => AppPaths::at(dir)?,
        None => AppPaths::resolve()?,
    };
    let db = connect_to_metadata_db(&paths.db_path()).await?;
    let vault = Vault::load_or_create(&paths.vault_key_path())?;

    match args.command {
        Commands::Profile { action } => {
            handle_profile(&db, &vault, action).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run {
            profile,
            from,
            to,
            types,
            engine,
            continue_on_error,
            assume_yes,
        } => {
            let profile = load_profile(&db, &vault, &profile).await?;
            if let Some(run) = incomplete_for(&db, profile.id).await? {
                eprintln!(
                    "note: run {} is incomplete ({}); `partmig resume` would pick it up",
                    run.id,
                    run.status.as_str()
                );
            }
            let request = RunRequest {
                profile,
                start: from,
                end: to,
                types: parse_types(&types)?,
                engine: EngineKind::parse(&engine)?,
                continue_on_error,
            };
            let (engine_bus, handle) = bus::channel();
            let task_db = db.clone();
            let task_paths = paths.clone();
            let task = tokio::spawn(async move {
                execute_run(&task_db, &task_paths, engine_bus, request).await
            });
            let outcome = observe(handle, assume_yes, task).await?;
            Ok(exit_code(outcome.status))
        }
        Commands::Resume {
            profile,
            continue_on_error,
            assume_yes,
        } => {
            let profile = load_profile(&db, &vault, &profile).await?;
            let (engine_bus, handle) = bus::channel();
            let task_db = db.clone();
            let task_paths = paths.clone();
            let task = tokio::spawn(async move {
                resume_run(&task_db, &task_paths, engine_bus, profile, continue_on_error).await
            });
            let outcome = observe(handle, assume_yes, task).await?;
            Ok(exit_code(outcome.status))
        }
        Commands::History { limit } => {
            for run in list_recent_runs(&db, limit).await? {
                println!(
                    "{:>5}  {:<10}  {:<15}  {}/{} partitions  {} rows  session {}{}",
                    run.id,
                    run.status.as_str(),
                    run.engine,
                    run.completed_partitions,
                    run.total_partitions,
                    run.total_rows,
                    run.session_id,
                    run.error
                        .as_deref()
                        .map(|e| format!("  error: {e}"))
                        .unwrap_or_default()
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Logs { session, limit } => {
            for entry in entries_for_session(&db, &session, limit).await? {
                println!(
                    "[{}] [{}] [{}] {}",
                    entry.ts, entry.level, entry.component, entry.message
                );
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn handle_profile(db: &MetadataDb, vault: &Vault, action: ProfileAction) -> Result<()> {
    match action {
        ProfileAction::Add {
            name,
            replace,
            description,
            source_host,
            source_port,
            source_db,
            source_user,
            source_password,
            source_sslmode,
            target_host,
            target_port,
            target_db,
            target_user,
            target_password,
            target_sslmode,
            compat_mode,
        } => {
            let profile = NewProfile {
                name: name.clone(),
                description,
                source: ConnectionConfig {
                    host: source_host,
                    port: source_port,
                    dbname: source_db,
                    user: source_user,
                    password: source_password,
                    sslmode: source_sslmode,
                },
                target: ConnectionConfig {
                    host: target_host,
                    port: target_port,
                    dbname: target_db,
                    user: target_user,
                    password: target_password,
                    sslmode: target_sslmode,
                },
                compat_mode: CompatMode::parse(&compat_mode)?,
            };
            match get_profile_by_name(db, vault, &name).await? {
                Some(existing) if replace => {
                    update_profile(db, vault, existing.id, &profile).await?;
                    println!("profile '{name}' updated (id {})", existing.id);
                }
                Some(_) => bail!("profile '{name}' already exists; pass --replace to overwrite"),
                None => {
                    let id = insert_profile(db, vault, &profile).await?;
                    println!("profile '{name}' saved (id {id})");
                }
            }
        }
        ProfileAction::List => {
            for summary in list_profiles(db).await? {
                println!(
                    "{:>5}  {:<20}  {:<6}  {}",
                    summary.id,
                    summary.name,
                    summary.compat_mode.as_str(),
                    summary.description
                );
            }
        }
        ProfileAction::Remove { name } => {
            if delete_profile(db, &name).await? {
                println!("profile '{name}' removed");
            } else {
                println!("no profile named '{name}'");
            }
        }
    }
    Ok(())
}
