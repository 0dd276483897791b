//! ouman - LDIF import/export against a multi-OU LDAP directory

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;

use config::Settings;
use ouman_core::{DirectoryStore, Subject};
use ouman_identity::{CredentialHasher, IdentityEngine, LdapDirectoryStore, TracingAuditSink};
use ouman_ldif::{export_entries, LdifImporter};

type Engine = IdentityEngine<LdapDirectoryStore, TracingAuditSink>;

#[derive(Parser)]
#[command(name = "ouman")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply an LDIF file block by block
    Import {
        file: PathBuf,
        /// Act as this directory UID instead of the bind identity
        #[arg(long = "as", value_name = "UID")]
        actor: Option<String>,
    },

    /// Write every OU and person entry below the base DN as LDIF
    Export {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show the logical identity behind a UID
    Whoami { uid: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let settings = Settings::load().context("Failed to load configuration")?;
    let engine = build_engine(&settings)?;

    match cli.command {
        Commands::Import { file, actor } => import(&engine, &settings, file, actor).await,
        Commands::Export { output } => export(&engine, output).await,
        Commands::Whoami { uid } => whoami(&engine, &uid).await,
    }
}

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,ouman=debug"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .init();
}

fn build_engine(settings: &Settings) -> Result<Arc<Engine>> {
    let hasher =
        CredentialHasher::new(settings.credentials).context("Invalid credential settings")?;
    let store = Arc::new(LdapDirectoryStore::new(settings.directory.clone()));

    info!(
        url = %settings.directory.url,
        base = %settings.directory.base_dn,
        "Using LDAP directory"
    );
    Ok(Arc::new(IdentityEngine::new(
        store,
        Arc::new(TracingAuditSink),
        settings.engine_settings(),
        hasher,
    )))
}

/// The acting subject: the bind identity as root, or the strongest role
/// held by `uid` across its entries
async fn resolve_actor(engine: &Engine, settings: &Settings, uid: Option<String>) -> Result<Subject> {
    let Some(uid) = uid else {
        return Ok(Subject::root(settings.directory.bind_dn.clone()));
    };

    let entries = engine
        .store()
        .find_by_uid(&uid)
        .await
        .with_context(|| format!("Failed to look up actor {}", uid))?;
    entries
        .iter()
        .map(Subject::from_entry)
        .max_by_key(|subject| subject.role)
        .with_context(|| format!("Actor {} has no directory entry", uid))
}

async fn import(
    engine: &Arc<Engine>,
    settings: &Settings,
    file: PathBuf,
    actor: Option<String>,
) -> Result<()> {
    let text = tokio::fs::read_to_string(&file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let actor = resolve_actor(engine, settings, actor).await?;

    let report = LdifImporter::new(engine.clone()).apply(&actor, &text).await;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.is_clean() {
        bail!(
            "{} of {} blocks failed",
            report.failed(),
            report.results.len()
        );
    }
    Ok(())
}

async fn export(engine: &Engine, output: Option<PathBuf>) -> Result<()> {
    let entries = engine
        .store()
        .list_all()
        .await
        .context("Failed to read directory entries")?;
    let ldif = export_entries(&entries);

    match output {
        Some(path) => {
            tokio::fs::write(&path, ldif)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!(entries = entries.len(), path = %path.display(), "Export written");
        }
        None => print!("{}", ldif),
    }
    Ok(())
}

async fn whoami(engine: &Engine, uid: &str) -> Result<()> {
    let identity = engine
        .identity(uid)
        .await
        .with_context(|| format!("Failed to resolve {}", uid))?;
    let subject = engine
        .store()
        .find_by_uid(uid)
        .await?
        .iter()
        .map(Subject::from_entry)
        .max_by_key(|subject| subject.role);

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "identity": identity,
            "effective": subject,
        }))?
    );
    Ok(())
}
