use attendance_reportd::artifact::FsArtifactStore;
use attendance_reportd::cache::{CachePool, SqliteCacheReplica, REPORTS_GROUP};
use attendance_reportd::config::Config;
use attendance_reportd::db;
use attendance_reportd::documents::SqliteDocumentStore;
use attendance_reportd::envelope;
use attendance_reportd::job::{
    Collaborators, JobSettings, ReportError, ReportJob, ReportPayload, RunOutcome,
};
use clap::Parser;
use std::io::{self, BufRead, Write};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Generates one attendance report and records its lifecycle.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Request payload as JSON. Read from the first non-empty stdin line when omitted.
    payload: Option<String>,
}

fn read_payload(arg: Option<String>) -> Result<String, ReportError> {
    if let Some(raw) = arg {
        return Ok(raw);
    }
    for line in io::stdin().lock().lines() {
        let line = line?;
        if !line.trim().is_empty() {
            return Ok(line);
        }
    }
    Err(ReportError::validation("no payload on stdin"))
}

fn run(args: Args) -> Result<RunOutcome, ReportError> {
    let config = Config::load()?;
    let raw = read_payload(args.payload)?;
    let payload = ReportPayload::parse(&raw)?;
    info!(key = %payload.combination_key, "received report request");

    let store = db::open_db(&config.workspace)?;
    let documents = SqliteDocumentStore::open(&config.attendance_db)?;
    let mut cache = CachePool::new();
    for path in &config.cache_replicas {
        cache.add_replica(REPORTS_GROUP, Box::new(SqliteCacheReplica::open(path)?));
    }
    let artifacts = FsArtifactStore::new(&config.artifact_dir);

    let outcome = {
        let job = ReportJob::new(
            Collaborators {
                reports: &store,
                settings: &store,
                roster: &store,
                attendance: &documents,
                artifacts: &artifacts,
                cache: &cache,
            },
            JobSettings::from_config(&config),
        );
        job.run(&payload)
    };

    if let Err(e) = store.close() {
        error!("{e:#}");
    }
    info!("connections closed");
    outcome
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let (resp, code) = match run(args) {
        Ok(outcome) => match serde_json::to_value(&outcome) {
            Ok(v) => (envelope::ok(v), 0),
            Err(e) => (envelope::err("serialize_failed", e.to_string()), 1),
        },
        Err(e) => (e.response(), 1),
    };

    let mut stdout = io::stdout();
    let _ = writeln!(
        stdout,
        "{}",
        serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
    );
    let _ = stdout.flush();
    std::process::exit(code);
}
