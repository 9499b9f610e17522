use std::collections::HashSet;
use std::process;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;
use trellis::{
    ChangesOptions, Database, PurgeTarget, ReplicationSettings, ReplicationState, RevId,
    TrellisError,
};

#[derive(Parser)]
#[command(name = "trellis", about = "Inspect and replicate trellis databases")]
struct Cli {
    /// Pretty-print JSON output
    #[arg(short, long, global = true)]
    pretty: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show database info (doc count, last sequence)
    Info {
        /// Path to the .redb file
        path: String,
        /// Database name (defaults to filename without extension)
        #[arg(long)]
        db_name: Option<String>,
    },

    /// Get a document's winning revision, or a specific one
    Get {
        /// Path to the .redb file
        path: String,
        /// Document ID
        doc_id: String,
        /// Fetch a specific revision
        #[arg(long)]
        rev: Option<String>,
        /// Database name (defaults to filename without extension)
        #[arg(long)]
        db_name: Option<String>,
    },

    /// List a document's leaf revisions
    Leaves {
        /// Path to the .redb file
        path: String,
        /// Document ID
        doc_id: String,
        /// Include deleted leaves
        #[arg(long)]
        all: bool,
        /// Database name (defaults to filename without extension)
        #[arg(long)]
        db_name: Option<String>,
    },

    /// Show the ancestry of a revision, newest first
    History {
        /// Path to the .redb file
        path: String,
        /// Document ID
        doc_id: String,
        /// Revision to start from (defaults to the winner)
        #[arg(long)]
        rev: Option<String>,
        /// Database name (defaults to filename without extension)
        #[arg(long)]
        db_name: Option<String>,
    },

    /// Show the changes feed
    Changes {
        /// Path to the .redb file
        path: String,
        /// Start after this sequence number
        #[arg(long, default_value = "0")]
        since: u64,
        /// Maximum number of changes
        #[arg(long)]
        limit: Option<usize>,
        /// Include full document bodies
        #[arg(long)]
        include_docs: bool,
        /// Report every leaf, not only winners
        #[arg(long)]
        all_leaves: bool,
        /// Database name (defaults to filename without extension)
        #[arg(long)]
        db_name: Option<String>,
    },

    /// Create or update a document
    Put {
        /// Path to the .redb file
        path: String,
        /// Document ID
        doc_id: String,
        /// Document body as JSON string
        body: String,
        /// Current revision (required for updates)
        #[arg(long)]
        rev: Option<String>,
        /// Database name (defaults to filename without extension)
        #[arg(long)]
        db_name: Option<String>,
    },

    /// Delete a document
    Delete {
        /// Path to the .redb file
        path: String,
        /// Document ID
        doc_id: String,
        /// Current revision (required)
        #[arg(long)]
        rev: String,
        /// Database name (defaults to filename without extension)
        #[arg(long)]
        db_name: Option<String>,
    },

    /// Remove revisions (or a whole document) without leaving tombstones
    Purge {
        /// Path to the .redb file
        path: String,
        /// Document ID
        doc_id: String,
        /// Revisions to purge; the whole document when omitted
        #[arg(long = "rev")]
        revs: Vec<String>,
        /// Database name (defaults to filename without extension)
        #[arg(long)]
        db_name: Option<String>,
    },

    /// Drop bodies of non-leaf revisions
    Compact {
        /// Path to the .redb file
        path: String,
        /// Database name (defaults to filename without extension)
        #[arg(long)]
        db_name: Option<String>,
    },

    /// Replicate with a CouchDB URL or another .redb file
    Replicate {
        /// Path to the .redb file
        path: String,
        /// Replication settings as a JSON file
        #[arg(long)]
        config: String,
        /// Forget the checkpoint and start from scratch
        #[arg(long)]
        reset: bool,
        /// Database name (defaults to filename without extension)
        #[arg(long)]
        db_name: Option<String>,
    },
}

fn infer_db_name(path: &str) -> String {
    std::path::Path::new(path)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("trellis")
        .to_string()
}

fn open_db(path: &str, name: Option<&str>) -> Database {
    let db_name = name
        .map(String::from)
        .unwrap_or_else(|| infer_db_name(path));
    match Database::open(path, &db_name) {
        Ok(db) => db,
        Err(e) => {
            eprintln!("Error opening database: {}", e);
            process::exit(1);
        }
    }
}

fn parse_rev(rev: &str) -> trellis::Result<RevId> {
    rev.parse()
}

fn parse_json(text: &str, what: &str) -> trellis::Result<serde_json::Value> {
    serde_json::from_str(text)
        .map_err(|e| TrellisError::BadRequest(format!("invalid JSON {}: {}", what, e)))
}

fn print_json(value: &serde_json::Value, pretty: bool) {
    let output = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    };
    println!("{}", output.unwrap_or_default());
}

fn state_name(state: ReplicationState) -> String {
    format!("{:?}", state).to_lowercase()
}

/// Logs go to stderr so stdout stays machine-readable. `TRELLIS_LOG` wins
/// over `RUST_LOG`.
fn init_tracing() {
    let filter = std::env::var("TRELLIS_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "warn".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    let result = run(cli).await;
    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> trellis::Result<()> {
    match cli.command {
        Commands::Info { path, db_name } => {
            let db = open_db(&path, db_name.as_deref());
            let info = db.info().await?;
            print_json(
                &json!({
                    "db_name": info.db_name,
                    "doc_count": info.doc_count,
                    "update_seq": info.update_seq,
                    "uuid": db.public_uuid(),
                }),
                cli.pretty,
            );
        }

        Commands::Get {
            path,
            doc_id,
            rev,
            db_name,
        } => {
            let db = open_db(&path, db_name.as_deref());
            let rev = rev.as_deref().map(parse_rev).transpose()?;
            let revision = db.get(&doc_id, rev.as_ref(), true).await?;
            print_json(&revision.properties(), cli.pretty);
        }

        Commands::Leaves {
            path,
            doc_id,
            all,
            db_name,
        } => {
            let db = open_db(&path, db_name.as_deref());
            let leaves = db.get_all_leaves(&doc_id, !all).await?;
            if leaves.is_empty() {
                return Err(TrellisError::NotFound(doc_id));
            }
            let winner = db.get(&doc_id, None, false).await?;
            let rows: Vec<serde_json::Value> = leaves
                .iter()
                .map(|leaf| {
                    json!({
                        "rev": leaf.rev_id,
                        "deleted": leaf.deleted,
                        "sequence": leaf.sequence,
                    })
                })
                .collect();
            print_json(
                &json!({
                    "id": doc_id,
                    "winner": winner.rev_id,
                    "conflicted": rows.len() > 1,
                    "leaves": rows,
                }),
                cli.pretty,
            );
        }

        Commands::History {
            path,
            doc_id,
            rev,
            db_name,
        } => {
            let db = open_db(&path, db_name.as_deref());
            let rev = match rev {
                Some(rev) => parse_rev(&rev)?,
                None => db.get(&doc_id, None, false).await?.rev_id,
            };
            let history = db.get_history(&doc_id, &rev, &HashSet::new()).await?;
            let rows: Vec<serde_json::Value> = history
                .iter()
                .map(|r| {
                    json!({
                        "rev": r.rev_id,
                        "deleted": r.deleted,
                        "missing": r.missing,
                    })
                })
                .collect();
            print_json(&json!({"id": doc_id, "history": rows}), cli.pretty);
        }

        Commands::Changes {
            path,
            since,
            limit,
            include_docs,
            all_leaves,
            db_name,
        } => {
            let db = open_db(&path, db_name.as_deref());
            let page = db
                .changes_since(
                    since,
                    &ChangesOptions {
                        limit,
                        include_docs,
                        all_leaves,
                        ..Default::default()
                    },
                )
                .await?;
            let results: Vec<serde_json::Value> = page
                .changes
                .iter()
                .map(|change| {
                    let rev = &change.revision;
                    let mut row = json!({
                        "seq": rev.sequence,
                        "id": rev.doc_id,
                        "changes": [{"rev": rev.rev_id}],
                        "winner": change.winning_rev_id,
                    });
                    if rev.deleted {
                        row["deleted"] = json!(true);
                    }
                    if change.in_conflict {
                        row["conflicted"] = json!(true);
                    }
                    if include_docs {
                        row["doc"] = rev.properties();
                    }
                    row
                })
                .collect();
            print_json(
                &json!({
                    "results": results,
                    "last_seq": page.last_sequence,
                }),
                cli.pretty,
            );
        }

        Commands::Put {
            path,
            doc_id,
            body,
            rev,
            db_name,
        } => {
            let db = open_db(&path, db_name.as_deref());
            let data = parse_json(&body, "body")?;
            let rev = rev.as_deref().map(parse_rev).transpose()?;
            let revision = db.put(&doc_id, data, rev.as_ref()).await?;
            print_json(
                &json!({"ok": true, "id": revision.doc_id, "rev": revision.rev_id}),
                cli.pretty,
            );
        }

        Commands::Delete {
            path,
            doc_id,
            rev,
            db_name,
        } => {
            let db = open_db(&path, db_name.as_deref());
            let revision = db.delete(&doc_id, &parse_rev(&rev)?).await?;
            print_json(
                &json!({"ok": true, "id": revision.doc_id, "rev": revision.rev_id}),
                cli.pretty,
            );
        }

        Commands::Purge {
            path,
            doc_id,
            revs,
            db_name,
        } => {
            let db = open_db(&path, db_name.as_deref());
            let target = if revs.is_empty() {
                PurgeTarget::All
            } else {
                PurgeTarget::Revs(
                    revs.iter()
                        .map(|r| parse_rev(r))
                        .collect::<trellis::Result<HashSet<RevId>>>()?,
                )
            };
            let purged = db.purge(&doc_id, target).await?;
            print_json(&json!({"purged": purged}), cli.pretty);
        }

        Commands::Compact { path, db_name } => {
            let db = open_db(&path, db_name.as_deref());
            let pruned = db.compact().await?;
            print_json(&json!({"ok": true, "bodies_pruned": pruned}), cli.pretty);
        }

        Commands::Replicate {
            path,
            config,
            reset,
            db_name,
        } => {
            let db = open_db(&path, db_name.as_deref());
            let text = std::fs::read_to_string(&config).map_err(|e| {
                TrellisError::BadRequest(format!("cannot read config '{}': {}", config, e))
            })?;
            let mut settings = ReplicationSettings::from_json(&text)?;
            settings.reset |= reset;
            let continuous = settings.continuous;

            let replicator = trellis::replicator(db, settings).await?;
            let mut updates = replicator.subscribe();
            tokio::spawn(async move {
                while updates.changed().await.is_ok() {
                    let status = updates.borrow_and_update().clone();
                    info!(
                        state = %state_name(status.state),
                        processed = status.changes_processed,
                        total = status.changes_total,
                        "replication progress"
                    );
                }
            });
            replicator.start();

            let status = tokio::select! {
                status = replicator.wait_for_stopped() => status,
                _ = tokio::signal::ctrl_c(), if continuous => {
                    replicator.stop().await;
                    replicator.status()
                }
            };

            let mut output = json!({
                "ok": status.error.is_none(),
                "state": state_name(status.state),
                "changes_processed": status.changes_processed,
                "changes_total": status.changes_total,
            });
            if let Some(error) = &status.error {
                output["error"] = json!(error.to_string());
            }
            print_json(&output, cli.pretty);
            if let Some(error) = status.error {
                return Err(error);
            }
        }
    }

    Ok(())
}
