//! # Folio CLI (`folio`)
//!
//! The `folio` binary is the primary interface for Folio. It provides
//! commands for database initialization, knowledge base management, document
//! ingestion, worker operation, job monitoring, and retrieval.
//!
//! ## Usage
//!
//! ```bash
//! folio --config ./config/folio.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `folio init` | Create the SQLite database and run schema migrations |
//! | `folio kb create <user> <name>` | Create a knowledge base |
//! | `folio kb list <user>` | List a user's knowledge bases |
//! | `folio ingest <kb> <files...>` | Upload documents and enqueue them for indexing |
//! | `folio worker` | Run a queue worker (add `--drain` to exit when empty) |
//! | `folio status <job>` | Show or follow an ingestion job's progress |
//! | `folio search <kb> "<query>"` | Late-interaction page search in one knowledge base |
//! | `folio ask "<query>" --kb <id>` | Assemble answer context across knowledge bases |
//! | `folio files delete <kb> <ids...>` | Delete files along with their pages and vectors |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database and write a starter config
//! folio init --write-config --config ./config/folio.toml
//!
//! # Create a knowledge base and ingest two papers into it
//! folio kb create alice research
//! folio ingest <kb-id> attention.pdf bert.pdf
//!
//! # Process the queue until it is empty
//! folio worker --drain
//!
//! # Follow the ingestion job
//! folio status <job-id> --follow
//!
//! # Ask a question across two knowledge bases
//! folio ask "what is flash attention?" --kb <id-1> --kb <id-2> --json
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use folio::assemble::assemble_context;
use folio::collections::collection_name_for;
use folio::config::{load_config, starter_config};
use folio::embedding::embed_query;
use folio::models::JobStatus;
use folio::runtime::Services;
use folio::status::{watch_job, StatusMode};
use folio::worker::{run_worker, submit_job, Upload, WorkerOptions};
use folio::{kb, migrate};

/// Folio CLI — a local-first visual document retrieval engine.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. Run `folio init --write-config` to generate a starter file.
#[derive(Parser)]
#[command(
    name = "folio",
    about = "Folio — a local-first visual document retrieval engine",
    version,
    long_about = "Folio ingests documents (PDFs and images) into per-user knowledge bases, \
    rasterizes every page, embeds pages and queries as multi-vector token grids, and answers \
    natural-language questions with two-stage late-interaction search."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/folio.toml`. Database, blob store, queue,
    /// index, search, and embedding settings are read from this file.
    #[arg(long, global = true, default_value = "./config/folio.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v: debug, -vv: trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log warnings and errors.
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables (knowledge
    /// bases, files, pages, queue, leases, job progress, collections,
    /// vectors). This command is idempotent — running it multiple times is
    /// safe.
    Init {
        /// Write a commented starter config to the `--config` path first
        /// (skipped when the file already exists).
        #[arg(long)]
        write_config: bool,
    },

    /// Manage knowledge bases.
    Kb {
        #[command(subcommand)]
        action: KbAction,
    },

    /// Upload documents and enqueue them for indexing.
    ///
    /// Stores each file in the blob store, appends one queue message per
    /// file, and creates a progress record. Prints the job id; workers do
    /// the actual rasterization and embedding.
    Ingest {
        /// Knowledge base id.
        kb: String,

        /// Paths of the documents to ingest (PDF, PNG, JPEG, WEBP, GIF, BMP).
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Priority label carried on each queue message.
        #[arg(long, default_value = "5")]
        priority: String,

        /// Submit on behalf of this user (defaults to the knowledge base owner).
        #[arg(long)]
        user: Option<String>,
    },

    /// Run a queue worker.
    ///
    /// Polls the queue, takes a lease per message, rasterizes and embeds
    /// each page, and updates job progress. Runs until interrupted unless
    /// `--drain` is given.
    Worker {
        /// Exit once the queue is empty instead of polling forever.
        #[arg(long)]
        drain: bool,
    },

    /// Show or follow an ingestion job's progress.
    Status {
        /// Job id returned by `folio ingest`.
        job: String,

        /// Poll until the job completes or fails, printing updates to stderr.
        #[arg(long)]
        follow: bool,

        /// Print the final state as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Late-interaction page search in a single knowledge base.
    ///
    /// Embeds the query, runs the two-stage search (coarse ANN candidates,
    /// exact max-sim rerank), and prints the ranked pages with scores.
    Search {
        /// Knowledge base id.
        kb: String,

        /// The search query string.
        query: String,

        /// Maximum number of pages to return.
        #[arg(long, default_value_t = 10)]
        top_k: usize,
    },

    /// Assemble answer context across knowledge bases.
    ///
    /// Searches every `--kb`, merges and filters the hits, and prints the
    /// top sources with presigned page image and document URLs.
    Ask {
        /// The question to answer.
        query: String,

        /// Knowledge base id to search (repeat for multiple).
        #[arg(long = "kb", required = true)]
        kbs: Vec<String>,

        /// Maximum number of sources to return.
        #[arg(long, default_value_t = 5)]
        top_k: usize,

        /// Print the sources as a JSON array.
        #[arg(long)]
        json: bool,
    },

    /// Manage files inside a knowledge base.
    Files {
        #[command(subcommand)]
        action: FilesAction,
    },
}

/// Knowledge base subcommands.
#[derive(Subcommand)]
enum KbAction {
    /// Create a knowledge base (and its empty vector collection).
    Create {
        /// Owning username.
        user: String,
        /// Display name.
        name: String,
    },
    /// List a user's knowledge bases.
    List {
        /// Owning username.
        user: String,
    },
    /// Rename a knowledge base.
    Rename {
        /// Knowledge base id.
        id: String,
        /// New display name.
        name: String,
    },
    /// Delete a knowledge base, its files, pages, vectors, and blobs.
    Delete {
        /// Knowledge base id.
        id: String,
    },
}

/// File management subcommands.
#[derive(Subcommand)]
enum FilesAction {
    /// Delete files from a knowledge base.
    ///
    /// Removes the files' vectors, page records, and blobs. Ids that do not
    /// belong to the knowledge base are ignored.
    Delete {
        /// Knowledge base id.
        kb: String,
        /// File ids to delete.
        #[arg(required = true)]
        ids: Vec<String>,
    },
}

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("FOLIO_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    if let Commands::Init { write_config } = &cli.command {
        if *write_config {
            if cli.config.exists() {
                println!("Config already exists at {}", cli.config.display());
            } else {
                if let Some(parent) = cli.config.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&cli.config, starter_config())?;
                println!("Wrote starter config to {}", cli.config.display());
            }
        }
        let cfg = load_config(&cli.config)?;
        migrate::run_migrations(&cfg).await?;
        println!("Database initialized successfully.");
        return Ok(());
    }

    let cfg = load_config(&cli.config)?;
    let services = Services::connect(cfg).await?;

    match cli.command {
        Commands::Init { .. } => unreachable!(),
        Commands::Kb { action } => match action {
            KbAction::Create { user, name } => {
                let created = kb::create(&services, &user, &name).await?;
                println!("{}", created.id);
            }
            KbAction::List { user } => {
                for item in kb::list(&services, &user).await? {
                    println!("{}  {}  (created {})", item.id, item.name, item.created_at);
                }
            }
            KbAction::Rename { id, name } => {
                kb::rename(&services, &id, &name).await?;
                println!("Renamed {} to '{}'", id, name);
            }
            KbAction::Delete { id } => {
                kb::delete(&services, &id).await?;
                println!("Deleted {}", id);
            }
        },
        Commands::Ingest {
            kb: kb_id,
            files,
            priority,
            user,
        } => {
            let username = match user {
                Some(u) => u,
                None => match services.metadata.get_kb(&kb_id).await? {
                    Some(record) => record.username,
                    None => anyhow::bail!("knowledge base not found: {}", kb_id),
                },
            };
            let mut uploads = Vec::with_capacity(files.len());
            for path in &files {
                let filename = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string());
                let bytes = std::fs::read(path)?;
                uploads.push(Upload { filename, bytes });
            }
            let job_id = submit_job(&services, &username, &kb_id, uploads, &priority).await?;
            println!("{}", job_id);
        }
        Commands::Worker { drain } => {
            run_worker(&services, WorkerOptions { drain }).await?;
        }
        Commands::Status { job, follow, json } => {
            let mode = if json {
                StatusMode::Json
            } else if follow {
                StatusMode::default_for_tty()
            } else {
                StatusMode::Off
            };
            let reporter = mode.reporter();
            match watch_job(&services, &job, follow, reporter.as_ref()).await? {
                None => anyhow::bail!("job not found (it may have expired): {}", job),
                Some(progress) => {
                    if json {
                        let obj = serde_json::json!({
                            "job": job,
                            "status": progress.status.as_str(),
                            "processed": progress.processed,
                            "total": progress.total,
                            "message": progress.message,
                        });
                        println!("{}", serde_json::to_string(&obj)?);
                    } else {
                        let mut line = format!(
                            "{}  {}  {} / {} files",
                            job,
                            progress.status.as_str(),
                            progress.processed,
                            progress.total
                        );
                        if progress.status == JobStatus::Failed && !progress.message.is_empty() {
                            line.push_str("  (");
                            line.push_str(&progress.message);
                            line.push(')');
                        }
                        println!("{}", line);
                    }
                }
            }
        }
        Commands::Search { kb: kb_id, query, top_k } => {
            let query_vectors = embed_query(services.embedder.as_ref(), &query).await?;
            let collection = collection_name_for(&kb_id);
            let results = services.search.search(&collection, &query_vectors, top_k).await?;
            if results.is_empty() {
                println!("No results.");
            }
            for (rank, hit) in results.iter().enumerate() {
                println!(
                    "{:>3}. {:>8.2}  {}  (file {}, page {})",
                    rank + 1,
                    hit.score,
                    hit.page_id,
                    hit.file_id.as_deref().unwrap_or("?"),
                    hit.page_number.map_or_else(|| "?".to_string(), |n| n.to_string()),
                );
            }
        }
        Commands::Ask {
            query,
            kbs,
            top_k,
            json,
        } => {
            let sources = assemble_context(&services, &query, None, &kbs, top_k).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&sources)?);
            } else {
                if sources.is_empty() {
                    println!("No sources above the score floor.");
                }
                for (rank, source) in sources.iter().enumerate() {
                    println!(
                        "{:>3}. {:>8.2}  {}  [kb {}]",
                        rank + 1,
                        source.score,
                        source.filename,
                        source.knowledge_base_id,
                    );
                    println!("     page image: {}", source.image_url);
                }
            }
        }
        Commands::Files { action } => match action {
            FilesAction::Delete { kb: kb_id, ids } => {
                let deleted = kb::delete_files(&services, &kb_id, &ids).await?;
                println!("Deleted {} file(s)", deleted);
            }
        },
    }

    services.shutdown().await;
    Ok(())
}
