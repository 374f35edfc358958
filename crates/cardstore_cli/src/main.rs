//! Command-line access to a card store.
//!
//! # Responsibility
//! - Compile schemas to SQL without touching storage.
//! - Insert and query cards as the privileged actor.
//!
//! Storage and logging come from `CARDSTORE_*` variables unless `--db`
//! overrides the database path.

use cardstore_core::schema::validate;
use cardstore_core::sql::{compile_query, CompileOptions, QueryOptions};
use cardstore_core::{CoreError, DatabaseLocation, Kernel, KernelConfig};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "cardstore", version, about = "Schema-driven card store")]
struct Cli {
    /// SQLite file; in-memory when neither this nor CARDSTORE_DB_PATH is set.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the SQL and parameters a schema compiles to.
    Compile {
        /// JSON schema, or `@path` to read it from a file.
        schema: String,
        /// `{skip, limit, sortBy, sortDir}` as JSON.
        #[arg(long)]
        options: Option<String>,
    },
    /// Validate a document against a schema and list every issue.
    Validate {
        schema: String,
        document: String,
    },
    /// Insert a card as the privileged actor.
    Insert {
        /// Card JSON, or `@path`.
        card: String,
    },
    /// Query cards as the privileged actor; prints one card per line.
    Query {
        schema: String,
        #[arg(long)]
        options: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("error: {message}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), String> {
    match cli.command {
        Command::Compile { schema, options } => {
            let schema = read_json(&schema)?;
            let options = query_options(options.as_deref())?;
            let compiled = compile_query(&schema, &options, &CompileOptions::default(), &|linked| {
                linked.clone()
            })
            .map_err(|err| err.to_string())?;
            println!("{}", compiled.sql);
            for (index, param) in compiled.params.iter().enumerate() {
                println!("?{} = {param:?}", index + 1);
            }
            Ok(())
        }
        Command::Validate { schema, document } => {
            let issues = validate(&read_json(&schema)?, &read_json(&document)?)
                .map_err(|err| err.to_string())?;
            if issues.is_empty() {
                println!("valid");
                return Ok(());
            }
            for issue in &issues {
                println!("{issue}");
            }
            Err(format!("{} issue(s)", issues.len()))
        }
        Command::Insert { card } => {
            let card = read_json(&card)?;
            let kernel = open_kernel(cli.db).await?;
            let inserted = kernel
                .insert_card(kernel.admin_session(), card)
                .await
                .map_err(describe)?;
            println!("{}", inserted.to_value());
            Ok(())
        }
        Command::Query { schema, options } => {
            let schema = read_json(&schema)?;
            let options = query_options(options.as_deref())?;
            let kernel = open_kernel(cli.db).await?;
            let cards = kernel
                .query(kernel.admin_session(), &schema, options)
                .await
                .map_err(describe)?;
            for card in cards {
                println!("{card}");
            }
            Ok(())
        }
    }
}

async fn open_kernel(db: Option<PathBuf>) -> Result<Kernel, String> {
    let mut config = KernelConfig::from_env();
    if let Some(path) = db {
        config.database = DatabaseLocation::File(path);
    }
    Kernel::open(&config).await.map_err(describe)
}

fn query_options(raw: Option<&str>) -> Result<QueryOptions, String> {
    let value = match raw {
        Some(raw) => read_json(raw)?,
        None => Value::Null,
    };
    QueryOptions::from_value(&value).map_err(|err| err.to_string())
}

/// Parses inline JSON, or the file named after a leading `@`.
fn read_json(raw: &str) -> Result<Value, String> {
    let text = match raw.strip_prefix('@') {
        Some(path) => {
            std::fs::read_to_string(path).map_err(|err| format!("cannot read `{path}`: {err}"))?
        }
        None => raw.to_string(),
    };
    serde_json::from_str(&text).map_err(|err| format!("invalid JSON: {err}"))
}

fn describe(err: CoreError) -> String {
    format!("[{}] {err}", err.code())
}
