use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use sqlx::postgres::PgPoolOptions;

use list_archiver::config::ArchiverConfig;
use list_archiver::ingest::{Archiver, IngestError};
use list_archiver::store::PgBackend;

#[derive(Parser, Debug)]
#[command(
    name = "attachments_to_file",
    about = "Move attachment content from the database to the attachment folder"
)]
struct Args {
    /// Attachments moved per transaction.
    #[arg(short, long, default_value_t = 100)]
    chunk_size: i64,

    /// Target folder, overriding ARCHIVER_ATTACHMENT_FOLDER.
    #[arg(long)]
    folder: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    let args = Args::parse();
    if args.chunk_size < 1 {
        writeln!(io::stderr(), "error: --chunk-size must be positive")?;
        std::process::exit(1);
    }

    let mut config = ArchiverConfig::from_env();
    if let Some(folder) = args.folder {
        config.attachment_folder = Some(folder);
    }

    let database_url = std::env::var("DATABASE_URL")?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await?;

    let archiver = Archiver::new(Arc::new(PgBackend::new(pool)), config);
    match archiver.externalize_attachments(args.chunk_size).await {
        Ok(moved) => {
            println!("moved {} attachments", moved);
            Ok(())
        }
        Err(IngestError::Configuration(msg)) => {
            writeln!(io::stderr(), "error: {msg}, set ARCHIVER_ATTACHMENT_FOLDER or --folder")?;
            std::process::exit(1);
        }
        Err(err) => Err(err.into()),
    }
}
