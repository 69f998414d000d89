use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::Parser;
use sqlx::postgres::PgPoolOptions;

use list_archiver::config::ArchiverConfig;
use list_archiver::import::{ImportOptions, MboxImporter};
use list_archiver::ingest::Archiver;
use list_archiver::store::PgBackend;

#[derive(Parser, Debug)]
#[command(
    name = "import_mbox",
    about = "Import mbox files into the archive of a mailing list"
)]
struct Args {
    /// Mbox files to import, in order.
    #[arg(required = true)]
    mbox: Vec<PathBuf>,

    /// Full address of the list to import into.
    #[arg(short, long)]
    list_address: String,

    /// Only import messages dated after this date. Defaults to the newest
    /// archived message of the list.
    #[arg(long)]
    since: Option<String>,

    /// Read files even if they were not modified after the cutoff.
    #[arg(long)]
    ignore_mtime: bool,

    /// Do not sync the list settings before and after the import.
    #[arg(long)]
    no_sync: bool,
}

fn parse_since(raw: &str) -> Option<DateTime<Utc>> {
    dateparser::parse(raw).ok()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    let args = Args::parse();
    let list_address = args.list_address.trim().to_lowercase();

    if !list_address.contains('@') {
        writeln!(io::stderr(), "error: the list address must contain '@'")?;
        std::process::exit(1);
    }

    let since = match args.since.as_deref() {
        Some(raw) => match parse_since(raw) {
            Some(date) => Some(date),
            None => {
                writeln!(io::stderr(), "error: invalid --since date '{raw}'")?;
                std::process::exit(1);
            }
        },
        None => None,
    };

    for path in &args.mbox {
        if !path.is_file() {
            writeln!(io::stderr(), "error: no such file: {}", path.display())?;
            std::process::exit(1);
        }
    }

    let database_url = std::env::var("DATABASE_URL")?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await?;

    let archiver = Archiver::new(Arc::new(PgBackend::new(pool)), ArchiverConfig::from_env());
    let options = ImportOptions {
        since,
        ignore_mtime: args.ignore_mtime,
        no_sync: args.no_sync,
    };
    let mut importer = MboxImporter::new(&archiver, &list_address, options);
    let stats = importer.import_paths(&args.mbox).await?;

    println!("{}: {}", list_address, stats);
    Ok(())
}
