use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::Parser;
use sqlx::postgres::PgPoolOptions;

use list_archiver::config::ArchiverConfig;
use list_archiver::export::{export_filename, export_mbox};
use list_archiver::ingest::Archiver;
use list_archiver::store::{EmailFilter, PgBackend};

#[derive(Parser, Debug)]
#[command(
    name = "export_mbox",
    about = "Export the archive of a mailing list as a gzip-compressed mbox"
)]
struct Args {
    /// Full address of the list to export.
    #[arg(short, long)]
    list_address: String,

    /// Only messages dated on or after this date.
    #[arg(long)]
    start: Option<String>,

    /// Only messages dated before this date.
    #[arg(long)]
    end: Option<String>,

    /// Only messages of this thread.
    #[arg(long)]
    thread: Option<String>,

    /// Only these messages, by hash. May be repeated.
    #[arg(long = "message")]
    messages: Vec<String>,

    /// Output file. Defaults to a name derived from the list and filters.
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn parse_date(flag: &str, raw: Option<&str>) -> Result<Option<DateTime<Utc>>, String> {
    match raw {
        Some(raw) => dateparser::parse(raw)
            .map(Some)
            .map_err(|_| format!("invalid --{flag} date '{raw}'")),
        None => Ok(None),
    }
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

    let (start, end) = match (
        parse_date("start", args.start.as_deref()),
        parse_date("end", args.end.as_deref()),
    ) {
        (Ok(start), Ok(end)) => (start, end),
        (Err(msg), _) | (_, Err(msg)) => {
            writeln!(io::stderr(), "error: {msg}")?;
            std::process::exit(1);
        }
    };

    let filter = EmailFilter {
        start,
        end,
        thread_key: args.thread,
        message_id_hashes: args.messages,
    };
    let output = args
        .output
        .unwrap_or_else(|| PathBuf::from(export_filename(&list_address, &filter)));

    let database_url = std::env::var("DATABASE_URL")?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await?;

    let archiver = Archiver::new(Arc::new(PgBackend::new(pool)), ArchiverConfig::from_env());
    let mut writer = BufWriter::new(File::create(&output)?);
    let count = export_mbox(&archiver, &list_address, &filter, &mut writer).await?;
    writer.flush()?;

    println!("exported {} messages to {}", count, output.display());
    Ok(())
}
