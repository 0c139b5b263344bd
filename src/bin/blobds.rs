//! `blobds`: inspect and edit a blob datastore from the command line
//!
//! ```text
//! blobds <bucket-url> put <key> <file|->
//! blobds <bucket-url> get <key>
//! blobds <bucket-url> has <key>
//! blobds <bucket-url> size <key>
//! blobds <bucket-url> rm <key>
//! blobds <bucket-url> ls [prefix]
//! blobds <bucket-url> du
//! ```
//!
//! Logging is controlled with `RUST_LOG` (for example `RUST_LOG=blob_datastore=debug`).

use blob_datastore::prelude::*;
use color_eyre::eyre::{bail, eyre, Result, WrapErr};
use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: blobds <bucket-url> <put|get|has|size|rm|ls|du> [args]";

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (url, command, rest) = match args.as_slice() {
        [url, command, rest @ ..] => (url.as_str(), command.as_str(), rest),
        _ => bail!(USAGE),
    };

    let store = BlobDatastore::open(url, DatastoreConfig::default())
        .await
        .wrap_err_with(|| format!("opening {url}"))?;
    debug!(bucket = store.bucket_name(), command, "running command");

    let outcome = run(&store, command, rest).await;
    store.close().await?;
    outcome
}

async fn run(store: &BlobDatastore, command: &str, args: &[String]) -> Result<()> {
    match (command, args) {
        ("put", [key, source]) => {
            let mut data = Vec::new();
            if source == "-" {
                tokio::io::stdin().read_to_end(&mut data).await?;
            } else {
                data = tokio::fs::read(source)
                    .await
                    .wrap_err_with(|| format!("reading {source}"))?;
            }
            store.put(&Key::new(key), &data).await?;
        }
        ("get", [key]) => {
            let value = store.get(&Key::new(key)).await?;
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&value).await?;
            stdout.flush().await?;
        }
        ("has", [key]) => println!("{}", store.has(&Key::new(key)).await?),
        ("size", [key]) => println!("{}", store.get_size(&Key::new(key)).await?),
        ("rm", [key]) => store.delete(&Key::new(key)).await?,
        ("ls", rest) if rest.len() <= 1 => {
            let query = Query {
                prefix: rest.first().cloned().unwrap_or_default(),
                keys_only: true,
                returns_sizes: true,
                ..Default::default()
            };
            let mut results = store.query(query).await?;
            while let Some(entry) = results.next().await {
                let entry = entry?;
                println!("{}\t{}", entry.size.unwrap_or_default(), entry.key);
            }
        }
        ("du", []) => println!("{}", store.disk_usage().await?),
        _ => return Err(eyre!("unknown command or wrong arguments: {command}\n{USAGE}")),
    }
    Ok(())
}
