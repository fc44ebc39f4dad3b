use anyhow::Result;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{error, info, warn};

use crate::{database::Database, feed_cache::FeedCache, keys::ScopeIdentity, types::UserId};

pub struct AdminSocket {
    db: Arc<Database>,
    cache: Arc<FeedCache>,
    socket_path: String,
}

impl AdminSocket {
    pub fn new(db: Arc<Database>, cache: Arc<FeedCache>, socket_path: String) -> Self {
        Self {
            db,
            cache,
            socket_path,
        }
    }

    pub async fn start(&self) -> Result<()> {
        // Remove old socket if it exists
        let _ = std::fs::remove_file(&self.socket_path);

        let listener = UnixListener::bind(&self.socket_path)?;
        info!("Admin socket listening on {}", self.socket_path);

        // Owner and group only
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&self.socket_path)?.permissions();
            perms.set_mode(0o660);
            std::fs::set_permissions(&self.socket_path, perms)?;
        }

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let db = Arc::clone(&self.db);
                    let cache = Arc::clone(&self.cache);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, db, cache).await {
                            error!("Error handling admin connection: {}", e);
                        }
                    });
                }
                Err(e) => {
                    warn!("Failed to accept admin connection: {}", e);
                }
            }
        }
    }
}

async fn handle_connection(stream: UnixStream, db: Arc<Database>, cache: Arc<FeedCache>) -> Result<()> {
    let (reader, writer) = stream.into_split();
    run_console(BufReader::new(reader), writer, &db, &cache).await
}

async fn run_console<R, W>(mut reader: R, mut writer: W, db: &Database, cache: &FeedCache) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut line = String::new();

    writer.write_all(b"Feed Cache Admin Console\n").await?;
    writer
        .write_all(b"Commands: stats, invalidate <viewer|author> <id>, help, quit\n> ")
        .await?;
    writer.flush().await?;

    loop {
        line.clear();
        let bytes_read = reader.read_line(&mut line).await?;

        if bytes_read == 0 {
            break; // Connection closed
        }

        let command = line.trim();
        if command.is_empty() {
            writer.write_all(b"> ").await?;
            writer.flush().await?;
            continue;
        }

        let parts: Vec<&str> = command.split_whitespace().collect();

        match parts.first().copied() {
            Some("invalidate") => match parse_identity(&parts[1..]) {
                Some(identity) => match cache.invalidate(&identity).await {
                    Ok(()) => {
                        writer
                            .write_all(format!("Invalidated feeds for {}\n", identity).as_bytes())
                            .await?;
                    }
                    Err(e) => {
                        writer
                            .write_all(format!("Invalidation failed: {}\n", e).as_bytes())
                            .await?;
                    }
                },
                None => {
                    writer
                        .write_all(b"Usage: invalidate <viewer|author> <id>\n")
                        .await?;
                }
            },
            Some("stats") => match get_stats(db, cache).await {
                Ok(stats) => {
                    writer.write_all(stats.as_bytes()).await?;
                }
                Err(e) => {
                    writer
                        .write_all(format!("Failed to get stats: {}\n", e).as_bytes())
                        .await?;
                }
            },
            Some("help") => {
                writer.write_all(b"Available commands:\n").await?;
                writer
                    .write_all(b"  stats                          - Show cache and database statistics\n")
                    .await?;
                writer
                    .write_all(b"  invalidate <viewer|author> <id> - Drop cached feeds for a user\n")
                    .await?;
                writer
                    .write_all(b"  help                           - Show this help message\n")
                    .await?;
                writer
                    .write_all(b"  quit                           - Close connection\n")
                    .await?;
            }
            Some("quit") | Some("exit") => {
                writer.write_all(b"Goodbye!\n").await?;
                writer.flush().await?;
                break;
            }
            _ => {
                writer
                    .write_all(
                        format!(
                            "Unknown command: {}. Type 'help' for available commands.\n",
                            command
                        )
                        .as_bytes(),
                    )
                    .await?;
            }
        }

        writer.write_all(b"> ").await?;
        writer.flush().await?;
    }

    Ok(())
}

fn parse_identity(args: &[&str]) -> Option<ScopeIdentity> {
    let id = UserId(args.get(1)?.parse().ok()?);
    match *args.first()? {
        "viewer" => Some(ScopeIdentity::Viewer(id)),
        "author" => Some(ScopeIdentity::Author(id)),
        _ => None,
    }
}

async fn get_stats(db: &Database, cache: &FeedCache) -> Result<String> {
    let cache_stats = cache.stats();
    let db_stats = db.stats().await?;

    Ok(format!(
        "Feed Cache:\n  Entries: {}\n  Hits: {}\n  Misses: {}\n  Computes: {}\n  Coalesced: {}\n  Bypasses: {}\n  In flight: {}\n  Generations: {}\n\
         Database:\n  Posts: {}\n  Follows: {}\n  Blocks: {}\n",
        cache_stats.entries,
        cache_stats.hits,
        cache_stats.misses,
        cache_stats.computes,
        cache_stats.coalesced,
        cache_stats.bypasses,
        cache_stats.in_flight,
        cache_stats.tracked_generations,
        db_stats.posts,
        db_stats.follows,
        db_stats.blocks
    ))
}
