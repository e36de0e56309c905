//! Shardline CLI - operator tool for a local erasure set
//!
//! Runs bucket, object and heal operations directly against a set of disk
//! directories.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use shardline_common::{BitrotAlgorithm, Config, HealScanMode};
use shardline_storage::{
    CompletePart, ErasureSet, MAX_PART_NUMBER, ObjectInfo, part_size_from_index,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "shardline")]
#[command(about = "Shardline erasure set operator CLI")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "SHARDLINE_CONFIG", default_value = "/etc/shardline/shardline.toml")]
    config: PathBuf,

    /// Disk directory, in set order (repeat for each disk)
    #[arg(long = "disk")]
    disks: Vec<PathBuf>,

    /// Erasure block size (e.g. 10M, 512K)
    #[arg(long)]
    block_size: Option<String>,

    /// Parity shards for new objects
    #[arg(long)]
    parity: Option<usize>,

    /// Bitrot algorithm for new shards
    #[arg(long)]
    bitrot: Option<BitrotAlgorithm>,

    /// Log level (overrides the config file)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a bucket on every disk
    MakeBucket {
        /// Bucket name
        bucket: String,
    },
    /// Upload a file as an object
    Put {
        bucket: String,
        object: String,
        /// Source file, `-` for stdin
        #[arg(short, long, default_value = "-")]
        file: PathBuf,
        /// User metadata as key=value (repeatable)
        #[arg(short, long = "meta")]
        meta: Vec<String>,
        /// Upload a file as a multipart upload in parts of this size (e.g. 5M)
        #[arg(long)]
        part_size: Option<String>,
    },
    /// Download an object or a byte range of it
    Get {
        bucket: String,
        object: String,
        /// Destination file, stdout if omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// First byte to read
        #[arg(long, default_value_t = 0)]
        offset: i64,
        /// Bytes to read, to the end if omitted
        #[arg(long)]
        length: Option<i64>,
    },
    /// Show disks and buckets, or one bucket or object
    Info {
        bucket: Option<String>,
        object: Option<String>,
    },
    /// Heal one object
    HealObject {
        bucket: String,
        object: String,
        /// Report drive states without writing
        #[arg(long)]
        dry_run: bool,
        /// Delete the object if it is dangling
        #[arg(long)]
        remove: bool,
        /// normal or deep (defaults to the config file)
        #[arg(long)]
        scan_mode: Option<HealScanMode>,
    },
    /// Heal a bucket's volumes
    HealBucket {
        bucket: String,
        #[arg(long)]
        dry_run: bool,
        /// Delete the bucket if it is dangling
        #[arg(long)]
        remove: bool,
    },
}

/// Load the config file; a missing file means defaults
fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
}

/// Apply command line overrides on top of the file config
fn merge_args(mut config: Config, args: &Args) -> Result<Config> {
    if !args.disks.is_empty() {
        config.storage.disks.clone_from(&args.disks);
    }
    if let Some(size) = &args.block_size {
        config.storage.block_size = parse_size(size)?;
    }
    if args.parity.is_some() {
        config.storage.parity_blocks = args.parity;
    }
    if let Some(algo) = args.bitrot {
        config.storage.bitrot_algorithm = algo;
    }
    if let Some(level) = &args.log_level {
        config.logging.level.clone_from(level);
    }
    Ok(config)
}

/// Parse a human-readable size (e.g. "10M", "512K") into bytes
fn parse_size(s: &str) -> Result<usize> {
    let s = s.trim();
    let (num, multiplier) = if let Some(n) = s.strip_suffix('G') {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('M') {
        (n, 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('K') {
        (n, 1024)
    } else {
        (s, 1)
    };
    let value: usize = num
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid size: '{s}'"))?;
    if value == 0 {
        bail!("Size must be positive: '{s}'");
    }
    Ok(value * multiplier)
}

fn parse_meta(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| anyhow::anyhow!("Metadata must be key=value: '{pair}'"))
        })
        .collect()
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Upload a file of known size as a multipart upload
///
/// The upload is aborted when a part fails. A failed completion leaves the
/// upload in place so it can be completed again.
async fn put_multipart(
    set: &ErasureSet,
    bucket: &str,
    object: &str,
    mut source: tokio::fs::File,
    size: i64,
    part_size: i64,
    meta: BTreeMap<String, String>,
) -> Result<ObjectInfo> {
    let count = u64::try_from(size)?.div_ceil(u64::try_from(part_size)?);
    if count > u64::from(MAX_PART_NUMBER) {
        bail!("{count} parts needed, at most {MAX_PART_NUMBER} allowed; use a larger part size");
    }

    let upload = set.new_multipart_upload(bucket, object, meta).await?;
    let id = &upload.upload_id;
    let uploaded = async {
        let mut parts = Vec::new();
        for number in 1..=MAX_PART_NUMBER {
            let length = part_size_from_index(size, part_size, number)?;
            if length == 0 {
                break;
            }
            let reader = (&mut source).take(u64::try_from(length)?);
            let part = set
                .put_object_part(bucket, object, id, number, reader, length)
                .await?;
            debug!("uploaded part {} of {} ({} bytes)", number, id, length);
            parts.push(CompletePart {
                part_number: part.number,
                etag: part.etag,
            });
        }
        Ok::<_, anyhow::Error>(parts)
    }
    .await;

    let parts = match uploaded {
        Ok(parts) => parts,
        Err(e) => {
            if let Err(abort) = set.abort_multipart_upload(bucket, object, id).await {
                warn!("aborting upload {} failed: {}", id, abort);
            }
            return Err(e);
        }
    };
    set.complete_multipart_upload(bucket, object, id, &parts)
        .await
        .with_context(|| format!("completing upload {id}"))
}

#[derive(Serialize)]
struct DiskReport {
    endpoint: String,
    online: bool,
    total: u64,
    free: u64,
    error: Option<String>,
}

async fn run(set: &ErasureSet, config: &Config, command: Commands) -> Result<()> {
    match command {
        Commands::MakeBucket { bucket } => {
            set.make_bucket(&bucket).await?;
            println!("Bucket '{bucket}' created");
        }
        Commands::Put {
            bucket,
            object,
            file,
            meta,
            part_size,
        } => {
            let meta = parse_meta(&meta)?;
            let part_size = part_size.as_deref().map(parse_size).transpose()?;
            let info = if file == Path::new("-") {
                if part_size.is_some() {
                    bail!("--part-size needs a file of known size");
                }
                set.put_object(&bucket, &object, tokio::io::stdin(), -1, meta)
                    .await?
            } else {
                let source = tokio::fs::File::open(&file)
                    .await
                    .with_context(|| format!("opening {}", file.display()))?;
                let size = i64::try_from(source.metadata().await?.len())?;
                match part_size {
                    Some(part_size) if size > 0 => {
                        let part_size = i64::try_from(part_size)?;
                        put_multipart(set, &bucket, &object, source, size, part_size, meta).await?
                    }
                    _ => set.put_object(&bucket, &object, source, size, meta).await?,
                }
            };
            print_json(&info)?;
        }
        Commands::Get {
            bucket,
            object,
            output,
            offset,
            length,
        } => {
            let length = length.unwrap_or(-1);
            match output {
                Some(path) => {
                    let mut file = tokio::fs::File::create(&path)
                        .await
                        .with_context(|| format!("creating {}", path.display()))?;
                    set.get_object(&bucket, &object, offset, length, &mut file)
                        .await?;
                    file.flush().await?;
                    info!("wrote {}/{} to {}", bucket, object, path.display());
                }
                None => {
                    let mut stdout = tokio::io::stdout();
                    set.get_object(&bucket, &object, offset, length, &mut stdout)
                        .await?;
                    stdout.flush().await?;
                }
            }
        }
        Commands::Info { bucket, object } => match (bucket, object) {
            (Some(bucket), Some(object)) => {
                print_json(&set.get_object_info(&bucket, &object).await?)?;
            }
            (Some(bucket), None) => {
                print_json(&set.get_bucket_info(&bucket).await?)?;
            }
            _ => {
                let disks: Vec<DiskReport> = set
                    .storage_info()
                    .await
                    .into_iter()
                    .zip(set.disks())
                    .map(|(info, slot)| match info {
                        Ok(info) => DiskReport {
                            endpoint: info.endpoint,
                            online: true,
                            total: info.total,
                            free: info.free,
                            error: None,
                        },
                        Err(e) => DiskReport {
                            endpoint: shardline_storage::disk::endpoint_of(slot),
                            online: false,
                            total: 0,
                            free: 0,
                            error: Some(e.to_string()),
                        },
                    })
                    .collect();
                let buckets = set.list_buckets().await?;
                let (data_blocks, parity_blocks) = set.default_layout();
                print_json(&serde_json::json!({
                    "disks": disks,
                    "data_blocks": data_blocks,
                    "parity_blocks": parity_blocks,
                    "block_size": set.block_size(),
                    "bitrot_algorithm": set.bitrot_algorithm().to_string(),
                    "buckets": buckets,
                }))?;
            }
        },
        Commands::HealObject {
            bucket,
            object,
            dry_run,
            remove,
            scan_mode,
        } => {
            let scan_mode = scan_mode.unwrap_or(config.heal.scan_mode);
            let remove = remove || config.heal.remove_dangling;
            let result = set
                .heal_object(&bucket, &object, dry_run, remove, scan_mode)
                .await?;
            print_json(&result)?;
        }
        Commands::HealBucket {
            bucket,
            dry_run,
            remove,
        } => {
            let remove = remove || config.heal.remove_dangling;
            let result = set.heal_bucket(&bucket, dry_run, remove).await?;
            print_json(&result)?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = merge_args(load_config(&args.config)?, &args)?;

    // Logs go to stderr so `get` can stream to stdout
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if config.storage.disks.is_empty() {
        bail!(
            "No disks specified. Use --disk or configure storage.disks in {}",
            args.config.display()
        );
    }
    debug!("disks: {:?}", config.storage.disks);

    let set = ErasureSet::open_local(&config.storage)?;
    set.init().await?;

    run(&set, &config, args.command).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("512K").unwrap(), 512 * 1024);
        assert_eq!(parse_size("10M").unwrap(), 10 * 1024 * 1024);
        assert!(parse_size("0").is_err());
        assert!(parse_size("ten").is_err());
    }

    #[test]
    fn test_parse_meta() {
        let meta = parse_meta(&["content-type=text/plain".to_string()]).unwrap();
        assert_eq!(meta["content-type"], "text/plain");
        assert!(parse_meta(&["novalue".to_string()]).is_err());
    }

    #[test]
    fn test_flags_override_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shardline.toml");
        std::fs::write(
            &path,
            r#"
            [storage]
            disks = ["/a", "/b"]
            parity_blocks = 1

            [heal]
            scan_mode = "deep"
            "#,
        )
        .unwrap();

        let args = Args::parse_from([
            "shardline",
            "--config",
            path.to_str().unwrap(),
            "--disk",
            "/x",
            "--disk",
            "/y",
            "--block-size",
            "1M",
            "info",
        ]);
        let config = merge_args(load_config(&args.config).unwrap(), &args).unwrap();
        assert_eq!(config.storage.disks, vec![PathBuf::from("/x"), PathBuf::from("/y")]);
        assert_eq!(config.storage.block_size, 1024 * 1024);
        assert_eq!(config.storage.parity_blocks, Some(1));
        assert_eq!(config.heal.scan_mode, HealScanMode::Deep);
    }

    #[test]
    fn test_missing_config_is_default() {
        let config = load_config(Path::new("/nonexistent/shardline.toml")).unwrap();
        assert!(config.storage.disks.is_empty());
        assert_eq!(config.logging.level, "info");
    }

    #[tokio::test]
    async fn test_put_in_parts() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.bin");
        let data: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&source, &data).unwrap();

        let mut config = Config::default();
        config.storage.block_size = 1024;
        config.storage.disks = (0..4).map(|i| dir.path().join(format!("disk{i}"))).collect();
        let set = ErasureSet::open_local(&config.storage).unwrap();
        set.init().await.unwrap();
        set.make_bucket("b").await.unwrap();

        run(
            &set,
            &config,
            Commands::Put {
                bucket: "b".into(),
                object: "o".into(),
                file: source,
                meta: vec![],
                part_size: Some("1K".into()),
            },
        )
        .await
        .unwrap();

        let info = set.get_object_info("b", "o").await.unwrap();
        let sizes: Vec<i64> = info.parts.iter().map(|p| p.size).collect();
        assert_eq!(sizes, vec![1024, 1024, 452]);
        assert!(info.etag.ends_with("-3"));
        let mut out = Vec::new();
        set.get_object("b", "o", 0, -1, &mut out).await.unwrap();
        assert_eq!(out, data);

        let stdin_parts = run(
            &set,
            &config,
            Commands::Put {
                bucket: "b".into(),
                object: "p".into(),
                file: PathBuf::from("-"),
                meta: vec![],
                part_size: Some("1K".into()),
            },
        )
        .await;
        assert!(stdin_parts.is_err());
    }

    #[tokio::test]
    async fn test_commands_against_local_disks() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.bin");
        std::fs::write(&source, b"hello shardline").unwrap();

        let mut config = Config::default();
        config.storage.block_size = 1024;
        config.storage.disks = (0..4).map(|i| dir.path().join(format!("disk{i}"))).collect();
        let set = ErasureSet::open_local(&config.storage).unwrap();
        set.init().await.unwrap();

        run(&set, &config, Commands::MakeBucket { bucket: "b".into() })
            .await
            .unwrap();
        run(
            &set,
            &config,
            Commands::Put {
                bucket: "b".into(),
                object: "o".into(),
                file: source,
                meta: vec![],
                part_size: None,
            },
        )
        .await
        .unwrap();

        let target = dir.path().join("out.bin");
        run(
            &set,
            &config,
            Commands::Get {
                bucket: "b".into(),
                object: "o".into(),
                output: Some(target.clone()),
                offset: 6,
                length: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"shardline");

        run(
            &set,
            &config,
            Commands::HealObject {
                bucket: "b".into(),
                object: "o".into(),
                dry_run: true,
                remove: false,
                scan_mode: None,
            },
        )
        .await
        .unwrap();
    }
}
