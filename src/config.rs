use std::net::IpAddr;
use std::path::PathBuf;

use byte_unit::Byte;
use clap::{Parser, ValueEnum};

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_CHUNK: &str = "1MiB";
const MAX_CHUNK_SIZE: u64 = 512 * 1024 * 1024;
const DEFAULT_KEY_PREFIX: &str = "objects/";
const MEMORY_CONTAINER: &str = "media";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreBackend {
    /// S3 or an S3-compatible service.
    S3,
    /// Process-local store; contents are lost on exit.
    Memory,
}

/// Range-streaming HTTP gateway for objects kept in an append-only store,
/// with load-balanced store sessions and short shareable links.
#[derive(Debug, Clone, Parser)]
#[command(name = "linkstream", version, about, long_about = None)]
pub struct CliArgs {
    /// IP address to bind on. Omit to bind all interfaces.
    #[arg(long, env = "LINKSTREAM_BIND_IP", help = "Bind IP address [default: 0.0.0.0]")]
    pub bind_ip: Option<IpAddr>,

    /// TCP port to listen on.
    #[arg(long, env = "LINKSTREAM_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Public base URL used in issued links, e.g. https://dl.example.com.
    /// Defaults to http://<bind-ip>:<port>.
    #[arg(long, env = "LINKSTREAM_BASE_URL")]
    pub base_url: Option<String>,

    #[arg(long, env = "LINKSTREAM_STORE", value_enum, default_value_t = StoreBackend::S3)]
    pub store: StoreBackend,

    /// Storage container: the S3 bucket (required for the s3 store).
    #[arg(long, alias = "bucket", env = "LINKSTREAM_CONTAINER")]
    pub container: Option<String>,

    /// AWS region. Falls back to SDK default resolution chain.
    #[arg(long, env = "LINKSTREAM_REGION")]
    pub region: Option<String>,

    /// Override S3 endpoint URL (for LocalStack or S3-compatible services).
    #[arg(long, env = "LINKSTREAM_S3_ENDPOINT_URL")]
    pub s3_endpoint_url: Option<String>,

    /// Force path-style S3 addressing (required for LocalStack).
    #[arg(long, env = "LINKSTREAM_S3_FORCE_PATH_STYLE", default_value_t = false)]
    pub s3_force_path_style: bool,

    /// Prefix prepended to every object key.
    #[arg(long, env = "LINKSTREAM_KEY_PREFIX", default_value = DEFAULT_KEY_PREFIX)]
    pub key_prefix: String,

    /// Extra credential profiles, comma separated. Each one becomes an
    /// additional session pool client next to the default credentials.
    #[arg(long, env = "LINKSTREAM_PROFILES", value_delimiter = ',')]
    pub profiles: Vec<String>,

    /// Upstream chunk size, e.g. 1MiB. At most 512MiB.
    #[arg(
        long,
        env = "LINKSTREAM_CHUNK_SIZE",
        default_value = DEFAULT_CHUNK,
        value_parser = parse_byte_size
    )]
    pub chunk_size: u64,

    /// JSONL journal for issued links. Links are kept in memory only when
    /// omitted.
    #[arg(long, env = "LINKSTREAM_LINKS_FILE")]
    pub links_file: Option<PathBuf>,

    /// Directory for in-flight ingestion downloads. Defaults to the system
    /// temp directory.
    #[arg(long, env = "LINKSTREAM_TEMP_DIR")]
    pub temp_dir: Option<PathBuf>,

    /// Bearer token allowed to use URL ingestion. URL ingestion is disabled
    /// when omitted.
    #[arg(long, env = "LINKSTREAM_OWNER_TOKEN", hide_env_values = true)]
    pub owner_token: Option<String>,

    /// Path to write JSONL debug trace (stream start/finish, per-chunk
    /// latency). Disabled when omitted.
    #[arg(long, env = "LINKSTREAM_DEBUG_TRACE")]
    pub debug_trace: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_ip: IpAddr,
    pub port: u16,
    /// No trailing slash.
    pub base_url: String,
    pub store: StoreBackend,
    pub container: String,
    pub region: Option<String>,
    pub s3_endpoint_url: Option<String>,
    pub s3_force_path_style: bool,
    pub key_prefix: String,
    pub profiles: Vec<String>,
    pub chunk_size: u64,
    pub links_file: Option<PathBuf>,
    pub temp_dir: PathBuf,
    pub owner_token: Option<String>,
}

impl TryFrom<CliArgs> for AppConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        anyhow::ensure!(
            args.chunk_size >= 1 && args.chunk_size <= MAX_CHUNK_SIZE,
            "chunk-size must be in 1B..=512MiB"
        );
        let container = match (args.store, args.container) {
            (_, Some(c)) if !c.trim().is_empty() => c,
            (StoreBackend::Memory, _) => MEMORY_CONTAINER.to_string(),
            (StoreBackend::S3, _) => anyhow::bail!("--container is required for the s3 store"),
        };
        let profiles: Vec<String> = args
            .profiles
            .into_iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        anyhow::ensure!(
            args.store == StoreBackend::S3 || profiles.is_empty(),
            "--profiles only applies to the s3 store"
        );

        let bind_ip = args.bind_ip.unwrap_or_else(|| IpAddr::from([0, 0, 0, 0]));
        let base_url = args
            .base_url
            .unwrap_or_else(|| format!("http://{bind_ip}:{}", args.port));
        let base_url = base_url.trim_end_matches('/').to_string();
        anyhow::ensure!(
            base_url.starts_with("http://") || base_url.starts_with("https://"),
            "base-url must start with http:// or https://"
        );

        Ok(Self {
            bind_ip,
            port: args.port,
            base_url,
            store: args.store,
            container,
            region: args.region,
            s3_endpoint_url: args.s3_endpoint_url,
            s3_force_path_style: args.s3_force_path_style,
            key_prefix: args.key_prefix,
            profiles,
            chunk_size: args.chunk_size,
            links_file: args.links_file,
            temp_dir: args.temp_dir.unwrap_or_else(std::env::temp_dir),
            owner_token: args.owner_token.filter(|t| !t.is_empty()),
        })
    }
}

fn parse_byte_size(input: &str) -> Result<u64, String> {
    Byte::parse_str(input, true)
        .map(|b| b.as_u64())
        .map_err(|e| format!("invalid byte size: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> anyhow::Result<AppConfig> {
        let mut argv = vec!["linkstream"];
        argv.extend_from_slice(extra);
        AppConfig::try_from(CliArgs::try_parse_from(argv)?)
    }

    #[test]
    fn parse_common_sizes() {
        assert_eq!(parse_byte_size("1MiB").unwrap(), 1_048_576);
        assert_eq!(parse_byte_size("512MiB").unwrap(), 536_870_912);
        assert_eq!(parse_byte_size("64KiB").unwrap(), 65_536);
        assert!(parse_byte_size("lots").is_err());
    }

    #[test]
    fn memory_store_defaults() {
        let cfg = parse(&["--store", "memory"]).unwrap();
        assert_eq!(cfg.container, "media");
        assert_eq!(cfg.chunk_size, 1_048_576);
        assert_eq!(cfg.base_url, "http://0.0.0.0:8080");
        assert!(cfg.owner_token.is_none());
    }

    #[test]
    fn s3_store_requires_container() {
        assert!(parse(&["--store", "s3"]).is_err());
        let cfg = parse(&["--bucket", "media-prod", "--profiles", "a, b,,"]).unwrap();
        assert_eq!(cfg.container, "media-prod");
        assert_eq!(cfg.profiles, vec!["a", "b"]);
    }

    #[test]
    fn chunk_size_is_bounded() {
        assert!(parse(&["--store", "memory", "--chunk-size", "0"]).is_err());
        assert!(parse(&["--store", "memory", "--chunk-size", "513MiB"]).is_err());
        assert!(parse(&["--store", "memory", "--chunk-size", "1"]).is_ok());
    }

    #[test]
    fn base_url_trailing_slash_is_stripped() {
        let cfg = parse(&["--store", "memory", "--base-url", "https://dl.example.com/"]).unwrap();
        assert_eq!(cfg.base_url, "https://dl.example.com");
        assert!(parse(&["--store", "memory", "--base-url", "dl.example.com"]).is_err());
    }
}
