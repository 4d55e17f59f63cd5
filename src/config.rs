//! 命令行参数、环境变量与服务默认配置。

use clap::Parser;
use shadow_rs::formatcp;

use crate::build;
use crate::logging::LogFormat;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const FIRMWARE_EXTENSION: &str = ".bin";
pub const UPLOAD_FIELD: &str = "firmware";
pub const VERSION_FIELD: &str = "version";
pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_FIRMWARE_VERSION: &str = "1.0.0";
pub const DEFAULT_MAX_UPLOAD_SIZE: usize = 32 * 1024 * 1024;
pub const DEFAULT_LOCK_WAIT_TIMEOUT_SECS: u64 = 30;
pub const SHUTDOWN_GRACE_SECS: u64 = 10;

/// CLI arguments and environment configuration for the OTA server.
#[derive(Parser, Debug)]
#[command(name = "ota-server", version = VERSION_INFO, about = "OTA firmware server")]
pub struct Args {
    #[arg(
        short = 'b',
        long,
        env = "OTA_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "PORT",
        default_value_t = DEFAULT_PORT,
        help = "HTTP port"
    )]
    pub port: u16,
    #[arg(
        long,
        env = "OTA_BASE_URL",
        help = "Externally advertised base URL for download links"
    )]
    pub base_url: Option<String>,
    #[arg(
        short = 'd',
        long,
        env = "OTA_FIRMWARE_DIR",
        default_value = "firmware",
        help = "Directory holding uploaded firmware binaries"
    )]
    pub firmware_dir: String,
    #[arg(
        short = 'l',
        long,
        env = "OTA_LEDGER_FILE",
        default_value = "firmware_versions.csv",
        help = "CSV file recording firmware uploads and downloads"
    )]
    pub ledger_file: String,
    #[arg(
        long,
        env = "OTA_DEFAULT_VERSION",
        default_value = DEFAULT_FIRMWARE_VERSION,
        help = "Version tag recorded when an upload carries none"
    )]
    pub default_version: String,
    #[arg(
        long,
        env = "OTA_MAX_UPLOAD_SIZE",
        default_value_t = DEFAULT_MAX_UPLOAD_SIZE,
        help = "Max upload request size in bytes"
    )]
    pub max_upload_size: usize,
    #[arg(long, env = "OTA_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "OTA_LOG_FORMAT",
        value_enum,
        default_value_t = LogFormat::Full,
        help = "Log output format"
    )]
    pub log_format: LogFormat,
}

impl Args {
    /// 下载链接使用的外部地址，未配置时回退到本机端口。
    pub fn advertised_base_url(&self) -> String {
        match self.base_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => url.trim_end_matches('/').to_string(),
            _ => format!("http://localhost:{}", self.port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_defaults_to_localhost_port() {
        let args = Args::try_parse_from(["ota-server", "--port", "9100"]).expect("parse args");
        assert_eq!(args.advertised_base_url(), "http://localhost:9100");
    }

    #[test]
    fn base_url_trims_trailing_slash() {
        let args = Args::try_parse_from(["ota-server", "--base-url", "https://ota.example.com/"])
            .expect("parse args");
        assert_eq!(args.advertised_base_url(), "https://ota.example.com");
    }

    #[test]
    fn explicit_flags_override_defaults() {
        let args = Args::try_parse_from([
            "ota-server",
            "-d",
            "/srv/fw",
            "-l",
            "/srv/ledger.csv",
            "--default-version",
            "2.1.0",
        ])
        .expect("parse args");
        assert_eq!(args.firmware_dir, "/srv/fw");
        assert_eq!(args.ledger_file, "/srv/ledger.csv");
        assert_eq!(args.default_version, "2.1.0");
    }

    #[test]
    fn log_format_accepts_compact() {
        let args = Args::try_parse_from(["ota-server", "--log-format", "compact"])
            .expect("parse args");
        assert_eq!(args.log_format, LogFormat::Compact);
    }
}
