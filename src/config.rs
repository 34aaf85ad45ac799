//! 命令行参数与服务默认配置。

use clap::Parser;
use shadow_rs::formatcp;
use std::io;
use std::path::PathBuf;

use crate::build;
use crate::mount::MountConfig;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const DEFAULT_HTTP_PORT: u16 = 5005;
pub const DEFAULT_UPLOAD_MAX_SIZE: u64 = 1024 * 1024 * 1024;

/// 服务的命令行参数与环境变量配置。
#[derive(Parser, Debug)]
#[command(name = "axo-index", version = VERSION_INFO, about = "Browsable directory server")]
pub struct Args {
    #[arg(
        short = 'm',
        long = "mount",
        env = "AXO_INDEX_MOUNTS",
        value_delimiter = ';',
        value_parser = parse_mount,
        default_value = "/=.",
        help = "Mount as ROUTE=PATH[,upload][,delete]; repeatable"
    )]
    pub mounts: Vec<MountSpec>,
    #[arg(
        short = 'b',
        long,
        env = "AXO_INDEX_BIND",
        default_value = "0.0.0.0",
        help = "Bind address for HTTP/HTTPS"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "AXO_INDEX_HTTP_PORT",
        default_value_t = DEFAULT_HTTP_PORT,
        help = "HTTP port"
    )]
    pub http_port: u16,
    #[arg(
        short = 'P',
        long,
        env = "AXO_INDEX_HTTPS_PORT",
        help = "HTTPS port; HTTPS is off unless set"
    )]
    pub https_port: Option<u16>,
    #[arg(short = 'c', long, env = "AXO_INDEX_TLS_CERT", help = "TLS cert path")]
    pub tls_cert: Option<String>,
    #[arg(short = 'k', long, env = "AXO_INDEX_TLS_KEY", help = "TLS key path")]
    pub tls_key: Option<String>,
    #[arg(long, env = "AXO_INDEX_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "AXO_INDEX_UPLOAD_MAX_SIZE",
        default_value_t = DEFAULT_UPLOAD_MAX_SIZE,
        help = "Max upload request size in bytes (0 to disable)"
    )]
    pub upload_max_size: u64,
}

/// 命令行中书写的挂载点，路径尚未校验。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountSpec {
    pub route: String,
    pub path: PathBuf,
    pub allow_upload: bool,
    pub allow_delete: bool,
}

impl MountSpec {
    /// 规范化根目录；必须存在且是目录。
    pub fn into_config(self) -> io::Result<MountConfig> {
        let root = std::fs::canonicalize(&self.path).map_err(|err| {
            io::Error::new(err.kind(), format!("mount {}: {err}", self.path.display()))
        })?;
        if !root.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("mount {} is not a directory", root.display()),
            ));
        }
        Ok(MountConfig::new(
            self.route,
            root,
            self.allow_upload,
            self.allow_delete,
        ))
    }
}

/// 解析 `ROUTE=PATH[,upload][,delete]`。
pub fn parse_mount(value: &str) -> Result<MountSpec, String> {
    let (route, rest) = value
        .split_once('=')
        .ok_or_else(|| format!("expected ROUTE=PATH, got {value:?}"))?;
    let mut parts = rest.split(',');
    let path = parts.next().unwrap_or_default().trim();
    if path.is_empty() {
        return Err(format!("mount {route:?} has no path"));
    }

    let mut spec = MountSpec {
        route: route.trim().to_string(),
        path: PathBuf::from(path),
        allow_upload: false,
        allow_delete: false,
    };
    for flag in parts.map(str::trim).filter(|flag| !flag.is_empty()) {
        match flag {
            "upload" => spec.allow_upload = true,
            "delete" => spec.allow_delete = true,
            other => return Err(format!("unknown mount flag {other:?}")),
        }
    }
    Ok(spec)
}
