//! 整个目录树的 tar.gz 与 zip 流式打包。
//!
//! 打包分两遍：规划阶段遍历目录树，只收集元数据并确认文件可打开，
//! 此阶段的失败发生在响应开始之前，返回 500。写入阶段在阻塞线程池上运行，
//! 经有界通道把编码后的字节送入响应体；字节开始传输后，失败只能中断响应体。

use axum::body::Body as AxumBody;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::{DateTime, Datelike, Timelike, Utc};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs::{self, File, Metadata};
use std::io::{self, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tar::{Builder as TarBuilder, EntryType, Header as TarHeader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions as ZipFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::ApiError;

/// 每次交给响应体的数据块大小。
const COPY_BUFFER_SIZE: usize = 64 * 1024;
/// 编码器与慢速客户端之间缓冲的数据块数。
const CHANNEL_DEPTH: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    Zip,
}

impl ArchiveFormat {
    pub fn query_key(self) -> &'static str {
        match self {
            ArchiveFormat::TarGz => "tar.gz",
            ArchiveFormat::Zip => "zip",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            ArchiveFormat::TarGz => "application/x-tar+gzip",
            ArchiveFormat::Zip => "application/zip",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ArchiveFormat::TarGz => ".tar.gz",
            ArchiveFormat::Zip => ".zip",
        }
    }
}

#[derive(Debug)]
struct ArchiveEntry {
    /// 相对归档根的路径，始终以 `/` 分隔。
    name: String,
    source: PathBuf,
    metadata: Metadata,
}

impl ArchiveEntry {
    fn is_dir(&self) -> bool {
        self.metadata.is_dir()
    }
}

/// 返回 `root` 的归档；响应头在第一个字节之前确定。
pub async fn serve_archive(root: &Path, format: ArchiveFormat) -> Result<Response, ApiError> {
    let source = root.to_path_buf();
    let entries = tokio::task::spawn_blocking(move || plan_entries(&source))
        .await
        .map_err(ApiError::internal)?
        .map_err(ApiError::internal)?;

    let filename = format!("{}{}", archive_base_name(root), format.extension());
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(format.content_type()),
    );
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&content_disposition(&filename))
            .map_err(|_| ApiError::Internal("invalid archive file name".into()))?,
    );
    info!(
        root = %root.display(),
        format = format.query_key(),
        entries = entries.len(),
        "streaming archive"
    );

    Ok((StatusCode::OK, headers, stream_entries(entries, format)).into_response())
}

fn archive_base_name(root: &Path) -> String {
    root.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "archive".to_string())
}

fn content_disposition(filename: &str) -> String {
    let escaped = filename.replace('\\', "\\\\").replace('"', "\\\"");
    format!("attachment; filename=\"{escaped}\"")
}

/// 深度优先遍历，子项按文件名字节序排序。
fn plan_entries(root: &Path) -> io::Result<Vec<ArchiveEntry>> {
    let metadata = fs::metadata(root)?;
    let mut entries = Vec::new();
    if metadata.is_dir() {
        collect_children(root, &[], &mut entries)?;
    } else {
        ensure_readable(root)?;
        entries.push(ArchiveEntry {
            name: archive_base_name(root),
            source: root.to_path_buf(),
            metadata,
        });
    }
    Ok(entries)
}

fn collect_children(
    dir: &Path,
    prefix: &[String],
    entries: &mut Vec<ArchiveEntry>,
) -> io::Result<()> {
    let mut children = fs::read_dir(dir)?
        .map(|entry| entry.map(|entry| (entry.file_name(), entry.path())))
        .collect::<io::Result<Vec<_>>>()?;
    children.sort_by(|(a, _), (b, _)| a.cmp(b));

    for (file_name, path) in children {
        let link = fs::symlink_metadata(&path)?;
        let metadata = if link.file_type().is_symlink() {
            match fs::metadata(&path) {
                Ok(target) if target.is_file() => target,
                _ => {
                    debug!(path = %path.display(), "skipping symlink");
                    continue;
                }
            }
        } else {
            link
        };
        if !metadata.is_dir() && !metadata.is_file() {
            debug!(path = %path.display(), "skipping special file");
            continue;
        }

        if metadata.is_file() {
            ensure_readable(&path)?;
        }

        let mut segments = prefix.to_vec();
        segments.push(file_name.to_string_lossy().into_owned());
        let name = segments.join("/");
        let is_dir = metadata.is_dir();
        entries.push(ArchiveEntry {
            name,
            source: path.clone(),
            metadata,
        });
        if is_dir {
            collect_children(&path, &segments, entries)?;
        }
    }
    Ok(())
}

/// 打开后立即关闭 `path`，让权限错误在响应开始前暴露。
fn ensure_readable(path: &Path) -> io::Result<()> {
    File::open(path).map(drop)
}

/// 启动写入阶段并返回其填充的响应体。
fn stream_entries(entries: Vec<ArchiveEntry>, format: ArchiveFormat) -> AxumBody {
    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(CHANNEL_DEPTH);
    let failure_tx = tx.clone();

    tokio::task::spawn_blocking(move || {
        let sink = BufWriter::with_capacity(COPY_BUFFER_SIZE, ChannelWriter { tx });
        let result = match format {
            ArchiveFormat::TarGz => write_tar_gz(&entries, sink),
            ArchiveFormat::Zip => write_zip(&entries, sink),
        };
        match result {
            Ok(()) => debug!(format = format.query_key(), "archive complete"),
            Err(err) if err.kind() == ErrorKind::BrokenPipe => {
                debug!(format = format.query_key(), "client went away during archive");
            }
            Err(err) => {
                warn!(error = %err, format = format.query_key(), "archive stream aborted");
                let _ = failure_tx.blocking_send(Err(err));
            }
        }
    });

    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });
    AxumBody::from_stream(stream)
}

/// 转发到响应通道的阻塞式 `Write`。
struct ChannelWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .blocking_send(Ok(Bytes::copy_from_slice(buf)))
            .map_err(|_| io::Error::new(ErrorKind::BrokenPipe, "response body dropped"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// 精确读取 `remaining` 字节；源文件变短视为错误，不做填充。
struct ExactReader<R> {
    inner: R,
    remaining: u64,
}

impl<R: Read> Read for ExactReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let max = buf.len().min(self.remaining.min(usize::MAX as u64) as usize);
        let read = self.inner.read(&mut buf[..max])?;
        if read == 0 {
            return Err(io::Error::new(
                ErrorKind::UnexpectedEof,
                "file shrank while being archived",
            ));
        }
        self.remaining -= read as u64;
        Ok(read)
    }
}

fn write_tar_gz<W: Write>(entries: &[ArchiveEntry], sink: BufWriter<W>) -> io::Result<()> {
    let encoder = GzEncoder::new(sink, Compression::default());
    let mut builder = TarBuilder::new(encoder);

    for entry in entries {
        let mut header = TarHeader::new_gnu();
        header.set_mode(file_mode(&entry.metadata));
        header.set_mtime(mtime_secs(&entry.metadata));
        if entry.is_dir() {
            header.set_entry_type(EntryType::Directory);
            header.set_size(0);
            builder.append_data(&mut header, format!("{}/", entry.name), io::empty())?;
        } else {
            let file = File::open(&entry.source)?;
            let size = file.metadata()?.len();
            header.set_entry_type(EntryType::Regular);
            header.set_size(size);
            let reader = ExactReader {
                inner: file,
                remaining: size,
            };
            builder.append_data(&mut header, &entry.name, reader)?;
        }
    }

    let encoder = builder.into_inner()?;
    let mut sink = encoder.finish()?;
    sink.flush()
}

fn write_zip<W: Write>(entries: &[ArchiveEntry], sink: BufWriter<W>) -> io::Result<()> {
    let mut writer = ZipWriter::new_stream(sink);

    for entry in entries {
        let mut options = ZipFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .unix_permissions(file_mode(&entry.metadata));
        if let Some(modified) = zip_timestamp(&entry.metadata) {
            options = options.last_modified_time(modified);
        }
        if entry.is_dir() {
            writer
                .add_directory(format!("{}/", entry.name), options)
                .map_err(io::Error::other)?;
        } else {
            let mut file = File::open(&entry.source)?;
            let size = file.metadata()?.len();
            writer
                .start_file(
                    entry.name.as_str(),
                    options.large_file(size >= u32::MAX as u64),
                )
                .map_err(io::Error::other)?;
            io::copy(
                &mut ExactReader {
                    inner: &mut file,
                    remaining: size,
                },
                &mut writer,
            )?;
        }
    }

    let mut sink = writer.finish().map_err(io::Error::other)?;
    sink.flush()
}

#[cfg(unix)]
fn file_mode(metadata: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(metadata: &Metadata) -> u32 {
    if metadata.is_dir() { 0o755 } else { 0o644 }
}

fn mtime_secs(metadata: &Metadata) -> u64 {
    metadata
        .modified()
        .ok()
        .and_then(|ts| ts.duration_since(UNIX_EPOCH).ok())
        .map(|duration| duration.as_secs())
        .unwrap_or_default()
}

fn zip_timestamp(metadata: &Metadata) -> Option<zip::DateTime> {
    let modified: DateTime<Utc> = metadata.modified().ok()?.into();
    zip::DateTime::from_date_and_time(
        u16::try_from(modified.year()).ok()?,
        modified.month() as u8,
        modified.day() as u8,
        modified.hour() as u8,
        modified.minute() as u8,
        modified.second() as u8,
    )
    .ok()
}
