//! 目录列表：数据组装、导航 URL 与 autoindex 页面渲染。

use axum::extract::Query;
use axum::http::Uri;
use chrono::{DateTime, Local};
use maud::{DOCTYPE, Markup, html};
use std::io;
use std::path::{MAIN_SEPARATOR, Path};
use std::time::SystemTime;
use tokio::fs;

use crate::archive::ArchiveFormat;
use crate::mount::MountConfig;

const KB: u64 = 1024;
const MB: u64 = 1024 * KB;
const GB: u64 = 1024 * MB;

/// 被列出目录的一个直接子项。
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    pub name: String,
    /// 显示名称；目录带结尾分隔符。
    pub display_name: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified: String,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct DirectoryListing {
    pub title: String,
    pub parent_url: Option<String>,
    pub zip_url: String,
    pub tar_gz_url: String,
    pub entries: Vec<DirectoryEntry>,
    pub allow_upload: bool,
}

/// 读取 `dir` 的直接子项，按名称字节序排序。
pub async fn list_directory(
    mount: &MountConfig,
    dir: &Path,
    uri: &Uri,
) -> io::Result<DirectoryListing> {
    let mut reader = fs::read_dir(dir).await?;
    let mut children = Vec::new();
    while let Some(entry) = reader.next_entry().await? {
        let metadata = entry.metadata().await?;
        children.push((entry.file_name(), metadata));
    }
    children.sort_by(|(a, _), (b, _)| a.cmp(b));

    let current = uri.path();
    let entries = children
        .into_iter()
        .map(|(file_name, metadata)| {
            let name = file_name.to_string_lossy().into_owned();
            let is_dir = metadata.is_dir();
            let display_name = if is_dir {
                format!("{name}{MAIN_SEPARATOR}")
            } else {
                name.clone()
            };
            DirectoryEntry {
                url: child_url(current, &name, is_dir),
                modified: metadata
                    .modified()
                    .map(format_timestamp)
                    .unwrap_or_default(),
                size: metadata.len(),
                display_name,
                is_dir,
                name,
            }
        })
        .collect();

    Ok(DirectoryListing {
        title: listing_title(mount.root_path(), dir),
        parent_url: parent_url(current),
        zip_url: with_query_flag(uri, ArchiveFormat::Zip.query_key()),
        tar_gz_url: with_query_flag(uri, ArchiveFormat::TarGz.query_key()),
        entries,
        allow_upload: mount.allow_upload(),
    })
}

/// 人类可读的大小：小于 1K 显示字节数，否则四舍五入到 K/M/G。
pub fn format_size(bytes: u64) -> String {
    let scaled = |unit: u64| (bytes as f64 / unit as f64).round() as u64;
    match bytes {
        b if b < KB => b.to_string(),
        b if b < MB => format!("{}K", scaled(KB)),
        b if b < GB => format!("{}M", scaled(MB)),
        _ => format!("{}G", scaled(GB)),
    }
}

pub fn format_timestamp(time: SystemTime) -> String {
    let datetime: DateTime<Local> = time.into();
    datetime.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// 子项 URL：按 URL 路径拼接，而非文件系统拼接。
pub fn child_url(current: &str, name: &str, is_dir: bool) -> String {
    let base = current.trim_end_matches('/');
    let mut url = format!("{base}/{}", urlencoding::encode(name));
    if is_dir {
        url.push('/');
    }
    url
}

/// `current` 的上一级；位于挂载根时为 `None`。
pub fn parent_url(current: &str) -> Option<String> {
    let trimmed = current.strip_suffix('/').unwrap_or(current);
    match trimmed.rfind('/') {
        Some(pos) if pos > 1 => Some(trimmed[..pos].to_string()),
        _ => None,
    }
}

/// 在当前 URL 的查询中加入 `key=true`，键按序排列。
pub fn with_query_flag(uri: &Uri, key: &str) -> String {
    let mut pairs = Query::<Vec<(String, String)>>::try_from_uri(uri)
        .map(|Query(pairs)| pairs)
        .unwrap_or_default();
    pairs.retain(|(existing, _)| existing != key);
    pairs.push((key.to_string(), "true".to_string()));
    pairs.sort_by(|(a, _), (b, _)| a.cmp(b));

    let query = pairs
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");
    format!("{}?{query}", uri.path())
}

/// 挂载根目录名拼接其下的相对路径。
pub fn listing_title(root: &Path, dir: &Path) -> String {
    let base = root
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| root.to_string_lossy().into_owned());
    let relative = dir.strip_prefix(root).unwrap_or(Path::new(""));
    if relative.as_os_str().is_empty() {
        base
    } else {
        Path::new(&base).join(relative).to_string_lossy().into_owned()
    }
}

pub fn render_listing(listing: &DirectoryListing) -> String {
    page(listing).into_string()
}

fn page(listing: &DirectoryListing) -> Markup {
    html! {
        (DOCTYPE)
        html {
            head {
                title { "Index of " (listing.title) }
                meta name="viewport" content="width=device-width, initial-scale=1";
                link rel="stylesheet" href="/static/layout/autoindex.css" type="text/css";
            }
            body {
                h1 { "Index of " (listing.title) }
                p class="archives" {
                    a href=(listing.zip_url) { "Download .zip" }
                    " | "
                    a href=(listing.tar_gz_url) { "Download .tar.gz" }
                }
                @if !listing.entries.is_empty() || listing.allow_upload || listing.parent_url.is_some() {
                    table {
                        thead {
                            th class="indexcolicon" { img src="/static/icons/blank.png" alt="[ICO]"; }
                            th class="indexcolname" { "Name" }
                            th class="indexcollastmod" { "Last modified" }
                            th class="indexcolsize" { "Size" }
                        }
                        tbody {
                            @if let Some(parent) = &listing.parent_url {
                                tr class="even" {
                                    td class="indexcolicon" {
                                        a href=(parent) { img src="/static/icons/go-previous.png" alt="[PARENTDIR]"; }
                                    }
                                    td class="indexcolname" { a href=(parent) { "Parent Directory" } }
                                    td class="indexcollastmod" { "\u{a0}" }
                                    td class="indexcolsize" { "-" }
                                }
                            }
                            @for entry in &listing.entries {
                                tr {
                                    @if entry.is_dir {
                                        td class="indexcolicon" {
                                            a href=(entry.url) { img src="/static/icons/folder.png" alt="[DIR]"; }
                                        }
                                    } @else {
                                        td class="indexcolicon" {
                                            a href=(entry.url) { img src="/static/icons/package-x-generic.png" alt="[ARC]"; }
                                        }
                                    }
                                    td class="indexcolname" { a href=(entry.url) title=(entry.name) { (entry.display_name) } }
                                    td class="indexcollastmod" { (entry.modified) }
                                    @if entry.is_dir {
                                        td class="indexcolsize" { "-" }
                                    } @else {
                                        td class="indexcolsize" { (format_size(entry.size)) }
                                    }
                                }
                            }
                        }
                    }
                }
                @if listing.allow_upload {
                    form class="upload" method="post" enctype="multipart/form-data" {
                        input type="file" name="file";
                        input type="submit" value="Upload";
                    }
                }
            }
        }
    }
}
