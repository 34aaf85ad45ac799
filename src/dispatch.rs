//! 挂载点内的请求分发。
//!
//! 每个请求先解析到挂载点并 stat，再按固定顺序路由：stat 失败、被禁用的方法、
//! 归档查询、上传、删除、目录列表、原始文件。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Query};
use axum::http::{Method, Request, StatusCode, Uri};
use axum::response::{Html, IntoResponse, Response};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info};

use crate::archive::{self, ArchiveFormat};
use crate::error::{ApiError, status_response};
use crate::files;
use crate::listing;
use crate::mount::{MountConfig, MountTable, ResolvedPath};
use crate::upload;

/// 归档查询参数；重复的键取第一个非空值。
#[derive(Debug, Default, PartialEq, Eq)]
struct ArchiveQuery {
    zip: Option<String>,
    tar_gz: Option<String>,
}

impl ArchiveQuery {
    fn from_uri(uri: &Uri) -> Self {
        let pairs = Query::<Vec<(String, String)>>::try_from_uri(uri)
            .map(|Query(pairs)| pairs)
            .unwrap_or_default();
        let first = |key: &str| {
            pairs
                .iter()
                .find(|(name, value)| name == key && !value.is_empty())
                .map(|(_, value)| value.clone())
        };
        ArchiveQuery {
            zip: first(ArchiveFormat::Zip.query_key()),
            tar_gz: first(ArchiveFormat::TarGz.query_key()),
        }
    }

    /// zip 优先检查，两者同时出现时返回 zip。
    fn requested(&self) -> Option<ArchiveFormat> {
        if self.zip.is_some() {
            Some(ArchiveFormat::Zip)
        } else if self.tar_gz.is_some() {
            Some(ArchiveFormat::TarGz)
        } else {
            None
        }
    }
}

/// 兜底处理器：为请求选择挂载点并分发。
pub async fn serve(
    Extension(mounts): Extension<Arc<MountTable>>,
    request: Request<AxumBody>,
) -> Response {
    let url_path = decode_path(request.uri().path());
    match mounts.find(&url_path) {
        Some(mount) => dispatch(&mount, request).await,
        None => status_response(StatusCode::NOT_FOUND),
    }
}

pub async fn dispatch(mount: &MountConfig, request: Request<AxumBody>) -> Response {
    let resolved = mount.resolve(&decode_path(request.uri().path()));
    info!(
        mount = %mount.root_path().display(),
        method = %request.method(),
        uri = %request.uri(),
        "request"
    );
    match route(mount, &resolved, request).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn route(
    mount: &MountConfig,
    resolved: &ResolvedPath,
    request: Request<AxumBody>,
) -> Result<Response, ApiError> {
    debug!(
        url_path = resolved.url_path.as_str(),
        os_path = %resolved.os_path.display(),
        "resolved"
    );
    let metadata = fs::metadata(&resolved.os_path).await?;
    let method = request.method().clone();

    if method == Method::DELETE && !mount.allow_delete() {
        return Err(ApiError::Forbidden);
    }
    if method == Method::POST && !mount.allow_upload() {
        return Err(ApiError::Forbidden);
    }
    if let Some(format) = ArchiveQuery::from_uri(request.uri()).requested() {
        return archive::serve_archive(&resolved.os_path, format).await;
    }

    let is_dir = metadata.is_dir();
    if mount.allow_upload() && is_dir && method == Method::POST {
        return upload::upload_to(&resolved.os_path, request).await;
    }
    if mount.allow_delete() && method == Method::DELETE {
        if is_dir {
            return Err(ApiError::Forbidden);
        }
        return files::delete_file(&resolved.os_path).await;
    }
    if is_dir {
        let listing = listing::list_directory(mount, &resolved.os_path, request.uri())
            .await
            .map_err(ApiError::internal)?;
        return Ok(Html(listing::render_listing(&listing)).into_response());
    }
    files::send_file(&resolved.os_path, &metadata, request.headers()).await
}

/// 对原始请求路径做百分号解码；非法 UTF-8 被替换而不是拒绝。
fn decode_path(raw: &str) -> String {
    String::from_utf8_lossy(&urlencoding::decode_binary(raw.as_bytes())).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use axum::http::header;
    use std::path::{Path, PathBuf};
    use tempfile::tempdir;

    use crate::upload::tests::multipart_request;

    fn make_root() -> (tempfile::TempDir, PathBuf) {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("share");
        std::fs::create_dir_all(root.join("docs")).expect("create docs");
        std::fs::write(root.join("docs").join("a.txt"), b"alpha").expect("write a.txt");
        std::fs::write(root.join("top.txt"), b"top").expect("write top.txt");
        std::fs::write(temp.path().join("secret.txt"), b"secret").expect("write secret");
        (temp, root)
    }

    fn mount(root: &Path, allow_upload: bool, allow_delete: bool) -> MountConfig {
        MountConfig::new("files", root.to_path_buf(), allow_upload, allow_delete)
    }

    fn request(method: Method, uri: &str) -> Request<AxumBody> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(AxumBody::empty())
            .expect("build request")
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body")
            .to_vec()
    }

    fn content_type(response: &Response) -> &str {
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn missing_path_is_not_found() {
        let (_temp, root) = make_root();
        let response = dispatch(&mount(&root, false, false), request(Method::GET, "/files/nope")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_bytes(response).await, b"Not Found");
    }

    #[tokio::test]
    async fn traversal_never_reaches_outside_root() {
        let (_temp, root) = make_root();
        let mount = mount(&root, false, false);
        for uri in [
            "/files/../secret.txt",
            "/files/..%2fsecret.txt",
            "/files/..%2f..%2fsecret.txt",
            "/files/docs/../../secret.txt",
            "/files/%2e%2e/secret.txt",
        ] {
            let response = dispatch(&mount, request(Method::GET, uri)).await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
        }

        let response = dispatch(&mount, request(Method::GET, "/files/docs/../top.txt")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, b"top");
    }

    #[tokio::test]
    async fn serves_raw_file_bytes() {
        let (_temp, root) = make_root();
        let response = dispatch(&mount(&root, false, false), request(Method::GET, "/files/docs/a.txt")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(content_type(&response), "text/plain");
        assert_eq!(body_bytes(response).await, b"alpha");
    }

    #[tokio::test]
    async fn directory_renders_listing() {
        let (_temp, root) = make_root();
        let response = dispatch(&mount(&root, false, false), request(Method::GET, "/files/")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(content_type(&response).starts_with("text/html"));
        let html = String::from_utf8(body_bytes(response).await).expect("utf8");
        assert!(html.contains("Index of share"));
        assert!(html.contains("href=\"/files/docs/\""));
        assert!(html.contains("href=\"/files/top.txt\""));
        assert!(html.contains("href=\"/files/?zip=true\""));
    }

    #[tokio::test]
    async fn upload_disabled_rejects_post_without_writing() {
        let (_temp, root) = make_root();
        let request = multipart_request("/files/", &[("file", Some("new.txt"), "data")]);
        let response = dispatch(&mount(&root, false, true), request).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(!root.join("new.txt").exists());
    }

    #[tokio::test]
    async fn upload_disabled_wins_over_archive_query() {
        let (_temp, root) = make_root();
        let response = dispatch(&mount(&root, false, false), request(Method::POST, "/files/?zip=true")).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn upload_enabled_writes_and_redirects() {
        let (_temp, root) = make_root();
        let request = multipart_request("/files/docs/", &[("file", Some("new.txt"), "data")]);
        let response = dispatch(&mount(&root, true, false), request).await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "/files/docs/"
        );
        assert_eq!(std::fs::read(root.join("docs").join("new.txt")).expect("read"), b"data");
    }

    #[tokio::test]
    async fn delete_disabled_leaves_file_intact() {
        let (_temp, root) = make_root();
        let response = dispatch(&mount(&root, true, false), request(Method::DELETE, "/files/top.txt")).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(std::fs::read(root.join("top.txt")).expect("read"), b"top");
    }

    #[tokio::test]
    async fn delete_enabled_removes_file_but_not_directory() {
        let (_temp, root) = make_root();
        let mount = mount(&root, false, true);

        let response = dispatch(&mount, request(Method::DELETE, "/files/top.txt")).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(!root.join("top.txt").exists());

        let response = dispatch(&mount, request(Method::DELETE, "/files/docs")).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(root.join("docs").join("a.txt").exists());
    }

    #[tokio::test]
    async fn zip_wins_when_both_archives_requested() {
        let (_temp, root) = make_root();
        for (allow_upload, allow_delete) in [(false, false), (true, true), (true, false), (false, true)] {
            let response = dispatch(
                &mount(&root, allow_upload, allow_delete),
                request(Method::GET, "/files/docs/?tar.gz=true&zip=true"),
            )
            .await;
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(content_type(&response), "application/zip");
            assert_eq!(
                response.headers().get(header::CONTENT_DISPOSITION).unwrap(),
                "attachment; filename=\"docs.zip\""
            );
            let bytes = body_bytes(response).await;
            assert_eq!(&bytes[..2], b"PK");
        }
    }

    #[tokio::test]
    async fn tar_gz_query_streams_archive() {
        let (_temp, root) = make_root();
        let response = dispatch(&mount(&root, false, false), request(Method::GET, "/files/?tar.gz=true")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(content_type(&response), "application/x-tar+gzip");
        let bytes = body_bytes(response).await;
        assert_eq!(&bytes[..2], b"\x1f\x8b");
    }

    #[tokio::test]
    async fn empty_archive_flag_is_ignored() {
        let (_temp, root) = make_root();
        let response = dispatch(&mount(&root, false, false), request(Method::GET, "/files/?zip=")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(content_type(&response).starts_with("text/html"));
    }

    #[test]
    fn repeated_query_keys_take_first_non_empty_value() {
        let query = ArchiveQuery::from_uri(&"/f/?zip=&zip=true&tar.gz=1&tar.gz=2".parse().unwrap());
        assert_eq!(query.zip.as_deref(), Some("true"));
        assert_eq!(query.tar_gz.as_deref(), Some("1"));
        assert_eq!(query.requested(), Some(ArchiveFormat::Zip));

        let query = ArchiveQuery::from_uri(&"/f/?zip=&tar.gz=".parse().unwrap());
        assert_eq!(query, ArchiveQuery::default());
        assert_eq!(query.requested(), None);
    }

    #[tokio::test]
    async fn repeated_archive_keys_still_route_to_archive() {
        let (_temp, root) = make_root();
        let mount = mount(&root, false, false);
        for uri in [
            "/files/?zip=true&zip=true",
            "/files/?zip=true&tar.gz=true&tar.gz=true",
            "/files/?tar.gz=true&zip=true&zip=false",
        ] {
            let response = dispatch(&mount, request(Method::GET, uri)).await;
            assert_eq!(response.status(), StatusCode::OK, "{uri}");
            assert_eq!(content_type(&response), "application/zip", "{uri}");
        }

        let response = dispatch(&mount, request(Method::GET, "/files/?tar.gz=true&tar.gz=true")).await;
        assert_eq!(content_type(&response), "application/x-tar+gzip");
    }

    #[tokio::test]
    async fn unknown_mount_is_not_found() {
        let (_temp, root) = make_root();
        let table = Arc::new(MountTable::new(vec![mount(&root, false, false)]));
        let response = serve(Extension(table.clone()), request(Method::GET, "/elsewhere/x")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = serve(Extension(table), request(Method::GET, "/files/top.txt")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
