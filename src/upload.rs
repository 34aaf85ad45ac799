//! 通过 multipart 表单向目录上传单个文件。

use axum::body::Body as AxumBody;
use axum::extract::{FromRequest, Multipart};
use axum::http::Request;
use axum::response::{IntoResponse, Redirect, Response};
use std::path::Path;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::ApiError;

/// 携带上传文件的表单字段名。
pub const FILE_FIELD: &str = "file";

/// 将 `file` 字段写入 `dir`，然后重定向回目录列表。
///
/// 没有可用文件字段的表单同样重定向：浏览器在未选择文件时也会提交表单。
pub async fn upload_to(dir: &Path, request: Request<AxumBody>) -> Result<Response, ApiError> {
    let location = request.uri().to_string();
    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(ApiError::internal)?;

    while let Some(mut field) = multipart.next_field().await.map_err(ApiError::internal)? {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }
        let Some(name) = field.file_name().and_then(upload_file_name) else {
            break;
        };

        let target = dir.join(&name);
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);
        let mut file = options.open(&target).await.map_err(ApiError::internal)?;

        let mut written: u64 = 0;
        while let Some(chunk) = field.chunk().await.map_err(ApiError::internal)? {
            file.write_all(&chunk).await.map_err(ApiError::internal)?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(ApiError::internal)?;

        info!(path = %target.display(), bytes = written, "uploaded file");
        return Ok(Redirect::to(&location).into_response());
    }

    debug!(dir = %dir.display(), "upload form without file part");
    Ok(Redirect::to(&location).into_response())
}

/// 取客户端文件名的最后一段，两种分隔符均识别。
fn upload_file_name(declared: &str) -> Option<String> {
    let base = declared.rsplit(['/', '\\']).next()?;
    match base {
        "." | ".." => None,
        name if name.trim().is_empty() => None,
        name => Some(name.to_string()),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::http::{StatusCode, header};
    use tempfile::tempdir;

    const BOUNDARY: &str = "XBOUNDARYX";

    pub(crate) fn multipart_request(
        uri: &str,
        parts: &[(&str, Option<&str>, &str)],
    ) -> Request<AxumBody> {
        let mut body = Vec::new();
        for (name, filename, content) in parts {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            match filename {
                Some(filename) => body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
                    )
                    .as_bytes(),
                ),
                None => body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
                ),
            }
            body.extend_from_slice(content.as_bytes());
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(AxumBody::from(body))
            .expect("build request")
    }

    fn location(response: &Response) -> &str {
        response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
    }

    #[test]
    fn declared_names_are_reduced_to_base() {
        assert_eq!(upload_file_name("report.pdf").as_deref(), Some("report.pdf"));
        assert_eq!(upload_file_name("../../etc/passwd").as_deref(), Some("passwd"));
        assert_eq!(upload_file_name("C:\\Users\\me\\a.txt").as_deref(), Some("a.txt"));
        assert_eq!(upload_file_name(".."), None);
        assert_eq!(upload_file_name("dir/"), None);
        assert_eq!(upload_file_name(""), None);
        assert_eq!(upload_file_name("   "), None);
        assert_eq!(upload_file_name(" a.txt ").as_deref(), Some(" a.txt "));
    }

    #[tokio::test]
    async fn upload_overwrites_existing_file() {
        let temp = tempdir().expect("tempdir");
        std::fs::write(temp.path().join("a.txt"), b"old content that is longer").expect("seed");

        let request = multipart_request("/files/?sort=name", &[("file", Some("a.txt"), "new")]);
        let response = upload_to(temp.path(), request).await.expect("upload");

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&response), "/files/?sort=name");
        let content = std::fs::read(temp.path().join("a.txt")).expect("read upload");
        assert_eq!(content, b"new");
    }

    #[tokio::test]
    async fn traversal_in_declared_name_stays_in_directory() {
        let temp = tempdir().expect("tempdir");
        let target = temp.path().join("target");
        std::fs::create_dir(&target).expect("create target");

        let request = multipart_request(
            "/files/target/",
            &[("file", Some("../../escape.txt"), "payload")],
        );
        let response = upload_to(&target, request).await.expect("upload");

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(
            std::fs::read(target.join("escape.txt")).expect("read upload"),
            b"payload"
        );
        assert!(!temp.path().join("escape.txt").exists());
    }

    #[tokio::test]
    async fn missing_file_part_is_lenient_redirect() {
        let temp = tempdir().expect("tempdir");
        let request = multipart_request("/files/", &[("comment", None, "hi")]);
        let response = upload_to(temp.path(), request).await.expect("upload");

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&response), "/files/");
        assert_eq!(std::fs::read_dir(temp.path()).expect("read dir").count(), 0);
    }

    #[tokio::test]
    async fn empty_file_input_is_lenient_redirect() {
        let temp = tempdir().expect("tempdir");
        let request = multipart_request("/files/", &[("file", Some(""), "")]);
        let response = upload_to(temp.path(), request).await.expect("upload");

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(std::fs::read_dir(temp.path()).expect("read dir").count(), 0);
    }

    #[tokio::test]
    async fn non_multipart_body_is_internal_error() {
        let temp = tempdir().expect("tempdir");
        let request = Request::builder()
            .method("POST")
            .uri("/files/")
            .body(AxumBody::from("plain"))
            .expect("build request");
        let result = upload_to(temp.path(), request).await;
        assert!(matches!(result, Err(ApiError::Internal(_))));
    }
}
