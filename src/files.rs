//! 原始文件下载与单文件删除。

use axum::body::Body as AxumBody;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use httpdate::{fmt_http_date, parse_http_date};
use std::fs::Metadata;
use std::io::SeekFrom;
use std::path::Path;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::error::ApiError;
use crate::etag::{etag_from_metadata, is_not_modified, validator_matches};

/// 发送文件，支持 Range 与条件请求。
pub async fn send_file(
    path: &Path,
    metadata: &Metadata,
    request_headers: &HeaderMap,
) -> Result<Response, ApiError> {
    let file_size = metadata.len();
    let modified = metadata.modified().ok();
    let etag = etag_from_metadata(metadata);
    let mime = mime_guess::from_path(path).first_or_octet_stream();

    let mut response_headers = HeaderMap::new();
    response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    response_headers.insert(
        header::ETAG,
        HeaderValue::from_str(&etag).map_err(ApiError::internal)?,
    );
    if let Some(modified) = modified {
        response_headers.insert(
            header::LAST_MODIFIED,
            HeaderValue::from_str(&fmt_http_date(modified)).map_err(ApiError::internal)?,
        );
    }

    if is_not_modified(request_headers, &etag, modified) {
        debug!(path = %path.display(), "not modified");
        return Ok((StatusCode::NOT_MODIFIED, response_headers).into_response());
    }

    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.essence_str()).map_err(ApiError::internal)?,
    );

    let range_allowed = match request_headers
        .get(header::IF_RANGE)
        .and_then(|value| value.to_str().ok())
    {
        Some(value) => match parse_http_date(value) {
            Ok(date) => modified.map(|ts| ts <= date).unwrap_or(false),
            Err(_) => validator_matches(value, &etag),
        },
        None => true,
    };
    let range = if range_allowed {
        parse_range(request_headers.get(header::RANGE), file_size)?
    } else {
        None
    };

    let mut file = File::open(path).await.map_err(ApiError::internal)?;

    if let Some((start, end)) = range {
        let length = end - start + 1;
        debug!(path = %path.display(), start, end, length, "range request");
        file.seek(SeekFrom::Start(start))
            .await
            .map_err(ApiError::internal)?;
        response_headers.insert(
            header::CONTENT_RANGE,
            HeaderValue::from_str(&format!("bytes {start}-{end}/{file_size}"))
                .map_err(ApiError::internal)?,
        );
        response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
        let stream = ReaderStream::new(file.take(length));
        return Ok((
            StatusCode::PARTIAL_CONTENT,
            response_headers,
            AxumBody::from_stream(stream),
        )
            .into_response());
    }

    response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(file_size));
    Ok((
        StatusCode::OK,
        response_headers,
        AxumBody::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

/// 删除单个非目录条目，不递归，不可恢复。
pub async fn delete_file(path: &Path) -> Result<Response, ApiError> {
    fs::remove_file(path).await.map_err(ApiError::internal)?;
    info!(path = %path.display(), "deleted file");
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// 解析单个 `bytes=` 范围；格式错误或多段范围被忽略，改为发送完整文件。
fn parse_range(
    value: Option<&HeaderValue>,
    file_size: u64,
) -> Result<Option<(u64, u64)>, ApiError> {
    let Some(range) = value
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().strip_prefix("bytes="))
    else {
        return Ok(None);
    };
    if range.contains(',') {
        return Ok(None);
    }
    let Some((start_part, end_part)) = range.split_once('-') else {
        return Ok(None);
    };
    let (start_part, end_part) = (start_part.trim(), end_part.trim());

    let (start, end) = if start_part.is_empty() {
        let Ok(suffix) = end_part.parse::<u64>() else {
            return Ok(None);
        };
        if suffix == 0 || file_size == 0 {
            return Err(ApiError::RangeNotSatisfiable(file_size));
        }
        (file_size.saturating_sub(suffix), file_size - 1)
    } else {
        let Ok(start) = start_part.parse::<u64>() else {
            return Ok(None);
        };
        let end = if end_part.is_empty() {
            file_size.saturating_sub(1)
        } else {
            let Ok(end) = end_part.parse::<u64>() else {
                return Ok(None);
            };
            if end < start {
                return Ok(None);
            }
            end.min(file_size.saturating_sub(1))
        };
        (start, end)
    };

    if start >= file_size || start > end {
        return Err(ApiError::RangeNotSatisfiable(file_size));
    }
    Ok(Some((start, end)))
}
