//! 目录列表页使用的内嵌样式表与图标。

use axum::body::Body as AxumBody;
use axum::extract::Path;
use axum::http::{HeaderMap, HeaderValue, header};
use axum::response::{IntoResponse, Response};
use rust_embed::RustEmbed;

use crate::error::ApiError;

#[derive(RustEmbed)]
#[folder = "static"]
struct StaticAssets;

/// 从内嵌资源中提供 `/static/{*path}`。
pub async fn serve_static(Path(path): Path<String>) -> Result<Response, ApiError> {
    let Some(asset) = StaticAssets::get(&path) else {
        return Err(ApiError::NotFound);
    };
    let mime = mime_guess::from_path(&path).first_or_octet_stream();
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.essence_str()).map_err(ApiError::internal)?,
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=86400"),
    );
    Ok((headers, AxumBody::from(asset.data.into_owned())).into_response())
}
