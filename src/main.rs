//! axo-index 服务入口。
//!
//! 通过 HTTP 提供一个或多个目录：目录列表、整个目录的即时 zip 与 tar.gz 打包，
//! 以及按挂载点开启的上传与删除。

mod archive;
mod assets;
mod config;
mod dispatch;
mod error;
mod etag;
mod files;
mod http;
mod listing;
mod logging;
mod mount;
mod tls;
mod upload;

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::get;
use axum::{Router, middleware};
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span};

use crate::config::Args;
use crate::http::{build_cors_layer, resolve_client_ip};
use crate::mount::MountTable;

shadow!(build);

#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let mounts = args
        .mounts
        .iter()
        .cloned()
        .map(|spec| spec.into_config())
        .collect::<Result<Vec<_>, _>>()?;
    let mounts = Arc::new(MountTable::new(mounts));
    for mount in mounts.iter() {
        info!(
            route = mount.route(),
            root = %mount.root_path().display(),
            upload = mount.allow_upload(),
            delete = mount.allow_delete(),
            "mounted"
        );
    }

    let body_limit = match args.upload_max_size {
        0 => DefaultBodyLimit::disable(),
        limit => DefaultBodyLimit::max(usize::try_from(limit).unwrap_or(usize::MAX)),
    };

    let mut app = Router::new()
        .route("/static/{*path}", get(assets::serve_static))
        .fallback(dispatch::serve)
        .layer(body_limit)
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.ip());
                    let client_ip = resolve_client_ip(request.headers(), connect_ip)
                        .map(|ip| ip.to_string())
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(mounts));

    if let Some(cors_layer) = build_cors_layer(args.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let http_addr = SocketAddr::new(host, args.http_port);
    let handle = Handle::new();

    let https = match args.https_port {
        Some(port) => {
            let tls_config =
                tls::build_rustls_config(args.tls_cert.as_deref(), args.tls_key.as_deref(), host)
                    .await?;
            Some((SocketAddr::new(host, port), tls_config))
        }
        None => None,
    };

    info!("starting HTTP server at {}", http_addr);
    let http_server = axum_server::bind(http_addr)
        .handle(handle.clone())
        .serve(app.clone().into_make_service_with_connect_info::<SocketAddr>());

    let https_server = async {
        match https {
            Some((https_addr, tls_config)) => {
                info!("starting HTTPS server at {}", https_addr);
                axum_server::bind_rustls(https_addr, tls_config)
                    .handle(handle.clone())
                    .serve(app.into_make_service_with_connect_info::<SocketAddr>())
                    .await
            }
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        result = http_server => result?,
        result = https_server => result?,
        _ = shutdown_signal(handle.clone()) => {}
    }

    Ok(())
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("received termination signal, shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
