use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, App, HttpServer};
use tokio::sync::watch;
use tracing::{error, info};

use crate::app::config::connection_config::ConnAttr;
use crate::app::config::policy_config::load_policy;
use crate::app::error::AppError;
use crate::app::handlers::relay_http_handler::{self, HttpState};
use crate::app::handlers::session_pipeline::{SessionPipeline, SessionSettings};
use crate::app::security::signer::PayloadSigner;
use crate::app::service::policy_store::PolicyStore;
use crate::app::utils::connection_initializer::{
    TcpServer, DEFAULT_GRACE_PERIOD, DEFAULT_MAX_SESSIONS,
};
use crate::app::utils::event_sink::EventSink;

pub struct ServeOptions {
    pub tcp_port: u16,
    pub http_port: u16,
    pub config_path: PathBuf,
    pub key_path: Option<PathBuf>,
}

pub async fn run(opts: ServeOptions) -> Result<(), AppError> {
    let mut policy = load_policy(&opts.config_path)?;
    if let Some(key) = opts.key_path {
        // CLI key wins over the bootstrap blob.
        policy.private_key_path = Some(key);
    }

    // An unreadable key is fatal here, before the accept loop starts;
    // an absent key only downgrades responses to unsigned.
    let signer = PayloadSigner::from_config(policy.private_key_path.as_deref())?;
    let store = Arc::new(PolicyStore::new(policy, signer));

    let sink = Arc::new(EventSink::default());
    let drain = Arc::clone(&sink).spawn_drain(Duration::from_secs(5));

    let conn_cfg = ConnAttr::resolve(opts.tcp_port, opts.http_port);
    let pipeline = Arc::new(SessionPipeline::new(
        Arc::clone(&store),
        Arc::clone(&sink),
        SessionSettings::default(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let tcp_server = TcpServer::bind(
        &conn_cfg.tcp_address(),
        pipeline,
        DEFAULT_MAX_SESSIONS,
        DEFAULT_GRACE_PERIOD,
    )
    .await
    .map_err(AppError::Bind)?;
    let mut tcp_handle = tokio::spawn(tcp_server.serve(shutdown_rx.clone()));

    let http_state = web::Data::new(HttpState::new(Arc::clone(&store), DEFAULT_MAX_SESSIONS));
    let (http_host, http_port) = conn_cfg.http_address();
    let http_server = HttpServer::new(move || {
        App::new()
            .app_data(http_state.clone())
            .service(relay_http_handler::relay)
            .service(relay_http_handler::health)
    })
    .bind((http_host.as_str(), http_port))
    .map_err(AppError::Bind)?
    .disable_signals()
    .run();
    info!("HTTP relay listening on {}:{}", http_host, http_port);
    let http_handle = http_server.handle();
    let mut http_task = tokio::spawn(http_server);

    info!("Application started");

    tokio::select! {
        res = &mut tcp_handle => {
            error!("TCP relay exited unexpectedly");
            http_handle.stop(false).await;
            http_task.abort();
            drain.abort();
            res.map_err(AppError::TaskJoin)?.map_err(AppError::Io)?;
            return Err(AppError::Internal("TCP relay exited".to_string()));
        }

        res = &mut http_task => {
            error!("HTTP relay exited unexpectedly");
            let _ = shutdown_tx.send(true);
            tcp_handle.abort();
            drain.abort();
            res.map_err(AppError::TaskJoin)?.map_err(AppError::Io)?;
            return Err(AppError::Internal("HTTP relay exited".to_string()));
        }

        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    // Stop accepting; the TCP server drains in-flight sessions within
    // its grace period before returning.
    let _ = shutdown_tx.send(true);
    http_handle.stop(true).await;
    tcp_handle.await.map_err(AppError::TaskJoin)?.map_err(AppError::Io)?;
    http_task.abort();
    let _ = http_task.await;
    drain.abort();

    info!("Application shutting down");
    Ok(())
}
