use std::sync::Arc;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::app::error::ErrorCode;
use crate::app::handlers::session_pipeline::SessionPipeline;
use crate::app::service::frame_codec::FrameCodec;
use crate::models::relay::ErrorBody;
use crate::models::wrapper::{MessageKind, Wrapper};

pub const DEFAULT_MAX_SESSIONS: usize = 50;
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// TCP front end: accepts relay connections and hands each stream to a
/// session pipeline task.
pub struct TcpServer {
    listener: TcpListener,
    pipeline: Arc<SessionPipeline>,
    max_sessions: usize,
    grace_period: Duration,
}

impl TcpServer {
    /// Bind eagerly so a bad address fails before the accept loop.
    pub async fn bind(
        address: &str,
        pipeline: Arc<SessionPipeline>,
        max_sessions: usize,
        grace_period: Duration,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        info!("TCP relay listening on {}", address);
        Ok(Self {
            listener,
            pipeline,
            max_sessions,
            grace_period,
        })
    }

    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> std::io::Result<()> {
        let limiter = Arc::new(Semaphore::new(self.max_sessions));
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("TCP relay stopping accepts");
                    break;
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!("accept error: {}", e);
                            continue;
                        }
                    };

                    let Ok(permit) = Arc::clone(&limiter).try_acquire_owned() else {
                        warn!("session ceiling reached, rejecting {}", peer);
                        sessions.spawn(reject_overflow(stream));
                        continue;
                    };

                    if let Err(e) = configure_keepalive(&stream) {
                        warn!("keepalive setup failed for {}: {}", peer, e);
                    }

                    info!("accepted connection from {}", peer);
                    let pipeline = Arc::clone(&self.pipeline);
                    let session_shutdown = shutdown.clone();
                    sessions.spawn(async move {
                        pipeline
                            .run(stream, peer.to_string(), session_shutdown)
                            .await;
                        drop(permit);
                    });
                }
            }
        }

        // Sessions see the shutdown signal themselves; give them the
        // grace period before cutting the stragglers.
        if timeout(self.grace_period, async {
            while sessions.join_next().await.is_some() {}
        })
        .await
        .is_err()
        {
            warn!("grace period expired, aborting {} sessions", sessions.len());
            sessions.abort_all();
            while sessions.join_next().await.is_some() {}
        }

        info!("TCP relay stopped");
        Ok(())
    }
}

fn configure_keepalive(stream: &tokio::net::TcpStream) -> std::io::Result<()> {
    let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(60));
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

/// Over-capacity accept: answer with one ERROR frame and hang up.
async fn reject_overflow(mut stream: tokio::net::TcpStream) {
    let codec = FrameCodec::default();
    let frame = Wrapper::new(
        [0u8; 16],
        MessageKind::Error,
        ErrorBody::new(ErrorCode::ResourceExhausted.as_str(), "session limit reached").to_bytes(),
    );
    match timeout(
        Duration::from_secs(2),
        codec.write_frame(&mut stream, &frame),
    )
    .await
    {
        Ok(Err(e)) => warn!("overflow reject write failed: {}", e),
        Err(_) => warn!("overflow reject write timed out"),
        Ok(Ok(())) => {}
    }
}
