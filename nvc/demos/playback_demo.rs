//! Playback Demo
//!
//! Runs the whole pipeline on one machine: the bundled signaling server, a
//! small in-process video API serving synthetic tokens, and a client decoding
//! them with the synthetic model.
//!
//! Set `NVC_API_URL` and `NVC_SERVER_URL` to play from a real deployment
//! instead. `RUST_LOG` controls logging as usual.

use anyhow::Context;
use axum::extract::{Path, Query};
use axum::routing::get;
use axum::{Json, Router};
use nvc::*;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const DEMO_FRAMES: u64 = 150;

#[derive(Deserialize)]
struct Range {
    start: u64,
    end: u64,
}

fn demo_shapes() -> Vec<Vec<usize>> {
    vec![
        vec![1, 8, 8, 8],
        vec![1, 16, 4, 4],
        vec![1, 32, 2, 2],
        vec![1, 32, 1, 1],
    ]
}

/// Token whose mean drifts with the frame index, so frames change colour
fn demo_token(index: u64) -> Vec<f32> {
    let phase = (index as f32 / DEMO_FRAMES as f32) * std::f32::consts::TAU;
    (0..32).map(|i| 0.5 + 0.4 * (phase + i as f32 * 0.1).sin()).collect()
}

async fn start_demo_api() -> anyhow::Result<String> {
    let app = Router::new()
        .route(
            "/videos",
            get(|| async {
                Json(json!({
                    "videos": [{ "id": 1, "name": "synthetic", "frame_count": DEMO_FRAMES }]
                }))
            }),
        )
        .route(
            "/videos/:id/metadata",
            get(|Path(_id): Path<u64>| async {
                Json(json!({ "frame_count": DEMO_FRAMES, "fps": 30.0 }))
            }),
        )
        .route(
            "/videos/:id/reference",
            get(|Path(_id): Path<u64>| async {
                let features: Vec<Value> = demo_shapes()
                    .iter()
                    .map(|s| json!([vec![0.1f32; s.iter().product::<usize>()]]))
                    .collect();
                Json(json!({
                    "reference_features": features,
                    "reference_token": [demo_token(0)]
                }))
            }),
        )
        .route(
            "/videos/:id/tokens",
            get(|Path(id): Path<u64>, Query(range): Query<Range>| async move {
                let mut tokens = Map::new();
                for index in range.start..=range.end.min(DEMO_FRAMES - 1) {
                    tokens.insert(index.to_string(), json!([demo_token(index)]));
                }
                Json(json!({
                    "videoId": id,
                    "tokens": tokens,
                    "metadata": { "totalFrames": DEMO_FRAMES, "processedFrames": DEMO_FRAMES }
                }))
            }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!("Demo API stopped: {}", e);
        }
    });
    Ok(format!("http://{}", addr))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    DebugLogger::init_logging()?;

    info!("🎬 Neural Video Codec Playback Demo");

    let (api_url, server_url, local_server) =
        match (std::env::var("NVC_API_URL"), std::env::var("NVC_SERVER_URL")) {
            (Ok(api), Ok(server)) => (api, server, None),
            _ => {
                let server = SignalingServer::new(SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0));
                server.add_video(1, (0..DEMO_FRAMES).map(demo_token).collect());
                let addr = server.start_background().await?;
                let api = start_demo_api().await?;
                info!("📡 Local signaling server on ws://{}", addr);
                info!("🌐 Local video API on {}", api);
                (api, format!("ws://{}", addr), Some(server))
            }
        };

    let config = CodecConfig::builder()
        .server_url(&server_url)
        .api_base_url(&api_url)
        .fps(30)
        .buffer_size(30)
        .reference_shapes(if local_server.is_some() {
            demo_shapes()
        } else {
            CodecConfig::default().reference_shapes
        })
        .build()?;

    let client = NeuralCodecClient::builder()
        .config(config)
        .model(Arc::new(SyntheticModel::new(48, 64)))
        .build()?;

    let videos = client.api().list_videos().await.context("listing videos")?;
    for video in &videos {
        info!("📼 Video {}: {} ({} frames)", video.id, video.name, video.frame_count);
    }
    let video = videos.first().context("no videos available")?;

    let mut events = client.subscribe_filtered(EventFilter::without_frames());
    client.connect(&server_url).await?;
    client.start_playback(video.id).await?;

    let watch = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(event) = events.next().await {
            match event {
                CodecEvent::MetricsUpdate(metrics) => info!(
                    "📊 fps {:.1} | buffer {:.0}% | decode {:.2} ms | dropped {}",
                    metrics.fps,
                    metrics.buffer_health,
                    metrics.processing_time_ms,
                    metrics.dropped_frames
                ),
                CodecEvent::PlaybackChanged { state, frame_index } => {
                    info!("▶️  Playback {} at frame {}", state, frame_index);
                    if state == PlaybackState::Stopped {
                        break;
                    }
                }
                CodecEvent::Error { message, code, .. } => warn!("❌ {}: {}", code, message),
                other => info!("📨 {}", other.event_type()),
            }
        }
    })
    .await;
    if watch.is_err() {
        info!("⏱️  Demo time is up");
    }

    if let Some(frame) = client.buffered_frames().last().and_then(|i| client.frame(*i)) {
        let url = frame.to_data_url()?;
        info!("🖼️  Last buffered frame as data URL, {} bytes", url.len());
    }
    info!("🔌 Connection: {:?}", client.connection_info());

    client.cleanup(false).await;
    if let Some(server) = local_server {
        server.stop();
    }
    info!("✅ Demo finished");
    Ok(())
}
