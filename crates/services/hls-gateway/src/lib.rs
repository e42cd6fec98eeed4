//! RTSP → HLS Gateway
//!
//! HTTP service that turns RTSP camera feeds into HLS streams a browser can
//! play. Each start request probes the source, launches an ffmpeg process
//! writing a rolling playlist into a per-stream directory, waits for the first
//! output, and answers with the playlist URL. Status changes are broadcast to
//! SSE subscribers.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          rtsp-hls-gateway                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌──────────────────┐ ← POST /stream/start   GET /test-rtsp             │
//! │  │  HTTP API Server │ ← POST /stream/stop    GET /streams[/:id]         │
//! │  │  (axum)          │ → GET  /stream/events (SSE)                       │
//! │  └────────┬─────────┘                                                   │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  ┌──────────────────┐   ┌──────────────────┐   ┌────────────────────┐   │
//! │  │ SessionController│──▶│  Prober          │   │ Notification       │   │
//! │  │  (lifecycle)     │──▶│  Launcher        │   │ Publisher          │   │
//! │  │                  │──▶│  Readiness poll  │   │ (broadcast → SSE)  │   │
//! │  └────────┬─────────┘   └────────┬─────────┘   └────────────────────┘   │
//! │           │ registers            │ spawns                               │
//! │           ▼                      ▼                                      │
//! │  ┌──────────────────┐   ┌──────────────────────────────────────────┐    │
//! │  │ ProcessRegistry  │   │  ffmpeg → <storage.root>/<id>/index.m3u8 │    │
//! │  │ (+ durable store)│   │                                          │    │
//! │  └──────────────────┘   └──────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod probe;
pub mod readiness;
pub mod registry;
pub mod session;
pub mod transcoder;
