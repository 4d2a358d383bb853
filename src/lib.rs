//! # preview-core
//!
//! Core engine for a component-preview development server: a debounced
//! change-to-reload pipeline, a WebSocket broadcast hub, and a service
//! orchestrator tying the two to an external component scanner/renderer.
//!
//! This crate deliberately does not own HTTP route handlers for static/UI
//! pages, the component scanner/renderer/registry, configuration-loading
//! CLI flags, or auth *strategies* -- only the pieces named in [`core`],
//! [`api`], and [`shutdown`] are this crate's responsibility. A consuming
//! binary wires those external collaborators in around this core.
//!
//! ## Example
//!
//! ```rust,no_run
//! use preview_core::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load()?;
//!     init_tracing(&config)?;
//!
//!     // Wiring the orchestrator, hub, scheduler, and app state is the
//!     // consuming binary's job; see `ShutdownCoordinator` for the piece
//!     // that ties the HTTP listener's graceful shutdown to the rest of
//!     // the core's ordered teardown (§4.10).
//!     # let (coordinator, app): (std::sync::Arc<ShutdownCoordinator>, Router) = unreachable!();
//!
//!     let server = Server::new(config);
//!     let serve = server.serve(app, {
//!         let coordinator = coordinator.clone();
//!         async move { coordinator.wait_for_signal().await }
//!     });
//!
//!     serve.await?;
//!     coordinator.teardown().await;
//!
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod core;
pub mod error;
pub mod health;
pub mod ids;
pub mod middleware;
pub mod observability;
pub mod responses;
pub mod server;
pub mod shutdown;
pub mod state;
pub mod websocket;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::api::router as api_router;
    pub use crate::config::{AuthConfig, AuthMode, Config, Environment, RateLimitConfig};
    pub use crate::core::{
        BroadcastHub, BuildError, BuildMetrics, BuildOperation, BuildRequest, BuildResult,
        BuildScheduler, CacheStats, ChangeClassifier, EnvelopeKind, FileEvent, FileEventKind,
        FileWatcher, MessageEnvelope, NotifyFileWatcher, Orchestrator, OriginValidator, Priority,
        RateLimiter, RingBuffer, Subscriber, SubscriberState,
    };
    pub use crate::error::{Error, Result};
    pub use crate::health::{health, HealthResponse};
    pub use crate::ids::{MakeTypedRequestId, RequestId, RequestIdError};
    pub use crate::middleware::{
        request_id_layer, request_id_propagation_layer, sensitive_headers_layer,
        RequestTrackingConfig, PROPAGATE_HEADERS, SENSITIVE_HEADERS,
    };
    pub use crate::observability::init_tracing;
    pub use crate::responses::{
        Accepted, Conflict, Created, FieldError, NoContent, Success, ValidationError,
    };
    pub use crate::server::Server;
    pub use crate::shutdown::ShutdownCoordinator;
    pub use crate::state::AppState;
    pub use crate::websocket::{ConnectionId, WebSocketConfig};

    pub use axum::{
        extract::{Path, Query, State},
        http::{HeaderMap, HeaderValue, StatusCode},
        response::{IntoResponse, Json, Response},
        routing::{delete, get, patch, post, put},
        Extension, Router,
    };

    pub use serde::{Deserialize, Serialize};

    pub use tracing::{debug, error, info, instrument, trace, warn, Level, Span};

    pub use tokio;

    pub use async_trait::async_trait;

    pub use thiserror::Error;
    pub use anyhow::{self, Context as AnyhowContext};

    pub use chrono::{DateTime, Duration as ChronoDuration, Utc};

    pub use uuid::Uuid;

    pub use futures::{future, stream, Future, Stream, StreamExt, TryFutureExt, TryStreamExt};

    pub use http::{Method, Uri};
}
