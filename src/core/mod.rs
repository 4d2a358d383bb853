//! Core engine: the change-to-reload pipeline and WebSocket fan-out (§2-§5).
//!
//! Modules are ordered leaf-first to mirror §2's component table:
//! [`rate_limiter`] and [`origin`] have no internal dependencies;
//! [`ring_buffer`] is a building block for [`subscriber`]; [`hub`] owns a
//! registry of subscribers; [`scheduler`] and [`watcher`] feed the
//! [`orchestrator`], which wires everything together.

pub mod types;
pub mod rate_limiter;
pub mod origin;
pub mod ring_buffer;
pub mod subscriber;
pub mod hub;
pub mod scheduler;
pub mod watcher;
pub mod orchestrator;

pub use hub::{BroadcastHub, DEFAULT_DROP_THRESHOLD};
pub use orchestrator::{ChangeClassifier, Orchestrator};
pub use origin::OriginValidator;
pub use rate_limiter::RateLimiter;
pub use ring_buffer::RingBuffer;
pub use scheduler::{BuildMetrics, BuildOperation, BuildScheduler, CacheStats};
pub use subscriber::{Subscriber, SubscriberState};
pub use types::{BuildError, BuildRequest, BuildResult, EnvelopeKind, MessageEnvelope, Priority};
pub use watcher::{FileEvent, FileEventKind, FileWatcher, NotifyFileWatcher};
