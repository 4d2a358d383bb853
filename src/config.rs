//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following precedence (highest to lowest):
//! 1. Environment variables (prefix: PREVIEW_)
//! 2. Current working directory: ./config.toml
//! 3. XDG config directory: ~/.config/preview-core/{service_name}/config.toml
//! 4. System directory: /etc/preview-core/{service_name}/config.toml
//! 5. Default values

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub service: ServiceConfig,
    pub scan_paths: Vec<PathBuf>,
    pub environment: Environment,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub middleware: MiddlewareConfig,
    #[serde(default)]
    pub security_headers: SecurityHeadersConfig,
    #[serde(default)]
    pub websocket: crate::websocket::WebSocketConfig,
}

/// Deployment environment. Controls origin-validation laxity and CORS mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn is_development(&self) -> bool {
        matches!(self, Environment::Development)
    }
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,

    /// Listen interface
    #[serde(default = "default_host")]
    pub host: String,

    /// Listen port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Rate limiting configuration, applied to WebSocket connect attempts (§4.1
/// token bucket) and, per-subscriber, to inbound message rate (sliding window).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,

    #[serde(default = "default_burst_size")]
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_minute: default_requests_per_minute(),
            burst_size: default_burst_size(),
        }
    }
}

/// Authentication configuration. The core only consumes a boolean decision
/// from an external authorizer; these fields describe how that decision is
/// reached, not the authorizer's implementation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_auth_mode")]
    pub mode: AuthMode,

    #[serde(default)]
    pub localhost_bypass: bool,

    #[serde(default)]
    pub allowed_ips: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: AuthMode::None,
            localhost_bypass: false,
            allowed_ips: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    None,
    Basic,
    Token,
}

fn default_auth_mode() -> AuthMode {
    AuthMode::None
}

/// Durations that gate build/subscriber/shutdown behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_build_timeout_secs")]
    pub build_timeout_secs: u64,

    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl TimeoutsConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            build_timeout_secs: default_build_timeout_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

/// HTTP middleware configuration (body limits, compression, CORS mode).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiddlewareConfig {
    #[serde(default)]
    pub request_tracking: RequestTrackingConfig,

    #[serde(default = "default_body_limit_mb")]
    pub body_limit_mb: usize,

    #[serde(default = "default_true")]
    pub catch_panic: bool,

    #[serde(default = "default_true")]
    pub compression: bool,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            request_tracking: RequestTrackingConfig::default(),
            body_limit_mb: default_body_limit_mb(),
            catch_panic: true,
            compression: true,
        }
    }
}

/// Request tracking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestTrackingConfig {
    #[serde(default = "default_true")]
    pub request_id_enabled: bool,

    #[serde(default = "default_request_id_header")]
    pub request_id_header: String,

    #[serde(default = "default_true")]
    pub propagate_headers: bool,

    #[serde(default = "default_true")]
    pub mask_sensitive_headers: bool,
}

impl Default for RequestTrackingConfig {
    fn default() -> Self {
        Self {
            request_id_enabled: true,
            request_id_header: default_request_id_header(),
            propagate_headers: true,
            mask_sensitive_headers: true,
        }
    }
}

/// Security headers applied to every non-upgrade HTTP response (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityHeadersConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_true")]
    pub x_content_type_options: bool,

    #[serde(default = "default_x_frame_options")]
    pub x_frame_options: String,

    #[serde(default = "default_true")]
    pub x_xss_protection: bool,

    #[serde(default = "default_referrer_policy")]
    pub referrer_policy: String,

    /// Content-Security-Policy template; `{nonce}` is substituted per response.
    #[serde(default = "default_csp_template")]
    pub csp_template: String,
}

impl Default for SecurityHeadersConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            x_content_type_options: true,
            x_frame_options: default_x_frame_options(),
            x_xss_protection: true,
            referrer_policy: default_referrer_policy(),
            csp_template: default_csp_template(),
        }
    }
}

// Default value functions

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8787
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_requests_per_minute() -> u32 {
    120
}

fn default_burst_size() -> u32 {
    60
}

fn default_idle_timeout_secs() -> u64 {
    60
}

fn default_build_timeout_secs() -> u64 {
    10
}

fn default_shutdown_timeout_secs() -> u64 {
    5
}

fn default_body_limit_mb() -> usize {
    1
}

fn default_request_id_header() -> String {
    "x-request-id".to_string()
}

fn default_x_frame_options() -> String {
    "DENY".to_string()
}

fn default_referrer_policy() -> String {
    "strict-origin-when-cross-origin".to_string()
}

fn default_csp_template() -> String {
    "default-src 'self'; script-src 'self' 'nonce-{nonce}'; style-src 'self' 'nonce-{nonce}'".to_string()
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// Searches for config files in this order (first found is used):
    /// 1. Current working directory: ./config.toml
    /// 2. XDG config directory: ~/.config/preview-core/{service_name}/config.toml
    /// 3. System directory: /etc/preview-core/{service_name}/config.toml
    ///
    /// Environment variables (PREVIEW_ prefix) override all file-based configs.
    pub fn load() -> Result<Self> {
        let service_name = std::env::current_exe()
            .ok()
            .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "preview-core".to_string());

        Self::load_for_service(&service_name)
    }

    pub fn load_for_service(service_name: &str) -> Result<Self> {
        let config_paths = Self::find_config_paths(service_name);

        tracing::debug!("Searching for config files in order:");
        for path in &config_paths {
            tracing::debug!("  - {}", path.display());
        }

        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        for path in config_paths.iter().rev() {
            if path.exists() {
                tracing::info!("Loading configuration from: {}", path.display());
                figment = figment.merge(Toml::file(path));
            }
        }

        figment = figment.merge(Env::prefixed("PREVIEW_").split("_"));

        let config = figment.extract()?;
        Ok(config)
    }

    /// Load configuration from a specific file, bypassing XDG directories.
    pub fn load_from(path: &str) -> Result<Self> {
        let config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("PREVIEW_").split("_"))
            .extract()?;

        Ok(config)
    }

    fn find_config_paths(service_name: &str) -> Vec<PathBuf> {
        let mut paths = Vec::new();

        paths.push(PathBuf::from("config.toml"));

        let xdg_dirs = xdg::BaseDirectories::with_prefix("preview-core");
        let config_file_path = Path::new(service_name).join("config.toml");
        if let Ok(path) = xdg_dirs.place_config_file(&config_file_path) {
            paths.push(path);
        }

        paths.push(PathBuf::from("/etc/preview-core").join(service_name).join("config.toml"));

        paths
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                name: "preview-core".to_string(),
                host: default_host(),
                port: default_port(),
                log_level: default_log_level(),
                timeout_secs: default_timeout(),
            },
            scan_paths: Vec::new(),
            environment: Environment::Development,
            allowed_origins: Vec::new(),
            rate_limit: RateLimitConfig::default(),
            auth: AuthConfig::default(),
            timeouts: TimeoutsConfig::default(),
            middleware: MiddlewareConfig::default(),
            security_headers: SecurityHeadersConfig::default(),
            websocket: crate::websocket::WebSocketConfig::default(),
        }
    }
}
