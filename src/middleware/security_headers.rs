//! Security headers applied to every non-upgrade HTTP response (§6).
//!
//! The static headers (nosniff, frame-options, xss-protection,
//! referrer-policy) are set via `tower_http::set_header`; the
//! Content-Security-Policy carries a nonce that must vary per response, so
//! it is generated in an `axum::middleware::from_fn` layer instead.

use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use axum::Router;
use tower_http::set_header::SetResponseHeaderLayer;
use uuid::Uuid;

use crate::config::SecurityHeadersConfig;

/// `X-XSS-Protection` value mandated by §6; legacy header but always set
/// to this exact value rather than left to configuration.
const XSS_PROTECTION_VALUE: &str = "1; mode=block";

/// Apply §6's security headers to every response the router produces.
pub fn apply_security_headers<S>(mut app: Router<S>, config: &SecurityHeadersConfig) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    if !config.enabled {
        return app;
    }

    if config.x_content_type_options {
        app = app.layer(SetResponseHeaderLayer::if_not_present(
            http::header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ));
    }

    if !config.x_frame_options.is_empty() {
        if let Ok(hv) = HeaderValue::from_str(&config.x_frame_options) {
            app = app.layer(SetResponseHeaderLayer::if_not_present(
                http::header::X_FRAME_OPTIONS,
                hv,
            ));
        }
    }

    if config.x_xss_protection {
        app = app.layer(SetResponseHeaderLayer::if_not_present(
            http::header::X_XSS_PROTECTION,
            HeaderValue::from_static(XSS_PROTECTION_VALUE),
        ));
    }

    if !config.referrer_policy.is_empty() {
        if let Ok(hv) = HeaderValue::from_str(&config.referrer_policy) {
            app = app.layer(SetResponseHeaderLayer::if_not_present(
                http::header::REFERRER_POLICY,
                hv,
            ));
        }
    }

    let csp_template = config.csp_template.clone();
    app = app.layer(axum::middleware::from_fn(move |req: Request, next: Next| {
        let csp_template = csp_template.clone();
        async move { inject_csp_nonce(&csp_template, req, next).await }
    }));

    app
}

/// Generate a fresh per-response nonce and substitute it into `csp_template`
/// (every `{nonce}` placeholder), then set the `Content-Security-Policy`
/// header on the response that comes back from `next`.
async fn inject_csp_nonce(csp_template: &str, req: Request, next: Next) -> Response {
    let nonce = Uuid::new_v4().simple().to_string();
    let mut response = next.run(req).await;

    let csp = csp_template.replace("{nonce}", &nonce);
    if let Ok(hv) = HeaderValue::from_str(&csp) {
        response
            .headers_mut()
            .insert(http::header::CONTENT_SECURITY_POLICY, hv);
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::routing::get;
    use tower::ServiceExt;

    fn app_with_headers() -> Router {
        let router = Router::new().route("/", get(|| async { "ok" }));
        apply_security_headers(router, &SecurityHeadersConfig::default())
    }

    #[tokio::test]
    async fn sets_nosniff_and_frame_options() {
        let app = app_with_headers();
        let response = app
            .oneshot(axum::http::Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(
            response.headers().get(http::header::X_CONTENT_TYPE_OPTIONS).unwrap(),
            "nosniff"
        );
        assert_eq!(response.headers().get(http::header::X_FRAME_OPTIONS).unwrap(), "DENY");
    }

    #[tokio::test]
    async fn sets_required_xss_protection_value() {
        let app = app_with_headers();
        let response = app
            .oneshot(axum::http::Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(
            response.headers().get(http::header::X_XSS_PROTECTION).unwrap(),
            XSS_PROTECTION_VALUE
        );
    }

    #[tokio::test]
    async fn csp_header_contains_a_nonce_each_time() {
        let app = app_with_headers();
        let r1 = app
            .clone()
            .oneshot(axum::http::Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let r2 = app
            .oneshot(axum::http::Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let csp1 = r1
            .headers()
            .get(http::header::CONTENT_SECURITY_POLICY)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        let csp2 = r2
            .headers()
            .get(http::header::CONTENT_SECURITY_POLICY)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(csp1.contains("nonce-"));
        assert_ne!(csp1, csp2, "each response must carry a distinct nonce");
    }

    #[tokio::test]
    async fn disabled_config_sets_nothing() {
        let router = Router::new().route("/", get(|| async { "ok" }));
        let config = SecurityHeadersConfig {
            enabled: false,
            ..SecurityHeadersConfig::default()
        };
        let app = apply_security_headers(router, &config);
        let response = app
            .oneshot(axum::http::Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.headers().get(http::header::X_FRAME_OPTIONS).is_none());
    }
}
