use std::sync::Arc;

use axum::http::{header, HeaderName, HeaderValue, Method};
use tower_governor::governor::{GovernorConfig, GovernorConfigBuilder};
use tower_governor::key_extractor::PeerIpKeyExtractor;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;

use crate::config::Config;

/// Per-IP sliding-window rate limit for the HTTP API (§4.7), expressed in
/// governor's refill-rate-plus-burst model: `RATE_LIMIT_MAX` requests per 15
/// minutes becomes one token roughly every `900 / RATE_LIMIT_MAX` seconds,
/// with a burst equal to the same count. The exempt paths (`/api/stats`,
/// `/api/health`, `/api/analytics`, `/api/interests/suggestions`,
/// `/api/poll`) are registered on the router outside the sub-router this
/// layer is mounted on, mirroring the auth-routes-get-their-own-layer
/// pattern the rate-limited surface is built on.
pub fn governor_config(config: &Config) -> Arc<GovernorConfig<PeerIpKeyExtractor>> {
    let per_seconds = (900 / config.rate_limit_per_15min.max(1)).max(1) as u64;
    let burst = config.rate_limit_per_15min.max(1);

    Arc::new(
        GovernorConfigBuilder::default()
            .per_second(per_seconds)
            .burst_size(burst)
            .finish()
            .expect("invalid governor configuration"),
    )
}

/// Security headers applied to every HTTP response (§4.7): frame/sniff/
/// referrer protections plus a CSP that only permits same-origin fetches
/// and `ws:`/`wss:` connects, and a `Permissions-Policy` that keeps camera
/// and microphone available to the page (the chat UI needs them) while
/// locking down geolocation.
pub fn security_header_layers() -> Vec<SetResponseHeaderLayer<HeaderValue>> {
    vec![
        SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ),
        SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        ),
        SetResponseHeaderLayer::if_not_present(
            header::REFERRER_POLICY,
            HeaderValue::from_static("strict-origin-when-cross-origin"),
        ),
        SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("content-security-policy"),
            HeaderValue::from_static("default-src 'self'; connect-src 'self' ws: wss:"),
        ),
        SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("permissions-policy"),
            HeaderValue::from_static("camera=*, microphone=*, geolocation=()"),
        ),
    ]
}

/// HSTS is only meaningful once TLS is terminated in front of the service;
/// applied separately so a plain-HTTP dev deployment never sends it.
pub fn hsts_layer() -> SetResponseHeaderLayer<HeaderValue> {
    SetResponseHeaderLayer::if_not_present(
        header::STRICT_TRANSPORT_SECURITY,
        HeaderValue::from_static("max-age=63072000; includeSubDomains"),
    )
}

/// Permissive in dev; origin-restricted to `config.cors_origins` otherwise.
pub fn cors_layer(config: &Config) -> CorsLayer {
    if config.is_dev || config.cors_origins.is_empty() {
        return CorsLayer::permissive();
    }

    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
}
