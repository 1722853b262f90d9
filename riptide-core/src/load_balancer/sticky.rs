//! Sticky sessions: pin a client to one origin via a cookie.
//!
//! The cookie shape is a client-compatibility contract and must not change:
//! name `styx_origin_<applicationId>`, value = origin id, path `/`,
//! HttpOnly, configurable Max-Age.

use std::sync::Arc;
use std::time::Duration;

use crate::http::{request_cookie_value, HttpRequest};
use crate::load_balancer::{LoadBalancer, LoadBalancingContext};
use crate::origin::AppId;
use crate::remote_host::RemoteHost;

/// The sticky-session cookie name for an application.
pub fn cookie_name(app_id: &AppId) -> String {
    format!("styx_origin_{app_id}")
}

/// The value of the application's sticky cookie on a request, if present.
pub fn requested_origin(app_id: &AppId, request: &HttpRequest) -> Option<String> {
    request_cookie_value(request, &cookie_name(app_id))
}

/// Renders the `Set-Cookie` header value pinning a client to `origin_id`.
pub fn set_cookie_header(app_id: &AppId, origin_id: &str, max_age: Duration) -> String {
    format!(
        "{}={}; Max-Age={}; Path=/; HttpOnly",
        cookie_name(app_id),
        origin_id,
        max_age.as_secs()
    )
}

/// Decorates another strategy with sticky-session preference.
///
/// When the request carries the application's sticky cookie and its value
/// names an origin currently in the active snapshot, the selection is exactly
/// that host and the delegate is bypassed. In every other case the delegate's
/// selection is returned unchanged.
pub struct StickySessionStrategy {
    delegate: Arc<dyn LoadBalancer>,
}

impl StickySessionStrategy {
    /// Wraps a delegate strategy.
    pub fn new(delegate: Arc<dyn LoadBalancer>) -> Self {
        Self { delegate }
    }

    fn pinned_host(&self, context: &LoadBalancingContext<'_>) -> Option<RemoteHost> {
        let request = context.request?;
        let wanted = requested_origin(context.app_id, request)?;
        self.delegate
            .snapshot()
            .into_iter()
            .find(|host| host.origin().id().as_str() == wanted)
    }
}

impl LoadBalancer for StickySessionStrategy {
    fn choose(&self, context: &LoadBalancingContext<'_>) -> Vec<RemoteHost> {
        match self.pinned_host(context) {
            Some(host) => vec![host],
            None => self.delegate.choose(context),
        }
    }

    fn snapshot(&self) -> Vec<RemoteHost> {
        self.delegate.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::test_support::host;
    use crate::load_balancer::Preferences;
    use bytes::Bytes;

    struct FixedDelegate(Vec<RemoteHost>);

    impl LoadBalancer for FixedDelegate {
        fn choose(&self, _context: &LoadBalancingContext<'_>) -> Vec<RemoteHost> {
            self.0.clone()
        }

        fn snapshot(&self) -> Vec<RemoteHost> {
            self.0.clone()
        }
    }

    fn request_with_cookie(header: &str) -> HttpRequest {
        http::Request::builder()
            .uri("/")
            .header(http::header::COOKIE, header)
            .body(Bytes::new())
            .unwrap()
    }

    fn three_hosts() -> Vec<RemoteHost> {
        vec![
            host("webapp", "o0", 9000),
            host("webapp", "o1", 9001),
            host("webapp", "o2", 9002),
        ]
    }

    fn choose(strategy: &StickySessionStrategy, request: &HttpRequest) -> Vec<RemoteHost> {
        let app_id = AppId::new("webapp");
        let preferences = Preferences::default();
        let context = LoadBalancingContext {
            app_id: &app_id,
            request: Some(request),
            preferences: &preferences,
        };
        strategy.choose(&context)
    }

    #[test]
    fn cookie_naming_active_origin_pins_selection() {
        let hosts = three_hosts();
        let strategy = StickySessionStrategy::new(Arc::new(FixedDelegate(hosts.clone())));
        let request = request_with_cookie("styx_origin_webapp=o1");

        let chosen = choose(&strategy, &request);
        assert_eq!(chosen.len(), 1);
        assert_eq!(chosen[0].origin().id().as_str(), "o1");
        // The delegate's snapshot is untouched.
        assert_eq!(strategy.snapshot().len(), 3);
    }

    #[test]
    fn cookie_naming_absent_origin_delegates_unchanged() {
        let hosts = three_hosts();
        let strategy = StickySessionStrategy::new(Arc::new(FixedDelegate(hosts)));
        let request = request_with_cookie("styx_origin_webapp=gone");

        let chosen = choose(&strategy, &request);
        assert_eq!(chosen.len(), 3);
    }

    #[test]
    fn no_cookie_delegates_unchanged() {
        let hosts = three_hosts();
        let strategy = StickySessionStrategy::new(Arc::new(FixedDelegate(hosts)));
        let request = request_with_cookie("unrelated=1");

        assert_eq!(choose(&strategy, &request).len(), 3);
    }

    #[test]
    fn cookie_shape_is_preserved() {
        let header = set_cookie_header(&AppId::new("webapp"), "o1", Duration::from_secs(3600));
        assert_eq!(header, "styx_origin_webapp=o1; Max-Age=3600; Path=/; HttpOnly");
    }
}
