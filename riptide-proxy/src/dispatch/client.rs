//! The retrying backend service client.

use std::sync::Arc;
use std::time::Duration;

use http::header::{HeaderValue, SET_COOKIE};
use tokio::time::timeout;
use tracing::{debug, warn};

use riptide_core::errors::{DispatchError, TransportError, TransportErrorKind};
use riptide_core::http::{HttpRequest, HttpResponse};
use riptide_core::load_balancer::metric::InFlightGuard;
use riptide_core::load_balancer::{sticky, LoadBalancer, LoadBalancingContext, Preferences};
use riptide_core::origin::{AppId, OriginId};
use riptide_core::remote_host::RemoteHost;
use riptide_core::retry::{RetryContext, RetryPolicy};
use riptide_core::service::BackendService;

use crate::metrics::MetricsSink;

/// `http::Request` is not `Clone`; each attempt gets a shallow copy sharing
/// the cheap `Bytes` body.
fn clone_request(request: &HttpRequest) -> HttpRequest {
    let mut cloned = http::Request::new(request.body().clone());
    *cloned.method_mut() = request.method().clone();
    *cloned.uri_mut() = request.uri().clone();
    *cloned.version_mut() = request.version();
    *cloned.headers_mut() = request.headers().clone();
    cloned
}

/// One attempt's bookkeeping: the in-flight counter and outcome metrics.
///
/// Dropping an unfinished attempt records a cancellation; the in-flight
/// counter is decremented either way, so an abandoned request never inflates
/// an origin's apparent load.
struct Attempt {
    in_flight: InFlightGuard,
    metrics: Arc<dyn MetricsSink>,
    app: AppId,
    origin: OriginId,
    finished: bool,
}

impl Attempt {
    fn start(host: &RemoteHost, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            in_flight: InFlightGuard::track(host.metric().clone()),
            metrics,
            app: host.origin().application().clone(),
            origin: host.origin().id().clone(),
            finished: false,
        }
    }

    fn succeed(mut self, status: u16) {
        self.finished = true;
        self.in_flight.observe_latency();
        let elapsed = self.in_flight.started().elapsed();
        // Responses are aggregated before they reach us, so full-response
        // latency stands in for time-to-first-byte until bodies stream.
        self.metrics
            .request_success(&self.app, &self.origin, elapsed, elapsed);
        self.metrics.response_status(&self.app, &self.origin, status);
    }

    fn fail(mut self) {
        self.finished = true;
        self.metrics.request_error(&self.app, &self.origin);
    }
}

impl Drop for Attempt {
    fn drop(&mut self) {
        if !self.finished {
            self.metrics.request_cancelled(&self.app, &self.origin);
        }
    }
}

/// Proxies requests to one application's origins: select, send, and on a
/// failed attempt consult the retry policy for the next candidate.
pub struct BackendServiceClient {
    service: BackendService,
    load_balancer: Arc<dyn LoadBalancer>,
    retry_policy: Arc<dyn RetryPolicy>,
    metrics: Arc<dyn MetricsSink>,
}

impl BackendServiceClient {
    /// Assembles a client. Pass a sticky-session decorated balancer when the
    /// service has sticky sessions enabled; this client only adds the cookie
    /// to responses.
    pub fn new(
        service: BackendService,
        load_balancer: Arc<dyn LoadBalancer>,
        retry_policy: Arc<dyn RetryPolicy>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            service,
            load_balancer,
            retry_policy,
            metrics,
        })
    }

    /// The service this client proxies for.
    pub fn service(&self) -> &BackendService {
        &self.service
    }

    fn rewrite(&self, mut request: HttpRequest) -> HttpRequest {
        let rewritten = {
            let path = request.uri().path();
            self.service
                .rewrites()
                .iter()
                .find_map(|rule| rule.apply(path))
        };
        if let Some(path) = rewritten {
            let path_and_query = match request.uri().query() {
                Some(query) => format!("{path}?{query}"),
                None => path,
            };
            match path_and_query.parse::<http::Uri>() {
                Ok(uri) => *request.uri_mut() = uri,
                Err(error) => {
                    warn!(app = %self.service.id(), %error, "rewritten path is not a valid uri")
                }
            }
        }
        request
    }

    fn add_sticky_cookie(&self, response: &mut HttpResponse, origin: &OriginId) {
        let config = self.service.sticky_session_config();
        if !config.enabled {
            return;
        }
        let header = sticky::set_cookie_header(
            self.service.id(),
            origin.as_str(),
            Duration::from_secs(config.timeout_seconds),
        );
        if let Ok(value) = HeaderValue::from_str(&header) {
            response.headers_mut().append(SET_COOKIE, value);
        }
    }

    /// Dispatches one logical request.
    ///
    /// Retries run only while the policy both permits another attempt and
    /// names a next origin; either signal alone terminates the loop.
    pub async fn send(&self, request: HttpRequest) -> Result<HttpResponse, DispatchError> {
        let request = self.rewrite(request);
        let app_id = self.service.id().clone();
        let preferences = Preferences::default();

        let mut host = {
            let context = LoadBalancingContext {
                app_id: &app_id,
                request: Some(&request),
                preferences: &preferences,
            };
            self.load_balancer
                .choose(&context)
                .into_iter()
                .next()
                .ok_or_else(|| DispatchError::NoAvailableHosts(app_id.clone()))?
        };

        let mut retry_context = RetryContext::new(app_id.clone());
        loop {
            let attempt = Attempt::start(&host, self.metrics.clone());
            let result = match timeout(
                self.service.response_timeout(),
                host.client().send(clone_request(&request)),
            )
            .await
            {
                Ok(result) => result,
                Err(_elapsed) => Err(TransportError::new(
                    app_id.clone(),
                    host.origin().id().clone(),
                    TransportErrorKind::ResponseTimeout,
                )),
            };

            match result {
                Ok(mut response) => {
                    attempt.succeed(response.status().as_u16());
                    self.add_sticky_cookie(&mut response, host.origin().id());
                    return Ok(response);
                }
                Err(error) => {
                    attempt.fail();
                    debug!(
                        app = %app_id,
                        origin = %host.origin().id(),
                        %error,
                        attempt = retry_context.current_retry_count() + 1,
                        "attempt failed"
                    );
                    retry_context.attempt_failed(host.clone(), error.clone());
                    let outcome = self.retry_policy.evaluate(
                        &retry_context,
                        self.load_balancer.as_ref(),
                        &preferences,
                    );
                    match outcome.next_origin() {
                        Some(next) if outcome.should_retry() => {
                            retry_context.begin_retry();
                            tokio::time::sleep(outcome.retry_interval()).await;
                            host = next.clone();
                        }
                        _ => return Err(DispatchError::Transport(error)),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::InProcessMetrics;
    use bytes::Bytes;
    use http::{Request, Response};
    use riptide_core::http::SendFuture;
    use riptide_core::load_balancer::metric::{LoadBalancingMetric, PeakEwma};
    use riptide_core::origin::Origin;
    use riptide_core::remote_host::HostClient;
    use riptide_core::retry::RetryNTimes;
    use riptide_core::service::{RewriteRule, StickySessionConfig};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    enum Scripted {
        Respond(u16),
        FailRetryable,
        Hang,
    }

    struct ScriptedClient {
        script: Mutex<VecDeque<Scripted>>,
        sends: AtomicUsize,
        seen_paths: Mutex<Vec<String>>,
        app: AppId,
        origin: OriginId,
    }

    impl ScriptedClient {
        fn new(app: &str, origin: &str, script: Vec<Scripted>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                sends: AtomicUsize::new(0),
                seen_paths: Mutex::new(Vec::new()),
                app: AppId::new(app),
                origin: OriginId::new(origin),
            })
        }
    }

    impl HostClient for ScriptedClient {
        fn send(&self, request: HttpRequest) -> SendFuture {
            self.sends.fetch_add(1, Ordering::SeqCst);
            self.seen_paths
                .lock()
                .unwrap()
                .push(request.uri().path().to_owned());
            let step = self.script.lock().unwrap().pop_front();
            let app = self.app.clone();
            let origin = self.origin.clone();
            Box::pin(async move {
                match step {
                    Some(Scripted::Respond(status)) => {
                        let mut response = Response::new(Bytes::from_static(b"ok"));
                        *response.status_mut() = http::StatusCode::from_u16(status).unwrap();
                        Ok(response)
                    }
                    Some(Scripted::FailRetryable) => Err(TransportError::new(
                        app,
                        origin,
                        TransportErrorKind::ConnectFailure("connection refused".into()),
                    )),
                    Some(Scripted::Hang) | None => std::future::pending().await,
                }
            })
        }

        fn close(&self) {}
    }

    struct FixedBalancer {
        hosts: Vec<RemoteHost>,
    }

    impl LoadBalancer for FixedBalancer {
        fn choose(&self, _context: &LoadBalancingContext<'_>) -> Vec<RemoteHost> {
            self.hosts.clone()
        }

        fn snapshot(&self) -> Vec<RemoteHost> {
            self.hosts.clone()
        }
    }

    fn host_with(app: &str, id: &str, client: Arc<ScriptedClient>) -> (RemoteHost, Arc<PeakEwma>) {
        let origin = Origin::builder(app, id)
            .host("localhost")
            .port(8080)
            .build()
            .unwrap();
        let metric = Arc::new(PeakEwma::default());
        (
            RemoteHost::new(Arc::new(origin), client, metric.clone()),
            metric,
        )
    }

    fn service(app: &str) -> BackendService {
        BackendService::builder(app).build().unwrap()
    }

    fn request(path: &str) -> HttpRequest {
        Request::builder().uri(path).body(Bytes::new()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn one_retry_then_terminal_error_with_max_attempts_one() {
        let c0 = ScriptedClient::new("webapp", "o0", vec![Scripted::FailRetryable]);
        let c1 = ScriptedClient::new("webapp", "o1", vec![Scripted::FailRetryable]);
        let c2 = ScriptedClient::new("webapp", "o2", vec![]);
        let (h0, _) = host_with("webapp", "o0", c0.clone());
        let (h1, _) = host_with("webapp", "o1", c1.clone());
        let (h2, _) = host_with("webapp", "o2", c2.clone());
        let client = BackendServiceClient::new(
            service("webapp"),
            Arc::new(FixedBalancer {
                hosts: vec![h0, h1, h2],
            }),
            Arc::new(RetryNTimes::new(1)),
            Arc::new(InProcessMetrics::new()),
        );

        let error = client.send(request("/")).await.unwrap_err();
        assert!(matches!(error, DispatchError::Transport(_)));
        assert_eq!(c0.sends.load(Ordering::SeqCst), 1);
        assert_eq!(c1.sends.load(Ordering::SeqCst), 1);
        assert_eq!(c2.sends.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn success_carries_the_sticky_cookie_when_enabled() {
        let c0 = ScriptedClient::new("webapp", "o0", vec![Scripted::Respond(200)]);
        let (h0, _) = host_with("webapp", "o0", c0);
        let sticky_service = BackendService::builder("webapp")
            .sticky_session_config(StickySessionConfig {
                enabled: true,
                timeout_seconds: 86_400,
            })
            .build()
            .unwrap();
        let client = BackendServiceClient::new(
            sticky_service,
            Arc::new(FixedBalancer { hosts: vec![h0] }),
            Arc::new(RetryNTimes::new(1)),
            Arc::new(InProcessMetrics::new()),
        );

        let response = client.send(request("/")).await.unwrap();
        assert_eq!(
            response.headers().get(SET_COOKIE).unwrap(),
            "styx_origin_webapp=o0; Max-Age=86400; Path=/; HttpOnly"
        );
    }

    #[tokio::test]
    async fn no_candidates_is_a_terminal_no_hosts_error() {
        let client = BackendServiceClient::new(
            service("webapp"),
            Arc::new(FixedBalancer { hosts: vec![] }),
            Arc::new(RetryNTimes::new(3)),
            Arc::new(InProcessMetrics::new()),
        );
        let error = client.send(request("/")).await.unwrap_err();
        assert!(matches!(error, DispatchError::NoAvailableHosts(app) if app.as_str() == "webapp"));
    }

    #[tokio::test(start_paused = true)]
    async fn response_timeout_is_not_retried() {
        let c0 = ScriptedClient::new("webapp", "o0", vec![Scripted::Hang]);
        let c1 = ScriptedClient::new("webapp", "o1", vec![Scripted::Respond(200)]);
        let (h0, _) = host_with("webapp", "o0", c0);
        let (h1, _) = host_with("webapp", "o1", c1.clone());
        let slow_service = BackendService::builder("webapp")
            .response_timeout_millis(100)
            .build()
            .unwrap();
        let client = BackendServiceClient::new(
            slow_service,
            Arc::new(FixedBalancer {
                hosts: vec![h0, h1],
            }),
            Arc::new(RetryNTimes::new(3)),
            Arc::new(InProcessMetrics::new()),
        );

        let error = client.send(request("/")).await.unwrap_err();
        match error {
            DispatchError::Transport(transport) => {
                assert_eq!(*transport.kind(), TransportErrorKind::ResponseTimeout);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(c1.sends.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rewrites_apply_before_the_request_reaches_the_origin() {
        let c0 = ScriptedClient::new("webapp", "o0", vec![Scripted::Respond(200)]);
        let (h0, _) = host_with("webapp", "o0", c0.clone());
        let rewriting_service = BackendService::builder("webapp")
            .rewrites(vec![RewriteRule {
                url_pattern: "/api/".to_owned(),
                replacement: "/".to_owned(),
            }])
            .build()
            .unwrap();
        let client = BackendServiceClient::new(
            rewriting_service,
            Arc::new(FixedBalancer { hosts: vec![h0] }),
            Arc::new(RetryNTimes::new(1)),
            Arc::new(InProcessMetrics::new()),
        );

        client.send(request("/api/users?id=1")).await.unwrap();
        assert_eq!(*c0.seen_paths.lock().unwrap(), vec!["/users"]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_decrements_the_in_flight_counter() {
        let c0 = ScriptedClient::new("webapp", "o0", vec![Scripted::Hang]);
        let (h0, metric) = host_with("webapp", "o0", c0);
        let metrics = Arc::new(InProcessMetrics::new());
        let long_service = BackendService::builder("webapp")
            .response_timeout_millis(3_600_000)
            .build()
            .unwrap();
        let client = BackendServiceClient::new(
            long_service,
            Arc::new(FixedBalancer { hosts: vec![h0] }),
            Arc::new(RetryNTimes::new(1)),
            metrics.clone(),
        );

        let in_flight = tokio::spawn({
            let client = client.clone();
            async move { client.send(request("/")).await }
        });
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(metric.ongoing_activities(), 1);

        in_flight.abort();
        let _ = in_flight.await;
        assert_eq!(metric.ongoing_activities(), 0);
        let counters = metrics.origin(&AppId::new("webapp"), &OriginId::new("o0"));
        assert_eq!(counters.cancelled(), 1);
        assert_eq!(counters.error(), 0);
    }
}
