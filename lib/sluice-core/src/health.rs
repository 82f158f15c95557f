//! Health probing.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use crate::{
    registry::{HealthCheck, ServiceDefinition},
    wait::poll_until,
};

/// Point-in-time health of a service.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HealthCheckResult {
    /// Whether the service is healthy.
    pub healthy: bool,

    /// Detail about the result, if any.
    pub message: Option<String>,
}

impl HealthCheckResult {
    /// Creates a healthy result.
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            message: None,
        }
    }

    /// Creates an unhealthy result with the given reason.
    pub fn unhealthy<S: Into<String>>(message: S) -> Self {
        Self {
            healthy: false,
            message: Some(message.into()),
        }
    }
}

impl fmt::Display for HealthCheckResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.healthy, &self.message) {
            (true, _) => f.write_str("healthy"),
            (false, Some(message)) => write!(f, "unhealthy: {}", message),
            (false, None) => f.write_str("unhealthy"),
        }
    }
}

/// Checks the health signal of a service.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probes the service once.
    async fn probe(&self, service: &ServiceDefinition) -> HealthCheckResult;
}

/// Probes HTTP and TCP health checks over the network.
pub struct NetworkProber {
    client: reqwest::Client,
    request_timeout: Duration,
}

impl NetworkProber {
    /// Creates a new `NetworkProber` whose individual probes give up after `request_timeout`.
    ///
    /// # Errors
    ///
    /// If the HTTP client cannot be built, an error is returned.
    pub fn new(request_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .redirect(reqwest::redirect::Policy::limited(3))
            .no_proxy()
            .build()?;

        Ok(Self {
            client,
            request_timeout,
        })
    }
}

#[async_trait]
impl HealthProbe for NetworkProber {
    async fn probe(&self, service: &ServiceDefinition) -> HealthCheckResult {
        let result = match &service.health_check {
            HealthCheck::Http { port, path, host } => {
                let url = format!("http://{}:{}{}", host, port, path);
                match self.client.get(&url).send().await {
                    Ok(response) if response.status().is_success() => HealthCheckResult::healthy(),
                    Ok(response) => HealthCheckResult::unhealthy(format!("{} returned {}", url, response.status())),
                    Err(e) => HealthCheckResult::unhealthy(format!("{} unreachable: {}", url, e)),
                }
            }
            HealthCheck::Tcp { port, host } => {
                match tokio::time::timeout(self.request_timeout, TcpStream::connect((host.as_str(), *port))).await {
                    Ok(Ok(_)) => HealthCheckResult::healthy(),
                    Ok(Err(e)) => HealthCheckResult::unhealthy(format!("{}:{} refused connection: {}", host, port, e)),
                    Err(_) => HealthCheckResult::unhealthy(format!("{}:{} did not accept a connection in time", host, port)),
                }
            }
        };

        debug!(service = %service.name, check = %service.health_check, result = %result, "Probed service health.");
        result
    }
}

/// Polls the service's health until it is healthy or `timeout` elapses.
///
/// A timeout is reported the same way as an explicit unhealthy signal, carrying the last probe's message.
pub async fn wait_until_healthy(
    prober: &dyn HealthProbe, service: &ServiceDefinition, interval: Duration, timeout: Duration,
) -> HealthCheckResult {
    let outcome = poll_until(interval, timeout, || async {
        let result = prober.probe(service).await;
        if result.healthy {
            Ok(result)
        } else {
            Err(result)
        }
    })
    .await;

    match outcome {
        Ok(result) => result,
        Err(timed_out) => HealthCheckResult::unhealthy(format!(
            "not healthy after {}s ({} probes): {}",
            timed_out.elapsed.as_secs(),
            timed_out.attempts,
            timed_out.last
        )),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::{
        io::{AsyncReadExt as _, AsyncWriteExt as _},
        net::TcpListener,
    };

    use super::*;
    use crate::registry::UpdateStrategy;

    fn service_with(health_check: HealthCheck) -> ServiceDefinition {
        ServiceDefinition {
            name: "svc".to_string(),
            artifact: "example/svc".to_string(),
            current_version: "1.0.0".to_string(),
            priority: 0,
            dependencies: Vec::new(),
            policy: UpdateStrategy::Rolling,
            health_check,
            version_req: None,
            last_updated: None,
        }
    }

    async fn serve_once(listener: TcpListener, status_line: &'static str) {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 1024];
        let _ = socket.read(&mut buf).await.unwrap();
        let response = format!("{}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n", status_line);
        socket.write_all(response.as_bytes()).await.unwrap();
    }

    #[tokio::test]
    async fn tcp_check() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let prober = NetworkProber::new(Duration::from_secs(2)).unwrap();

        let open = service_with(HealthCheck::Tcp {
            port,
            host: "127.0.0.1".to_string(),
        });
        assert!(prober.probe(&open).await.healthy);

        drop(listener);
        let closed = prober.probe(&open).await;
        assert!(!closed.healthy);
        assert!(closed.message.is_some());
    }

    #[tokio::test]
    async fn http_check_requires_success_status() {
        let prober = NetworkProber::new(Duration::from_secs(2)).unwrap();

        for (status_line, expected) in [("HTTP/1.1 200 OK", true), ("HTTP/1.1 503 Service Unavailable", false)] {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            let server = tokio::spawn(serve_once(listener, status_line));

            let service = service_with(HealthCheck::Http {
                port,
                path: "/health".to_string(),
                host: "127.0.0.1".to_string(),
            });
            let result = prober.probe(&service).await;
            assert_eq!(result.healthy, expected, "{}", result);
            server.await.unwrap();
        }
    }

    struct Flaky {
        healthy_after: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl HealthProbe for Flaky {
        async fn probe(&self, _service: &ServiceDefinition) -> HealthCheckResult {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.healthy_after {
                HealthCheckResult::healthy()
            } else {
                HealthCheckResult::unhealthy(format!("probe {}", n))
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn wait_until_healthy_polls() {
        let service = service_with(HealthCheck::Tcp {
            port: 1,
            host: "127.0.0.1".to_string(),
        });
        let prober = Flaky {
            healthy_after: 3,
            calls: AtomicUsize::new(0),
        };

        let result = wait_until_healthy(&prober, &service, Duration::from_secs(5), Duration::from_secs(30)).await;
        assert!(result.healthy);
        assert_eq!(prober.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_until_healthy_times_out_as_unhealthy() {
        let service = service_with(HealthCheck::Tcp {
            port: 1,
            host: "127.0.0.1".to_string(),
        });
        let prober = Flaky {
            healthy_after: usize::MAX,
            calls: AtomicUsize::new(0),
        };

        let result = wait_until_healthy(&prober, &service, Duration::from_secs(5), Duration::from_secs(20)).await;
        assert!(!result.healthy);
        let message = result.message.unwrap();
        assert!(message.starts_with("not healthy after 20s (5 probes)"), "{}", message);
        assert!(message.contains("probe 5"));
    }
}
