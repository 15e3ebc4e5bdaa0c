//! Probe execution.
//!
//! [`Prober`] is the seam between monitors and whatever actually talks to a
//! task. [`NetworkProber`] covers HTTP (2xx is healthy) and TCP (a completed
//! connect is healthy) checks.

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HOST, USER_AGENT};
use http::{Request, StatusCode};
use http_body_util::Empty;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::debug;

use convoy_core::{HealthCheckSpec, HealthProtocol, Task};

use crate::checker::HealthResult;

/// Runs one health check against one task.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, task: &Task, check: &HealthCheckSpec) -> HealthResult;
}

/// Probes tasks over the network at `host:ports[port_index]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkProber;

#[async_trait]
impl Prober for NetworkProber {
    async fn probe(&self, task: &Task, check: &HealthCheckSpec) -> HealthResult {
        let Some(address) = task.address(check.port_index) else {
            return HealthResult::unhealthy(format!(
                "task has no port at index {}",
                check.port_index
            ));
        };

        let outcome = match check.protocol {
            HealthProtocol::Http => {
                tokio::time::timeout(check.timeout(), http_status(&address, &check.path))
                    .await
                    .map(|status| match status {
                        Ok(status) if status.is_success() => Ok(()),
                        Ok(status) => Err(format!("HTTP {status}")),
                        Err(cause) => Err(cause),
                    })
            }
            HealthProtocol::Tcp => tokio::time::timeout(check.timeout(), TcpStream::connect(&address))
                .await
                .map(|connected| connected.map(drop).map_err(|e| format!("connect: {e}"))),
        };

        match outcome {
            Ok(Ok(())) => HealthResult::Healthy,
            Ok(Err(cause)) => {
                debug!(task = %task.id, %address, protocol = ?check.protocol, %cause, "health probe failed");
                HealthResult::unhealthy(cause)
            }
            Err(_) => {
                debug!(task = %task.id, %address, protocol = ?check.protocol, "health probe timed out");
                HealthResult::unhealthy("timed out")
            }
        }
    }
}

/// Status of a single HTTP/1.1 `GET path` sent to `address`.
async fn http_status(address: &str, path: &str) -> Result<StatusCode, String> {
    let stream = TcpStream::connect(address)
        .await
        .map_err(|e| format!("connect: {e}"))?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| format!("handshake: {e}"))?;
    tokio::spawn(conn);

    let request = Request::get(path)
        .header(HOST, address)
        .header(USER_AGENT, concat!("convoy-health/", env!("CARGO_PKG_VERSION")))
        .body(Empty::<Bytes>::new())
        .map_err(|e| format!("invalid request: {e}"))?;
    let response = sender
        .send_request(request)
        .await
        .map_err(|e| format!("request: {e}"))?;
    Ok(response.status())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use convoy_core::{AppId, TaskId, TaskState, Version};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn task_on(port: u16) -> Task {
        let app_id = AppId::new("/web").unwrap();
        Task {
            id: TaskId::for_app(&app_id),
            app_id,
            version: Version::new("v1"),
            host: "127.0.0.1".to_string(),
            ports: vec![port],
            staged_at: Utc::now(),
            started_at: Some(Utc::now()),
            state: TaskState::Running,
        }
    }

    /// Serves a single canned HTTP response per connection.
    async fn serve(status_line: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let response = format!("{status_line}\r\ncontent-length: 0\r\n\r\n");
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        port
    }

    #[tokio::test]
    async fn http_2xx_is_healthy() {
        let port = serve("HTTP/1.1 200 OK").await;
        let result = NetworkProber
            .probe(&task_on(port), &HealthCheckSpec::http("/healthz"))
            .await;
        assert_eq!(result, HealthResult::Healthy);
    }

    #[tokio::test]
    async fn http_5xx_is_unhealthy() {
        let port = serve("HTTP/1.1 503 Service Unavailable").await;
        let result = NetworkProber
            .probe(&task_on(port), &HealthCheckSpec::http("/healthz"))
            .await;
        assert_eq!(result, HealthResult::unhealthy("HTTP 503 Service Unavailable"));
    }

    #[tokio::test]
    async fn tcp_probe_to_closed_port_is_unhealthy() {
        let check = HealthCheckSpec {
            timeout: "200ms".to_string(),
            ..HealthCheckSpec::tcp()
        };
        let result = NetworkProber.probe(&task_on(1), &check).await;
        assert!(matches!(result, HealthResult::Unhealthy { .. }));
    }

    #[tokio::test]
    async fn tcp_probe_to_listener_is_healthy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let result = NetworkProber.probe(&task_on(port), &HealthCheckSpec::tcp()).await;
        assert_eq!(result, HealthResult::Healthy);
    }

    #[tokio::test]
    async fn missing_port_is_unhealthy() {
        let check = HealthCheckSpec {
            port_index: 3,
            ..HealthCheckSpec::tcp()
        };
        let result = NetworkProber.probe(&task_on(8080), &check).await;
        assert_eq!(
            result,
            HealthResult::unhealthy("task has no port at index 3")
        );
    }
}
