//! Control channel worker
//!
//! Holds the websocket to the backend, turns inbound `deploy` frames into
//! rollouts and forwards status frames queued by the reporter.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::deploy::orchestrator::Orchestrator;
use crate::errors::AgentError;
use crate::models::deployment::ControlMessage;
use crate::utils::{calc_exp_backoff, CooldownOptions, SecretToken};

/// Control channel worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Path of the websocket endpoint under the backend URL
    pub path: String,

    /// Reconnect backoff
    pub reconnect: CooldownOptions,

    /// Heartbeat interval
    pub heartbeat_interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            path: "/agent/ws".to_string(),
            reconnect: CooldownOptions {
                base_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(60),
                multiplier: 2.0,
            },
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// Why a connection ended
enum Disconnect {
    Shutdown,
    Lost,
}

/// Run the control channel worker
pub async fn run(
    options: &Options,
    orchestrator: Arc<Orchestrator>,
    backend_url: String,
    token: Option<SecretToken>,
    mut frames: mpsc::UnboundedReceiver<ControlMessage>,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) {
    info!("Control channel worker starting...");

    let url = match build_control_url(&backend_url, &options.path) {
        Ok(url) => url,
        Err(e) => {
            error!("Failed to build control channel URL: {}", e);
            return;
        }
    };

    let mut in_flight: JoinSet<()> = JoinSet::new();
    let mut pending: Option<ControlMessage> = None;
    let mut attempt: u32 = 0;

    loop {
        info!("Connecting to control channel: {}", url);
        let request = match connect_request(&url, token.as_ref()) {
            Ok(request) => request,
            Err(e) => {
                error!("Invalid control channel request: {}", e);
                return;
            }
        };

        match connect_async(request).await {
            Ok((ws_stream, _)) => {
                info!("Connected to control channel");
                attempt = 0;

                let disconnect = session(
                    options,
                    ws_stream,
                    &orchestrator,
                    &mut in_flight,
                    &mut frames,
                    &mut pending,
                    &mut shutdown_signal,
                )
                .await;
                if let Disconnect::Shutdown = disconnect {
                    break;
                }
            }
            Err(e) => {
                error!("Failed to connect to control channel: {}", e);
            }
        }

        let delay = calc_exp_backoff(&options.reconnect, attempt);
        attempt = attempt.saturating_add(1);
        info!("Reconnecting in {:?}...", delay);
        tokio::select! {
            _ = &mut shutdown_signal => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    if !in_flight.is_empty() {
        info!("Waiting for {} in-flight deployment(s)...", in_flight.len());
        while in_flight.join_next().await.is_some() {}
    }
    info!("Control channel worker stopped");
}

async fn session<S>(
    options: &Options,
    mut ws_stream: S,
    orchestrator: &Arc<Orchestrator>,
    in_flight: &mut JoinSet<()>,
    frames: &mut mpsc::UnboundedReceiver<ControlMessage>,
    pending: &mut Option<ControlMessage>,
    shutdown_signal: &mut Pin<Box<dyn Future<Output = ()> + Send>>,
) -> Disconnect
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    // Frame that failed to go out on the previous connection
    if let Some(frame) = pending.take() {
        if let Err(e) = send(&mut ws_stream, &frame).await {
            warn!("Failed to resend queued frame: {}", e);
            *pending = Some(frame);
            return Disconnect::Lost;
        }
    }

    let mut heartbeat_tick = tokio::time::interval(options.heartbeat_interval);

    loop {
        tokio::select! {
            _ = &mut *shutdown_signal => {
                info!("Control channel shutting down connection...");
                let _ = ws_stream.close().await;
                return Disconnect::Shutdown;
            }
            _ = heartbeat_tick.tick() => {
                if let Err(e) = send(&mut ws_stream, &ControlMessage::Ping).await {
                    warn!("Failed to send heartbeat: {}", e);
                    return Disconnect::Lost;
                }
            }
            Some(frame) = frames.recv() => {
                if let Err(e) = send(&mut ws_stream, &frame).await {
                    warn!("Failed to send status frame: {}", e);
                    *pending = Some(frame);
                    return Disconnect::Lost;
                }
            }
            Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
            msg = ws_stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = handle_message(text.as_str(), orchestrator, in_flight) {
                            if let Err(e) = send(&mut ws_stream, &reply).await {
                                warn!("Failed to reply: {}", e);
                                return Disconnect::Lost;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        warn!("Control channel closed connection");
                        return Disconnect::Lost;
                    }
                    Some(Err(e)) => {
                        error!("Control channel error: {}", e);
                        return Disconnect::Lost;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

async fn send<S>(ws_stream: &mut S, frame: &ControlMessage) -> Result<(), AgentError>
where
    S: futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let text = serde_json::to_string(frame)?;
    ws_stream
        .send(Message::Text(text.into()))
        .await
        .map_err(|e| AgentError::ControlChannelError(e.to_string()))
}

/// Dispatch one inbound frame, returning an immediate reply if any
fn handle_message(
    text: &str,
    orchestrator: &Arc<Orchestrator>,
    in_flight: &mut JoinSet<()>,
) -> Option<ControlMessage> {
    let message: ControlMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            warn!("Ignoring malformed control frame: {}", e);
            return None;
        }
    };

    match message {
        ControlMessage::Deploy(payload) => {
            let orchestrator = Arc::clone(orchestrator);
            in_flight.spawn(async move {
                if let Err(e) = orchestrator.deploy_payload(payload).await {
                    debug!("Deployment ended with {}", e.kind());
                }
            });
            None
        }
        ControlMessage::Ping => Some(ControlMessage::Pong),
        ControlMessage::Pong => {
            debug!("Control channel pong received");
            None
        }
        ControlMessage::Status(_) => {
            warn!("Unexpected inbound status frame");
            None
        }
    }
}

fn connect_request(
    url: &Url,
    token: Option<&SecretToken>,
) -> Result<http::Request<()>, AgentError> {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| AgentError::ConfigError(e.to_string()))?;
    request.headers_mut().insert(
        http::header::USER_AGENT,
        http::HeaderValue::from_static("rollout-agent"),
    );
    if let Some(token) = token.filter(|t| !t.is_empty()) {
        let value = http::HeaderValue::from_str(&format!("Bearer {}", token.expose()))
            .map_err(|e| AgentError::ConfigError(e.to_string()))?;
        request.headers_mut().insert(http::header::AUTHORIZATION, value);
    }
    Ok(request)
}

/// Websocket URL for the control channel under the backend URL
pub fn build_control_url(backend_url: &str, path: &str) -> Result<Url, AgentError> {
    let mut url = Url::parse(backend_url).map_err(|e| AgentError::ConfigError(e.to_string()))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        _ => return Err(AgentError::ConfigError("Invalid backend URL scheme".to_string())),
    };
    url.set_scheme(scheme)
        .map_err(|_| AgentError::ConfigError("Failed to set scheme".to_string()))?;

    url.set_path(&format!(
        "{}/{}",
        url.path().trim_end_matches('/'),
        path.trim_start_matches('/')
    ));
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_control_url() {
        let url = build_control_url("https://api.example.com/api/v1/", "/agent/ws").unwrap();
        assert_eq!(url.as_str(), "wss://api.example.com/api/v1/agent/ws");

        let url = build_control_url("http://localhost:8000", "agent/ws").unwrap();
        assert_eq!(url.as_str(), "ws://localhost:8000/agent/ws");

        assert!(build_control_url("ftp://example.com", "/agent/ws").is_err());
    }

    #[test]
    fn test_connect_request_carries_bearer() {
        let url = Url::parse("ws://localhost:8000/agent/ws").unwrap();
        let request = connect_request(&url, Some(&SecretToken::new("abc"))).unwrap();
        assert_eq!(
            request.headers().get(http::header::AUTHORIZATION).unwrap(),
            "Bearer abc"
        );
    }
}
