//! Route Dialer
//!
//! One task per configured route URL. Connects, hands the socket to the route
//! task and reconnects with bounded exponential backoff until cancelled.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::route::run_route;
use super::{ClusterCoordinator, RouteError};
use crate::config::RouteUrl;

/// Lifecycle state of a solicited route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RouteState {
    /// Waiting to (re)connect
    Dialing,
    /// TCP connect in progress
    Connecting,
    /// Transport up, Info exchange and dedup in progress
    HandshakePending,
    Established,
    /// Dialer stopped
    Closed,
}

/// Bounded exponential backoff.
///
/// The first delay is `initial`, each further delay doubles up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            current: None,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = match self.current {
            None => self.initial,
            Some(current) => current.saturating_mul(2).min(self.max),
        };
        self.current = Some(delay);
        delay
    }

    /// Start over from `initial`
    pub fn reset(&mut self) {
        self.current = None;
    }
}

/// Solicitation context handed to the route task
#[derive(Clone)]
pub(crate) struct Solicited {
    pub url: RouteUrl,
    /// Dialer token; the route's close token is a child of it
    pub token: CancellationToken,
    state: Arc<RwLock<RouteState>>,
}

impl Solicited {
    pub fn set_state(&self, state: RouteState) {
        *self.state.write() = state;
    }
}

/// Handle to a running dial task
pub(crate) struct RouteDialer {
    token: CancellationToken,
    state: Arc<RwLock<RouteState>>,
}

impl RouteDialer {
    pub fn spawn(coord: Arc<ClusterCoordinator>, url: RouteUrl, parent: &CancellationToken) -> Self {
        let token = parent.child_token();
        let state = Arc::new(RwLock::new(RouteState::Dialing));
        let solicited = Solicited {
            url,
            token: token.clone(),
            state: state.clone(),
        };
        tokio::spawn(dial_loop(coord, solicited));
        Self { token, state }
    }

    pub fn state(&self) -> RouteState {
        *self.state.read()
    }

    /// Stop dialing and close the route this dialer established, if any
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

async fn connect(url: &RouteUrl, timeout: Duration) -> Result<TcpStream, RouteError> {
    match tokio::time::timeout(timeout, TcpStream::connect(url.connect_addr())).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(RouteError::Transport(io::Error::new(
            io::ErrorKind::TimedOut,
            "connect timed out",
        ))),
    }
}

async fn dial_loop(coord: Arc<ClusterCoordinator>, solicited: Solicited) {
    let url = solicited.url.clone();
    let token = solicited.token.clone();
    let settings = coord.settings();
    let mut backoff = Backoff::new(settings.connect_retry_initial, settings.connect_retry_max);

    debug!("RouteDialer[{}]: started", url);

    loop {
        let settings = coord.settings();
        solicited.set_state(RouteState::Connecting);

        let connected = tokio::select! {
            _ = token.cancelled() => break,
            result = connect(&url, settings.connect_timeout) => result,
        };

        let outcome = match connected {
            Ok(stream) => match stream.peer_addr() {
                Ok(remote_addr) => {
                    solicited.set_state(RouteState::HandshakePending);
                    // Runs to completion; cancellation reaches it through its close token
                    run_route(coord.clone(), stream, remote_addr, Some(solicited.clone())).await
                }
                Err(e) => Err(RouteError::Transport(e)),
            },
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => backoff.reset(),
            Err(RouteError::SelfRoute) => {
                warn!("RouteDialer[{}]: route points at this server, not retrying", url);
                coord.metrics().route_attempt_failed(RouteError::SelfRoute.reason());
                break;
            }
            Err(RouteError::DuplicateRoute(peer)) => {
                debug!("RouteDialer[{}]: already connected to {}", url, peer);
                coord.metrics().route_attempt_failed("duplicate_route");
                if let Some(existing) = coord.routes().get_by_peer(&peer) {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = existing.close_token().cancelled() => {}
                    }
                }
            }
            Err(e) => {
                debug!("RouteDialer[{}]: attempt failed: {}", url, e);
                coord.metrics().route_attempt_failed(e.reason());
            }
        }

        if token.is_cancelled() {
            break;
        }

        solicited.set_state(RouteState::Dialing);
        let delay = backoff.next_delay();
        debug!("RouteDialer[{}]: retrying in {:?}", url, delay);
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    solicited.set_state(RouteState::Closed);
    info!("RouteDialer[{}]: stopped", url);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_up_to_max() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(500));
        let delays: Vec<u64> = (0..5)
            .map(|_| backoff.next_delay().as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(5));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_max_below_initial() {
        let mut backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_schedule_on_paused_clock() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1));
        let start = tokio::time::Instant::now();
        for _ in 0..4 {
            tokio::time::sleep(backoff.next_delay()).await;
        }
        // 100 + 200 + 400 + 800
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(1500));
        assert!(elapsed < Duration::from_millis(1510));
    }
}
