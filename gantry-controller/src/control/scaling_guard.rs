use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
struct InFlight {
    desired: usize,
    started: Instant,
}

/// Allows one scale operation at a time.
///
/// `start_work` claims the guard for a target broker count and `finished` releases it
/// once a poll observes that count. A claim nobody finishes expires after `max_wait`.
pub struct ScalingGuard {
    max_wait: Duration,
    in_flight: Mutex<Option<InFlight>>,
}

impl ScalingGuard {
    pub fn new(max_wait: Duration) -> Self {
        ScalingGuard {
            max_wait,
            in_flight: Mutex::new(None),
        }
    }

    /// Claims the guard for `desired` brokers. False while another claim is live.
    pub async fn start_work(&self, desired: usize) -> bool {
        let mut in_flight = self.in_flight.lock().await;
        if let Some(current) = *in_flight {
            if current.started.elapsed() < self.max_wait {
                debug!(desired = current.desired, requested = desired, "scaling already in progress");
                return false;
            }
            warn!(
                desired = current.desired,
                waited_ms = current.started.elapsed().as_millis() as u64,
                "scaling request never completed, guard expired"
            );
        }
        *in_flight = Some(InFlight {
            desired,
            started: Instant::now(),
        });
        true
    }

    /// Releases the guard when `current` brokers match the claimed target, or when the
    /// claim has expired.
    pub async fn finished(&self, current: usize) {
        let mut in_flight = self.in_flight.lock().await;
        let Some(claim) = *in_flight else {
            return;
        };
        if claim.desired == current {
            debug!(brokers = current, "scaling completed");
            *in_flight = None;
        } else if claim.started.elapsed() >= self.max_wait {
            warn!(desired = claim.desired, observed = current, "scaling did not converge, guard released");
            *in_flight = None;
        }
    }

    pub async fn is_working(&self) -> bool {
        match *self.in_flight.lock().await {
            Some(claim) => claim.started.elapsed() < self.max_wait,
            None => false,
        }
    }

    pub async fn desired(&self) -> Option<usize> {
        self.in_flight.lock().await.map(|claim| claim.desired)
    }

    /// Drops the claim without waiting for the fleet to converge.
    pub async fn cancel(&self) {
        self.in_flight.lock().await.take();
    }
}
