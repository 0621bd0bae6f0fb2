use std::time::Duration;

use tokio::time::{Instant, sleep_until};

/// Enforces a minimum spacing between successive requests to a source.
#[derive(Debug)]
pub struct Pacer {
    spacing: Duration,
    last: Option<Instant>,
}

impl Pacer {
    pub fn new(spacing: Duration) -> Self {
        Self {
            spacing,
            last: None,
        }
    }

    /// Waits until `spacing` has elapsed since the previous call returned.
    /// The first call never waits.
    pub async fn wait(&mut self) {
        if let Some(last) = self.last
            && !self.spacing.is_zero()
        {
            sleep_until(last + self.spacing).await;
        }
        self.last = Some(Instant::now());
    }
}
