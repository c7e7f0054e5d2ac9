use std::time::Duration;

use tokio::time;

use duel_peer::{Event, EventSubscription};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Polls `condition` until it holds or `timeout` passes
pub async fn wait_for<F: FnMut() -> bool>(timeout: Duration, mut condition: F) -> bool {
    let deadline = time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if time::Instant::now() >= deadline {
            return false;
        }
        time::sleep(POLL_INTERVAL).await;
    }
}

/// Next event of kind `V`, skipping others, or `None` on timeout
pub async fn next_event<V: Event>(
    subscription: &mut EventSubscription,
    timeout: Duration,
) -> Option<V::Item> {
    time::timeout(timeout, subscription.recv_kind::<V>())
        .await
        .ok()
        .flatten()
}
