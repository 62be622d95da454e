use std::future::Future;
use std::time::Duration;

use futures::future::join_all;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    pub group_size: usize,
    pub pause: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            group_size: 5,
            pause: Duration::from_secs(2),
        }
    }
}

impl BatchConfig {
    pub fn without_pause(group_size: usize) -> Self {
        Self {
            group_size,
            pause: Duration::ZERO,
        }
    }
}

/// Run `f` over `items` in fixed-size groups. Items within a group run
/// concurrently; groups run one after another with `pause` in between.
/// Results keep input order.
pub async fn process_in_groups<T, R, F, Fut>(items: Vec<T>, config: BatchConfig, f: F) -> Vec<R>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = R>,
{
    let group_size = config.group_size.max(1);
    let mut results = Vec::with_capacity(items.len());
    let mut remaining = items.into_iter().peekable();

    while remaining.peek().is_some() {
        let group: Vec<T> = remaining.by_ref().take(group_size).collect();
        results.extend(join_all(group.into_iter().map(&f)).await);
        if remaining.peek().is_some() && !config.pause.is_zero() {
            tokio::time::sleep(config.pause).await;
        }
    }
    results
}
