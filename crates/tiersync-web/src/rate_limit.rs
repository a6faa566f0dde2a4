use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

const PRUNE_ABOVE: usize = 1024;

/// Fixed-window request budget per client key.
#[derive(Debug)]
pub struct RateLimiter {
    points: u32,
    window: Duration,
    clients: Mutex<HashMap<String, WindowState>>,
}

#[derive(Debug, Clone, Copy)]
struct WindowState {
    started: Instant,
    used: u32,
}

impl RateLimiter {
    pub fn new(points: u32, window: Duration) -> Self {
        Self {
            points,
            window,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Spend one point for `client`; `false` once the current window is exhausted.
    pub async fn try_consume(&self, client: &str) -> bool {
        let now = Instant::now();
        let mut clients = self.clients.lock().await;

        if clients.len() > PRUNE_ABOVE {
            let window = self.window;
            clients.retain(|_, state| now.duration_since(state.started) < window);
        }

        let state = clients.entry(client.to_string()).or_insert(WindowState {
            started: now,
            used: 0,
        });
        if now.duration_since(state.started) >= self.window {
            *state = WindowState {
                started: now,
                used: 0,
            };
        }

        if state.used < self.points {
            state.used += 1;
            true
        } else {
            false
        }
    }
}
