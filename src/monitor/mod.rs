//! Order monitoring — the crash-safe polling pipeline every order flows
//! through after creation.

pub mod order_monitor;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;

/// Capability handed to upstream producers (DCA scheduler, limit worker) so
/// they can register orders without holding the monitor itself.
#[async_trait]
pub trait OrderTracker: Send + Sync {
    async fn track(&self, order_id: &str, user_id: &str, created_at: DateTime<Utc>) -> Result<()>;
}
