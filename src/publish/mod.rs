pub mod count;
pub mod relay;
pub mod tcp;

pub use count::CountPublisher;
pub use relay::RelayPublisher;
pub use tcp::TcpPublisher;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::PublishError;

/// Best-effort broadcast of whole messages to whoever is subscribed.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, payload: Bytes) -> Result<(), PublishError>;
}
