//! Webhook subsystem: subscription registry, delivery worker pool, signed
//! HTTP delivery with retries, and delivery logs

pub mod delivery;
pub mod dispatcher;
pub mod logs;
pub mod registry;

pub use delivery::{AttemptResult, BackoffPolicy, DeliveryOutcome, DeliveryTarget, PreparedDelivery, WebhookDeliveryClient};
pub use dispatcher::{DeliveryJob, DispatchHandle, WebhookDispatcher};
pub use logs::{DeliveryLogStore, MemoryDeliveryLogStore};
pub use registry::WebhookRegistry;
