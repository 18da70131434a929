//! # exporter-delivery
//!
//! At-least-once delivery of usage batches to the partner billing API.
//!
//! - [`retry_policy`] - classify failed sends (retry, reject, conflict)
//! - [`sender`] - POST with backoff, spool on exhaustion, replay the spool
//! - [`spool`] - durable spool and failed (quarantine) directories
//! - [`notify`] - best-effort quarantine notifications
//!
//! Batch lifecycle:
//!
//! ```text
//! PENDING --2xx / 409--------------------------> DONE
//! PENDING --400/401/403/404--------------------> REJECTED (surfaced, no file)
//! PENDING --retries exhausted------------------> SPOOLED
//! SPOOLED --resend ok--------------------------> DONE (file deleted)
//! SPOOLED --resend failed, below ceiling-------> SPOOLED (retryCount + 1)
//! SPOOLED --retryCount reaches ceiling---------> FAILED (notified)
//! FAILED  --manual resend ok-------------------> DONE (file deleted)
//! FAILED  --manual resend failed---------------> FAILED (unchanged)
//! ```

pub mod error;
mod fsync;
pub mod notify;
pub mod retry_policy;
pub mod sender;
pub mod spool;

pub use error::{DeliveryError, NetworkErrorCode, SendError, SpoolError};
pub use notify::{LogNotifier, Notifier, QuarantineEvent, WebhookNotifier};
pub use sender::{
    ExternalApiSender, FailedResend, ResendSummary, SendOutcome, SenderConfig, mask_token,
};
pub use spool::{SpoolEntry, SpoolFile, SpoolManager};
