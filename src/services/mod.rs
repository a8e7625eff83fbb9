/// Service modules - the coordinator surfaces and the background reaper.
pub mod orders;
pub mod reaper;
pub mod webhook;

pub use orders::{OrderService, PlacedOrder};
pub use reaper::{ExpiryReaper, ReaperSettings, SweepReport};
pub use webhook::{WebhookOutcome, WebhookProcessor, WebhookRequest};
