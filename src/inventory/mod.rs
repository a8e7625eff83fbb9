pub mod holds;
pub mod ledger;

pub use holds::{CreatedHold, ExpireOutcome, HoldRegistry, ReleasedHold};
pub use ledger::StockLedger;
