//! Quota accounting and usage storage.

mod clock;
mod counter;
mod sqlite;
mod store;
mod window;

pub use clock::{Clock, ManualClock, SystemClock};
pub use counter::{QuotaCounter, QuotaOutcome};
pub use sqlite::SqliteQuotaStore;
pub use store::{MemoryQuotaStore, QuotaBackend, QuotaStore, StoreOutcome, UsageWindow, WindowKey};
pub use window::TimeWindow;
