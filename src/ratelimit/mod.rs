//! Sliding window admission control and state management.

mod clock;
mod key;
mod limiter;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use key::{ClientKey, MAX_KEY_LEN};
pub use limiter::{Limiter, Verdict};
pub use store::{Admission, SweepReport, WindowStore};
