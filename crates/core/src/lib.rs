//! `estatehub-core` — shared building blocks for the back-office job core.
//!
//! Pure primitives only (identifiers, errors, time source); no I/O.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{EntityId, OrgId};
