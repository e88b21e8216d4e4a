// Pre-submission risk guards
pub mod guards;

pub use guards::{GuardTrip, RiskGuards};
