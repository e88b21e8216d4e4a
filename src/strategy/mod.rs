// Endless umbrella strategy: candidates, signals, scheduling and the engine
pub mod candidates;
pub mod schedule;
pub mod signals;
pub mod umbrella;

pub use candidates::{build_candidates, CandidateParams, Exclusions, LOT_CEILING};
pub use signals::{MoveCheck, Rejection, PERCENT_DELTA};
pub use umbrella::{
    CandidateChange, Collaborators, IgnoreReason, Phase, StrategyState, StrategyStatus,
    TickOutcome, UmbrellaStrategy,
};
