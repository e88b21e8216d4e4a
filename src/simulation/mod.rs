// Offline session replay against the paper gateway
pub mod runner;
pub mod synthetic;

pub use runner::{SimulationConfig, SimulationReport, SimulationRunner};
pub use synthetic::{MarketScenario, SyntheticMarket};
