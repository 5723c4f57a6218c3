pub mod simulator;

pub use simulator::{ActiveTrade, ClosedTrade, SimState, SimStats, TradeMeta};
