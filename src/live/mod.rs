pub mod adapter;
pub mod client;
pub mod error;
pub mod income;
pub mod normalize;

pub use adapter::{LivePosition, LiveTrader};
pub use client::FuturesClient;
pub use error::{VenueError, VenueResult};
pub use income::IncomeStats;
