pub mod event;
pub mod feed;
pub mod history;
pub mod store;

// Re-export the common types (e.g. `use crate::market_data::Candle`).
pub use event::{Candle, MarketEvent};
pub use feed::FeedHealth;
pub use store::{FlowSnapshot, SymbolState, SymbolStore};
