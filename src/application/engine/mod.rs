pub mod entry;
pub mod exits;
pub mod manager;
pub mod oco;
pub mod orders;
pub mod postback;
pub mod reconciler;
pub mod scheduler;
pub mod submit;
pub mod watchdogs;

pub use manager::{EngineCommand, EngineHandle, TradeManager};
