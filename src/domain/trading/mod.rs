pub mod state_machine;
pub mod tag;
pub mod trade;
pub mod types;
