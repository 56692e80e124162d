pub mod catalog;
pub mod kite;
pub mod persistence;
