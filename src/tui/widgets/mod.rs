//! Screen components.

pub mod editor;
pub mod estimate;
pub mod export;
pub mod footer;
pub mod header;
pub mod log;
pub mod review;
pub mod settings;
pub mod spinner;
pub mod table;
