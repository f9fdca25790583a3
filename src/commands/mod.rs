//! Command implementations

pub mod info;
pub mod list;
pub mod upgrade;
