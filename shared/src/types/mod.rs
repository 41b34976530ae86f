//! Data model for collected measurements

pub mod aggregate;
pub mod gauge;
pub mod histogram;
pub mod profile;
pub mod trace;
