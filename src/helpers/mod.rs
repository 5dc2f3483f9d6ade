//! Operator helpers built on the submitters and the event observer

pub mod safe_mode;
pub mod send;

pub use safe_mode::{set_safe_mode, SafeModeLevel};
pub use send::{no_substrate_backend, parse_units, Asset, AssetSender};
