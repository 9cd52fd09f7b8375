//! Appliance-facing operations: capability detection, user
//! management, and session binding.

pub mod binder;
pub mod detect;
pub mod users;
