// Keystone Atoms — shared primitives used by every service.
// No service-level logic lives here; only types, constants, config, errors.

pub mod config;
pub mod constants;
pub mod error;
pub mod packet;
