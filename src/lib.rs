// Keystone — cognitive orchestration platform.
// One library, five service binaries: the cognition engine, the gateway,
// the cross-service orchestrator, the tool server, and the training/index
// service. `atoms` and `shared` hold the conventions every service speaks.

pub mod atoms;
pub mod engine;
pub mod gateway;
pub mod orchestrator;
pub mod shared;
pub mod toolserver;
pub mod trainer;
