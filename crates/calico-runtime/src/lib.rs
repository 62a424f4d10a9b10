//! calico runtime: cooperative scheduler and project world for Scratch
//! scripts compiled to calico VM bytecode.

pub mod broadcast;
pub mod clock;
pub mod engine;
pub mod target;

pub use engine::{Engine, EngineHandle, HatType, Thread};
