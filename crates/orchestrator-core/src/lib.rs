#![allow(dead_code)]
#![allow(clippy::enum_variant_names)]

//! Orchestration core: the Debate Orchestrator, the Topic Orchestrator, the
//! Fact-check Worker, and the Live Event Bus, driving participants through
//! the `agon_gateway_core::gateway::Gateway` contract.

pub mod backends;
pub mod debate_orchestrator;
pub mod domain;
pub mod event_bus;
pub mod factcheck_worker;
pub mod sandbox_validator;
pub mod topic_orchestrator;

pub use backends::Store;
pub use event_bus::LiveEventBus;
