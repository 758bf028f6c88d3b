//! Async side of mend: the healing orchestrator and the concrete
//! collaborators it drives (shell builds, git, GitHub CI, LLM providers).

pub mod ci;
pub mod collaborator;
pub mod event_bus;
pub mod executor;
pub mod generator;
pub mod git;
pub mod orchestrator;
pub mod parser;
pub mod push;
pub mod subprocess;

pub use orchestrator::{Orchestrator, RunRequest};
