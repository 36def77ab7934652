pub mod clock;
pub mod config;
pub mod counters;
pub mod daemon;
pub mod engine;
pub mod protocol;
pub mod queue;
pub mod server;
pub mod stats;
pub mod store;
pub mod tenant;

pub use config::Config;
pub use engine::{Decision, DecisionEngine};
pub use protocol::{AttributeParser, PolicyAction, PolicyRequest};
pub use server::{Mode, PolicyServer};
pub use store::PolicyStore;
