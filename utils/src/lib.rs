pub mod state_flow;

pub use state_flow::StateFlow;
