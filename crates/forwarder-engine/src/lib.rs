pub mod engine;

pub use engine::RoundRobinForwarder;
