pub mod node;
pub mod telemetry;
