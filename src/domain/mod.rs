// Domain layer: records, checkpoints and the ports the adapters implement.

pub mod model;
pub mod ports;
