mod line;
mod writer;

pub use writer::{InfluxOptions, InfluxSink};
