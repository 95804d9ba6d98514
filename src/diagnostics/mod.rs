pub mod stats;

pub use stats::{DiagnosticSnapshot, DiagnosticStats};
