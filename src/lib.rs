mod error;
mod tooling;

pub use error::{PipelineError, PipelineResult};
pub use tooling::*;
