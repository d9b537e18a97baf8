//! The analysis and transformation passes, in pipeline order. Each pass
//! reports into the shared [`ErrorAccumulator`]; the pipeline decides
//! whether to continue after it returns.

pub mod annotations;
pub mod check;
pub mod labels;
pub mod recursion;
pub mod types;
