pub mod errors;
pub mod evaluation;
pub mod experiment;
pub mod services;

pub use errors::*;
pub use evaluation::*;
pub use experiment::*;
pub use services::*;
