pub mod catalog;
pub mod sources;
pub mod store;

pub use catalog::*;
pub use sources::*;
pub use store::*;
