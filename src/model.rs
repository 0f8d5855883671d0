pub mod error;
pub mod metadata;
pub mod rule;

pub use error::*;
pub use metadata::*;
pub use rule::*;
