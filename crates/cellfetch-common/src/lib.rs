pub mod backend;
pub mod clock;
pub mod error;
pub mod fingerprint;
pub mod period;
pub mod query;
pub mod store;

pub use backend::*;
pub use clock::*;
pub use error::*;
pub use fingerprint::*;
pub use period::*;
pub use query::*;
pub use store::*;
