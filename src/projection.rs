pub mod store;
pub mod types;

pub use store::ProjectionStore;
pub use types::{ProjectionEvent, Query, UpdateKind, UpdateResults};
