pub mod projector;
pub mod recorder;
pub mod routing;
pub mod types;

pub use projector::ProjectionFeeder;
pub use recorder::TrafficRecorder;
pub use types::{Direction, RoutingSummary};
