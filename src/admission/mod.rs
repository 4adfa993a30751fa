//! Request admission: one decision per inbound request.

mod decision;
mod events;
mod pipeline;
mod request;

pub use decision::{Decision, FieldLocation, Violation, ViolationKind};
pub use events::{DecisionEvent, DecisionSink, EventOutcome, MemorySink, NullSink, TracingSink};
pub use pipeline::AdmissionPipeline;
pub use request::{FieldSource, RequestDescriptor, RequestField};
