// Status model for processable objects
//
// Every concrete domain status carries one of four processing phases; the
// transitions between statuses are immutable per-domain tables rather than
// behavior attached to the statuses themselves.

pub mod status;
pub mod transitions;

pub use status::{ProcessingPhase, Status};
pub use transitions::{StatusModel, StatusModelBuilder};
