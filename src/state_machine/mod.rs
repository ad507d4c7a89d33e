// State machines for activity nodes and task envelopes.
//
// Both machines are pure transition tables over the persisted documents; callers
// apply them inside a version-conditioned store write.

pub mod activity_state_machine;
pub mod errors;
pub mod events;
pub mod states;
pub mod task_state_machine;

// Re-export main types for convenient access
pub use activity_state_machine::ActivityStateMachine;
pub use errors::{StateMachineError, StateMachineResult};
pub use events::{ActivityEvent, TaskEvent};
pub use states::{ActivityState, TaskLifecycleState};
pub use task_state_machine::TaskStateMachine;
