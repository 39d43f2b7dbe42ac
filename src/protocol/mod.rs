//! Checkpoint protocol layer: session state machine, decision ledger,
//! operation sequencing and the serial event dispatcher.

pub mod coordinator;
pub mod dispatcher;
pub mod ledger;
pub mod sequencer;

pub use coordinator::{Actions, CheckpointCoordinator};
pub use dispatcher::{Dispatcher, Engine, Event, EventSender, Outbox};
pub use ledger::DecisionLedger;
pub use sequencer::{Evaluation, OperationSequencer};
