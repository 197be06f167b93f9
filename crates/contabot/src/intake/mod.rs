//! Inbound message handling: onboarding handshake and job enqueueing.

mod handler;
pub mod state;

use thiserror::Error;

use crate::db::DatabaseError;

pub use handler::{BindingRejection, IntakeHandler, IntakeOutcome};
pub use state::{
    MemoryMessageDedupe, MemoryPendingBindings, MessageDedupe, PendingBindings, StashedAttachment,
};

#[derive(Error, Debug)]
pub enum IntakeError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}
