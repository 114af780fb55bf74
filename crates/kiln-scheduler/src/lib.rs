//! Job dispatch for the Kiln control plane.
//!
//! Every operation of the queue, booking, take and result protocols, the
//! worker and hatchery registries, and the reaper that disables and deletes
//! silent workers. All of them run against a [`DispatchContext`].

pub mod booking;
pub mod context;
pub mod hatchery;
pub mod queue;
pub mod reaper;
pub mod registry;
pub mod result;
pub mod take;

#[cfg(test)]
pub(crate) mod testing;

pub use context::DispatchContext;
pub use queue::RequirementsError;
pub use reaper::Reaper;
pub use registry::RegisteredWorker;
pub use take::{JobDetailWithSecrets, TakeRequest};
