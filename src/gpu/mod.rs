//! Device plumbing shared by the builder kernels.

pub mod context;
pub mod counter;
pub mod readback;

pub use context::GpuContext;
pub use counter::{CounterBank, CounterSlot, CounterSnapshot};
pub use readback::{ReadbackCoordinator, ReadbackData};
