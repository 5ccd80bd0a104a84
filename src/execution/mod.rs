//! Execution driver.
//!
//! This module turns locked jobs into running external executions, for both
//! the main and the revert lifecycle, with idempotent execution naming.

mod driver;
mod naming;

pub use driver::{DriverError, ExecutionDriver, ScheduleOutcome};
pub use naming::{execution_name, EXECUTION_NAME_LEN};
