//! Process supervision, one independent loop per server role.
//!
//! - [`machine`] : `SupervisorState`, `SupervisorEvent`, pure `transition()`
//! - [`role`]    : `run_role()` loop over the runner, readiness observer

pub mod machine;
pub mod role;

pub use machine::{transition, RestartPolicy, SupervisorEvent, SupervisorMachine, SupervisorState};
pub use role::{run_role, spawn_role, RoleOutcome, SupervisorContext, ADOPT_TIMEOUT};
