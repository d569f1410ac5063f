#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod error;
mod utils;

pub mod cloud;
pub mod core;
pub mod executor;
pub mod link;
pub mod registry;
pub mod retry;
pub mod target;
pub mod task;
pub mod tasks;

pub use crate::core::{ApplyOptions, CancelToken, Context, Field, Lifecycle};
pub use crate::error::*;
pub use crate::executor::{ApplyReport, Executor, Outcome};
pub use crate::link::{Link, Resolved, TaskKey};
pub use crate::registry::{Plan, Registry};
pub use crate::target::Target;
pub use crate::task::TypedTask;

#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
