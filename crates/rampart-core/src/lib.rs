//! # Rampart Core
//!
//! Building blocks shared by the rampart resilience policies and the
//! decorator builder:
//!
//! - [`Action`] / [`AsyncAction`] - one generic unit-of-work type for every
//!   call shape (supplier, function, consumer, runnable)
//! - [`Pending`] / [`Completion`] - pending results with cancellation and
//!   exactly-once completion
//! - [`Scheduler`] - named executor handles for the work, timeout and retry
//!   roles
//! - [`Policy`] / [`AsyncPolicy`] / [`Offload`] - what a collaborator
//!   implements to be composable
//!
//! ## Example
//!
//! ```
//! use rampart_core::{Action, Completion};
//!
//! let double: Action<u32, u32> = Action::infallible(|x| x * 2);
//! assert_eq!(double.invoke(4).unwrap(), 8);
//!
//! let (completion, pending) = Completion::pair();
//! assert!(completion.complete(Ok("first")));
//! assert!(!completion.complete(Ok("second")));
//! assert_eq!(pending.wait().unwrap(), "first");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod action;
pub mod pending;
pub mod policy;
pub mod scheduler;

pub use action::{Action, AsyncAction, AsyncSupplier, Consumer, Function, Runnable, Supplier};
pub use pending::{Completion, Pending};
pub use policy::{AsyncPolicy, Offload, Policy};
pub use scheduler::{Scheduler, SchedulerRole};

pub use rampart_error::{BoxError, Outcome};
pub use tokio_util::sync::CancellationToken;
