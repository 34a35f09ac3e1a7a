//! Runtime for executing flows.
//!
//! This module provides the infrastructure around the pure transition
//! function:
//!
//! - [`FlowManager`] — registers, starts, resumes, routes and kills flows
//! - [`FlowManagerBuilder`] — builder for registering flow classes and
//!   wiring collaborators
//! - [`RuntimeConfig`] — inbox bounds, retry policy, timeouts
//!
//! # Example
//!
//! ```ignore
//! let manager = FlowManager::builder(store, "alice")
//!     .register::<PaymentFlow>()
//!     .register_responder::<PaymentResponder>(PaymentFlow::NAME)
//!     .config(RuntimeConfig::default())
//!     .build()?;
//!
//! manager.start().await?;
//! let started = manager
//!     .start_flow(PaymentFlow::NAME, args, InvocationContext::rpc("admin"))
//!     .await?;
//! let result = started.completion.wait().await?;
//! ```

mod config;
pub(crate) mod manager;
pub(crate) mod registry;
mod worker;

pub use config::RuntimeConfig;
pub use manager::{
    ExternalEvent, FlowCompletion, FlowManager, FlowManagerBuilder, FlowOutcome, StartedFlow,
};
