//! `featurekit` is a client-side feature flag and experimentation SDK. It
//! evaluates a declarative *datafile* — features, targeting rules, traffic
//! allocations, variations, and typed variables — against a caller-supplied
//! context, and decides whether a feature is enabled, which variation
//! applies, and what each variable resolves to.
//!
//! # Overview
//!
//! Most applications create one [`Instance`] and keep it for the process
//! lifetime:
//!
//! ```no_run
//! # use std::time::Duration;
//! use featurekit::{Context, InstanceOptions, Instance};
//!
//! # fn main() -> featurekit::Result<()> {
//! let instance = Instance::new(
//!     InstanceOptions::new()
//!         .with_datafile_url("https://cdn.example.com/datafile.json")
//!         .with_refresh_interval(Duration::from_secs(60)),
//! )?;
//!
//! let context: Context = [("userId".to_owned(), "user-123".into())].into_iter().collect();
//! if instance.is_enabled("checkout", &context) {
//!     // ...
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Evaluation is deterministic: the same (datafile revision, feature,
//! context) triple always yields the same decision, here and in the other
//! SDK implementations of the datafile format. The building blocks are also
//! usable on their own — [`evaluation::Evaluator`] evaluates a
//! [`datafile::DatafileContent`] directly, without an instance.

#![warn(rustdoc::missing_crate_level_docs)]

pub mod bucketing;
pub mod conditions;
pub mod datafile;
pub mod datafile_fetcher;
pub mod datafile_store;
pub mod emitter;
pub mod evaluation;
pub mod refresher;
pub mod segments;

mod attributes;
mod error;
mod instance;

pub use attributes::{AttributeValue, Context};
pub use error::{Error, Result};
pub use instance::{create_instance, DatafileSource, Instance, InstanceOptions};
