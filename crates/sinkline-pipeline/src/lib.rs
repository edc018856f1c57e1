//! Sinkline Pipeline - per-customer fan-out of load jobs
//!
//! A job fetches a dataset for every destination in the registry, renames
//! and coerces its columns, clears the slice of the destination table it
//! replaces and writes the new rows. A failing destination is logged and
//! skipped; the others still load.

pub mod driver;
pub mod job;
pub mod registry;
pub mod source;
pub mod window;

pub use driver::{JobReport, Outcome, Pipeline, Step, StepError};
pub use job::{Job, JobConfig, ResetSpec, SourceSpec};
pub use registry::{load_destinations, Destination, DestinationFilter, RegistryConfig, RegistryError};
pub use source::{Source, SqlSource, StaticSource};
pub use window::DateWindow;
