//! Filter chain composition and the built-in filters.
//!
//! A request runs through `root filters -> route filters -> terminal`, where
//! the terminal is the method handler or a 404/405 report. Root filters wrap
//! error outcomes exactly like real handlers, so cross-cutting concerns such as
//! auth and logging apply uniformly.

mod core;
mod metrics;
mod trace;

pub use core::{filter_fn, Filter, FilterChain, FnFilter, RootFilterList, RootFilters, Terminal};
pub use metrics::MetricsFilter;
pub use trace::{TracingFilter, REQUEST_ID_HEADER};
