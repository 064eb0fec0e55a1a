//! Per-request performance instrumentation with AppEnlight-compatible reporting.
//!
//! A [`Transaction`] is started for every request and made ambient with
//! [`context::bind`] / [`context::bind_future`]. Code running on behalf of the
//! request opens [`Span`]s against it (via [`context::start_span`] or
//! [`span::remote_http`]); their time is folded into per-category exclusive
//! stats. When the response goes out the transaction emits a metrics record,
//! and a detailed report for slow or failed requests, into [`Batcher`]s that
//! deliver on their own interval.

pub mod api;
pub mod batch;
pub mod client;
pub mod context;
pub mod error;
pub mod model;
pub mod span;
pub mod transaction;

pub use crate::{
    batch::{Batcher, Reporter},
    client::{install_logger, AppEnlight, Config, HttpReporter, LoggingConfig, RequestLogger},
    context::FutureExt,
    error::ReportError,
    model::{Category, RequestInfo, Stats, User},
    span::Span,
    transaction::{Records, Settings, Sinks, Transaction},
};
