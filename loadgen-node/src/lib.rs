//! Loadgen Node Library
//!
//! Virtual-user load generation against HTTP markdown APIs: staged ramping,
//! per-VU dataset rows, retrying requests and threshold-gated metrics.

pub mod assignment;
pub mod config;
pub mod dataset;
pub mod error;
pub mod harness;
pub mod metrics;
pub mod payload;
pub mod profile;
pub mod report;
pub mod retry;
pub mod runner;
pub mod scheduler;
pub mod secret;
pub mod stub_origin;
pub mod threshold;
pub mod transport;
pub mod vu;

// Re-export commonly used types
pub use config::LoadgenConfig;
pub use dataset::{Dataset, DatasetProvider, Row, RowFilter};
pub use error::{LoadgenError, Result};
pub use harness::{Harness, PreparedRun, RunPlan};
pub use metrics::{Aggregate, MetricKind, MetricsRegistry};
pub use payload::{payload_fn, PayloadBuilder, PayloadSpec};
pub use profile::{ClientProfile, Operation, OperationSelection, ProfileRegistry, RampPlan};
pub use report::RunSummary;
pub use retry::{RetryPolicy, RetryingExecutor};
pub use stub_origin::{StubConfig, StubHandle, StubOrigin};
pub use threshold::{ThresholdResult, ThresholdSet};
pub use transport::{HttpRequest, HttpResponse, ReqwestTransport, Transport};
