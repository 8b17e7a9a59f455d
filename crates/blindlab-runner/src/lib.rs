//! Blind-comparison trial runner: builds shuffled name/description trials from
//! an entity pool, dispatches them to a scoring oracle, and parses, analyzes
//! and reports the results.

pub mod batch;
pub mod config;
pub mod control;
pub mod dispatch;
pub mod oracle;
pub mod parse;
pub mod paths;
pub mod pipeline;
pub mod pool;
pub mod progress;
pub mod report;
pub mod stages;
pub mod trial;

pub use batch::{build_batch, BatchMode, BatchRequest, BatchSummary};
pub use config::{RunConfig, CONFIG_TEMPLATE};
pub use control::{request_stop, CancelToken};
pub use dispatch::{DispatchOptions, DispatchReport};
pub use oracle::{HttpOracle, OracleError, ScoringOracle};
pub use paths::RunPaths;
pub use pipeline::{
    build_only, dispatch_only, execute_pipeline, run_pipeline, PipelineMode, PipelineStages,
    RunOutcome, RunTarget, Stage,
};
pub use report::{finalize_report, read_final_status, RunStatus};
pub use trial::{generate_trial, MappingStrategy, Trial};
