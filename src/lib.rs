//! RouteSpark core - order-cycle scheduling and demand forecasting.
//!
//! This library implements the forecasting pipeline for field distribution
//! routes: cycle-completion detection, walk-forward learning, uncertainty
//! band calibration, cached forecast delivery, and the asynchronous
//! export/purge job queue.

pub mod backtest;
pub mod cache;
pub mod calibration;
pub mod cli;
pub mod clock;
pub mod config;
pub mod docstore;
pub mod domain;
pub mod engine;
pub mod features;
pub mod observability;
pub mod orchestrator;
pub mod queue;
pub mod schedule;
pub mod storage;

// Re-export commonly used types
pub use domain::{
    BandCalibration, CenterCalibration, CoreError, Correction, ForecastItem, ForecastPayload,
    LineItem, Order, OrderCycle, PurgeCheckpoint, RefreshState, Result, SourceCalibration,
    SourceTag, StoreOrder,
};

pub use clock::{Clock, FixedClock, SystemClock};

pub use docstore::{ChangeEvent, ChangeKind, DocumentStore, MemoryDocumentStore, TxnOutcome};

pub use storage::{CalibrationStore, OrderStore, PgOrderStore};

pub use engine::{
    DemandModel, EngineError, ForecastEngine, ForecastMode, ForecastRequest, ModeDecision,
};

pub use calibration::{BandCalibrator, CalibrationOutcome, CalibratorSettings};

pub use backtest::{Backtester, FoldMetrics, Scorecard, SourceBreakdownRow};

pub use cache::{ForecastCache, ForecastLookup, TransferPlanner};

pub use queue::{
    ExportJob, ExportSubmission, ExportWorker, JobStatus, PurgeWorker, QueueError, RouteLock,
    SubmitError,
};

pub use orchestrator::{RetrainOrchestrator, RouteTickReport};
