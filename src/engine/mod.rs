//! Forecast engine: branch selection, model training, band calibration
//! application, whole-case enforcement, and low-quantity floors.

mod bands;
mod expiry;
mod generate;
mod mode;
mod model;
mod training;
mod whole_case;

use thiserror::Error;

pub use bands::{apply_band_adjustments, cold_start_p90_by_sap, BandAdjustments};
pub use expiry::{apply_expiry_floors, LowQuantitySource, NoLowQuantity};
pub use generate::{ForecastEngine, ForecastRequest};
pub use mode::{resolve_mode, ForecastMode, ModeDecision, ModeInputs, TrainingScope};
pub use model::{BoostedStumpModel, DemandModel, LinePrediction, TrainedPredictor};
pub use training::{
    run_training_pipeline, validate_predictions, TrainingMetrics, TrainingReport, ValidationGate,
};
pub use whole_case::{enforce_whole_cases, WholeCasePolicy};

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Typed outcomes of forecast generation. Logical gates are values, not
/// panics; the orchestrator logs them and moves on.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("insufficient_history: {0}")]
    InsufficientHistory(String),

    #[error("no_matching_cycle: {0}")]
    NoMatchingCycle(#[from] crate::schedule::ScheduleError),

    #[error("whole_case_invariant_violation: sap {sap} total {total} not a multiple of {case_pack}")]
    WholeCaseInvariantViolation {
        sap: String,
        total: u32,
        case_pack: u32,
    },

    #[error("model error: {0}")]
    Model(String),

    #[error(transparent)]
    Storage(#[from] crate::domain::CoreError),
}

impl EngineError {
    /// Logical gates are expected outcomes; infrastructure failures are not.
    pub fn is_logical(&self) -> bool {
        matches!(
            self,
            EngineError::InsufficientHistory(_)
                | EngineError::NoMatchingCycle(_)
                | EngineError::WholeCaseInvariantViolation { .. }
        )
    }
}
