//! Typed domain entities shared across the pipeline.
//!
//! Every document that crosses a store boundary is coerced into one of these
//! structs; unknown fields are preserved only where the payload explicitly
//! carries an `extras` map.

mod calibration;
mod error;
mod forecast;
mod order;

pub use calibration::{
    BandCalibration, CenterCalibration, PurgeCheckpoint, PurgeCheckpointStatus, RefreshState,
    RefreshStatus, SourceCalibration,
};
pub use error::{CoreError, Result};
pub use forecast::{
    ExpiryFloor, ExpiryReplacement, ForecastItem, ForecastPayload, PriorOrderContext, SourceTag,
    WholeCaseAdjustment,
};
pub use order::{
    AllocationRow, Correction, CorrectionAggregate, LineItem, Order, OrderCycle, OrderStatus,
    Route, SplitPattern, StoreItemShare, StoreOrder, Weekday,
};
