//! The scheduling subsystem: estimator, throttle probe, task state,
//! executor and the batch scheduler that ties them together

pub mod batch;
pub mod estimator;
pub mod executor;
pub mod state;
pub mod throttle;
