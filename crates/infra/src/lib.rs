//! Infrastructure layer: job broker, dispatch, workers and recovery.

pub mod jobs;
