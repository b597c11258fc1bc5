//! Inference with a trained model
//!
//! Runs the best snapshot over every split in on-disk order and produces one
//! prediction per image, with the full probability distribution.

pub mod predictor;

pub use predictor::{PhasePredictions, Prediction, Predictor};
