//! Fine-tuning
//!
//! - `optim`: SGD hyperparameters from `--optimizer_params`
//! - `scheduler`: step decay of the learning rate
//! - `trainer`: the epoch loop and best-snapshot tracking
//! - `pipeline`: one complete run, from data directory to artifacts

pub mod optim;
pub mod pipeline;
pub mod scheduler;
pub mod trainer;

pub use optim::SgdParams;
pub use pipeline::{run, RunSummary};
pub use scheduler::StepLr;
pub use trainer::{
    evaluate, train_model, BestSnapshot, EpochRecord, PhaseStats, TrainerConfig, TrainingOutcome,
    TrainingState,
};
