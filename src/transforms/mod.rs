//! Image transforms
//!
//! Steps are parsed from `-t PHASE KIND NAME ORDER PARAMS` values
//! ([`spec`]), resolved against per-phase defaults into [`Pipeline`]s
//! ([`resolver`]) and executed on decoded images ([`ops`]).

pub mod ops;
pub mod resolver;
pub mod spec;

pub use ops::{ImageTensor, Sample, Transform, IMAGENET_MEAN, IMAGENET_STD};
pub use resolver::{default_pipeline, resolve_transforms, PhaseTransforms, Pipeline};
pub use spec::{TransformKind, TransformSpec};
