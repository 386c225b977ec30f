#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

pub mod config;
pub mod cv;
pub mod data;
pub mod error;
pub mod family;
pub mod folds;
pub mod generalize;
pub mod kernel;
pub mod metrics;
pub mod output;
pub mod permutation;
pub mod progress;
pub mod sample_size;
pub mod scaler;
pub mod seeding;
