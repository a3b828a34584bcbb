//! Attend-infer-repeat style structured generative model on candle.
//!
//! A variational model that explains an image as a variable number of
//! objects, each with a latent appearance and pose, rendered additively onto
//! a shared canvas. The crate provides the inference recurrence, the
//! variational objective with annealed discrete-count priors, and a
//! variance-reduced score-function estimator for the stochastic step count.
//! The neural sub-networks are pluggable; small MLP defaults are included.

pub mod cell;
pub mod config;
pub mod error;
pub mod loss;
pub mod model;
pub mod model_traits;
pub mod modules;
pub mod prior;
pub mod schedule;
pub mod spatial;
pub mod train;

pub use candle_core;
pub use candle_nn;
