//! Models how the user moves through a study and predicts which slices are needed next.

mod predictor;
mod tracker;

pub use predictor::{PredictionRequest, PrefetchPredictor};
pub use tracker::{Direction, NavigationPattern, Observation, PatternTracker};
