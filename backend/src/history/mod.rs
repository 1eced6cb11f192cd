pub mod models;
pub mod repository;

pub use models::PredictionRecord;
pub use repository::{HistoryError, HistoryRepository};
