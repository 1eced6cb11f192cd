pub mod config;
pub mod history;
pub mod model;
pub mod pipeline;
pub mod report;
pub mod routes;
pub mod storage;
