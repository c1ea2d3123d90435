pub mod engine;
pub mod retry;
