pub mod app;
pub mod bus;
pub mod config;
pub mod function;
pub mod functions;
pub mod jobs;
pub mod llm;
pub mod logger;
pub mod orchestrator;
pub mod schema;
