pub mod config;
pub mod execution;
pub mod flow_path;
pub mod function;
pub mod http;
pub mod logger;
pub mod message;
pub mod openapi;
pub mod pipeline;
pub mod plugin;
pub mod port;
pub mod processor;
pub mod provider;
pub mod schema;
pub mod signature;
pub mod util;

pub use pipeline::{Pipeline, PipelineError, PipelineInput, PipelineRequest, PluginExecutionResponse};
pub use plugin::{Plugin, PluginLoader};
