//! Declarative deployment engine: parse a template, bind parameters, prune
//! the resource graph by conditions and variant slots, then converge each
//! resource through an injected provider with persisted-state idempotence.

pub mod dag;
pub mod error;
pub mod executor;
pub mod output;
pub mod provider;
pub mod resolve;
pub mod state;
pub mod template;

pub use error::{EngineError, ProviderError, Result};
pub use executor::engine::{ApplyEngine, ApplyOptions, ApplyReport};
pub use output::projector::{project_outputs, OutputValue};
pub use resolve::{resolve_values, DeploymentScope, ResolvedValues};
pub use template::parser::parse_template;
