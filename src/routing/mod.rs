//! Request routing reconstructed from the build manifests.
//!
//! Every stage is a pure function of the compiled manifests and the incoming
//! [`InternalRequest`]; nothing here touches storage.

pub mod handler;
pub mod i18n;
pub mod matcher;
pub mod path_template;
pub mod prerender;
pub mod request;
pub mod route_table;

use thiserror::Error;

pub use handler::{Resolution, RoutedRequest, RoutingEngine};
pub use request::{InternalRequest, PreparedResponse, QueryParams};

/// Raised while compiling manifests into matchers. Always fatal at startup.
#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("route regex `{pattern}` is not supported: {source}")]
    Regex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error(transparent)]
    Template(#[from] path_template::TemplateError),
}

impl RoutingError {
    pub fn regex(pattern: impl Into<String>, source: regex::Error) -> Self {
        Self::Regex {
            pattern: pattern.into(),
            source,
        }
    }
}
