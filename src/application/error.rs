use std::error::Error as StdError;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::{
    application::render::RenderError,
    cache::{IncrementalError, StoreError, TagIndexError},
    infra::{error::InfraError, manifests::ManifestError},
    routing::RoutingError,
};

/// Diagnostic chain attached to error responses and picked up by the response logger.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub status: StatusCode,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, status: StatusCode, error: &dyn StdError) -> Self {
        let mut messages = Vec::new();
        messages.push(error.to_string());
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self {
            source,
            status,
            messages,
        }
    }

    pub fn from_message(
        source: &'static str,
        status: StatusCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source,
            status,
            messages: vec![message.into()],
        }
    }

    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    public_message: &'static str,
    report: ErrorReport,
}

impl HttpError {
    pub fn new(
        source: &'static str,
        status: StatusCode,
        public_message: &'static str,
        detail: impl Into<String>,
    ) -> Self {
        let report = ErrorReport::from_message(source, status, detail);
        Self {
            status,
            public_message,
            report,
        }
    }

    pub fn from_error(
        source: &'static str,
        status: StatusCode,
        public_message: &'static str,
        error: &dyn StdError,
    ) -> Self {
        let report = ErrorReport::from_error(source, status, error);
        Self {
            status,
            public_message,
            report,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let mut response = (self.status, self.public_message).into_response();
        self.report.attach(&mut response);
        response
    }
}

impl From<RenderError> for HttpError {
    fn from(error: RenderError) -> Self {
        let status = match error {
            RenderError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            RenderError::Upstream { .. } | RenderError::Target { .. } => StatusCode::BAD_GATEWAY,
        };
        HttpError::from_error(
            "application::render",
            status,
            "Render origin unavailable",
            &error,
        )
    }
}

impl From<IncrementalError> for HttpError {
    fn from(error: IncrementalError) -> Self {
        HttpError::from_error(
            "cache::incremental",
            StatusCode::SERVICE_UNAVAILABLE,
            "Cache write failed",
            &error,
        )
    }
}

impl From<StoreError> for HttpError {
    fn from(error: StoreError) -> Self {
        HttpError::from_error(
            "cache::store",
            StatusCode::SERVICE_UNAVAILABLE,
            "Cache unavailable",
            &error,
        )
    }
}

impl From<TagIndexError> for HttpError {
    fn from(error: TagIndexError) -> Self {
        HttpError::from_error(
            "cache::tag_index",
            StatusCode::SERVICE_UNAVAILABLE,
            "Tag index unavailable",
            &error,
        )
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error("resource not found")]
    NotFound,
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Infra(InfraError::HttpClient { .. }) => StatusCode::BAD_GATEWAY,
            AppError::Infra(_) | AppError::Unexpected(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn presentation_message(&self) -> &'static str {
        match self {
            AppError::NotFound => "Resource not found",
            AppError::Validation(_) => "Request could not be processed",
            AppError::Infra(InfraError::HttpClient { .. }) => "Upstream unavailable",
            AppError::Infra(InfraError::Configuration { .. }) => "Service misconfigured",
            AppError::Infra(InfraError::Manifest(_)) => "Build output could not be loaded",
            AppError::Infra(InfraError::Telemetry(_)) => "Logging subsystem could not start",
            AppError::Infra(InfraError::Io(_)) => "I/O failure during request",
            AppError::Unexpected(_) => "Unexpected error occurred",
        }
    }
}

impl From<ManifestError> for AppError {
    fn from(error: ManifestError) -> Self {
        AppError::Infra(InfraError::Manifest(error))
    }
}

impl From<RoutingError> for AppError {
    fn from(error: RoutingError) -> Self {
        AppError::Infra(InfraError::Manifest(ManifestError::Routing(error)))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = self.presentation_message();
        let report = ErrorReport::from_error("application::error::AppError", status, &self);
        let mut response = (status, message).into_response();
        report.attach(&mut response);
        response
    }
}
