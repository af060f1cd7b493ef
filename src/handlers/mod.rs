//! axum handlers. Each module covers one group of routes.

pub mod event_handlers;
pub mod file_handlers;
pub mod health_handlers;
pub mod share_handlers;

use crate::errors::AppError;
use axum::{extract::FromRequestParts, http::request::Parts};
use uuid::Uuid;

/// Header set by the upstream authentication layer.
pub const OWNER_HEADER: &str = "x-owner-id";

/// The authenticated caller, taken from [`OWNER_HEADER`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner(pub Uuid);

impl<S> FromRequestParts<S> for Owner
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(OWNER_HEADER)
            .ok_or_else(|| AppError::unauthorized("missing caller identity"))?;
        raw.to_str()
            .ok()
            .and_then(|value| Uuid::parse_str(value.trim()).ok())
            .map(Owner)
            .ok_or_else(|| AppError::unauthorized("invalid caller identity"))
    }
}
