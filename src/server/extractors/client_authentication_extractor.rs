use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{FromRequestParts, Path};
use axum::http::request::Parts;
use axum::Extension;
use tracing::debug;

use crate::server::error::Error;
use crate::server::services::client_services::Client;
use crate::server::services::manager_services::Manager;

/// authenticates a listing request by the secret embedded in the path;
/// unknown or missing secrets are a 403, never a 401, so they cannot be
/// confused with bad proxy tokens
pub struct ClientAuthentication(pub Arc<Client>);

impl<S> FromRequestParts<S> for ClientAuthentication
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Extension(manager): Extension<Arc<Manager>> =
            Extension::from_request_parts(parts, state)
                .await
                .map_err(|err| Error::InternalServerErrorWithContext(err.to_string()))?;

        let Path(params): Path<HashMap<String, String>> =
            Path::from_request_parts(parts, state)
                .await
                .map_err(|_| Error::Forbidden)?;

        let secret = params
            .get("handle")
            .filter(|secret| !secret.is_empty())
            .ok_or(Error::Forbidden)?;

        let Some(client) = manager.client_by_secret(secret) else {
            debug!("authentication failed: unknown client secret");
            return Err(Error::Forbidden);
        };

        Ok(ClientAuthentication(client))
    }
}
