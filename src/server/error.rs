use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

pub type AppResult<T> = Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("forbidden")]
    Forbidden,

    #[error("unauthorized")]
    Unauthorized,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("upstream failure: {0}")]
    BadGateway(String),

    /// pass an upstream status straight through to the client
    #[error("upstream returned {0}")]
    UpstreamStatus(u16),

    /// permit exhaustion with no error clip configured to show for it
    #[error("too many concurrent streams")]
    RateLimited,

    #[error("internal server error: {0}")]
    InternalServerErrorWithContext(String),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::Forbidden => StatusCode::FORBIDDEN,
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::BadGateway(_) => StatusCode::BAD_GATEWAY,
            Error::UpstreamStatus(code) => {
                StatusCode::from_u16(*code).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Error::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Error::InternalServerErrorWithContext(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        // plain status text bodies, clients of this api are media players
        let body = status.canonical_reason().unwrap_or("error").to_string();
        (status, body).into_response()
    }
}
