use rocket::http::Status;
use rocket::response::{self, Responder};
use rocket::{Request, Response};
use rocket_okapi::r#gen::OpenApiGenerator;
use rocket_okapi::okapi::openapi3::Responses;
use rocket_okapi::response::OpenApiResponderInner;
use rocket_okapi::util::add_schema_response;
use std::io::Cursor;

use crate::ingest::IngestError;
use crate::models::ArchiveErrorBody;
use crate::store::StoreError;

/// Route failure rendered as `{"error": "..."}`.
#[derive(Debug)]
pub enum ApiError {
    Store(StoreError),
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    InternalError(String),
}

impl ApiError {
    pub fn status(&self) -> Status {
        match self {
            ApiError::Store(StoreError::NotFound(_)) | ApiError::NotFound(_) => Status::NotFound,
            ApiError::Store(_) | ApiError::InternalError(_) => Status::InternalServerError,
            ApiError::BadRequest(_) => Status::BadRequest,
            ApiError::Unauthorized(_) => Status::Unauthorized,
            ApiError::Forbidden(_) => Status::Forbidden,
        }
    }
}

impl<'r> Responder<'r, 'static> for ApiError {
    fn respond_to(self, _: &'r Request<'_>) -> response::Result<'static> {
        let status = self.status();
        let message = match self {
            ApiError::Store(e) => {
                log::error!("store error: {}", e);
                e.to_string()
            }
            ApiError::NotFound(msg) => {
                log::debug!("not found: {}", msg);
                msg
            }
            ApiError::BadRequest(msg) => {
                log::debug!("bad request: {}", msg);
                msg
            }
            ApiError::Unauthorized(msg) | ApiError::Forbidden(msg) => {
                log::warn!("archiving api access refused: {}", msg);
                msg
            }
            ApiError::InternalError(msg) => {
                log::error!("internal error: {}", msg);
                msg
            }
        };

        let json = serde_json::to_string(&ArchiveErrorBody { error: message })
            .unwrap_or_else(|_| r#"{"error":"failed to serialize error"}"#.to_string());

        Response::build()
            .status(status)
            .header(rocket::http::ContentType::JSON)
            .sized_body(json.len(), Cursor::new(json))
            .ok()
    }
}

impl OpenApiResponderInner for ApiError {
    fn responses(generator: &mut OpenApiGenerator) -> rocket_okapi::Result<Responses> {
        let mut responses = Responses::default();
        let schema = generator.json_schema::<ArchiveErrorBody>();
        for status in [400, 401, 403, 404, 500] {
            add_schema_response(&mut responses, status, "application/json", schema.clone())?;
        }
        Ok(responses)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Store(err)
    }
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::DuplicateMessage(_)
            | IngestError::MalformedMessage { .. }
            | IngestError::Configuration(_) => ApiError::BadRequest(err.to_string()),
            IngestError::NotFound(msg) => ApiError::NotFound(format!("{} not found", msg)),
            IngestError::Store(store) => ApiError::Store(store),
            other => ApiError::InternalError(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_errors_are_client_errors() {
        let err = ApiError::from(IngestError::malformed("msg", "missing sender address"));
        assert_eq!(err.status(), Status::BadRequest);

        let err = ApiError::from(IngestError::Store(StoreError::Conflict("busy".into())));
        assert_eq!(err.status(), Status::InternalServerError);

        let err = ApiError::from(IngestError::NotFound("message X".into()));
        assert_eq!(err.status(), Status::NotFound);
    }
}
