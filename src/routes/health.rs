//! Readiness check.

use std::convert::Infallible;

use rocket::request::{FromRequest, Outcome, Request};
use rocket::serde::json::Json;
use rocket_okapi::okapi::schemars::JsonSchema;
use rocket_okapi::openapi;
use rocket_okapi::request::OpenApiFromRequest;
use serde::{Deserialize, Serialize};

use crate::config::ArchivingApiConfig;
use crate::ingest::Archiver;

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct HealthResponse {
    /// `ok` once the server answers.
    pub status: String,
    /// Whether the archiving endpoints can accept messages.
    pub archiving: bool,
}

/// Whether both the archiver and its API settings are managed. Looked up on
/// the running instance so the route mounts without them.
#[derive(Debug, OpenApiFromRequest)]
pub struct ArchivingReadiness(bool);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for ArchivingReadiness {
    type Error = Infallible;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let rocket = request.rocket();
        Outcome::Success(ArchivingReadiness(
            rocket.state::<Archiver>().is_some() && rocket.state::<ArchivingApiConfig>().is_some(),
        ))
    }
}

#[openapi(tag = "Health")]
#[get("/health")]
pub fn health_check(readiness: ArchivingReadiness) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        archiving: readiness.0,
    })
}

