//! HTTP route handlers.
//!
//! `mailman` is the archiving API the list manager calls; `health` is the
//! readiness probe. Handlers are annotated with `#[openapi]` so
//! `rocket_okapi` can derive an OpenAPI document.

pub mod health;
pub mod mailman;
