//! Trigger intake for flowgate.
//!
//! This crate provides:
//!
//! - **Webhooks**: bot and origin filtering, basic/header/signature
//!   authentication, idempotent run creation, immediate or synchronous replies
//! - **Schedule ticks**: one run per firing, queued when the workflow is busy
//! - **Manual runs**: refused outright when the workflow is busy

pub mod auth;
pub mod config;
pub mod error;
pub mod filter;
pub mod idempotency;
pub mod pipeline;
pub mod webhook;

pub use auth::{authenticate, sign, verify_signature};
pub use config::IntakeConfig;
pub use error::IntakeError;
pub use idempotency::{KeySource, canonical_json, derive_key};
pub use pipeline::{IntakePipeline, ScheduleTrigger, WebhookOutcome, WebhookReply, error_response};
pub use webhook::{
    ResponseMode, ResponseTemplate, WebhookAuth, WebhookRequest, WebhookResponse, WebhookTrigger,
};
