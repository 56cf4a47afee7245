//! # gcli2api
//!
//! An OpenAI-compatible gateway over a pool of Gemini CLI OAuth credentials.
//!
//! Requests arrive in the OpenAI chat-completions wire format, are
//! translated to the Gemini backend payload, executed with one credential
//! picked from the pool (randomized, cooldown- and disable-aware), and the
//! response is translated back — unary JSON or an SSE stream.
//!
//! ## Request flow
//!
//! ```text
//! client ──► api (auth, health-check, normalize)
//!              │
//!              ▼
//!          features (decode model suffixes) ──► translate (OpenAI → Gemini)
//!              │
//!              ▼
//!          credentials (pool selection) ──► upstream (authenticated call,
//!              │                            token refresh, 429 rotation)
//!              ▼
//!          streaming (direct / fake / anti-truncation, image rehosting)
//!              │
//!              ▼
//!          translate (Gemini → OpenAI) ──► client
//! ```
//!
//! ## Modules
//! - `api`: HTTP surface (`/v1` and `/antigravity/v1`)
//! - `storage`: credential + config persistence (PostgreSQL, Valkey, files)
//! - `credentials`: pool selection, cooldowns, error-driven disabling
//! - `translate`: wire-format conversion in both directions
//! - `upstream`: the authenticated backend client
//! - `streaming`: SSE pipeline (heartbeats, continuation, de-duplication)
//! - `images`: optional rehosting of generated inline images

pub mod api;
pub mod config;
pub mod credentials;
pub mod features;
pub mod images;
pub mod models;
pub mod storage;
pub mod streaming;
pub mod translate;
pub mod upstream;

pub use config::Config;
