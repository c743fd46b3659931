//! HTTP surface of the bonk bot: GitHub webhooks, the streaming `/ask`
//! endpoint, run registration/finalization and health.

pub mod api_error;
pub mod ask_handler;
pub mod auth;
pub mod bootstrap;
pub mod cli;
pub mod config;
pub mod delivery_cache;
pub mod runs_handler;
pub mod server;
pub mod webhook_handler;
