//! # perp-agent
//!
//! AI-driven decision cycle for USDT-margined perpetual futures.
//!
//! Each cycle gathers market, account and position context, renders a
//! system and user prompt (with adaptive feedback from the realised Sharpe
//! ratio), calls a chat-completion endpoint, parses the reasoning trace and
//! JSON decision array, validates the batch against per-asset-class risk
//! caps and hands it to a [`agent::executor::Trader`].
//!
//! ## Modules
//! - `agent`: the pipeline stages and their collaborators
//! - `config`: environment-backed configuration

pub mod agent;
pub mod config;
