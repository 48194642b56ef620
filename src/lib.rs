//! # kbserve
//!
//! A multi-tenant retrieval-augmented chat service with metered billing.
//!
//! Each tenant uploads documents against an API key, asks questions over
//! its own knowledge base, and is billed by characters ingested,
//! characters stored, and approximate chat tokens. Isolation is
//! structural: every retrieval query carries the caller's key as a
//! mandatory filter.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────────┐   ┌───────────┐
//! │  Upload   │──▶│   Pipeline     │──▶│  SQLite    │
//! │ text/PDF  │   │ Chunk + Embed  │   │ docs+vecs  │
//! └──────────┘   └────────────────┘   └─────┬─────┘
//!                                           │
//!            ┌──────────────────────────────┤
//!            ▼                              ▼
//!      ┌──────────┐                  ┌────────────┐
//!      │ Retrieve  │───▶ prompt ───▶ │ Generator   │
//!      │  top-k    │                 │ groq/ollama │
//!      └──────────┘                  └────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`registry`] | Tenants, API keys, plans |
//! | [`ledger`] | Durable usage counters |
//! | [`quota`] | Admission decisions |
//! | [`ratelimit`] | Per-tenant fixed-window limiting |
//! | [`chunk`] | Text chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`vector`] | Tenant-filtered vector store |
//! | [`store`] | Document staging and deletion |
//! | [`retrieve`] | Query-time retrieval gateway |
//! | [`generator`] | Chat completion providers |
//! | [`ingest`] | Ingestion orchestrator |
//! | [`chat`] | Chat orchestrator |
//! | [`server`] | HTTP API server |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations and plan seeding |

pub mod chat;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod generator;
pub mod ingest;
pub mod ledger;
pub mod migrate;
pub mod models;
pub mod prompt;
pub mod quota;
pub mod ratelimit;
pub mod registry;
pub mod retrieve;
pub mod server;
pub mod store;
pub mod vector;
