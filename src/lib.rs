//! # Folio
//!
//! A local-first visual document retrieval engine.
//!
//! Folio ingests documents (PDFs and images) into per-user knowledge bases,
//! rasterizes every page to an image, embeds pages and queries as
//! multi-vector token grids, and answers natural-language questions with
//! two-stage late-interaction search over per-collection ANN indexes.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────────┐   ┌──────────┐
//! │ Uploads  │──▶│ Queue+Workers │──▶│  SQLite  │
//! │ PDF/IMG  │   │ Raster+Embed  │   │ Vectors  │
//! └──────────┘   └───────────────┘   └────┬─────┘
//!                                         │
//!                     ┌───────────────────┤
//!                     ▼                   ▼
//!                ┌──────────┐       ┌──────────┐
//!                │  Search  │       │   Ask    │
//!                │ 2-stage  │       │ context  │
//!                └──────────┘       └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! folio init                              # create database + starter config
//! folio kb create alice research         # create a knowledge base
//! folio ingest <kb-id> paper.pdf         # upload and enqueue documents
//! folio worker --drain                   # process the queue, exit when empty
//! folio status <job-id> --follow         # watch ingestion progress
//! folio ask "what is flash attention?" --kb <kb-id>
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`queue`] | Partitioned ingestion queue |
//! | [`locks`] | Lease-based message locks |
//! | [`progress`] | Job progress tracking |
//! | [`rasterize`] | PDF and image page rendering |
//! | [`embedding`] | Multi-vector embedding client |
//! | [`collections`] | Vector collections and cached ANN graphs |
//! | [`search`] | Two-stage late-interaction search |
//! | [`assemble`] | Context assembly across knowledge bases |
//! | [`worker`] | Queue worker loop |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod ann;
pub mod assemble;
pub mod blob;
pub mod collections;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod kb;
pub mod locks;
pub mod metadata;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod queue;
pub mod rasterize;
pub mod rerank;
pub mod runtime;
pub mod search;
pub mod status;
pub mod worker;
