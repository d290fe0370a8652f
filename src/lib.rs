//! # SRT scraper
//!
//! Nightly ingestion of federal IT solicitations with Section 508
//! compliance classification.
//!
//! The pipeline pulls newly posted solicitations from SAM.gov, keeps those
//! with a qualifying NAICS code, downloads each attachment bundle, extracts
//! the text of every document, scores it with a pretrained compliance model
//! and stores everything in SQLite for the review tool.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌───────────┐   ┌───────────┐   ┌──────────┐
//! │  Fetcher  │──▶│ Hierarchy │──▶│  Archive  │──▶│ Extract  │
//! │ (SAM.gov) │   │ Resolver  │   │ Retriever │   │  (text)  │
//! └───────────┘   └───────────┘   └───────────┘   └────┬─────┘
//!                                                      │
//!                       ┌──────────┐   ┌──────────┐    │
//!                       │  SQLite  │◀──│ Classify │◀───┘
//!                       │ (persist)│   │ (model)  │
//!                       └──────────┘   └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! srt init                                # create database
//! srt run                                 # ingest yesterday's postings
//! srt run --since 2024-03-01 --until 2024-03-07
//! srt stats
//! srt get 0a1b2c3d4e5f
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy |
//! | [`retry`] | Backoff policy for upstream calls |
//! | [`sam`] | SAM.gov HTTP client |
//! | [`fetcher`] | Paged, NAICS-filtered solicitation fetch |
//! | [`hierarchy`] | Agency/office resolution with cache |
//! | [`archive`] | Attachment download and unpacking |
//! | [`extract`] | Text extraction by format |
//! | [`classify`] | Compliance model and classifier |
//! | [`store`] | Store trait and SQLite backend |
//! | [`persist`] | Transactional commit with retry |
//! | [`pipeline`] | Run orchestration |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`stats`] | `srt stats` |
//! | [`get`] | `srt get` |

pub mod archive;
pub mod classify;
pub mod config;
pub mod db;
pub mod error;
pub mod extract;
pub mod fetcher;
pub mod get;
pub mod hierarchy;
pub mod migrate;
pub mod models;
pub mod persist;
pub mod pipeline;
pub mod retry;
pub mod sam;
pub mod stats;
pub mod store;
