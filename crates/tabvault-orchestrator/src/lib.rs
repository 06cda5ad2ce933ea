//! Tabvault Orchestrator Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Backup and disaster-recovery orchestration for managed key-value tables.
//!
//! # Overview
//!
//! - **Backup**: [`export::ExportManager`] starts point-in-time exports,
//!   polls them to a bounded deadline and writes a per-date manifest;
//!   [`offsite::OffsiteMirror`] copies the date to a second provider.
//! - **Restore**: [`restore::RestoreManager`] loads a manifest and restores
//!   each table by batch writes into the existing table or by bulk import
//!   into a new one.
//! - **Seams**: [`table::TableService`] and [`storage::ObjectStore`] are the
//!   only remote surfaces, injected into every component.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tabvault_orchestrator::{
//!     config::Config,
//!     handler::{InvocationRequest, Orchestrator},
//!     storage::S3Storage,
//!     table::{dynamo, DynamoTables},
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let shared = aws_config::load_from_env().await;
//!     let store = S3Storage::new(&shared, config.primary.clone())?;
//!     let account = dynamo::resolve_account(&shared).await?;
//!
//!     let orchestrator = Orchestrator::new(
//!         config,
//!         Arc::new(DynamoTables::new(&shared)),
//!         Arc::new(store),
//!         account,
//!     );
//!     let response = orchestrator.run_restore(InvocationRequest::default()).await;
//!     println!("{}", response.body);
//!     Ok(())
//! }
//! ```

pub mod backups;
pub mod codec;
pub mod config;
pub mod datafile;
pub mod discovery;
pub mod export;
pub mod handler;
pub mod jobs;
pub mod offsite;
pub mod restore;
pub mod storage;
pub mod table;
pub mod writer;
