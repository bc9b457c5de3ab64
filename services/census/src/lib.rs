//! Census Service
//!
//! REST API for household survey records. Surveyors register households,
//! fill in the survey over several visits and complete it once; each
//! household's focal point can carry a profile photo kept in S3.
//!
//! ## Features
//!
//! - **Household Records**: create, list, update, admin-update, complete and
//!   delete survey records, stored as JSON documents in PostgreSQL
//! - **Photo Pipeline**: validate uploads, reduce quality by size tier,
//!   replace the previous photo in the same slot and store the new one
//! - **Environment Guard**: superseded photos are only deleted from the
//!   bucket owned by the running deployment environment
//!
//! ## Architecture
//!
//! ```text
//!  HTTP (axum)                                          PostgreSQL
//! ┌──────────────┐          ┌──────────────┐           ┌──────────────┐
//! │ Households   │─────────▶│ Household    │──────────▶│ households   │
//! │ API          │          │ Store        │           │  (JSONB)     │
//! └──────────────┘          └──────────────┘           └──────────────┘
//!        │                         ▲
//!        │ multipart               │ new photo reference
//!        ▼                         │
//! ┌──────────────┐          ┌──────────────┐           ┌──────────────┐
//! │ Photo        │─────────▶│ Transcoder   │           │ S3 Bucket    │
//! │ Uploader     │          └──────────────┘           │ {prefix}/    │
//! └──────────────┘                                     │  photo_{id}  │
//!        │                  ┌──────────────┐           └──────────────┘
//!        └─────────────────▶│ Photo        │──────────────────▲
//!                           │ Gateway      │  delete old, put new
//!                           └──────────────┘
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod household;
pub mod household_store;
pub mod photo_upload;
pub mod s3_gateway;
pub mod seed;
pub mod transcoder;
pub mod validation;

pub use api::{create_router, start_api_server, AppState};
pub use config::{Config, Environment};
pub use error::ApiError;
pub use household::{Household, HouseholdUpdate, NewHousehold, UpdateMode};
pub use household_store::{HouseholdStore, MemoryHouseholdStore, PgHouseholdStore, StoreError};
pub use photo_upload::{IncomingFile, PhotoError, PhotoUploader, UploadedPhoto};
pub use s3_gateway::{MemoryObjectStore, ObjectStore, PhotoGateway, S3ObjectStore, StoredObject};
pub use transcoder::{TranscodeError, TranscodeLimits, Transcoder};
