use crate::config::DatabaseConfig;
use crate::household::Household;
use crate::s3_gateway::StoredObject;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::FromRow;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Errors raised by a household store
#[derive(Debug, Error)]
pub enum StoreError {
    /// Another household already carries this slug
    #[error("Duplicate field value entered")]
    DuplicateSlug(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Persistence for household records
#[async_trait]
pub trait HouseholdStore: Send + Sync {
    /// All households, newest first
    async fn list(&self) -> Result<Vec<Household>, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Household>, StoreError>;

    async fn insert(&self, household: &Household) -> Result<(), StoreError>;

    /// Overwrite a stored household; `false` if it no longer exists
    async fn replace(&self, household: &Household) -> Result<bool, StoreError>;

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Remove every household, returning how many were removed
    async fn delete_all(&self) -> Result<u64, StoreError>;

    /// Connectivity check behind `/ready`
    async fn ping(&self) -> Result<(), StoreError>;
}

#[derive(Debug, FromRow)]
struct HouseholdRow {
    document: Json<Household>,
    photo: Option<Json<StoredObject>>,
}

impl From<HouseholdRow> for Household {
    fn from(row: HouseholdRow) -> Self {
        let mut household = row.document.0;
        household.photo = row.photo.map(|p| p.0);
        household
    }
}

/// Household store in PostgreSQL, one JSONB document per row
pub struct PgHouseholdStore {
    pool: PgPool,
}

impl PgHouseholdStore {
    /// Create a new store with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }
}

fn map_insert_error(e: sqlx::Error, slug: &str) -> StoreError {
    match e {
        sqlx::Error::Database(ref db) if db.is_unique_violation() => {
            StoreError::DuplicateSlug(slug.to_string())
        }
        other => StoreError::Database(other),
    }
}

#[async_trait]
impl HouseholdStore for PgHouseholdStore {
    #[instrument(skip(self))]
    async fn list(&self) -> Result<Vec<Household>, StoreError> {
        let rows = sqlx::query_as::<_, HouseholdRow>(
            r#"
            SELECT document, photo
            FROM households
            ORDER BY created_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Household::from).collect())
    }

    #[instrument(skip(self))]
    async fn get(&self, id: Uuid) -> Result<Option<Household>, StoreError> {
        let row = sqlx::query_as::<_, HouseholdRow>(
            r#"
            SELECT document, photo
            FROM households
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Household::from))
    }

    #[instrument(skip(self, household), fields(household_id = %household.id, slug = %household.slug))]
    async fn insert(&self, household: &Household) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO households (
                id, slug, focal_point_email, document, photo, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7
            )
            "#,
        )
        .bind(household.id)
        .bind(&household.slug)
        .bind(&household.focal_point.email)
        .bind(Json(household))
        .bind(household.photo.as_ref().map(Json))
        .bind(household.created_at)
        .bind(household.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_insert_error(e, &household.slug))?;

        debug!("Household inserted");
        Ok(())
    }

    #[instrument(skip(self, household), fields(household_id = %household.id))]
    async fn replace(&self, household: &Household) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE households
            SET focal_point_email = $2,
                document = $3,
                photo = $4,
                updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(household.id)
        .bind(&household.focal_point.email)
        .bind(Json(household))
        .bind(household.photo.as_ref().map(Json))
        .bind(household.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM households WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn delete_all(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM households")
            .execute(&self.pool)
            .await?;

        info!(deleted_count = result.rows_affected(), "Deleted all households");
        Ok(result.rows_affected())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// In-process household store
#[derive(Default)]
pub struct MemoryHouseholdStore {
    households: RwLock<HashMap<Uuid, Household>>,
}

impl MemoryHouseholdStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HouseholdStore for MemoryHouseholdStore {
    async fn list(&self) -> Result<Vec<Household>, StoreError> {
        let mut households: Vec<Household> = self.households.read().values().cloned().collect();
        households.sort_by(|a, b| newest_first(a.created_at, b.created_at));
        Ok(households)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Household>, StoreError> {
        Ok(self.households.read().get(&id).cloned())
    }

    async fn insert(&self, household: &Household) -> Result<(), StoreError> {
        let mut households = self.households.write();
        if households.values().any(|h| h.slug == household.slug) {
            return Err(StoreError::DuplicateSlug(household.slug.clone()));
        }
        households.insert(household.id, household.clone());
        Ok(())
    }

    async fn replace(&self, household: &Household) -> Result<bool, StoreError> {
        let mut households = self.households.write();
        match households.get_mut(&household.id) {
            Some(existing) => {
                *existing = household.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(self.households.write().remove(&id).is_some())
    }

    async fn delete_all(&self) -> Result<u64, StoreError> {
        let mut households = self.households.write();
        let count = households.len() as u64;
        households.clear();
        Ok(count)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

fn newest_first(a: DateTime<Utc>, b: DateTime<Utc>) -> std::cmp::Ordering {
    b.cmp(&a)
}
