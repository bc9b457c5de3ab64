//! Sample data for local databases.

use crate::household::{Household, HouseholdUpdate, NewHousehold, UpdateMode};
use crate::household_store::HouseholdStore;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::info;

/// One entry of the seed file: intake fields, optional survey answers, and
/// whether the survey should end up completed
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedHousehold {
    #[serde(flatten)]
    pub intake: NewHousehold,
    #[serde(default)]
    pub survey: Option<HouseholdUpdate>,
    #[serde(default)]
    pub completed: bool,
}

/// Parse a seed file body
pub fn parse(json: &str) -> Result<Vec<SeedHousehold>> {
    serde_json::from_str(json).context("Seed file is not a list of households")
}

/// Build a household through the same rules the API applies
pub fn build(seed: SeedHousehold, now: DateTime<Utc>) -> Result<Household> {
    let family_name = seed.intake.family_name.clone();
    let mut household = Household::create(seed.intake, now)
        .with_context(|| format!("Invalid seed household '{family_name}'"))?;

    let survey = seed.survey.unwrap_or_default();
    if seed.completed {
        household
            .complete(survey, now)
            .with_context(|| format!("Cannot complete seed household '{family_name}'"))?;
    } else {
        household
            .apply_update(survey, UpdateMode::General, now)
            .with_context(|| format!("Invalid survey for seed household '{family_name}'"))?;
    }

    Ok(household)
}

/// Insert every seed household, stopping at the first failure
pub async fn import(store: &dyn HouseholdStore, seeds: Vec<SeedHousehold>) -> Result<usize> {
    let now = Utc::now();
    let mut imported = 0;

    for seed in seeds {
        let household = build(seed, now)?;
        store
            .insert(&household)
            .await
            .with_context(|| format!("Failed to insert household '{}'", household.slug))?;
        imported += 1;
    }

    info!(imported, "Seed households imported");
    Ok(imported)
}
