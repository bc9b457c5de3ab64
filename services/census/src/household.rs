//! Household survey records and the rules that govern their lifecycle.
//!
//! A household is created on intake with only a family name, address and the
//! focal point's e-mail, filled in through general updates, and completed
//! exactly once. The slug is derived at creation and never recomputed.

use crate::s3_gateway::StoredObject;
use crate::validation::{check_count, check_email, check_length, check_url, ValidationErrors};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Survey progress of a household
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SurveyStatus {
    #[default]
    Pending,
    Completed,
}

/// Kind of dwelling the household lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HousingKind {
    Apartment,
    House,
    Condominium,
    Duplex,
    #[serde(rename = "Mobile home")]
    MobileHome,
    Other,
}

/// Housing type with the free-text value used when the kind is `Other`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HousingType {
    pub value: HousingKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_value: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvironmentalPractice {
    Recycling,
    #[serde(rename = "Composting food scraps")]
    Composting,
    #[serde(rename = "Conserving water")]
    WaterConservation,
    #[serde(rename = "Reducing plastic use")]
    PlasticReduction,
    #[serde(rename = "Using reusable shopping bags")]
    ReusableBags,
    #[serde(rename = "Participating in local environmental initiatives")]
    LocalInitiatives,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FamilyMember {
    pub first_name: String,
    pub last_name: String,
    pub birth_date: NaiveDate,
}

/// Primary contact person for the household
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FocalPoint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture_url: Option<String>,
}

/// A surveyed household
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Household {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub slug: String,
    pub family_name: String,
    pub address: String,
    pub survey_status: SurveyStatus,
    pub date_surveyed: Option<DateTime<Utc>>,
    pub focal_point: FocalPoint,
    #[serde(default)]
    pub family_members: Vec<FamilyMember>,
    #[serde(default)]
    pub number_of_cars: u32,
    #[serde(default)]
    pub has_pets: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number_of_pets: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub housing_type: Option<HousingType>,
    #[serde(default)]
    pub environmental_practices: Vec<EnvironmentalPractice>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Object backing `focal_point.picture_url` when this service stored it
    #[serde(skip)]
    pub photo: Option<StoredObject>,
}

/// Intake payload for a new household
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewHousehold {
    #[serde(default)]
    pub family_name: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub focal_point: NewFocalPoint,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewFocalPoint {
    pub first_name: Option<String>,
    #[serde(default)]
    pub email: String,
}

/// Partial household payload; absent fields are left untouched
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HouseholdUpdate {
    pub family_name: Option<String>,
    pub address: Option<String>,
    pub survey_status: Option<SurveyStatus>,
    pub date_surveyed: Option<DateTime<Utc>>,
    pub focal_point: Option<FocalPointUpdate>,
    pub family_members: Option<Vec<FamilyMember>>,
    pub number_of_cars: Option<i64>,
    pub has_pets: Option<bool>,
    pub number_of_pets: Option<i64>,
    pub housing_type: Option<HousingType>,
    pub environmental_practices: Option<Vec<EnvironmentalPractice>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FocalPointUpdate {
    pub first_name: Option<String>,
    pub email: Option<String>,
    pub picture_url: Option<String>,
}

/// Who is updating a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// Surveyor edits; the focal point e-mail is fixed
    General,
    /// Administrative edits; may change the focal point e-mail
    Admin,
}

/// Derive the URL-safe slug from the family name and focal point e-mail
///
/// `"Van Dyke"` + `"J.Doe@x.org"` gives `van-dyke-j-doe`.
pub fn derive_slug(family_name: &str, email: &str) -> String {
    let family = family_name.trim().to_lowercase().replace(' ', "-");
    let local = email
        .trim()
        .to_lowercase()
        .split('@')
        .next()
        .unwrap_or_default()
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' => c,
            _ => '-',
        })
        .collect::<String>();
    format!("{family}-{local}")
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl Household {
    /// Build a pending household from an intake payload
    pub fn create(input: NewHousehold, now: DateTime<Utc>) -> Result<Self, ValidationErrors> {
        let mut errors = ValidationErrors::new();
        check_length(&mut errors, "familyName", &input.family_name, 1, 100, "Family name");
        check_length(&mut errors, "address", &input.address, 1, 200, "Address");
        check_email(&mut errors, "focalPoint.email", &input.focal_point.email);

        let first_name = non_empty(input.focal_point.first_name);
        if let Some(ref name) = first_name {
            check_length(&mut errors, "focalPoint.firstName", name, 1, 50, "First name");
        }
        errors.into_result()?;

        let family_name = input.family_name.trim().to_string();
        let email = input.focal_point.email.trim().to_string();

        Ok(Self {
            id: Uuid::new_v4(),
            slug: derive_slug(&family_name, &email),
            family_name,
            address: input.address.trim().to_string(),
            survey_status: SurveyStatus::Pending,
            date_surveyed: None,
            focal_point: FocalPoint {
                first_name,
                email,
                picture_url: None,
            },
            family_members: Vec::new(),
            number_of_cars: 0,
            has_pets: false,
            number_of_pets: None,
            housing_type: None,
            environmental_practices: Vec::new(),
            created_at: now,
            updated_at: now,
            photo: None,
        })
    }

    /// Merge a partial update into the record
    pub fn apply_update(
        &mut self,
        update: HouseholdUpdate,
        mode: UpdateMode,
        now: DateTime<Utc>,
    ) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if let Some(status) = update.survey_status {
            if status != self.survey_status {
                errors.add(
                    "surveyStatus",
                    "Survey status can only change by completing the survey",
                );
            }
        }
        if update.date_surveyed.is_some() && update.date_surveyed != self.date_surveyed {
            errors.add(
                "dateSurveyed",
                "Survey date is set when the survey is completed",
            );
        }

        let mut merged = self.merge(update, mode, &mut errors);
        errors.into_result()?;

        merged.updated_at = now;
        *self = merged;
        Ok(())
    }

    /// Merge the final survey answers and mark the survey completed
    pub fn complete(
        &mut self,
        mut update: HouseholdUpdate,
        now: DateTime<Utc>,
    ) -> Result<(), ValidationErrors> {
        if self.survey_status == SurveyStatus::Completed {
            return Err(ValidationErrors::single(
                "surveyStatus",
                "Survey has already been completed",
            ));
        }

        // Completion owns these two fields.
        update.survey_status = None;
        update.date_surveyed = None;

        let mut errors = ValidationErrors::new();
        let mut merged = self.merge(update, UpdateMode::General, &mut errors);

        if merged.has_pets && !matches!(merged.number_of_pets, Some(n) if n > 0) {
            if !errors.has("numberOfPets") {
                errors.add(
                    "numberOfPets",
                    "Number of pets must be greater than 0 when has pets is true",
                );
            }
        }
        errors.into_result()?;

        merged.survey_status = SurveyStatus::Completed;
        merged.date_surveyed = Some(now);
        merged.updated_at = now;
        *self = merged;
        Ok(())
    }

    /// Point the focal point photo at a newly stored object
    pub fn set_photo(&mut self, object: StoredObject, now: DateTime<Utc>) {
        self.focal_point.picture_url = Some(object.public_url());
        self.photo = Some(object);
        self.updated_at = now;
    }

    /// Apply `update` to a copy of the record, collecting field errors
    fn merge(
        &self,
        update: HouseholdUpdate,
        mode: UpdateMode,
        errors: &mut ValidationErrors,
    ) -> Household {
        let mut merged = self.clone();

        if let Some(family_name) = update.family_name {
            check_length(errors, "familyName", &family_name, 1, 100, "Family name");
            merged.family_name = family_name.trim().to_string();
        }
        if let Some(address) = update.address {
            check_length(errors, "address", &address, 1, 200, "Address");
            merged.address = address.trim().to_string();
        }

        if let Some(focal) = update.focal_point {
            merged.focal_point = self.merge_focal_point(focal, mode, errors);
            if merged.focal_point.picture_url != self.focal_point.picture_url {
                merged.photo = None;
            }
        }

        if let Some(members) = update.family_members {
            for (i, member) in members.iter().enumerate() {
                let prefix = format!("familyMembers.{i}");
                check_length(
                    errors,
                    &format!("{prefix}.firstName"),
                    &member.first_name,
                    1,
                    50,
                    "First name",
                );
                check_length(
                    errors,
                    &format!("{prefix}.lastName"),
                    &member.last_name,
                    1,
                    50,
                    "Last name",
                );
            }
            merged.family_members = members;
        }

        if let Some(cars) = update.number_of_cars {
            merged.number_of_cars = check_count(errors, "numberOfCars", cars, "Number of cars");
        }
        if let Some(has_pets) = update.has_pets {
            merged.has_pets = has_pets;
        }
        if let Some(pets) = update.number_of_pets {
            let count = check_count(errors, "numberOfPets", pets, "Number of pets");
            if count == 0 && !errors.has("numberOfPets") {
                errors.add(
                    "numberOfPets",
                    "Number of pets must be greater than 0 when has pets is true",
                );
            }
            merged.number_of_pets = Some(count);
        }
        if !merged.has_pets {
            merged.number_of_pets = None;
        }

        if let Some(mut housing) = update.housing_type {
            housing.custom_value = non_empty(housing.custom_value);
            match (housing.value, &housing.custom_value) {
                (HousingKind::Other, None) => errors.add(
                    "housingType.customValue",
                    "Custom value is required when housing type is 'Other'",
                ),
                (HousingKind::Other, Some(_)) | (_, None) => {}
                (_, Some(_)) => errors.add(
                    "housingType.customValue",
                    "Custom value is only allowed when housing type is 'Other'",
                ),
            }
            merged.housing_type = Some(housing);
        }

        if let Some(mut practices) = update.environmental_practices {
            let mut seen = Vec::with_capacity(practices.len());
            practices.retain(|p| {
                let fresh = !seen.contains(p);
                seen.push(*p);
                fresh
            });
            merged.environmental_practices = practices;
        }

        merged
    }

    fn merge_focal_point(
        &self,
        update: FocalPointUpdate,
        mode: UpdateMode,
        errors: &mut ValidationErrors,
    ) -> FocalPoint {
        let mut focal = self.focal_point.clone();

        if let Some(first_name) = update.first_name {
            check_length(errors, "focalPoint.firstName", &first_name, 1, 50, "First name");
            focal.first_name = Some(first_name.trim().to_string());
        }

        if let Some(email) = update.email {
            let email = email.trim().to_string();
            if !email.eq_ignore_ascii_case(&self.focal_point.email) {
                match mode {
                    UpdateMode::Admin => {
                        check_email(errors, "focalPoint.email", &email);
                        focal.email = email;
                    }
                    UpdateMode::General => errors.add(
                        "focalPoint.email",
                        "Focal point email can only be changed by an administrator",
                    ),
                }
            }
        }

        if let Some(url) = update.picture_url {
            let url = url.trim().to_string();
            if url.is_empty() {
                focal.picture_url = None;
            } else {
                check_url(errors, "focalPoint.pictureUrl", &url);
                focal.picture_url = Some(url);
            }
        }

        focal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn smith() -> Household {
        Household::create(
            NewHousehold {
                family_name: "Smith".to_string(),
                address: "1 Main St".to_string(),
                focal_point: NewFocalPoint {
                    first_name: None,
                    email: "a@b.com".to_string(),
                },
            },
            now(),
        )
        .unwrap()
    }

    fn photo() -> StoredObject {
        StoredObject {
            bucket: "dev-census-surveyor-0".to_string(),
            region: "us-east-1".to_string(),
            key: "focal-point-photos/photo_1.jpg".to_string(),
        }
    }

    #[test]
    fn test_derive_slug() {
        assert_eq!(derive_slug("Smith", "a@b.com"), "smith-a");
        assert_eq!(derive_slug("Van Dyke", "J.Doe+x@y.org"), "van-dyke-j-doe-x");
    }

    #[test]
    fn test_create_is_pending() {
        let household = smith();
        assert_eq!(household.survey_status, SurveyStatus::Pending);
        assert_eq!(household.date_surveyed, None);
        assert_eq!(household.slug, "smith-a");
        assert_eq!(household.created_at, household.updated_at);
    }

    #[test]
    fn test_create_rejects_missing_fields() {
        let err = Household::create(NewHousehold::default(), now()).unwrap_err();
        assert!(err.has("familyName"));
        assert!(err.has("address"));
        assert!(err.has("focalPoint.email"));
    }

    #[test]
    fn test_general_update_keeps_email_and_slug() {
        let mut household = smith();
        let update = HouseholdUpdate {
            focal_point: Some(FocalPointUpdate {
                email: Some("other@b.com".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let err = household
            .apply_update(update, UpdateMode::General, now())
            .unwrap_err();
        assert!(err.has("focalPoint.email"));
        assert_eq!(household.focal_point.email, "a@b.com");
    }

    #[test]
    fn test_admin_update_changes_email_not_slug() {
        let mut household = smith();
        let update = HouseholdUpdate {
            focal_point: Some(FocalPointUpdate {
                email: Some("new@b.com".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        household
            .apply_update(update, UpdateMode::Admin, now())
            .unwrap();
        assert_eq!(household.focal_point.email, "new@b.com");
        assert_eq!(household.slug, "smith-a");
    }

    #[test]
    fn test_update_cannot_complete() {
        let mut household = smith();
        let update = HouseholdUpdate {
            survey_status: Some(SurveyStatus::Completed),
            ..Default::default()
        };

        let err = household
            .apply_update(update, UpdateMode::General, now())
            .unwrap_err();
        assert!(err.has("surveyStatus"));
        assert_eq!(household.survey_status, SurveyStatus::Pending);
    }

    #[test]
    fn test_housing_custom_value_rules() {
        let mut household = smith();
        let other_without_text = HouseholdUpdate {
            housing_type: Some(HousingType {
                value: HousingKind::Other,
                custom_value: Some("  ".to_string()),
            }),
            ..Default::default()
        };
        assert!(household
            .apply_update(other_without_text, UpdateMode::General, now())
            .is_err());

        let house_with_text = HouseholdUpdate {
            housing_type: Some(HousingType {
                value: HousingKind::House,
                custom_value: Some("Treehouse".to_string()),
            }),
            ..Default::default()
        };
        assert!(household
            .apply_update(house_with_text, UpdateMode::General, now())
            .is_err());

        let other_with_text = HouseholdUpdate {
            housing_type: Some(HousingType {
                value: HousingKind::Other,
                custom_value: Some("Houseboat".to_string()),
            }),
            ..Default::default()
        };
        household
            .apply_update(other_with_text, UpdateMode::General, now())
            .unwrap();
        assert_eq!(
            household.housing_type.unwrap().custom_value.as_deref(),
            Some("Houseboat")
        );
    }

    #[test]
    fn test_no_pets_clears_count() {
        let mut household = smith();
        household
            .apply_update(
                HouseholdUpdate {
                    has_pets: Some(true),
                    number_of_pets: Some(3),
                    ..Default::default()
                },
                UpdateMode::General,
                now(),
            )
            .unwrap();
        assert_eq!(household.number_of_pets, Some(3));

        household
            .apply_update(
                HouseholdUpdate {
                    has_pets: Some(false),
                    ..Default::default()
                },
                UpdateMode::General,
                now(),
            )
            .unwrap();
        assert_eq!(household.number_of_pets, None);
    }

    #[test]
    fn test_complete_requires_pet_count() {
        let mut household = smith();
        let zero_pets = HouseholdUpdate {
            has_pets: Some(true),
            number_of_pets: Some(0),
            ..Default::default()
        };
        let err = household.complete(zero_pets, now()).unwrap_err();
        assert!(err.has("numberOfPets"));
        assert_eq!(household.survey_status, SurveyStatus::Pending);

        let missing_pets = HouseholdUpdate {
            has_pets: Some(true),
            ..Default::default()
        };
        assert!(household.complete(missing_pets, now()).is_err());

        let two_pets = HouseholdUpdate {
            has_pets: Some(true),
            number_of_pets: Some(2),
            ..Default::default()
        };
        household.complete(two_pets, now()).unwrap();
        assert_eq!(household.survey_status, SurveyStatus::Completed);
        assert_eq!(household.date_surveyed, Some(now()));
    }

    #[test]
    fn test_complete_only_once() {
        let mut household = smith();
        household.complete(HouseholdUpdate::default(), now()).unwrap();

        let err = household
            .complete(HouseholdUpdate::default(), now())
            .unwrap_err();
        assert!(err.has("surveyStatus"));
    }

    #[test]
    fn test_changing_picture_url_drops_stored_object() {
        let mut household = smith();
        household.set_photo(photo(), now());
        assert_eq!(
            household.focal_point.picture_url.as_deref(),
            Some("https://dev-census-surveyor-0.s3.us-east-1.amazonaws.com/focal-point-photos/photo_1.jpg")
        );

        household
            .apply_update(
                HouseholdUpdate {
                    focal_point: Some(FocalPointUpdate {
                        picture_url: Some("https://example.com/me.png".to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                UpdateMode::General,
                now(),
            )
            .unwrap();
        assert_eq!(household.photo, None);
    }

    #[test]
    fn test_json_layout() {
        let mut household = smith();
        household.set_photo(photo(), now());
        let json = serde_json::to_value(&household).unwrap();

        assert!(json.get("_id").is_some());
        assert_eq!(json["surveyStatus"], "pending");
        assert!(json["dateSurveyed"].is_null());
        assert_eq!(json["focalPoint"]["email"], "a@b.com");
        assert!(json["focalPoint"]["pictureUrl"].is_string());
        assert!(json.get("photo").is_none());
    }

    #[test]
    fn test_practices_deserialize_from_labels() {
        let update: HouseholdUpdate = serde_json::from_value(serde_json::json!({
            "housingType": { "value": "Mobile home" },
            "environmentalPractices": ["Recycling", "Conserving water", "Recycling"]
        }))
        .unwrap();

        let mut household = smith();
        household
            .apply_update(update, UpdateMode::General, now())
            .unwrap();
        assert_eq!(
            household.environmental_practices,
            vec![
                EnvironmentalPractice::Recycling,
                EnvironmentalPractice::WaterConservation
            ]
        );
        assert_eq!(household.housing_type.unwrap().value, HousingKind::MobileHome);
    }
}
