//! Core domain model for the salary scraper: reference catalog entries,
//! fetched documents, scrape requests and the rows written to permanent storage.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "salary-core";

/// Default cap on how many reference entities are listed per category.
pub const DEFAULT_REFERENCE_LIMIT: usize = 2000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("invalid category `{0}`; expected one of specializations, skills, regions, companies")]
    InvalidCategory(String),
    #[error("combinations, when given, must contain at least one tuple")]
    EmptyCombinations,
    #[error("combination #{0} has no (category, value) pairs")]
    EmptyCombination(usize),
    #[error("combination #{index} names {category} more than once; only skills may repeat")]
    RepeatedCategory { index: usize, category: Category },
}

/// Reference-entity type. Each category maps to one reference table and one
/// nullable foreign key on `reports`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    Specialization,
    Skill,
    Region,
    Company,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Specialization,
        Category::Skill,
        Category::Region,
        Category::Company,
    ];

    pub fn table_name(self) -> &'static str {
        match self {
            Category::Specialization => "specializations",
            Category::Skill => "skills",
            Category::Region => "regions",
            Category::Company => "companies",
        }
    }

    /// Whether one upstream query can carry several values of this category.
    /// Only skills are sent as a list the service intersects.
    pub fn accepts_many(self) -> bool {
        matches!(self, Category::Skill)
    }

    /// Column on `reports` that references this category's table.
    pub fn report_column(self) -> &'static str {
        match self {
            Category::Specialization => "specialization_id",
            Category::Skill => "skill_id",
            Category::Region => "region_id",
            Category::Company => "company_id",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

impl FromStr for Category {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "specializations" | "specialization" => Ok(Category::Specialization),
            "skills" | "skill" => Ok(Category::Skill),
            "regions" | "region" => Ok(Category::Region),
            "companies" | "company" => Ok(Category::Company),
            _ => Err(CoreError::InvalidCategory(s.to_string())),
        }
    }
}

impl Serialize for Category {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.table_name())
    }
}

impl<'de> Deserialize<'de> for Category {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Snapshot of one catalog row. `alias` is what the upstream API understands,
/// `id` is what gets written into `reports`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceEntity {
    pub id: i64,
    pub title: String,
    pub alias: String,
}

impl ReferenceEntity {
    pub fn new(id: i64, title: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            alias: alias.into(),
        }
    }

    /// Case-insensitive match on alias or title.
    pub fn matches_alias(&self, value: &str) -> bool {
        self.alias.to_lowercase() == value.to_lowercase()
    }

    pub fn matches_title(&self, value: &str) -> bool {
        self.title.to_lowercase() == value.to_lowercase()
    }
}

/// Upstream answer attributed to a single reference entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchedDocument {
    pub payload: JsonValue,
    pub subject_id: i64,
    pub subject_category: Category,
}

/// A document as held by a staging buffer, stamped when it was written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedDocument {
    pub document: FetchedDocument,
    pub fetched_at: DateTime<Utc>,
}

/// Number of entries in the payload's `groups` array. `None` when the array
/// is missing or not an array.
pub fn group_count(payload: &JsonValue) -> Option<usize> {
    payload
        .get("groups")
        .and_then(|groups| groups.as_array())
        .map(|groups| groups.len())
}

/// Literal cross-category tuple queried as one upstream call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Combination(pub Vec<(Category, String)>);

impl Combination {
    pub fn new<I, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (Category, V)>,
        V: Into<String>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(category, value)| (category, value.into()))
                .collect(),
        )
    }

    pub fn pairs(&self) -> &[(Category, String)] {
        &self.0
    }

    /// First category other than skills that appears twice.
    pub fn repeated_single_category(&self) -> Option<Category> {
        let mut seen = Vec::with_capacity(self.0.len());
        for (category, _) in &self.0 {
            if category.accepts_many() {
                continue;
            }
            if seen.contains(category) {
                return Some(*category);
            }
            seen.push(*category);
        }
        None
    }

    pub fn describe(&self) -> String {
        self.0
            .iter()
            .map(|(category, value)| format!("{category}={value}"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Scraping configuration handed to the orchestrator by its caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeRequest {
    #[serde(default = "all_categories")]
    pub categories: Vec<Category>,
    #[serde(default)]
    pub combinations: Option<Vec<Combination>>,
}

fn all_categories() -> Vec<Category> {
    Category::ALL.to_vec()
}

impl Default for ScrapeRequest {
    fn default() -> Self {
        Self::sweep(Category::ALL)
    }
}

impl ScrapeRequest {
    pub fn sweep(categories: impl IntoIterator<Item = Category>) -> Self {
        Self {
            categories: categories.into_iter().collect(),
            combinations: None,
        }
    }

    pub fn with_combinations(combinations: Vec<Combination>) -> Self {
        let mut categories: Vec<Category> = Vec::new();
        for (category, _) in combinations.iter().flat_map(|c| c.pairs()) {
            if !categories.contains(category) {
                categories.push(*category);
            }
        }
        Self {
            categories,
            combinations: Some(combinations),
        }
    }

    /// Categories in first-seen order with duplicates dropped.
    pub fn sweep_categories(&self) -> Vec<Category> {
        let mut out = Vec::with_capacity(self.categories.len());
        for category in &self.categories {
            if !out.contains(category) {
                out.push(*category);
            }
        }
        out
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if let Some(combinations) = &self.combinations {
            if combinations.is_empty() {
                return Err(CoreError::EmptyCombinations);
            }
            if let Some(index) = combinations.iter().position(|c| c.0.is_empty()) {
                return Err(CoreError::EmptyCombination(index));
            }
            for (index, combination) in combinations.iter().enumerate() {
                if let Some(category) = combination.repeated_single_category() {
                    return Err(CoreError::RepeatedCategory { index, category });
                }
            }
        }
        Ok(())
    }
}

/// Opaque identifier of one scraping job and its staging buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobToken(String);

impl JobToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobToken {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for JobToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Destination row in `reports`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermanentReport {
    pub specialization_id: Option<i64>,
    pub skill_id: Option<i64>,
    pub region_id: Option<i64>,
    pub company_id: Option<i64>,
    pub payload: JsonValue,
    pub fetched_at: DateTime<Utc>,
}

impl PermanentReport {
    pub fn from_staged(staged: &StagedDocument) -> Self {
        let doc = &staged.document;
        let mut row = Self {
            specialization_id: None,
            skill_id: None,
            region_id: None,
            company_id: None,
            payload: doc.payload.clone(),
            fetched_at: staged.fetched_at,
        };
        match doc.subject_category {
            Category::Specialization => row.specialization_id = Some(doc.subject_id),
            Category::Skill => row.skill_id = Some(doc.subject_id),
            Category::Region => row.region_id = Some(doc.subject_id),
            Category::Company => row.company_id = Some(doc.subject_id),
        }
        row
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcomeKind {
    Success,
    Failure,
}

impl JobOutcomeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobOutcomeKind::Success => "success",
            JobOutcomeKind::Failure => "failure",
        }
    }
}

/// Audit entry appended to `report_log` once per non-empty promotion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobLog {
    pub logged_at: DateTime<Utc>,
    pub operation_kind: String,
    pub total_attempted: i64,
    pub total_succeeded: i64,
    pub duration_seconds: f64,
    pub outcome: JobOutcomeKind,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn category_parses_table_and_singular_names() {
        assert_eq!("skills".parse::<Category>(), Ok(Category::Skill));
        assert_eq!("Region".parse::<Category>(), Ok(Category::Region));
        assert_eq!(
            "vacancies".parse::<Category>(),
            Err(CoreError::InvalidCategory("vacancies".into()))
        );
    }

    #[test]
    fn staged_document_fans_into_single_id_column() {
        let staged = StagedDocument {
            document: FetchedDocument {
                payload: json!({"groups": [{"median": 1}]}),
                subject_id: 42,
                subject_category: Category::Company,
            },
            fetched_at: Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().unwrap(),
        };
        let row = PermanentReport::from_staged(&staged);
        assert_eq!(row.company_id, Some(42));
        assert_eq!(row.specialization_id, None);
        assert_eq!(row.skill_id, None);
        assert_eq!(row.region_id, None);
        assert_eq!(row.fetched_at, staged.fetched_at);
    }

    #[test]
    fn request_loads_from_yaml_with_combinations() {
        let yaml = r#"
categories: [skills, regions]
combinations:
  - [[skills, Python], [regions, Moscow]]
"#;
        let request: ScrapeRequest = serde_yaml::from_str(yaml).unwrap();
        request.validate().unwrap();
        let combos = request.combinations.unwrap();
        assert_eq!(
            combos[0].pairs(),
            &[
                (Category::Skill, "Python".to_string()),
                (Category::Region, "Moscow".to_string())
            ]
        );
    }

    #[test]
    fn request_rejects_unknown_category_and_empty_combinations() {
        let bad: Result<ScrapeRequest, _> = serde_yaml::from_str("categories: [vacancies]");
        assert!(bad.is_err());

        let empty = ScrapeRequest {
            categories: vec![Category::Skill],
            combinations: Some(vec![]),
        };
        assert_eq!(empty.validate(), Err(CoreError::EmptyCombinations));
    }

    #[test]
    fn request_rejects_repeated_single_valued_category() {
        let two_regions = ScrapeRequest::with_combinations(vec![
            Combination::new([(Category::Skill, "python")]),
            Combination::new([(Category::Region, "moscow"), (Category::Region, "spb")]),
        ]);
        assert_eq!(
            two_regions.validate(),
            Err(CoreError::RepeatedCategory {
                index: 1,
                category: Category::Region,
            })
        );

        let two_skills = ScrapeRequest::with_combinations(vec![Combination::new([
            (Category::Skill, "python"),
            (Category::Skill, "django"),
            (Category::Company, "acme"),
        ])]);
        assert_eq!(two_skills.validate(), Ok(()));
    }

    #[test]
    fn sweep_categories_drop_duplicates_in_order() {
        let request = ScrapeRequest::sweep([Category::Region, Category::Skill, Category::Region]);
        assert_eq!(request.sweep_categories(), vec![Category::Region, Category::Skill]);
    }

    #[test]
    fn group_count_treats_missing_groups_as_none() {
        assert_eq!(group_count(&json!({"groups": []})), Some(0));
        assert_eq!(group_count(&json!({"groups": [{}, {}]})), Some(2));
        assert_eq!(group_count(&json!({"other": 1})), None);
    }
}
