//! Core domain model for the YC directory harvest: batch specs, ledger rows,
//! sink records and the validation applied to extraction output.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub const CRATE_NAME: &str = "ycv-core";

/// Delimiter of every on-disk dataset. Free-text fields must never contain it.
pub const FIELD_DELIMITER: char = ',';

pub const BATCH_LEDGER_HEADER: [&str; 2] = ["Batch", "Count"];
pub const URL_LEDGER_HEADER: [&str; 2] = ["Batch", "YC URL"];
pub const COMPLETION_LOG_HEADER: [&str; 3] = ["Batch", "YC URL", "Outcome"];
pub const COMPANY_HEADER: [&str; 6] = ["Name", "Batch", "Status", "Industry", "Team Size", "Location"];
pub const FOUNDER_HEADER: [&str; 10] = [
    "Name",
    "Batch",
    "Status",
    "Industry",
    "Team Size",
    "Location",
    "Founder's First Name",
    "Founder's Last Name",
    "Founder's LinkedIn",
    "Founder's Twitter",
];

/// One row of the batch ledger: a cohort code and the link count last observed for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSpec {
    #[serde(rename = "Batch")]
    pub batch_code: String,
    #[serde(rename = "Count")]
    pub expected_count: u32,
}

impl BatchSpec {
    pub fn new(batch_code: impl Into<String>, expected_count: u32) -> Self {
        Self {
            batch_code: batch_code.into(),
            expected_count,
        }
    }

    /// Absolute difference between an observed link count and the expectation.
    pub fn deviation(&self, observed: usize) -> u64 {
        (observed as u64).abs_diff(u64::from(self.expected_count))
    }
}

/// One row of the URL ledger. `(batch_code, url)` is the ledger key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UrlRecord {
    #[serde(rename = "Batch")]
    pub batch_code: String,
    #[serde(rename = "YC URL")]
    pub url: String,
}

impl UrlRecord {
    pub fn new(batch_code: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            batch_code: batch_code.into(),
            url: url.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompanyStatus {
    Active,
    Inactive,
    Acquired,
    Public,
}

impl CompanyStatus {
    pub const ALL: [CompanyStatus; 4] = [
        CompanyStatus::Active,
        CompanyStatus::Inactive,
        CompanyStatus::Acquired,
        CompanyStatus::Public,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CompanyStatus::Active => "Active",
            CompanyStatus::Inactive => "Inactive",
            CompanyStatus::Acquired => "Acquired",
            CompanyStatus::Public => "Public",
        }
    }
}

impl fmt::Display for CompanyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompanyStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| ValidationError::Status(trimmed.to_string()))
    }
}

/// Value identity of a company row: the first five sink columns.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompanyIdentity(pub [String; 5]);

impl CompanyIdentity {
    /// Builds an identity from a raw sink row; rows shorter than five cells have none.
    pub fn from_cells<S: AsRef<str>>(cells: &[S]) -> Option<Self> {
        if cells.len() < 5 {
            return None;
        }
        Some(Self(std::array::from_fn(|i| cells[i].as_ref().trim().to_string())))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FounderIdentity {
    pub company: CompanyIdentity,
    pub first_name: String,
    pub last_name: String,
}

impl FounderIdentity {
    pub fn from_cells<S: AsRef<str>>(cells: &[S]) -> Option<Self> {
        if cells.len() < 8 {
            return None;
        }
        Some(Self {
            company: CompanyIdentity::from_cells(cells)?,
            first_name: cells[6].as_ref().trim().to_string(),
            last_name: cells[7].as_ref().trim().to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyRecord {
    pub name: String,
    pub batch: String,
    pub status: CompanyStatus,
    pub industry: Option<String>,
    pub team_size: Option<u32>,
    pub city: Option<String>,
}

impl CompanyRecord {
    /// Sink cells in `COMPANY_HEADER` order. Absent values become empty cells.
    pub fn to_cells(&self) -> [String; 6] {
        [
            self.name.clone(),
            self.batch.clone(),
            self.status.to_string(),
            self.industry.clone().unwrap_or_default(),
            self.team_size.map(|n| n.to_string()).unwrap_or_default(),
            self.city.clone().unwrap_or_default(),
        ]
    }

    pub fn identity(&self) -> CompanyIdentity {
        let [name, batch, status, industry, team_size, _city] = self.to_cells();
        CompanyIdentity([name, batch, status, industry, team_size])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FounderRecord {
    pub company: CompanyRecord,
    pub first_name: String,
    pub last_name: String,
    pub linkedin_url: Option<String>,
    pub twitter_url: Option<String>,
}

impl FounderRecord {
    /// Sink cells in `FOUNDER_HEADER` order.
    pub fn to_cells(&self) -> [String; 10] {
        let [name, batch, status, industry, team_size, city] = self.company.to_cells();
        [
            name,
            batch,
            status,
            industry,
            team_size,
            city,
            self.first_name.clone(),
            self.last_name.clone(),
            self.linkedin_url.clone().unwrap_or_default(),
            self.twitter_url.clone().unwrap_or_default(),
        ]
    }

    pub fn identity(&self) -> FounderIdentity {
        FounderIdentity {
            company: self.company.identity(),
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("field `{field}` contains the field delimiter ','")]
    Delimiter { field: String },
    #[error("field `{field}` must not be empty")]
    Empty { field: String },
    #[error("status `{0}` is not one of Active, Inactive, Acquired, Public")]
    Status(String),
    #[error("team size {0} is negative")]
    NegativeTeamSize(i64),
    #[error("team size {0} is out of range")]
    TeamSizeOutOfRange(i64),
    #[error("field `{field}` is not an http(s) URL: {value}")]
    Url { field: String, value: String },
}

/// Founder as returned by the extraction capability, before validation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FounderExtract {
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default, alias = "founder_linkedin_url")]
    pub linkedin_url: Option<String>,
    #[serde(default, alias = "founder_twitter_url")]
    pub twitter_url: Option<String>,
}

/// Company as returned by the extraction capability, before validation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CompanyExtract {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub batch: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub industry: Option<String>,
    #[serde(default)]
    pub team_size: Option<i64>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub founders: Option<Vec<FounderExtract>>,
}

/// A company and its founders that passed validation and may be written to the sinks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedCompany {
    pub company: CompanyRecord,
    pub founders: Vec<FounderRecord>,
}

impl CompanyExtract {
    pub fn validate(self) -> Result<ValidatedCompany, ValidationError> {
        let name = required_text("name", &self.name)?;
        let batch = required_text("batch", &self.batch)?;
        let status = self.status.parse::<CompanyStatus>()?;
        let industry = optional_text("industry", self.industry.as_deref())?;
        let city = optional_text("city", self.city.as_deref())?;
        let team_size = match self.team_size {
            Some(n) if n < 0 => return Err(ValidationError::NegativeTeamSize(n)),
            Some(n) => Some(
                u32::try_from(n).map_err(|_| ValidationError::TeamSizeOutOfRange(n))?,
            ),
            None => None,
        };

        let company = CompanyRecord {
            name,
            batch,
            status,
            industry,
            team_size,
            city,
        };

        let founders = self
            .founders
            .unwrap_or_default()
            .into_iter()
            .enumerate()
            .map(|(i, founder)| {
                Ok(FounderRecord {
                    company: company.clone(),
                    first_name: required_text(&format!("founders[{i}].first_name"), &founder.first_name)?,
                    last_name: required_text(&format!("founders[{i}].last_name"), &founder.last_name)?,
                    linkedin_url: optional_url(
                        &format!("founders[{i}].linkedin_url"),
                        founder.linkedin_url.as_deref(),
                    )?,
                    twitter_url: optional_url(
                        &format!("founders[{i}].twitter_url"),
                        founder.twitter_url.as_deref(),
                    )?,
                })
            })
            .collect::<Result<Vec<_>, ValidationError>>()?;

        Ok(ValidatedCompany { company, founders })
    }
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn required_text(field: &str, value: &str) -> Result<String, ValidationError> {
    optional_text(field, Some(value))?.ok_or_else(|| ValidationError::Empty {
        field: field.to_string(),
    })
}

fn optional_text(field: &str, value: Option<&str>) -> Result<Option<String>, ValidationError> {
    let Some(value) = value.map(collapse_whitespace).filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    if value.contains(FIELD_DELIMITER) {
        return Err(ValidationError::Delimiter {
            field: field.to_string(),
        });
    }
    Ok(Some(value))
}

fn optional_url(field: &str, value: Option<&str>) -> Result<Option<String>, ValidationError> {
    let Some(value) = optional_text(field, value)? else {
        return Ok(None);
    };
    match Url::parse(&value) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(Some(value)),
        _ => Err(ValidationError::Url {
            field: field.to_string(),
            value,
        }),
    }
}
