//! DPS (service declaration) domain types.
//!
//! A [`Dps`] is the validated input of the pipeline. The core never mutates
//! it; [`xml::DpsXml`] renders it into a [`CanonicalDocument`].
pub mod validation;
pub mod xml;

use crate::c14n::CanonicalizationError;
use crate::config::EnvironmentType;
use crate::document::CanonicalDocument;
use chrono::{DateTime, FixedOffset};
use quick_xml::se::SeError;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

/// Errors raised while rendering a declaration into XML.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
    #[error("{field} is out of range: {value}")]
    OutOfRange { field: &'static str, value: String },
    #[error("rendered DPS is not a well-formed document: {0}")]
    Document(#[from] CanonicalizationError),
    #[error("failed to serialize DPS to XML: {source}")]
    Serialize {
        #[from]
        source: SeError,
    },
}

/// A single service event to be declared to the national platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dps {
    /// Caller-assigned identifier of the logical submission, e.g. `"DPS-0001"`.
    pub id: String,
    pub environment: EnvironmentType,
    pub issued_at: DateTime<FixedOffset>,
    /// Up to five digits.
    pub series: String,
    pub number: u64,
    /// Competence date, `YYYY-MM-DD` or `YYYY-MM`.
    pub competence: String,
    /// IBGE code of the issuing municipality.
    pub issuing_municipality: String,
    pub provider: Provider,
    #[serde(default)]
    pub recipient: Option<Recipient>,
    pub service: Service,
    pub values: Values,
}

impl Dps {
    /// Render this declaration into its canonical, unsigned document.
    pub fn to_canonical_document(&self) -> Result<CanonicalDocument, BuildError> {
        xml::DpsXml::new(self).build()
    }
}

/// Federal registration number of a person (CPF) or company (CNPJ).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaxId {
    Cnpj(String),
    Cpf(String),
}

impl TaxId {
    /// Parse a CNPJ or CPF, ignoring punctuation.
    ///
    /// # Examples
    /// ```rust
    /// use nfse_core::dps::TaxId;
    ///
    /// let id = TaxId::parse("11.222.333/0001-81")?;
    /// assert_eq!(id, TaxId::Cnpj("11222333000181".into()));
    /// # Ok::<(), nfse_core::dps::BuildError>(())
    /// ```
    pub fn parse(value: &str) -> Result<Self, BuildError> {
        let digits: String = value
            .chars()
            .filter(|c| !matches!(c, '.' | '/' | '-' | ' '))
            .collect();
        if !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(BuildError::InvalidValue {
                field: "tax id",
                value: value.to_string(),
            });
        }
        match digits.len() {
            14 => Ok(TaxId::Cnpj(digits)),
            11 => Ok(TaxId::Cpf(digits)),
            _ => Err(BuildError::InvalidValue {
                field: "tax id",
                value: value.to_string(),
            }),
        }
    }

    pub fn digits(&self) -> &str {
        match self {
            TaxId::Cnpj(d) | TaxId::Cpf(d) => d,
        }
    }

    /// Registration type code used in identifiers: 1 for CPF, 2 for CNPJ.
    pub fn kind_code(&self) -> u8 {
        match self {
            TaxId::Cpf(_) => 1,
            TaxId::Cnpj(_) => 2,
        }
    }

    /// Element name carrying this id in national layouts.
    pub fn tag(&self) -> &'static str {
        match self {
            TaxId::Cnpj(_) => "CNPJ",
            TaxId::Cpf(_) => "CPF",
        }
    }
}

impl fmt::Display for TaxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.digits())
    }
}

/// Service provider (prestador).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {
    pub tax_id: String,
    #[serde(default)]
    pub municipal_registration: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    pub tax_regime: TaxRegime,
}

/// Provider tax regime (`regTrib`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxRegime {
    pub simples_nacional: SimplesNacional,
    /// `regApTribSN`, only for Simples Nacional ME/EPP. Valid codes are 1 to 3.
    #[serde(default)]
    pub simples_nacional_assessment: Option<u8>,
    /// `regEspTrib`: 0 (none) to 6.
    #[serde(default)]
    pub special_regime: u8,
}

/// Simples Nacional option (`opSimpNac`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimplesNacional {
    NotOptant,
    Mei,
    MeEpp,
}

impl SimplesNacional {
    pub fn code(&self) -> u8 {
        match self {
            SimplesNacional::NotOptant => 1,
            SimplesNacional::Mei => 2,
            SimplesNacional::MeEpp => 3,
        }
    }
}

/// Service recipient (tomador).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    /// CNPJ or CPF. When absent, `foreign_id` must be set.
    #[serde(default)]
    pub tax_id: Option<String>,
    /// Foreign tax id (NIF).
    #[serde(default)]
    pub foreign_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub address: Option<Address>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

/// Brazilian postal address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub municipality_code: String,
    pub postal_code: String,
    pub street: String,
    pub number: String,
    #[serde(default)]
    pub complement: Option<String>,
    pub district: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// IBGE code of the municipality where the service was rendered.
    pub location_municipality: String,
    /// National taxation code, `"01.07.01"` or `"010701"`.
    pub national_code: String,
    #[serde(default)]
    pub municipal_code: Option<String>,
    pub description: String,
    #[serde(default)]
    pub nbs_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Values {
    pub service_amount: Amount,
    pub issqn: IssqnTaxation,
    pub withholding: IssqnWithholding,
    /// ISSQN rate in percent.
    #[serde(default)]
    pub rate: Option<Amount>,
    /// Approximate total tax percentage for Simples Nacional providers.
    /// When absent the DPS declares that no approximate tax is informed.
    #[serde(default)]
    pub simples_nacional_tax_rate: Option<Amount>,
}

/// ISSQN taxation (`tribISSQN`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssqnTaxation {
    Taxable,
    Immune,
    Export,
    NotLevied,
}

impl IssqnTaxation {
    pub fn code(&self) -> u8 {
        match self {
            IssqnTaxation::Taxable => 1,
            IssqnTaxation::Immune => 2,
            IssqnTaxation::Export => 3,
            IssqnTaxation::NotLevied => 4,
        }
    }
}

/// ISSQN withholding (`tpRetISSQN`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssqnWithholding {
    NotWithheld,
    ByRecipient,
    ByIntermediary,
}

impl IssqnWithholding {
    pub fn code(&self) -> u8 {
        match self {
            IssqnWithholding::NotWithheld => 1,
            IssqnWithholding::ByRecipient => 2,
            IssqnWithholding::ByIntermediary => 3,
        }
    }
}

/// Error returned when parsing an [`Amount`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid amount: {0}")]
pub struct AmountParseError(String);

/// Two-decimal fixed-point value held as integer centavos.
///
/// # Examples
/// ```rust
/// use nfse_core::dps::Amount;
///
/// let amount: Amount = "1000.5".parse()?;
/// assert_eq!(amount.cents(), 100_050);
/// assert_eq!(amount.to_string(), "1000.50");
/// # Ok::<(), nfse_core::dps::AmountParseError>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Amount(i64);

impl Amount {
    pub const fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    pub fn cents(&self) -> i64 {
        self.0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }
}

impl FromStr for Amount {
    type Err = AmountParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || AmountParseError(s.to_string());
        let trimmed = s.trim();
        let (negative, unsigned) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };
        let (whole, fraction) = unsigned.split_once('.').unwrap_or((unsigned, ""));
        if whole.is_empty()
            || fraction.len() > 2
            || !whole.bytes().all(|b| b.is_ascii_digit())
            || !fraction.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(invalid());
        }
        let whole: i64 = whole.parse().map_err(|_| invalid())?;
        let fraction: i64 = format!("{fraction:0<2}").parse().map_err(|_| invalid())?;
        let cents = whole
            .checked_mul(100)
            .and_then(|c| c.checked_add(fraction))
            .ok_or_else(invalid)?;
        Ok(Amount(if negative { -cents } else { cents }))
    }
}

impl TryFrom<String> for Amount {
    type Error = AmountParseError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Amount> for String {
    fn from(amount: Amount) -> Self {
        amount.to_string()
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}
