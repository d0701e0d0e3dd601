//! XML rendering of a [`Dps`] in the national layout.
pub(crate) mod constants;

use super::{Address, BuildError, Dps, Provider, Recipient, Service, SimplesNacional, TaxId, Values};
use crate::document::{CanonicalDocument, SignableReference};
use chrono::NaiveDate;
use constants::{LAYOUT_VERSION, NFSE_NS, XML_DECLARATION};
use quick_xml::se::Serializer as QuickXmlSerializer;
use serde::ser::{Serialize, SerializeStruct, Serializer};

/// Version string written to `verAplic` unless the caller overrides it.
pub const DEFAULT_APPLICATION_VERSION: &str = concat!("nfse-rs/", env!("CARGO_PKG_VERSION"));

const MAX_SERIES: usize = 5;
const MAX_NUMBER: u64 = 999_999_999_999_999;
const MAX_NAME_LEN: usize = 300;
const MAX_DESCRIPTION_LEN: usize = 2000;

/// Renders a declaration into its canonical, unsigned document.
///
/// Elements follow the schema order regardless of how the input was built;
/// the output is compact and byte-identical for equal declarations.
///
/// # Examples
/// ```rust,no_run
/// use nfse_core::dps::{Dps, xml::DpsXml};
///
/// # fn demo(dps: &Dps) -> Result<(), nfse_core::dps::BuildError> {
/// let document = DpsXml::new(dps).build()?;
/// println!("{} signs {}", document.xml(), document.reference());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Copy)]
pub struct DpsXml<'a> {
    dps: &'a Dps,
    application_version: &'a str,
}

impl<'a> DpsXml<'a> {
    pub fn new(dps: &'a Dps) -> Self {
        Self {
            dps,
            application_version: DEFAULT_APPLICATION_VERSION,
        }
    }

    pub fn with_application_version(mut self, version: &'a str) -> Self {
        self.application_version = version;
        self
    }

    pub fn build(&self) -> Result<CanonicalDocument, BuildError> {
        let view = DpsView::new(self.dps, self.application_version)?;
        let reference = SignableReference::new(view.id.clone());

        let mut buffer = String::with_capacity(2048);
        buffer.push_str(XML_DECLARATION);
        view.serialize(QuickXmlSerializer::new(&mut buffer))?;

        Ok(CanonicalDocument::from_xml(buffer, reference)?)
    }
}

/// `infDPS/@Id`: "DPS" + municipality (7) + registration type (1) +
/// registration (14) + series (5) + number (15).
pub fn dps_id(
    municipality: &str,
    provider: &TaxId,
    series: &str,
    number: u64,
) -> String {
    format!(
        "DPS{municipality}{}{:0>14}{:0>5}{:015}",
        provider.kind_code(),
        provider.digits(),
        series,
        number
    )
}

fn required_digits(field: &'static str, value: &str, len: usize) -> Result<String, BuildError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(BuildError::MissingField(field));
    }
    if value.len() != len || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(BuildError::InvalidValue {
            field,
            value: value.to_string(),
        });
    }
    Ok(value.to_string())
}

fn required_text(field: &'static str, value: &str, max: usize) -> Result<String, BuildError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(BuildError::MissingField(field));
    }
    if value.chars().count() > max {
        return Err(BuildError::OutOfRange {
            field,
            value: format!("{} characters", value.chars().count()),
        });
    }
    Ok(value.to_string())
}

fn optional_text(
    field: &'static str,
    value: Option<&str>,
    max: usize,
) -> Result<Option<String>, BuildError> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        Some(v) => required_text(field, v, max).map(Some),
        None => Ok(None),
    }
}

fn phone(value: Option<&str>) -> Result<Option<String>, BuildError> {
    let Some(raw) = value.map(str::trim).filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    let digits: String = raw
        .chars()
        .filter(|c| !matches!(c, '(' | ')' | '-' | ' ' | '+'))
        .collect();
    if !(6..=20).contains(&digits.len()) || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(BuildError::InvalidValue {
            field: "fone",
            value: raw.to_string(),
        });
    }
    Ok(Some(digits))
}

fn email(value: Option<&str>) -> Result<Option<String>, BuildError> {
    let email = optional_text("email", value, 80)?;
    if let Some(address) = &email {
        if !address.contains('@') || address.contains(char::is_whitespace) {
            return Err(BuildError::InvalidValue {
                field: "email",
                value: address.clone(),
            });
        }
    }
    Ok(email)
}

fn percentage(field: &'static str, value: super::Amount) -> Result<String, BuildError> {
    if !(0..=10_000).contains(&value.cents()) {
        return Err(BuildError::OutOfRange {
            field,
            value: value.to_string(),
        });
    }
    Ok(value.to_string())
}

fn competence_date(value: &str) -> Result<String, BuildError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(BuildError::MissingField("dCompet"));
    }
    let full = if value.len() == 7 {
        format!("{value}-01")
    } else {
        value.to_string()
    };
    NaiveDate::parse_from_str(&full, "%Y-%m-%d")
        .map(|date| date.format("%Y-%m-%d").to_string())
        .map_err(|_| BuildError::InvalidValue {
            field: "dCompet",
            value: value.to_string(),
        })
}

/// Validated, pre-formatted projection of a [`Dps`] ready for serialization.
struct DpsView {
    id: String,
    tp_amb: u8,
    dh_emi: String,
    ver_aplic: String,
    serie: String,
    n_dps: String,
    d_compet: String,
    c_loc_emi: String,
    prest: ProviderView,
    toma: Option<RecipientView>,
    serv: ServiceView,
    valores: ValuesView,
}

impl DpsView {
    fn new(dps: &Dps, application_version: &str) -> Result<Self, BuildError> {
        let series = dps.series.trim();
        if series.is_empty() {
            return Err(BuildError::MissingField("serie"));
        }
        if series.len() > MAX_SERIES || !series.bytes().all(|b| b.is_ascii_digit()) {
            return Err(BuildError::InvalidValue {
                field: "serie",
                value: series.to_string(),
            });
        }
        if dps.number == 0 || dps.number > MAX_NUMBER {
            return Err(BuildError::OutOfRange {
                field: "nDPS",
                value: dps.number.to_string(),
            });
        }
        if dps.id.trim().is_empty() {
            return Err(BuildError::MissingField("id"));
        }

        let c_loc_emi = required_digits("cLocEmi", &dps.issuing_municipality, 7)?;
        let prest = ProviderView::new(&dps.provider)?;
        let id = dps_id(&c_loc_emi, &prest.tax_id, series, dps.number);

        Ok(Self {
            id,
            tp_amb: dps.environment.tp_amb(),
            dh_emi: dps.issued_at.format("%Y-%m-%dT%H:%M:%S%:z").to_string(),
            ver_aplic: required_text("verAplic", application_version, 20)?,
            serie: series.to_string(),
            n_dps: dps.number.to_string(),
            d_compet: competence_date(&dps.competence)?,
            c_loc_emi,
            prest,
            toma: dps.recipient.as_ref().map(RecipientView::new).transpose()?,
            serv: ServiceView::new(&dps.service)?,
            valores: ValuesView::new(&dps.values, &dps.provider)?,
        })
    }
}

impl Serialize for DpsView {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut root = serializer.serialize_struct("DPS", 0)?;
        root.serialize_field("@xmlns", NFSE_NS)?;
        root.serialize_field("@versao", LAYOUT_VERSION)?;
        root.serialize_field("infDPS", &InfDpsXml(self))?;
        root.end()
    }
}

struct InfDpsXml<'a>(&'a DpsView);

impl<'a> Serialize for InfDpsXml<'a> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let dps = self.0;
        let mut st = s.serialize_struct("infDPS", 0)?;
        st.serialize_field("@Id", &dps.id)?;

        // ---- identification ----
        st.serialize_field("tpAmb", &dps.tp_amb)?;
        st.serialize_field("dhEmi", &dps.dh_emi)?;
        st.serialize_field("verAplic", &dps.ver_aplic)?;
        st.serialize_field("serie", &dps.serie)?;
        st.serialize_field("nDPS", &dps.n_dps)?;
        st.serialize_field("dCompet", &dps.d_compet)?;
        // issued by the provider itself
        st.serialize_field("tpEmit", &1u8)?;
        st.serialize_field("cLocEmi", &dps.c_loc_emi)?;

        // ---- parties ----
        st.serialize_field("prest", &dps.prest)?;
        if let Some(toma) = dps.toma.as_ref() {
            st.serialize_field("toma", toma)?;
        }

        // ---- service & values ----
        st.serialize_field("serv", &dps.serv)?;
        st.serialize_field("valores", &dps.valores)?;
        st.end()
    }
}

struct ProviderView {
    tax_id: TaxId,
    im: Option<String>,
    name: Option<String>,
    phone: Option<String>,
    email: Option<String>,
    op_simp_nac: u8,
    reg_ap_trib_sn: Option<u8>,
    reg_esp_trib: u8,
}

impl ProviderView {
    fn new(provider: &Provider) -> Result<Self, BuildError> {
        if provider.tax_id.trim().is_empty() {
            return Err(BuildError::MissingField("prest/CNPJ"));
        }
        let regime = &provider.tax_regime;
        if regime.special_regime > 6 {
            return Err(BuildError::OutOfRange {
                field: "regEspTrib",
                value: regime.special_regime.to_string(),
            });
        }
        if let Some(code) = regime.simples_nacional_assessment {
            if regime.simples_nacional != SimplesNacional::MeEpp {
                return Err(BuildError::InvalidValue {
                    field: "regApTribSN",
                    value: format!("{code} requires Simples Nacional ME/EPP"),
                });
            }
            if !(1..=3).contains(&code) {
                return Err(BuildError::OutOfRange {
                    field: "regApTribSN",
                    value: code.to_string(),
                });
            }
        }
        Ok(Self {
            tax_id: TaxId::parse(&provider.tax_id)?,
            im: optional_text("prest/IM", provider.municipal_registration.as_deref(), 15)?,
            name: optional_text("prest/xNome", provider.name.as_deref(), MAX_NAME_LEN)?,
            phone: phone(provider.phone.as_deref())?,
            email: email(provider.email.as_deref())?,
            op_simp_nac: regime.simples_nacional.code(),
            reg_ap_trib_sn: regime.simples_nacional_assessment,
            reg_esp_trib: regime.special_regime,
        })
    }
}

impl Serialize for ProviderView {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("prest", 0)?;
        st.serialize_field(self.tax_id.tag(), self.tax_id.digits())?;
        if let Some(im) = &self.im {
            st.serialize_field("IM", im)?;
        }
        if let Some(name) = &self.name {
            st.serialize_field("xNome", name)?;
        }
        if let Some(phone) = &self.phone {
            st.serialize_field("fone", phone)?;
        }
        if let Some(email) = &self.email {
            st.serialize_field("email", email)?;
        }
        st.serialize_field("regTrib", &RegTribXml(self))?;
        st.end()
    }
}

struct RegTribXml<'a>(&'a ProviderView);

impl<'a> Serialize for RegTribXml<'a> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("regTrib", 0)?;
        st.serialize_field("opSimpNac", &self.0.op_simp_nac)?;
        if let Some(code) = self.0.reg_ap_trib_sn {
            st.serialize_field("regApTribSN", &code)?;
        }
        st.serialize_field("regEspTrib", &self.0.reg_esp_trib)?;
        st.end()
    }
}

enum RecipientIdView {
    Domestic(TaxId),
    Foreign(String),
}

struct RecipientView {
    id: RecipientIdView,
    name: String,
    address: Option<AddressView>,
    phone: Option<String>,
    email: Option<String>,
}

impl RecipientView {
    fn new(recipient: &Recipient) -> Result<Self, BuildError> {
        let id = match (
            recipient.tax_id.as_deref().map(str::trim).filter(|v| !v.is_empty()),
            recipient.foreign_id.as_deref().map(str::trim).filter(|v| !v.is_empty()),
        ) {
            (Some(tax_id), _) => RecipientIdView::Domestic(TaxId::parse(tax_id)?),
            (None, Some(nif)) => RecipientIdView::Foreign(required_text("toma/NIF", nif, 40)?),
            (None, None) => return Err(BuildError::MissingField("toma/CNPJ")),
        };
        Ok(Self {
            id,
            name: required_text("toma/xNome", &recipient.name, MAX_NAME_LEN)?,
            address: recipient.address.as_ref().map(AddressView::new).transpose()?,
            phone: phone(recipient.phone.as_deref())?,
            email: email(recipient.email.as_deref())?,
        })
    }
}

impl Serialize for RecipientView {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("toma", 0)?;
        match &self.id {
            RecipientIdView::Domestic(tax_id) => {
                st.serialize_field(tax_id.tag(), tax_id.digits())?;
            }
            RecipientIdView::Foreign(nif) => st.serialize_field("NIF", nif)?,
        }
        st.serialize_field("xNome", &self.name)?;
        if let Some(address) = &self.address {
            st.serialize_field("end", address)?;
        }
        if let Some(phone) = &self.phone {
            st.serialize_field("fone", phone)?;
        }
        if let Some(email) = &self.email {
            st.serialize_field("email", email)?;
        }
        st.end()
    }
}

struct AddressView {
    c_mun: String,
    cep: String,
    street: String,
    number: String,
    complement: Option<String>,
    district: String,
}

impl AddressView {
    fn new(address: &Address) -> Result<Self, BuildError> {
        let cep: String = address
            .postal_code
            .chars()
            .filter(|c| !matches!(c, '-' | '.' | ' '))
            .collect();
        Ok(Self {
            c_mun: required_digits("end/cMun", &address.municipality_code, 7)?,
            cep: required_digits("end/CEP", &cep, 8)?,
            street: required_text("end/xLgr", &address.street, 255)?,
            number: required_text("end/nro", &address.number, 60)?,
            complement: optional_text("end/xCpl", address.complement.as_deref(), 156)?,
            district: required_text("end/xBairro", &address.district, 60)?,
        })
    }
}

impl Serialize for AddressView {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("end", 0)?;
        st.serialize_field("endNac", &EndNacXml(self))?;
        st.serialize_field("xLgr", &self.street)?;
        st.serialize_field("nro", &self.number)?;
        if let Some(complement) = &self.complement {
            st.serialize_field("xCpl", complement)?;
        }
        st.serialize_field("xBairro", &self.district)?;
        st.end()
    }
}

struct EndNacXml<'a>(&'a AddressView);

impl<'a> Serialize for EndNacXml<'a> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("endNac", 0)?;
        st.serialize_field("cMun", &self.0.c_mun)?;
        st.serialize_field("CEP", &self.0.cep)?;
        st.end()
    }
}

struct ServiceView {
    c_loc_prestacao: String,
    c_trib_nac: String,
    c_trib_mun: Option<String>,
    description: String,
    c_nbs: Option<String>,
}

impl ServiceView {
    fn new(service: &Service) -> Result<Self, BuildError> {
        let national: String = service
            .national_code
            .chars()
            .filter(|c| *c != '.')
            .collect();
        let c_trib_mun = match service.municipal_code.as_deref().map(str::trim) {
            Some(code) if !code.is_empty() => Some(required_digits("cTribMun", code, 3)?),
            _ => None,
        };
        let c_nbs = match service.nbs_code.as_deref().map(str::trim) {
            Some(code) if !code.is_empty() => {
                let digits: String = code.chars().filter(|c| *c != '.').collect();
                Some(required_digits("cNBS", &digits, 9)?)
            }
            _ => None,
        };
        Ok(Self {
            c_loc_prestacao: required_digits(
                "cLocPrestacao",
                &service.location_municipality,
                7,
            )?,
            c_trib_nac: required_digits("cTribNac", &national, 6)?,
            c_trib_mun,
            description: required_text("xDescServ", &service.description, MAX_DESCRIPTION_LEN)?,
            c_nbs,
        })
    }
}

impl Serialize for ServiceView {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("serv", 0)?;
        st.serialize_field("locPrest", &LocPrestXml(&self.c_loc_prestacao))?;
        st.serialize_field("cServ", &CServXml(self))?;
        st.end()
    }
}

struct LocPrestXml<'a>(&'a str);

impl<'a> Serialize for LocPrestXml<'a> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("locPrest", 0)?;
        st.serialize_field("cLocPrestacao", self.0)?;
        st.end()
    }
}

struct CServXml<'a>(&'a ServiceView);

impl<'a> Serialize for CServXml<'a> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let service = self.0;
        let mut st = s.serialize_struct("cServ", 0)?;
        st.serialize_field("cTribNac", &service.c_trib_nac)?;
        if let Some(code) = &service.c_trib_mun {
            st.serialize_field("cTribMun", code)?;
        }
        st.serialize_field("xDescServ", &service.description)?;
        if let Some(code) = &service.c_nbs {
            st.serialize_field("cNBS", code)?;
        }
        st.end()
    }
}

struct ValuesView {
    v_serv: String,
    trib_issqn: u8,
    tp_ret_issqn: u8,
    p_aliq: Option<String>,
    p_tot_trib_sn: Option<String>,
}

impl ValuesView {
    fn new(values: &Values, provider: &Provider) -> Result<Self, BuildError> {
        if !values.service_amount.is_positive() {
            return Err(BuildError::OutOfRange {
                field: "vServ",
                value: values.service_amount.to_string(),
            });
        }
        let p_tot_trib_sn = match values.simples_nacional_tax_rate {
            Some(rate) => {
                if provider.tax_regime.simples_nacional == SimplesNacional::NotOptant {
                    return Err(BuildError::InvalidValue {
                        field: "pTotTribSN",
                        value: "provider is not a Simples Nacional optant".into(),
                    });
                }
                Some(percentage("pTotTribSN", rate)?)
            }
            None => None,
        };
        Ok(Self {
            v_serv: values.service_amount.to_string(),
            trib_issqn: values.issqn.code(),
            tp_ret_issqn: values.withholding.code(),
            p_aliq: values.rate.map(|r| percentage("pAliq", r)).transpose()?,
            p_tot_trib_sn,
        })
    }
}

impl Serialize for ValuesView {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("valores", 0)?;
        st.serialize_field("vServPrest", &VServPrestXml(&self.v_serv))?;
        st.serialize_field("trib", &TribXml(self))?;
        st.end()
    }
}

struct VServPrestXml<'a>(&'a str);

impl<'a> Serialize for VServPrestXml<'a> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("vServPrest", 0)?;
        st.serialize_field("vServ", self.0)?;
        st.end()
    }
}

struct TribXml<'a>(&'a ValuesView);

impl<'a> Serialize for TribXml<'a> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let values = self.0;
        let mut st = s.serialize_struct("trib", 0)?;
        st.serialize_field("tribMun", &TribMunXml(values))?;
        st.serialize_field("totTrib", &TotTribXml(values.p_tot_trib_sn.as_deref()))?;
        st.end()
    }
}

struct TribMunXml<'a>(&'a ValuesView);

impl<'a> Serialize for TribMunXml<'a> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("tribMun", 0)?;
        st.serialize_field("tribISSQN", &self.0.trib_issqn)?;
        if let Some(rate) = &self.0.p_aliq {
            st.serialize_field("pAliq", rate)?;
        }
        st.serialize_field("tpRetISSQN", &self.0.tp_ret_issqn)?;
        st.end()
    }
}

struct TotTribXml<'a>(Option<&'a str>);

impl<'a> Serialize for TotTribXml<'a> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("totTrib", 0)?;
        match self.0 {
            Some(rate) => st.serialize_field("pTotTribSN", rate)?,
            None => st.serialize_field("indTotTrib", &0u8)?,
        }
        st.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::c14n::{XmlDocument, is_element};
    use crate::config::EnvironmentType;
    use crate::dps::{
        Amount, IssqnTaxation, IssqnWithholding, TaxRegime,
    };
    use chrono::{DateTime, FixedOffset};

    fn sample_dps() -> Dps {
        Dps {
            id: "DPS-0001".into(),
            environment: EnvironmentType::Staging,
            issued_at: DateTime::<FixedOffset>::parse_from_rfc3339("2026-01-15T10:30:00-03:00")
                .expect("timestamp"),
            series: "1".into(),
            number: 1,
            competence: "2026-01-15".into(),
            issuing_municipality: "3550308".into(),
            provider: Provider {
                tax_id: "11.222.333/0001-81".into(),
                municipal_registration: Some("12345".into()),
                name: None,
                phone: None,
                email: None,
                tax_regime: TaxRegime {
                    simples_nacional: SimplesNacional::MeEpp,
                    simples_nacional_assessment: Some(1),
                    special_regime: 0,
                },
            },
            recipient: Some(Recipient {
                tax_id: Some("123.456.789-09".into()),
                foreign_id: None,
                name: "Jane Doe".into(),
                address: Some(Address {
                    municipality_code: "3550308".into(),
                    postal_code: "01310-100".into(),
                    street: "Avenida Paulista".into(),
                    number: "1000".into(),
                    complement: None,
                    district: "Bela Vista".into(),
                }),
                phone: None,
                email: Some("jane@example.com".into()),
            }),
            service: Service {
                location_municipality: "3550308".into(),
                national_code: "01.07.01".into(),
                municipal_code: None,
                description: "Suporte tecnico em informatica".into(),
                nbs_code: None,
            },
            values: Values {
                service_amount: Amount::from_cents(100_000),
                issqn: IssqnTaxation::Taxable,
                withholding: IssqnWithholding::NotWithheld,
                rate: None,
                simples_nacional_tax_rate: Some(Amount::from_cents(600)),
            },
        }
    }

    fn position(haystack: &str, needle: &str) -> usize {
        haystack
            .find(needle)
            .unwrap_or_else(|| panic!("{needle} missing from {haystack}"))
    }

    #[test]
    fn build_is_deterministic() {
        let first = sample_dps().to_canonical_document().expect("build");
        let second = sample_dps().to_canonical_document().expect("build");
        assert_eq!(first, second);
        assert_eq!(first.xml().as_bytes(), second.xml().as_bytes());
    }

    #[test]
    fn reference_is_derived_from_declaration_identity() {
        let document = sample_dps().to_canonical_document().expect("build");
        let id = document.reference().id();
        assert_eq!(id, "DPS355030821122233300018100001000000000000001");
        assert_eq!(id.len(), 45);
        assert!(document.xml().contains(&format!(r#"<infDPS Id="{id}">"#)));

        let mut other = sample_dps();
        other.number = 2;
        assert_ne!(
            other.to_canonical_document().expect("build").reference(),
            document.reference()
        );
    }

    #[test]
    fn cpf_provider_is_zero_padded_in_reference() {
        let mut dps = sample_dps();
        dps.provider.tax_id = "123.456.789-09".into();
        let document = dps.to_canonical_document().expect("build");
        assert_eq!(
            document.reference().id(),
            "DPS355030810001234567890900001000000000000001"
        );
        assert!(document.xml().contains("<CPF>12345678909</CPF>"));
    }

    #[test]
    fn elements_follow_schema_order() {
        let xml = sample_dps().to_canonical_document().expect("build").xml().to_string();
        assert!(xml.starts_with(
            r#"<?xml version="1.0" encoding="UTF-8"?><DPS xmlns="http://www.sped.fazenda.gov.br/nfse" versao="1.00"><infDPS"#
        ));
        let order = [
            "<tpAmb>2</tpAmb>",
            "<dhEmi>2026-01-15T10:30:00-03:00</dhEmi>",
            "<verAplic>",
            "<serie>1</serie>",
            "<nDPS>1</nDPS>",
            "<dCompet>2026-01-15</dCompet>",
            "<tpEmit>1</tpEmit>",
            "<cLocEmi>3550308</cLocEmi>",
            "<prest><CNPJ>11222333000181</CNPJ><IM>12345</IM>",
            "<regTrib><opSimpNac>3</opSimpNac><regApTribSN>1</regApTribSN><regEspTrib>0</regEspTrib></regTrib>",
            "<toma><CPF>12345678909</CPF><xNome>Jane Doe</xNome>",
            "<endNac><cMun>3550308</cMun><CEP>01310100</CEP></endNac>",
            "<serv><locPrest><cLocPrestacao>3550308</cLocPrestacao></locPrest>",
            "<cTribNac>010701</cTribNac>",
            "<valores><vServPrest><vServ>1000.00</vServ></vServPrest>",
            "<tribMun><tribISSQN>1</tribISSQN><tpRetISSQN>1</tpRetISSQN></tribMun>",
            "<totTrib><pTotTribSN>6.00</pTotTribSN></totTrib>",
        ];
        let positions: Vec<usize> = order.iter().map(|tag| position(&xml, tag)).collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{xml}");
    }

    #[test]
    fn output_is_parseable_and_stable_under_canonicalization() {
        let document = sample_dps().to_canonical_document().expect("build");
        let parsed = XmlDocument::parse(document.xml()).expect("parse");
        assert!(is_element(parsed.root(), NFSE_NS, "DPS"));
        let subtree = parsed
            .canonicalize_reference(document.reference().id())
            .expect("c14n");
        assert!(subtree.starts_with(r#"<infDPS xmlns="http://www.sped.fazenda.gov.br/nfse" Id="DPS"#));
    }

    #[test]
    fn foreign_recipient_uses_nif_and_no_tax_rate_declares_indicator() {
        let mut dps = sample_dps();
        if let Some(recipient) = dps.recipient.as_mut() {
            recipient.tax_id = None;
            recipient.foreign_id = Some("PT123456789".into());
        }
        dps.values.simples_nacional_tax_rate = None;
        let xml = dps.to_canonical_document().expect("build").xml().to_string();
        assert!(xml.contains("<toma><NIF>PT123456789</NIF>"));
        assert!(xml.contains("<totTrib><indTotTrib>0</indTotTrib></totTrib>"));
    }

    #[test]
    fn application_version_can_be_overridden() {
        let dps = sample_dps();
        let document = DpsXml::new(&dps)
            .with_application_version("erp-1.2")
            .build()
            .expect("build");
        assert!(document.xml().contains("<verAplic>erp-1.2</verAplic>"));
    }

    #[test]
    fn competence_accepts_month_only() {
        let mut dps = sample_dps();
        dps.competence = "2026-01".into();
        let xml = dps.to_canonical_document().expect("build").xml().to_string();
        assert!(xml.contains("<dCompet>2026-01-01</dCompet>"));
    }

    #[test]
    fn rejects_malformed_fields() {
        let mut dps = sample_dps();
        dps.competence = "2026-13-40".into();
        assert!(matches!(
            dps.to_canonical_document(),
            Err(BuildError::InvalidValue { field: "dCompet", .. })
        ));

        let mut dps = sample_dps();
        dps.issuing_municipality = "355030".into();
        assert!(matches!(
            dps.to_canonical_document(),
            Err(BuildError::InvalidValue { field: "cLocEmi", .. })
        ));

        let mut dps = sample_dps();
        dps.provider.tax_regime.special_regime = 9;
        assert!(matches!(
            dps.to_canonical_document(),
            Err(BuildError::OutOfRange { field: "regEspTrib", .. })
        ));

        let mut dps = sample_dps();
        dps.values.service_amount = Amount::from_cents(0);
        assert!(matches!(
            dps.to_canonical_document(),
            Err(BuildError::OutOfRange { field: "vServ", .. })
        ));

        let mut dps = sample_dps();
        dps.series = "123456".into();
        assert!(matches!(
            dps.to_canonical_document(),
            Err(BuildError::InvalidValue { field: "serie", .. })
        ));

        let mut dps = sample_dps();
        dps.service.description = "   ".into();
        assert!(matches!(
            dps.to_canonical_document(),
            Err(BuildError::MissingField("xDescServ"))
        ));

        let mut dps = sample_dps();
        if let Some(recipient) = dps.recipient.as_mut() {
            recipient.tax_id = None;
        }
        assert!(matches!(
            dps.to_canonical_document(),
            Err(BuildError::MissingField("toma/CNPJ"))
        ));
    }

    #[test]
    fn text_is_escaped() {
        let mut dps = sample_dps();
        dps.service.description = "Manutencao <urgente> & revisao".into();
        let document = dps.to_canonical_document().expect("build");
        let parsed = XmlDocument::parse(document.xml()).expect("parse");
        let canonical = parsed.canonicalize().expect("c14n");
        assert!(canonical.contains("<xDescServ>Manutencao &lt;urgente&gt; &amp; revisao</xDescServ>"));
    }
}
