//! Read-only projections of documents returned by the authority.
use crate::access_key::AccessKey;
use crate::c14n::{XmlDocument, child_element, is_element};
use crate::dps::Amount;
use crate::dps::xml::constants::NFSE_NS;
use libxml::{tree::Node, xpath};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("XML parse error: {0}")]
    XmlParse(String),
    #[error("XPath error: {0}")]
    XPath(String),
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
    #[error("Invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
}

/// National address block (`enderNac`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Address {
    street: Option<String>,
    number: Option<String>,
    district: Option<String>,
    state: Option<String>,
    postal_code: Option<String>,
}

impl Address {
    pub fn street(&self) -> Option<&str> {
        self.street.as_deref()
    }

    pub fn number(&self) -> Option<&str> {
        self.number.as_deref()
    }

    pub fn district(&self) -> Option<&str> {
        self.district.as_deref()
    }

    /// Two-letter UF.
    pub fn state(&self) -> Option<&str> {
        self.state.as_deref()
    }

    /// CEP, digits only as written by the authority.
    pub fn postal_code(&self) -> Option<&str> {
        self.postal_code.as_deref()
    }

    fn is_empty(&self) -> bool {
        self == &Address::default()
    }
}

/// Issuer (`emit`) or recipient (`toma`) of an NFSe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Party {
    tax_id: Option<String>,
    name: Option<String>,
    municipal_registration: Option<String>,
    phone: Option<String>,
    email: Option<String>,
    address: Option<Address>,
}

impl Party {
    /// CNPJ, CPF or NIF, whichever the document carries.
    pub fn tax_id(&self) -> Option<&str> {
        self.tax_id.as_deref()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// `IM`.
    pub fn municipal_registration(&self) -> Option<&str> {
        self.municipal_registration.as_deref()
    }

    pub fn phone(&self) -> Option<&str> {
        self.phone.as_deref()
    }

    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    pub fn address(&self) -> Option<&Address> {
        self.address.as_ref()
    }

    fn is_empty(&self) -> bool {
        self == &Party::default()
    }
}

/// Fields of an issued NFSe that callers and the DANFSe renderer need.
///
/// Tax codes (`opSimpNac`, `tribISSQN`, ...) are kept as written; see
/// [`crate::danfse`] for their descriptions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NfseDocument {
    access_key: AccessKey,
    number: Option<String>,
    processed_at: Option<String>,
    emission_location: Option<String>,
    incidence_location: Option<String>,
    issuer: Party,
    recipient: Option<Party>,
    dps_id: Option<String>,
    dps_series: Option<String>,
    dps_number: Option<String>,
    issued_at: Option<String>,
    competence: Option<String>,
    national_tax_code: Option<String>,
    municipal_tax_code: Option<String>,
    service_description: Option<String>,
    service_location: Option<String>,
    simples_nacional: Option<String>,
    simples_nacional_regime: Option<String>,
    iss_taxation: Option<String>,
    iss_retention: Option<String>,
    service_amount: Option<Amount>,
    calculation_base: Option<Amount>,
    iss_rate: Option<Amount>,
    iss_amount: Option<Amount>,
    net_amount: Option<Amount>,
}

impl NfseDocument {
    /// Access key taken from `infNFSe/@Id` (without its `NFS` prefix).
    pub fn access_key(&self) -> &AccessKey {
        &self.access_key
    }

    /// `nNFSe`, as written by the authority.
    pub fn number(&self) -> Option<&str> {
        self.number.as_deref()
    }

    pub fn processed_at(&self) -> Option<&str> {
        self.processed_at.as_deref()
    }

    /// `xLocEmi`.
    pub fn emission_location(&self) -> Option<&str> {
        self.emission_location.as_deref()
    }

    /// `xLocIncid`.
    pub fn incidence_location(&self) -> Option<&str> {
        self.incidence_location.as_deref()
    }

    pub fn issuer(&self) -> &Party {
        &self.issuer
    }

    pub fn issuer_tax_id(&self) -> Option<&str> {
        self.issuer.tax_id()
    }

    pub fn issuer_name(&self) -> Option<&str> {
        self.issuer.name()
    }

    pub fn recipient(&self) -> Option<&Party> {
        self.recipient.as_ref()
    }

    /// Id of the DPS embedded in the invoice.
    pub fn dps_id(&self) -> Option<&str> {
        self.dps_id.as_deref()
    }

    pub fn dps_series(&self) -> Option<&str> {
        self.dps_series.as_deref()
    }

    pub fn dps_number(&self) -> Option<&str> {
        self.dps_number.as_deref()
    }

    /// `dhEmi` of the DPS.
    pub fn issued_at(&self) -> Option<&str> {
        self.issued_at.as_deref()
    }

    /// `dCompet` of the DPS.
    pub fn competence(&self) -> Option<&str> {
        self.competence.as_deref()
    }

    /// `cTribNac`.
    pub fn national_tax_code(&self) -> Option<&str> {
        self.national_tax_code.as_deref()
    }

    pub fn municipal_tax_code(&self) -> Option<&str> {
        self.municipal_tax_code.as_deref()
    }

    pub fn service_description(&self) -> Option<&str> {
        self.service_description.as_deref()
    }

    /// IBGE code of `cLocPrestacao`.
    pub fn service_location(&self) -> Option<&str> {
        self.service_location.as_deref()
    }

    /// `opSimpNac` code.
    pub fn simples_nacional(&self) -> Option<&str> {
        self.simples_nacional.as_deref()
    }

    /// `regApTribSN` code.
    pub fn simples_nacional_regime(&self) -> Option<&str> {
        self.simples_nacional_regime.as_deref()
    }

    /// `tribISSQN` code.
    pub fn iss_taxation(&self) -> Option<&str> {
        self.iss_taxation.as_deref()
    }

    /// `tpRetISSQN` code.
    pub fn iss_retention(&self) -> Option<&str> {
        self.iss_retention.as_deref()
    }

    pub fn service_amount(&self) -> Option<Amount> {
        self.service_amount
    }

    /// `vBC`.
    pub fn calculation_base(&self) -> Option<Amount> {
        self.calculation_base
    }

    /// `pAliqAplic`, in percent.
    pub fn iss_rate(&self) -> Option<Amount> {
        self.iss_rate
    }

    /// `vISSQN`.
    pub fn iss_amount(&self) -> Option<Amount> {
        self.iss_amount
    }

    /// `vLiq`.
    pub fn net_amount(&self) -> Option<Amount> {
        self.net_amount
    }
}

/// Project an NFSe document.
///
/// This does not check the signature; documents received through
/// [`crate::api::NfseClient`] are projected from the signed element only.
///
/// # Examples
/// ```rust,no_run
/// use nfse_core::nfse::parse_nfse_xml;
///
/// let xml = std::fs::read_to_string("nfse.xml")?;
/// let nfse = parse_nfse_xml(&xml)?;
/// println!("{} {:?}", nfse.access_key(), nfse.number());
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub fn parse_nfse_xml(xml: &str) -> Result<NfseDocument, ParseError> {
    let doc = parse_document(xml)?;
    let inf_nfse = root_child(&doc, "NFSe", "infNFSe")?;
    project_nfse(&inf_nfse)
}

/// Project the fields of an `infNFSe` element, relative to that element.
pub(crate) fn project_nfse(inf_nfse: &Node) -> Result<NfseDocument, ParseError> {
    let fields = Fields::new(inf_nfse)?;

    let id = fields.required("@Id", "infNFSe/@Id")?;
    let key = id.strip_prefix("NFS").unwrap_or(&id);
    let access_key = AccessKey::new(key).map_err(|e| ParseError::InvalidValue {
        field: "infNFSe/@Id",
        value: format!("{id}: {e}"),
    })?;

    let issuer = fields.party("n:emit")?;
    let recipient = Some(fields.party("n:DPS/n:infDPS/n:toma")?).filter(|p| !p.is_empty());

    Ok(NfseDocument {
        access_key,
        number: fields.text("n:nNFSe")?,
        processed_at: fields.text("n:dhProc")?,
        emission_location: fields.text("n:xLocEmi")?,
        incidence_location: fields.text("n:xLocIncid")?,
        issuer,
        recipient,
        dps_id: fields.text("n:DPS/n:infDPS/@Id")?,
        dps_series: fields.text("n:DPS/n:infDPS/n:serie")?,
        dps_number: fields.text("n:DPS/n:infDPS/n:nDPS")?,
        issued_at: fields.text("n:DPS/n:infDPS/n:dhEmi")?,
        competence: fields.text("n:DPS/n:infDPS/n:dCompet")?,
        national_tax_code: fields.text("n:DPS/n:infDPS/n:serv/n:cServ/n:cTribNac")?,
        municipal_tax_code: fields.text("n:DPS/n:infDPS/n:serv/n:cServ/n:cTribMun")?,
        service_description: fields.text("n:DPS/n:infDPS/n:serv/n:cServ/n:xDescServ")?,
        service_location: fields.text("n:DPS/n:infDPS/n:serv/n:locPrest/n:cLocPrestacao")?,
        simples_nacional: fields.text("n:DPS/n:infDPS/n:prest/n:regTrib/n:opSimpNac")?,
        simples_nacional_regime: fields.text("n:DPS/n:infDPS/n:prest/n:regTrib/n:regApTribSN")?,
        iss_taxation: fields.text("n:DPS/n:infDPS/n:valores/n:trib/n:tribMun/n:tribISSQN")?,
        iss_retention: fields.text("n:DPS/n:infDPS/n:valores/n:trib/n:tribMun/n:tpRetISSQN")?,
        service_amount: fields.amount("n:DPS/n:infDPS/n:valores/n:vServPrest/n:vServ", "vServ")?,
        calculation_base: fields.amount("n:valores/n:vBC", "vBC")?,
        iss_rate: fields.amount("n:valores/n:pAliqAplic", "pAliqAplic")?,
        iss_amount: fields.amount("n:valores/n:vISSQN", "vISSQN")?,
        net_amount: fields.amount("n:valores/n:vLiq", "vLiq")?,
    })
}

/// Fields of a registered event document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDocument {
    id: String,
    access_key: Option<String>,
    processed_at: Option<String>,
}

impl EventDocument {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn access_key(&self) -> Option<&str> {
        self.access_key.as_deref()
    }

    pub fn processed_at(&self) -> Option<&str> {
        self.processed_at.as_deref()
    }
}

pub fn parse_event_xml(xml: &str) -> Result<EventDocument, ParseError> {
    let doc = parse_document(xml)?;
    let inf_evento = root_child(&doc, "evento", "infEvento")?;
    project_event(&inf_evento)
}

/// Project the fields of an `infEvento` element, relative to that element.
pub(crate) fn project_event(inf_evento: &Node) -> Result<EventDocument, ParseError> {
    let fields = Fields::new(inf_evento)?;
    Ok(EventDocument {
        id: fields.required("@Id", "infEvento/@Id")?,
        access_key: fields.text("n:pedRegEvento/n:infPedReg/n:chNFSe")?,
        processed_at: fields.text("n:dhProc")?,
    })
}

fn parse_document(xml: &str) -> Result<XmlDocument, ParseError> {
    XmlDocument::parse(xml).map_err(|e| ParseError::XmlParse(e.to_string()))
}

fn root_child(
    doc: &XmlDocument,
    root_name: &str,
    child_name: &'static str,
) -> Result<Node, ParseError> {
    let root = doc.root();
    if !is_element(root, NFSE_NS, root_name) {
        return Err(ParseError::MissingField(child_name));
    }
    child_element(root, NFSE_NS, child_name).ok_or(ParseError::MissingField(child_name))
}

/// XPath lookups relative to one element.
struct Fields<'a> {
    ctx: xpath::Context,
    node: &'a Node,
}

impl<'a> Fields<'a> {
    fn new(node: &'a Node) -> Result<Self, ParseError> {
        let ctx = xpath::Context::from_node(node)
            .map_err(|e| ParseError::XPath(format!("{e:?}")))?;
        ctx.register_namespace("n", NFSE_NS)
            .map_err(|e| ParseError::XPath(format!("{e:?}")))?;
        Ok(Self { ctx, node })
    }

    fn required(&self, expr: &str, label: &'static str) -> Result<String, ParseError> {
        self.text(expr)?.ok_or(ParseError::MissingField(label))
    }

    fn text(&self, expr: &str) -> Result<Option<String>, ParseError> {
        let nodes = self
            .ctx
            .node_evaluate(expr, self.node)
            .map_err(|e| ParseError::XPath(format!("{expr}: {e:?}")))?
            .get_nodes_as_vec();
        let Some(node) = nodes.first() else {
            return Ok(None);
        };
        let value = node.get_content().trim().to_string();
        if value.is_empty() {
            return Ok(None);
        }
        Ok(Some(value))
    }

    fn amount(&self, expr: &str, label: &'static str) -> Result<Option<Amount>, ParseError> {
        self.text(expr)?
            .map(|value| {
                value.parse::<Amount>().map_err(|_| ParseError::InvalidValue {
                    field: label,
                    value,
                })
            })
            .transpose()
    }

    fn first_text(&self, exprs: &[String]) -> Result<Option<String>, ParseError> {
        for expr in exprs {
            if let Some(value) = self.text(expr)? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    fn party(&self, base: &str) -> Result<Party, ParseError> {
        let at = |leaf: &str| format!("{base}/{leaf}");
        let address = Address {
            street: self.text(&at("n:enderNac/n:xLgr"))?,
            number: self.text(&at("n:enderNac/n:nro"))?,
            district: self.text(&at("n:enderNac/n:xBairro"))?,
            state: self.text(&at("n:enderNac/n:UF"))?,
            postal_code: self.text(&at("n:enderNac/n:CEP"))?,
        };
        Ok(Party {
            tax_id: self.first_text(&[at("n:CNPJ"), at("n:CPF"), at("n:NIF")])?,
            name: self.text(&at("n:xNome"))?,
            municipal_registration: self.text(&at("n:IM"))?,
            phone: self.text(&at("n:fone"))?,
            email: self.text(&at("n:email"))?,
            address: Some(address).filter(|a| !a.is_empty()),
        })
    }
}
