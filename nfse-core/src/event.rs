//! Event requests (`pedRegEvento`) registered against an issued NFSe.
use crate::access_key::AccessKey;
use crate::config::EnvironmentType;
use crate::document::{CanonicalDocument, SignableReference};
use crate::dps::xml::constants::{LAYOUT_VERSION, NFSE_NS, XML_DECLARATION};
use crate::dps::{BuildError, TaxId};
use chrono::{DateTime, FixedOffset, Utc};
use quick_xml::se::Serializer as QuickXmlSerializer;
use serde::ser::{Serialize, SerializeStruct, Serializer};

/// `tpEvento` of a cancellation request.
pub const CANCELLATION_EVENT: &str = "110111";

const CANCELLATION_DESCRIPTION: &str = "Cancelamento de NFS-e";
const MAX_REASON_LEN: usize = 255;

/// `cMotivo` of a cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancelReason {
    IssuingError,
    ServiceNotRendered,
    #[default]
    Other,
}

impl CancelReason {
    pub fn code(&self) -> u8 {
        match self {
            CancelReason::IssuingError => 1,
            CancelReason::ServiceNotRendered => 2,
            CancelReason::Other => 9,
        }
    }
}

/// Request to cancel an issued NFSe.
///
/// # Examples
/// ```rust
/// use nfse_core::event::CancelRequest;
///
/// let request = CancelRequest::new(
///     "35503082211222333000181000000000000126010000000017".parse()?,
///     "11.222.333/0001-81",
///     "Servico cobrado em duplicidade",
/// )?;
/// assert_eq!(request.author().digits(), "11222333000181");
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelRequest {
    access_key: AccessKey,
    author: TaxId,
    reason: String,
    reason_code: CancelReason,
    sequence: u16,
    requested_at: Option<DateTime<FixedOffset>>,
}

impl CancelRequest {
    pub fn new(
        access_key: AccessKey,
        author: &str,
        reason: impl Into<String>,
    ) -> Result<Self, BuildError> {
        let reason = reason.into().trim().to_string();
        if reason.is_empty() {
            return Err(BuildError::MissingField("xMotivo"));
        }
        if reason.chars().count() > MAX_REASON_LEN {
            return Err(BuildError::OutOfRange {
                field: "xMotivo",
                value: format!("{} characters", reason.chars().count()),
            });
        }
        Ok(Self {
            access_key,
            author: TaxId::parse(author)?,
            reason,
            reason_code: CancelReason::default(),
            sequence: 1,
            requested_at: None,
        })
    }

    pub fn with_reason_code(mut self, code: CancelReason) -> Self {
        self.reason_code = code;
        self
    }

    /// `nPedRegEvento`; 1 for the first request of this type.
    pub fn with_sequence(mut self, sequence: u16) -> Result<Self, BuildError> {
        if !(1..=999).contains(&sequence) {
            return Err(BuildError::OutOfRange {
                field: "nPedRegEvento",
                value: sequence.to_string(),
            });
        }
        self.sequence = sequence;
        Ok(self)
    }

    /// Fix `dhEvento`; defaults to the moment the document is built.
    pub fn with_requested_at(mut self, at: DateTime<FixedOffset>) -> Self {
        self.requested_at = Some(at);
        self
    }

    pub fn access_key(&self) -> &AccessKey {
        &self.access_key
    }

    pub fn author(&self) -> &TaxId {
        &self.author
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn reason_code(&self) -> CancelReason {
        self.reason_code
    }

    /// `infPedReg/@Id`: "PRE" + access key + event type + sequence (3).
    pub fn event_id(&self) -> String {
        format!(
            "PRE{}{}{:03}",
            self.access_key.as_str(),
            CANCELLATION_EVENT,
            self.sequence
        )
    }

    pub fn to_canonical_document(
        &self,
        environment: EnvironmentType,
        application_version: &str,
    ) -> Result<CanonicalDocument, BuildError> {
        let requested_at = self
            .requested_at
            .unwrap_or_else(|| Utc::now().fixed_offset());
        let view = EventXml {
            request: self,
            id: self.event_id(),
            tp_amb: environment.tp_amb(),
            application_version,
            dh_evento: requested_at.format("%Y-%m-%dT%H:%M:%S%:z").to_string(),
        };

        let mut buffer = String::with_capacity(1024);
        buffer.push_str(XML_DECLARATION);
        view.serialize(QuickXmlSerializer::new(&mut buffer))?;
        Ok(CanonicalDocument::from_xml(
            buffer,
            SignableReference::new(view.id.clone()),
        )?)
    }
}

struct EventXml<'a> {
    request: &'a CancelRequest,
    id: String,
    tp_amb: u8,
    application_version: &'a str,
    dh_evento: String,
}

impl<'a> Serialize for EventXml<'a> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut root = serializer.serialize_struct("pedRegEvento", 0)?;
        root.serialize_field("@xmlns", NFSE_NS)?;
        root.serialize_field("@versao", LAYOUT_VERSION)?;
        root.serialize_field("infPedReg", &InfPedRegXml(self))?;
        root.end()
    }
}

struct InfPedRegXml<'a>(&'a EventXml<'a>);

impl<'a> Serialize for InfPedRegXml<'a> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let event = self.0;
        let request = event.request;
        let author_tag = match request.author {
            TaxId::Cnpj(_) => "CNPJAutor",
            TaxId::Cpf(_) => "CPFAutor",
        };
        let mut st = s.serialize_struct("infPedReg", 0)?;
        st.serialize_field("@Id", &event.id)?;
        st.serialize_field("tpAmb", &event.tp_amb)?;
        st.serialize_field("verAplic", event.application_version)?;
        st.serialize_field("dhEvento", &event.dh_evento)?;
        st.serialize_field(author_tag, request.author.digits())?;
        st.serialize_field("chNFSe", request.access_key.as_str())?;
        st.serialize_field("nPedRegEvento", &request.sequence)?;
        st.serialize_field("e110111", &CancellationXml(request))?;
        st.end()
    }
}

struct CancellationXml<'a>(&'a CancelRequest);

impl<'a> Serialize for CancellationXml<'a> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("e110111", 0)?;
        st.serialize_field("xDesc", CANCELLATION_DESCRIPTION)?;
        st.serialize_field("cMotivo", &self.0.reason_code.code())?;
        st.serialize_field("xMotivo", &self.0.reason)?;
        st.end()
    }
}
