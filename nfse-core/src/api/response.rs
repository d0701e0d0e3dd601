//! Protocol outcomes and the interpretation of raw responses.
use crate::NfseError;
use crate::access_key::{AccessKey, nfse_number_from_key};
use crate::c14n::XmlDocument;
use crate::codec;
use crate::nfse::{EventDocument, NfseDocument, project_event, project_nfse};
use crate::sign::{SignatureVerificationError, TrustStore, signed_root_child, verify_parsed};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Result of one client call that reached a conclusion.
#[derive(Debug, Clone)]
pub enum ProtocolOutcome {
    Issued(IssuedNfse),
    EventRegistered(EventReceipt),
    Rejected(Rejection),
    TransportFailure(TransportFailure),
}

/// Successful outcomes, as returned by [`ProtocolOutcome::into_result`].
#[derive(Debug, Clone)]
pub enum Accepted {
    Issued(IssuedNfse),
    EventRegistered(EventReceipt),
}

impl ProtocolOutcome {
    /// Fold rejections and transport failures into [`NfseError`].
    pub fn into_result(self) -> Result<Accepted, NfseError> {
        match self {
            ProtocolOutcome::Issued(nfse) => Ok(Accepted::Issued(nfse)),
            ProtocolOutcome::EventRegistered(receipt) => Ok(Accepted::EventRegistered(receipt)),
            ProtocolOutcome::Rejected(rejection) => Err(NfseError::BusinessRejection(rejection)),
            ProtocolOutcome::TransportFailure(failure) => Err(NfseError::Transport(failure)),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self,
            ProtocolOutcome::Issued(_) | ProtocolOutcome::EventRegistered(_)
        )
    }
}

/// An NFSe issued (or fetched) from the authority, signature verified.
#[derive(Debug, Clone)]
pub struct IssuedNfse {
    access_key: AccessKey,
    number: String,
    status: Option<String>,
    xml: String,
    document: NfseDocument,
    signer: String,
}

impl IssuedNfse {
    pub fn access_key(&self) -> &AccessKey {
        &self.access_key
    }

    /// NFSe number: the response's `nNFSe`, else the document's, else the
    /// one embedded in the access key.
    pub fn number(&self) -> &str {
        &self.number
    }

    /// `situacao` reported alongside the document, when present.
    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    /// Decoded NFSe document, byte for byte as received.
    pub fn xml(&self) -> &str {
        &self.xml
    }

    pub fn document(&self) -> &NfseDocument {
        &self.document
    }

    /// Subject of the certificate that signed the NFSe.
    pub fn signer(&self) -> &str {
        &self.signer
    }
}

/// Acknowledgement of a registered event (cancellation).
#[derive(Debug, Clone)]
pub struct EventReceipt {
    access_key: AccessKey,
    protocol: Option<String>,
    xml: Option<String>,
    event: Option<EventDocument>,
}

impl EventReceipt {
    pub fn access_key(&self) -> &AccessKey {
        &self.access_key
    }

    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    /// Event document returned by the authority, if any.
    pub fn xml(&self) -> Option<&str> {
        self.xml.as_deref()
    }

    pub fn event(&self) -> Option<&EventDocument> {
        self.event.as_ref()
    }
}

/// A single error reported by the authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionMessage {
    code: String,
    message: String,
    complement: Option<String>,
}

impl RejectionMessage {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            complement: None,
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn complement(&self) -> Option<&str> {
        self.complement.as_deref()
    }
}

/// The authority refused the request. Never retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    status: u16,
    messages: Vec<RejectionMessage>,
}

impl Rejection {
    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn messages(&self) -> &[RejectionMessage] {
        &self.messages
    }

    pub fn codes(&self) -> Vec<&str> {
        self.messages.iter().map(|m| m.code()).collect()
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP {}", self.status)?;
        for message in &self.messages {
            write!(f, "; {}: {}", message.code, message.message)?;
            if let Some(complement) = &message.complement {
                write!(f, " ({complement})")?;
            }
        }
        Ok(())
    }
}

/// No usable response was obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFailure {
    retryable: bool,
    attempts: u32,
    status: Option<u16>,
    cause: String,
}

impl TransportFailure {
    pub(crate) fn exhausted(attempts: u32, status: Option<u16>, cause: String) -> Self {
        Self {
            retryable: false,
            attempts,
            status,
            cause,
        }
    }

    /// A success status whose body could not be read. Not resent by the
    /// client: the request may already have taken effect.
    pub(crate) fn unreadable(attempts: u32, status: u16, cause: String) -> Self {
        Self {
            retryable: true,
            attempts,
            status: Some(status),
            cause,
        }
    }

    /// Whether the caller may try again later. `false` once the client has
    /// spent its retry budget; `true` for an unreadable success body, which
    /// a query for the same key can resolve.
    pub fn retryable(&self) -> bool {
        self.retryable
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// HTTP status of the last attempt, if one was received.
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn cause(&self) -> &str {
        &self.cause
    }
}

impl fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} after {} attempt(s)", self.cause, self.attempts)
    }
}

/// How an HTTP status is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StatusClass {
    Success,
    Rejected,
    Retryable,
}

pub(crate) fn classify_status(status: u16) -> StatusClass {
    match status {
        200..=299 => StatusClass::Success,
        408 | 429 => StatusClass::Retryable,
        400..=499 => StatusClass::Rejected,
        _ => StatusClass::Retryable,
    }
}

/// Interpretation of a 2xx body.
#[derive(Debug)]
pub(crate) enum Interpretation<T> {
    Accepted(T),
    /// Unreadable body: reported as a retryable transport failure.
    Garbage(String),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TextOrNumber {
    Text(String),
    Number(serde_json::Number),
}

impl TextOrNumber {
    fn into_string(self) -> String {
        match self {
            TextOrNumber::Text(text) => text,
            TextOrNumber::Number(number) => number.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct NfseResponseBody {
    #[serde(rename = "chaveAcesso")]
    access_key: String,
    #[serde(rename = "nNFSe", default)]
    number: Option<TextOrNumber>,
    #[serde(rename = "situacao", default)]
    status: Option<String>,
    #[serde(rename = "nfseXmlGZipB64")]
    nfse_xml: String,
}

#[derive(Debug, Deserialize)]
struct EventResponseBody {
    #[serde(rename = "protocolo", default)]
    protocol: Option<TextOrNumber>,
    #[serde(rename = "eventoXmlGZipB64", default)]
    event_xml: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorItem {
    #[serde(rename = "Codigo", alias = "codigo", default)]
    code: Option<TextOrNumber>,
    #[serde(rename = "Descricao", alias = "descricao", default)]
    description: Option<String>,
    #[serde(rename = "Complemento", alias = "complemento", default)]
    complement: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ErrorBody {
    List {
        erros: Vec<ErrorItem>,
    },
    Single {
        codigo: TextOrNumber,
        #[serde(default)]
        mensagem: Option<String>,
    },
}

/// Build a [`Rejection`] from a 4xx body in any of the known shapes.
pub(crate) fn parse_rejection(status: u16, body: &[u8]) -> Rejection {
    let text = String::from_utf8_lossy(body).trim().to_string();
    let messages = match serde_json::from_slice::<ErrorBody>(body) {
        Ok(ErrorBody::List { erros }) if !erros.is_empty() => erros
            .into_iter()
            .map(|item| RejectionMessage {
                code: item
                    .code
                    .map(TextOrNumber::into_string)
                    .unwrap_or_else(|| status.to_string()),
                message: item.description.unwrap_or_default(),
                complement: item.complement.filter(|c| !c.is_empty()),
            })
            .collect(),
        Ok(ErrorBody::Single { codigo, mensagem }) => vec![RejectionMessage {
            code: codigo.into_string(),
            message: mensagem.unwrap_or_default(),
            complement: None,
        }],
        _ => vec![RejectionMessage::new(status.to_string(), text)],
    };
    Rejection { status, messages }
}

/// Decode, verify and project an issue or query response.
///
/// Only signature failures are errors; anything unreadable is garbage. The
/// signature must cover `infNFSe` for the response's own key, and only that
/// element is projected.
pub(crate) fn interpret_nfse(
    body: &[u8],
    expected_key: Option<&AccessKey>,
    trust: &TrustStore,
) -> Result<Interpretation<IssuedNfse>, SignatureVerificationError> {
    let parsed: NfseResponseBody = match serde_json::from_slice(body) {
        Ok(parsed) => parsed,
        Err(e) => return Ok(Interpretation::Garbage(format!("unreadable NFSe response: {e}"))),
    };
    let access_key = match AccessKey::new(parsed.access_key.trim()) {
        Ok(key) => key,
        Err(e) => return Ok(Interpretation::Garbage(format!("chaveAcesso: {e}"))),
    };
    if let Some(expected) = expected_key {
        if expected != &access_key {
            return Ok(Interpretation::Garbage(format!(
                "response is for {access_key}, requested {expected}"
            )));
        }
    }
    let xml = match codec::decode(&parsed.nfse_xml) {
        Ok(xml) => xml,
        Err(e) => return Ok(Interpretation::Garbage(format!("nfseXmlGZipB64: {e}"))),
    };
    let tree = match XmlDocument::parse(&xml) {
        Ok(tree) => tree,
        Err(e) => return Ok(Interpretation::Garbage(format!("NFSe document: {e}"))),
    };
    let verified = verify_parsed(&tree, trust, Utc::now())?;
    let expected_id = format!("NFS{access_key}");
    if verified.reference().id() != expected_id {
        return Err(SignatureVerificationError::UnexpectedReference {
            expected: expected_id,
            found: verified.reference().id().to_string(),
        });
    }
    let signed = signed_root_child(&tree, &verified, "infNFSe")?;
    let document = match project_nfse(&signed) {
        Ok(document) => document,
        Err(e) => return Ok(Interpretation::Garbage(format!("NFSe document: {e}"))),
    };

    let number = parsed
        .number
        .map(TextOrNumber::into_string)
        .filter(|n| !n.trim().is_empty())
        .or_else(|| document.number().map(str::to_string))
        .or_else(|| nfse_number_from_key(access_key.as_str()))
        .unwrap_or_default();

    Ok(Interpretation::Accepted(IssuedNfse {
        access_key,
        number,
        status: parsed.status.filter(|s| !s.trim().is_empty()),
        xml,
        document,
        signer: verified.signer(),
    }))
}

/// Interpret a cancellation acknowledgement, verifying the event document
/// when one is returned.
pub(crate) fn interpret_event(
    body: &[u8],
    access_key: &AccessKey,
    trust: &TrustStore,
) -> Result<Interpretation<EventReceipt>, SignatureVerificationError> {
    let parsed: EventResponseBody = if body.iter().all(u8::is_ascii_whitespace) {
        EventResponseBody {
            protocol: None,
            event_xml: None,
        }
    } else {
        match serde_json::from_slice(body) {
            Ok(parsed) => parsed,
            Err(e) => {
                return Ok(Interpretation::Garbage(format!(
                    "unreadable event response: {e}"
                )));
            }
        }
    };

    let (xml, event) = match parsed.event_xml.filter(|x| !x.trim().is_empty()) {
        Some(encoded) => {
            let xml = match codec::decode(&encoded) {
                Ok(xml) => xml,
                Err(e) => return Ok(Interpretation::Garbage(format!("eventoXmlGZipB64: {e}"))),
            };
            let tree = match XmlDocument::parse(&xml) {
                Ok(tree) => tree,
                Err(e) => return Ok(Interpretation::Garbage(format!("event document: {e}"))),
            };
            let verified = verify_parsed(&tree, trust, Utc::now())?;
            let signed = signed_root_child(&tree, &verified, "infEvento")?;
            let event = match project_event(&signed) {
                Ok(event) => event,
                Err(e) => return Ok(Interpretation::Garbage(format!("event document: {e}"))),
            };
            if let Some(key) = event.access_key() {
                if key != access_key.as_str() {
                    return Ok(Interpretation::Garbage(format!(
                        "event is for {key}, requested {access_key}"
                    )));
                }
            }
            (Some(xml), Some(event))
        }
        None => (None, None),
    };

    Ok(Interpretation::Accepted(EventReceipt {
        access_key: access_key.clone(),
        protocol: parsed.protocol.map(TextOrNumber::into_string),
        xml,
        event,
    }))
}

/// A DANFSe body must be a PDF.
pub(crate) fn interpret_danfse(body: &[u8]) -> Interpretation<Vec<u8>> {
    if body.starts_with(b"%PDF") {
        Interpretation::Accepted(body.to_vec())
    } else {
        Interpretation::Garbage(format!(
            "DANFSe response is not a PDF ({} bytes)",
            body.len()
        ))
    }
}
