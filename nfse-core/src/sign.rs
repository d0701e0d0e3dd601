//! Enveloped XML-DSig over canonical documents.
//!
//! Signing and verification share one fixed algorithm profile. The
//! `Signature` element is built in the document tree and its `SignedInfo`
//! is canonicalized in place, so both sides digest exactly the same bytes.
use crate::c14n::{C14N_ALGORITHM, CanonicalizationError, XmlDocument, child_element, is_element};
use crate::credentials::{self, CredentialError, SigningCredential};
use crate::document::{CanonicalDocument, SignableReference, SignedDocument};
use crate::dps::xml::constants::{DS_NS, NFSE_NS};
use base64ct::{Base64, Encoding};
use chrono::{DateTime, Utc};
use libxml::tree::{Namespace, Node};
use rsa::pkcs1v15::{Signature, VerifyingKey};
use rsa::signature::Verifier;
use sha2::{Digest, Sha256};
use std::error::Error as StdError;
use thiserror::Error;
use x509_cert::{
    Certificate,
    der::{Decode, DecodePem, Encode},
};

/// Algorithm identifiers of a signature profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureProfile {
    pub canonicalization: &'static str,
    pub signature_method: &'static str,
    pub digest_method: &'static str,
    pub transforms: [&'static str; 2],
}

pub const ENVELOPED_SIGNATURE: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";
pub const RSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";
pub const SHA256: &str = "http://www.w3.org/2001/04/xmlenc#sha256";

impl SignatureProfile {
    /// Profile accepted by the national platform for DPS, NFSe and events.
    pub const NFSE_V1: SignatureProfile = SignatureProfile {
        canonicalization: C14N_ALGORITHM,
        signature_method: RSA_SHA256,
        digest_method: SHA256,
        transforms: [ENVELOPED_SIGNATURE, C14N_ALGORITHM],
    };
}

#[derive(Debug, Error)]
pub enum SignatureVerificationError {
    #[error("document is not well-formed: {0}")]
    Document(#[source] CanonicalizationError),
    #[error("document carries no signature")]
    MissingSignature,
    #[error("document carries {0} signatures at the root")]
    MultipleSignatures(usize),
    #[error("unsupported {what}: {uri}")]
    UnsupportedAlgorithm { what: &'static str, uri: String },
    #[error("malformed signature: {0}")]
    MalformedSignature(String),
    #[error("signature reference does not resolve: {0}")]
    Reference(#[source] CanonicalizationError),
    #[error("signature covers {found}, expected {expected}")]
    UnexpectedReference { expected: String, found: String },
    #[error("digest of the referenced element does not match")]
    DigestMismatch,
    #[error("signature value does not verify")]
    InvalidSignatureValue,
    #[error("signer certificate is unusable: {0}")]
    Certificate(String),
    #[error("signer certificate is outside its validity window: {0}")]
    SignerValidity(#[source] CredentialError),
    #[error("signer certificate is not trusted: {subject}")]
    UntrustedCertificate { subject: String },
}

/// The values that make up one `<Signature>` element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureBlock {
    profile: SignatureProfile,
    reference: SignableReference,
    digest_value: String,
    signature_value: String,
    certificate: String,
}

impl SignatureBlock {
    pub fn profile(&self) -> &SignatureProfile {
        &self.profile
    }

    pub fn reference(&self) -> &SignableReference {
        &self.reference
    }

    /// Base64 SHA-256 of the canonical referenced element.
    pub fn digest_value(&self) -> &str {
        &self.digest_value
    }

    pub fn signature_value(&self) -> &str {
        &self.signature_value
    }

    /// Base64 DER of the signer certificate.
    pub fn certificate(&self) -> &str {
        &self.certificate
    }

    /// Build the `<Signature>` element, in the XML-DSig default namespace,
    /// as the last child of the document root.
    pub(crate) fn append_to(&self, document: &mut XmlDocument) -> Result<Node, CanonicalizationError> {
        let p = &self.profile;
        let mut signature = Node::new("Signature", None, document.document())
            .map_err(|_| CanonicalizationError::Tree("cannot create Signature".into()))?;
        let ns = Namespace::new("", DS_NS, &mut signature).map_err(tree_error)?;
        signature.set_namespace(&ns).map_err(tree_error)?;
        document.append_to_root(&mut signature)?;

        let mut signed_info = signature.new_child(None, "SignedInfo").map_err(tree_error)?;
        algorithm_child(&mut signed_info, "CanonicalizationMethod", p.canonicalization)?;
        algorithm_child(&mut signed_info, "SignatureMethod", p.signature_method)?;
        let mut reference = signed_info.new_child(None, "Reference").map_err(tree_error)?;
        reference
            .set_attribute("URI", &self.reference.uri())
            .map_err(tree_error)?;
        let mut transforms = reference.new_child(None, "Transforms").map_err(tree_error)?;
        for transform in p.transforms {
            algorithm_child(&mut transforms, "Transform", transform)?;
        }
        algorithm_child(&mut reference, "DigestMethod", p.digest_method)?;
        reference
            .add_text_child(None, "DigestValue", &self.digest_value)
            .map_err(tree_error)?;

        signature
            .add_text_child(None, "SignatureValue", &self.signature_value)
            .map_err(tree_error)?;
        signature
            .new_child(None, "KeyInfo")
            .map_err(tree_error)?
            .new_child(None, "X509Data")
            .map_err(tree_error)?
            .add_text_child(None, "X509Certificate", &self.certificate)
            .map_err(tree_error)?;
        Ok(signature)
    }
}

fn algorithm_child(
    parent: &mut Node,
    name: &str,
    algorithm: &str,
) -> Result<(), CanonicalizationError> {
    parent
        .new_child(None, name)
        .map_err(tree_error)?
        .set_attribute("Algorithm", algorithm)
        .map_err(tree_error)
}

fn tree_error(e: Box<dyn StdError + Send + Sync>) -> CanonicalizationError {
    CanonicalizationError::Tree(e.to_string())
}

/// Signs canonical documents with one credential under [`SignatureProfile::NFSE_V1`].
pub struct SignatureEngine<'a> {
    credential: &'a SigningCredential,
    profile: SignatureProfile,
}

impl<'a> SignatureEngine<'a> {
    pub fn new(credential: &'a SigningCredential) -> Self {
        Self {
            credential,
            profile: SignatureProfile::NFSE_V1,
        }
    }

    /// First phase: digest the referenced element and sign the resulting
    /// `SignedInfo`.
    pub fn signature_block(
        &self,
        document: &CanonicalDocument,
    ) -> Result<SignatureBlock, CanonicalizationError> {
        let mut staged = XmlDocument::parse(document.xml())?;
        let canonical = staged.canonicalize_reference(document.reference().id())?;

        let mut block = SignatureBlock {
            profile: self.profile,
            reference: document.reference().clone(),
            digest_value: Base64::encode_string(&Sha256::digest(canonical.as_bytes())),
            signature_value: String::new(),
            certificate: self.credential.certificate_base64(),
        };

        let signature = block.append_to(&mut staged)?;
        let signed_info = child_element(&signature, DS_NS, "SignedInfo")
            .ok_or_else(|| CanonicalizationError::Tree("SignedInfo was not assembled".into()))?;
        let signed_info = staged.canonicalize_element(&signed_info)?;

        block.signature_value =
            Base64::encode_string(&self.credential.sign_bytes(signed_info.as_bytes()));
        Ok(block)
    }

    /// Both phases: compute the block, then assemble a new signed document.
    /// `document` itself is left untouched.
    pub fn sign(&self, document: &CanonicalDocument) -> Result<SignedDocument, CanonicalizationError> {
        let block = self.signature_block(document)?;
        let signed = SignedDocument::assemble(document, &block)?;
        tracing::debug!(reference = %document.reference(), "document signed");
        Ok(signed)
    }
}

/// Check an RSA-SHA256 signature over `data` with the certificate's key.
pub fn verify_bytes(
    certificate: &Certificate,
    data: &[u8],
    signature: &[u8],
) -> Result<(), SignatureVerificationError> {
    let key = credentials::certificate_public_key(certificate)
        .map_err(|e| SignatureVerificationError::Certificate(e.to_string()))?;
    let signature = Signature::try_from(signature)
        .map_err(|_| SignatureVerificationError::InvalidSignatureValue)?;
    VerifyingKey::<Sha256>::new(key)
        .verify(data, &signature)
        .map_err(|_| SignatureVerificationError::InvalidSignatureValue)
}

/// Which signer certificates a verification accepts.
#[derive(Debug, Clone, Default)]
pub struct TrustStore {
    pinned: Vec<Vec<u8>>,
    anchors: Vec<Certificate>,
}

impl TrustStore {
    /// Accept any embedded certificate: only integrity and the signer's
    /// validity window are checked.
    pub fn any() -> Self {
        Self::default()
    }

    /// Accept this exact certificate.
    pub fn with_pinned(mut self, certificate: &Certificate) -> Result<Self, CredentialError> {
        let der = certificate
            .to_der()
            .map_err(|e| CredentialError::Malformed(format!("certificate: {e}")))?;
        self.pinned.push(der);
        Ok(self)
    }

    /// Accept certificates signed by this issuer.
    pub fn with_anchor(mut self, certificate: Certificate) -> Self {
        self.anchors.push(certificate);
        self
    }

    /// Anchors from a PEM file holding one or more certificates.
    pub fn from_pem_anchors(pem: &[u8]) -> Result<Self, CredentialError> {
        let anchors = Certificate::load_pem_chain(pem)
            .map_err(|e| CredentialError::Malformed(format!("trust anchors: {e}")))?;
        if anchors.is_empty() {
            return Err(CredentialError::MissingCertificate);
        }
        Ok(Self {
            pinned: Vec::new(),
            anchors,
        })
    }

    /// Pin the single certificate in a PEM file.
    pub fn from_pem_pinned(pem: &[u8]) -> Result<Self, CredentialError> {
        let certificate = Certificate::from_pem(pem)
            .map_err(|e| CredentialError::Malformed(format!("certificate: {e}")))?;
        Self::default().with_pinned(&certificate)
    }

    pub fn is_unrestricted(&self) -> bool {
        self.pinned.is_empty() && self.anchors.is_empty()
    }

    fn accepts(&self, certificate: &Certificate, der: &[u8]) -> bool {
        self.is_unrestricted()
            || self.pinned.iter().any(|pinned| pinned == der)
            || self
                .anchors
                .iter()
                .any(|anchor| credentials::is_issued_by(certificate, anchor))
    }
}

/// Outcome of a successful [`verify_document`].
#[derive(Debug, Clone)]
pub struct VerifiedSignature {
    reference: SignableReference,
    certificate: Certificate,
}

impl VerifiedSignature {
    pub fn reference(&self) -> &SignableReference {
        &self.reference
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    pub fn signer(&self) -> String {
        self.certificate.tbs_certificate.subject.to_string()
    }
}

/// Verify the single enveloped signature at the root of `xml`, checking
/// the signer certificate against the current time.
///
/// # Examples
/// ```rust,no_run
/// use nfse_core::sign::{TrustStore, verify_document};
///
/// # fn demo(xml: &str) -> Result<(), nfse_core::sign::SignatureVerificationError> {
/// let verified = verify_document(xml, &TrustStore::any())?;
/// println!("{} signed {}", verified.signer(), verified.reference());
/// # Ok(())
/// # }
/// ```
pub fn verify_document(
    xml: &str,
    trust: &TrustStore,
) -> Result<VerifiedSignature, SignatureVerificationError> {
    verify_document_at(xml, trust, Utc::now())
}

/// [`verify_document`] with the signer's validity checked at `at`.
pub fn verify_document_at(
    xml: &str,
    trust: &TrustStore,
    at: DateTime<Utc>,
) -> Result<VerifiedSignature, SignatureVerificationError> {
    let document = XmlDocument::parse(xml).map_err(SignatureVerificationError::Document)?;
    verify_parsed(&document, trust, at)
}

pub(crate) fn verify_parsed(
    document: &XmlDocument,
    trust: &TrustStore,
    at: DateTime<Utc>,
) -> Result<VerifiedSignature, SignatureVerificationError> {
    let profile = SignatureProfile::NFSE_V1;
    let signatures: Vec<Node> = document
        .root()
        .get_child_elements()
        .into_iter()
        .filter(is_signature)
        .collect();
    let signature = match signatures.as_slice() {
        [] => return Err(SignatureVerificationError::MissingSignature),
        [signature] => signature,
        many => return Err(SignatureVerificationError::MultipleSignatures(many.len())),
    };

    let signed_info = required_child(signature, "SignedInfo")?;
    expect_algorithm(
        &required_child(&signed_info, "CanonicalizationMethod")?,
        "canonicalization",
        profile.canonicalization,
    )?;
    expect_algorithm(
        &required_child(&signed_info, "SignatureMethod")?,
        "signature method",
        profile.signature_method,
    )?;

    let references: Vec<Node> = signed_info
        .get_child_elements()
        .into_iter()
        .filter(|el| is_element(el, DS_NS, "Reference"))
        .collect();
    let [reference] = references.as_slice() else {
        return Err(SignatureVerificationError::MalformedSignature(format!(
            "expected one Reference, found {}",
            references.len()
        )));
    };
    let transforms: Vec<String> = required_child(reference, "Transforms")?
        .get_child_elements()
        .into_iter()
        .filter(|el| is_element(el, DS_NS, "Transform"))
        .map(|el| el.get_attribute_no_ns("Algorithm").unwrap_or_default())
        .collect();
    if !transforms.iter().map(String::as_str).eq(profile.transforms) {
        return Err(SignatureVerificationError::UnsupportedAlgorithm {
            what: "transform chain",
            uri: transforms.join(" "),
        });
    }
    expect_algorithm(
        &required_child(reference, "DigestMethod")?,
        "digest method",
        profile.digest_method,
    )?;

    let uri = reference.get_attribute_no_ns("URI").unwrap_or_default();
    let id = uri
        .strip_prefix('#')
        .filter(|id| !id.is_empty())
        .ok_or_else(|| {
            SignatureVerificationError::MalformedSignature(format!("unsupported reference URI {uri:?}"))
        })?
        .to_string();
    let canonical = document
        .canonicalize_enveloped(&id, is_signature)
        .map_err(SignatureVerificationError::Reference)?;
    let expected_digest = base64_text(&required_child(reference, "DigestValue")?, "DigestValue")?;
    if Sha256::digest(canonical.as_bytes()).as_slice() != expected_digest.as_slice() {
        return Err(SignatureVerificationError::DigestMismatch);
    }

    let certificate_der = base64_text(
        &child_element(signature, DS_NS, "KeyInfo")
            .and_then(|info| child_element(&info, DS_NS, "X509Data"))
            .and_then(|data| child_element(&data, DS_NS, "X509Certificate"))
            .ok_or_else(|| {
                SignatureVerificationError::MalformedSignature("missing X509Certificate".into())
            })?,
        "X509Certificate",
    )?;
    let certificate = Certificate::from_der(&certificate_der)
        .map_err(|e| SignatureVerificationError::Certificate(e.to_string()))?;

    let signed_info_c14n = document
        .canonicalize_element(&signed_info)
        .map_err(SignatureVerificationError::Document)?;
    let signature_value = base64_text(&required_child(signature, "SignatureValue")?, "SignatureValue")?;
    verify_bytes(&certificate, signed_info_c14n.as_bytes(), &signature_value)?;

    credentials::ensure_certificate_valid_at(&certificate, at)
        .map_err(SignatureVerificationError::SignerValidity)?;
    if !trust.accepts(&certificate, &certificate_der) {
        return Err(SignatureVerificationError::UntrustedCertificate {
            subject: certificate.tbs_certificate.subject.to_string(),
        });
    }

    Ok(VerifiedSignature {
        reference: SignableReference::new(id),
        certificate,
    })
}

/// The element a verified signature covers, which must be the
/// `{NFSE_NS}local_name` child of the document root. Anything else is a
/// signature moved away from the data it vouches for.
pub(crate) fn signed_root_child(
    document: &XmlDocument,
    verified: &VerifiedSignature,
    local_name: &str,
) -> Result<Node, SignatureVerificationError> {
    let element = document
        .element_by_id(verified.reference().id())
        .map_err(SignatureVerificationError::Reference)?;
    let at_root = element.get_parent().as_ref() == Some(document.root());
    if !at_root || !is_element(&element, NFSE_NS, local_name) {
        return Err(SignatureVerificationError::UnexpectedReference {
            expected: format!("{local_name} under the document root"),
            found: format!("{} {}", element.get_name(), verified.reference()),
        });
    }
    Ok(element)
}

fn is_signature(node: &Node) -> bool {
    is_element(node, DS_NS, "Signature")
}

fn required_child(parent: &Node, name: &'static str) -> Result<Node, SignatureVerificationError> {
    child_element(parent, DS_NS, name)
        .ok_or_else(|| SignatureVerificationError::MalformedSignature(format!("missing {name}")))
}

fn expect_algorithm(
    element: &Node,
    what: &'static str,
    expected: &str,
) -> Result<(), SignatureVerificationError> {
    match element.get_attribute_no_ns("Algorithm") {
        Some(uri) if uri == expected => Ok(()),
        other => Err(SignatureVerificationError::UnsupportedAlgorithm {
            what,
            uri: other.unwrap_or_default(),
        }),
    }
}

fn base64_text(element: &Node, name: &str) -> Result<Vec<u8>, SignatureVerificationError> {
    let text: String = element
        .get_content()
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    if text.is_empty() {
        return Err(SignatureVerificationError::MalformedSignature(format!(
            "empty {name}"
        )));
    }
    Base64::decode_vec(&text)
        .map_err(|e| SignatureVerificationError::MalformedSignature(format!("{name}: {e}")))
}
