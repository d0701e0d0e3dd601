//! Unsigned and signed document values.
//!
//! Signing is a two-phase transform: a [`CanonicalDocument`] is never
//! modified; the signature block computed over it is assembled into a new
//! [`SignedDocument`].
use crate::c14n::{CanonicalizationError, XmlDocument};
use crate::sign::SignatureBlock;
use std::fmt;

/// Identifier of the element an enveloped signature covers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SignableReference(String);

impl SignableReference {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }

    /// Same-document URI used in `Reference/@URI`.
    pub fn uri(&self) -> String {
        format!("#{}", self.0)
    }
}

impl fmt::Display for SignableReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Deterministic, unsigned XML document plus the reference to be signed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalDocument {
    xml: String,
    reference: SignableReference,
}

impl CanonicalDocument {
    /// Wrap an XML document, checking that exactly one element carries the
    /// reference.
    pub fn from_xml(
        xml: impl Into<String>,
        reference: SignableReference,
    ) -> Result<Self, CanonicalizationError> {
        let xml = xml.into();
        XmlDocument::parse(&xml)?.element_by_id(reference.id())?;
        Ok(Self { xml, reference })
    }

    pub fn xml(&self) -> &str {
        &self.xml
    }

    pub fn reference(&self) -> &SignableReference {
        &self.reference
    }
}

/// A document carrying its enveloped signature as the last child of the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedDocument {
    xml: String,
    reference: SignableReference,
}

impl SignedDocument {
    /// Append the `<Signature>` element to the root of a fresh parse of
    /// `document`.
    pub(crate) fn assemble(
        document: &CanonicalDocument,
        block: &SignatureBlock,
    ) -> Result<Self, CanonicalizationError> {
        let mut tree = XmlDocument::parse(document.xml())?;
        block.append_to(&mut tree)?;
        Ok(Self {
            xml: tree.to_xml(),
            reference: document.reference().clone(),
        })
    }

    pub fn xml(&self) -> &str {
        &self.xml
    }

    pub fn reference(&self) -> &SignableReference {
        &self.reference
    }

    pub fn into_xml(self) -> String {
        self.xml
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_uri_is_fragment() {
        let reference = SignableReference::new("DPS123");
        assert_eq!(reference.uri(), "#DPS123");
        assert_eq!(reference.to_string(), "DPS123");
    }

    #[test]
    fn from_xml_requires_resolvable_reference() {
        let xml = r#"<r><a Id="x"/></r>"#;
        assert!(CanonicalDocument::from_xml(xml, SignableReference::new("x")).is_ok());
        assert!(matches!(
            CanonicalDocument::from_xml(xml, SignableReference::new("y")),
            Err(CanonicalizationError::ReferenceNotFound(_))
        ));
    }

    #[test]
    fn assemble_appends_signature_as_last_root_child() {
        use crate::c14n::{child_element, is_element};
        use crate::credentials::CertificateBundle;
        use crate::dps::xml::constants::DS_NS;
        use crate::sign::SignatureEngine;

        let fixture = |name: &str| {
            std::fs::read_to_string(format!(
                "{}/tests/fixtures/credentials/{name}",
                env!("CARGO_MANIFEST_DIR")
            ))
            .expect("fixture")
        };
        let credential = CertificateBundle::from_pem(&fixture("provider-cert.pem"), &fixture("provider-key.pem"))
            .expect("bundle")
            .signing_credential()
            .expect("credential");

        let source = "<?xml version=\"1.0\"?><r><a Id=\"x\">1</a><b>&lt;/r&gt;</b></r><!-- </r> -->";
        let doc = CanonicalDocument::from_xml(source, SignableReference::new("x")).expect("document");
        let block = SignatureEngine::new(&credential)
            .signature_block(&doc)
            .expect("block");
        let signed = SignedDocument::assemble(&doc, &block).expect("assemble");

        let tree = XmlDocument::parse(signed.xml()).expect("parse");
        let last = tree.root().get_child_elements().pop().expect("children");
        assert!(is_element(&last, DS_NS, "Signature"));
        assert!(child_element(&last, DS_NS, "SignedInfo").is_some());
        assert_eq!(tree.root().get_child_elements().len(), 3);
        assert!(signed.xml().contains("</Signature></r>"));
        assert!(signed.xml().ends_with("<!-- </r> -->"));
        assert_eq!(doc.xml(), source);
    }
}
