//! Inclusive Canonical XML 1.0, without comments, on libxml2.
//!
//! Documents are parsed strictly (no recovery, no network, no DTD) and then
//! canonicalized either whole or for the subtree that carries a given `Id`
//! attribute, which is what an XML-DSig reference digests.
use libxml::error::XmlErrorLevel;
use libxml::parser::{Parser, ParserOptions};
use libxml::tree::c14n::{CanonicalizationMode, CanonicalizationOptions};
use libxml::tree::{Document, Node, NodeType, SaveOptions};
use libxml::xpath;
use thiserror::Error;

/// Algorithm URI of the canonicalization implemented here.
pub const C14N_ALGORITHM: &str = "http://www.w3.org/TR/2001/REC-xml-c14n-20010315";

/// Errors raised while parsing or canonicalizing XML.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CanonicalizationError {
    #[error("XML parse error: {0}")]
    Parse(String),
    #[error("unsupported XML construct: {0}")]
    UnsupportedConstruct(String),
    #[error("no element carries Id=\"{0}\"")]
    ReferenceNotFound(String),
    #[error("{count} elements carry Id=\"{id}\"")]
    AmbiguousReference { id: String, count: usize },
    #[error("canonicalization failed: {0}")]
    Canonicalize(String),
    #[error("XML tree update failed: {0}")]
    Tree(String),
}

type Result<T> = std::result::Result<T, CanonicalizationError>;

/// A parsed, well-formed XML document with exactly one root element.
pub struct XmlDocument {
    root: Node,
    document: Document,
}

/// Canonicalize a whole document.
pub fn canonicalize(xml: &str) -> Result<String> {
    XmlDocument::parse(xml)?.canonicalize()
}

impl XmlDocument {
    /// Parse `xml`, rejecting anything libxml2 reports as an error and any
    /// document type declaration.
    pub fn parse(xml: &str) -> Result<Self> {
        let options = ParserOptions {
            recover: false,
            no_net: true,
            no_def_dtd: true,
            ..ParserOptions::default()
        };
        let (document, diagnostics) = Parser::default()
            .parse_string_with_diagnostics(xml, options)
            .map_err(|failure| CanonicalizationError::Parse(failure.to_string()))?;
        if let Some(error) = diagnostics
            .iter()
            .find(|d| matches!(d.level, XmlErrorLevel::Error | XmlErrorLevel::Fatal))
        {
            let message = error.message.as_deref().unwrap_or("parse error").trim_end();
            return Err(CanonicalizationError::Parse(message.to_string()));
        }
        if document
            .as_node()
            .get_child_nodes()
            .iter()
            .any(|node| matches!(node.get_type(), Some(NodeType::DTDNode | NodeType::DocumentTypeNode)))
        {
            return Err(CanonicalizationError::UnsupportedConstruct(
                "document type declaration".into(),
            ));
        }
        let root = document
            .get_root_element()
            .ok_or_else(|| CanonicalizationError::Parse("document has no root element".into()))?;
        Ok(Self { root, document })
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    pub(crate) fn document(&self) -> &Document {
        &self.document
    }

    /// Canonical form of the whole document.
    pub fn canonicalize(&self) -> Result<String> {
        self.document
            .canonicalize(options(), None)
            .map_err(|_| CanonicalizationError::Canonicalize("document".into()))
    }

    /// The single element whose `Id` attribute equals `id`.
    pub fn element_by_id(&self, id: &str) -> Result<Node> {
        let mut matches = elements_by_id(&self.document, id)?;
        match matches.len() {
            0 => Err(CanonicalizationError::ReferenceNotFound(id.to_string())),
            1 => Ok(matches.remove(0)),
            count => Err(CanonicalizationError::AmbiguousReference {
                id: id.to_string(),
                count,
            }),
        }
    }

    /// Canonical form of the element carrying `Id="{id}"`.
    pub fn canonicalize_reference(&self, id: &str) -> Result<String> {
        let target = self.element_by_id(id)?;
        self.canonicalize_element(&target)
    }

    /// Canonical form of one element of this document, rendering the
    /// namespaces and `xml:` attributes it inherits.
    pub fn canonicalize_element(&self, element: &Node) -> Result<String> {
        let mut element = element.clone();
        element
            .canonicalize(options())
            .map_err(|_| CanonicalizationError::Canonicalize(element.get_name()))
    }

    /// Canonical form of the element carrying `Id="{id}"`, computed on a
    /// copy of the document from which every root child matching `envelope`
    /// has been removed.
    pub fn canonicalize_enveloped(&self, id: &str, envelope: impl Fn(&Node) -> bool) -> Result<String> {
        let copy = self
            .document
            .dup()
            .map_err(|_| CanonicalizationError::Tree("failed to duplicate document".into()))?;
        let root = copy
            .get_root_element()
            .ok_or_else(|| CanonicalizationError::Tree("copy has no root element".into()))?;
        for node in root.get_child_elements() {
            if envelope(&node) {
                node.free_subtree();
            }
        }

        let mut matches = elements_by_id(&copy, id)?;
        let mut target = match matches.len() {
            0 => return Err(CanonicalizationError::ReferenceNotFound(id.to_string())),
            1 => matches.remove(0),
            count => {
                return Err(CanonicalizationError::AmbiguousReference {
                    id: id.to_string(),
                    count,
                });
            }
        };
        target
            .canonicalize(options())
            .map_err(|_| CanonicalizationError::Canonicalize(target.get_name()))
    }

    /// Append `child` as the last child of the root element.
    pub(crate) fn append_to_root(&mut self, child: &mut Node) -> Result<()> {
        self.root.add_child(child).map_err(CanonicalizationError::Tree)
    }

    /// Serialize the (possibly updated) tree.
    pub fn to_xml(&self) -> String {
        self.document
            .to_string_with_options(SaveOptions::default())
            .trim_end()
            .to_string()
    }
}

impl std::fmt::Debug for XmlDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XmlDocument")
            .field("root", &self.root.get_name())
            .finish()
    }
}

/// True when `node` is the element `{namespace}local_name`.
pub fn is_element(node: &Node, namespace: &str, local_name: &str) -> bool {
    node.is_element_node()
        && node.get_name() == local_name
        && node.get_namespace().map(|ns| ns.get_href()).as_deref() == Some(namespace)
}

/// First child element `{namespace}local_name` of `parent`.
pub fn child_element(parent: &Node, namespace: &str, local_name: &str) -> Option<Node> {
    parent
        .get_child_elements()
        .into_iter()
        .find(|child| is_element(child, namespace, local_name))
}

fn elements_by_id(document: &Document, id: &str) -> Result<Vec<Node>> {
    let ctx = xpath::Context::new(document)
        .map_err(|_| CanonicalizationError::Tree("XPath context".into()))?;
    let nodes = ctx
        .evaluate("//*[@Id]")
        .map_err(|_| CanonicalizationError::Tree("XPath evaluation".into()))?
        .get_nodes_as_vec();
    Ok(nodes
        .into_iter()
        .filter(|node| node.get_attribute_no_ns("Id").as_deref() == Some(id))
        .collect())
}

fn options() -> CanonicalizationOptions {
    CanonicalizationOptions {
        mode: CanonicalizationMode::Canonical1_0,
        inclusive_ns_prefixes: vec![],
        with_comments: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c14n(xml: &str) -> String {
        canonicalize(xml).expect("canonicalize")
    }

    #[test]
    fn empty_elements_and_attribute_order() {
        let input = r#"<doc><e1   /><e2   ></e2><e3   name="elem3"   id="elem3"   /></doc>"#;
        assert_eq!(
            c14n(input),
            r#"<doc><e1></e1><e2></e2><e3 id="elem3" name="elem3"></e3></doc>"#
        );
    }

    #[test]
    fn drops_declaration_and_comments() {
        let input = "<?xml version=\"1.0\"?>\n<!-- head --><a><!--x-->t</a>";
        assert_eq!(c14n(input), "<a>t</a>");
    }

    #[test]
    fn escapes_text_and_attributes() {
        let input = "<a t=\"1&#9;2&#10;3 &lt;&amp;&quot;\">&lt;b&gt; &amp; &#13; \"q\" 'a'</a>";
        assert_eq!(
            c14n(input),
            "<a t=\"1&#x9;2&#xA;3 &lt;&amp;&quot;\">&lt;b&gt; &amp; &#xD; \"q\" 'a'</a>"
        );
    }

    #[test]
    fn cdata_becomes_escaped_text() {
        assert_eq!(c14n("<a><![CDATA[<x> & y]]></a>"), "<a>&lt;x&gt; &amp; y</a>");
    }

    #[test]
    fn subtree_apex_renders_inherited_namespaces() {
        let doc = XmlDocument::parse(
            r#"<DPS xmlns="urn:n" xmlns:x="urn:x" versao="1.00"><infDPS Id="X"><a>1</a><x:b/></infDPS></DPS>"#,
        )
        .expect("parse");
        assert_eq!(
            doc.canonicalize_reference("X").expect("c14n"),
            r#"<infDPS xmlns="urn:n" xmlns:x="urn:x" Id="X"><a>1</a><x:b></x:b></infDPS>"#
        );
    }

    #[test]
    fn superfluous_redeclarations_are_dropped() {
        assert_eq!(
            c14n(r#"<a xmlns="urn:n"><b xmlns="urn:n"><c xmlns="urn:other"/></b></a>"#),
            r#"<a xmlns="urn:n"><b><c xmlns="urn:other"></c></b></a>"#
        );
    }

    #[test]
    fn canonicalization_is_idempotent() {
        let input = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\r\n<r xmlns=\"urn:n\" z=\"&#9;\" a=\"1\"><s Id=\"k\">x&#13;y<t/></s></r>";
        let once = c14n(input);
        assert_eq!(c14n(&once), once);

        let doc = XmlDocument::parse(input).expect("parse");
        let subtree = doc.canonicalize_reference("k").expect("subtree");
        assert_eq!(c14n(&subtree), subtree);
    }

    #[test]
    fn rejects_doctype_and_undeclared_entities() {
        let xxe = r#"<?xml version="1.0"?><!DOCTYPE a [<!ENTITY ext SYSTEM "file:///etc/passwd">]><a>&ext;</a>"#;
        assert!(matches!(
            XmlDocument::parse(xxe),
            Err(CanonicalizationError::UnsupportedConstruct(_))
        ));
        assert!(matches!(
            XmlDocument::parse("<a>&ext;</a>"),
            Err(CanonicalizationError::Parse(_))
        ));
    }

    #[test]
    fn rejects_malformed_input() {
        for input in ["<a><b></a>", "<a/><b/>", "<p:a/>", "<a>&#0;</a>", ""] {
            assert!(
                matches!(XmlDocument::parse(input), Err(CanonicalizationError::Parse(_))),
                "{input:?}"
            );
        }
    }

    #[test]
    fn reference_must_resolve_to_exactly_one_element() {
        let doc = XmlDocument::parse(r#"<r><a Id="1"/><b Id="1"/><c Id="2"/></r>"#).expect("parse");
        assert!(matches!(
            doc.canonicalize_reference("1"),
            Err(CanonicalizationError::AmbiguousReference { count: 2, .. })
        ));
        assert!(matches!(
            doc.canonicalize_reference("3"),
            Err(CanonicalizationError::ReferenceNotFound(id)) if id == "3"
        ));
        assert_eq!(doc.canonicalize_reference("2").expect("c14n"), r#"<c Id="2"></c>"#);
    }

    #[test]
    fn enveloped_form_leaves_out_the_envelope_and_keeps_the_source() {
        let xml = r#"<r Id="root"><data>1</data><Signature xmlns="urn:sig"><v>x</v></Signature></r>"#;
        let doc = XmlDocument::parse(xml).expect("parse");
        assert_eq!(
            doc.canonicalize_enveloped("root", |node| is_element(node, "urn:sig", "Signature"))
                .expect("c14n"),
            r#"<r Id="root"><data>1</data></r>"#
        );
        assert!(child_element(doc.root(), "urn:sig", "Signature").is_some());
        assert_eq!(
            doc.canonicalize_reference("root").expect("c14n"),
            r#"<r Id="root"><data>1</data><Signature xmlns="urn:sig"><v>x</v></Signature></r>"#
        );
    }

    #[test]
    fn appended_children_are_serialized_last() {
        let mut doc = XmlDocument::parse(r#"<r xmlns="urn:n"><a>1</a></r>"#).expect("parse");
        let mut child = Node::new("z", None, doc.document()).expect("node");
        doc.append_to_root(&mut child).expect("append");
        assert_eq!(doc.root().get_child_elements().last().map(Node::get_name), Some("z".into()));
        assert!(doc.to_xml().ends_with("<z/></r>"));
    }

    #[test]
    fn element_names_resolve_namespaces() {
        let doc = XmlDocument::parse(r#"<n:a xmlns:n="urn:n"><n:b/><b/></n:a>"#).expect("parse");
        assert!(is_element(doc.root(), "urn:n", "a"));
        assert!(child_element(doc.root(), "urn:n", "b").is_some());
        assert_eq!(doc.root().get_child_elements().len(), 2);
        assert!(!is_element(&doc.root().get_child_elements()[1], "urn:n", "b"));
    }
}
