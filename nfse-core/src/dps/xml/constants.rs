pub(crate) const NFSE_NS: &str = "http://www.sped.fazenda.gov.br/nfse";
pub(crate) const DS_NS: &str = "http://www.w3.org/2000/09/xmldsig#";

/// Layout version carried in the `versao` attribute of DPS and events.
pub(crate) const LAYOUT_VERSION: &str = "1.00";

pub(crate) const XML_DECLARATION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;
