//! XSD validation of DPS documents against the published national schemas.
//!
//! The schema files are not bundled; point [`Config::with_xsd_path`] (or
//! `NFSE_XSD_PATH`) at the `DPS_v1.00.xsd` entry point.
use std::path::Path;

use crate::config::Config;
use libxml::{
    error::StructuredError,
    parser::Parser,
    schemas::{SchemaParserContext, SchemaValidationContext},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum XmlValidationError {
    #[error("no XSD path configured")]
    SchemaNotConfigured,
    #[error("file not found: {0}")]
    FileNotFound(String),
    #[error("path is not valid UTF-8: {0}")]
    InvalidPath(String),
    #[error("failed to load schema: {}", .0.join("; "))]
    Schema(Vec<String>),
    #[error("failed to parse XML: {0}")]
    Parse(String),
    #[error("document does not conform to schema: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

fn format_validation_errors(errors: Vec<StructuredError>) -> Vec<String> {
    errors
        .into_iter()
        .map(|se| {
            se.message
                .as_deref()
                .map(|m| m.trim().to_string())
                .unwrap_or_else(|| format!("{se:?}"))
        })
        .collect()
}

fn build_validation_context(config: &Config) -> Result<SchemaValidationContext, XmlValidationError> {
    let xsd = config
        .xsd_path()
        .ok_or(XmlValidationError::SchemaNotConfigured)?;
    if !xsd.exists() {
        return Err(XmlValidationError::FileNotFound(xsd.display().to_string()));
    }
    let xsd_path = xsd
        .to_str()
        .ok_or_else(|| XmlValidationError::InvalidPath(xsd.display().to_string()))?;

    let mut parser_ctx = SchemaParserContext::from_file(xsd_path);
    SchemaValidationContext::from_parser(&mut parser_ctx)
        .map_err(|e| XmlValidationError::Schema(format_validation_errors(e)))
}

pub fn validate_xml_file(path: &Path, config: &Config) -> Result<(), XmlValidationError> {
    // libxml reports a missing file as an opaque I/O warning
    if !path.exists() {
        return Err(XmlValidationError::FileNotFound(path.display().to_string()));
    }
    let xml_path = path
        .to_str()
        .ok_or_else(|| XmlValidationError::InvalidPath(path.display().to_string()))?;

    let mut validation_ctx = build_validation_context(config)?;
    validation_ctx
        .validate_file(xml_path)
        .map_err(|e| XmlValidationError::Invalid(format_validation_errors(e)))
}

pub fn validate_xml_str(xml: &str, config: &Config) -> Result<(), XmlValidationError> {
    let mut validation_ctx = build_validation_context(config)?;
    let document = Parser::default()
        .parse_string(xml)
        .map_err(|e| XmlValidationError::Parse(format!("{e:?}")))?;

    validation_ctx
        .validate_document(&document)
        .map_err(|e| XmlValidationError::Invalid(format_validation_errors(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvironmentType;

    #[test]
    fn missing_schema_configuration_is_reported() {
        let config = Config::new(EnvironmentType::Staging);
        assert!(matches!(
            validate_xml_str("<DPS/>", &config),
            Err(XmlValidationError::SchemaNotConfigured)
        ));
    }

    #[test]
    fn missing_files_are_reported() {
        let config =
            Config::new(EnvironmentType::Staging).with_xsd_path("/nonexistent/DPS_v1.00.xsd");
        assert!(matches!(
            validate_xml_str("<DPS/>", &config),
            Err(XmlValidationError::FileNotFound(_))
        ));
        assert!(matches!(
            validate_xml_file(Path::new("/nonexistent/dps.xml"), &config),
            Err(XmlValidationError::FileNotFound(_))
        ));
    }

    #[test]
    fn validates_against_schema() {
        let dir = std::env::temp_dir().join(format!("nfse-xsd-{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("temp dir");
        let xsd = dir.join("mini.xsd");
        std::fs::write(
            &xsd,
            r#"<?xml version="1.0" encoding="UTF-8"?>
<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema"
           targetNamespace="http://www.sped.fazenda.gov.br/nfse"
           elementFormDefault="qualified">
  <xs:element name="DPS">
    <xs:complexType>
      <xs:sequence><xs:element name="tpAmb" type="xs:unsignedByte"/></xs:sequence>
    </xs:complexType>
  </xs:element>
</xs:schema>"#,
        )
        .expect("write xsd");
        let config = Config::new(EnvironmentType::Staging).with_xsd_path(&xsd);

        let ok = r#"<DPS xmlns="http://www.sped.fazenda.gov.br/nfse"><tpAmb>2</tpAmb></DPS>"#;
        assert!(validate_xml_str(ok, &config).is_ok());

        let bad = r#"<DPS xmlns="http://www.sped.fazenda.gov.br/nfse"><tpAmb>x</tpAmb></DPS>"#;
        assert!(matches!(
            validate_xml_str(bad, &config),
            Err(XmlValidationError::Invalid(errors)) if !errors.is_empty()
        ));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
