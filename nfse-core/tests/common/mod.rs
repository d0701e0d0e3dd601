use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use nfse_core::access_key::AccessKey;
use nfse_core::api::{Transport, TransportError, WireRequest, WireResponse};
use nfse_core::codec;
use nfse_core::config::{Config, EnvironmentType, RetryPolicy};
use nfse_core::credentials::{CertificateBundle, SigningCredential};
use nfse_core::document::{CanonicalDocument, SignableReference};
use nfse_core::dps::{
    Address, Amount, Dps, IssqnTaxation, IssqnWithholding, Provider, Recipient, Service,
    SimplesNacional, TaxRegime, Values,
};
use nfse_core::sign::{SignatureEngine, TrustStore};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

#[allow(dead_code)]
pub const ACCESS_KEY: &str = "35503082211222333000181000000000000126010000000017";

#[allow(dead_code)]
pub const NFSE_NS: &str = "http://www.sped.fazenda.gov.br/nfse";

#[allow(dead_code)]
pub fn fixture_path(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

#[allow(dead_code)]
pub fn read_fixture(name: &str) -> String {
    std::fs::read_to_string(fixture_path(name)).expect("read fixture")
}

#[allow(dead_code)]
pub fn bundle(prefix: &str) -> CertificateBundle {
    CertificateBundle::from_pem(
        &read_fixture(&format!("credentials/{prefix}-cert.pem")),
        &read_fixture(&format!("credentials/{prefix}-key.pem")),
    )
    .expect("load PEM bundle")
}

#[allow(dead_code)]
pub fn provider_credential() -> SigningCredential {
    bundle("provider").signing_credential().expect("provider credential")
}

#[allow(dead_code)]
pub fn authority_credential() -> SigningCredential {
    bundle("authority")
        .signing_credential()
        .expect("authority credential")
}

/// Trust store anchored on the test CA that issued the authority certificate.
#[allow(dead_code)]
pub fn authority_trust() -> TrustStore {
    TrustStore::from_pem_anchors(read_fixture("credentials/ca-cert.pem").as_bytes())
        .expect("CA anchors")
}

#[allow(dead_code)]
pub fn access_key() -> AccessKey {
    AccessKey::new(ACCESS_KEY).expect("access key")
}

/// Staging config with millisecond backoff so retry tests stay fast.
#[allow(dead_code)]
pub fn fast_config(max_attempts: u32) -> Config {
    Config::new(EnvironmentType::Staging).with_retry_policy(
        RetryPolicy::new(max_attempts, Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(5))
            .with_attempt_timeout(Duration::from_secs(5)),
    )
}

#[allow(dead_code)]
pub fn sample_dps() -> Dps {
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

/// An NFSe document for `key`, wrapping `dps_xml` and signed by `signer`.
#[allow(dead_code)]
pub fn signed_nfse_xml(key: &str, dps_xml: &str, signer: &SigningCredential) -> String {
    let dps = dps_xml
        .trim_start()
        .strip_prefix("<?xml")
        .and_then(|rest| rest.split_once("?>"))
        .map_or(dps_xml, |(_, body)| body);
    let xml = format!(
        "<NFSe xmlns=\"{NFSE_NS}\" versao=\"1.00\"><infNFSe Id=\"NFS{key}\">\
         <xLocEmi>Sao Paulo</xLocEmi><nNFSe>126</nNFSe>\
         <dhProc>2026-01-15T10:31:02-03:00</dhProc>\
         <emit><CNPJ>11222333000181</CNPJ><xNome>EMPRESA TESTE LTDA</xNome></emit>\
         <valores><vLiq>1000.00</vLiq></valores>{dps}</infNFSe></NFSe>"
    );
    let document = CanonicalDocument::from_xml(xml, SignableReference::new(format!("NFS{key}")))
        .expect("NFSe document");
    SignatureEngine::new(signer)
        .sign(&document)
        .expect("sign NFSe")
        .into_xml()
}

#[allow(dead_code)]
pub fn nfse_response_body(key: &str, nfse_xml: &str) -> String {
    serde_json::json!({
        "chaveAcesso": key,
        "nNFSe": "126",
        "nfseXmlGZipB64": codec::encode(nfse_xml).expect("encode NFSe"),
    })
    .to_string()
}

/// A signed cancellation event acknowledgement.
#[allow(dead_code)]
pub fn signed_event_xml(key: &str, signer: &SigningCredential) -> String {
    let id = format!("EVT{key}110111001");
    let xml = format!(
        "<evento xmlns=\"{NFSE_NS}\" versao=\"1.00\"><infEvento Id=\"{id}\">\
         <verAplic>SefinNacional_1.0</verAplic><ambGer>2</ambGer><nSeqEvento>1</nSeqEvento>\
         <dhProc>2026-01-16T09:00:00-03:00</dhProc><nDFe>77</nDFe>\
         <pedRegEvento versao=\"1.00\"><infPedReg Id=\"PRE{key}110111001\">\
         <chNFSe>{key}</chNFSe></infPedReg></pedRegEvento></infEvento></evento>"
    );
    let document =
        CanonicalDocument::from_xml(xml, SignableReference::new(id)).expect("event document");
    SignatureEngine::new(signer)
        .sign(&document)
        .expect("sign event")
        .into_xml()
}

/// Transport that replays a fixed script and records every request.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    responses: Mutex<VecDeque<Result<WireResponse, TransportError>>>,
    requests: Mutex<Vec<WireRequest>>,
}

#[allow(dead_code)]
impl ScriptedTransport {
    pub fn new(responses: impl IntoIterator<Item = Result<WireResponse, TransportError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn replying(responses: impl IntoIterator<Item = (u16, String)>) -> Self {
        Self::new(
            responses
                .into_iter()
                .map(|(status, body)| Ok(WireResponse::new(status, body))),
        )
    }

    pub fn requests(&self) -> Vec<WireRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().expect("requests lock").len()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: &WireRequest) -> Result<WireResponse, TransportError> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        self.responses
            .lock()
            .expect("responses lock")
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::Network("script exhausted".into())))
    }
}

/// Transport that never answers within any sensible attempt timeout.
#[derive(Debug, Default)]
pub struct StalledTransport {
    calls: Mutex<usize>,
}

#[allow(dead_code)]
impl StalledTransport {
    pub fn calls(&self) -> usize {
        *self.calls.lock().expect("calls lock")
    }
}

#[async_trait]
impl Transport for StalledTransport {
    async fn send(&self, _request: &WireRequest) -> Result<WireResponse, TransportError> {
        *self.calls.lock().expect("calls lock") += 1;
        tokio::time::sleep(Duration::from_secs(30)).await;
        Err(TransportError::Timeout)
    }
}
