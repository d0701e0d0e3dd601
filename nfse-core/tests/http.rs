mod common;

use common::{
    ACCESS_KEY, access_key, authority_credential, authority_trust, bundle, fast_config,
    nfse_response_body, sample_dps, signed_nfse_xml,
};
use httpmock::prelude::*;
use nfse_core::api::{NfseClient, ProtocolOutcome};
use nfse_core::config::Config;

fn try_start_server() -> Option<MockServer> {
    std::panic::catch_unwind(MockServer::start).ok()
}

fn http_client(config: Config) -> NfseClient {
    let provider = bundle("provider");
    NfseClient::new(
        config,
        provider.signing_credential().expect("signing credential"),
        &provider.tls_identity().expect("TLS identity"),
        authority_trust(),
    )
    .expect("client")
}

#[test]
fn issue_posts_envelope_to_sefin() {
    let server = match try_start_server() {
        Some(server) => server,
        None => return,
    };
    let client = http_client(fast_config(3).with_base_url(server.base_url()));
    let prepared = client.prepare_issue(&sample_dps()).expect("prepare");
    let nfse = signed_nfse_xml(ACCESS_KEY, prepared.signed_xml(), &authority_credential());

    let issue_mock = server.mock(|when, then| {
        when.method(POST)
            .path("/nfse")
            .header("content-type", "application/json")
            .body_contains("\"dpsXmlGZipB64\":\"H4sI");
        then.status(201)
            .header("content-type", "application/json")
            .body(nfse_response_body(ACCESS_KEY, &nfse));
    });

    let rt = tokio::runtime::Runtime::new().expect("runtime");
    rt.block_on(async {
        let outcome = client.issue(&sample_dps()).await.expect("issue");
        let ProtocolOutcome::Issued(issued) = outcome else {
            panic!("expected an issued NFSe, got {outcome:?}");
        };
        assert_eq!(issued.access_key().as_str(), ACCESS_KEY);
        assert_eq!(issued.number(), "126");
    });
    issue_mock.assert();
}

#[test]
fn server_errors_are_retried_over_http() {
    let server = match try_start_server() {
        Some(server) => server,
        None => return,
    };
    let client = http_client(fast_config(2).with_base_url(server.base_url()));

    let unavailable = server.mock(|when, then| {
        when.method(POST).path("/nfse");
        then.status(503).body("Service Unavailable");
    });

    let rt = tokio::runtime::Runtime::new().expect("runtime");
    rt.block_on(async {
        let outcome = client.issue(&sample_dps()).await.expect("issue");
        let ProtocolOutcome::TransportFailure(failure) = outcome else {
            panic!("expected a transport failure, got {outcome:?}");
        };
        assert_eq!(failure.attempts(), 2);
        assert_eq!(failure.status(), Some(503));
        assert!(failure.cause().contains("Service Unavailable"));
    });
    unavailable.assert_hits(2);
}

#[test]
fn rejection_is_parsed_from_error_list() {
    let server = match try_start_server() {
        Some(server) => server,
        None => return,
    };
    let client = http_client(fast_config(3).with_base_url(server.base_url()));

    let rejected = server.mock(|when, then| {
        when.method(GET).path(format!("/nfse/{ACCESS_KEY}"));
        then.status(404)
            .header("content-type", "application/json")
            .body(r#"{"erros":[{"Codigo":"E0404","Descricao":"NFS-e nao encontrada"}]}"#);
    });

    let rt = tokio::runtime::Runtime::new().expect("runtime");
    rt.block_on(async {
        let outcome = client.query(&access_key()).await.expect("query");
        let ProtocolOutcome::Rejected(rejection) = outcome else {
            panic!("expected a rejection, got {outcome:?}");
        };
        assert_eq!(rejection.status(), 404);
        assert_eq!(rejection.codes(), vec!["E0404"]);
    });
    rejected.assert_hits(1);
}

#[test]
fn danfse_is_fetched_from_adn() {
    let server = match try_start_server() {
        Some(server) => server,
        None => return,
    };
    let client = http_client(
        fast_config(3)
            .with_base_url(format!("{}/sefin", server.base_url()))
            .with_danfse_base_url(format!("{}/adn", server.base_url())),
    );

    let danfse = server.mock(|when, then| {
        when.method(GET).path(format!("/adn/danfse/{ACCESS_KEY}"));
        then.status(200)
            .header("content-type", "application/pdf")
            .body("%PDF-1.7\n%mock");
    });

    let rt = tokio::runtime::Runtime::new().expect("runtime");
    rt.block_on(async {
        let pdf = client.download_danfse(&access_key()).await.expect("danfse");
        assert_eq!(pdf, b"%PDF-1.7\n%mock");
    });
    danfse.assert();
}
