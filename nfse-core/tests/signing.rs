mod common;

use base64ct::{Base64, Encoding};
use common::{bundle, provider_credential, read_fixture, sample_dps};
use nfse_core::c14n::{XmlDocument, child_element, is_element};
use nfse_core::dps::Dps;
use nfse_core::sign::{
    SignatureEngine, SignatureVerificationError, TrustStore, verify_bytes, verify_document,
};

const DS_NS: &str = "http://www.w3.org/2000/09/xmldsig#";

#[test]
fn golden_signature_is_reproduced() {
    let credential = provider_credential();
    let message = read_fixture("credentials/golden-message.txt");
    let expected = Base64::decode_vec(read_fixture("credentials/golden-signature.b64").trim())
        .expect("golden signature");

    let signature = credential.sign_bytes(message.as_bytes());
    assert_eq!(signature, expected);
    verify_bytes(credential.certificate(), message.as_bytes(), &signature).expect("verifies");
}

#[test]
fn single_byte_change_breaks_signature() {
    let credential = provider_credential();
    let message = read_fixture("credentials/golden-message.txt");
    let signature = credential.sign_bytes(message.as_bytes());

    let mut tampered = message.into_bytes();
    tampered[0] ^= 0x01;
    assert!(matches!(
        verify_bytes(credential.certificate(), &tampered, &signature),
        Err(SignatureVerificationError::InvalidSignatureValue)
    ));
}

#[test]
fn signed_dps_verifies_and_leaves_input_untouched() {
    let credential = provider_credential();
    let document = sample_dps().to_canonical_document().expect("build");
    let before = document.clone();

    let signed = SignatureEngine::new(&credential).sign(&document).expect("sign");
    assert_eq!(document, before);
    assert_eq!(signed.reference(), document.reference());

    let verified = verify_document(signed.xml(), &TrustStore::any()).expect("verify");
    assert_eq!(verified.reference(), document.reference());
    assert!(verified.signer().contains("EMPRESA TESTE LTDA"));
}

#[test]
fn signature_is_last_child_of_dps() {
    let credential = provider_credential();
    let document = sample_dps().to_canonical_document().expect("build");
    let signed = SignatureEngine::new(&credential).sign(&document).expect("sign");

    let tree = XmlDocument::parse(signed.xml()).expect("parse");
    let last = tree.root().get_child_elements().pop().expect("children");
    assert!(is_element(&last, DS_NS, "Signature"));
    let reference = child_element(&last, DS_NS, "SignedInfo")
        .and_then(|info| child_element(&info, DS_NS, "Reference"))
        .and_then(|reference| reference.get_attribute_no_ns("URI"))
        .expect("reference URI");
    assert_eq!(reference, document.reference().uri());
}

#[test]
fn signing_is_deterministic_for_the_same_declaration() {
    let credential = provider_credential();
    let first = SignatureEngine::new(&credential)
        .sign(&sample_dps().to_canonical_document().expect("build"))
        .expect("sign");
    let second = SignatureEngine::new(&credential)
        .sign(&sample_dps().to_canonical_document().expect("build"))
        .expect("sign");
    assert_eq!(first.xml(), second.xml());
}

#[test]
fn edited_service_amount_fails_digest() {
    let credential = provider_credential();
    let signed = SignatureEngine::new(&credential)
        .sign(&sample_dps().to_canonical_document().expect("build"))
        .expect("sign");

    let tampered = signed.xml().replace("<vServ>1000.00</vServ>", "<vServ>10.00</vServ>");
    assert_ne!(tampered, signed.xml());
    assert!(matches!(
        verify_document(&tampered, &TrustStore::any()),
        Err(SignatureVerificationError::DigestMismatch)
    ));
}

#[test]
fn pinned_trust_store_rejects_other_signers() {
    let credential = provider_credential();
    let signed = SignatureEngine::new(&credential)
        .sign(&sample_dps().to_canonical_document().expect("build"))
        .expect("sign");

    let pinned = TrustStore::from_pem_pinned(read_fixture("credentials/authority-cert.pem").as_bytes())
        .expect("pinned store");
    assert!(matches!(
        verify_document(signed.xml(), &pinned),
        Err(SignatureVerificationError::UntrustedCertificate { .. })
    ));

    let own = TrustStore::any()
        .with_pinned(credential.certificate())
        .expect("pin provider");
    verify_document(signed.xml(), &own).expect("own certificate is trusted");
}

#[test]
fn pkcs12_and_pem_credentials_sign_identically() {
    let from_p12 = nfse_core::credentials::CertificateBundle::from_pkcs12_file(
        &common::fixture_path("credentials/provider.p12"),
        "nfse-test",
    )
    .expect("load p12")
    .signing_credential()
    .expect("credential");
    let from_pem = bundle("provider").signing_credential().expect("credential");

    let message = b"same bytes, same key";
    assert_eq!(from_p12.sign_bytes(message), from_pem.sign_bytes(message));
    assert_eq!(from_p12.certificate_der(), from_pem.certificate_der());
}

#[test]
fn dps_fixture_deserializes_into_sample() {
    let dps: Dps = serde_json::from_str(&read_fixture("dps/sample-dps.json")).expect("parse fixture");
    assert_eq!(dps, sample_dps());
}
