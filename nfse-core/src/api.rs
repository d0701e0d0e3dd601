//! NFSe Nacional protocol client.
//!
//! Every call runs its own [`SubmissionState`] machine to completion. The
//! client holds no mutable state, so one instance can serve concurrent
//! calls.
pub mod response;
pub mod retry;
pub mod state;
pub mod transport;

pub use response::{
    Accepted, EventReceipt, IssuedNfse, ProtocolOutcome, Rejection, RejectionMessage,
    TransportFailure,
};
pub use state::SubmissionState;
pub use transport::{Endpoint, HttpTransport, Method, Transport, TransportError, WireRequest, WireResponse};

use crate::{
    NfseError,
    access_key::AccessKey,
    codec,
    config::Config,
    credentials::{SigningCredential, TlsIdentity},
    document::{SignableReference, SignedDocument},
    dps::{Dps, xml::DpsXml},
    event::{CANCELLATION_EVENT, CancelRequest},
    sign::{SignatureEngine, TrustStore},
};
use chrono::Utc;
use response::{
    Interpretation, StatusClass, classify_status, interpret_danfse, interpret_event,
    interpret_nfse, parse_rejection,
};
use retry::Backoff;
use state::StateMachine;
use std::sync::Arc;
use tracing::Instrument;

/// A signed and encoded DPS, ready to be sent.
///
/// Produced once per [`NfseClient::issue`] call; every retry resends
/// [`request`](Self::request) unchanged.
#[derive(Debug, Clone)]
pub struct PreparedSubmission {
    dps_id: String,
    signed: SignedDocument,
    envelope: String,
    request: WireRequest,
}

impl PreparedSubmission {
    /// Caller-assigned id of the declaration.
    pub fn dps_id(&self) -> &str {
        &self.dps_id
    }

    pub fn reference(&self) -> &SignableReference {
        self.signed.reference()
    }

    pub fn signed_xml(&self) -> &str {
        self.signed.xml()
    }

    /// gzip + base64 of the signed document.
    pub fn envelope(&self) -> &str {
        &self.envelope
    }

    pub fn request(&self) -> &WireRequest {
        &self.request
    }
}

enum Exchange<T> {
    Accepted(T),
    Rejected(Rejection),
    Failed(TransportFailure),
}

/// Client for the national NFSe API.
///
/// # Examples
/// ```rust,no_run
/// use nfse_core::api::NfseClient;
/// use nfse_core::config::Config;
/// use nfse_core::credentials::CertificateBundle;
/// use nfse_core::sign::TrustStore;
///
/// # async fn demo(dps: nfse_core::dps::Dps) -> Result<(), Box<dyn std::error::Error>> {
/// let bundle = CertificateBundle::from_pkcs12_file("empresa.p12".as_ref(), "senha")?;
/// let trust = TrustStore::from_pem_anchors(&std::fs::read("icp-brasil.pem")?)?;
/// let client = NfseClient::new(
///     Config::from_env()?,
///     bundle.signing_credential()?,
///     &bundle.tls_identity()?,
///     trust,
/// )?;
/// let nfse = client.issue(&dps).await?.into_result()?;
/// # let _ = nfse;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct NfseClient {
    config: Config,
    signing: SigningCredential,
    transport: Arc<dyn Transport>,
    trust: TrustStore,
}

impl std::fmt::Debug for NfseClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NfseClient")
            .field("config", &self.config)
            .field("signing", &self.signing)
            .field("trust", &self.trust)
            .finish_non_exhaustive()
    }
}

// Public API
impl NfseClient {
    /// Build a client that talks HTTPS with mutual TLS.
    ///
    /// `trust` decides which certificates may sign the documents the
    /// authority returns.
    ///
    /// # Errors
    /// Returns [`NfseError::Credential`] if the TLS identity is expired or
    /// cannot be loaded.
    pub fn new(
        config: Config,
        signing: SigningCredential,
        identity: &TlsIdentity,
        trust: TrustStore,
    ) -> Result<Self, NfseError> {
        let transport = HttpTransport::new(&config, identity)?;
        Ok(Self::with_transport(config, signing, trust, Arc::new(transport)))
    }

    /// Build a client over any [`Transport`].
    pub fn with_transport(
        config: Config,
        signing: SigningCredential,
        trust: TrustStore,
        transport: Arc<dyn Transport>,
    ) -> Self {
        if trust.is_unrestricted() {
            tracing::warn!(
                "unrestricted trust store: any certificate will be accepted as the signer of authority documents"
            );
        }
        Self {
            config,
            signing,
            transport,
            trust,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run the build, sign and encode stages without touching the network.
    pub fn prepare_issue(&self, dps: &Dps) -> Result<PreparedSubmission, NfseError> {
        let mut machine = StateMachine::new("prepare_issue");
        let prepared = self.prepare(&mut machine, dps);
        if prepared.is_err() {
            machine.fail();
        }
        prepared
    }

    /// Issue an NFSe for `dps`.
    ///
    /// # Errors
    /// Pre-network failures ([`NfseError::Build`], [`NfseError::Credential`],
    /// [`NfseError::ClientState`]) and invalid authority signatures
    /// ([`NfseError::SignatureVerification`]). Rejections, exhausted
    /// retries and unreadable answers are reported as outcomes.
    pub async fn issue(&self, dps: &Dps) -> Result<ProtocolOutcome, NfseError> {
        let span = tracing::info_span!("issue", dps_id = %dps.id);
        async {
            let mut machine = StateMachine::new("issue");
            let prepared = match self.prepare(&mut machine, dps) {
                Ok(prepared) => prepared,
                Err(e) => {
                    machine.fail();
                    return Err(e);
                }
            };
            machine.advance(SubmissionState::Submitting)?;

            let trust = &self.trust;
            let exchange = self
                .exchange(&mut machine, prepared.request(), |response| {
                    interpret_nfse(response.body(), None, trust).map_err(NfseError::from)
                })
                .await?;
            let outcome = match exchange {
                Exchange::Accepted(nfse) => {
                    tracing::info!(access_key = %nfse.access_key(), number = nfse.number(), "NFSe issued");
                    ProtocolOutcome::Issued(nfse)
                }
                Exchange::Rejected(rejection) => ProtocolOutcome::Rejected(rejection),
                Exchange::Failed(failure) => ProtocolOutcome::TransportFailure(failure),
            };
            Ok(outcome)
        }
        .instrument(span)
        .await
    }

    /// Fetch an issued NFSe by access key. Unknown keys come back as
    /// [`ProtocolOutcome::Rejected`].
    pub async fn query(&self, access_key: &AccessKey) -> Result<ProtocolOutcome, NfseError> {
        let span = tracing::info_span!("query", access_key = %access_key);
        async {
            let mut machine = StateMachine::new("query");
            pass_document_stages(&mut machine)?;
            let request = WireRequest::get(Endpoint::Sefin, format!("nfse/{access_key}"));

            let trust = &self.trust;
            let exchange = self
                .exchange(&mut machine, &request, |response| {
                    interpret_nfse(response.body(), Some(access_key), trust).map_err(NfseError::from)
                })
                .await?;
            Ok(match exchange {
                Exchange::Accepted(nfse) => {
                    tracing::info!(number = nfse.number(), "NFSe retrieved");
                    ProtocolOutcome::Issued(nfse)
                }
                Exchange::Rejected(rejection) => ProtocolOutcome::Rejected(rejection),
                Exchange::Failed(failure) => ProtocolOutcome::TransportFailure(failure),
            })
        }
        .instrument(span)
        .await
    }

    /// Register a cancellation event for an issued NFSe.
    pub async fn cancel(&self, request: &CancelRequest) -> Result<ProtocolOutcome, NfseError> {
        let access_key = request.access_key();
        let span = tracing::info_span!("cancel", access_key = %access_key);
        async {
            let mut machine = StateMachine::new("cancel");
            let wire = match self.prepare_cancel(&mut machine, request) {
                Ok(wire) => wire,
                Err(e) => {
                    machine.fail();
                    return Err(e);
                }
            };
            machine.advance(SubmissionState::Submitting)?;

            let trust = &self.trust;
            let exchange = self
                .exchange(&mut machine, &wire, |response| {
                    interpret_event(response.body(), access_key, trust).map_err(NfseError::from)
                })
                .await?;
            Ok(match exchange {
                Exchange::Accepted(receipt) => {
                    tracing::info!(protocol = receipt.protocol(), "cancellation registered");
                    ProtocolOutcome::EventRegistered(receipt)
                }
                Exchange::Rejected(rejection) => ProtocolOutcome::Rejected(rejection),
                Exchange::Failed(failure) => ProtocolOutcome::TransportFailure(failure),
            })
        }
        .instrument(span)
        .await
    }

    /// Download the DANFSe (PDF rendition) of an issued NFSe.
    ///
    /// # Errors
    /// [`NfseError::BusinessRejection`] for 4xx answers and
    /// [`NfseError::Transport`] once retries are exhausted or when a success
    /// status carries something other than a PDF.
    pub async fn download_danfse(&self, access_key: &AccessKey) -> Result<Vec<u8>, NfseError> {
        let span = tracing::info_span!("download_danfse", access_key = %access_key);
        async {
            let mut machine = StateMachine::new("download_danfse");
            pass_document_stages(&mut machine)?;
            let request = WireRequest::get(Endpoint::Adn, format!("danfse/{access_key}"));
            match self
                .exchange(&mut machine, &request, |response| {
                    Ok(interpret_danfse(response.body()))
                })
                .await?
            {
                Exchange::Accepted(pdf) => {
                    tracing::info!(bytes = pdf.len(), "DANFSe downloaded");
                    Ok(pdf)
                }
                Exchange::Rejected(rejection) => Err(NfseError::BusinessRejection(rejection)),
                Exchange::Failed(failure) => Err(NfseError::Transport(failure)),
            }
        }
        .instrument(span)
        .await
    }
}

// Internal helpers
impl NfseClient {
    fn prepare(
        &self,
        machine: &mut StateMachine,
        dps: &Dps,
    ) -> Result<PreparedSubmission, NfseError> {
        if dps.environment != self.config.env() {
            return Err(NfseError::ClientState(format!(
                "DPS targets {} but the client is configured for {}",
                dps.environment,
                self.config.env()
            )));
        }

        machine.advance(SubmissionState::Building)?;
        let document = DpsXml::new(dps)
            .with_application_version(self.config.application_version())
            .build()?;

        machine.advance(SubmissionState::Signing)?;
        self.signing.ensure_valid_at(Utc::now())?;
        let signed = SignatureEngine::new(&self.signing).sign(&document)?;

        machine.advance(SubmissionState::Encoding)?;
        let envelope = codec::encode(signed.xml())?;
        let request = WireRequest::post_json(
            Endpoint::Sefin,
            "nfse",
            &serde_json::json!({ "dpsXmlGZipB64": envelope }),
        )
        .map_err(|e| NfseError::ClientState(format!("failed to serialize request: {e}")))?;

        tracing::debug!(reference = %signed.reference(), bytes = envelope.len(), "DPS prepared");
        Ok(PreparedSubmission {
            dps_id: dps.id.clone(),
            signed,
            envelope,
            request,
        })
    }

    fn prepare_cancel(
        &self,
        machine: &mut StateMachine,
        request: &CancelRequest,
    ) -> Result<WireRequest, NfseError> {
        machine.advance(SubmissionState::Building)?;
        let document = request
            .to_canonical_document(self.config.env(), self.config.application_version())?;

        machine.advance(SubmissionState::Signing)?;
        self.signing.ensure_valid_at(Utc::now())?;
        let signed = SignatureEngine::new(&self.signing).sign(&document)?;

        machine.advance(SubmissionState::Encoding)?;
        let envelope = codec::encode(signed.xml())?;
        let access_key = request.access_key().as_str();
        WireRequest::post_json(
            Endpoint::Sefin,
            format!("nfse/{access_key}/eventos"),
            &serde_json::json!({
                "pedidoRegistroEventoXmlGZipB64": envelope,
                "tpEvento": CANCELLATION_EVENT,
                "chNFSe": access_key,
                "xMotivo": request.reason(),
            }),
        )
        .map_err(|e| NfseError::ClientState(format!("failed to serialize request: {e}")))
    }

    /// Send `request` until it is accepted, rejected, answered with an
    /// unreadable body, or the retry budget is spent. `machine` must be in
    /// `Submitting`.
    async fn exchange<T>(
        &self,
        machine: &mut StateMachine,
        request: &WireRequest,
        interpret: impl Fn(&WireResponse) -> Result<Interpretation<T>, NfseError>,
    ) -> Result<Exchange<T>, NfseError> {
        let policy = self.config.retry_policy();
        let mut backoff = Backoff::new(policy);
        loop {
            tracing::debug!(attempt = backoff.attempts() + 1, path = request.path(), "sending request");
            let sent = tokio::time::timeout(policy.attempt_timeout(), self.transport.send(request)).await;
            machine.advance(SubmissionState::AwaitingResponse)?;

            let (status, cause) = match sent {
                Err(_) => (
                    None,
                    format!("no response within {:?}", policy.attempt_timeout()),
                ),
                Ok(Err(e)) => (None, e.to_string()),
                Ok(Ok(response)) => {
                    let status = response.status();
                    match classify_status(status) {
                        StatusClass::Success => match interpret(&response) {
                            Ok(Interpretation::Accepted(value)) => {
                                machine.advance(SubmissionState::Completed)?;
                                return Ok(Exchange::Accepted(value));
                            }
                            Ok(Interpretation::Garbage(cause)) => {
                                tracing::warn!(status, "unreadable response, not resending: {cause}");
                                machine.fail();
                                return Ok(Exchange::Failed(TransportFailure::unreadable(
                                    backoff.attempts() + 1,
                                    status,
                                    cause,
                                )));
                            }
                            Err(e) => {
                                machine.fail();
                                return Err(e);
                            }
                        },
                        StatusClass::Rejected => {
                            let rejection = parse_rejection(status, response.body());
                            tracing::info!(status, codes = ?rejection.codes(), "request rejected");
                            machine.fail();
                            return Ok(Exchange::Rejected(rejection));
                        }
                        StatusClass::Retryable => {
                            let mut text = response.body_text();
                            text.truncate(text.char_indices().nth(200).map_or(text.len(), |(i, _)| i));
                            (Some(status), format!("HTTP {status}: {}", text.trim()))
                        }
                    }
                }
            };

            if !backoff.wait(&cause).await {
                machine.fail();
                return Ok(Exchange::Failed(TransportFailure::exhausted(
                    backoff.attempts(),
                    status,
                    cause,
                )));
            }
            machine.advance(SubmissionState::Submitting)?;
        }
    }
}

/// Read-only calls carry no document, so their build, sign and encode
/// stages complete without work.
fn pass_document_stages(machine: &mut StateMachine) -> Result<(), NfseError> {
    for stage in [
        SubmissionState::Building,
        SubmissionState::Signing,
        SubmissionState::Encoding,
        SubmissionState::Submitting,
    ] {
        machine.advance(stage)?;
    }
    Ok(())
}
