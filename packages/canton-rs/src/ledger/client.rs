//! gRPC client for the Canton participant.
//!
//! One long-lived channel shared by all callers; per-call deadlines on unary
//! requests; streams are cancelled by dropping them. The participant's
//! status codes are classified into the bridge error taxonomy by
//! `From<tonic::Status>`, and an unauthenticated response triggers one
//! token refresh before the call is failed.

use crate::error::{Error, ErrorKind, Result};
use crate::ledger::auth::{AuthConfig, TokenProvider};
use crate::ledger::proto::{
    command, AllocateExternalPartyRequest, AllocateExternalPartyResponse, Commands, CreateCommand,
    CreatedEvent, ExerciseCommand, GetActiveContractsRequest, GetActiveContractsResponse,
    GetLedgerEndRequest, GetLedgerEndResponse, GetUpdatesRequest, GetUpdatesResponse, Identifier,
    Record, SubmitAndWaitRequest, SubmitAndWaitResponse, Transaction, Value,
};
use k256::ecdsa::signature::hazmat::PrehashSigner;
use k256::ecdsa::{Signature, SigningKey};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tonic::client::Grpc;
use tonic::codec::{ProstCodec, Streaming};
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Identity};
use tonic::Request;

const SUBMIT_AND_WAIT: &str = "/ledgerapi.v1.CommandService/SubmitAndWait";
const GET_LEDGER_END: &str = "/ledgerapi.v1.StateService/GetLedgerEnd";
const GET_ACTIVE_CONTRACTS: &str = "/ledgerapi.v1.StateService/GetActiveContracts";
const GET_UPDATES: &str = "/ledgerapi.v1.UpdateService/GetUpdates";
const ALLOCATE_EXTERNAL_PARTY: &str = "/ledgerapi.v1.PartyManagementService/AllocateExternalParty";

/// TLS material for the participant connection.
#[derive(Debug, Clone, Default)]
pub struct TlsFiles {
    pub ca_cert: Option<String>,
    pub client_cert: Option<String>,
    pub client_key: Option<String>,
}

#[derive(Clone)]
pub struct LedgerConfig {
    pub rpc_url: String,
    pub synchronizer_id: String,
    pub application_id: String,
    pub auth: Option<AuthConfig>,
    pub tls: Option<TlsFiles>,
    /// Deadline applied to every unary call.
    pub call_timeout: Duration,
    /// Participant-side command deduplication window.
    pub dedup_duration: Duration,
    pub max_inbound_message_size: usize,
}

impl std::fmt::Debug for LedgerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerConfig")
            .field("rpc_url", &self.rpc_url)
            .field("synchronizer_id", &self.synchronizer_id)
            .field("application_id", &self.application_id)
            .field("auth", &self.auth.as_ref().map(|_| "<configured>"))
            .field("tls", &self.tls)
            .field("call_timeout", &self.call_timeout)
            .field("dedup_duration", &self.dedup_duration)
            .field("max_inbound_message_size", &self.max_inbound_message_size)
            .finish()
    }
}

pub struct LedgerClient {
    channel: Channel,
    pub(crate) auth: TokenProvider,
    config: LedgerConfig,
}

impl LedgerClient {
    /// Open the shared channel. Connection is lazy: the first call dials.
    pub fn connect(config: LedgerConfig) -> Result<Self> {
        let mut endpoint = Channel::from_shared(config.rpc_url.clone())
            .map_err(|e| Error::invalid_input(format!("invalid participant url: {e}")))?
            .connect_timeout(Duration::from_secs(10));

        if let Some(tls) = &config.tls {
            let mut tls_config = ClientTlsConfig::new();
            if let Some(ca) = &tls.ca_cert {
                let pem = std::fs::read(ca).map_err(|e| {
                    Error::invalid_input(format!("failed to read TLS CA {ca}: {e}"))
                })?;
                tls_config = tls_config.ca_certificate(Certificate::from_pem(pem));
            }
            if let (Some(cert), Some(key)) = (&tls.client_cert, &tls.client_key) {
                let cert_pem = std::fs::read(cert).map_err(|e| {
                    Error::invalid_input(format!("failed to read TLS cert {cert}: {e}"))
                })?;
                let key_pem = std::fs::read(key).map_err(|e| {
                    Error::invalid_input(format!("failed to read TLS key {key}: {e}"))
                })?;
                tls_config = tls_config.identity(Identity::from_pem(cert_pem, key_pem));
            }
            endpoint = endpoint
                .tls_config(tls_config)
                .map_err(|e| Error::invalid_input(format!("invalid TLS configuration: {e}")))?;
        }

        let channel = endpoint.connect_lazy();
        let auth = TokenProvider::new(config.auth.clone());
        tracing::info!(
            rpc_url = %config.rpc_url,
            synchronizer_id = %config.synchronizer_id,
            tls = config.tls.is_some(),
            "Ledger client initialized"
        );
        Ok(Self {
            channel,
            auth,
            config,
        })
    }

    pub fn application_id(&self) -> &str {
        &self.config.application_id
    }

    fn grpc(&self) -> Grpc<Channel> {
        Grpc::new(self.channel.clone())
            .max_decoding_message_size(self.config.max_inbound_message_size)
    }

    async fn authed_request<M>(&self, message: M, with_deadline: bool) -> Result<Request<M>> {
        let mut request = Request::new(message);
        if with_deadline {
            request.set_timeout(self.config.call_timeout);
        }
        if let Some(token) = self.auth.token().await? {
            let value = format!("Bearer {token}")
                .parse::<tonic::metadata::MetadataValue<tonic::metadata::Ascii>>()
                .map_err(|_| Error::unauthorized("bearer token contains invalid characters"))?;
            request.metadata_mut().insert("authorization", value);
        }
        Ok(request)
    }

    pub(crate) async fn unary<Req, Resp>(&self, path: &'static str, message: Req) -> Result<Resp>
    where
        Req: prost::Message + Clone + 'static,
        Resp: prost::Message + Default + 'static,
    {
        match self.try_unary(path, message.clone()).await {
            Err(e) if e.kind() == ErrorKind::Unauthorized => {
                self.auth.invalidate().await;
                self.try_unary(path, message).await
            }
            other => other,
        }
    }

    async fn try_unary<Req, Resp>(&self, path: &'static str, message: Req) -> Result<Resp>
    where
        Req: prost::Message + 'static,
        Resp: prost::Message + Default + 'static,
    {
        let mut grpc = self.grpc();
        grpc.ready().await.map_err(|e| {
            Error::with_source(ErrorKind::Dependency, "participant channel not ready", e)
        })?;
        let codec: ProstCodec<Req, Resp> = ProstCodec::default();
        let request = self.authed_request(message, true).await?;
        let response = grpc
            .unary(request, PathAndQuery::from_static(path), codec)
            .await?;
        Ok(response.into_inner())
    }

    async fn server_stream<Req, Resp>(
        &self,
        path: &'static str,
        message: Req,
    ) -> Result<Streaming<Resp>>
    where
        Req: prost::Message + Clone + 'static,
        Resp: prost::Message + Default + 'static,
    {
        match self.try_server_stream(path, message.clone()).await {
            Err(e) if e.kind() == ErrorKind::Unauthorized => {
                self.auth.invalidate().await;
                self.try_server_stream(path, message).await
            }
            other => other,
        }
    }

    async fn try_server_stream<Req, Resp>(
        &self,
        path: &'static str,
        message: Req,
    ) -> Result<Streaming<Resp>>
    where
        Req: prost::Message + 'static,
        Resp: prost::Message + Default + 'static,
    {
        let mut grpc = self.grpc();
        grpc.ready().await.map_err(|e| {
            Error::with_source(ErrorKind::Dependency, "participant channel not ready", e)
        })?;
        let codec: ProstCodec<Req, Resp> = ProstCodec::default();
        // No deadline on streams: tailing mode has no natural bound and is
        // terminated by dropping the stream.
        let request = self.authed_request(message, false).await?;
        let response = grpc
            .server_streaming(request, PathAndQuery::from_static(path), codec)
            .await?;
        Ok(response.into_inner())
    }

    /// Assemble a single-command submission envelope.
    pub fn commands(
        &self,
        command_id: &str,
        act_as: &str,
        command: command::Command,
    ) -> Commands {
        Commands {
            application_id: self.config.application_id.clone(),
            command_id: command_id.to_string(),
            act_as: vec![act_as.to_string()],
            synchronizer_id: self.config.synchronizer_id.clone(),
            deduplication_seconds: self.config.dedup_duration.as_secs(),
            commands: vec![crate::ledger::proto::Command {
                command: Some(command),
            }],
        }
    }

    /// Current ledger end offset.
    pub async fn ledger_end(&self) -> Result<i64> {
        let response: GetLedgerEndResponse =
            self.unary(GET_LEDGER_END, GetLedgerEndRequest {}).await?;
        Ok(response.offset)
    }

    /// Submit a command batch and wait for the resulting transaction.
    pub async fn submit_and_wait(&self, commands: Commands) -> Result<Transaction> {
        let response: SubmitAndWaitResponse = self
            .unary(SUBMIT_AND_WAIT, SubmitAndWaitRequest {
                commands: Some(commands),
            })
            .await?;
        response
            .transaction
            .ok_or_else(|| Error::corrupt("participant returned an empty transaction"))
    }

    /// Create a contract and return its contract id.
    pub async fn create(
        &self,
        template: &Identifier,
        arguments: Record,
        act_as: &str,
        command_id: &str,
    ) -> Result<String> {
        let commands = self.commands(
            command_id,
            act_as,
            command::Command::Create(CreateCommand {
                template_id: Some(template.clone()),
                create_arguments: Some(arguments),
            }),
        );
        let transaction = self.submit_and_wait(commands).await?;
        let result = transaction
            .created(template)
            .next()
            .map(|c| c.contract_id.clone())
            .ok_or_else(|| {
                Error::corrupt(format!(
                    "create of {} produced no created event",
                    template.entity_name
                ))
            });
        result
    }

    /// Exercise a choice and return the resulting transaction.
    pub async fn exercise(
        &self,
        template: &Identifier,
        contract_id: &str,
        choice: &str,
        argument: Value,
        act_as: &str,
        command_id: &str,
    ) -> Result<Transaction> {
        let commands = self.commands(
            command_id,
            act_as,
            command::Command::Exercise(ExerciseCommand {
                template_id: Some(template.clone()),
                contract_id: contract_id.to_string(),
                choice: choice.to_string(),
                choice_argument: Some(argument),
            }),
        );
        self.submit_and_wait(commands).await
    }

    /// Snapshot of active contracts visible to `party` at the current
    /// ledger end, restricted to the given templates.
    pub async fn active_contracts(
        &self,
        party: &str,
        template_ids: Vec<Identifier>,
    ) -> Result<ActiveContractsStream> {
        let active_at_offset = self.ledger_end().await?;
        let inner = self
            .server_stream(GET_ACTIVE_CONTRACTS, GetActiveContractsRequest {
                party: party.to_string(),
                template_ids,
                active_at_offset,
            })
            .await?;
        Ok(ActiveContractsStream { inner })
    }

    /// Stream committed updates visible to `party`, from `begin_exclusive`
    /// up to `end_inclusive` (catch-up) or unbounded (tailing). Dropping the
    /// stream terminates the underlying call.
    pub async fn updates(
        &self,
        party: &str,
        begin_exclusive: i64,
        end_inclusive: Option<i64>,
        template_ids: Vec<Identifier>,
    ) -> Result<UpdateStream> {
        let inner = self
            .server_stream(GET_UPDATES, GetUpdatesRequest {
                begin_exclusive,
                end_inclusive,
                party: party.to_string(),
                template_ids,
            })
            .await?;
        Ok(UpdateStream { inner })
    }

    /// Allocate an externally-hosted party. The onboarding signature binds
    /// the hint to the party's public key; a taken hint surfaces as
    /// `conflict`.
    pub async fn allocate_external_party(
        &self,
        hint: &str,
        public_key_spki: Vec<u8>,
        signer: &SigningKey,
    ) -> Result<String> {
        let mut material = hint.as_bytes().to_vec();
        material.extend_from_slice(&public_key_spki);
        let digest = Sha256::digest(&material);
        let signature: Signature = signer
            .sign_prehash(&digest)
            .map_err(|e| Error::internal(format!("onboarding signature failed: {e}")))?;
        let signature = signature.normalize_s().unwrap_or(signature);

        let response: AllocateExternalPartyResponse = self
            .unary(ALLOCATE_EXTERNAL_PARTY, AllocateExternalPartyRequest {
                party_id_hint: hint.to_string(),
                public_key: public_key_spki,
                onboarding_signature: signature.to_bytes().to_vec(),
            })
            .await?;
        Ok(response.party_id)
    }
}

/// Finite stream of created events; restart by re-opening.
pub struct ActiveContractsStream {
    inner: Streaming<GetActiveContractsResponse>,
}

impl ActiveContractsStream {
    pub async fn next(&mut self) -> Result<Option<CreatedEvent>> {
        loop {
            match self.inner.message().await? {
                None => return Ok(None),
                Some(response) => {
                    if let Some(event) = response.created_event {
                        return Ok(Some(event));
                    }
                }
            }
        }
    }
}

/// Stream of committed transactions in offset order.
pub struct UpdateStream {
    inner: Streaming<GetUpdatesResponse>,
}

impl UpdateStream {
    pub async fn next(&mut self) -> Result<Option<Transaction>> {
        loop {
            match self.inner.message().await? {
                None => return Ok(None),
                Some(response) => {
                    if let Some(transaction) = response.transaction {
                        return Ok(Some(transaction));
                    }
                }
            }
        }
    }
}
