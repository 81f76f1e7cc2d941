//! Yellowstone (Geyser) gRPC adapters: a transaction subscription kept alive
//! with pings, and `getLatestBlockhash` polling.

use crate::config::Commitment;
use crate::error::ProbeError;
use crate::probe::{
    ClockStart, Inbound, Keepalive, PollTransport, StreamControl, StreamTransport, Subscription,
};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::service::Interceptor;
use tonic::transport::ClientTlsConfig;
use tracing::debug;
use yellowstone_grpc_client::GeyserGrpcClient;
use yellowstone_grpc_proto::prelude::{
    CommitmentLevel, SubscribeRequest, SubscribeRequestFilterTransactions, SubscribeRequestPing,
    SubscribeUpdate, subscribe_update::UpdateOneof,
};

/// Name of the transaction filter; updates carrying other filter names are ignored.
pub const TRANSACTION_FILTER: &str = "txReq";
const PING_ID: i32 = 1;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_QUEUE: usize = 16;

impl From<Commitment> for CommitmentLevel {
    fn from(commitment: Commitment) -> Self {
        match commitment {
            Commitment::Processed => CommitmentLevel::Processed,
            Commitment::Confirmed => CommitmentLevel::Confirmed,
            Commitment::Finalized => CommitmentLevel::Finalized,
        }
    }
}

async fn connect(
    endpoint: String,
    token: Option<String>,
) -> Result<GeyserGrpcClient<impl Interceptor + Send + Sync + 'static>> {
    let tls = endpoint.starts_with("https://");
    let mut builder = GeyserGrpcClient::build_from_shared(endpoint)?
        .x_token(token)?
        .connect_timeout(CONNECT_TIMEOUT);
    if tls {
        builder = builder.tls_config(ClientTlsConfig::new().with_native_roots())?;
    }
    Ok(builder.connect().await?)
}

pub fn subscribe_request(accounts: &[String], commitment: Commitment) -> SubscribeRequest {
    let mut transactions = HashMap::new();
    transactions.insert(
        TRANSACTION_FILTER.to_string(),
        SubscribeRequestFilterTransactions {
            account_include: accounts.to_vec(),
            ..Default::default()
        },
    );
    SubscribeRequest {
        transactions,
        commitment: Some(CommitmentLevel::from(commitment) as i32),
        ..Default::default()
    }
}

fn ping_request() -> SubscribeRequest {
    SubscribeRequest {
        ping: Some(SubscribeRequestPing { id: PING_ID }),
        ..Default::default()
    }
}

/// Translate one subscription update into a probe message. Account keys and
/// signatures are base58 encoded.
pub fn decode_update(update: SubscribeUpdate) -> Result<Inbound> {
    match update.update_oneof {
        Some(UpdateOneof::Transaction(transaction)) => {
            if !update.filters.iter().any(|name| name == TRANSACTION_FILTER) {
                return Ok(Inbound::Skipped(format!(
                    "transaction for filters {:?}",
                    update.filters
                )));
            }
            let info = transaction.transaction.ok_or_else(|| {
                ProbeError::Decode("transaction update without transaction info".into())
            })?;
            let signature = bs58::encode(&info.signature).into_string();
            let accounts = info
                .transaction
                .and_then(|tx| tx.message)
                .map(|message| {
                    message
                        .account_keys
                        .iter()
                        .map(|key| bs58::encode(key).into_string())
                        .collect()
                })
                .unwrap_or_default();
            Ok(Inbound::Event {
                accounts,
                signature: Some(signature),
            })
        }
        Some(UpdateOneof::Pong(_)) => Ok(Inbound::Pong),
        Some(UpdateOneof::Ping(_)) => Ok(Inbound::Skipped("server ping".into())),
        Some(_) => Ok(Inbound::Skipped("unrelated update".into())),
        None => Err(ProbeError::Decode("update without payload".into()).into()),
    }
}

pub struct GrpcStream {
    endpoint: String,
    token: Option<String>,
    commitment: Commitment,
}

impl GrpcStream {
    pub fn new(endpoint: impl Into<String>, token: Option<String>, commitment: Commitment) -> Self {
        Self {
            endpoint: endpoint.into(),
            token,
            commitment,
        }
    }
}

struct GrpcControl<F> {
    requests: Option<mpsc::Sender<SubscribeRequest>>,
    _client: GeyserGrpcClient<F>,
}

/// Pings share the request stream with the subscription. The request stream
/// only half-closes once both senders are gone.
struct GrpcPinger {
    requests: mpsc::Sender<SubscribeRequest>,
}

#[async_trait]
impl Keepalive for GrpcPinger {
    async fn ping(&mut self) -> Result<()> {
        self.requests
            .send(ping_request())
            .await
            .map_err(|_| anyhow!("request stream closed by server"))
    }
}

#[async_trait]
impl<F: Send + 'static> StreamControl for GrpcControl<F> {
    async fn close(&mut self) {
        if self.requests.take().is_some() {
            debug!("gRPC request stream half-closed");
        }
    }
}

#[async_trait]
impl StreamTransport for GrpcStream {
    async fn subscribe(&mut self, accounts: &[String]) -> Result<Subscription> {
        let mut client = connect(self.endpoint.clone(), self.token.clone()).await?;

        let (requests, queue) = mpsc::channel(REQUEST_QUEUE);
        requests
            .send(subscribe_request(accounts, self.commitment))
            .await
            .map_err(|_| anyhow!("request queue closed before subscribing"))?;

        let updates = client
            .geyser
            .subscribe(ReceiverStream::new(queue))
            .await?
            .into_inner();
        let inbound = updates
            .map(|update| update.map_err(anyhow::Error::from).and_then(decode_update))
            .boxed();

        Ok(Subscription {
            inbound,
            keepalive: Some(Box::new(GrpcPinger {
                requests: requests.clone(),
            })),
            control: Box::new(GrpcControl {
                requests: Some(requests),
                _client: client,
            }),
            clock: ClockStart::Subscribed,
        })
    }
}

#[async_trait]
trait LatestBlockhash: Send {
    async fn latest_blockhash(&mut self, commitment: CommitmentLevel) -> Result<String>;
}

#[async_trait]
impl<F> LatestBlockhash for GeyserGrpcClient<F>
where
    F: Interceptor + Send + Sync + 'static,
{
    async fn latest_blockhash(&mut self, commitment: CommitmentLevel) -> Result<String> {
        let reply = self.get_latest_blockhash(Some(commitment)).await?;
        Ok(reply.blockhash)
    }
}

pub struct GrpcCalls {
    endpoint: String,
    token: Option<String>,
    commitment: Commitment,
    client: Option<Box<dyn LatestBlockhash>>,
}

impl GrpcCalls {
    pub fn new(endpoint: impl Into<String>, token: Option<String>, commitment: Commitment) -> Self {
        Self {
            endpoint: endpoint.into(),
            token,
            commitment,
            client: None,
        }
    }
}

#[async_trait]
impl PollTransport for GrpcCalls {
    async fn connect(&mut self) -> Result<()> {
        let client = connect(self.endpoint.clone(), self.token.clone()).await?;
        self.client = Some(Box::new(client));
        Ok(())
    }

    async fn call(&mut self) -> Result<String> {
        let client = self
            .client
            .as_mut()
            .ok_or_else(|| anyhow!("gRPC client not connected"))?;
        let blockhash = client.latest_blockhash(self.commitment.into()).await?;
        Ok(format!("latest blockhash {}", blockhash))
    }
}
