use crate::config::Commitment;
use crate::error::ProbeError;
use crate::probe::{ClockStart, Inbound, StreamControl, StreamTransport, Subscription};
use anyhow::Result;
use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::collections::HashMap;
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// `logsSubscribe` request mentioning a single account. Solana accepts one
/// mention per subscription, so each tracked account gets its own request id.
pub fn logs_subscribe(id: u64, account: &str, commitment: Commitment) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "logsSubscribe",
        "params": [
            { "mentions": [account] },
            { "commitment": commitment.as_str() }
        ]
    })
}

/// Tracks which subscription belongs to which account.
pub struct LogsDecoder {
    accounts: Vec<String>,
    subscriptions: HashMap<u64, String>,
}

impl LogsDecoder {
    pub fn new(accounts: &[String]) -> Self {
        Self {
            accounts: accounts.to_vec(),
            subscriptions: HashMap::new(),
        }
    }

    pub fn decode(&mut self, message: Message) -> Result<Inbound> {
        match message {
            Message::Text(text) => self.decode_text(&text),
            Message::Close(frame) => {
                let reason = frame
                    .map(|frame| format!("{} {}", frame.code, frame.reason))
                    .unwrap_or_else(|| "no close frame".to_string());
                Err(ProbeError::ClosedByServer(reason).into())
            }
            Message::Ping(_) | Message::Pong(_) => Ok(Inbound::Skipped("control frame".into())),
            Message::Binary(_) | Message::Frame(_) => Ok(Inbound::Skipped("binary frame".into())),
        }
    }

    pub fn decode_text(&mut self, text: &str) -> Result<Inbound> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProbeError::Decode(e.to_string()))?;

        if let Some(error) = value.get("error") {
            return Err(ProbeError::Rpc {
                code: error.get("code").and_then(Value::as_i64).unwrap_or_default(),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }
            .into());
        }

        if let Some(result) = value.get("result") {
            let request = value.get("id").and_then(Value::as_u64);
            if let (Some(request), Some(subscription)) = (request, result.as_u64()) {
                let account = request
                    .checked_sub(1)
                    .and_then(|index| self.accounts.get(index as usize));
                if let Some(account) = account {
                    debug!("Subscription {} tracks {}", subscription, account);
                    self.subscriptions.insert(subscription, account.clone());
                }
            }
            return Ok(Inbound::Acknowledged);
        }

        if value.get("method").and_then(Value::as_str) != Some("logsNotification") {
            return Ok(Inbound::Skipped("unrecognised message".into()));
        }

        let params = &value["params"];
        let transaction = &params["result"]["value"];
        match transaction.get("err") {
            Some(Value::Null) => {}
            Some(_) => {
                warn!("Error in detected transaction... skipping processing");
                return Ok(Inbound::Skipped("failed transaction".into()));
            }
            None => return Ok(Inbound::Skipped("notification without status".into())),
        }

        let account = params["subscription"]
            .as_u64()
            .and_then(|subscription| self.subscriptions.get(&subscription));
        let Some(account) = account else {
            return Ok(Inbound::Skipped("unknown subscription".into()));
        };

        Ok(Inbound::Event {
            accounts: vec![account.clone()],
            signature: transaction["signature"].as_str().map(str::to_string),
        })
    }
}

pub struct WsLogs {
    url: String,
    commitment: Commitment,
}

impl WsLogs {
    pub fn new(url: impl Into<String>, commitment: Commitment) -> Self {
        Self {
            url: url.into(),
            commitment,
        }
    }
}

struct WsControl {
    sink: WsSink,
}

#[async_trait]
impl StreamControl for WsControl {
    async fn close(&mut self) {
        if let Err(e) = self.sink.close().await {
            debug!("WebSocket close failed: {}", e);
        }
    }
}

#[async_trait]
impl StreamTransport for WsLogs {
    async fn subscribe(&mut self, accounts: &[String]) -> Result<Subscription> {
        let (socket, _) = connect_async(self.url.as_str()).await?;
        let (mut sink, read) = socket.split();

        for (index, account) in accounts.iter().enumerate() {
            let request = logs_subscribe(index as u64 + 1, account, self.commitment);
            sink.send(Message::Text(request.to_string().into())).await?;
        }
        info!("WebSocket connection opened and subscription request sent");

        let mut decoder = LogsDecoder::new(accounts);
        let inbound = read
            .map(move |frame| -> Result<Inbound> { decoder.decode(frame?) })
            .boxed();

        Ok(Subscription {
            inbound,
            control: Box::new(WsControl { sink }),
            keepalive: None,
            clock: ClockStart::Acknowledged,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder() -> LogsDecoder {
        LogsDecoder::new(&["A".to_string(), "B".to_string()])
    }

    fn notification(subscription: u64, err: Value) -> String {
        json!({
            "jsonrpc": "2.0",
            "method": "logsNotification",
            "params": {
                "subscription": subscription,
                "result": {
                    "context": { "slot": 5208469 },
                    "value": { "signature": "5h6x", "err": err, "logs": [] }
                }
            }
        })
        .to_string()
    }

    #[test]
    fn subscribe_request_mentions_account() {
        let request = logs_subscribe(2, "B", Commitment::Finalized);
        assert_eq!(request["id"], 2);
        assert_eq!(request["method"], "logsSubscribe");
        assert_eq!(request["params"][0]["mentions"][0], "B");
        assert_eq!(request["params"][1]["commitment"], "finalized");
    }

    #[test]
    fn notifications_map_to_subscribed_account() {
        let mut decoder = decoder();
        assert_eq!(
            decoder.decode_text(r#"{"jsonrpc":"2.0","result":41,"id":1}"#).unwrap(),
            Inbound::Acknowledged
        );
        assert_eq!(
            decoder.decode_text(r#"{"jsonrpc":"2.0","result":42,"id":2}"#).unwrap(),
            Inbound::Acknowledged
        );

        assert_eq!(
            decoder.decode_text(&notification(42, Value::Null)).unwrap(),
            Inbound::Event {
                accounts: vec!["B".to_string()],
                signature: Some("5h6x".to_string()),
            }
        );
        assert_eq!(
            decoder.decode_text(&notification(41, Value::Null)).unwrap(),
            Inbound::Event {
                accounts: vec!["A".to_string()],
                signature: Some("5h6x".to_string()),
            }
        );
    }

    #[test]
    fn unknown_subscriptions_are_not_counted() {
        let mut decoder = decoder();
        decoder
            .decode_text(r#"{"jsonrpc":"2.0","result":41,"id":1}"#)
            .unwrap();

        assert_eq!(
            decoder.decode_text(&notification(99, Value::Null)).unwrap(),
            Inbound::Skipped("unknown subscription".into())
        );
    }

    #[test]
    fn failed_transactions_are_skipped() {
        let mut decoder = decoder();
        let inbound = decoder
            .decode_text(&notification(1, json!({ "InstructionError": [0, "Custom"] })))
            .unwrap();
        assert!(matches!(inbound, Inbound::Skipped(_)));
    }

    #[test]
    fn malformed_and_error_messages_fail() {
        let mut decoder = decoder();
        assert!(decoder.decode_text("not json").is_err());

        let error = decoder
            .decode_text(r#"{"jsonrpc":"2.0","error":{"code":-32601,"message":"Method not found"},"id":1}"#)
            .unwrap_err();
        match error.downcast_ref::<ProbeError>() {
            Some(ProbeError::Rpc { code, message }) => {
                assert_eq!(*code, -32601);
                assert_eq!(message, "Method not found");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn server_close_is_an_error() {
        let mut decoder = decoder();
        assert!(decoder.decode(Message::Close(None)).is_err());
        assert!(matches!(
            decoder.decode(Message::Ping(Vec::new())).unwrap(),
            Inbound::Skipped(_)
        ));
    }
}
