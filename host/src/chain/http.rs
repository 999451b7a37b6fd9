//! REST client for a remote ledger node.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;

use super::{ChainError, Confirmation, LedgerNode, SignedTransaction};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const TOKEN_HEADER: &str = "X-Ledger-API-Token";

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    #[serde(rename = "txId")]
    tx_id: String,
}

impl SubmitResponse {
    /// The tx id is always the envelope digest; a gateway that names the
    /// transaction differently is not tracking what we signed.
    fn into_tx_id(self, digest: String) -> Result<String, ChainError> {
        if !self.tx_id.eq_ignore_ascii_case(&digest) {
            return Err(ChainError::Rejected(format!(
                "node answered tx id {} for envelope {digest}",
                self.tx_id
            )));
        }
        Ok(digest)
    }
}

#[derive(Debug, Deserialize)]
struct PendingResponse {
    #[serde(rename = "confirmed-round", default)]
    confirmed_round: Option<u64>,
    #[serde(rename = "pool-error", default)]
    pool_error: Option<String>,
}

impl PendingResponse {
    fn into_confirmation(self) -> Confirmation {
        match (self.confirmed_round, self.pool_error) {
            (Some(round), _) if round > 0 => Confirmation::Confirmed { round },
            (_, Some(reason)) if !reason.is_empty() => Confirmation::Rejected { reason },
            _ => Confirmation::Pending,
        }
    }
}

/// Ledger node reached over HTTP.
pub struct HttpLedgerNode {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpLedgerNode {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, ChainError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.header(TOKEN_HEADER, token),
            None => request,
        }
    }
}

#[async_trait]
impl LedgerNode for HttpLedgerNode {
    async fn submit(&self, tx: &SignedTransaction) -> Result<String, ChainError> {
        let digest = tx.digest()?;
        let url = format!("{}/v2/transactions", self.base_url);
        let response = self.authorize(self.client.post(&url)).json(tx).send().await?;
        let status = response.status();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChainError::Rejected(format!("{status}: {body}")));
        }
        if !status.is_success() {
            return Err(ChainError::Unavailable(format!("node answered {status}")));
        }
        let body: SubmitResponse = response.json().await?;
        body.into_tx_id(digest)
    }

    async fn confirmation(&self, tx_id: &str) -> Result<Confirmation, ChainError> {
        let url = format!("{}/v2/transactions/pending/{}", self.base_url, tx_id);
        let response = self.authorize(self.client.get(&url)).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(Confirmation::Rejected {
                reason: format!("transaction {tx_id} unknown to node"),
            }),
            status if status.is_success() => {
                let body: PendingResponse = response.json().await?;
                Ok(body.into_confirmation())
            }
            status => Err(ChainError::Unavailable(format!("node answered {status}"))),
        }
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainOp, KeySource, TxSigner};

    fn pending(json: &str) -> Confirmation {
        serde_json::from_str::<PendingResponse>(json)
            .unwrap()
            .into_confirmation()
    }

    #[test]
    fn test_pending_response_mapping() {
        assert_eq!(
            pending(r#"{"confirmed-round": 812, "pool-error": ""}"#),
            Confirmation::Confirmed { round: 812 }
        );
        assert_eq!(pending(r#"{"confirmed-round": 0}"#), Confirmation::Pending);
        assert_eq!(pending("{}"), Confirmation::Pending);
        assert_eq!(
            pending(r#"{"pool-error": "overspend"}"#),
            Confirmation::Rejected {
                reason: "overspend".into()
            }
        );
    }

    #[test]
    fn test_submit_answer_must_echo_envelope_digest() {
        let signer = TxSigner::load(&KeySource::Seed("http-test".into())).unwrap();
        let op = ChainOp::UpdateReputation {
            identity: "bob".into(),
            delta: 5,
            reason: "verification accepted".into(),
        };
        let digest = signer.sign(&op, 1).unwrap().digest().unwrap();

        let echoed: SubmitResponse =
            serde_json::from_str(&format!(r#"{{"txId": "{}"}}"#, digest.to_uppercase())).unwrap();
        assert_eq!(echoed.into_tx_id(digest.clone()).unwrap(), digest);

        let foreign: SubmitResponse = serde_json::from_str(r#"{"txId": "NODE-42"}"#).unwrap();
        assert!(matches!(
            foreign.into_tx_id(digest),
            Err(ChainError::Rejected(msg)) if msg.contains("NODE-42")
        ));
    }

    #[test]
    fn test_base_url_trailing_slash_is_trimmed() {
        let node = HttpLedgerNode::new("http://localhost:4001/", None).unwrap();
        assert_eq!(node.base_url(), "http://localhost:4001");
    }
}
