//! Web3 request/response payloads carried inside encrypted events.
//!
//! The DApp side encrypts a [`Web3RequestEnvelope`] into a `PublishEvent`
//! frame; the wallet answers with a [`Web3ResponseEnvelope`] pushed back as
//! an `Event`.

// Rust guideline compliant 2026-02

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `type` of an outbound request envelope.
pub const WEB3_REQUEST: &str = "WEB3_REQUEST";

/// `type` of an inbound response envelope.
pub const WEB3_RESPONSE: &str = "WEB3_RESPONSE";

/// Error message sent when the user declines a request.
pub const USER_REJECTED_MESSAGE: &str = "User rejected signature request";

/// Parameters of `requestEthereumAccounts`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DappPermissionParams {
    /// Name shown in the wallet.
    pub app_name: String,
    /// Logo shown in the wallet.
    pub app_logo_url: String,
}

/// Parameters of `signEthereumMessage`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignEthereumMessageParams {
    /// Hex-encoded message.
    pub message: String,
    /// Signing account.
    pub address: String,
    /// Prepend the `personal_sign` prefix.
    pub add_prefix: bool,
    /// EIP-712 typed data, when signing typed data.
    #[serde(default)]
    pub typed_data_json: Option<String>,
}

/// Parameters of `signEthereumTransaction`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignEthereumTransactionParams {
    /// Sender.
    pub from_address: String,
    /// Recipient; `None` deploys a contract.
    #[serde(default)]
    pub to_address: Option<String>,
    /// Value in wei, decimal string.
    pub wei_value: String,
    /// Hex call data.
    pub data: String,
    /// Sender nonce; the wallet picks one when absent.
    #[serde(default)]
    pub nonce: Option<u64>,
    /// Gas price in wei.
    #[serde(default)]
    pub gas_price_in_wei: Option<String>,
    /// Gas limit.
    #[serde(default)]
    pub gas_limit: Option<String>,
    /// EIP-155 chain id.
    pub chain_id: u64,
    /// Broadcast after signing.
    pub should_submit: bool,
}

/// Parameters of `submitEthereumTransaction`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitEthereumTransactionParams {
    /// Hex RLP of the signed transaction.
    pub signed_transaction: String,
    /// EIP-155 chain id.
    pub chain_id: u64,
}

/// A JSON-RPC call addressed to the wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "camelCase")]
pub enum Web3Request {
    /// Ask for the wallet's accounts.
    RequestEthereumAccounts(DappPermissionParams),
    /// Sign an arbitrary or typed message.
    SignEthereumMessage(SignEthereumMessageParams),
    /// Sign (and optionally submit) a transaction.
    SignEthereumTransaction(SignEthereumTransactionParams),
    /// Broadcast an already-signed transaction.
    SubmitEthereumTransaction(SubmitEthereumTransactionParams),
    /// Withdraw an earlier request.
    RequestCanceled,
}

impl Web3Request {
    /// JSON-RPC method name.
    #[must_use]
    pub fn method(&self) -> &'static str {
        match self {
            Self::RequestEthereumAccounts(_) => "requestEthereumAccounts",
            Self::SignEthereumMessage(_) => "signEthereumMessage",
            Self::SignEthereumTransaction(_) => "signEthereumTransaction",
            Self::SubmitEthereumTransaction(_) => "submitEthereumTransaction",
            Self::RequestCanceled => "requestCanceled",
        }
    }
}

/// Encrypted body of a `Web3Request` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Web3RequestEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    /// Client-generated request id; the wallet echoes it in its response.
    pub id: String,
    pub request: Web3Request,
    /// Origin of the DApp, constant for one connection.
    pub origin: String,
}

impl Web3RequestEnvelope {
    #[must_use]
    pub fn new(id: impl Into<String>, request: Web3Request, origin: impl Into<String>) -> Self {
        Self {
            kind: WEB3_REQUEST.to_string(),
            id: id.into(),
            request,
            origin: origin.into(),
        }
    }

    /// Build the handshake's account request.
    #[must_use]
    pub fn accounts_request(
        id: impl Into<String>,
        app_name: impl Into<String>,
        app_logo_url: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self::new(
            id,
            Web3Request::RequestEthereumAccounts(DappPermissionParams {
                app_name: app_name.into(),
                app_logo_url: app_logo_url.into(),
            }),
            origin,
        )
    }
}

/// Result of a request as reported by the wallet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Web3Response {
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl Web3Response {
    /// Successful response.
    #[must_use]
    pub fn approved(method: impl Into<String>, result: Value) -> Self {
        Self {
            method: method.into(),
            result,
            error_message: None,
        }
    }

    /// Declined response.
    #[must_use]
    pub fn rejected(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            result: Value::Null,
            error_message: Some(USER_REJECTED_MESSAGE.to_string()),
        }
    }

    /// True only when the user declined. Other error messages still count
    /// as an answer.
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        self.error_message.as_deref() == Some(USER_REJECTED_MESSAGE)
    }

    /// First element of an array result, whatever the method.
    #[must_use]
    pub fn first_account(&self) -> Option<&str> {
        match &self.result {
            Value::Array(accounts) => accounts.first().and_then(Value::as_str),
            _ => None,
        }
    }
}

fn web3_response_type() -> String {
    WEB3_RESPONSE.to_string()
}

/// Encrypted body of a `Web3Response` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Web3ResponseEnvelope {
    #[serde(rename = "type", default = "web3_response_type")]
    pub kind: String,
    /// Id of the request being answered.
    #[serde(default)]
    pub id: String,
    pub response: Web3Response,
}

impl Web3ResponseEnvelope {
    #[must_use]
    pub fn new(id: impl Into<String>, response: Web3Response) -> Self {
        Self {
            kind: WEB3_RESPONSE.to_string(),
            id: id.into(),
            response,
        }
    }

    /// Parse a decrypted payload; `None` unless it carries a `response` object.
    ///
    /// Wallets do not always set `type`, so only the `response` member is
    /// required.
    #[must_use]
    pub fn from_payload(payload: &Value) -> Option<Self> {
        if !payload.get("response").is_some_and(Value::is_object) {
            return None;
        }
        serde_json::from_value(payload.clone()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORIGIN: &str = "https://www.usfca.edu";

    #[test]
    fn test_accounts_request_json() {
        let dto = Web3RequestEnvelope::accounts_request(
            "1",
            "CS690 Team 15 DApp",
            "https://app.compound.finance/images/compound-192.png",
            ORIGIN,
        );
        assert_eq!(
            serde_json::to_string(&dto).unwrap(),
            r#"{"type":"WEB3_REQUEST","id":"1","request":{"method":"requestEthereumAccounts","params":{"appName":"CS690 Team 15 DApp","appLogoUrl":"https://app.compound.finance/images/compound-192.png"}},"origin":"https://www.usfca.edu"}"#
        );
    }

    #[test]
    fn test_sign_message_json() {
        let dto = Web3RequestEnvelope::new(
            "13a09f7199d39999",
            Web3Request::SignEthereumMessage(SignEthereumMessageParams {
                message: "hello".into(),
                address: "0x568d46f6a798cd75a9beb60a8f57879043a69c3b".into(),
                add_prefix: false,
                typed_data_json: Some(r#"{"test" : "String"}"#.into()),
            }),
            ORIGIN,
        );
        assert_eq!(
            serde_json::to_string(&dto).unwrap(),
            r#"{"type":"WEB3_REQUEST","id":"13a09f7199d39999","request":{"method":"signEthereumMessage","params":{"message":"hello","address":"0x568d46f6a798cd75a9beb60a8f57879043a69c3b","addPrefix":false,"typedDataJson":"{\"test\" : \"String\"}"}},"origin":"https://www.usfca.edu"}"#
        );
    }

    #[test]
    fn test_sign_transaction_json() {
        let dto = Web3RequestEnvelope::new(
            "13a09f7199d39999",
            Web3Request::SignEthereumTransaction(SignEthereumTransactionParams {
                from_address: "0x568d46f6a798cd75a9beb60a8f57879043a69999".into(),
                to_address: Some("0xadAe4A6d32e91aF731d17AD5e63FD8629c4DF784".into()),
                wei_value: "100000000000000000".into(),
                data: "transaction".into(),
                nonce: Some(1),
                gas_price_in_wei: Some("0".into()),
                gas_limit: Some("0".into()),
                chain_id: 3,
                should_submit: true,
            }),
            ORIGIN,
        );
        assert_eq!(
            serde_json::to_string(&dto).unwrap(),
            r#"{"type":"WEB3_REQUEST","id":"13a09f7199d39999","request":{"method":"signEthereumTransaction","params":{"fromAddress":"0x568d46f6a798cd75a9beb60a8f57879043a69999","toAddress":"0xadAe4A6d32e91aF731d17AD5e63FD8629c4DF784","weiValue":"100000000000000000","data":"transaction","nonce":1,"gasPriceInWei":"0","gasLimit":"0","chainId":3,"shouldSubmit":true}},"origin":"https://www.usfca.edu"}"#
        );
    }

    #[test]
    fn test_submit_transaction_json() {
        let dto = Web3RequestEnvelope::new(
            "13a09f7199d39999",
            Web3Request::SubmitEthereumTransaction(SubmitEthereumTransactionParams {
                signed_transaction: "d34baaa2".into(),
                chain_id: 3,
            }),
            ORIGIN,
        );
        assert_eq!(
            serde_json::to_string(&dto).unwrap(),
            r#"{"type":"WEB3_REQUEST","id":"13a09f7199d39999","request":{"method":"submitEthereumTransaction","params":{"signedTransaction":"d34baaa2","chainId":3}},"origin":"https://www.usfca.edu"}"#
        );
    }

    #[test]
    fn test_cancel_json() {
        let dto = Web3RequestEnvelope::new("13a09f7199d39999", Web3Request::RequestCanceled, ORIGIN);
        assert_eq!(
            serde_json::to_string(&dto).unwrap(),
            r#"{"type":"WEB3_REQUEST","id":"13a09f7199d39999","request":{"method":"requestCanceled"},"origin":"https://www.usfca.edu"}"#
        );
    }

    #[test]
    fn test_response_parsing() {
        let payload = serde_json::json!({
            "type": "WEB3_RESPONSE",
            "id": "1",
            "response": {"method": "requestEthereumAccounts", "result": ["0xabc"]}
        });
        let envelope = Web3ResponseEnvelope::from_payload(&payload).unwrap();
        assert_eq!(envelope.id, "1");
        assert!(!envelope.response.is_rejection());
        assert_eq!(envelope.response.first_account(), Some("0xabc"));
    }

    #[test]
    fn test_rejection_and_non_response_payloads() {
        let rejected = serde_json::to_value(Web3ResponseEnvelope::new("7", Web3Response::rejected("signEthereumMessage")))
            .unwrap();
        assert_eq!(rejected["response"]["errorMessage"], USER_REJECTED_MESSAGE);
        let parsed = Web3ResponseEnvelope::from_payload(&rejected).unwrap();
        assert!(parsed.response.is_rejection());
        assert_eq!(parsed.response.first_account(), None);

        let request = serde_json::json!({"type": "WEB3_REQUEST", "id": "1"});
        assert!(Web3ResponseEnvelope::from_payload(&request).is_none());

        let untyped = serde_json::json!({"response": {"method": "m", "result": null, "errorMessage": null}});
        let parsed = Web3ResponseEnvelope::from_payload(&untyped).unwrap();
        assert_eq!(parsed.kind, WEB3_RESPONSE);
        assert!(!parsed.response.is_rejection());
    }

    #[test]
    fn test_only_user_rejection_counts_as_rejected() {
        let failed = Web3Response {
            method: "signEthereumTransaction".into(),
            result: Value::Null,
            error_message: Some("Network error".into()),
        };
        assert!(!failed.is_rejection());
        assert!(Web3Response::rejected("signEthereumTransaction").is_rejection());
    }

    #[test]
    fn test_first_account_of_any_array_result() {
        let response = Web3Response::approved("ethAccounts", serde_json::json!(["0xabc", "0xdef"]));
        assert_eq!(response.first_account(), Some("0xabc"));

        let signature = Web3Response::approved("signEthereumMessage", serde_json::json!("0xsig"));
        assert_eq!(signature.first_account(), None);
    }
}
