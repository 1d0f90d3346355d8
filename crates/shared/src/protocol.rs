use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    domain::{Origin, RequestId},
    error::{ErrorCode, WalletError},
};

pub const DEFAULT_CONNECT_PERMISSION: &str = "view_address";

/// Tags the sender of a message on the page channel. Every context on the page sees
/// every message, so each side only accepts the tag of its counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceTag {
    #[serde(rename = "dapp-request")]
    DappRequest,
    #[serde(rename = "wallet-relay")]
    WalletRelay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RequestKind {
    Connect,
    Transaction,
    ContractCall,
    Balance,
    SignMessage,
    Disconnect,
}

impl RequestKind {
    pub const ALL: [RequestKind; 6] = [
        RequestKind::Connect,
        RequestKind::Transaction,
        RequestKind::ContractCall,
        RequestKind::Balance,
        RequestKind::SignMessage,
        RequestKind::Disconnect,
    ];

    pub fn label(self) -> &'static str {
        match self {
            RequestKind::Connect => "Connection",
            RequestKind::Transaction => "Transaction",
            RequestKind::ContractCall => "Contract call",
            RequestKind::Balance => "Balance",
            RequestKind::SignMessage => "Sign message",
            RequestKind::Disconnect => "Disconnect",
        }
    }

    pub fn response_kind(self) -> ResponseKind {
        match self {
            RequestKind::Connect => ResponseKind::ConnectResponse,
            RequestKind::Transaction => ResponseKind::TransactionResponse,
            RequestKind::ContractCall => ResponseKind::ContractCallResponse,
            RequestKind::Balance => ResponseKind::BalanceResponse,
            RequestKind::SignMessage => ResponseKind::SignMessageResponse,
            RequestKind::Disconnect => ResponseKind::DisconnectResponse,
        }
    }

    /// Kinds that need an existing connection for the requesting origin.
    pub fn requires_connection(self) -> bool {
        matches!(self, RequestKind::Transaction | RequestKind::ContractCall)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResponseKind {
    ConnectResponse,
    TransactionResponse,
    ContractCallResponse,
    BalanceResponse,
    SignMessageResponse,
    DisconnectResponse,
}

impl ResponseKind {
    pub fn request_kind(self) -> RequestKind {
        match self {
            ResponseKind::ConnectResponse => RequestKind::Connect,
            ResponseKind::TransactionResponse => RequestKind::Transaction,
            ResponseKind::ContractCallResponse => RequestKind::ContractCall,
            ResponseKind::BalanceResponse => RequestKind::Balance,
            ResponseKind::SignMessageResponse => RequestKind::SignMessage,
            ResponseKind::DisconnectResponse => RequestKind::Disconnect,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodType {
    View,
    Call,
}

impl MethodType {
    pub fn as_str(self) -> &'static str {
        match self {
            MethodType::View => "view",
            MethodType::Call => "call",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_icon: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRequest {
    pub to: String,
    pub amount: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractCallRequest {
    pub contract_address: String,
    pub method_name: String,
    pub method_type: MethodType,
    #[serde(default)]
    pub params: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_price: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignMessageRequest {
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DisconnectRequest {}

/// Kind-specific request fields. Closed: anything else is rejected at the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum RequestPayload {
    Connect(ConnectRequest),
    Transaction(TransactionRequest),
    ContractCall(ContractCallRequest),
    Balance(BalanceRequest),
    SignMessage(SignMessageRequest),
    Disconnect(DisconnectRequest),
}

impl RequestPayload {
    pub fn kind(&self) -> RequestKind {
        match self {
            RequestPayload::Connect(_) => RequestKind::Connect,
            RequestPayload::Transaction(_) => RequestKind::Transaction,
            RequestPayload::ContractCall(_) => RequestKind::ContractCall,
            RequestPayload::Balance(_) => RequestKind::Balance,
            RequestPayload::SignMessage(_) => RequestKind::SignMessage,
            RequestPayload::Disconnect(_) => RequestKind::Disconnect,
        }
    }

    /// The `data` object as it appears on the wire.
    pub fn data(&self) -> Value {
        let encoded = match self {
            RequestPayload::Connect(inner) => serde_json::to_value(inner),
            RequestPayload::Transaction(inner) => serde_json::to_value(inner),
            RequestPayload::ContractCall(inner) => serde_json::to_value(inner),
            RequestPayload::Balance(inner) => serde_json::to_value(inner),
            RequestPayload::SignMessage(inner) => serde_json::to_value(inner),
            RequestPayload::Disconnect(inner) => serde_json::to_value(inner),
        };
        encoded.unwrap_or_else(|_| Value::Object(Map::new()))
    }

    pub fn from_data(kind: RequestKind, data: Value) -> Result<Self, WalletError> {
        let data = match data {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };
        let payload = match kind {
            RequestKind::Connect => RequestPayload::Connect(decode_data(kind, data)?),
            RequestKind::Transaction => RequestPayload::Transaction(decode_data(kind, data)?),
            RequestKind::ContractCall => RequestPayload::ContractCall(decode_data(kind, data)?),
            RequestKind::Balance => RequestPayload::Balance(decode_data(kind, data)?),
            RequestKind::SignMessage => RequestPayload::SignMessage(decode_data(kind, data)?),
            RequestKind::Disconnect => RequestPayload::Disconnect(decode_data(kind, data)?),
        };
        payload.validate()?;
        Ok(payload.normalized())
    }

    pub fn validate(&self) -> Result<(), WalletError> {
        match self {
            RequestPayload::Connect(_)
            | RequestPayload::Balance(_)
            | RequestPayload::Disconnect(_) => Ok(()),
            RequestPayload::Transaction(tx) => {
                require_non_empty("to", &tx.to)?;
                require_positive_amount("amount", &tx.amount)
            }
            RequestPayload::ContractCall(call) => {
                require_non_empty("contractAddress", &call.contract_address)?;
                require_non_empty("methodName", &call.method_name)?;
                match &call.value {
                    Some(value) if !value.trim().is_empty() => {
                        require_non_negative_amount("value", value)
                    }
                    _ => Ok(()),
                }
            }
            RequestPayload::SignMessage(sign) => require_non_empty("message", &sign.message),
        }
    }

    /// Fills defaults: a connect without permissions asks for the address only, and
    /// duplicate permission tags collapse.
    fn normalized(self) -> Self {
        match self {
            RequestPayload::Connect(mut connect) => {
                let mut permissions = Vec::with_capacity(connect.permissions.len().max(1));
                for permission in connect.permissions.drain(..) {
                    let permission = permission.trim().to_string();
                    if !permission.is_empty() && !permissions.contains(&permission) {
                        permissions.push(permission);
                    }
                }
                if permissions.is_empty() {
                    permissions.push(DEFAULT_CONNECT_PERMISSION.to_string());
                }
                connect.permissions = permissions;
                RequestPayload::Connect(connect)
            }
            other => other,
        }
    }
}

fn decode_data<T: DeserializeOwned>(kind: RequestKind, data: Value) -> Result<T, WalletError> {
    serde_json::from_value(data).map_err(|err| {
        WalletError::invalid_request(format!("invalid {} payload: {err}", kind.label()))
    })
}

fn require_non_empty(field: &str, value: &str) -> Result<(), WalletError> {
    if value.trim().is_empty() {
        return Err(WalletError::invalid_request(format!("{field} must not be empty")));
    }
    Ok(())
}

fn parse_amount(field: &str, value: &str) -> Result<f64, WalletError> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|amount| amount.is_finite())
        .ok_or_else(|| WalletError::invalid_request(format!("{field} must be a number")))
}

fn require_positive_amount(field: &str, value: &str) -> Result<(), WalletError> {
    if parse_amount(field, value)? <= 0.0 {
        return Err(WalletError::invalid_request(format!("{field} must be positive")));
    }
    Ok(())
}

fn require_non_negative_amount(field: &str, value: &str) -> Result<(), WalletError> {
    if parse_amount(field, value)? < 0.0 {
        return Err(WalletError::invalid_request(format!("{field} must not be negative")));
    }
    Ok(())
}

/// Success payload of an approved connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectResult {
    pub address: String,
    pub permissions: Vec<String>,
}

/// A request after the relay has validated it and stamped the page origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub id: RequestId,
    pub origin: Origin,
    pub payload: RequestPayload,
    pub created_at: DateTime<Utc>,
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        self.payload.kind()
    }
}

/// Page -> relay message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    pub source: SourceTag,
    #[serde(rename = "type")]
    pub kind: RequestKind,
    pub request_id: RequestId,
    #[serde(default)]
    pub data: Value,
}

impl RequestEnvelope {
    pub fn new(request_id: RequestId, payload: &RequestPayload) -> Self {
        Self {
            source: SourceTag::DappRequest,
            kind: payload.kind(),
            request_id,
            data: payload.data(),
        }
    }

    /// Validates `data` against `type` and stamps the origin. The origin always comes
    /// from the relay's own context, never from the message.
    pub fn decode(self, origin: Origin) -> Result<Request, WalletError> {
        let payload = RequestPayload::from_data(self.kind, self.data)?;
        Ok(Request {
            id: self.request_id,
            origin,
            payload,
            created_at: Utc::now(),
        })
    }
}

/// The single terminal result of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalOutcome {
    pub request_id: RequestId,
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
}

impl ApprovalOutcome {
    pub fn approved(request_id: RequestId, result: Value) -> Self {
        Self {
            request_id,
            approved: true,
            result: Some(result),
            error: None,
            code: None,
        }
    }

    pub fn rejected(request_id: RequestId, error: &WalletError) -> Self {
        Self {
            request_id,
            approved: false,
            result: None,
            error: Some(error.message.clone()),
            code: Some(error.code),
        }
    }

    pub fn from_result(request_id: RequestId, result: Result<Value, WalletError>) -> Self {
        match result {
            Ok(value) => Self::approved(request_id, value),
            Err(err) => Self::rejected(request_id, &err),
        }
    }

    pub fn into_result(self) -> Result<Value, WalletError> {
        if self.approved {
            Ok(self.result.unwrap_or(Value::Null))
        } else {
            Err(WalletError::from_wire(self.code, self.error))
        }
    }
}

/// Coordinator -> page reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub request_id: RequestId,
    #[serde(rename = "type")]
    pub kind: ResponseKind,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
}

impl ResponseEnvelope {
    pub fn from_outcome(kind: RequestKind, outcome: ApprovalOutcome) -> Self {
        Self {
            request_id: outcome.request_id,
            kind: kind.response_kind(),
            success: outcome.approved,
            result: outcome.result,
            error: outcome.error,
            code: outcome.code,
        }
    }

    pub fn failure(request_id: RequestId, kind: RequestKind, error: &WalletError) -> Self {
        Self::from_outcome(kind, ApprovalOutcome::rejected(request_id, error))
    }

    pub fn outcome(&self) -> ApprovalOutcome {
        ApprovalOutcome {
            request_id: self.request_id,
            approved: self.success,
            result: self.result.clone(),
            error: self.error.clone(),
            code: self.code,
        }
    }
}

/// Relay -> page message: a response tagged with the relay's source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayMessage {
    pub source: SourceTag,
    #[serde(flatten)]
    pub response: ResponseEnvelope,
}

impl RelayMessage {
    pub fn new(response: ResponseEnvelope) -> Self {
        Self {
            source: SourceTag::WalletRelay,
            response,
        }
    }
}

/// Extracts the `source` tag of an untyped page message without parsing the rest.
pub fn source_tag(message: &Value) -> Option<SourceTag> {
    message
        .get("source")
        .cloned()
        .and_then(|source| serde_json::from_value(source).ok())
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
