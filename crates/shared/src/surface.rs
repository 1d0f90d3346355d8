//! Addressable state of a dedicated approval surface.
//!
//! When the inline prompt cannot be shown, the coordinator opens a full surface whose
//! address carries the whole request as a flat parameter set, each value
//! percent-encoded.

use std::borrow::Cow;

use url::Url;

use crate::{
    error::WalletError,
    protocol::{Request, RequestPayload},
};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SurfaceState {
    params: Vec<(String, String)>,
}

impl SurfaceState {
    pub fn from_request(request: &Request, app_name: Option<&str>, app_icon: Option<&str>) -> Self {
        let mut state = Self::default();
        state.push("action", action_name(&request.payload));
        state.push("requestId", request.id.to_string());
        state.push("origin", request.origin.as_str());

        let (own_name, own_icon) = match &request.payload {
            RequestPayload::Connect(connect) => {
                (connect.app_name.as_deref(), connect.app_icon.as_deref())
            }
            _ => (None, None),
        };
        state.push("appName", own_name.or(app_name).unwrap_or(request.origin.as_str()));
        if let Some(icon) = own_icon.or(app_icon) {
            state.push("appIcon", icon);
        }

        match &request.payload {
            RequestPayload::Connect(connect) => {
                state.push("permissions", connect.permissions.join(","));
            }
            RequestPayload::Transaction(tx) => {
                state.push("to", &tx.to);
                state.push("amount", &tx.amount);
                if let Some(message) = &tx.message {
                    state.push("message", message);
                }
            }
            RequestPayload::ContractCall(call) => {
                state.push("contractAddress", &call.contract_address);
                state.push("methodName", &call.method_name);
                state.push("methodType", call.method_type.as_str());
                state.push(
                    "params",
                    serde_json::to_string(&call.params).unwrap_or_else(|_| "[]".to_string()),
                );
                if let Some(gas_limit) = call.gas_limit {
                    state.push("gasLimit", gas_limit.to_string());
                }
                if let Some(gas_price) = call.gas_price {
                    state.push("gasPrice", gas_price.to_string());
                }
                if let Some(value) = &call.value {
                    state.push("value", value);
                }
                if let Some(description) = &call.description {
                    state.push("description", description);
                }
            }
            RequestPayload::SignMessage(sign) => {
                state.push("message", &sign.message);
            }
            RequestPayload::Balance(_) | RequestPayload::Disconnect(_) => {}
        }
        state
    }

    fn push(&mut self, key: &str, value: impl Into<String>) {
        self.params.push((key.to_string(), value.into()));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    pub fn to_query(&self) -> String {
        self.params
            .iter()
            .map(|(key, value)| format!("{}={}", urlencoding::encode(key), urlencoding::encode(value)))
            .collect::<Vec<_>>()
            .join("&")
    }

    pub fn from_query(query: &str) -> Result<Self, WalletError> {
        let mut state = Self::default();
        for pair in query.trim_start_matches('?').split('&').filter(|pair| !pair.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            state.push(&decode_component(key)?, decode_component(value)?);
        }
        Ok(state)
    }

    /// Attaches the parameter set to the surface's base address.
    pub fn to_url(&self, base: &str) -> Result<Url, WalletError> {
        let mut url = Url::parse(base).map_err(|err| {
            WalletError::unknown(format!("invalid approval surface url '{base}': {err}"))
        })?;
        url.set_query(Some(&self.to_query()));
        Ok(url)
    }
}

fn decode_component(raw: &str) -> Result<String, WalletError> {
    urlencoding::decode(raw)
        .map(Cow::into_owned)
        .map_err(|err| WalletError::invalid_request(format!("invalid surface parameter: {err}")))
}

fn action_name(payload: &RequestPayload) -> &'static str {
    match payload {
        RequestPayload::Connect(_) => "connect",
        RequestPayload::Transaction(_) => "transaction",
        RequestPayload::ContractCall(_) => "contractCall",
        RequestPayload::Balance(_) => "balance",
        RequestPayload::SignMessage(_) => "signMessage",
        RequestPayload::Disconnect(_) => "disconnect",
    }
}
