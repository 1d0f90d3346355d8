use std::time::Duration;

use crate::protocol::{MethodType, RequestKind, RequestPayload};

pub const DEFAULT_SHORT_WINDOW: Duration = Duration::from_secs(60);
pub const DEFAULT_LONG_WINDOW: Duration = Duration::from_secs(300);

/// How long a request may stay without a terminal signal before it is failed with a
/// timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub connect: Duration,
    pub transaction: Duration,
    pub contract_view: Duration,
    pub contract_call: Duration,
    pub balance: Duration,
    pub sign_message: Duration,
    pub disconnect: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            connect: DEFAULT_SHORT_WINDOW,
            transaction: DEFAULT_LONG_WINDOW,
            contract_view: DEFAULT_SHORT_WINDOW,
            contract_call: DEFAULT_LONG_WINDOW,
            balance: DEFAULT_SHORT_WINDOW,
            sign_message: DEFAULT_SHORT_WINDOW,
            disconnect: DEFAULT_SHORT_WINDOW,
        }
    }
}

impl TimeoutPolicy {
    pub fn window(&self, payload: &RequestPayload) -> Duration {
        match payload {
            RequestPayload::ContractCall(call) => match call.method_type {
                MethodType::View => self.contract_view,
                MethodType::Call => self.contract_call,
            },
            other => self.window_for_kind(other.kind()),
        }
    }

    /// Window for a kind; contract calls of unknown method type get the longer call window.
    pub fn window_for_kind(&self, kind: RequestKind) -> Duration {
        match kind {
            RequestKind::Connect => self.connect,
            RequestKind::Transaction => self.transaction,
            RequestKind::ContractCall => self.contract_call,
            RequestKind::Balance => self.balance,
            RequestKind::SignMessage => self.sign_message,
            RequestKind::Disconnect => self.disconnect,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn default_windows_follow_request_kind() {
        let policy = TimeoutPolicy::default();
        let view = RequestPayload::from_data(
            RequestKind::ContractCall,
            json!({ "contractAddress": "c", "methodName": "m", "methodType": "view" }),
        )
        .expect("view");
        let call = RequestPayload::from_data(
            RequestKind::ContractCall,
            json!({ "contractAddress": "c", "methodName": "m", "methodType": "call" }),
        )
        .expect("call");
        let tx = RequestPayload::from_data(
            RequestKind::Transaction,
            json!({ "to": "oct1xyz", "amount": "10" }),
        )
        .expect("tx");

        assert_eq!(policy.window(&view), Duration::from_secs(60));
        assert_eq!(policy.window(&call), Duration::from_secs(300));
        assert_eq!(policy.window(&tx), Duration::from_secs(300));
        assert_eq!(policy.window_for_kind(RequestKind::Connect), Duration::from_secs(60));
        assert_eq!(policy.window_for_kind(RequestKind::SignMessage), Duration::from_secs(60));
        assert_eq!(policy.window_for_kind(RequestKind::Balance), Duration::from_secs(60));
    }
}
