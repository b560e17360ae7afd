//! Control-plane wire format.
//!
//! One JSON object per line in each direction. Requests carry an `op` tag;
//! responses are either `{"status":"ok", ...}` with an optional body or
//! `{"status":"error","message":...}`.

use serde::{Deserialize, Serialize};

use crate::dialer::DialerInfo;
use crate::proxy::{ProxyInfo, ProxyKind};
use crate::rules::RuleInfo;
use crate::ssh::{ConnectStatus, SshKeyInfo};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Health,
    Status,
    Stop,
    AddSshKey {
        encoded_key: String,
        #[serde(default)]
        passphrase: Option<String>,
    },
    ListKeys,
    StartProxy {
        kind: ProxyKind,
        #[serde(default)]
        params: String,
    },
    ListProxies,
    AddDialer {
        #[serde(default)]
        name: Option<String>,
        uri: String,
    },
    ListDialers,
    Connect {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        passphrase: Option<String>,
    },
    AddRule {
        cidr: String,
        #[serde(default)]
        dialer: String,
    },
    ListRules,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<ResponseBody>,
    },
    Error { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponseBody {
    Health {
        healthy: bool,
    },
    Status {
        healthy: bool,
        proxies: Vec<ProxyInfo>,
    },
    Keys {
        keys: Vec<SshKeyInfo>,
    },
    Proxy {
        proxy: ProxyInfo,
    },
    Proxies {
        proxies: Vec<ProxyInfo>,
    },
    Dialers {
        dialers: Vec<DialerInfo>,
    },
    Connect(ConnectProgress),
    Rules {
        rules: Vec<RuleInfo>,
    },
}

/// One step of the interactive connect cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectProgress {
    /// Opaque session id; send it back on the next poll.
    pub id: String,
    pub status: ConnectStatus,
    /// Messages appended since the previous poll.
    pub messages: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_round_trip() {
        let request = Request::Connect {
            id: Some("abc".to_string()),
            passphrase: None,
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"op\":\"connect\""));
        let back: Request = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, Request::Connect { id: Some(id), .. } if id == "abc"));
    }

    #[test]
    fn minimal_request_accepts_defaults() {
        let back: Request = serde_json::from_str(r#"{"op":"connect"}"#).unwrap();
        assert!(matches!(
            back,
            Request::Connect {
                id: None,
                passphrase: None
            }
        ));
    }

    #[test]
    fn responses_round_trip() {
        let response = Response::Ok {
            body: Some(ResponseBody::Connect(ConnectProgress {
                id: "xyz".to_string(),
                status: ConnectStatus::NeedPassphrase,
                messages: vec!["Trying".to_string()],
            })),
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("need_passphrase"));
        let back: Response = serde_json::from_str(&json).unwrap();
        assert!(matches!(
            back,
            Response::Ok {
                body: Some(ResponseBody::Connect(progress))
            } if progress.id == "xyz"
        ));
    }

    #[test]
    fn errors_round_trip() {
        let json = serde_json::to_string(&Response::Error {
            message: "boom".to_string(),
        })
        .unwrap();
        let back: Response = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, Response::Error { message } if message == "boom"));
    }
}
