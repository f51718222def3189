use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("malformed request: {0}")]
    Json(#[from] serde_json::Error),
    #[error("request names neither a path nor stats")]
    Empty,
}

/// JSON object exchanged on the wire.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tarinfo: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stats: Option<bool>,
}

/// A single client request. Only one is in flight per connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Fetch the decoded sweep at `path`. `tarinfo` is passed to the decoder untouched.
    Sweep {
        path: String,
        tarinfo: Option<Value>,
    },
    /// Ask for the cache diagnostics string.
    Stats,
}

impl Request {
    pub fn sweep(path: impl Into<String>, tarinfo: Option<Value>) -> Self {
        Request::Sweep {
            path: path.into(),
            tarinfo,
        }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, RequestError> {
        let envelope: Envelope = serde_json::from_slice(bytes)?;

        if envelope.stats == Some(true) {
            return Ok(Request::Stats);
        }
        match envelope.path {
            Some(path) => Ok(Request::Sweep {
                path,
                tarinfo: envelope.tarinfo.filter(|info| !info.is_null()),
            }),
            None => Err(RequestError::Empty),
        }
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, RequestError> {
        let envelope = match self {
            Request::Sweep { path, tarinfo } => Envelope {
                path: Some(path.clone()),
                tarinfo: tarinfo.clone(),
                stats: None,
            },
            Request::Stats => Envelope {
                stats: Some(true),
                ..Default::default()
            },
        };
        Ok(serde_json::to_vec(&envelope)?)
    }
}

/// Cache key for a sweep path: everything after the last `/`.
///
/// No normalisation happens, so `"/mnt/data/"` keys as `""` and `"a/.."` as `".."`.
pub fn cache_key(path: &str) -> &str {
    match path.rfind('/') {
        Some(slash) => &path[slash + 1..],
        None => path,
    }
}
