//! Best-effort JSON-RPC envelope parsing, used only to tag log entries.

use serde::Deserialize;
use serde::de::IgnoredAny;

/// JSON-RPC request envelope. `params` and `id` are never interpreted.
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<IgnoredAny>,
    #[serde(default)]
    pub id: Option<IgnoredAny>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Envelope {
    Single(JsonRpcRequest),
    Batch(Vec<JsonRpcRequest>),
}

/// Returns the `method` of a JSON-RPC request, or an empty string when the
/// payload is not one. Batches yield their methods joined by `,`.
pub fn extract_method(body: &[u8]) -> String {
    match serde_json::from_slice::<Envelope>(body) {
        Ok(Envelope::Single(req)) => req.method.unwrap_or_default(),
        Ok(Envelope::Batch(reqs)) => reqs
            .into_iter()
            .filter_map(|r| r.method)
            .collect::<Vec<_>>()
            .join(","),
        Err(_) => String::new(),
    }
}
