//! PoE record construction and wire encoding

use serde::{Deserialize, Serialize};

use crate::error::EmitError;

/// Service and workload identity stamped onto every record
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Identity {
    pub service_name: String,
    pub service_namespace: Option<String>,
    pub pod_name: Option<String>,
    pub pod_uid: Option<String>,
    pub image_digest: Option<String>,
    pub code_version: Option<String>,
    pub code_hash: Option<String>,
}

impl Default for Identity {
    fn default() -> Self {
        Self {
            service_name: "service".to_string(),
            service_namespace: None,
            pod_name: None,
            pod_uid: None,
            image_digest: None,
            code_version: None,
            code_hash: None,
        }
    }
}

impl Identity {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Self::default()
        }
    }
}

/// Field naming used on the wire
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldCase {
    /// `serviceName`, `reqId`, ...
    #[default]
    Camel,
    /// `service_name`, `req_id`, ...
    Snake,
}

/// A single proof-of-execution record
///
/// Absent identity fields serialize as explicit `null`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoeRecord {
    pub service_name: String,
    pub service_namespace: Option<String>,
    pub pod_name: Option<String>,
    pub pod_uid: Option<String>,
    pub image_digest: Option<String>,
    pub code_version: Option<String>,
    pub code_hash: Option<String>,
    pub req_id: String,
    pub input: String,
    pub output: String,
}

#[derive(Serialize)]
struct SnakeRecord<'a> {
    service_name: &'a str,
    service_namespace: Option<&'a str>,
    pod_name: Option<&'a str>,
    pod_uid: Option<&'a str>,
    image_digest: Option<&'a str>,
    code_version: Option<&'a str>,
    code_hash: Option<&'a str>,
    req_id: &'a str,
    input: &'a str,
    output: &'a str,
}

impl PoeRecord {
    /// Encode the record as the UTF-8 JSON body sent to the sidecar
    pub fn to_wire(&self, case: FieldCase) -> Result<Vec<u8>, EmitError> {
        let encoded = match case {
            FieldCase::Camel => serde_json::to_vec(self),
            FieldCase::Snake => serde_json::to_vec(&SnakeRecord {
                service_name: &self.service_name,
                service_namespace: self.service_namespace.as_deref(),
                pod_name: self.pod_name.as_deref(),
                pod_uid: self.pod_uid.as_deref(),
                image_digest: self.image_digest.as_deref(),
                code_version: self.code_version.as_deref(),
                code_hash: self.code_hash.as_deref(),
                req_id: &self.req_id,
                input: &self.input,
                output: &self.output,
            }),
        };
        encoded.map_err(|source| EmitError::Serialization { field: "record", source })
    }
}

/// Build a record from a request id, the operation's input and output, and identity.
///
/// `input` and `output` are encoded independently; if either fails nothing is built.
pub fn build<I, O>(req_id: &str, input: &I, output: &O, identity: &Identity) -> Result<PoeRecord, EmitError>
where
    I: Serialize + ?Sized,
    O: Serialize + ?Sized,
{
    let input = serde_json::to_string(input).map_err(|source| EmitError::Serialization { field: "input", source })?;
    let output =
        serde_json::to_string(output).map_err(|source| EmitError::Serialization { field: "output", source })?;

    Ok(PoeRecord {
        service_name: identity.service_name.clone(),
        service_namespace: identity.service_namespace.clone(),
        pod_name: identity.pod_name.clone(),
        pod_uid: identity.pod_uid.clone(),
        image_digest: identity.image_digest.clone(),
        code_version: identity.code_version.clone(),
        code_hash: identity.code_hash.clone(),
        req_id: req_id.to_string(),
        input,
        output,
    })
}
