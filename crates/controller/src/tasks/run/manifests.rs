//! Operator supplied manifests for run namespace objects
//!
//! Manifests are decoded generically first so that their group and kind can
//! be checked before converting to the typed object. Whatever metadata the
//! manifest carries is dropped and replaced by controller owned metadata.

use crate::tasks::types::RunOwner;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::DynamicObject;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

/// NetworkPolicy isolating every pod in the run namespace
pub const DENY_ALL_NETWORK_POLICY: &str = r#"
apiVersion: networking.k8s.io/v1
kind: NetworkPolicy
metadata:
  name: deny-all
spec:
  podSelector: {}
  policyTypes:
    - Ingress
    - Egress
"#;

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("failed to decode {expected} manifest: {source}")]
    Decode {
        expected: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("manifest has no apiVersion or kind, expected {expected}")]
    MissingType { expected: String },

    #[error("manifest is a {actual}, expected {expected}")]
    UnexpectedKind { expected: String, actual: String },

    #[error("invalid {expected} manifest: {source}")]
    Convert {
        expected: String,
        #[source]
        source: serde_json::Error,
    },
}

fn group_of(api_version: &str) -> &str {
    api_version
        .rsplit_once('/')
        .map(|(group, _)| group)
        .unwrap_or_default()
}

fn qualified_kind<K: Resource<DynamicType = ()>>() -> String {
    let group = K::group(&());
    let kind = K::kind(&());
    if group.is_empty() {
        kind.to_string()
    } else {
        format!("{kind}.{group}")
    }
}

/// Decodes `manifest` into a `K` with fresh metadata: a generated name with
/// the given prefix, the target namespace and the labels and annotations of
/// `owner`.
pub fn decode<K>(
    manifest: &str,
    namespace: &str,
    generate_name: &str,
    owner: &RunOwner,
) -> Result<K, ManifestError>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    let expected = qualified_kind::<K>();

    let object: DynamicObject =
        serde_yaml::from_str(manifest).map_err(|source| ManifestError::Decode {
            expected: expected.clone(),
            source,
        })?;
    let types = object
        .types
        .filter(|types| !types.api_version.is_empty() && !types.kind.is_empty())
        .ok_or_else(|| ManifestError::MissingType {
            expected: expected.clone(),
        })?;

    if group_of(&types.api_version) != K::group(&()) || types.kind != K::kind(&()) {
        let group = group_of(&types.api_version);
        let actual = if group.is_empty() {
            types.kind.clone()
        } else {
            format!("{}.{group}", types.kind)
        };
        return Err(ManifestError::UnexpectedKind { expected, actual });
    }

    let metadata = ObjectMeta {
        generate_name: Some(generate_name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(owner.labels()),
        annotations: Some(owner.annotations()),
        ..Default::default()
    };

    let mut fields = match object.data {
        Value::Object(fields) => fields,
        _ => Map::new(),
    };
    fields.insert(
        "apiVersion".to_string(),
        Value::String(K::api_version(&()).into_owned()),
    );
    fields.insert("kind".to_string(), Value::String(K::kind(&()).into_owned()));
    fields.insert(
        "metadata".to_string(),
        serde_json::to_value(metadata).map_err(|source| ManifestError::Convert {
            expected: expected.clone(),
            source,
        })?,
    );

    serde_json::from_value(Value::Object(fields))
        .map_err(|source| ManifestError::Convert { expected, source })
}
