//! Value encoding.
//!
//! Domain types are JSON. Raw byte vectors pass through untouched, so the
//! ZooKeeper mirror can store node data verbatim.

use crate::error::StoreResult;

/// Encode/decode a stored value. Implemented per entity type.
pub trait Codec: Sized + Send + Sync + 'static {
    fn encode(&self) -> StoreResult<Vec<u8>>;
    fn decode(bytes: &[u8]) -> StoreResult<Self>;
}

impl Codec for Vec<u8> {
    fn encode(&self) -> StoreResult<Vec<u8>> {
        Ok(self.clone())
    }

    fn decode(bytes: &[u8]) -> StoreResult<Self> {
        Ok(bytes.to_vec())
    }
}

/// Implement [`Codec`] as JSON for one or more serde types.
#[macro_export]
macro_rules! json_codec {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl $crate::Codec for $ty {
                fn encode(&self) -> $crate::StoreResult<Vec<u8>> {
                    $crate::__serde_json::to_vec(self)
                        .map_err(|e| $crate::StoreError::Serialize(e.to_string()))
                }

                fn decode(bytes: &[u8]) -> $crate::StoreResult<Self> {
                    $crate::__serde_json::from_slice(bytes)
                        .map_err(|e| $crate::StoreError::Deserialize(e.to_string()))
                }
            }
        )+
    };
}

json_codec!(
    fleet_core::DeployConfig,
    fleet_core::DeploySpec,
    fleet_core::Instance,
    fleet_core::HostInfo,
    fleet_core::HostStatus,
    fleet_core::HostConfig,
    fleet_core::VersionInfo,
    serde_json::Value,
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StoreError;
    use fleet_core::DeploySpec;

    #[test]
    fn bytes_pass_through() {
        let raw = vec![0u8, 159, 146, 150];
        assert_eq!(raw.encode().unwrap(), raw);
        assert_eq!(Vec::<u8>::decode(&raw).unwrap(), raw);
    }

    #[test]
    fn json_types_decode_errors_are_tagged() {
        let err = DeploySpec::decode(b"not json").unwrap_err();
        assert!(matches!(err, StoreError::Deserialize(_)));
        let spec = DeploySpec::single("v1.0.0", 2);
        assert_eq!(DeploySpec::decode(&spec.encode().unwrap()).unwrap(), spec);
    }
}
