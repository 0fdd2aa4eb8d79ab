//! Marshal/unmarshal functions used by the object layer.
//!
//! Values travel through [`serde_json::Value`] on their way to and from
//! bytes, so a codec only has to deal with one structured type. The default
//! pair writes and reads JSON text.

use std::sync::Arc;

use serde_json::Value;

use crate::error::BoxError;

/// Turns a structured value into stored bytes
pub type MarshalFn = Arc<dyn Fn(&Value) -> Result<Vec<u8>, BoxError> + Send + Sync>;

/// Turns stored bytes back into a structured value
pub type UnmarshalFn = Arc<dyn Fn(&[u8]) -> Result<Value, BoxError> + Send + Sync>;

pub fn json_marshal() -> MarshalFn {
    Arc::new(|value: &Value| serde_json::to_vec(value).map_err(BoxError::from))
}

pub fn json_unmarshal() -> UnmarshalFn {
    Arc::new(|bytes: &[u8]| serde_json::from_slice(bytes).map_err(BoxError::from))
}

#[derive(Clone)]
pub(crate) struct Codec {
    pub(crate) marshal: MarshalFn,
    pub(crate) unmarshal: UnmarshalFn,
}

impl Default for Codec {
    fn default() -> Self {
        Self {
            marshal: json_marshal(),
            unmarshal: json_unmarshal(),
        }
    }
}
