use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Raw stored setting. JSON-valued keys keep their serialized text in `value`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Setting {
    pub key: String,
    pub value: String,
}
