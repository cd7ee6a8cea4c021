use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VpsInstance {
    pub id: i64,
    pub user_id: i64,
    pub order_item_id: i64,
    pub automation_instance_id: String,
    pub name: String,
    pub region: String,
    pub package_id: i64,
    pub goods_type_id: i64,
    pub cpu: i32,
    pub memory_gb: i32,
    pub disk_gb: i32,
    pub bandwidth_mbps: i32,
    pub status: String,
    pub admin_status: String,
    pub expire_at: Option<DateTime<Utc>>,
    pub last_emergency_renew_at: Option<DateTime<Utc>>,
    pub spec: Value,
}

impl VpsInstance {
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.admin_status.eq_ignore_ascii_case("locked")
    }
}
