use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Aggregate upload statistics from `GET /dashboard/`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DashboardStats {
    pub total_files: u64,
    /// Upload count per file extension
    #[serde(default)]
    pub file_types: HashMap<String, u64>,
    /// Upload count per username
    #[serde(default)]
    pub users_file_count: HashMap<String, u64>,
}
