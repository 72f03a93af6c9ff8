use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A file uploaded by the authenticated user
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileUpload {
    pub id: i64,
    pub user: i64,
    /// Storage path or URL of the file as reported by the backend
    pub file: String,
    pub upload_date: DateTime<Utc>,
    #[serde(default)]
    pub description: Option<String>,
    /// Extension derived by the backend from the uploaded name
    pub file_type: String,
    #[serde(default)]
    pub file_url: Option<String>,
}

impl FileUpload {
    /// File name without the storage directory
    pub fn display_name(&self) -> &str {
        self.file.rsplit('/').next().unwrap_or(&self.file)
    }
}
