use bytes::Bytes;

use super::PortalApi;
use crate::error::Result;
use crate::http_client::PendingRequest;
use crate::models::FileUpload;

impl PortalApi {
    /// Files uploaded by the current user
    pub async fn list_files(&self) -> Result<Vec<FileUpload>> {
        self.client.get("/files/").await
    }

    /// Upload a file with an optional description
    pub async fn upload_file(
        &self,
        file_name: &str,
        data: impl Into<Bytes>,
        description: Option<&str>,
    ) -> Result<FileUpload> {
        tracing::info!(file_name = file_name, "Uploading file");

        let request = PendingRequest::post("/files/")
            .file_field("file", file_name, guess_content_type(file_name), data)
            .text_field("description", description.unwrap_or_default());

        self.client.send_json(request).await
    }

    /// A single file by id
    pub async fn get_file(&self, id: i64) -> Result<FileUpload> {
        self.client.get(&format!("/files/{}/", id)).await
    }

    /// Delete a file by id
    pub async fn delete_file(&self, id: i64) -> Result<()> {
        tracing::info!(id = id, "Deleting file");
        self.client.delete(&format!("/files/{}/", id)).await
    }
}

/// Content type for common upload extensions
pub fn guess_content_type(file_name: &str) -> Option<String> {
    let (_, extension) = file_name.rsplit_once('.')?;
    let mime = match extension.to_lowercase().as_str() {
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "txt" => "text/plain",
        "csv" => "text/csv",
        "json" => "application/json",
        "zip" => "application/zip",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        _ => return None,
    };
    Some(mime.to_string())
}
