use super::PortalApi;
use crate::error::Result;
use crate::models::DashboardStats;

impl PortalApi {
    /// Upload statistics across all users
    pub async fn dashboard(&self) -> Result<DashboardStats> {
        self.client.get("/dashboard/").await
    }
}
