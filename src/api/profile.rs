use serde_json::json;

use super::PortalApi;
use crate::error::Result;
use crate::models::{
    Address, AddressPatch, NewAddress, PhoneUpdated, UserProfile, UsernameUpdated,
};

impl PortalApi {
    /// The logged-in user's profile, including saved addresses
    pub async fn profile(&self) -> Result<UserProfile> {
        self.client.get("/profile/").await
    }

    pub async fn update_username(&self, username: &str) -> Result<UsernameUpdated> {
        self.client
            .patch_json("/profile/update-username/", &json!({ "username": username }))
            .await
    }

    pub async fn update_phone(&self, phone_number: &str) -> Result<PhoneUpdated> {
        self.client
            .patch_json("/profile/update-phone/", &json!({ "phone_number": phone_number }))
            .await
    }

    pub async fn list_addresses(&self) -> Result<Vec<Address>> {
        self.client.get("/profile/addresses/").await
    }

    pub async fn add_address(&self, address: &NewAddress) -> Result<Address> {
        self.client
            .post_json("/profile/addresses/add/", address)
            .await
    }

    /// Partially update an address
    pub async fn update_address(&self, id: i64, patch: &AddressPatch) -> Result<Address> {
        self.client
            .patch_json(&format!("/profile/addresses/update/{}/", id), patch)
            .await
    }

    pub async fn delete_address(&self, id: i64) -> Result<()> {
        self.client
            .delete(&format!("/profile/addresses/delete/{}/", id))
            .await
    }
}
