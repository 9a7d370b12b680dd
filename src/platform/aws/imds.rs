use anyhow::{Result, anyhow};
use aws_config::imds::client::error::{ErrorResponse, ImdsError};

/// Instance metadata service lookups. `Ok(None)` means the path is not
/// present for this instance.
#[allow(async_fn_in_trait)]
pub trait Imds {
    async fn get_metadata(&self, key: &str) -> Result<Option<String>>;
    async fn get_user_data(&self) -> Result<Option<Vec<u8>>>;
}

#[derive(Clone, Debug)]
pub struct ImdsClient {
    client: aws_config::imds::Client,
}

impl ImdsClient {
    pub fn new(client: aws_config::imds::Client) -> Self {
        Self { client }
    }

    async fn get(&self, path: &str) -> Result<Option<String>> {
        match self.client.get(path).await {
            Ok(resp) => Ok(Some(resp.into())),
            Err(ImdsError::ErrorResponse(e)) if is_not_found(&e) => Ok(None),
            Err(e) => Err(anyhow!("failed to get {} from IMDS: {}", path, e)),
        }
    }
}

impl Default for ImdsClient {
    fn default() -> Self {
        Self::new(aws_config::imds::Client::builder().build())
    }
}

impl Imds for ImdsClient {
    async fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        self.get(&format!("/latest/meta-data/{}", key)).await
    }

    async fn get_user_data(&self) -> Result<Option<Vec<u8>>> {
        Ok(self
            .get("/latest/user-data")
            .await?
            .map(String::into_bytes))
    }
}

fn is_not_found(error: &ErrorResponse) -> bool {
    error.response().status().as_u16() == 404
}
