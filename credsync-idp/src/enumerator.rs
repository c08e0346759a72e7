use std::time::Duration;

use reqwest::{Client, StatusCode};
use tracing::warn;

use crate::error::IdpError;
use crate::user::IdpUser;

const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];

/// Paginates the IdP's user population. Not restartable mid-iteration: a
/// failed enumeration after the retry budget discards whatever pages
/// were already read, rather than emitting a partial sequence.
#[allow(async_fn_in_trait)]
pub trait UserEnumerator: Send + Sync {
    async fn fetch_all(&self) -> Result<Vec<IdpUser>, IdpError>;
}

/// `reqwest`-based enumerator against a Keycloak-shaped admin users
/// endpoint (`GET /admin/realms/{realm}/users?first=&max=`), the only
/// concrete IdP surface this crate targets; the IdP runtime itself is an
/// external collaborator, never embedded here.
pub struct KeycloakUserEnumerator {
    client: Client,
    base_url: String,
    realm: String,
    bearer_token: String,
    page_size: u32,
    service_prefixes: Vec<String>,
}

impl KeycloakUserEnumerator {
    pub fn new(
        client: Client,
        base_url: impl Into<String>,
        realm: impl Into<String>,
        bearer_token: impl Into<String>,
        page_size: u32,
        service_prefixes: Vec<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            realm: realm.into(),
            bearer_token: bearer_token.into(),
            page_size,
            service_prefixes,
        }
    }

    async fn fetch_page(&self, first: u32) -> Result<Vec<IdpUser>, IdpError> {
        let url = format!(
            "{}/admin/realms/{}/users?first={}&max={}",
            self.base_url, self.realm, first, self.page_size
        );

        let mut last_err = None;
        for (attempt, delay) in RETRY_DELAYS.iter().enumerate() {
            match self.try_fetch_page(&url).await {
                Ok(users) => return Ok(users),
                Err(err @ IdpError::Fatal(_)) => return Err(err),
                Err(err) => {
                    warn!(attempt = attempt + 1, %err, "idp page fetch failed, retrying");
                    last_err = Some(err);
                    tokio::time::sleep(*delay).await;
                }
            }
        }

        match self.try_fetch_page(&url).await {
            Ok(users) => Ok(users),
            Err(err) => Err(last_err.unwrap_or(err)),
        }
    }

    async fn try_fetch_page(&self, url: &str) -> Result<Vec<IdpUser>, IdpError> {
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.bearer_token)
            .send()
            .await
            .map_err(|err| IdpError::Unavailable(err.to_string()))?;

        match response.status() {
            status if status.is_success() => response
                .json::<Vec<IdpUser>>()
                .await
                .map_err(|err| IdpError::Unavailable(err.to_string())),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(IdpError::Fatal(format!("idp denied request: {status}")))
            }
            status => Err(IdpError::Unavailable(format!("idp returned {status}"))),
        }
    }
}

impl UserEnumerator for KeycloakUserEnumerator {
    async fn fetch_all(&self) -> Result<Vec<IdpUser>, IdpError> {
        let mut users = Vec::new();
        let mut first = 0u32;

        loop {
            let page = self.fetch_page(first).await?;
            let page_len = page.len() as u32;

            users.extend(
                page.into_iter()
                    .filter(|user| user.participates(&self.service_prefixes)),
            );

            if page_len < self.page_size {
                break;
            }
            first += self.page_size;
        }

        Ok(users)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn retry_delays_are_one_two_four_seconds() {
        assert_eq!(RETRY_DELAYS[0], Duration::from_secs(1));
        assert_eq!(RETRY_DELAYS[1], Duration::from_secs(2));
        assert_eq!(RETRY_DELAYS[2], Duration::from_secs(4));
    }
}
