//! Content enrichment: fetch recipe details from the backend and render the
//! Telegram MarkdownV2 notification body.
use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use std::fmt;
use std::time::Duration;
use teloxide::utils::markdown;
use thiserror::Error;
use tracing::debug;

use crate::config::Config;
use crate::content::model::{Recipe, RecipeResponse};

pub mod model;

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("content service unreachable: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("content service timed out")]
    Timeout,
    #[error("content service returned status {0}")]
    Status(u16),
    #[error("invalid content payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("content has no title")]
    Empty,
}

impl From<reqwest::Error> for EnrichError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            EnrichError::Timeout
        } else {
            EnrichError::Transport(err)
        }
    }
}

/// Produces the rendered notification body for a piece of content.
#[async_trait]
pub trait ContentService: Send + Sync {
    async fn fetch(&self, content_id: i64) -> Result<String, EnrichError>;
}

#[derive(Clone)]
pub struct ContentClient {
    http: Client,
    base_url: String,
    public_url: String,
    timeout: Duration,
}

impl fmt::Debug for ContentClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentClient")
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ContentClient {
    pub fn new(base_url: &str, public_url: &str, timeout: Duration) -> reqwest::Result<Self> {
        let http = Client::builder()
            .user_agent("tg-recipe-relay/0.1")
            .no_proxy()
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            public_url: public_url.to_string(),
            timeout,
        })
    }

    pub fn from_config(cfg: &Config) -> reqwest::Result<Self> {
        Self::new(
            &cfg.content.base_url,
            &cfg.content.public_url,
            cfg.content.timeout(),
        )
    }

    pub fn build_request(&self, content_id: i64) -> reqwest::Result<reqwest::Request> {
        self.http
            .get(format!("{}/recipe/{}", self.base_url, content_id))
            .header(header::ACCEPT, "application/json")
            .build()
    }

    async fn fetch_recipe(&self, content_id: i64) -> Result<Recipe, EnrichError> {
        let request = self.build_request(content_id)?;
        debug!(url = %request.url(), content_id, "fetching recipe");
        let res = self.http.execute(request).await?;
        let status = res.status();
        let body = res.text().await?;
        parse_recipe(status, &body)
    }
}

#[async_trait]
impl ContentService for ContentClient {
    async fn fetch(&self, content_id: i64) -> Result<String, EnrichError> {
        let recipe = tokio::time::timeout(self.timeout, self.fetch_recipe(content_id))
            .await
            .map_err(|_| EnrichError::Timeout)??;
        Ok(render_recipe(
            &recipe,
            &public_link(&self.public_url, content_id),
        ))
    }
}

/// Turn a raw backend response into recipe details. Non-200 is a failure; a
/// recipe without a title counts as empty.
pub fn parse_recipe(status: StatusCode, body: &str) -> Result<Recipe, EnrichError> {
    if status != StatusCode::OK {
        return Err(EnrichError::Status(status.as_u16()));
    }
    let payload: RecipeResponse = serde_json::from_str(body)?;
    let recipe = payload.info.recipe;
    if recipe.title.trim().is_empty() {
        return Err(EnrichError::Empty);
    }
    Ok(recipe)
}

/// Public page for a recipe: `{id}` in the template is replaced, otherwise the
/// id is appended.
pub fn public_link(template: &str, content_id: i64) -> String {
    if template.contains("{id}") {
        template.replace("{id}", &content_id.to_string())
    } else {
        format!("{}{}", template, content_id)
    }
}

/// MarkdownV2 body. Every interpolated field goes through [`escape_text`].
pub fn render_recipe(recipe: &Recipe, link: &str) -> String {
    let mut body = format!(
        "*New recipe\\!*\n\n*Title:* {}\n*About:* {}\n",
        escape_text(recipe.title.trim()),
        escape_text(recipe.about.trim()),
    );
    if let Some(author) = recipe.author.as_ref().filter(|a| !a.login.is_empty()) {
        body.push_str(&format!("*Author:* {}\n", escape_text(&author.login)));
    }
    body.push_str(&format!("_{}_", markdown::link(link, "Read more")));
    body
}

/// `markdown::escape` leaves `\` alone, so backslashes are doubled first.
fn escape_text(text: &str) -> String {
    markdown::escape(&text.replace('\\', r"\\"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::model::Author;

    fn sample_body(title: &str) -> String {
        serde_json::json!({
            "info": {
                "recipe": {
                    "id": 42,
                    "title": title,
                    "about": "Beet soup (classic).",
                    "author": { "login": "chef_anna" }
                },
                "likes_count": 3
            }
        })
        .to_string()
    }

    #[test]
    fn parse_recipe_ok() {
        let recipe = parse_recipe(StatusCode::OK, &sample_body("Borscht")).unwrap();
        assert_eq!(recipe.title, "Borscht");
        assert_eq!(recipe.author.unwrap().login, "chef_anna");
    }

    #[test]
    fn parse_recipe_non_200_is_status_error() {
        let err = parse_recipe(StatusCode::INTERNAL_SERVER_ERROR, "oops").unwrap_err();
        assert!(matches!(err, EnrichError::Status(500)));
        let err = parse_recipe(StatusCode::NOT_FOUND, &sample_body("x")).unwrap_err();
        assert!(matches!(err, EnrichError::Status(404)));
    }

    #[test]
    fn parse_recipe_distinguishes_empty_from_malformed() {
        let err = parse_recipe(StatusCode::OK, &sample_body("  ")).unwrap_err();
        assert!(matches!(err, EnrichError::Empty));
        let err = parse_recipe(StatusCode::OK, r#"{"info":{}}"#).unwrap_err();
        assert!(matches!(err, EnrichError::Decode(_)));
        let err = parse_recipe(StatusCode::OK, "not json").unwrap_err();
        assert!(matches!(err, EnrichError::Decode(_)));
    }

    #[test]
    fn public_link_template() {
        assert_eq!(
            public_link("https://site/recipe/{id}/view", 42),
            "https://site/recipe/42/view"
        );
        assert_eq!(public_link("https://site/recipe/", 42), "https://site/recipe/42");
    }

    #[test]
    fn render_escapes_interpolated_fields() {
        let recipe = Recipe {
            title: "Spicy! Soup".into(),
            about: "Hot (very) - 10 min.".into(),
            author: Some(Author {
                login: "chef_anna".into(),
            }),
        };
        let body = render_recipe(&recipe, "https://site/recipe/42");
        assert!(body.starts_with("*New recipe\\!*\n\n"));
        assert!(body.contains("*Title:* Spicy\\! Soup\n"));
        assert!(body.contains("*About:* Hot \\(very\\) \\- 10 min\\.\n"));
        assert!(body.contains("*Author:* chef\\_anna\n"));
        assert!(body.contains("[Read more](https://site/recipe/42)"));
    }

    #[test]
    fn render_escapes_backslashes_before_reserved_chars() {
        let recipe = Recipe {
            title: r"Hot\*Soup".into(),
            about: r"C:\dir".into(),
            author: Some(Author {
                login: r"a\_b".into(),
            }),
        };
        let body = render_recipe(&recipe, "https://site/recipe/1");
        assert!(body.contains(r"*Title:* Hot\\\*Soup"));
        assert!(body.contains(r"*About:* C:\\dir"));
        assert!(body.contains(r"*Author:* a\\\_b"));
    }

    #[test]
    fn render_skips_missing_author() {
        let recipe = Recipe {
            title: "Borscht".into(),
            ..Default::default()
        };
        let body = render_recipe(&recipe, "https://site/recipe/1");
        assert!(body.contains("Borscht"));
        assert!(!body.contains("*Author:*"));
    }

    #[test]
    fn build_request_targets_recipe_endpoint() {
        let client = ContentClient::new(
            "http://backend:8080/api/v1/",
            "https://site/recipe/",
            Duration::from_secs(1),
        )
        .unwrap();
        let request = client.build_request(42).unwrap();
        assert_eq!(request.method(), reqwest::Method::GET);
        assert_eq!(request.url().as_str(), "http://backend:8080/api/v1/recipe/42");
        assert_eq!(
            request
                .headers()
                .get("Accept")
                .and_then(|h| h.to_str().ok())
                .unwrap(),
            "application/json"
        );
    }

    #[tokio::test]
    async fn fetch_times_out_on_silent_service() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // accept and never answer
            let (_socket, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });
        let client = ContentClient::new(
            &format!("http://{}", addr),
            "https://site/recipe/",
            Duration::from_millis(200),
        )
        .unwrap();
        let err = client.fetch(42).await.unwrap_err();
        assert!(matches!(err, EnrichError::Timeout));
    }

    #[tokio::test]
    async fn fetch_unreachable_service_is_error() {
        // port 9 (discard) on localhost is closed in test environments
        let client = ContentClient::new(
            "http://127.0.0.1:9",
            "https://site/recipe/",
            Duration::from_secs(2),
        )
        .unwrap();
        let err = client.fetch(42).await.unwrap_err();
        assert!(matches!(
            err,
            EnrichError::Transport(_) | EnrichError::Timeout
        ));
    }
}
