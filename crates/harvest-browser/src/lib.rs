//! Browser automation capability: the trait the login flow and the extractor drive,
//! a per-call timeout wrapper, and a WebDriver-backed implementation.

use std::time::Duration;

use async_trait::async_trait;
use fantoccini::{Client, ClientBuilder, Locator};
use harvest_core::Cookie;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

/// WebDriver key code for Enter.
const ENTER_KEY: &str = "\u{e007}";

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("no element matches selector `{selector}`")]
    ElementNotFound { selector: String },
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    #[error("script evaluation failed: {0}")]
    Script(String),
    #[error("browser driver error: {0}")]
    Driver(String),
}

/// One live browser context. Calls may be slow; wrap implementations in [`Bounded`].
///
/// `evaluate` takes a JavaScript *expression* and returns its JSON value.
#[async_trait]
pub trait Browser: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<(), BrowserError>;
    async fn evaluate(&self, script: &str) -> Result<JsonValue, BrowserError>;
    async fn fill(&self, selector: &str, value: &str) -> Result<(), BrowserError>;
    async fn click(&self, selector: &str) -> Result<(), BrowserError>;
    async fn press_enter(&self, selector: &str) -> Result<(), BrowserError>;
    async fn current_url(&self) -> Result<String, BrowserError>;
    async fn cookies(&self) -> Result<Vec<Cookie>, BrowserError>;
    async fn set_cookies(&self, cookies: &[Cookie]) -> Result<(), BrowserError>;
}

/// Applies one timeout to every call on the wrapped browser.
pub struct Bounded<B> {
    inner: B,
    timeout: Duration,
}

impl<B: Browser> Bounded<B> {
    pub fn new(inner: B, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> Result<T, BrowserError>
    where
        F: std::future::Future<Output = Result<T, BrowserError>> + Send,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(BrowserError::Timeout {
                operation,
                after: self.timeout,
            }),
        }
    }
}

#[async_trait]
impl<B: Browser> Browser for Bounded<B> {
    async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        self.bounded("navigate", self.inner.navigate(url)).await
    }

    async fn evaluate(&self, script: &str) -> Result<JsonValue, BrowserError> {
        self.bounded("evaluate", self.inner.evaluate(script)).await
    }

    async fn fill(&self, selector: &str, value: &str) -> Result<(), BrowserError> {
        self.bounded("fill", self.inner.fill(selector, value)).await
    }

    async fn click(&self, selector: &str) -> Result<(), BrowserError> {
        self.bounded("click", self.inner.click(selector)).await
    }

    async fn press_enter(&self, selector: &str) -> Result<(), BrowserError> {
        self.bounded("press_enter", self.inner.press_enter(selector)).await
    }

    async fn current_url(&self) -> Result<String, BrowserError> {
        self.bounded("current_url", self.inner.current_url()).await
    }

    async fn cookies(&self) -> Result<Vec<Cookie>, BrowserError> {
        self.bounded("cookies", self.inner.cookies()).await
    }

    async fn set_cookies(&self, cookies: &[Cookie]) -> Result<(), BrowserError> {
        self.bounded("set_cookies", self.inner.set_cookies(cookies)).await
    }
}

/// Evaluates `script` and deserializes its result.
pub async fn evaluate_as<T: DeserializeOwned>(
    browser: &dyn Browser,
    script: &str,
) -> Result<T, BrowserError> {
    let value = browser.evaluate(script).await?;
    serde_json::from_value(value).map_err(|e| BrowserError::Script(e.to_string()))
}

pub async fn page_html(browser: &dyn Browser) -> Result<String, BrowserError> {
    evaluate_as(browser, "document.documentElement.outerHTML").await
}

/// Polls `document.readyState` until the page reports `complete`.
pub async fn wait_until_ready(
    browser: &dyn Browser,
    timeout: Duration,
    poll: Duration,
) -> Result<(), BrowserError> {
    let started = tokio::time::Instant::now();
    loop {
        let state: String = evaluate_as(browser, "document.readyState").await?;
        if state == "complete" {
            return Ok(());
        }
        if started.elapsed() >= timeout {
            return Err(BrowserError::Timeout {
                operation: "wait_until_ready",
                after: timeout,
            });
        }
        tokio::time::sleep(poll).await;
    }
}

#[derive(Debug, Clone)]
pub struct WebDriverConfig {
    pub webdriver_url: String,
    pub headless: bool,
}

impl Default for WebDriverConfig {
    fn default() -> Self {
        Self {
            webdriver_url: "http://localhost:9515".to_string(),
            headless: true,
        }
    }
}

/// [`Browser`] backed by a WebDriver session (chromedriver, geckodriver).
#[derive(Clone)]
pub struct WebDriverBrowser {
    client: Client,
}

fn driver_err(err: impl std::fmt::Display) -> BrowserError {
    BrowserError::Driver(err.to_string())
}

impl WebDriverBrowser {
    pub async fn connect(config: &WebDriverConfig) -> Result<Self, BrowserError> {
        let mut caps = serde_json::Map::new();
        if config.headless {
            caps.insert(
                "goog:chromeOptions".to_string(),
                serde_json::json!({
                    "args": ["--headless=new", "--disable-gpu", "--window-size=1400,1000"]
                }),
            );
            caps.insert(
                "moz:firefoxOptions".to_string(),
                serde_json::json!({ "args": ["-headless"] }),
            );
        }
        let client = ClientBuilder::rustls()
            .capabilities(caps)
            .connect(&config.webdriver_url)
            .await
            .map_err(driver_err)?;
        debug!(webdriver_url = %config.webdriver_url, "webdriver session opened");
        Ok(Self { client })
    }

    pub async fn close(self) -> Result<(), BrowserError> {
        self.client.close().await.map_err(driver_err)
    }

    async fn element(&self, selector: &str) -> Result<fantoccini::elements::Element, BrowserError> {
        self.client
            .find(Locator::Css(selector))
            .await
            .map_err(|_| BrowserError::ElementNotFound {
                selector: selector.to_string(),
            })
    }
}

#[async_trait]
impl Browser for WebDriverBrowser {
    async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        self.client.goto(url).await.map_err(driver_err)
    }

    async fn evaluate(&self, script: &str) -> Result<JsonValue, BrowserError> {
        let wrapped = format!("return ({script});");
        self.client
            .execute(&wrapped, Vec::new())
            .await
            .map_err(|e| BrowserError::Script(e.to_string()))
    }

    async fn fill(&self, selector: &str, value: &str) -> Result<(), BrowserError> {
        let element = self.element(selector).await?;
        element.clear().await.map_err(driver_err)?;
        element.send_keys(value).await.map_err(driver_err)
    }

    async fn click(&self, selector: &str) -> Result<(), BrowserError> {
        let element = self.element(selector).await?;
        element.click().await.map(|_| ()).map_err(driver_err)
    }

    async fn press_enter(&self, selector: &str) -> Result<(), BrowserError> {
        let element = self.element(selector).await?;
        element.send_keys(ENTER_KEY).await.map_err(driver_err)
    }

    async fn current_url(&self) -> Result<String, BrowserError> {
        self.client
            .current_url()
            .await
            .map(|url| url.to_string())
            .map_err(driver_err)
    }

    async fn cookies(&self) -> Result<Vec<Cookie>, BrowserError> {
        let cookies = self.client.get_all_cookies().await.map_err(driver_err)?;
        Ok(cookies
            .iter()
            .map(|c| Cookie {
                name: c.name().to_string(),
                value: c.value().to_string(),
                domain: c.domain().map(ToString::to_string),
                path: c.path().map(ToString::to_string),
                secure: c.secure().unwrap_or(false),
                http_only: c.http_only().unwrap_or(false),
            })
            .collect())
    }

    async fn set_cookies(&self, cookies: &[Cookie]) -> Result<(), BrowserError> {
        for cookie in cookies {
            let mut wd =
                fantoccini::cookies::Cookie::new(cookie.name.clone(), cookie.value.clone());
            if let Some(domain) = &cookie.domain {
                wd.set_domain(domain.clone());
            }
            if let Some(path) = &cookie.path {
                wd.set_path(path.clone());
            }
            wd.set_secure(cookie.secure);
            wd.set_http_only(cookie.http_only);
            self.client.add_cookie(wd).await.map_err(driver_err)?;
        }
        Ok(())
    }
}
