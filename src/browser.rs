use crate::humanize::{self, Vec2};
use async_trait::async_trait;
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchMouseEventParams, DispatchMouseEventType, MouseButton,
};
use chromiumoxide::cdp::browser_protocol::page::ReloadParams;
use chromiumoxide::error::CdpError;
use chromiumoxide::Page;
use futures::StreamExt;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum PageError {
    /// The CDP connection died mid-attempt; the session is unusable.
    #[error("session lost: {0}")]
    SessionLost(String),
    #[error("browser error: {0}")]
    Browser(String),
}

fn map_cdp(err: CdpError) -> PageError {
    let text = err.to_string();
    let lower = text.to_lowercase();
    if lower.contains("websocket") || lower.contains("connection") || lower.contains("closed") {
        PageError::SessionLost(text)
    } else {
        PageError::Browser(text)
    }
}

/// The page surface the auth driver and the workflow run against. The
/// production implementation drives CDP with humanized input; tests
/// substitute a scripted fake.
#[async_trait]
pub trait SessionPage: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<(), PageError>;
    async fn reload(&self) -> Result<(), PageError>;
    async fn current_url(&self) -> Result<String, PageError>;
    async fn body_text(&self) -> Result<String, PageError>;
    async fn exists(&self, selector: &str) -> Result<bool, PageError>;
    async fn text_of(&self, selector: &str) -> Result<Option<String>, PageError>;
    /// Current value of an input element.
    async fn value_of(&self, selector: &str) -> Result<Option<String>, PageError>;
    async fn click(&self, selector: &str) -> Result<(), PageError>;
    async fn type_text(&self, selector: &str, text: &str) -> Result<(), PageError>;
    async fn healthy(&self) -> bool;
}

/// HTTP client for the external browser-profile service.
///
/// The service runs on localhost on a port that varies by install; the
/// port is discovered once at startup by probing the candidates.
pub struct ProfileService {
    base: String,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct StartResponse {
    endpoint: String,
}

const START_RETRIES: u32 = 3;

impl ProfileService {
    pub fn new(base: String) -> eyre::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| eyre::eyre!("failed to build http client: {e}"))?;
        Ok(Self { base, http })
    }

    /// Probe candidate ports on `host` and return a client bound to the
    /// first one that answers the status endpoint.
    pub async fn discover(host: &str, ports: &[u16]) -> eyre::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(3))
            .build()
            .map_err(|e| eyre::eyre!("failed to build http client: {e}"))?;
        for port in ports {
            let base = format!("http://{host}:{port}");
            match http.get(format!("{base}/status")).send().await {
                Ok(resp) if resp.status().is_success() => {
                    tracing::info!(port, "profile service found");
                    return Self::new(base);
                }
                _ => continue,
            }
        }
        Err(eyre::eyre!(
            "profile service not reachable on {host} ports {ports:?}"
        ))
    }

    /// Start a profile and return its DevTools endpoint. Transient start
    /// failures are retried with backoff; profile startup is the flakiest
    /// call in the whole pipeline.
    pub async fn start(&self, profile_id: &str) -> Result<String, PageError> {
        let url = format!("{}/profiles/{profile_id}/start", self.base);
        let mut delay = Duration::from_secs(1);
        for attempt in 1..=START_RETRIES {
            let res = self.http.post(&url).send().await;
            match res {
                Ok(resp) if resp.status().is_success() => {
                    let body: StartResponse = resp.json().await.map_err(|e| {
                        PageError::Browser(format!("profile start response malformed: {e}"))
                    })?;
                    return Ok(body.endpoint);
                }
                Ok(resp) => {
                    let status = resp.status();
                    if attempt == START_RETRIES {
                        return Err(PageError::Browser(format!(
                            "profile start failed: {status}"
                        )));
                    }
                    tracing::warn!(profile_id, %status, attempt, "profile start rejected; retrying");
                }
                Err(err) => {
                    if attempt == START_RETRIES {
                        return Err(PageError::Browser(format!("profile start failed: {err}")));
                    }
                    tracing::warn!(profile_id, error = %err, attempt, "profile start failed; retrying");
                }
            }
            tokio::time::sleep(delay).await;
            delay = delay.saturating_mul(2);
        }
        unreachable!("retry loop always returns");
    }

    pub async fn stop(&self, profile_id: &str) {
        let url = format!("{}/profiles/{profile_id}/stop", self.base);
        if let Err(err) = self.http.post(&url).send().await {
            tracing::warn!(profile_id, error = %err, "profile stop failed");
        }
    }
}

/// CDP-backed page with humanized input timing.
pub struct CdpPage {
    page: Page,
}

impl CdpPage {
    async fn eval_json(&self, js: &str) -> Result<serde_json::Value, PageError> {
        let result = self.page.evaluate(js).await.map_err(map_cdp)?;
        Ok(result.value().cloned().unwrap_or(serde_json::Value::Null))
    }

    async fn mouse_event(
        &self,
        kind: DispatchMouseEventType,
        point: Vec2,
        button: Option<MouseButton>,
    ) -> Result<(), PageError> {
        let mut builder = DispatchMouseEventParams::builder()
            .r#type(kind)
            .x(point.x)
            .y(point.y);
        if let Some(button) = button {
            builder = builder.button(button).click_count(1);
        }
        let params = builder
            .build()
            .map_err(|e| PageError::Browser(format!("mouse event build failed: {e}")))?;
        self.page.execute(params).await.map_err(map_cdp)?;
        Ok(())
    }

    /// Humanized click: jittered target, way-pointed cursor path, pauses
    /// before and after the button press.
    async fn click_at(&self, target: Vec2) -> Result<(), PageError> {
        let target = humanize::jitter_target(target, 3.0);
        let origin = Vec2 {
            x: (target.x * 0.3).max(5.0),
            y: (target.y * 0.5).max(5.0),
        };
        for waypoint in humanize::cursor_path(origin, target, 4) {
            self.mouse_event(DispatchMouseEventType::MouseMoved, waypoint, None)
                .await?;
            tokio::time::sleep(Duration::from_millis(15)).await;
        }
        tokio::time::sleep(humanize::pre_click_pause()).await;
        self.mouse_event(
            DispatchMouseEventType::MousePressed,
            target,
            Some(MouseButton::Left),
        )
        .await?;
        self.mouse_event(
            DispatchMouseEventType::MouseReleased,
            target,
            Some(MouseButton::Left),
        )
        .await?;
        tokio::time::sleep(humanize::post_click_pause()).await;
        Ok(())
    }

    fn selector_js(selector: &str, body: &str) -> String {
        let quoted = serde_json::to_string(selector).unwrap_or_else(|_| "\"\"".to_string());
        format!("(() => {{ const el = document.querySelector({quoted}); {body} }})()")
    }
}

#[async_trait]
impl SessionPage for CdpPage {
    async fn navigate(&self, url: &str) -> Result<(), PageError> {
        self.page.goto(url).await.map_err(map_cdp)?;
        let _ = self.page.wait_for_navigation().await;
        Ok(())
    }

    async fn reload(&self) -> Result<(), PageError> {
        self.page
            .execute(ReloadParams::default())
            .await
            .map_err(map_cdp)?;
        let _ = self.page.wait_for_navigation().await;
        Ok(())
    }

    async fn current_url(&self) -> Result<String, PageError> {
        Ok(self.page.url().await.map_err(map_cdp)?.unwrap_or_default())
    }

    async fn body_text(&self) -> Result<String, PageError> {
        let v = self
            .eval_json("document.body ? document.body.innerText : ''")
            .await?;
        Ok(v.as_str().unwrap_or_default().to_string())
    }

    async fn exists(&self, selector: &str) -> Result<bool, PageError> {
        let js = Self::selector_js(selector, "return el !== null;");
        Ok(self.eval_json(&js).await?.as_bool().unwrap_or(false))
    }

    async fn text_of(&self, selector: &str) -> Result<Option<String>, PageError> {
        let js = Self::selector_js(selector, "return el ? el.innerText : null;");
        Ok(self
            .eval_json(&js)
            .await?
            .as_str()
            .map(|s| s.to_string()))
    }

    async fn value_of(&self, selector: &str) -> Result<Option<String>, PageError> {
        let js = Self::selector_js(selector, "return el ? el.value : null;");
        Ok(self
            .eval_json(&js)
            .await?
            .as_str()
            .map(|s| s.to_string()))
    }

    async fn click(&self, selector: &str) -> Result<(), PageError> {
        let element = self.page.find_element(selector).await.map_err(map_cdp)?;
        let point = element.clickable_point().await.map_err(map_cdp)?;
        self.click_at(Vec2 {
            x: point.x,
            y: point.y,
        })
        .await
    }

    async fn type_text(&self, selector: &str, text: &str) -> Result<(), PageError> {
        let element = self.page.find_element(selector).await.map_err(map_cdp)?;
        let point = element.clickable_point().await.map_err(map_cdp)?;
        self.click_at(Vec2 {
            x: point.x,
            y: point.y,
        })
        .await?;
        for ch in text.chars() {
            element
                .type_str(ch.to_string())
                .await
                .map_err(map_cdp)?;
            tokio::time::sleep(humanize::key_delay()).await;
        }
        Ok(())
    }

    async fn healthy(&self) -> bool {
        matches!(
            self.eval_json("1 + 1").await,
            Ok(serde_json::Value::Number(n)) if n.as_i64() == Some(2)
        )
    }
}

/// One browser session bound to one profile. Sessions are never pooled
/// across ticks: one attempt, one session.
pub struct ProfileSession {
    profile_id: String,
    browser: Browser,
    handler_task: tokio::task::JoinHandle<()>,
    page: CdpPage,
}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

impl ProfileSession {
    /// Start the profile, attach over CDP, and health-probe before
    /// handing the session out.
    pub async fn open(service: &ProfileService, profile_id: &str) -> Result<Self, PageError> {
        let endpoint = service.start(profile_id).await?;

        let connect = tokio::time::timeout(CONNECT_TIMEOUT, Browser::connect(endpoint.clone()));
        let (browser, mut handler) = match connect.await {
            Ok(Ok(pair)) => pair,
            Ok(Err(err)) => {
                service.stop(profile_id).await;
                return Err(map_cdp(err));
            }
            Err(_) => {
                service.stop(profile_id).await;
                return Err(PageError::SessionLost(format!(
                    "connect to {endpoint} timed out"
                )));
            }
        };

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let page = match Self::pick_page(&browser).await {
            Ok(page) => CdpPage { page },
            Err(err) => {
                handler_task.abort();
                service.stop(profile_id).await;
                return Err(err);
            }
        };

        let session = Self {
            profile_id: profile_id.to_string(),
            browser,
            handler_task,
            page,
        };

        if !session.page.healthy().await {
            session.close(service).await;
            return Err(PageError::SessionLost(
                "health probe failed after connect".to_string(),
            ));
        }
        Ok(session)
    }

    async fn pick_page(browser: &Browser) -> Result<Page, PageError> {
        if let Ok(pages) = browser.pages().await {
            if let Some(page) = pages.into_iter().next() {
                return Ok(page);
            }
        }
        browser.new_page("about:blank").await.map_err(map_cdp)
    }

    pub fn page(&self) -> &CdpPage {
        &self.page
    }

    /// Teardown: drop the CDP connection and release the profile slot.
    /// Safe to call in any state; every exit path of an attempt ends here.
    pub async fn close(self, service: &ProfileService) {
        drop(self.browser);
        self.handler_task.abort();
        service.stop(&self.profile_id).await;
    }
}

/// Soft memory-pressure hint: finish the current attempt and recycle
/// rather than opening another session.
pub fn memory_pressure(ceiling_mb: u64) -> bool {
    if ceiling_mb == 0 {
        return false;
    }
    let mut sys = sysinfo::System::new();
    sys.refresh_memory();
    let used_mb = sys.used_memory() / (1024 * 1024);
    used_mb >= ceiling_mb
}
