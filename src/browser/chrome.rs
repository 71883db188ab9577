//! Chrome DevTools Protocol driver.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::element::Element;
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{BrowserLauncher, BrowserResult, PageDriver};
use crate::error::LoginError;

const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Hides the most common automation fingerprints before any page script runs.
const STEALTH_SCRIPT: &str = r#"
Object.defineProperty(navigator, 'webdriver', { get: () => undefined });
window.chrome = window.chrome || { runtime: {} };
Object.defineProperty(navigator, 'plugins', { get: () => [1, 2, 3, 4, 5] });
"#;

const STORAGE_SCRIPT: &str = r#"(() => {
    const out = [];
    for (const store of [window.localStorage, window.sessionStorage]) {
        if (!store) continue;
        for (let i = 0; i < store.length; i++) {
            const key = store.key(i);
            out.push([key, store.getItem(key) ?? ""]);
        }
    }
    return out;
})()"#;

const FRAME_URLS_SCRIPT: &str =
    "Array.from(document.querySelectorAll('iframe')).map(f => f.src || '')";

/// Launches Chrome/Chromium with automation flags turned down.
#[derive(Debug, Clone, Default)]
pub struct ChromeLauncher {
    profile_dir: Option<PathBuf>,
    executable: Option<PathBuf>,
}

impl ChromeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep cookies and storage between runs in `dir`.
    pub fn with_profile_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.profile_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn with_executable(mut self, path: impl AsRef<Path>) -> Self {
        self.executable = Some(path.as_ref().to_path_buf());
        self
    }
}

#[async_trait]
impl BrowserLauncher for ChromeLauncher {
    async fn launch(&self, headless: bool) -> BrowserResult<Box<dyn PageDriver>> {
        let chrome_path = match &self.executable {
            Some(path) => path.display().to_string(),
            None => find_chrome().ok_or_else(|| {
                LoginError::BrowserUnavailable(
                    "Chrome/Chromium not found. Please install Chrome or Chromium.".to_string(),
                )
            })?,
        };

        let mut builder = BrowserConfig::builder()
            .chrome_executable(chrome_path)
            .viewport(None)
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-infobars")
            .arg("--no-first-run")
            .arg("--no-default-browser-check");
        if !headless {
            builder = builder.with_head();
        }
        if let Some(dir) = &self.profile_dir {
            std::fs::create_dir_all(dir).map_err(|e| {
                LoginError::BrowserUnavailable(format!(
                    "Failed to create profile dir {}: {e}",
                    dir.display()
                ))
            })?;
            builder = builder.user_data_dir(dir);
        }
        let config = builder
            .build()
            .map_err(|e| LoginError::BrowserUnavailable(format!("Failed to configure browser: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| LoginError::BrowserUnavailable(format!("Failed to launch browser: {e}")))?;

        let handler_task = tokio::spawn(async move { while (handler.next().await).is_some() {} });

        let page = match browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(e) => {
                handler_task.abort();
                return Err(LoginError::BrowserUnavailable(format!("Failed to open page: {e}")));
            }
        };

        if let Err(e) = page.set_user_agent(USER_AGENT).await {
            warn!(error = %e, "Failed to override user agent");
        }
        if let Err(e) = page.evaluate_on_new_document(STEALTH_SCRIPT).await {
            warn!(error = %e, "Failed to install stealth script");
        }

        debug!(headless, "Browser launched");
        Ok(Box::new(ChromePage {
            browser: Mutex::new(Some(browser)),
            page,
            handler_task,
        }))
    }
}

/// A single Chrome tab plus the browser process that owns it.
pub struct ChromePage {
    browser: Mutex<Option<Browser>>,
    page: Page,
    handler_task: JoinHandle<()>,
}

impl ChromePage {
    async fn element(&self, selector: &str) -> BrowserResult<Element> {
        self.page
            .find_element(selector)
            .await
            .map_err(|e| cdp_error(&format!("find {selector}"), e))
    }
}

fn cdp_error(action: &str, err: chromiumoxide::error::CdpError) -> LoginError {
    LoginError::Browser(format!("{action}: {err}"))
}

#[async_trait]
impl PageDriver for ChromePage {
    async fn goto(&self, url: &str) -> BrowserResult<()> {
        self.page
            .goto(url)
            .await
            .map_err(|e| cdp_error("navigate", e))?
            .wait_for_navigation()
            .await
            .map_err(|e| cdp_error("wait for navigation", e))?;
        Ok(())
    }

    async fn current_url(&self) -> BrowserResult<String> {
        let url = self.page.url().await.map_err(|e| cdp_error("read url", e))?;
        Ok(url.unwrap_or_default())
    }

    async fn exists(&self, selector: &str) -> BrowserResult<bool> {
        let found = self
            .page
            .find_elements(selector)
            .await
            .map(|els| !els.is_empty())
            .unwrap_or(false);
        Ok(found)
    }

    async fn attribute(&self, selector: &str, name: &str) -> BrowserResult<Option<String>> {
        let Ok(el) = self.page.find_element(selector).await else {
            return Ok(None);
        };
        el.attribute(name)
            .await
            .map_err(|e| cdp_error(&format!("read {name} of {selector}"), e))
    }

    async fn fill(&self, selector: &str, value: &str) -> BrowserResult<()> {
        let el = self.element(selector).await?;
        el.call_js_fn("function() { this.value = ''; }", false)
            .await
            .map_err(|e| cdp_error(&format!("clear {selector}"), e))?;
        el.click()
            .await
            .map_err(|e| cdp_error(&format!("focus {selector}"), e))?
            .type_str(value)
            .await
            .map_err(|e| cdp_error(&format!("type into {selector}"), e))?;
        Ok(())
    }

    async fn click(&self, selector: &str) -> BrowserResult<()> {
        self.element(selector)
            .await?
            .click()
            .await
            .map_err(|e| cdp_error(&format!("click {selector}"), e))?;
        Ok(())
    }

    async fn press_enter(&self, selector: &str) -> BrowserResult<()> {
        self.element(selector)
            .await?
            .press_key("Enter")
            .await
            .map_err(|e| cdp_error(&format!("press Enter in {selector}"), e))?;
        Ok(())
    }

    async fn evaluate(&self, script: &str) -> BrowserResult<serde_json::Value> {
        let result = self
            .page
            .evaluate(script)
            .await
            .map_err(|e| cdp_error("evaluate", e))?;
        Ok(result.value().cloned().unwrap_or(serde_json::Value::Null))
    }

    async fn content(&self) -> BrowserResult<String> {
        self.page.content().await.map_err(|e| cdp_error("read content", e))
    }

    async fn frame_urls(&self) -> BrowserResult<Vec<String>> {
        let value = self.evaluate(FRAME_URLS_SCRIPT).await?;
        serde_json::from_value(value).map_err(|e| LoginError::Browser(format!("frame urls: {e}")))
    }

    async fn storage_entries(&self) -> BrowserResult<Vec<(String, String)>> {
        let value = self.evaluate(STORAGE_SCRIPT).await?;
        serde_json::from_value(value).map_err(|e| LoginError::Browser(format!("storage: {e}")))
    }

    async fn close(&self) -> BrowserResult<()> {
        let browser = self.browser.lock().await.take();
        if let Some(mut browser) = browser {
            if let Err(e) = browser.close().await {
                warn!(error = %e, "Browser did not close cleanly");
            }
            let _ = browser.wait().await;
        }
        self.handler_task.abort();
        debug!("Browser closed");
        Ok(())
    }
}

impl Drop for ChromePage {
    fn drop(&mut self) {
        self.handler_task.abort();
    }
}

/// Find Chrome/Chromium executable.
pub fn find_chrome() -> Option<String> {
    for name in ["google-chrome", "chromium", "chromium-browser"] {
        if let Ok(output) = std::process::Command::new("which").arg(name).output() {
            if output.status.success() {
                let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !path.is_empty() {
                    return Some(path);
                }
            }
        }
    }

    let candidates = [
        "/usr/bin/google-chrome",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
        "/snap/bin/chromium",
        // NixOS
        "/run/current-system/sw/bin/google-chrome",
        "/run/current-system/sw/bin/chromium",
        // macOS
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        "/Applications/Chromium.app/Contents/MacOS/Chromium",
    ];

    candidates
        .into_iter()
        .find(|candidate| Path::new(candidate).exists())
        .map(str::to_string)
}
