#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rust_decimal::Decimal;
use secrecy::SecretString;
use tokenwarden::browser::{BrowserLauncher, BrowserResult, PageDriver, UrlPattern};
use tokenwarden::credentials::{CredentialStore, Credentials, EMAIL, PASSWORD};
use tokenwarden::error::{AuthError, LoginError, SolveError};
use tokenwarden::login::{Authenticator, LoginMode};
use tokenwarden::solver::ChallengeSolver;
use tokio_util::sync::CancellationToken;

pub const LOGIN_URL: &str = "https://app.example.com/login";
pub const HOME_URL: &str = "https://app.example.com/home";
pub const EMAIL_FIELD: &str = r#"input[type="email"]"#;
pub const PASSWORD_FIELD: &str = r#"input[type="password"]"#;
pub const SUBMIT_BUTTON: &str = r#"button[type="submit"]"#;
pub const SOLVED: &str = "solved-xyz";

/// Unsigned JWT-shaped token expiring at `exp` (unix seconds).
pub fn jwt(exp: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#);
    let body = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"user-1","exp":{exp},"scope":"app"}}"#));
    format!("{header}.{body}.c2lnbmF0dXJl")
}

pub fn credentials() -> Credentials {
    Credentials::new("me@example.com", "hunter2")
}

#[derive(Debug, Default)]
struct PageState {
    url: String,
    fields: HashSet<String>,
    site_key: Option<String>,
    site_key_after_submit: bool,
    /// Submits needed before the app redirects; 0 means never.
    submits_to_authenticate: u32,
    lands_authenticated: bool,
    storage: Vec<(String, String)>,
    storage_after_login: Vec<(String, String)>,

    submits: u32,
    filled: Vec<(String, String)>,
    scripts: Vec<String>,
    visits: Vec<String>,
    closed: bool,
}

/// Scripted stand-in for a browser tab showing a login form.
#[derive(Debug, Clone, Default)]
pub struct FakePage {
    state: Arc<Mutex<PageState>>,
}

impl FakePage {
    /// Email, password and submit button present; no challenge; never redirects.
    pub fn login_form() -> Self {
        let page = Self::default();
        {
            let mut s = page.lock();
            s.url = "about:blank".to_string();
            for sel in [EMAIL_FIELD, PASSWORD_FIELD, SUBMIT_BUTTON] {
                s.fields.insert(sel.to_string());
            }
        }
        page
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PageState> {
        self.state.lock().unwrap()
    }

    pub fn with_challenge(self, site_key: &str) -> Self {
        self.lock().site_key = Some(site_key.to_string());
        self
    }

    /// The widget only appears once the form has been submitted.
    pub fn with_challenge_after_submit(self, site_key: &str) -> Self {
        {
            let mut s = self.lock();
            s.site_key = Some(site_key.to_string());
            s.site_key_after_submit = true;
        }
        self
    }

    pub fn authenticates_after(self, submits: u32) -> Self {
        self.lock().submits_to_authenticate = submits;
        self
    }

    /// An existing session: navigation lands on the home page directly.
    pub fn lands_authenticated(self) -> Self {
        self.lock().lands_authenticated = true;
        self
    }

    pub fn storage_after_login(self, entries: &[(&str, &str)]) -> Self {
        self.lock().storage_after_login = entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self
    }

    pub fn without_field(self, selector: &str) -> Self {
        self.lock().fields.remove(selector);
        self
    }

    pub fn submits(&self) -> u32 {
        self.lock().submits
    }

    pub fn filled(&self) -> Vec<(String, String)> {
        self.lock().filled.clone()
    }

    pub fn scripts_containing(&self, needle: &str) -> usize {
        self.lock().scripts.iter().filter(|s| s.contains(needle)).count()
    }

    pub fn visits(&self) -> Vec<String> {
        self.lock().visits.clone()
    }

    pub fn closed(&self) -> bool {
        self.lock().closed
    }

    fn authenticate(s: &mut PageState) {
        s.url = HOME_URL.to_string();
        s.storage = s.storage_after_login.clone();
    }

    fn submit(&self) {
        let mut s = self.lock();
        s.submits += 1;
        if s.submits_to_authenticate > 0 && s.submits >= s.submits_to_authenticate {
            Self::authenticate(&mut s);
        }
    }
}

#[async_trait]
impl PageDriver for FakePage {
    async fn goto(&self, url: &str) -> BrowserResult<()> {
        let mut s = self.lock();
        s.visits.push(url.to_string());
        s.url = url.to_string();
        if s.lands_authenticated {
            Self::authenticate(&mut s);
        }
        Ok(())
    }

    async fn current_url(&self) -> BrowserResult<String> {
        Ok(self.lock().url.clone())
    }

    async fn exists(&self, selector: &str) -> BrowserResult<bool> {
        Ok(self.lock().fields.contains(selector))
    }

    async fn attribute(&self, selector: &str, name: &str) -> BrowserResult<Option<String>> {
        let s = self.lock();
        let widget_visible = !s.site_key_after_submit || s.submits > 0;
        if selector == "[data-sitekey]" && name == "data-sitekey" && widget_visible {
            return Ok(s.site_key.clone());
        }
        Ok(None)
    }

    async fn fill(&self, selector: &str, value: &str) -> BrowserResult<()> {
        let mut s = self.lock();
        if !s.fields.contains(selector) {
            return Err(LoginError::Browser(format!("no element {selector}")));
        }
        s.filled.push((selector.to_string(), value.to_string()));
        Ok(())
    }

    async fn click(&self, selector: &str) -> BrowserResult<()> {
        if selector != SUBMIT_BUTTON {
            return Err(LoginError::Browser(format!("nothing to click at {selector}")));
        }
        self.submit();
        Ok(())
    }

    async fn press_enter(&self, selector: &str) -> BrowserResult<()> {
        if selector != PASSWORD_FIELD {
            return Err(LoginError::Browser(format!("Enter in {selector} does nothing")));
        }
        self.submit();
        Ok(())
    }

    async fn evaluate(&self, script: &str) -> BrowserResult<serde_json::Value> {
        self.lock().scripts.push(script.to_string());
        Ok(serde_json::Value::from(1))
    }

    async fn content(&self) -> BrowserResult<String> {
        Ok("<html><body><form></form></body></html>".to_string())
    }

    async fn frame_urls(&self) -> BrowserResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn storage_entries(&self) -> BrowserResult<Vec<(String, String)>> {
        Ok(self.lock().storage.clone())
    }

    async fn wait_for_url(&self, pattern: &UrlPattern, _timeout: Duration) -> BrowserResult<bool> {
        Ok(pattern.matches(&self.lock().url))
    }

    async fn close(&self) -> BrowserResult<()> {
        self.lock().closed = true;
        Ok(())
    }
}

/// Hands out clones of one [`FakePage`].
pub struct FakeLauncher {
    page: FakePage,
    launches: Mutex<Vec<bool>>,
}

impl FakeLauncher {
    pub fn new(page: FakePage) -> Self {
        Self {
            page,
            launches: Mutex::new(Vec::new()),
        }
    }

    /// The `headless` flag of every launch so far.
    pub fn launches(&self) -> Vec<bool> {
        self.launches.lock().unwrap().clone()
    }
}

#[async_trait]
impl BrowserLauncher for FakeLauncher {
    async fn launch(&self, headless: bool) -> BrowserResult<Box<dyn PageDriver>> {
        self.launches.lock().unwrap().push(headless);
        Ok(Box::new(self.page.clone()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverBehavior {
    Solve,
    Fail,
    /// Never answers; returns only once cancelled.
    Hang,
}

pub struct StubSolver {
    behavior: SolverBehavior,
    balance: Decimal,
    calls: AtomicU32,
    seen: Mutex<Vec<(String, String)>>,
}

impl StubSolver {
    pub fn new(behavior: SolverBehavior) -> Self {
        Self {
            behavior,
            balance: Decimal::new(150, 2),
            calls: AtomicU32::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn with_balance(mut self, balance: Decimal) -> Self {
        self.balance = balance;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// `(site_key, page_url)` of every solve request.
    pub fn seen(&self) -> Vec<(String, String)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChallengeSolver for StubSolver {
    async fn solve(
        &self,
        site_key: &str,
        page_url: &str,
        _timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<String, SolveError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .unwrap()
            .push((site_key.to_string(), page_url.to_string()));
        match self.behavior {
            SolverBehavior::Solve => Ok(SOLVED.to_string()),
            SolverBehavior::Fail => Err(SolveError::SolveFailed("ERROR_CAPTCHA_UNSOLVABLE".to_string())),
            SolverBehavior::Hang => {
                cancel.cancelled().await;
                Err(SolveError::Cancelled)
            }
        }
    }

    async fn balance(&self) -> Result<Decimal, SolveError> {
        Ok(self.balance)
    }
}

/// In-memory credential backend.
pub struct MapCredentials(HashMap<String, String>);

impl MapCredentials {
    pub fn login() -> Self {
        Self(HashMap::from([
            (EMAIL.to_string(), "me@example.com".to_string()),
            (PASSWORD.to_string(), "hunter2".to_string()),
        ]))
    }

    pub fn empty() -> Self {
        Self(HashMap::new())
    }
}

#[async_trait]
impl CredentialStore for MapCredentials {
    async fn get(&self, key: &str) -> Result<Option<SecretString>> {
        Ok(self.0.get(key).map(|v| SecretString::from(v.clone())))
    }
}

/// Authenticator that returns queued outcomes, optionally after a delay.
pub struct FakeAuthenticator {
    outcomes: Mutex<VecDeque<Option<String>>>,
    delay: Duration,
    calls: AtomicU32,
    modes: Mutex<Vec<LoginMode>>,
}

impl FakeAuthenticator {
    pub fn issuing(tokens: &[&str]) -> Self {
        Self::with_outcomes(tokens.iter().map(|t| Some(t.to_string())).collect())
    }

    /// Every attempt fails with a login timeout.
    pub fn failing() -> Self {
        Self::with_outcomes(VecDeque::new())
    }

    fn with_outcomes(outcomes: VecDeque<Option<String>>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes),
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
            modes: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn modes(&self) -> Vec<LoginMode> {
        self.modes.lock().unwrap().clone()
    }
}

#[async_trait]
impl Authenticator for FakeAuthenticator {
    async fn authenticate(&self, mode: LoginMode, cancel: &CancellationToken) -> Result<String, AuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.modes.lock().unwrap().push(mode);
        if !self.delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(AuthError::Login(LoginError::Cancelled)),
                _ = tokio::time::sleep(self.delay) => {}
            }
        }
        let next = self.outcomes.lock().unwrap().pop_front().flatten();
        next.ok_or(AuthError::Login(LoginError::LoginTimeout(Duration::from_secs(30))))
    }
}
