//! Browser-driven login.
//!
//! [`LoginFlow`] walks one page from the login form to a token in client-side
//! storage, solving a challenge widget on the way when one shows up.
//! [`BrowserAuthenticator`] adds what surrounds a run: credentials, the
//! solver balance check, browser launch and teardown.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use secrecy::ExposeSecret;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::browser::{BrowserLauncher, PageDriver, UrlPattern};
use crate::config::{Config, SelectorConfig, TimeoutConfig};
use crate::credentials::{CredentialStore, Credentials};
use crate::duration::format_duration;
use crate::error::{AuthError, LoginError, SolveError};
use crate::solver::{ensure_balance, poll_until, ChallengeSolver, PollError, PollSchedule, PollStep};
use crate::strategy::{FieldStrategy, StrategyChain, TokenHit, TokenScan};
use crate::token::preview;

const EXTRACT_INTERVAL: Duration = Duration::from_millis(500);

/// How a login is carried out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoginMode {
    /// Fill the form, solve the challenge, submit.
    #[default]
    Automated,
    /// Open a visible browser and wait for a human to log in.
    Manual,
}

/// Everything the flow needs to know about the target site.
#[derive(Debug, Clone)]
pub struct LoginSettings {
    pub login_url: String,
    pub authenticated: UrlPattern,
    pub timeouts: TimeoutConfig,
    pub selectors: SelectorConfig,
    pub token_scan: TokenScan,
}

impl LoginSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            login_url: config.login_url.clone(),
            authenticated: config.authenticated_url_pattern.clone(),
            timeouts: config.timeouts.clone(),
            selectors: config.selectors.clone(),
            token_scan: config.token_scan.clone(),
        }
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoginReport {
    pub token: String,
    /// Storage location the token was read from.
    pub location: String,
    /// Site key of the challenge that was solved, if any.
    pub site_key: Option<String>,
    pub injections: u32,
    pub submits: u32,
}

/// The login state machine, independent of any particular browser.
pub struct LoginFlow {
    settings: LoginSettings,
    solver: Option<Arc<dyn ChallengeSolver>>,
}

impl LoginFlow {
    pub fn new(settings: LoginSettings) -> Self {
        Self {
            settings,
            solver: None,
        }
    }

    pub fn with_solver(mut self, solver: Arc<dyn ChallengeSolver>) -> Self {
        self.solver = Some(solver);
        self
    }

    pub fn settings(&self) -> &LoginSettings {
        &self.settings
    }

    pub fn solver(&self) -> Option<&Arc<dyn ChallengeSolver>> {
        self.solver.as_ref()
    }

    /// Log in with `credentials` and return the token the app stored.
    ///
    /// A challenge is solved and injected at most once per run. When the
    /// first submit does not reach the authenticated page, the form is
    /// submitted once more if a challenge was (or now can be) solved.
    pub async fn perform_login(
        &self,
        credentials: &Credentials,
        page: &dyn PageDriver,
        cancel: &CancellationToken,
    ) -> Result<LoginReport, LoginError> {
        let mut report = LoginReport::default();

        self.navigate(page, cancel).await?;

        match self.settings.selectors.site_key.first_match(page).await {
            Some(found) => {
                info!(strategy = %found.name, "Challenge widget detected");
                self.solve_and_inject(page, &found.value, cancel, &mut report)
                    .await?;
            }
            None => debug!("No challenge widget on the login page"),
        }

        let email = locate(&self.settings.selectors.email, page, "email").await?;
        let password = locate(&self.settings.selectors.password, page, "password").await?;
        page.fill(&email, &credentials.email).await?;
        page.fill(&password, credentials.password.expose_secret())
            .await?;
        debug!(email_field = %email, password_field = %password, "Credentials filled");

        self.submit(page, &password, &mut report).await?;

        if !self.wait_authenticated(page, cancel).await? {
            let retry = if report.injections > 0 {
                info!("Still on the login page after solving the challenge, submitting again");
                true
            } else if let Some(found) = self.settings.selectors.site_key.first_match(page).await {
                info!(strategy = %found.name, "Challenge appeared after submit");
                self.solve_and_inject(page, &found.value, cancel, &mut report)
                    .await?;
                true
            } else {
                false
            };

            if !retry {
                let url = current_url(page).await;
                warn!(%url, "Authenticated page not reached");
                return Err(LoginError::LoginTimeout(self.settings.timeouts.redirect));
            }

            self.submit(page, &password, &mut report).await?;
            if !self.wait_authenticated(page, cancel).await? {
                let url = current_url(page).await;
                warn!(%url, "Authenticated page not reached after resubmit");
                return Err(LoginError::LoginTimeout(self.settings.timeouts.redirect));
            }
        }

        info!(submits = report.submits, "Reached authenticated page");
        pause(cancel, self.settings.timeouts.settle).await?;

        let hit = self.extract(page, cancel).await?;
        report.location = hit.location();
        report.token = hit.token;
        info!(location = %report.location, token = %preview(&report.token), "Token extracted");
        Ok(report)
    }

    /// Open the login page and wait for a human to finish logging in.
    pub async fn perform_manual_login(
        &self,
        page: &dyn PageDriver,
        cancel: &CancellationToken,
    ) -> Result<LoginReport, LoginError> {
        let limit = self.settings.timeouts.manual_login;
        self.navigate(page, cancel).await?;

        info!(
            timeout = %format_duration(limit),
            "Waiting for login to be completed in the browser window"
        );
        let reached = cancellable(cancel, page.wait_for_url(&self.settings.authenticated, limit)).await??;
        if !reached {
            return Err(LoginError::LoginTimeout(limit));
        }
        pause(cancel, self.settings.timeouts.settle).await?;

        let hit = self.extract(page, cancel).await?;
        info!(location = %hit.location(), token = %preview(&hit.token), "Token extracted");
        Ok(LoginReport {
            location: hit.location(),
            token: hit.token,
            ..LoginReport::default()
        })
    }

    async fn navigate(&self, page: &dyn PageDriver, cancel: &CancellationToken) -> Result<(), LoginError> {
        let url = &self.settings.login_url;
        let limit = self.settings.timeouts.navigation;
        info!(%url, "Opening login page");

        match cancellable(cancel, tokio::time::timeout(limit, page.goto(url))).await? {
            Ok(result) => result?,
            Err(_) => {
                return Err(LoginError::Browser(format!(
                    "login page did not load within {}",
                    format_duration(limit)
                )))
            }
        }
        pause(cancel, self.settings.timeouts.settle).await
    }

    async fn solve_and_inject(
        &self,
        page: &dyn PageDriver,
        site_key: &str,
        cancel: &CancellationToken,
        report: &mut LoginReport,
    ) -> Result<(), LoginError> {
        let Some(solver) = &self.solver else {
            return Err(LoginError::ChallengeUnresolved(SolveError::Rejected(
                "no challenge solver configured".to_string(),
            )));
        };

        let page_url = match page.current_url().await {
            Ok(url) if url.starts_with("http") => url,
            _ => self.settings.login_url.clone(),
        };

        info!(site_key, "Solving challenge");
        let value = solver
            .solve(site_key, &page_url, self.settings.timeouts.challenge, cancel)
            .await
            .map_err(|err| match err {
                SolveError::Cancelled => LoginError::Cancelled,
                other => LoginError::ChallengeUnresolved(other),
            })?;

        self.inject(page, &value).await;
        report.injections += 1;
        report.site_key = Some(site_key.to_string());
        pause(cancel, self.settings.timeouts.settle).await
    }

    /// Hand the solved value to the page. Each step is independent; a failed
    /// step is logged and the rest still run.
    async fn inject(&self, page: &dyn PageDriver, value: &str) {
        let value = serde_json::Value::from(value).to_string();
        let fields = serde_json::Value::from(self.settings.selectors.challenge_response_fields.clone()).to_string();

        let steps = [
            ("write response fields", format!("({WRITE_FIELDS_JS})({value}, {fields})")),
            ("dispatch events", format!("({DISPATCH_EVENTS_JS})({fields})")),
            ("invoke callbacks", format!("({INVOKE_CALLBACKS_JS})({value})")),
        ];

        for (step, script) in steps {
            match page.evaluate(&script).await {
                Ok(result) => debug!(step, %result, "Injection step ran"),
                Err(err) => warn!(step, error = %err, "Injection step failed"),
            }
        }
    }

    async fn submit(
        &self,
        page: &dyn PageDriver,
        password_field: &str,
        report: &mut LoginReport,
    ) -> Result<(), LoginError> {
        report.submits += 1;

        if let Some(button) = self.settings.selectors.submit.first_match(page).await {
            match page.click(&button.value).await {
                Ok(()) => {
                    debug!(selector = %button.value, attempt = report.submits, "Clicked submit");
                    return Ok(());
                }
                Err(err) => warn!(error = %err, "Submit click failed, pressing Enter instead"),
            }
        }

        page.press_enter(password_field).await?;
        debug!(attempt = report.submits, "Submitted with Enter");
        Ok(())
    }

    async fn wait_authenticated(
        &self,
        page: &dyn PageDriver,
        cancel: &CancellationToken,
    ) -> Result<bool, LoginError> {
        cancellable(
            cancel,
            page.wait_for_url(&self.settings.authenticated, self.settings.timeouts.redirect),
        )
        .await?
    }

    /// Read storage until a token shows up or the settle window passes.
    async fn extract(&self, page: &dyn PageDriver, cancel: &CancellationToken) -> Result<TokenHit, LoginError> {
        let scan = &self.settings.token_scan;
        if let Some(hit) = scan.find(&page.storage_entries().await?) {
            return Ok(hit);
        }

        let schedule = PollSchedule::new(EXTRACT_INTERVAL, self.settings.timeouts.settle);
        let result = poll_until(schedule, cancel, |_| async {
            match page.storage_entries().await {
                Ok(entries) => match scan.find(&entries) {
                    Some(hit) => PollStep::Ready(hit),
                    None => PollStep::Pending,
                },
                Err(err) => PollStep::Failed(err),
            }
        })
        .await;

        match result {
            Ok(hit) => Ok(hit),
            Err(PollError::TimedOut { attempts, .. }) => {
                warn!(attempts = attempts + 1, "No token in client-side storage");
                Err(LoginError::TokenNotFound)
            }
            Err(PollError::Cancelled) => Err(LoginError::Cancelled),
            Err(PollError::Failed(err)) => Err(err),
        }
    }
}

async fn locate(
    chain: &StrategyChain<FieldStrategy>,
    page: &dyn PageDriver,
    field: &'static str,
) -> Result<String, LoginError> {
    chain
        .first_match(page)
        .await
        .map(|found| found.value)
        .ok_or(LoginError::FieldNotFound(field))
}

async fn current_url(page: &dyn PageDriver) -> String {
    page.current_url().await.unwrap_or_default()
}

async fn cancellable<F: Future>(cancel: &CancellationToken, fut: F) -> Result<F::Output, LoginError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(LoginError::Cancelled),
        out = fut => Ok(out),
    }
}

async fn pause(cancel: &CancellationToken, duration: Duration) -> Result<(), LoginError> {
    if duration.is_zero() {
        return Ok(());
    }
    cancellable(cancel, tokio::time::sleep(duration)).await
}

/// Sets every matching response field, creating a hidden one in the first
/// form when none exists. Returns the number of fields written.
const WRITE_FIELDS_JS: &str = r#"(value, selectors) => {
    try {
        let written = 0;
        for (const sel of selectors) {
            document.querySelectorAll(sel).forEach(el => { el.value = value; written++; });
        }
        if (written === 0 && selectors.length > 0) {
            const form = document.querySelector('form');
            const m = selectors[0].match(/name=["']?([^"'\]]+)/);
            if (form && m) {
                const input = document.createElement('input');
                input.type = 'hidden';
                input.name = m[1];
                input.value = value;
                form.appendChild(input);
                written++;
            }
        }
        return written;
    } catch (e) {
        return 'error: ' + e;
    }
}"#;

const DISPATCH_EVENTS_JS: &str = r#"(selectors) => {
    try {
        let n = 0;
        for (const sel of selectors) {
            document.querySelectorAll(sel).forEach(el => {
                el.dispatchEvent(new Event('input', { bubbles: true }));
                el.dispatchEvent(new Event('change', { bubbles: true }));
                n++;
            });
        }
        return n;
    } catch (e) {
        return 'error: ' + e;
    }
}"#;

/// Calls the widget's declared `data-callback` and the Turnstile callback hook.
const INVOKE_CALLBACKS_JS: &str = r#"(value) => {
    const called = [];
    try {
        const widget = document.querySelector('[data-callback]');
        const name = widget && widget.getAttribute('data-callback');
        if (name && typeof window[name] === 'function') {
            window[name](value);
            called.push(name);
        }
        if (window.turnstile && typeof window.turnstile.callback === 'function') {
            window.turnstile.callback(value);
            called.push('turnstile.callback');
        }
    } catch (e) {
        called.push('error: ' + e);
    }
    return called;
}"#;

/// Acquires a token by logging in.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, mode: LoginMode, cancel: &CancellationToken) -> Result<String, AuthError>;
}

/// Runs [`LoginFlow`] in a freshly launched browser.
pub struct BrowserAuthenticator {
    launcher: Arc<dyn BrowserLauncher>,
    flow: LoginFlow,
    credentials: Arc<dyn CredentialStore>,
    headless: bool,
    min_balance: Decimal,
}

impl BrowserAuthenticator {
    pub fn new(
        launcher: Arc<dyn BrowserLauncher>,
        flow: LoginFlow,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            launcher,
            flow,
            credentials,
            headless: true,
            min_balance: Decimal::ZERO,
        }
    }

    pub fn headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    /// Refuse to launch an automated login below this solver balance.
    pub fn min_balance(mut self, minimum: Decimal) -> Self {
        self.min_balance = minimum;
        self
    }

    async fn run_automated(&self, cancel: &CancellationToken) -> Result<String, AuthError> {
        let credentials = Credentials::load(self.credentials.as_ref())
            .await
            .map_err(|e| AuthError::Credentials(format!("{e:#}")))?;

        if let Some(solver) = self.flow.solver() {
            ensure_balance(solver.as_ref(), self.min_balance).await?;
        }

        let page = self.launcher.launch(self.headless).await?;
        let limit = self.flow.settings().timeouts.login;
        let result = cancellable(
            cancel,
            tokio::time::timeout(limit, self.flow.perform_login(&credentials, page.as_ref(), cancel)),
        )
        .await;
        close(page.as_ref()).await;

        let report = match result {
            Ok(Ok(report)) => report?,
            Ok(Err(_)) => return Err(LoginError::LoginTimeout(limit).into()),
            Err(err) => return Err(err.into()),
        };
        Ok(report.token)
    }

    async fn run_manual(&self, cancel: &CancellationToken) -> Result<String, AuthError> {
        let page = self.launcher.launch(false).await?;
        let result = self.flow.perform_manual_login(page.as_ref(), cancel).await;
        close(page.as_ref()).await;
        Ok(result?.token)
    }
}

async fn close(page: &dyn PageDriver) {
    if let Err(err) = page.close().await {
        warn!(error = %err, "Failed to close browser");
    }
}

#[async_trait]
impl Authenticator for BrowserAuthenticator {
    async fn authenticate(&self, mode: LoginMode, cancel: &CancellationToken) -> Result<String, AuthError> {
        match mode {
            LoginMode::Automated => self.run_automated(cancel).await,
            LoginMode::Manual => self.run_manual(cancel).await,
        }
    }
}
