//! Sequential test driver.
//!
//! Runs each registered case as setup → body → teardown on one shared
//! [`SanityContext`], strictly one after another, and closes the
//! connections after the last case.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use tracing::{error, info};

use crate::config::Config;
use crate::connection::{Dialer, GrpcDialer};
use crate::context::SanityContext;
use crate::error::{Result, SanityError};
use crate::metrics;
use crate::provision::BoxError;

/// Future returned by a test case body.
pub type CaseFuture<'a> = Pin<Box<dyn Future<Output = std::result::Result<(), BoxError>> + 'a>>;

type CaseFn<D> = Box<dyn for<'a> Fn(&'a mut SanityContext<D>) -> CaseFuture<'a>>;

/// A named test case body.
pub struct TestCase<D: Dialer = GrpcDialer> {
    name: String,
    body: CaseFn<D>,
}

impl<D: Dialer> TestCase<D> {
    /// ```ignore
    /// TestCase::new("node has target path", |ctx| Box::pin(async move {
    ///     assert!(!ctx.target_path().is_empty());
    ///     Ok(())
    /// }))
    /// ```
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: for<'a> Fn(&'a mut SanityContext<D>) -> CaseFuture<'a> + 'static,
    {
        Self {
            name: name.into(),
            body: Box::new(body),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Outcome of one test case.
#[derive(Debug, Clone)]
pub struct CaseReport {
    pub name: String,
    /// Precondition failure; the body did not run.
    pub setup_error: Option<String>,
    pub body_error: Option<String>,
    pub cleanup_error: Option<String>,
    pub duration: Duration,
}

impl CaseReport {
    pub fn passed(&self) -> bool {
        self.setup_error.is_none() && self.body_error.is_none() && self.cleanup_error.is_none()
    }
}

/// Outcome of a whole run.
#[derive(Debug, Clone, Default)]
pub struct SuiteReport {
    pub cases: Vec<CaseReport>,
}

impl SuiteReport {
    pub fn passed(&self) -> usize {
        self.cases.iter().filter(|c| c.passed()).count()
    }

    pub fn failed(&self) -> usize {
        self.cases.len() - self.passed()
    }

    pub fn success(&self) -> bool {
        self.failed() == 0
    }
}

pub struct Suite<D: Dialer = GrpcDialer> {
    name: String,
    context: SanityContext<D>,
    cases: Vec<TestCase<D>>,
}

impl Suite<GrpcDialer> {
    /// Build a suite from `config`, merging the test volume parameters
    /// file first. A broken parameters file aborts before any case runs.
    pub async fn from_config(name: impl Into<String>, mut config: Config) -> Result<Self> {
        config
            .load_test_volume_parameters()
            .await
            .map_err(SanityError::Parameters)?;
        Ok(Self::new(name, SanityContext::new(config)))
    }
}

impl<D: Dialer> Suite<D> {
    pub fn new(name: impl Into<String>, context: SanityContext<D>) -> Self {
        Self {
            name: name.into(),
            context,
            cases: Vec::new(),
        }
    }

    pub fn add(&mut self, case: TestCase<D>) -> &mut Self {
        self.cases.push(case);
        self
    }

    pub fn context(&self) -> &SanityContext<D> {
        &self.context
    }

    /// Run every case in registration order.
    pub async fn run(mut self) -> SuiteReport {
        info!(suite = %self.name, cases = self.cases.len(), "running test suite");
        let mut report = SuiteReport::default();

        for case in &self.cases {
            let result = run_case(&mut self.context, case).await;
            metrics::record_test_case(result.passed());
            if result.passed() {
                info!(case = %result.name, duration_ms = result.duration.as_millis() as u64, "passed");
            } else {
                error!(
                    case = %result.name,
                    setup_error = ?result.setup_error,
                    body_error = ?result.body_error,
                    cleanup_error = ?result.cleanup_error,
                    "failed"
                );
            }
            report.cases.push(result);
        }

        self.context.finish();
        info!(
            suite = %self.name,
            passed = report.passed(),
            failed = report.failed(),
            "test suite complete"
        );
        report
    }
}

async fn run_case<D: Dialer>(context: &mut SanityContext<D>, case: &TestCase<D>) -> CaseReport {
    let start = Instant::now();
    info!(case = %case.name, "running test case");

    let mut setup_error = None;
    let mut body_error = None;

    match context.setup().await {
        Ok(()) => {
            if let Err(e) = (case.body)(context).await {
                body_error = Some(e.to_string());
            }
        }
        Err(e) => setup_error = Some(e.to_string()),
    }

    // Paths created before a setup failure still need removing.
    let cleanup_error = context.teardown().await.err().map(|e| e.to_string());

    CaseReport {
        name: case.name.clone(),
        setup_error,
        body_error,
        cleanup_error,
        duration: start.elapsed(),
    }
}
