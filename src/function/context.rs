use std::fmt;
use std::sync::Arc;

use tracing::Span;

type ProgressSink = Arc<dyn Fn(u8) + Send + Sync>;

/// Per-call context handed to a function handler.
#[derive(Clone)]
pub struct ExecutionContext {
    pub job_id: Option<String>,
    pub attempt: u32,
    pub correlation_id: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    span: Span,
    progress: Option<ProgressSink>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self {
            job_id: None,
            attempt: 1,
            correlation_id: None,
            user_id: None,
            session_id: None,
            span: Span::current(),
            progress: None,
        }
    }

    pub fn for_job(job_id: &str, attempt: u32) -> Self {
        Self {
            job_id: Some(job_id.to_string()),
            attempt,
            span: tracing::info_span!(
                "job",
                job_id = %job_id,
                attempt,
                correlation_id = tracing::field::Empty
            ),
            ..Self::new()
        }
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        let correlation_id = correlation_id.into();
        self.span.record("correlation_id", correlation_id.as_str());
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_user(mut self, user_id: Option<String>, session_id: Option<String>) -> Self {
        self.user_id = user_id;
        self.session_id = session_id;
        self
    }

    pub fn with_progress(mut self, sink: impl Fn(u8) + Send + Sync + 'static) -> Self {
        self.progress = Some(Arc::new(sink));
        self
    }

    /// Span handlers can enter or instrument with to log under this call.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Reports completion percentage; values above 100 are clamped.
    pub fn report_progress(&self, percent: u8) {
        if let Some(sink) = &self.progress {
            sink(percent.min(100));
        }
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("job_id", &self.job_id)
            .field("attempt", &self.attempt)
            .field("correlation_id", &self.correlation_id)
            .field("user_id", &self.user_id)
            .field("session_id", &self.session_id)
            .finish()
    }
}
