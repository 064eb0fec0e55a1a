use crate::{
    api::{
        flatten_tags, iso8601, CustomMetricRecord, MetricsRecord, ReportRecord, RequestSummary,
        SlowCall, CLIENT_NAME, LANGUAGE,
    },
    batch::Batcher,
    model::{Category, RequestInfo, Stats},
    span::Span,
};
use chrono::{DateTime, Utc};
use log::{debug, trace};
use serde_json::Value;
use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

const PRIORITY_DEFAULT: u8 = 1;
const PRIORITY_HTTP_ERROR: u8 = 5;
const PRIORITY_ERROR: u8 = 10;

/// Per-process settings shared by every transaction.
#[derive(Clone, Debug)]
pub struct Settings {
    pub server_name: String,
    pub client_name: String,
    /// Requests slower than this are reported in detail.
    pub slow_request_threshold: Duration,
    /// Child spans slower than this are listed in `slow_calls`.
    pub slow_call_threshold: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            server_name: "localhost".to_string(),
            client_name: CLIENT_NAME.to_string(),
            slow_request_threshold: Duration::from_secs(1),
            slow_call_threshold: Duration::from_millis(50),
        }
    }
}

/// The three delivery channels a finished transaction feeds.
pub struct Sinks {
    pub report: Batcher<ReportRecord>,
    pub metrics: Batcher<MetricsRecord>,
    pub custom_metrics: Batcher<CustomMetricRecord>,
}

impl Sinks {
    fn dispatch(&self, records: Records) {
        if let Some(report) = records.report {
            self.report.push(report);
        }
        if let Some(metrics) = records.metrics {
            self.metrics.push(metrics);
        }
        for metric in records.custom_metrics {
            self.custom_metrics.push(metric);
        }
    }

    pub fn flush(&self) {
        self.report.flush();
        self.metrics.flush();
        self.custom_metrics.flush();
    }
}

/// Everything a transaction emits when it ends.
#[derive(Debug, Clone, PartialEq)]
pub struct Records {
    pub report: Option<ReportRecord>,
    pub metrics: Option<MetricsRecord>,
    pub custom_metrics: Vec<CustomMetricRecord>,
}

struct State {
    name: String,
    status: u16,
    ended: bool,
    stats: Stats,
    slow_calls: Vec<SlowCall>,
    // Open child spans in start order.
    open: Vec<(u64, Category)>,
    cursor: Option<Instant>,
    root: Span,
}

/// One request: owns the root span and folds child spans into per-category stats.
pub struct Transaction {
    id: String,
    request: RequestInfo,
    tags: Vec<(String, String)>,
    start_time: DateTime<Utc>,
    settings: Arc<Settings>,
    sinks: Option<Arc<Sinks>>,
    state: Mutex<State>,
}

impl Transaction {
    pub fn new(
        request: RequestInfo,
        settings: Arc<Settings>,
        sinks: Option<Arc<Sinks>>,
    ) -> Arc<Transaction> {
        let id = request
            .request_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let tags = flatten_tags(&request.tags);
        let name = format!("{}:{}", request.method, request.path);
        trace!("Starting transaction {} ({})", id, name);
        Arc::new(Transaction {
            id,
            tags,
            start_time: Utc::now(),
            settings,
            sinks,
            state: Mutex::new(State {
                name,
                status: 200,
                ended: false,
                stats: Stats::default(),
                slow_calls: Vec::new(),
                open: Vec::new(),
                cursor: None,
                root: Span::new(Category::Main, None, None),
            }),
            request,
        })
    }

    /// A transaction with default settings that reports nowhere; [`Transaction::finish`]
    /// still returns its records.
    pub fn detached(request: RequestInfo) -> Arc<Transaction> {
        Transaction::new(request, Arc::new(Settings::default()), None)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> String {
        self.lock().name.clone()
    }

    /// Override the `METHOD:path` name, e.g. with the matched route pattern.
    pub fn set_name(&self, name: impl Into<String>) {
        self.lock().name = name.into();
    }

    pub fn request(&self) -> &RequestInfo {
        &self.request
    }

    pub fn tags(&self) -> &[(String, String)] {
        &self.tags
    }

    pub fn status(&self) -> u16 {
        self.lock().status
    }

    pub fn set_status(&self, status: u16) {
        self.lock().status = status;
    }

    pub fn stats(&self) -> Stats {
        self.lock().stats.clone()
    }

    pub fn slow_calls(&self) -> Vec<SlowCall> {
        self.lock().slow_calls.clone()
    }

    pub fn open_spans(&self) -> usize {
        self.lock().open.len()
    }

    pub fn is_ended(&self) -> bool {
        self.lock().ended
    }

    /// Start a child span. Its time is folded into this transaction's stats when it ends.
    pub fn start_span(
        self: &Arc<Self>,
        category: Category,
        name: Option<&str>,
        params: Option<Value>,
    ) -> Span {
        let owner = Arc::downgrade(self);
        let span = Span::with_callback(category, name, params, move |span| {
            if let Some(txn) = owner.upgrade() {
                txn.span_ended(span);
            }
        });
        if category != Category::Main {
            let mut state = self.lock();
            if !state.ended {
                state.open.push((span.id(), category));
                if state.cursor.is_none() {
                    state.cursor = Some(span.start_instant());
                }
            }
        }
        span
    }

    // Exclusive time: each close charges the time since the cursor to the closing
    // category unless a span of that same category is still the newest open one, in
    // which case the time is charged when that one closes. Charged intervals never
    // overlap, so no category can exceed the request's wall-clock time. With three or
    // more distinct categories interleaved the split between them is approximate.
    fn span_ended(&self, span: &Span) {
        let category = span.category();
        if category == Category::Main {
            return;
        }
        let mut state = self.lock();
        if state.ended {
            return;
        }
        state.stats.add_call(category);

        let position = match state.open.iter().position(|(id, _)| *id == span.id()) {
            Some(position) => position,
            None => return,
        };
        state.open.remove(position);

        let now = Instant::now();
        let own = span.duration().unwrap_or_default();
        let elapsed = state
            .cursor
            .map(|cursor| now.saturating_duration_since(cursor))
            .unwrap_or(own);
        let newest = state.open.last().map(|&(_, open)| open);
        match newest {
            None => {
                state.cursor = None;
                state.stats.add_duration(category, elapsed.as_secs_f64());
            }
            Some(open) if open != category => {
                state.cursor = Some(now);
                state.stats.add_duration(category, elapsed.as_secs_f64());
            }
            Some(_) => {}
        }

        if own > self.settings.slow_call_threshold {
            if let Some(call) = span.slow_call() {
                state.slow_calls.push(call);
            }
        }
    }

    /// End the transaction and build its records. `None` if it had already ended.
    pub fn finish(&self, error: Option<&dyn fmt::Display>) -> Option<Records> {
        let mut state = self.lock();
        if state.ended {
            return None;
        }
        state.ended = true;
        let duration = state.root.end();
        state.stats.main = duration.as_secs_f64();
        let end_time = Utc::now();

        let status = state.status;
        let report = if error.is_some()
            || duration > self.settings.slow_request_threshold
            || status >= 400
        {
            let (error, priority) = match error {
                Some(e) => (Some(e.to_string()), PRIORITY_ERROR),
                None if status >= 400 => {
                    (Some(format!("HTTP Error:{}", status)), PRIORITY_HTTP_ERROR)
                }
                None => (None, PRIORITY_DEFAULT),
            };
            Some(self.report_record(&state, &end_time, error, priority))
        } else {
            None
        };

        let (metrics, custom_metrics) = if state.stats.main > 0.0 {
            let custom_metrics: Vec<_> = state
                .slow_calls
                .iter()
                .filter_map(|call| self.remote_http_metric(call))
                .collect();
            (
                Some(MetricsRecord(state.name.clone(), state.stats.clone())),
                custom_metrics,
            )
        } else {
            (None, Vec::new())
        };

        debug!(
            "Finished transaction {} {} status={} main={:.3}s",
            self.id, state.name, status, state.stats.main
        );
        Some(Records {
            report,
            metrics,
            custom_metrics,
        })
    }

    /// End the transaction and queue its records for delivery. Later calls do nothing.
    pub fn end(&self, error: Option<&dyn fmt::Display>) {
        if let Some(records) = self.finish(error) {
            if let Some(ref sinks) = self.sinks {
                sinks.dispatch(records);
            }
        }
    }

    /// The response went out with `status`.
    pub fn respond(&self, status: u16) {
        self.set_status(status);
        self.end(None);
    }

    fn report_record(
        &self,
        state: &State,
        end_time: &DateTime<Utc>,
        error: Option<String>,
        priority: u8,
    ) -> ReportRecord {
        ReportRecord {
            client: self.settings.client_name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            language: LANGUAGE.to_string(),
            view_name: state.name.clone(),
            server: self.settings.server_name.clone(),
            http_status: state.status,
            ip: self.request.ip.clone(),
            start_time: iso8601(&self.start_time),
            end_time: iso8601(end_time),
            user_agent: self.request.user_agent.clone(),
            request_id: self.id.clone(),
            request: RequestSummary::new(
                &self.request.method,
                &self.request.path,
                &self.request.query,
            ),
            username: self
                .request
                .user
                .as_ref()
                .and_then(|u| u.username())
                .map(str::to_string),
            tags: self.tags.clone(),
            request_stats: state.stats.clone(),
            slow_calls: state.slow_calls.clone(),
            error,
            priority,
        }
    }

    fn remote_http_metric(&self, call: &SlowCall) -> Option<CustomMetricRecord> {
        if call.category != Category::Remote || call.subtype.as_deref() != Some("http") {
            return None;
        }
        let params = call.parameters.as_ref()?;
        let param = |key: &str| params.get(key).and_then(Value::as_str).filter(|v| !v.is_empty());
        let hostname = param("host").or_else(|| param("hostname"))?;
        Some(CustomMetricRecord::remote_http(
            call.start.clone(),
            &self.settings.server_name,
            param("method").unwrap_or("GET"),
            hostname,
            param("path").unwrap_or_default(),
            param("pathname").unwrap_or_default(),
            call.duration,
        ))
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("method", &self.request.method)
            .field("path", &self.request.path)
            .finish()
    }
}
