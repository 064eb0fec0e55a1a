use crate::{
    api::{iso8601, SlowCall},
    context,
    model::Category,
};
use chrono::{DateTime, Utc};
use log::warn;
use serde_json::{json, Value};
use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};
use url::Url;

const SUBTYPE_MAX_LEN: usize = 14;

static NEXT_SPAN_ID: AtomicU64 = AtomicU64::new(1);

type OnEnd = Box<dyn FnOnce(&Span) + Send>;

/// One timed unit of categorized work.
///
/// A span ends exactly once: explicitly via [`Span::end`], or when dropped.
/// The completion callback given at creation runs on that first end only.
pub struct Span {
    id: u64,
    category: Category,
    name: Option<String>,
    params: Option<Value>,
    subtype: Option<String>,
    statement: Option<String>,
    start: Instant,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    duration: Option<Duration>,
    on_end: Option<OnEnd>,
}

impl Span {
    pub fn new(category: Category, name: Option<&str>, params: Option<Value>) -> Span {
        Span::build(category, name, params, None)
    }

    /// Start a span whose end is reported to `on_end`.
    pub fn with_callback<F>(
        category: Category,
        name: Option<&str>,
        params: Option<Value>,
        on_end: F,
    ) -> Span
    where
        F: FnOnce(&Span) + Send + 'static,
    {
        Span::build(category, name, params, Some(Box::new(on_end)))
    }

    fn build(
        category: Category,
        name: Option<&str>,
        params: Option<Value>,
        on_end: Option<OnEnd>,
    ) -> Span {
        let (subtype, statement) = match name.map(parse_name) {
            Some(Ok((subtype, statement))) => (Some(subtype), statement),
            Some(Err(e)) => {
                warn!("Invalid span name {:?}: {}", name.unwrap_or_default(), e);
                (None, None)
            }
            None => (None, None),
        };
        Span {
            id: NEXT_SPAN_ID.fetch_add(1, Ordering::Relaxed),
            category,
            name: name.map(str::to_string),
            params,
            subtype,
            statement,
            start: Instant::now(),
            started_at: Utc::now(),
            ended_at: None,
            duration: None,
            on_end,
        }
    }

    /// Record the end instant and notify the owner. Later calls are ignored.
    pub fn end(&mut self) -> Duration {
        if let Some(duration) = self.duration {
            return duration;
        }
        let duration = self.start.elapsed();
        self.duration = Some(duration);
        self.ended_at = Some(Utc::now());
        if let Some(on_end) = self.on_end.take() {
            on_end(self);
        }
        duration
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn params(&self) -> Option<&Value> {
        self.params.as_ref()
    }

    pub fn subtype(&self) -> Option<&str> {
        self.subtype.as_deref()
    }

    pub fn statement(&self) -> Option<&str> {
        self.statement.as_deref()
    }

    pub fn start_instant(&self) -> Instant {
        self.start
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn is_ended(&self) -> bool {
        self.duration.is_some()
    }

    /// Own duration; `None` while the span is still open.
    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    pub fn slow_call(&self) -> Option<SlowCall> {
        let duration = self.duration?;
        let ended_at = self.ended_at?;
        Some(SlowCall {
            start: iso8601(&self.started_at),
            end: iso8601(&ended_at),
            category: self.category,
            subtype: self.subtype.clone(),
            statement: self.statement.clone(),
            parameters: self.params.clone(),
            duration: duration.as_secs_f64(),
        })
    }
}

impl Drop for Span {
    fn drop(&mut self) {
        self.end();
    }
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Span")
            .field("id", &self.id)
            .field("category", &self.category)
            .field("name", &self.name)
            .field("duration", &self.duration)
            .finish()
    }
}

fn parse_name(name: &str) -> Result<(String, Option<String>), &'static str> {
    let head = name.split_once(':').map_or(name, |(head, _)| head);
    if head.trim().is_empty() {
        return Err("empty subtype");
    }
    let subtype = head.chars().take(SUBTYPE_MAX_LEN).collect();
    let statement = if name.contains(':') {
        Some(name.to_string())
    } else {
        None
    };
    Ok((subtype, statement))
}

/// Start a `remote` span for an outbound HTTP call on the current transaction.
///
/// The span is named `http:<METHOD>:<host>` and carries the parsed URL parts
/// so the transaction can emit per-destination latency metrics for it.
pub fn remote_http(method: &str, url: &str) -> Option<Span> {
    let txn = context::current()?;
    let parsed = match Url::parse(url) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!("Not tracing request to unparseable url {:?}: {}", url, e);
            return None;
        }
    };
    let hostname = parsed.host_str().unwrap_or_default().to_string();
    let host = match parsed.port() {
        Some(port) => format!("{}:{}", hostname, port),
        None => hostname.clone(),
    };
    let method = method.to_uppercase();
    let query = parsed.query().map(str::to_string);
    let path = match query {
        Some(ref q) => format!("{}?{}", parsed.path(), q),
        None => parsed.path().to_string(),
    };
    let params = json!({
        "href": parsed.as_str(),
        "host": host,
        "hostname": hostname,
        "port": parsed.port_or_known_default(),
        "method": method,
        "query": query,
        "path": path,
        "pathname": parsed.path(),
    });
    let name = format!("http:{}:{}", method, host);
    Some(txn.start_span(Category::Remote, Some(&name), Some(params)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_name_parsing() {
        let span = Span::new(Category::Sql, Some("postgresql:SELECT * FROM users"), None);
        assert_eq!(span.subtype(), Some("postgresql"));
        assert_eq!(span.statement(), Some("postgresql:SELECT * FROM users"));

        let span = Span::new(Category::Custom, Some("render_sidebar_widgets"), None);
        assert_eq!(span.subtype(), Some("render_sidebar"));
        assert_eq!(span.statement(), None);
    }

    #[test]
    fn test_malformed_name_leaves_fields_unset() {
        let span = Span::new(Category::Sql, Some(":SELECT 1"), None);
        assert_eq!(span.subtype(), None);
        assert_eq!(span.statement(), None);
        assert_eq!(span.name(), Some(":SELECT 1"));
    }

    #[test]
    fn test_subtype_truncates_on_char_boundary() {
        let span = Span::new(Category::Custom, Some("ééééééééééééééééé:x"), None);
        assert_eq!(span.subtype().map(|s| s.chars().count()), Some(14));
    }

    #[test]
    fn test_end_runs_callback_once() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let seen = calls.clone();
        let mut span = Span::with_callback(Category::Tmpl, Some("index"), None, move |s| {
            seen.lock().unwrap().push(s.duration().unwrap())
        });
        assert!(!span.is_ended());
        let first = span.end();
        std::thread::sleep(Duration::from_millis(5));
        let second = span.end();
        assert_eq!(first, second);
        drop(span);
        assert_eq!(*calls.lock().unwrap(), vec![first]);
    }

    #[test]
    fn test_drop_ends_span() {
        let calls = Arc::new(Mutex::new(0));
        let seen = calls.clone();
        {
            let _span = Span::with_callback(Category::Custom, None, None, move |_| {
                *seen.lock().unwrap() += 1
            });
        }
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[test]
    fn test_slow_call_only_after_end() {
        let mut span = Span::new(Category::Nosql, Some("redis:GET key"), Some(json!({"db": 0})));
        assert!(span.slow_call().is_none());
        span.end();
        let call = span.slow_call().unwrap();
        assert_eq!(call.category, Category::Nosql);
        assert_eq!(call.subtype.as_deref(), Some("redis"));
        assert_eq!(call.parameters, Some(json!({"db": 0})));
    }

    #[test]
    fn test_remote_http_without_transaction() {
        assert!(remote_http("GET", "https://example.com/").is_none());
    }
}
