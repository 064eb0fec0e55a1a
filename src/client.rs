use crate::{
    api::{
        iso8601, CustomMetricRecord, MetricsEnvelope, MetricsRecord, ReportRecord, CLIENT_NAME,
    },
    batch::{Batcher, Reporter},
    context::{self, FutureExt},
    error::ReportError,
    model::RequestInfo,
    transaction::{Settings, Sinks, Transaction},
};
use chrono::Utc;
use log::{trace, Level as LogLevel, Log, Metadata, Record};
use serde::Serialize;
use std::{fmt, future::Future, sync::Arc, time::Duration};

const PROTOCOL_VERSION: &str = "0.5";
const API_KEY_HEADER: &str = "X-appenlight-api-key";

/// Configuration settings for the client.
#[derive(Clone, Debug)]
pub struct Config {
    /// AppEnlight private api key
    pub api_key: String,
    /// Collector base url, defaults to `https://api.appenlight.com`.
    pub base_url: String,
    /// Name this server reports under, defaults to the host name.
    pub server_name: String,
    pub client_name: String,
    /// Requests slower than this get a detailed report, defaults to 1s.
    pub slow_request_threshold: Duration,
    /// Child spans slower than this are listed individually, defaults to 50ms.
    pub slow_call_threshold: Duration,
    pub report_interval: Duration,
    pub metrics_interval: Duration,
    pub custom_metrics_interval: Duration,
    /// Timeout for each delivery to the collector
    pub request_timeout: Duration,
    /// Optional Logging Config to also install the client as the main logger
    pub logging_config: Option<LoggingConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            api_key: "".to_string(),
            base_url: "https://api.appenlight.com".to_string(),
            server_name: default_server_name(),
            client_name: CLIENT_NAME.to_string(),
            slow_request_threshold: Duration::from_secs(1),
            slow_call_threshold: Duration::from_millis(50),
            report_interval: Duration::from_secs(5),
            metrics_interval: Duration::from_secs(60),
            custom_metrics_interval: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            logging_config: None,
        }
    }
}

impl Config {
    fn settings(&self) -> Settings {
        Settings {
            server_name: self.server_name.clone(),
            client_name: self.client_name.clone(),
            slow_request_threshold: self.slow_request_threshold,
            slow_call_threshold: self.slow_call_threshold,
        }
    }
}

fn default_server_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub time_format: String,
    pub mod_filter: Vec<&'static str>,
    pub body_filter: Vec<&'static str>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: LogLevel::Info,
            time_format: "%Y-%m-%d %H:%M:%S%z".to_string(),
            mod_filter: Vec::new(),
            body_filter: Vec::new(),
        }
    }
}

/// Entry point for a server: hands out transactions wired to the report,
/// metrics and custom-metrics channels.
#[derive(Clone)]
pub struct AppEnlight {
    settings: Arc<Settings>,
    sinks: Arc<Sinks>,
}

impl AppEnlight {
    pub fn new(config: Config) -> AppEnlight {
        let reporter = |api: &str| HttpReporter::new(&config, api);
        let sinks = Sinks {
            report: Batcher::new("report", config.report_interval, reporter("reports")),
            metrics: Batcher::new("metrics", config.metrics_interval, reporter("request_stats")),
            custom_metrics: Batcher::new(
                "custom-metrics",
                config.custom_metrics_interval,
                reporter("general_metrics"),
            ),
        };
        if let Some(ref lc) = config.logging_config {
            install_logger(lc.clone());
        }
        AppEnlight::with_sinks(config.settings(), sinks)
    }

    /// Build an agent around caller-supplied batchers, e.g. to deliver elsewhere.
    pub fn with_sinks(settings: Settings, sinks: Sinks) -> AppEnlight {
        AppEnlight {
            settings: Arc::new(settings),
            sinks: Arc::new(sinks),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Call when a request is received.
    pub fn start_transaction(&self, request: RequestInfo) -> Arc<Transaction> {
        Transaction::new(request, self.settings.clone(), Some(self.sinks.clone()))
    }

    /// Run a request handler as one transaction.
    ///
    /// The handler runs with the transaction ambient. `Ok(status)` ends it as a
    /// response with that status; `Err(e)` ends it as a failed request with
    /// status 500 and `e` as the error. The handler's result is returned as is.
    pub async fn handle<F, E>(&self, request: RequestInfo, handler: F) -> Result<u16, E>
    where
        F: Future<Output = Result<u16, E>>,
        E: fmt::Display,
    {
        let txn = self.start_transaction(request);
        let result = handler.with_transaction(txn.clone()).await;
        match result {
            Ok(status) => txn.respond(status),
            Err(ref e) => {
                txn.set_status(500);
                txn.end(Some(e));
            }
        }
        result
    }

    /// Run a synchronous handler as one transaction.
    pub fn handle_sync<F, E>(&self, request: RequestInfo, handler: F) -> Result<u16, E>
    where
        F: FnOnce() -> Result<u16, E>,
        E: fmt::Display,
    {
        let txn = self.start_transaction(request);
        let result = context::bind(&txn, handler);
        match result {
            Ok(status) => txn.respond(status),
            Err(ref e) => {
                txn.set_status(500);
                txn.end(Some(e));
            }
        }
        result
    }

    /// Deliver everything queued so far on all channels.
    pub fn flush(&self) {
        self.sinks.flush();
    }
}

/// Posts batches as JSON to one collector endpoint.
#[derive(Debug, Clone)]
pub struct HttpReporter {
    endpoint: String,
    api_key: String,
    server_name: String,
    timeout: Duration,
}

impl HttpReporter {
    /// `api` is the endpoint under `/api/`, e.g. `reports`.
    pub fn new(config: &Config, api: &str) -> HttpReporter {
        HttpReporter {
            endpoint: format!(
                "{}/api/{}?protocol_version={}",
                config.base_url.trim_end_matches('/'),
                api,
                PROTOCOL_VERSION
            ),
            api_key: config.api_key.clone(),
            server_name: config.server_name.clone(),
            timeout: config.request_timeout,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn post<P: Serialize + ?Sized>(&self, payload: &P) -> Result<(), ReportError> {
        let body = serde_json::to_vec(payload)?;
        trace!("Sending {} bytes to {}", body.len(), self.endpoint);
        let resp = attohttpc::post(&self.endpoint)
            .try_header(API_KEY_HEADER, self.api_key.as_str())?
            .header("Content-Type", "application/json")
            .timeout(self.timeout)
            .bytes(body)
            .send()?;
        if resp.is_success() {
            trace!("Sent to {}: {:?}", self.endpoint, resp.status());
            Ok(())
        } else {
            Err(ReportError::Status(resp.status().as_u16()))
        }
    }
}

impl Reporter<ReportRecord> for HttpReporter {
    fn submit(&self, records: Vec<ReportRecord>) -> Result<(), ReportError> {
        self.post(&records)
    }
}

impl Reporter<MetricsRecord> for HttpReporter {
    fn submit(&self, records: Vec<MetricsRecord>) -> Result<(), ReportError> {
        self.post(&[MetricsEnvelope {
            server: &self.server_name,
            timestamp: iso8601(&Utc::now()),
            metrics: &records,
        }])
    }
}

impl Reporter<CustomMetricRecord> for HttpReporter {
    fn submit(&self, records: Vec<CustomMetricRecord>) -> Result<(), ReportError> {
        self.post(&records)
    }
}

/// `log` backend that stamps each line with the current request id.
pub struct RequestLogger {
    config: LoggingConfig,
}

impl RequestLogger {
    pub fn new(config: LoggingConfig) -> RequestLogger {
        RequestLogger { config }
    }

    fn skip(&self, module: Option<&str>, body: &str) -> bool {
        let mod_skip = module
            .map(|m| self.config.mod_filter.iter().any(|f| m.contains(f)))
            .unwrap_or(false);
        let body_skip = self.config.body_filter.iter().any(|f| body.contains(f));
        mod_skip || body_skip
    }

    fn format(&self, level: LogLevel, module: Option<&str>, body: &str) -> String {
        let time = Utc::now().format(&self.config.time_format);
        let module = module.unwrap_or("-");
        match context::current() {
            Some(txn) => format!(
                "{time} {level} [request-id:{id}] [{module}] {body}",
                time = time,
                level = level,
                id = txn.id(),
                module = module,
                body = body
            ),
            None => format!(
                "{time} {level} [{module}] {body}",
                time = time,
                level = level,
                module = module,
                body = body
            ),
        }
    }
}

impl Log for RequestLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.config.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let body = format!("{}", record.args());
        if !self.skip(record.module_path(), &body) {
            println!("{}", self.format(record.level(), record.module_path(), &body));
        }
    }

    fn flush(&self) {}
}

/// Install a [`RequestLogger`] as the process logger. Only the first call in a
/// process takes effect.
pub fn install_logger(config: LoggingConfig) {
    let level = config.level;
    if log::set_boxed_logger(Box::new(RequestLogger::new(config))).is_ok() {
        log::set_max_level(level.to_level_filter());
    }
}
