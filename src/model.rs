use serde::Serialize;
use serde_json::Value;
use std::fmt;

/// Kind of work a span measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Main,
    Sql,
    Nosql,
    Remote,
    Tmpl,
    Custom,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::Main,
        Category::Sql,
        Category::Nosql,
        Category::Remote,
        Category::Tmpl,
        Category::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Main => "main",
            Category::Sql => "sql",
            Category::Nosql => "nosql",
            Category::Remote => "remote",
            Category::Tmpl => "tmpl",
            Category::Custom => "custom",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-category exclusive time (seconds) and call counts for one request.
///
/// Every category has a field, so a serialized `Stats` always carries the
/// complete set even when nothing of that kind ran.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Stats {
    pub main: f64,
    pub nosql: f64,
    pub nosql_calls: u64,
    pub remote: f64,
    pub remote_calls: u64,
    pub sql: f64,
    pub sql_calls: u64,
    pub tmpl: f64,
    pub tmpl_calls: u64,
    pub custom: f64,
    pub custom_calls: u64,
}

impl Stats {
    pub fn duration(&self, category: Category) -> f64 {
        match category {
            Category::Main => self.main,
            Category::Sql => self.sql,
            Category::Nosql => self.nosql,
            Category::Remote => self.remote,
            Category::Tmpl => self.tmpl,
            Category::Custom => self.custom,
        }
    }

    /// Call count for a category. The root span is not counted.
    pub fn calls(&self, category: Category) -> u64 {
        match category {
            Category::Main => 0,
            Category::Sql => self.sql_calls,
            Category::Nosql => self.nosql_calls,
            Category::Remote => self.remote_calls,
            Category::Tmpl => self.tmpl_calls,
            Category::Custom => self.custom_calls,
        }
    }

    pub(crate) fn add_duration(&mut self, category: Category, seconds: f64) {
        match category {
            Category::Main => self.main += seconds,
            Category::Sql => self.sql += seconds,
            Category::Nosql => self.nosql += seconds,
            Category::Remote => self.remote += seconds,
            Category::Tmpl => self.tmpl += seconds,
            Category::Custom => self.custom += seconds,
        }
    }

    pub(crate) fn add_call(&mut self, category: Category) {
        match category {
            Category::Main => {}
            Category::Sql => self.sql_calls += 1,
            Category::Nosql => self.nosql_calls += 1,
            Category::Remote => self.remote_calls += 1,
            Category::Tmpl => self.tmpl_calls += 1,
            Category::Custom => self.custom_calls += 1,
        }
    }
}

/// Authenticated user attached to a request.
#[derive(Debug, Clone, Default)]
pub struct User {
    pub display_name: Option<String>,
    pub id: Option<String>,
}

impl User {
    pub fn username(&self) -> Option<&str> {
        self.display_name.as_deref().or(self.id.as_deref())
    }
}

/// Request metadata supplied by the host framework when a request begins.
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    pub method: String,
    pub path: String,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub user: Option<User>,
    pub request_id: Option<String>,
    pub query: Vec<(String, String)>,
    pub tags: Value,
}

impl RequestInfo {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        RequestInfo {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_user(mut self, user: User) -> Self {
        self.user = Some(user);
        self
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Nested tag structure, flattened into dotted keys when the transaction starts.
    pub fn with_tags(mut self, tags: Value) -> Self {
        self.tags = tags;
        self
    }
}
