//! Declarative single-request scenario driven from the config file.
//!
//! Strings may contain placeholders expanded on every iteration:
//! `{{fixture}}` (one random fixture record per iteration, reused across
//! url, headers and body), `{{rand:A:B}}` (uniform integer in `A..=B`) and
//! `{{now}}` (RFC 3339 timestamp).

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use http::Method;
use rand::Rng;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

use super::{Scenario, VuContext};
use crate::engine::http_client::HttpRequest;
use crate::error::{ConfigError, ScenarioError};
use crate::stats::threshold::Comparison;

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RequestTemplate {
    /// HTTP method (default: GET)
    #[serde(default = "default_method")]
    pub method: String,
    /// Target URL, placeholders allowed
    pub url: String,
    /// Request headers, placeholders allowed in values
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Raw request body
    pub body: Option<String>,
    /// Form fields sent as application/x-www-form-urlencoded (exclusive with `body`)
    #[serde(default)]
    pub form: BTreeMap<String, String>,
    /// Expected response status, checked as "status is <n>"
    #[serde(alias = "expectStatus")]
    pub expect_status: Option<u16>,
    /// Expected JSON fields (dotted paths), checked as "json <field> is <value>".
    /// A string value such as `"> 0"` compares the field numerically instead,
    /// checked as "json <field> > 0".
    #[serde(default, alias = "expectJson")]
    pub expect_json: BTreeMap<String, JsonValue>,
}

impl RequestTemplate {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: default_method(),
            url: url.into(),
            headers: BTreeMap::new(),
            body: None,
            form: BTreeMap::new(),
            expect_status: None,
            expect_json: BTreeMap::new(),
        }
    }

    /// Validate and pre-parse every placeholder.
    pub fn compile(&self) -> Result<TemplateScenario, ConfigError> {
        let method = Method::from_bytes(self.method.to_uppercase().as_bytes())
            .map_err(|_| ConfigError::InvalidTemplate(format!("unknown method '{}'", self.method)))?;
        if self.url.trim().is_empty() {
            return Err(ConfigError::InvalidTemplate("url is empty".to_string()));
        }
        if self.body.is_some() && !self.form.is_empty() {
            return Err(ConfigError::InvalidTemplate(
                "'body' and 'form' are mutually exclusive".to_string(),
            ));
        }

        let url = Text::parse(&self.url)?;
        let headers = self
            .headers
            .iter()
            .map(|(k, v)| Ok((k.clone(), Text::parse(v)?)))
            .collect::<Result<Vec<_>, ConfigError>>()?;
        let body = match &self.body {
            Some(raw) => Body::Raw(Text::parse(raw)?),
            None if !self.form.is_empty() => Body::Form(
                self.form
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), Text::parse(v)?)))
                    .collect::<Result<Vec<_>, ConfigError>>()?,
            ),
            None => Body::Empty,
        };
        let expect_json = self
            .expect_json
            .iter()
            .map(|(field, value)| JsonExpectation::new(field, value))
            .collect();

        let uses_fixture = url.uses_fixture()
            || headers.iter().any(|(_, v)| v.uses_fixture())
            || body.uses_fixture();

        Ok(TemplateScenario {
            name: format!("{} {}", method, self.url),
            method,
            url,
            headers,
            body,
            expect_status: self.expect_status,
            expect_json,
            uses_fixture,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Fixture,
    Rand(i64, i64),
    Now,
}

/// A string with its placeholders parsed out.
#[derive(Debug, Clone, PartialEq)]
struct Text(Vec<Segment>);

impl Text {
    fn parse(input: &str) -> Result<Self, ConfigError> {
        let mut segments = Vec::new();
        let mut rest = input;
        while let Some(open) = rest.find("{{") {
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_string()));
            }
            let after = &rest[open + 2..];
            let close = after.find("}}").ok_or_else(|| {
                ConfigError::InvalidTemplate(format!("unclosed placeholder in '{}'", input))
            })?;
            segments.push(parse_placeholder(after[..close].trim())?);
            rest = &after[close + 2..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }
        Ok(Text(segments))
    }

    fn uses_fixture(&self) -> bool {
        self.0.contains(&Segment::Fixture)
    }

    fn render(&self, vars: &mut Vars<'_>) -> String {
        let mut out = String::new();
        for segment in &self.0 {
            match segment {
                Segment::Literal(s) => out.push_str(s),
                Segment::Fixture => out.push_str(vars.fixture),
                Segment::Rand(lo, hi) => out.push_str(&vars.rng.gen_range(*lo..=*hi).to_string()),
                Segment::Now => out.push_str(&vars.now),
            }
        }
        out
    }
}

fn parse_placeholder(inner: &str) -> Result<Segment, ConfigError> {
    match inner {
        "fixture" => return Ok(Segment::Fixture),
        "now" => return Ok(Segment::Now),
        _ => {}
    }
    let bad = || ConfigError::InvalidTemplate(format!("unknown placeholder '{{{{{}}}}}'", inner));
    let range = inner.strip_prefix("rand:").ok_or_else(bad)?;
    let (lo, hi) = range.split_once(':').ok_or_else(bad)?;
    let lo: i64 = lo.trim().parse().map_err(|_| bad())?;
    let hi: i64 = hi.trim().parse().map_err(|_| bad())?;
    if lo > hi {
        return Err(ConfigError::InvalidTemplate(format!(
            "empty range in '{{{{{}}}}}'",
            inner
        )));
    }
    Ok(Segment::Rand(lo, hi))
}

struct Vars<'a> {
    fixture: &'a str,
    now: String,
    rng: rand::rngs::ThreadRng,
}

#[derive(Debug, Clone)]
enum Body {
    Empty,
    Raw(Text),
    Form(Vec<(String, Text)>),
}

impl Body {
    fn uses_fixture(&self) -> bool {
        match self {
            Body::Empty => false,
            Body::Raw(text) => text.uses_fixture(),
            Body::Form(fields) => fields.iter().any(|(_, v)| v.uses_fixture()),
        }
    }
}

#[derive(Debug, Clone)]
struct JsonExpectation {
    label: String,
    pointer: String,
    expected: Expected,
}

#[derive(Debug, Clone)]
enum Expected {
    Equals(JsonValue),
    Compare(Comparison, f64),
}

impl JsonExpectation {
    fn new(field: &str, value: &JsonValue) -> Self {
        let pointer = json_pointer(field);
        if let Some(text) = value.as_str() {
            if let Some((comparison, bound)) = parse_comparison(text) {
                return Self {
                    label: format!("json {} {}", field, text.trim()),
                    pointer,
                    expected: Expected::Compare(comparison, bound),
                };
            }
        }
        Self {
            label: format!("json {} is {}", field, value),
            pointer,
            expected: Expected::Equals(value.clone()),
        }
    }

    fn holds(&self, actual: &JsonValue) -> bool {
        match &self.expected {
            Expected::Equals(value) => json_matches(actual, value),
            Expected::Compare(comparison, bound) => actual
                .as_f64()
                .is_some_and(|a| actual.is_number() && comparison.holds(a, *bound)),
        }
    }
}

/// `"> 0"` or `"<=10"`; anything without a numeric bound stays a plain string.
fn parse_comparison(text: &str) -> Option<(Comparison, f64)> {
    let (comparison, rest) = Comparison::split_prefix(text.trim())?;
    let bound: f64 = rest.trim().parse().ok()?;
    Some((comparison, bound))
}

/// `data.id` becomes `/data/id`; a leading `/` is taken as a JSON pointer.
fn json_pointer(field: &str) -> String {
    if field.starts_with('/') {
        field.to_string()
    } else {
        field
            .split('.')
            .map(|part| part.replace('~', "~0").replace('/', "~1"))
            .fold(String::new(), |mut acc, part| {
                acc.push('/');
                acc.push_str(&part);
                acc
            })
    }
}

/// Numbers compare by value so that `0` matches `0.0`.
fn json_matches(actual: &JsonValue, expected: &JsonValue) -> bool {
    match (actual.as_f64(), expected.as_f64()) {
        (Some(a), Some(b)) if actual.is_number() && expected.is_number() => a == b,
        _ => actual == expected,
    }
}

/// Compiled [`RequestTemplate`].
#[derive(Debug, Clone)]
pub struct TemplateScenario {
    name: String,
    method: Method,
    url: Text,
    headers: Vec<(String, Text)>,
    body: Body,
    expect_status: Option<u16>,
    expect_json: Vec<JsonExpectation>,
    uses_fixture: bool,
}

impl TemplateScenario {
    /// The template references `{{fixture}}` and needs a fixture source.
    pub fn uses_fixture(&self) -> bool {
        self.uses_fixture
    }

    fn build_request(&self, fixture: &str) -> HttpRequest {
        let mut vars = Vars {
            fixture,
            now: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            rng: rand::thread_rng(),
        };
        let mut req = HttpRequest::new(self.method.clone(), self.url.render(&mut vars));
        for (name, value) in &self.headers {
            req = req.header(name.clone(), value.render(&mut vars));
        }
        match &self.body {
            Body::Empty => req,
            Body::Raw(text) => req.body(text.render(&mut vars)),
            Body::Form(fields) => {
                let mut form = url::form_urlencoded::Serializer::new(String::new());
                for (name, value) in fields {
                    form.append_pair(name, &value.render(&mut vars));
                }
                let has_content_type = self
                    .headers
                    .iter()
                    .any(|(k, _)| k.eq_ignore_ascii_case("content-type"));
                if !has_content_type {
                    req = req.header("Content-Type", "application/x-www-form-urlencoded");
                }
                req.body(form.finish())
            }
        }
    }
}

#[async_trait]
impl Scenario for TemplateScenario {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, vu: &mut VuContext) -> Result<(), ScenarioError> {
        let fixture = if self.uses_fixture {
            vu.fixtures()
                .random_str()
                .ok_or_else(|| ScenarioError::msg("template uses {{fixture}} but no fixtures are loaded"))?
        } else {
            String::new()
        };
        let req = self.build_request(&fixture);

        let response = vu.request(req).await?;

        if let Some(expected) = self.expect_status {
            vu.check(&format!("status is {}", expected), response.status_code() == expected);
        }
        if !self.expect_json.is_empty() {
            let body = response.json().ok();
            for expectation in &self.expect_json {
                let ok = body
                    .as_ref()
                    .and_then(|b| b.pointer(&expectation.pointer))
                    .is_some_and(|actual| expectation.holds(actual));
                vu.check(&expectation.label, ok);
            }
        }
        Ok(())
    }
}
