use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use parking_lot::RwLock;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use reqwest::blocking::{Client as HttpClient, RequestBuilder, Response};
use reqwest::header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;
use url::Url;

use crate::model::{Identity, SignUp};

const REST_PATH: &str = "rest/v1/";
const STORAGE_PATH: &str = "storage/v1/object/";
const AUTH_PATH: &str = "auth/v1/";

/// Characters escaped inside a single storage key segment.
const KEY_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'?')
    .add(b'<')
    .add(b'>')
    .add(b'`')
    .add(b'{')
    .add(b'}');

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub url: String,
    pub anon_key: String,
    pub media_bucket: String,
    pub user_agent: String,
    pub timeout: Option<Duration>,
    pub http_client: Option<HttpClient>,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub user: Identity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Ascending,
    Descending,
}

/// Row query in PostgREST syntax: column filters, ordering, and an
/// inclusive row range sent as a `Range` header.
#[derive(Debug, Clone, Default)]
pub struct Query {
    select: Option<String>,
    filters: Vec<(String, String)>,
    order: Vec<String>,
    limit: Option<usize>,
    range: Option<(usize, usize)>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(mut self, columns: &str) -> Self {
        let compact: String = columns.split_whitespace().collect();
        self.select = Some(compact);
        self
    }

    pub fn eq(self, column: &str, value: impl ToString) -> Self {
        self.filter(column, format!("eq.{}", value.to_string()))
    }

    pub fn neq(self, column: &str, value: impl ToString) -> Self {
        self.filter(column, format!("neq.{}", value.to_string()))
    }

    pub fn gte(self, column: &str, value: impl ToString) -> Self {
        self.filter(column, format!("gte.{}", value.to_string()))
    }

    pub fn lte(self, column: &str, value: impl ToString) -> Self {
        self.filter(column, format!("lte.{}", value.to_string()))
    }

    /// Case-insensitive substring match.
    pub fn ilike_contains(self, column: &str, fragment: &str) -> Self {
        self.filter(column, format!("ilike.*{}*", fragment))
    }

    pub fn in_list(self, column: &str, values: &[String]) -> Self {
        let list = format!("in.({})", join_list(values));
        self.filter(column, list)
    }

    pub fn not_in(self, column: &str, values: &[String]) -> Self {
        let list = format!("not.in.({})", join_list(values));
        self.filter(column, list)
    }

    pub fn order(mut self, column: &str, order: Order) -> Self {
        let dir = match order {
            Order::Ascending => "asc",
            Order::Descending => "desc",
        };
        self.order.push(format!("{}.{}", column, dir));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Inclusive row range, `from..=to`.
    pub fn range(mut self, from: usize, to: usize) -> Self {
        self.range = Some((from, to));
        self
    }

    fn filter(mut self, column: &str, expr: String) -> Self {
        self.filters.push((column.to_string(), expr));
        self
    }

    pub fn params(&self) -> Vec<(String, String)> {
        let mut params = Vec::new();
        if let Some(select) = &self.select {
            params.push(("select".to_string(), select.clone()));
        }
        params.extend(self.filters.iter().cloned());
        if !self.order.is_empty() {
            params.push(("order".to_string(), self.order.join(",")));
        }
        if let Some(limit) = self.limit {
            params.push(("limit".to_string(), limit.to_string()));
        }
        params
    }

    pub fn range_header(&self) -> Option<String> {
        self.range.map(|(from, to)| format!("{}-{}", from, to))
    }
}

fn join_list(values: &[String]) -> String {
    values
        .iter()
        .map(|value| {
            if value.contains(|c: char| matches!(c, ',' | '(' | ')' | '"')) {
                format!("\"{}\"", value.replace('"', "\\\""))
            } else {
                value.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

pub struct Client {
    http: HttpClient,
    base_url: Url,
    anon_key: String,
    bucket: String,
    user_agent: String,
    session: RwLock<Option<Session>>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self> {
        if config.url.trim().is_empty() {
            bail!("supabase: project url required");
        }
        if config.anon_key.trim().is_empty() {
            bail!("supabase: anon key required");
        }
        if config.media_bucket.trim().is_empty() {
            bail!("supabase: media bucket required");
        }
        let mut base = config.url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base).context("supabase: parse project url")?;
        let http = match config.http_client {
            Some(client) => client,
            None => HttpClient::builder()
                .timeout(config.timeout.unwrap_or(Duration::from_secs(20)))
                .build()
                .context("supabase: build http client")?,
        };

        Ok(Client {
            http,
            base_url,
            anon_key: config.anon_key,
            bucket: config.media_bucket,
            user_agent: config.user_agent,
            session: RwLock::new(None),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn set_session(&self, session: Option<Session>) {
        *self.session.write() = session;
    }

    pub fn session(&self) -> Option<Session> {
        self.session.read().clone()
    }

    pub fn select<T>(&self, table: &str, query: &Query) -> Result<Vec<T>>
    where
        T: DeserializeOwned,
    {
        let mut req = self.rest(Method::GET, table, query)?;
        if let Some(range) = query.range_header() {
            req = req.header("Range-Unit", "items").header("Range", range);
        }
        let resp = self.send(req)?;
        resp.json()
            .with_context(|| format!("supabase: decode {} rows", table))
    }

    pub fn select_one<T>(&self, table: &str, query: &Query) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        let rows: Vec<T> = self.select(table, &query.clone().limit(1))?;
        Ok(rows.into_iter().next())
    }

    /// Exact row count without transferring rows.
    pub fn count(&self, table: &str, query: &Query) -> Result<usize> {
        let req = self
            .rest(Method::HEAD, table, query)?
            .header("Prefer", "count=exact");
        let resp = self.send(req)?;
        parse_content_range(resp.headers())
            .ok_or_else(|| anyhow!("supabase: missing content-range for {}", table))
    }

    pub fn insert<B, T>(&self, table: &str, row: &B) -> Result<T>
    where
        B: Serialize,
        T: DeserializeOwned,
    {
        let req = self
            .rest(Method::POST, table, &Query::new())?
            .header("Prefer", "return=representation")
            .json(&[row]);
        let resp = self.send(req)?;
        let rows: Vec<T> = resp
            .json()
            .with_context(|| format!("supabase: decode inserted {} row", table))?;
        rows.into_iter()
            .next()
            .ok_or_else(|| anyhow!("supabase: insert into {} returned no row", table))
    }

    /// Insert without asking for the row back.
    pub fn insert_minimal<B>(&self, table: &str, row: &B) -> Result<()>
    where
        B: Serialize,
    {
        let req = self
            .rest(Method::POST, table, &Query::new())?
            .header("Prefer", "return=minimal")
            .json(&[row]);
        self.send(req)?;
        Ok(())
    }

    pub fn update<B, T>(&self, table: &str, query: &Query, patch: &B) -> Result<Vec<T>>
    where
        B: Serialize,
        T: DeserializeOwned,
    {
        let req = self
            .rest(Method::PATCH, table, query)?
            .header("Prefer", "return=representation")
            .json(patch);
        let resp = self.send(req)?;
        resp.json()
            .with_context(|| format!("supabase: decode updated {} rows", table))
    }

    pub fn delete(&self, table: &str, query: &Query) -> Result<()> {
        let req = self.rest(Method::DELETE, table, query)?;
        self.send(req)?;
        Ok(())
    }

    pub fn rpc<T>(&self, function: &str, args: &Value) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let url = self
            .base_url
            .join(&format!("{}rpc/{}", REST_PATH, function))?;
        debug!(function, "supabase rpc");
        let req = self.authorized(self.http.post(url)).json(args);
        let resp = self.send(req)?;
        resp.json()
            .with_context(|| format!("supabase: decode rpc {} result", function))
    }

    pub fn upload(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        self.upload_to(&self.bucket, key, bytes, content_type, false)
    }

    /// Stores an object in `bucket`; with `upsert` an existing key is
    /// overwritten instead of rejected.
    pub fn upload_to(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
        upsert: bool,
    ) -> Result<()> {
        if key.trim().is_empty() {
            bail!("supabase: storage key required");
        }
        let url = self.base_url.join(&format!(
            "{}{}/{}",
            STORAGE_PATH,
            bucket,
            encode_key(key)
        ))?;
        debug!(bucket, key, size = bytes.len(), "supabase upload");
        let req = self
            .authorized(self.http.post(url))
            .header(CONTENT_TYPE, content_type)
            .header("x-upsert", if upsert { "true" } else { "false" })
            .body(bytes);
        self.send(req)?;
        Ok(())
    }

    pub fn public_url(&self, key: &str) -> String {
        self.public_url_in(&self.bucket, key)
    }

    pub fn public_url_in(&self, bucket: &str, key: &str) -> String {
        format!(
            "{}{}public/{}/{}",
            self.base_url,
            STORAGE_PATH,
            bucket,
            encode_key(key)
        )
    }

    /// Identity behind the current session; `None` when signed out.
    pub fn current_user(&self) -> Result<Option<Identity>> {
        if self.session.read().is_none() {
            return Ok(None);
        }
        let url = self.base_url.join(&format!("{}user", AUTH_PATH))?;
        let req = self.authorized(self.http.get(url));
        let resp = self.send(req)?;
        let user: AuthUser = resp.json().context("supabase: decode auth user")?;
        Ok(Some(user.into()))
    }

    pub fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Identity> {
        let mut url = self.base_url.join(&format!("{}token", AUTH_PATH))?;
        url.query_pairs_mut().append_pair("grant_type", "password");
        let req = self
            .authorized(self.http.post(url))
            .json(&json!({ "email": email, "password": password }));
        let resp = self.send(req)?;
        let token: TokenResponse = resp.json().context("supabase: decode token response")?;
        let identity: Identity = token.user.into();
        self.set_session(Some(Session {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            user: identity.clone(),
        }));
        Ok(identity)
    }

    /// Registers a new identity. The caller's session is left untouched.
    pub fn sign_up(&self, request: &SignUp) -> Result<Identity> {
        let url = self.base_url.join(&format!("{}signup", AUTH_PATH))?;
        let body = json!({
            "email": request.email,
            "password": request.password,
            "data": { "full_name": request.full_name },
        });
        let req = self.authorized(self.http.post(url)).json(&body);
        let resp = self.send(req)?;
        let payload: Value = resp.json().context("supabase: decode signup response")?;
        // Depending on email confirmation settings the user is either the
        // root object or nested under `user`.
        let user_value = payload.get("user").cloned().unwrap_or(payload);
        let user: AuthUser =
            serde_json::from_value(user_value).context("supabase: decode signed up user")?;
        Ok(user.into())
    }

    fn rest(&self, method: Method, table: &str, query: &Query) -> Result<RequestBuilder> {
        let mut url = self.base_url.join(&format!("{}{}", REST_PATH, table))?;
        let params = query.params();
        if !params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in &params {
                pairs.append_pair(k, v);
            }
        }
        debug!(%method, table, "supabase request");
        Ok(self.authorized(self.http.request(method, url)))
    }

    fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        let token = self
            .session
            .read()
            .as_ref()
            .map(|session| session.access_token.clone())
            .unwrap_or_else(|| self.anon_key.clone());
        let mut req = req
            .header("apikey", self.anon_key.clone())
            .header(AUTHORIZATION, format!("Bearer {}", token));
        if !self.user_agent.is_empty() {
            req = req.header(USER_AGENT, self.user_agent.clone());
        }
        req
    }

    fn send(&self, req: RequestBuilder) -> Result<Response> {
        let resp = req.send().context("supabase: send request")?;
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let body = resp.text().unwrap_or_default();
        let message = error_message(&body).unwrap_or(body);
        match status.as_u16() {
            401 => Err(anyhow!("supabase: unauthorized: {}", message)),
            403 => Err(anyhow!("supabase: forbidden: {}", message)),
            404 => Err(anyhow!("supabase: not found: {}", message)),
            _ => Err(anyhow!("supabase: api error {}: {}", status, message)),
        }
    }
}

fn encode_key(key: &str) -> String {
    key.split('/')
        .map(|segment| utf8_percent_encode(segment, KEY_SEGMENT).to_string())
        .collect::<Vec<_>>()
        .join("/")
}

fn error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    ["message", "msg", "error_description", "error"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}

fn parse_content_range(headers: &HeaderMap) -> Option<usize> {
    headers
        .get("content-range")
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.rsplit('/').next())
        .and_then(|total| total.parse().ok())
}

#[derive(Debug, Deserialize)]
struct AuthUser {
    id: String,
    #[serde(default)]
    email: Option<String>,
}

impl From<AuthUser> for Identity {
    fn from(user: AuthUser) -> Self {
        Identity {
            id: user.id,
            email: user.email,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    user: AuthUser,
}
