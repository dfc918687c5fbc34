//! JSON-over-HTTP gateway.
//!
//! Talks to OpenStack-style REST APIs: objects are wrapped in a singular
//! envelope (`{"server": {...}}`), collections in a plural one
//! (`{"servers": [...]}`), and the token travels in `X-Auth-Token`.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, header};
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::error::{GatewayError, SchemaViolation};
use crate::resources::{ALLOCATION_POOL, AllocationPool, RULES, RuleSource, SecurityGroupRule};
use crate::schema::{AttributeSet, AttributeValue};

use super::{Created, Observed, ResourceGateway};

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Maximum number of attempts for transient failures.
const MAX_RETRIES: u32 = 3;

/// Delay between retries in milliseconds, multiplied by the attempt number.
const RETRY_DELAY_MS: u64 = 1000;

/// Header carrying the auth token.
const AUTH_HEADER: &str = "X-Auth-Token";

/// Status reported for objects whose API has no status field.
const IMPLICIT_STATUS: &str = "ACTIVE";

/// Remote field holding a subnet's allocation pools.
const POOLS_FIELD: &str = "allocation_pools";

/// Collection security group rules are created in.
const RULES_COLLECTION: &str = "/v2.0/security-group-rules";

/// Remote field listing a security group's rules.
const RULES_FIELD: &str = "security_group_rules";

/// Rule protocol meaning every protocol.
const ANY_PROTOCOL: &str = "any";

/// HTTP client bound to one service endpoint.
#[derive(Debug, Clone)]
pub struct RestClient {
    client: Client,
    base_url: String,
    token: Option<String>,
    retry_delay: Duration,
}

impl RestClient {
    /// Creates a client for `base_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(base_url: &str) -> Result<Self, GatewayError> {
        Self::with_timeout(base_url, DEFAULT_TIMEOUT_SECS)
    }

    /// Creates a client with a custom request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_timeout(base_url: &str, timeout_secs: u64) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| GatewayError::network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
            retry_delay: Duration::from_millis(RETRY_DELAY_MS),
        })
    }

    /// Sets the auth token.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Sets the base delay between retries.
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Endpoint this client talks to.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Issues a GET.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn get(&self, path: &str) -> Result<Value, GatewayError> {
        self.execute(Method::GET, path, None).await
    }

    /// Issues a POST with a JSON body.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn post(&self, path: &str, body: &Value) -> Result<Value, GatewayError> {
        self.execute(Method::POST, path, Some(body)).await
    }

    /// Issues a PUT with a JSON body.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn put(&self, path: &str, body: &Value) -> Result<Value, GatewayError> {
        self.execute(Method::PUT, path, Some(body)).await
    }

    /// Issues a DELETE.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn delete(&self, path: &str) -> Result<(), GatewayError> {
        self.execute(Method::DELETE, path, None).await.map(|_| ())
    }

    /// Executes a request, retrying transient failures.
    async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, GatewayError> {
        let mut last_error = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                debug!("Retry attempt {attempt} of {MAX_RETRIES} for {method} {path}");
                tokio::time::sleep(self.retry_delay * attempt).await;
            }

            match self.execute_once(method.clone(), path, body).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => last_error = Some(e),
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| GatewayError::network("Max retries exceeded")))
    }

    async fn execute_once(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, GatewayError> {
        let url = format!("{}{}", self.base_url, path);
        trace!("{} {}", method, url);

        let mut request = self
            .client
            .request(method, &url)
            .header(header::ACCEPT, "application/json");
        if let Some(token) = &self.token {
            request = request.header(AUTH_HEADER, token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::network(format!("Request failed: {e}")))?;

        let status = response.status();
        match status {
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = response
                    .headers()
                    .get(header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse().ok())
                    .unwrap_or_default();
                let retry_after = if retry_after == 0 { 60 } else { retry_after };
                return Err(GatewayError::RateLimited {
                    retry_after_secs: retry_after,
                });
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(GatewayError::AuthenticationFailed {
                    message: String::from("Token rejected"),
                });
            }
            StatusCode::NOT_FOUND => return Err(GatewayError::not_found("", path)),
            StatusCode::CONFLICT => {
                let body = response.text().await.unwrap_or_default();
                return Err(GatewayError::conflict("", path, body));
            }
            _ => {}
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::remote(status.as_u16(), body));
        }

        let text = response
            .text()
            .await
            .map_err(|e| GatewayError::network(format!("Failed to read response: {e}")))?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| GatewayError::InvalidResponse {
            message: format!("Failed to parse response: {e}"),
        })
    }
}

/// A collection attribute whose items travel as JSON objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Structured {
    /// Subnet `allocation_pool`, sent inline as `allocation_pools`.
    AllocationPools,
    /// Security group `rules`, created one call each after the group and
    /// read back from `security_group_rules`.
    IngressRules,
}

impl Structured {
    const fn attribute(self) -> &'static str {
        match self {
            Self::AllocationPools => ALLOCATION_POOL,
            Self::IngressRules => RULES,
        }
    }

    const fn field(self) -> &'static str {
        match self {
            Self::AllocationPools => POOLS_FIELD,
            Self::IngressRules => RULES_FIELD,
        }
    }
}

/// How one resource type maps onto a REST collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestEndpoint {
    /// Service the collection belongs to (`compute` or `network`).
    pub service: String,
    /// Collection path, e.g. `/servers`.
    pub collection: String,
    /// Singular envelope key, e.g. `server`.
    pub envelope: String,
    /// Plural envelope key used by list responses.
    pub plural: String,
    /// Field holding the remote status, if the API reports one.
    pub status_field: Option<String>,
    /// Local attribute name to remote field name.
    pub renames: BTreeMap<String, String>,
    /// Remote fields that read back under another local name, such as a
    /// nested `{"id": ...}` reference.
    pub aliases: BTreeMap<String, String>,
    /// Remote fields to read back. Empty means every field.
    pub fields: BTreeSet<String>,
    /// Whether the collection supports the resize action.
    pub resizable: bool,
    /// Attribute encoded as objects rather than primitives.
    pub structured: Option<Structured>,
}

impl RestEndpoint {
    /// Creates an endpoint with a status field named `status`.
    #[must_use]
    pub fn new(service: &str, collection: &str, envelope: &str, plural: &str) -> Self {
        Self {
            service: service.to_string(),
            collection: collection.to_string(),
            envelope: envelope.to_string(),
            plural: plural.to_string(),
            status_field: Some(String::from("status")),
            renames: BTreeMap::new(),
            aliases: BTreeMap::new(),
            fields: BTreeSet::new(),
            resizable: false,
            structured: None,
        }
    }

    /// Marks the API as reporting no status.
    #[must_use]
    pub fn without_status(mut self) -> Self {
        self.status_field = None;
        self
    }

    /// Maps a local attribute to a differently named remote field.
    #[must_use]
    pub fn rename(mut self, local: &str, remote: &str) -> Self {
        self.renames.insert(local.to_string(), remote.to_string());
        self
    }

    /// Reads the remote field `remote` into the local attribute `local`.
    #[must_use]
    pub fn alias(mut self, remote: &str, local: &str) -> Self {
        self.aliases.insert(remote.to_string(), local.to_string());
        self
    }

    /// Restricts which remote fields are read back.
    #[must_use]
    pub fn with_fields(mut self, fields: &[&str]) -> Self {
        self.fields = fields.iter().map(|f| (*f).to_string()).collect();
        self
    }

    /// Enables the resize action.
    #[must_use]
    pub const fn resizable(mut self) -> Self {
        self.resizable = true;
        self
    }

    /// Encodes one attribute's items as objects.
    #[must_use]
    pub const fn with_structured(mut self, structured: Structured) -> Self {
        self.structured = Some(structured);
        self
    }

    /// Endpoint for one of the built-in resource kinds.
    #[must_use]
    pub fn builtin(kind: &str) -> Option<Self> {
        let endpoint = match kind {
            "compute" => Self::new("compute", "/servers", "server", "servers")
                .rename("image_ref", "imageRef")
                .rename("flavor_ref", "flavorRef")
                .rename("key_pair_name", "key_name")
                .rename("access_ip_v4", "accessIPv4")
                .alias("image", "image_ref")
                .alias("flavor", "flavor_ref")
                .with_fields(&[
                    "name",
                    "image",
                    "flavor",
                    "imageRef",
                    "flavorRef",
                    "key_name",
                    "accessIPv4",
                    "tenant_id",
                    "status",
                ])
                .resizable(),
            "network" => Self::new("network", "/v2.0/networks", "network", "networks")
                .with_fields(&["name", "admin_state_up", "shared", "tenant_id", "status"]),
            "subnet" => Self::new("network", "/v2.0/subnets", "subnet", "subnets")
                .without_status()
                .with_structured(Structured::AllocationPools),
            "router" => Self::new("network", "/v2.0/routers", "router", "routers").with_fields(&[
                "name",
                "admin_state_up",
                "tenant_id",
                "status",
            ]),
            "firewall" => Self::new("network", "/v2.0/fw/firewalls", "firewall", "firewalls"),
            "firewall_policy" => Self::new(
                "network",
                "/v2.0/fw/firewall_policies",
                "firewall_policy",
                "firewall_policies",
            )
            .without_status(),
            "firewall_rule" => Self::new(
                "network",
                "/v2.0/fw/firewall_rules",
                "firewall_rule",
                "firewall_rules",
            )
            .without_status(),
            "lb_pool" => Self::new("network", "/v2.0/lb/pools", "pool", "pools"),
            "lb_member" => Self::new("network", "/v2.0/lb/members", "member", "members"),
            "lb_monitor" => Self::new(
                "network",
                "/v2.0/lb/health_monitors",
                "health_monitor",
                "health_monitors",
            ),
            "lb_vip" => Self::new("network", "/v2.0/lb/vips", "vip", "vips"),
            "security_group" => Self::new(
                "network",
                "/v2.0/security-groups",
                "security_group",
                "security_groups",
            )
            .without_status()
            .with_fields(&["name", "description", "tenant_id"])
            .with_structured(Structured::IngressRules),
            _ => return None,
        };
        Some(endpoint)
    }

    fn remote_name<'a>(&'a self, local: &'a str) -> &'a str {
        self.renames.get(local).map_or(local, String::as_str)
    }

    fn local_name<'a>(&'a self, remote: &'a str) -> &'a str {
        if let Some(local) = self.aliases.get(remote) {
            return local;
        }
        self.renames
            .iter()
            .find(|(_, r)| r.as_str() == remote)
            .map_or(remote, |(l, _)| l.as_str())
    }
}

/// Gateway for one resource type backed by a REST collection.
#[derive(Debug, Clone)]
pub struct RestGateway {
    resource_type: String,
    client: RestClient,
    endpoint: RestEndpoint,
}

impl RestGateway {
    /// Creates a gateway.
    #[must_use]
    pub fn new(resource_type: impl Into<String>, client: RestClient, endpoint: RestEndpoint) -> Self {
        Self {
            resource_type: resource_type.into(),
            client,
            endpoint,
        }
    }

    fn object_path(&self, id: &str) -> String {
        format!("{}/{}", self.endpoint.collection, id)
    }

    /// Fills in the resource type and ID of errors raised by the client.
    fn contextualize(&self, error: GatewayError, id: &str) -> GatewayError {
        match error {
            GatewayError::NotFound { .. } => GatewayError::not_found(&self.resource_type, id),
            GatewayError::Conflict { message, .. } => {
                GatewayError::conflict(&self.resource_type, id, message)
            }
            other => other,
        }
    }

    fn wrap(&self, attributes: &AttributeSet) -> Result<Value, GatewayError> {
        let structured = self.endpoint.structured.map(Structured::attribute);
        let mut body: Map<String, Value> = attributes
            .to_json()
            .into_iter()
            .filter(|(k, _)| Some(k.as_str()) != structured)
            .map(|(k, v)| (self.endpoint.remote_name(&k).to_string(), v))
            .collect();
        if self.endpoint.structured == Some(Structured::AllocationPools)
            && let Some(value) = attributes.get(ALLOCATION_POOL)
        {
            let pools = parse_items::<AllocationPool>(value)?;
            body.insert(
                POOLS_FIELD.to_string(),
                Value::Array(pools.iter().map(pool_to_json).collect()),
            );
        }
        let mut envelope = Map::new();
        envelope.insert(self.endpoint.envelope.clone(), Value::Object(body));
        Ok(Value::Object(envelope))
    }

    fn unwrap<'v>(&self, body: &'v Value) -> Result<&'v Map<String, Value>, GatewayError> {
        body.get(&self.endpoint.envelope)
            .and_then(Value::as_object)
            .ok_or_else(|| GatewayError::InvalidResponse {
                message: format!("response has no '{}' object", self.endpoint.envelope),
            })
    }

    fn attributes(&self, object: &Map<String, Value>) -> Result<AttributeSet, GatewayError> {
        let status_field = self.endpoint.status_field.as_deref();
        let kept: Map<String, Value> = object
            .iter()
            .filter(|(k, _)| k.as_str() != "id" && Some(k.as_str()) != status_field)
            .filter(|(k, _)| self.endpoint.fields.is_empty() || self.endpoint.fields.contains(*k))
            .map(|(k, v)| (self.endpoint.local_name(k).to_string(), flatten_reference(v)))
            .collect();
        let mut set = AttributeSet::from_json(&kept)?;
        if let Some(structured) = self.endpoint.structured
            && let Some(items) = object.get(structured.field()).and_then(Value::as_array)
        {
            let decoded: Vec<String> = match structured {
                Structured::AllocationPools => items.iter().filter_map(pool_from_json).collect(),
                Structured::IngressRules => items.iter().filter_map(rule_from_json).collect(),
            };
            set.insert(structured.attribute(), AttributeValue::strings(decoded));
        }
        Ok(set)
    }

    async fn create_rules(&self, group_id: &str, rules: &[SecurityGroupRule]) -> Result<(), GatewayError> {
        for rule in rules {
            self.client
                .post(RULES_COLLECTION, &rule_to_json(rule, group_id))
                .await
                .map_err(|e| self.contextualize(e, group_id))?;
            debug!("Added rule {} to {} {}", rule, self.resource_type, group_id);
        }
        Ok(())
    }

    fn status_of(&self, object: &Map<String, Value>) -> String {
        self.endpoint
            .status_field
            .as_ref()
            .and_then(|field| object.get(field))
            .and_then(Value::as_str)
            .unwrap_or(IMPLICIT_STATUS)
            .to_string()
    }

    async fn action(&self, id: &str, body: &Value, operation: &str) -> Result<(), GatewayError> {
        if !self.endpoint.resizable {
            return Err(GatewayError::unsupported(&self.resource_type, operation));
        }
        self.client
            .post(&format!("{}/action", self.object_path(id)), body)
            .await
            .map(|_| ())
            .map_err(|e| self.contextualize(e, id))
    }
}

fn parse_items<T>(value: &AttributeValue) -> Result<Vec<T>, GatewayError>
where
    T: FromStr<Err = SchemaViolation>,
{
    value
        .as_list()
        .unwrap_or_default()
        .iter()
        .map(|item| {
            item.to_string()
                .parse()
                .map_err(|e: SchemaViolation| GatewayError::InvalidRequest {
                    message: e.to_string(),
                })
        })
        .collect()
}

fn pool_to_json(pool: &AllocationPool) -> Value {
    json!({ "start": pool.start, "end": pool.end })
}

fn pool_from_json(pool: &Value) -> Option<String> {
    let start = pool.get("start").and_then(Value::as_str)?;
    let end = pool.get("end").and_then(Value::as_str)?;
    Some(format!("{start}-{end}"))
}

fn rule_to_json(rule: &SecurityGroupRule, group_id: &str) -> Value {
    let (cidr, group) = match &rule.source {
        RuleSource::Cidr(cidr) => (Some(cidr), None),
        RuleSource::Group(group) => (None, Some(group)),
    };
    let ethertype = if rule.is_ipv6() { "IPv6" } else { "IPv4" };
    json!({
        "security_group_rule": {
            "security_group_id": group_id,
            "direction": "ingress",
            "ethertype": ethertype,
            "protocol": (rule.protocol != ANY_PROTOCOL).then_some(&rule.protocol),
            "port_range_min": (rule.from_port >= 0).then_some(rule.from_port),
            "port_range_max": (rule.to_port >= 0).then_some(rule.to_port),
            "remote_ip_prefix": cidr,
            "remote_group_id": group
        }
    })
}

/// Decodes an ingress rule. Egress rules are not managed.
fn rule_from_json(rule: &Value) -> Option<String> {
    if rule.get("direction").and_then(Value::as_str) != Some("ingress") {
        return None;
    }
    let text = |field: &str| rule.get(field).and_then(Value::as_str);
    let port = |field: &str| rule.get(field).and_then(Value::as_i64).unwrap_or(-1);
    let source = match (text("remote_ip_prefix"), text("remote_group_id")) {
        (Some(cidr), _) => RuleSource::Cidr(cidr.to_string()),
        (None, Some(group)) => RuleSource::Group(group.to_string()),
        (None, None) if text("ethertype") == Some("IPv6") => RuleSource::Cidr(String::from("::/0")),
        (None, None) => RuleSource::Cidr(String::from("0.0.0.0/0")),
    };
    let rule = SecurityGroupRule {
        protocol: text("protocol").unwrap_or(ANY_PROTOCOL).to_string(),
        from_port: port("port_range_min"),
        to_port: port("port_range_max"),
        source,
    };
    Some(rule.to_string())
}

/// Collapses `{"id": "x", "links": [...]}` references to `"x"`.
fn flatten_reference(value: &Value) -> Value {
    match value.get("id") {
        Some(Value::String(id)) if value.is_object() => Value::String(id.clone()),
        _ => value.clone(),
    }
}

#[async_trait]
impl ResourceGateway for RestGateway {
    async fn create(&self, attributes: &AttributeSet) -> Result<Created, GatewayError> {
        let rules = match (self.endpoint.structured, attributes.get(RULES)) {
            (Some(Structured::IngressRules), Some(value)) => parse_items::<SecurityGroupRule>(value)?,
            _ => Vec::new(),
        };
        let body = self
            .client
            .post(&self.endpoint.collection, &self.wrap(attributes)?)
            .await?;
        let object = self.unwrap(&body)?;
        let id = object
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::InvalidResponse {
                message: format!("created {} has no id", self.resource_type),
            })?
            .to_string();

        debug!("Created {} {}", self.resource_type, id);
        let mut observed = self.attributes(object)?;
        if let (Some(Structured::IngressRules), Some(value)) =
            (self.endpoint.structured, attributes.get(RULES))
        {
            if let Err(e) = self.create_rules(&id, &rules).await {
                warn!("Adding rules to {} {} failed, deleting it: {}", self.resource_type, id, e);
                if let Err(cleanup) = self.delete(&id).await {
                    warn!("Cleanup of {} {} failed: {}", self.resource_type, id, cleanup);
                }
                return Err(e);
            }
            observed.insert(RULES, value.clone());
        }
        Ok(Created {
            id,
            observed,
            status: self
                .endpoint
                .status_field
                .as_ref()
                .and_then(|field| object.get(field))
                .and_then(Value::as_str)
                .map(String::from),
        })
    }

    async fn read(&self, id: &str) -> Result<Observed, GatewayError> {
        let body = self
            .client
            .get(&self.object_path(id))
            .await
            .map_err(|e| self.contextualize(e, id))?;
        let object = self.unwrap(&body)?;
        Ok(Observed {
            attributes: self.attributes(object)?,
            status: self.status_of(object),
        })
    }

    async fn update(
        &self,
        id: &str,
        attributes: &AttributeSet,
    ) -> Result<AttributeSet, GatewayError> {
        let body = self
            .client
            .put(&self.object_path(id), &self.wrap(attributes)?)
            .await
            .map_err(|e| self.contextualize(e, id))?;
        if body.is_null() {
            return Ok(AttributeSet::new());
        }
        self.attributes(self.unwrap(&body)?)
    }

    async fn delete(&self, id: &str) -> Result<(), GatewayError> {
        self.client
            .delete(&self.object_path(id))
            .await
            .map_err(|e| self.contextualize(e, id))
    }

    async fn status(&self, id: &str) -> Result<String, GatewayError> {
        let body = self
            .client
            .get(&self.object_path(id))
            .await
            .map_err(|e| self.contextualize(e, id))?;
        Ok(self.status_of(self.unwrap(&body)?))
    }

    async fn list(&self) -> Result<Vec<String>, GatewayError> {
        let body = self.client.get(&self.endpoint.collection).await?;
        let items = body
            .get(&self.endpoint.plural)
            .and_then(Value::as_array)
            .ok_or_else(|| GatewayError::InvalidResponse {
                message: format!("response has no '{}' array", self.endpoint.plural),
            })?;
        Ok(items
            .iter()
            .filter_map(|item| item.get("id").and_then(Value::as_str))
            .map(String::from)
            .collect())
    }

    async fn resize(&self, id: &str, attributes: &AttributeSet) -> Result<(), GatewayError> {
        let wrapped = self.wrap(attributes)?;
        let inner = wrapped
            .get(&self.endpoint.envelope)
            .cloned()
            .unwrap_or(Value::Null);
        self.action(id, &json!({ "resize": inner }), "resize").await
    }

    async fn confirm_resize(&self, id: &str) -> Result<(), GatewayError> {
        self.action(id, &json!({ "confirmResize": null }), "confirm_resize")
            .await
    }

    async fn revert_resize(&self, id: &str) -> Result<(), GatewayError> {
        self.action(id, &json!({ "revertResize": null }), "revert_resize")
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn compute_gateway(server: &MockServer) -> RestGateway {
        let client = RestClient::new(&server.uri())
            .unwrap()
            .with_token("secret")
            .with_retry_delay(Duration::from_millis(5));
        RestGateway::new("compute", client, RestEndpoint::builtin("compute").unwrap())
    }

    #[tokio::test]
    async fn test_create_wraps_and_renames() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/servers"))
            .and(header("X-Auth-Token", "secret"))
            .and(body_json(json!({"server": {"name": "web1", "flavorRef": "small"}})))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({
                "server": {"id": "abc", "status": "BUILD", "flavorRef": "small"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let gateway = compute_gateway(&server).await;
        let attrs = AttributeSet::new()
            .with("name", "web1")
            .with("flavor_ref", "small");
        let created = gateway.create(&attrs).await.unwrap();

        assert_eq!(created.id, "abc");
        assert_eq!(created.status.as_deref(), Some("BUILD"));
        assert_eq!(created.observed.get("flavor_ref"), Some(&"small".into()));
    }

    #[tokio::test]
    async fn test_read_maps_status_and_filters_fields() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/servers/abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "server": {
                    "id": "abc",
                    "status": "ACTIVE",
                    "name": "web1",
                    "accessIPv4": "10.0.0.5",
                    "flavor": {"id": "small", "links": []},
                    "addresses": {"private": []},
                    "links": [{"href": "x"}]
                }
            })))
            .mount(&server)
            .await;

        let observed = compute_gateway(&server).await.read("abc").await.unwrap();
        assert_eq!(observed.status, "ACTIVE");
        assert_eq!(observed.attributes.get("access_ip_v4"), Some(&"10.0.0.5".into()));
        assert_eq!(observed.attributes.get("flavor_ref"), Some(&"small".into()));
        assert!(!observed.attributes.contains("links"));
        assert!(!observed.attributes.contains("status"));
    }

    fn network_gateway(server: &MockServer, kind: &str) -> RestGateway {
        let client = RestClient::new(&server.uri())
            .unwrap()
            .with_retry_delay(Duration::from_millis(5));
        RestGateway::new(kind, client, RestEndpoint::builtin(kind).unwrap())
    }

    #[tokio::test]
    async fn test_subnet_read_decodes_allocation_pools() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2.0/subnets/s1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "subnet": {
                    "id": "s1",
                    "name": "app",
                    "network_id": "n1",
                    "cidr": "10.0.0.0/24",
                    "ip_version": 4,
                    "enable_dhcp": true,
                    "gateway_ip": "10.0.0.1",
                    "allocation_pools": [{"start": "10.0.0.2", "end": "10.0.0.254"}],
                    "host_routes": [],
                    "dns_nameservers": [],
                    "tenant_id": "t1"
                }
            })))
            .mount(&server)
            .await;

        let observed = network_gateway(&server, "subnet").read("s1").await.unwrap();
        assert_eq!(observed.status, "ACTIVE");
        assert_eq!(observed.attributes.get("cidr"), Some(&"10.0.0.0/24".into()));
        assert_eq!(
            observed.attributes.get("allocation_pool"),
            Some(&AttributeValue::strings(["10.0.0.2-10.0.0.254"]))
        );
        assert!(!observed.attributes.contains("allocation_pools"));
    }

    #[tokio::test]
    async fn test_subnet_create_sends_allocation_pools() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2.0/subnets"))
            .and(body_json(json!({"subnet": {
                "name": "app",
                "network_id": "n1",
                "cidr": "10.0.0.0/24",
                "ip_version": 4,
                "allocation_pools": [{"start": "10.0.0.10", "end": "10.0.0.20"}]
            }})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "subnet": {
                    "id": "s1",
                    "name": "app",
                    "allocation_pools": [{"start": "10.0.0.10", "end": "10.0.0.20"}]
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let attrs = AttributeSet::new()
            .with("name", "app")
            .with("network_id", "n1")
            .with("cidr", "10.0.0.0/24")
            .with("ip_version", 4_i64)
            .with("allocation_pool", AttributeValue::strings(["10.0.0.10-10.0.0.20"]));
        let created = network_gateway(&server, "subnet").create(&attrs).await.unwrap();
        assert_eq!(created.id, "s1");
        assert_eq!(created.observed.get("allocation_pool"), attrs.get("allocation_pool"));
    }

    fn rule_body(group_id: &str, protocol: Value, port: Value, cidr: Value, group: Value) -> Value {
        json!({"security_group_rule": {
            "security_group_id": group_id,
            "direction": "ingress",
            "ethertype": "IPv4",
            "protocol": protocol,
            "port_range_min": port,
            "port_range_max": port,
            "remote_ip_prefix": cidr,
            "remote_group_id": group
        }})
    }

    async fn mount_group_create(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/v2.0/security-groups"))
            .and(body_json(json!({"security_group": {"name": "web"}})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "security_group": {
                    "id": "sg1",
                    "name": "web",
                    "security_group_rules": [
                        {"direction": "egress", "ethertype": "IPv4", "protocol": null}
                    ]
                }
            })))
            .expect(1)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_security_group_create_adds_each_rule() {
        let server = MockServer::start().await;
        mount_group_create(&server).await;
        Mock::given(method("POST"))
            .and(path("/v2.0/security-group-rules"))
            .and(body_json(rule_body("sg1", json!("tcp"), json!(22), json!("0.0.0.0/0"), Value::Null)))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"security_group_rule": {"id": "r1"}})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v2.0/security-group-rules"))
            .and(body_json(rule_body("sg1", Value::Null, Value::Null, Value::Null, json!("sg-admin"))))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"security_group_rule": {"id": "r2"}})))
            .expect(1)
            .mount(&server)
            .await;

        let rules = AttributeValue::strings(["tcp:22:22:0.0.0.0/0", "any:-1:-1:sg-admin"]);
        let attrs = AttributeSet::new().with("name", "web").with("rules", rules.clone());
        let created = network_gateway(&server, "security_group").create(&attrs).await.unwrap();

        assert_eq!(created.id, "sg1");
        assert_eq!(created.observed.get("rules"), Some(&rules));
    }

    #[tokio::test]
    async fn test_failed_rule_deletes_the_group() {
        let server = MockServer::start().await;
        mount_group_create(&server).await;
        Mock::given(method("POST"))
            .and(path("/v2.0/security-group-rules"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad port"))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/v2.0/security-groups/sg1"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let attrs = AttributeSet::new()
            .with("name", "web")
            .with("rules", AttributeValue::strings(["tcp:22:22:0.0.0.0/0"]));
        let err = network_gateway(&server, "security_group").create(&attrs).await.unwrap_err();
        assert!(matches!(err, GatewayError::RemoteFailure { status: 400, .. }));
    }

    #[tokio::test]
    async fn test_malformed_rule_is_rejected_before_any_call() {
        let server = MockServer::start().await;
        let attrs = AttributeSet::new()
            .with("name", "web")
            .with("rules", AttributeValue::strings(["ssh from anywhere"]));
        let err = network_gateway(&server, "security_group").create(&attrs).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest { .. }));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_security_group_read_decodes_ingress_rules() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2.0/security-groups/sg1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "security_group": {
                    "id": "sg1",
                    "name": "web",
                    "description": "",
                    "tenant_id": "t1",
                    "security_group_rules": [
                        {"direction": "egress", "ethertype": "IPv4", "protocol": null,
                         "port_range_min": null, "port_range_max": null,
                         "remote_ip_prefix": null, "remote_group_id": null},
                        {"direction": "ingress", "ethertype": "IPv4", "protocol": "tcp",
                         "port_range_min": 80, "port_range_max": 443,
                         "remote_ip_prefix": "10.0.0.0/8", "remote_group_id": null},
                        {"direction": "ingress", "ethertype": "IPv6", "protocol": null,
                         "port_range_min": null, "port_range_max": null,
                         "remote_ip_prefix": null, "remote_group_id": null}
                    ]
                }
            })))
            .mount(&server)
            .await;

        let observed = network_gateway(&server, "security_group").read("sg1").await.unwrap();
        assert_eq!(
            observed.attributes.get("rules"),
            Some(&AttributeValue::strings(["tcp:80:443:10.0.0.0/8", "any:-1:-1:::/0"]))
        );
        assert_eq!(observed.attributes.get("tenant_id"), Some(&"t1".into()));
    }

    #[tokio::test]
    async fn test_status_codes_map_to_error_classes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/servers/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/servers/busy"))
            .respond_with(ResponseTemplate::new(409).set_body_string("port in use"))
            .mount(&server)
            .await;

        let gateway = compute_gateway(&server).await;
        assert_eq!(
            gateway.status("gone").await.unwrap_err(),
            GatewayError::not_found("compute", "gone")
        );
        assert_eq!(
            gateway.delete("busy").await.unwrap_err(),
            GatewayError::conflict("compute", "busy", "port in use")
        );
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/servers/abc"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/servers/abc"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"server": {"id": "abc", "status": "ACTIVE"}})),
            )
            .mount(&server)
            .await;

        let status = compute_gateway(&server).await.status("abc").await.unwrap();
        assert_eq!(status, "ACTIVE");
    }

    #[tokio::test]
    async fn test_resize_actions() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/servers/abc/action"))
            .and(body_json(json!({"resize": {"flavorRef": "large"}})))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/servers/abc/action"))
            .and(body_json(json!({"confirmResize": null})))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let gateway = compute_gateway(&server).await;
        gateway
            .resize("abc", &AttributeSet::new().with("flavor_ref", "large"))
            .await
            .unwrap();
        gateway.confirm_resize("abc").await.unwrap();
    }

    #[tokio::test]
    async fn test_statusless_collection_reports_active() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2.0/fw/firewall_policies/p1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "firewall_policy": {"id": "p1", "name": "edge", "audited": false}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2.0/fw/firewall_policies"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "firewall_policies": [{"id": "p1"}, {"id": "p2"}]
            })))
            .mount(&server)
            .await;

        let client = RestClient::new(&server.uri()).unwrap();
        let gateway = RestGateway::new(
            "firewall_policy",
            client,
            RestEndpoint::builtin("firewall_policy").unwrap(),
        );
        assert_eq!(gateway.status("p1").await.unwrap(), "ACTIVE");
        assert_eq!(gateway.list().await.unwrap(), vec!["p1", "p2"]);
        assert!(matches!(
            gateway.resize("p1", &AttributeSet::new()).await,
            Err(GatewayError::Unsupported { .. })
        ));
    }
}
