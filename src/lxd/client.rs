//! HTTP client for the LXD REST API

use std::collections::HashMap;
use std::time::Duration;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::operation::{Operation, OperationStatus};
use crate::instance::{validate_name, CreateInstanceRequest, Instance};
use crate::network::{NetworkSpec, ProfileSpec};
use crate::{Error, Result};

/// Requested instance state change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StateAction {
    Start,
    Stop,
}

impl std::fmt::Display for StateAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateAction::Start => write!(f, "start"),
            StateAction::Stop => write!(f, "stop"),
        }
    }
}

/// Body of `POST /1.0/instances/<name>/exec`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecRequest {
    pub command: Vec<String>,
    pub environment: HashMap<String, String>,
    pub interactive: bool,
    #[serde(rename = "wait-for-websocket")]
    pub wait_for_websocket: bool,
}

/// Operation created by an exec request and the websocket secrets it exposes
#[derive(Debug, Clone, Default)]
pub struct ExecSession {
    pub operation: String,
    pub fds: HashMap<String, String>,
}

/// The subset of the daemon API used by yurt.
///
/// Implemented over HTTP by [`LxdClient`]; components take it as a
/// capability so tests can substitute a fake daemon.
#[cfg_attr(test, mockall::automock)]
pub trait DaemonApi {
    /// Check that the daemon answers
    fn ping(&self) -> Result<()>;

    /// Current state of an operation. `NotFound` once the daemon forgets it.
    fn get_operation(&self, uri: &str) -> Result<Operation>;

    /// Block until an operation finishes and return its final state
    fn wait_operation(&self, uri: &str) -> Result<Operation>;

    fn list_instances(&self) -> Result<Vec<Instance>>;

    fn get_instance(&self, name: &str) -> Result<Instance>;

    /// Submit an instance creation request, returning the operation URI
    fn create_instance(&self, request: &CreateInstanceRequest) -> Result<String>;

    /// Start or stop an instance and wait for the daemon to finish
    fn change_state(&self, name: &str, action: StateAction, force: bool) -> Result<()>;

    /// Delete an instance and wait for the daemon to finish
    fn delete_instance(&self, name: &str) -> Result<()>;

    fn exec(&self, name: &str, request: &ExecRequest) -> Result<ExecSession>;

    fn network_exists(&self, name: &str) -> Result<bool>;

    fn create_network(&self, spec: &NetworkSpec) -> Result<()>;

    fn profile_exists(&self, name: &str) -> Result<bool>;

    fn create_profile(&self, spec: &ProfileSpec) -> Result<()>;

    /// Raw records of the images cached by the daemon
    fn list_images(&self) -> Result<Vec<serde_json::Value>>;
}

/// Standard LXD response envelope
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    operation: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    metadata: serde_json::Value,
}

const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_');

/// Encode `value` as a single path segment. Dot segments are rejected since
/// URL normalization resolves them even when percent-encoded.
fn segment(value: &str) -> Result<String> {
    if value.is_empty() || value.chars().all(|c| c == '.') {
        return Err(Error::Configuration(format!(
            "'{}' cannot be used as a resource name",
            value
        )));
    }
    Ok(utf8_percent_encode(value, SEGMENT).to_string())
}

/// Path of an instance, for names that pass [`validate_name`]
fn instance_path(name: &str, suffix: &str) -> Result<String> {
    validate_name(name)?;
    Ok(format!("/1.0/instances/{}{}", segment(name)?, suffix))
}

/// LXD client talking to the daemon's local HTTP endpoint
pub struct LxdClient {
    http: Client,
    base_url: String,
    port: u16,
}

impl LxdClient {
    /// Build a client for `http://127.0.0.1:<port>` without contacting it
    pub fn new(port: u16) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("yurt/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(5))
            .timeout(None::<Duration>)
            .build()
            .map_err(|e| Error::Connection(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: format!("http://127.0.0.1:{}", port),
            port,
        })
    }

    /// Build a client and verify the daemon is reachable
    pub fn connect(port: u16) -> Result<Self> {
        let client = Self::new(port)?;
        client.ping()?;
        tracing::debug!(port, "Connected to LXD");
        Ok(client)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn send(&self, request: RequestBuilder, context: &str) -> Result<Envelope> {
        let resp = request
            .send()
            .map_err(|e| Error::from_http(e, context))?;

        let status = resp.status();
        let body = resp.text().map_err(|e| Error::from_http(e, context))?;

        if status == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(context.to_string()));
        }

        let envelope: Envelope = serde_json::from_str(&body).map_err(|e| {
            Error::Protocol(format!("{}: malformed response ({}): {}", context, status, e))
        })?;

        if !status.is_success() || envelope.kind == "error" {
            let reason = envelope
                .error
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| status.to_string());
            return Err(Error::Api(format!("{}: {}", context, reason)));
        }

        Ok(envelope)
    }

    fn metadata<T: DeserializeOwned>(envelope: Envelope, context: &str) -> Result<T> {
        serde_json::from_value(envelope.metadata)
            .map_err(|e| Error::Protocol(format!("{}: {}", context, e)))
    }

    fn operation_uri(envelope: &Envelope, context: &str) -> Result<String> {
        envelope
            .operation
            .clone()
            .filter(|op| !op.is_empty())
            .ok_or_else(|| Error::Protocol(format!("{}: response has no operation", context)))
    }

    fn wait_for(&self, uri: &str) -> Result<()> {
        let op = self.wait_operation(uri)?;
        match op.status {
            OperationStatus::Failure | OperationStatus::Cancelled => Err(Error::Api(format!(
                "{} ended with {}: {}",
                op.description, op.status, op.err
            ))),
            _ => Ok(()),
        }
    }

    fn exists(&self, path: &str, context: &str) -> Result<bool> {
        match self.send(self.http.get(self.url(path)), context) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

impl DaemonApi for LxdClient {
    fn ping(&self) -> Result<()> {
        self.send(self.http.get(self.url("/1.0")), "LXD server")?;
        Ok(())
    }

    fn get_operation(&self, uri: &str) -> Result<Operation> {
        let context = format!("operation {}", uri);
        let envelope = self.send(self.http.get(self.url(uri)), &context)?;
        Operation::from_value(uri, envelope.metadata)
    }

    fn wait_operation(&self, uri: &str) -> Result<Operation> {
        let context = format!("operation {}", uri);
        let envelope = self.send(self.http.get(self.url(&format!("{}/wait", uri))), &context)?;
        Operation::from_value(uri, envelope.metadata)
    }

    fn list_instances(&self) -> Result<Vec<Instance>> {
        let context = "instance list";
        let envelope = self.send(
            self.http.get(self.url("/1.0/instances?recursion=2")),
            context,
        )?;
        Self::metadata(envelope, context)
    }

    fn get_instance(&self, name: &str) -> Result<Instance> {
        let context = format!("instance {}", name);
        let envelope = self.send(
            self.http
                .get(self.url(&instance_path(name, "?recursion=1")?)),
            &context,
        )?;
        Self::metadata(envelope, &context)
    }

    fn create_instance(&self, request: &CreateInstanceRequest) -> Result<String> {
        let context = format!("create instance {}", request.name);
        let envelope = self.send(
            self.http.post(self.url("/1.0/instances")).json(request),
            &context,
        )?;
        Self::operation_uri(&envelope, &context)
    }

    fn change_state(&self, name: &str, action: StateAction, force: bool) -> Result<()> {
        let context = format!("instance {}", name);
        let body = serde_json::json!({
            "action": action,
            "timeout": -1,
            "force": force,
        });
        let envelope = self.send(
            self.http
                .put(self.url(&instance_path(name, "/state")?))
                .json(&body),
            &context,
        )?;
        let uri = Self::operation_uri(&envelope, &context)?;
        self.wait_for(&uri)
    }

    fn delete_instance(&self, name: &str) -> Result<()> {
        let context = format!("instance {}", name);
        let envelope = self.send(
            self.http.delete(self.url(&instance_path(name, "")?)),
            &context,
        )?;
        let uri = Self::operation_uri(&envelope, &context)?;
        self.wait_for(&uri)
    }

    fn exec(&self, name: &str, request: &ExecRequest) -> Result<ExecSession> {
        let context = format!("instance {}", name);
        let envelope = self.send(
            self.http
                .post(self.url(&instance_path(name, "/exec")?))
                .json(request),
            &context,
        )?;
        let operation = Self::operation_uri(&envelope, &context)?;

        let fds = envelope
            .metadata
            .pointer("/metadata/fds")
            .and_then(|v| v.as_object())
            .map(|fds| {
                fds.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        Ok(ExecSession { operation, fds })
    }

    fn network_exists(&self, name: &str) -> Result<bool> {
        self.exists(&format!("/1.0/networks/{}", segment(name)?), &format!("network {}", name))
    }

    fn create_network(&self, spec: &NetworkSpec) -> Result<()> {
        let context = format!("create network {}", spec.name);
        self.send(self.http.post(self.url("/1.0/networks")).json(spec), &context)?;
        Ok(())
    }

    fn profile_exists(&self, name: &str) -> Result<bool> {
        self.exists(&format!("/1.0/profiles/{}", segment(name)?), &format!("profile {}", name))
    }

    fn create_profile(&self, spec: &ProfileSpec) -> Result<()> {
        let context = format!("create profile {}", spec.name);
        self.send(self.http.post(self.url("/1.0/profiles")).json(spec), &context)?;
        Ok(())
    }

    fn list_images(&self) -> Result<Vec<serde_json::Value>> {
        let context = "image list";
        let envelope = self.send(self.http.get(self.url("/1.0/images?recursion=1")), context)?;
        Self::metadata(envelope, context)
    }
}
