use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::error::{UpdateError, UpdateResult};

// States supervisord accepts a stop request in.
const RUNNING_STATES: [&str; 3] = ["RUNNING", "STARTING", "BACKOFF"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessInfo {
    pub name: String,
    pub statename: String,
    pub pid: i64,
    pub description: String,
}

impl ProcessInfo {
    pub fn is_running(&self) -> bool {
        RUNNING_STATES.contains(&self.statename.as_str())
    }
}

#[async_trait]
pub trait ProcessControl: Send + Sync {
    async fn get_state(&self) -> UpdateResult<String>;
    async fn get_process_info(&self, name: &str) -> UpdateResult<ProcessInfo>;
    async fn start_process(&self, name: &str) -> UpdateResult<bool>;
    async fn stop_process(&self, name: &str) -> UpdateResult<bool>;
}

#[derive(Debug, Clone)]
pub struct XmlRpcProcessControl {
    client: Client,
    url: String,
}

impl XmlRpcProcessControl {
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> UpdateResult<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|err| UpdateError::ProcessControl(format!("failed building http client: {err}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    async fn call(&self, method: &str, params: &[&str]) -> UpdateResult<String> {
        let body = method_call_body(method, params);
        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "text/xml")
            .body(body)
            .send()
            .await
            .map_err(|err| UpdateError::ProcessControl(format!("{method} request failed: {err}")))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|err| UpdateError::ProcessControl(format!("{method} body read failed: {err}")))?;
        if !status.is_success() {
            return Err(UpdateError::ProcessControl(format!(
                "{method} returned http_status={}",
                status.as_u16()
            )));
        }
        debug!(method = method, "xml-rpc call completed");
        parse_method_response(method, &text)
    }
}

#[async_trait]
impl ProcessControl for XmlRpcProcessControl {
    async fn get_state(&self) -> UpdateResult<String> {
        let value = self.call("supervisor.getState", &[]).await?;
        struct_member(&value, "statename").ok_or_else(|| {
            UpdateError::ProcessControl("supervisor.getState: missing statename".to_string())
        })
    }

    async fn get_process_info(&self, name: &str) -> UpdateResult<ProcessInfo> {
        let value = self.call("supervisor.getProcessInfo", &[name]).await?;
        let statename = struct_member(&value, "statename").ok_or_else(|| {
            UpdateError::ProcessControl(format!(
                "supervisor.getProcessInfo({name}): missing statename"
            ))
        })?;
        Ok(ProcessInfo {
            name: struct_member(&value, "name").unwrap_or_else(|| name.to_string()),
            statename,
            pid: struct_member(&value, "pid")
                .and_then(|pid| pid.parse().ok())
                .unwrap_or(0),
            description: struct_member(&value, "description").unwrap_or_default(),
        })
    }

    async fn start_process(&self, name: &str) -> UpdateResult<bool> {
        let value = self.call("supervisor.startProcess", &[name]).await?;
        Ok(scalar_bool(&value))
    }

    async fn stop_process(&self, name: &str) -> UpdateResult<bool> {
        let value = self.call("supervisor.stopProcess", &[name]).await?;
        Ok(scalar_bool(&value))
    }
}

pub struct ProcessSupervisor {
    control: Box<dyn ProcessControl>,
}

impl ProcessSupervisor {
    pub fn new(control: Box<dyn ProcessControl>) -> Self {
        Self { control }
    }

    pub async fn is_running(&self, name: &str) -> UpdateResult<bool> {
        Ok(self.control.get_process_info(name).await?.is_running())
    }

    pub async fn manager_state(&self) -> UpdateResult<String> {
        self.control.get_state().await
    }

    /// Stops the process when it is up, then starts it. No retries.
    #[instrument(name = "supervisor.restart", skip(self))]
    pub async fn restart_process(&self, name: &str) -> UpdateResult<()> {
        if self.is_running(name).await? {
            info!(process = name, "stopping process");
            self.control.stop_process(name).await?;
        }
        info!(process = name, "starting process");
        if !self.control.start_process(name).await? {
            return Err(UpdateError::ProcessControl(format!(
                "supervisor refused to start '{name}'"
            )));
        }
        Ok(())
    }
}

fn method_call_body(method: &str, params: &[&str]) -> String {
    let params = params
        .iter()
        .map(|param| format!("<param><value><string>{}</string></value></param>", xml_escape(param)))
        .collect::<String>();
    format!(
        "<?xml version=\"1.0\"?><methodCall><methodName>{method}</methodName><params>{params}</params></methodCall>"
    )
}

// Returns the inner XML of the single response value, or the fault as an error.
fn parse_method_response(method: &str, body: &str) -> UpdateResult<String> {
    if let Some(fault) = between(body, "<fault>", "</fault>") {
        let code = struct_member(fault, "faultCode").unwrap_or_else(|| "?".to_string());
        let message = struct_member(fault, "faultString").unwrap_or_default();
        return Err(UpdateError::ProcessControl(format!(
            "{method} fault {code}: {message}"
        )));
    }

    let param = between(body, "<param>", "</param>").ok_or_else(|| {
        UpdateError::ProcessControl(format!("{method}: response carries no value"))
    })?;
    let value = between(param, "<value>", "</value>").ok_or_else(|| {
        UpdateError::ProcessControl(format!("{method}: response carries no value"))
    })?;
    Ok(value.to_string())
}

fn struct_member(xml: &str, name: &str) -> Option<String> {
    let marker = format!("<name>{name}</name>");
    let start = xml.find(&marker)? + marker.len();
    let value = between(&xml[start..], "<value>", "</value>")?;
    Some(xml_unescape(strip_type_tag(value)))
}

fn scalar_bool(value: &str) -> bool {
    matches!(strip_type_tag(value), "1" | "true")
}

// `<boolean>1</boolean>` -> `1`; untyped values pass through.
fn strip_type_tag(value: &str) -> &str {
    let value = value.trim();
    if let Some(rest) = value.strip_prefix('<') {
        if let Some(tag_end) = rest.find('>') {
            let tag = &rest[..tag_end];
            let close = format!("</{tag}>");
            if let Some(inner) = rest[tag_end + 1..].strip_suffix(close.as_str()) {
                return inner;
            }
        }
    }
    value
}

fn between<'a>(text: &'a str, open: &str, close: &str) -> Option<&'a str> {
    let start = text.find(open)? + open.len();
    let end = text[start..].find(close)? + start;
    Some(&text[start..end])
}

fn xml_escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn xml_unescape(raw: &str) -> String {
    raw.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
