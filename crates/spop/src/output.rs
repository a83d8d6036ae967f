use std::io::IsTerminal;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;
use serde_json::{json, Value};
use spop_frame::{Action, Actions, AgentHello, TypedData};

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
pub struct ProbeOutput {
    pub addr: String,
    pub version: String,
    pub max_frame_size: u32,
    pub capabilities: Vec<String>,
    pub healthcheck: bool,
    pub latency_ms: f64,
}

impl ProbeOutput {
    pub fn new(addr: &str, hello: &AgentHello, healthcheck: bool, latency_ms: f64) -> Self {
        Self {
            addr: addr.to_string(),
            version: hello.version.clone(),
            max_frame_size: hello.max_frame_size,
            capabilities: hello.capabilities.clone(),
            healthcheck,
            latency_ms,
        }
    }
}

#[derive(Serialize, Debug, PartialEq)]
pub struct ActionOutput {
    pub action: &'static str,
    pub scope: &'static str,
    pub name: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub value_type: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl From<&Action> for ActionOutput {
    fn from(action: &Action) -> Self {
        match action {
            Action::SetVar { scope, name, value } => Self {
                action: "set-var",
                scope: scope.as_str(),
                name: name.clone(),
                value_type: Some(value.type_name()),
                value: Some(typed_to_json(value)),
            },
            Action::UnsetVar { scope, name } => Self {
                action: "unset-var",
                scope: scope.as_str(),
                name: name.clone(),
                value_type: None,
                value: None,
            },
        }
    }
}

#[derive(Serialize)]
pub struct NotifyOutput {
    pub stream_id: u64,
    pub frame_id: u64,
    pub latency_ms: f64,
    pub actions: Vec<ActionOutput>,
}

impl NotifyOutput {
    pub fn new(stream_id: u64, frame_id: u64, actions: &Actions, latency_ms: f64) -> Self {
        Self {
            stream_id,
            frame_id,
            latency_ms,
            actions: actions.iter().map(ActionOutput::from).collect(),
        }
    }
}

pub fn print_probe(out: &ProbeOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(out),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["AGENT", "VERSION", "MAX FRAME", "CAPABILITIES", "LATENCY"])
                .add_row(vec![
                    out.addr.clone(),
                    out.version.clone(),
                    out.max_frame_size.to_string(),
                    capabilities_label(&out.capabilities),
                    format!("{:.2}ms", out.latency_ms),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!("Agent:");
            println!("  Address:          {}", out.addr);
            println!("  Version:          {}", out.version);
            println!("  Max frame size:   {}", out.max_frame_size);
            println!("  Capabilities:     {}", capabilities_label(&out.capabilities));
            println!("  Health check:     {}", out.healthcheck);
            println!("  Latency:          {:.2}ms", out.latency_ms);
        }
    }
}

pub fn print_notify(out: &NotifyOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(out),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["ACTION", "SCOPE", "NAME", "TYPE", "VALUE"]);
            for action in &out.actions {
                table.add_row(vec![
                    action.action.to_string(),
                    action.scope.to_string(),
                    action.name.clone(),
                    action.value_type.unwrap_or("-").to_string(),
                    action.value.as_ref().map(value_label).unwrap_or_default(),
                ]);
            }
            println!(
                "ACK stream={} frame={} ({:.2}ms)",
                out.stream_id, out.frame_id, out.latency_ms
            );
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "ACK stream={} frame={} actions={} ({:.2}ms)",
                out.stream_id,
                out.frame_id,
                out.actions.len(),
                out.latency_ms
            );
            for action in &out.actions {
                match &action.value {
                    Some(value) => println!(
                        "  {} {}.{} = {}",
                        action.action,
                        action.scope,
                        action.name,
                        value_label(value)
                    ),
                    None => println!("  {} {}.{}", action.action, action.scope, action.name),
                }
            }
        }
    }
}

/// JSON rendering of a protocol value. Binary values become lowercase hex.
pub fn typed_to_json(value: &TypedData) -> Value {
    match value {
        TypedData::Null => Value::Null,
        TypedData::Bool(v) => json!(v),
        TypedData::Int32(v) => json!(v),
        TypedData::Uint32(v) => json!(v),
        TypedData::Int64(v) => json!(v),
        TypedData::Uint64(v) => json!(v),
        TypedData::Ipv4(v) => json!(v.to_string()),
        TypedData::Ipv6(v) => json!(v.to_string()),
        TypedData::String(v) => json!(v),
        TypedData::Binary(v) => json!(v.iter().map(|b| format!("{b:02x}")).collect::<String>()),
    }
}

fn print_json(out: &impl Serialize) {
    println!(
        "{}",
        serde_json::to_string(out).unwrap_or_else(|_| "{}".to_string())
    );
}

fn capabilities_label(capabilities: &[String]) -> String {
    if capabilities.is_empty() {
        "none".to_string()
    } else {
        capabilities.join(", ")
    }
}

fn value_label(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use spop_frame::Scope;

    use super::*;

    #[test]
    fn set_var_renders_type_and_value() {
        let action = Action::set_var(Scope::Transaction, "check.ip", Ipv4Addr::new(10, 0, 0, 1));
        let out = ActionOutput::from(&action);
        assert_eq!(out.action, "set-var");
        assert_eq!(out.scope, "txn");
        assert_eq!(out.value_type, Some("ipv4"));
        assert_eq!(out.value, Some(json!("10.0.0.1")));
    }

    #[test]
    fn unset_var_has_no_value() {
        let out = ActionOutput::from(&Action::unset_var(Scope::Session, "gone"));
        let rendered = serde_json::to_value(&out).unwrap();
        assert_eq!(
            rendered,
            json!({"action": "unset-var", "scope": "sess", "name": "gone"})
        );
    }

    #[test]
    fn binary_values_render_as_hex() {
        let value = TypedData::from(vec![0xde, 0xad, 0x01]);
        assert_eq!(typed_to_json(&value), json!("dead01"));
        assert_eq!(typed_to_json(&TypedData::Int32(-4)), json!(-4));
    }
}
