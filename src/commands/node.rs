//! Node queries and power commands against a wakeward controller.

use anyhow::Result;
use colored::Colorize;

use crate::client::{NodeCommand, WakewardClient};
use crate::config;
use crate::domain::node::Node;
use crate::domain::types::{CommandOutcome, PowerState};

pub enum Request {
    Health,
    Nodes,
    Node(String),
    Guests(String),
    Command(String, NodeCommand),
    Detect,
    Reconcile(Option<String>),
}

pub struct Target<'a> {
    pub controller: Option<&'a str>,
    pub config_path: Option<&'a str>,
    pub format: &'a str,
}

pub fn run(target: &Target<'_>, request: Request) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_async(target, request))
}

async fn run_async(target: &Target<'_>, request: Request) -> Result<()> {
    let cfg = config::load(target.config_path)?;
    let client = WakewardClient::from_controller(target.controller, &cfg.controllers)?;
    let format = target.format;

    match request {
        Request::Health => {
            let data = client.health().await?;
            print_output(format, &data)
        }
        Request::Nodes => {
            let nodes = client.nodes().await?;
            if format == "json" {
                print_output(format, &nodes)
            } else {
                print_table(&nodes);
                Ok(())
            }
        }
        Request::Node(id) => {
            let data = client.node(&id).await?;
            print_output(format, &data)
        }
        Request::Guests(host) => {
            let data = client.guests(&host).await?;
            print_output(format, &data)
        }
        Request::Command(id, command) => {
            let outcome = client.command(&id, command).await?;
            print_outcome(format, &outcome)
        }
        Request::Detect => {
            let outcome = client.detect().await?;
            print_outcome(format, &outcome)
        }
        Request::Reconcile(None) => {
            let outcome = client.reconcile().await?;
            print_outcome(format, &outcome)
        }
        Request::Reconcile(Some(id)) => {
            let outcome = client.command(&id, NodeCommand::Reconcile).await?;
            print_outcome(format, &outcome)
        }
    }
}

fn print_outcome(format: &str, outcome: &CommandOutcome) -> Result<()> {
    if format == "json" {
        return print_output(format, outcome);
    }
    if outcome.success {
        println!("{} {}", "ok".green().bold(), outcome.message);
        Ok(())
    } else {
        println!("{} {}", "failed".red().bold(), outcome.message);
        std::process::exit(1);
    }
}

fn colored_state(state: PowerState) -> String {
    let label = state.to_string();
    match state {
        PowerState::On => label.green().to_string(),
        PowerState::Suspended => label.yellow().to_string(),
        PowerState::Off => label.dimmed().to_string(),
        PowerState::InitFailed => label.red().to_string(),
        PowerState::Unknown => label.blue().to_string(),
    }
}

fn print_table(nodes: &[Node]) {
    if nodes.is_empty() {
        println!("(no nodes)");
        return;
    }
    let id_width = nodes.iter().map(|n| n.id.len()).max().unwrap_or(2).max(2);
    println!(
        "{}",
        format!(
            "{:<id_width$}  {:<12}  {:<12}  {:<8}  {}",
            "ID", "CURRENT", "DESIRED", "INIT", "HOST"
        )
        .bold()
    );
    for node in nodes {
        // Pad before colouring so escape codes do not skew the columns.
        let current = format!("{:<12}", node.current_state.to_string());
        let current = current.replace(
            &node.current_state.to_string(),
            &colored_state(node.current_state),
        );
        println!(
            "{:<id_width$}  {}  {:<12}  {:<8}  {}",
            node.id,
            current,
            node.desired_state.to_string(),
            if node.initialized { "yes" } else { "no" },
            node.hostname,
        );
    }
}

fn print_output<T: serde::Serialize>(format: &str, data: &T) -> Result<()> {
    match format {
        "json" => {
            let json = serde_json::to_string_pretty(data)?;
            println!("{}", json);
        }
        _ => {
            // Table format: recursive key-value from serde_json::Value
            let value = serde_json::to_value(data)?;
            print_value(&value, 0);
        }
    }
    Ok(())
}

fn print_value(value: &serde_json::Value, indent: usize) {
    let pad = "  ".repeat(indent);
    match value {
        serde_json::Value::Object(map) => {
            for (key, val) in map {
                match val {
                    serde_json::Value::Object(_) => {
                        println!("{}{}:", pad, key);
                        print_value(val, indent + 1);
                    }
                    serde_json::Value::Array(arr) => {
                        if arr.is_empty() {
                            println!("{}{}: []", pad, key);
                        } else if arr.iter().all(|v| !v.is_object() && !v.is_array()) {
                            let items: Vec<String> = arr.iter().map(format_scalar).collect();
                            println!("{}{}: {}", pad, key, items.join(", "));
                        } else {
                            println!("{}{}:", pad, key);
                            for (i, item) in arr.iter().enumerate() {
                                if item.is_object() {
                                    println!("{}  [{}]:", pad, i);
                                    print_value(item, indent + 2);
                                } else {
                                    println!("{}  - {}", pad, format_scalar(item));
                                }
                            }
                        }
                    }
                    _ => {
                        println!("{}{}: {}", pad, key, format_scalar(val));
                    }
                }
            }
        }
        serde_json::Value::Array(arr) => {
            for (i, item) in arr.iter().enumerate() {
                if item.is_object() {
                    println!("{}[{}]:", pad, i);
                    print_value(item, indent + 1);
                } else {
                    println!("{}- {}", pad, format_scalar(item));
                }
            }
        }
        _ => {
            println!("{}{}", pad, format_scalar(value));
        }
    }
}

fn format_scalar(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => "-".to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}
