//! TOML campaign configuration.
//!
//! A campaign document has one top-level `[campaign]` table holding the
//! scalar settings (deadline, schema, resource, policy) plus one sub-table
//! per workflow. A subcampaign table carries fields common to its child
//! workflows; children are keyed `"<subcampaign>.<child>"` after the merge.

use crate::models::{Campaign, ExecutionSchema, ResourceRequest, Workflow};
use crate::CampaignError;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use toml::Value;

/// Keys of the `[campaign]` table that are settings, not workflows.
const RESERVED_KEYS: [&str; 5] = [
    "deadline",
    "execution_schema",
    "resource",
    "requested_resources",
    "policy",
];

/// Scalar settings of the `[campaign]` table.
#[derive(Debug, Clone)]
pub struct CampaignSettings {
    pub deadline_minutes: f64,
    pub execution_schema: ExecutionSchema,
    pub resource: String,
    pub requested_cores: Option<u32>,
    pub policy: String,
}

/// A value that may be written as a comma-separated string or a list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum StringOrList {
    One(String),
    Many(Vec<String>),
}

impl StringOrList {
    fn into_vec(self) -> Vec<String> {
        match self {
            StringOrList::One(value) => value
                .split(',')
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect(),
            StringOrList::Many(values) => values,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WorkflowTable {
    executable: String,
    #[serde(default)]
    subcommand: Option<String>,
    #[serde(default)]
    arguments: Option<StringOrList>,
    #[serde(default)]
    environment: BTreeMap<String, String>,
    #[serde(default = "default_one")]
    ranks: u32,
    #[serde(default = "default_one")]
    threads: u32,
    /// Memory in megabytes.
    memory: u64,
    /// Runtime in minutes.
    runtime: f64,
    #[serde(default)]
    depends: Option<StringOrList>,
}

fn default_one() -> u32 {
    1
}

/// Load and parse a campaign document.
pub fn load_document(path: &Path) -> Result<toml::Table, CampaignError> {
    let text = fs::read_to_string(path).map_err(|err| CampaignError::Config {
        reason: format!("cannot read {}: {err}", path.display()),
    })?;
    toml::from_str(&text).map_err(|err| CampaignError::Config {
        reason: format!("cannot parse {}: {err}", path.display()),
    })
}

fn campaign_table(doc: &toml::Table) -> Result<&toml::Table, CampaignError> {
    doc.get("campaign")
        .and_then(Value::as_table)
        .ok_or_else(|| CampaignError::Config {
            reason: "missing [campaign] table".to_string(),
        })
}

/// Parse a human-readable duration ("2d", "6h", "90m") or a bare number of
/// minutes.
fn parse_deadline(value: &Value) -> Result<f64, CampaignError> {
    match value {
        Value::String(text) => humantime::parse_duration(text)
            .map(|duration| duration.as_secs_f64() / 60.0)
            .map_err(|err| CampaignError::Config {
                reason: format!("invalid deadline {text:?}: {err}"),
            }),
        Value::Integer(minutes) => Ok(*minutes as f64),
        Value::Float(minutes) => Ok(*minutes),
        other => Err(CampaignError::Config {
            reason: format!("invalid deadline value: {other}"),
        }),
    }
}

/// Read the scalar campaign settings.
pub fn settings(doc: &toml::Table) -> Result<CampaignSettings, CampaignError> {
    let campaign = campaign_table(doc)?;
    let deadline_minutes = campaign
        .get("deadline")
        .map(parse_deadline)
        .transpose()?
        .ok_or_else(|| CampaignError::Config {
            reason: "campaign.deadline is required".to_string(),
        })?;
    let execution_schema = match campaign.get("execution_schema").and_then(Value::as_str) {
        None | Some("batch") => ExecutionSchema::Batch,
        Some("remote") => ExecutionSchema::Remote,
        Some(other) => {
            return Err(CampaignError::Config {
                reason: format!("unknown execution_schema {other:?}"),
            })
        }
    };
    let resource = campaign
        .get("resource")
        .and_then(Value::as_str)
        .unwrap_or("tiger3")
        .to_string();
    let requested_cores = match campaign.get("requested_resources") {
        None => None,
        Some(Value::Integer(cores)) if *cores > 0 => Some(*cores as u32),
        Some(other) => {
            return Err(CampaignError::Config {
                reason: format!("invalid requested_resources: {other}"),
            })
        }
    };
    let policy = campaign
        .get("policy")
        .and_then(Value::as_str)
        .unwrap_or("time")
        .to_string();
    Ok(CampaignSettings {
        deadline_minutes,
        execution_schema,
        resource,
        requested_cores,
        policy,
    })
}

/// Extract workflow tables from the campaign, flattening subcampaigns.
///
/// Fields of a subcampaign table that are not child workflows are common
/// configuration and are folded into every child (common fields win, as
/// they pin what the whole subcampaign shares).
pub fn workflow_entries(
    doc: &toml::Table,
    subcampaigns: &[(&str, &[&str])],
) -> Result<BTreeMap<String, toml::Table>, CampaignError> {
    let campaign = campaign_table(doc)?;
    let mut entries = BTreeMap::new();

    for (key, value) in campaign {
        if RESERVED_KEYS.contains(&key.as_str()) {
            continue;
        }
        let Some(table) = value.as_table() else {
            continue;
        };
        let subcampaign = subcampaigns
            .iter()
            .find(|(name, _)| *name == key.as_str())
            .map(|(_, children)| *children);

        match subcampaign {
            Some(children) => {
                let common: Vec<(&String, &Value)> = table
                    .iter()
                    .filter(|(field, _)| !children.contains(&field.as_str()))
                    .collect();
                for child in children {
                    let Some(child_table) = table.get(*child).and_then(Value::as_table) else {
                        continue;
                    };
                    let mut merged = child_table.clone();
                    for (field, value) in &common {
                        merged.insert((*field).clone(), (*value).clone());
                    }
                    entries.insert(format!("{key}.{child}"), merged);
                }
            }
            None => {
                entries.insert(key.clone(), table.clone());
            }
        }
    }
    Ok(entries)
}

/// Build a campaign from a parsed document, keeping only the workflow
/// types the invoking subcommand registered. Workflow ids are assigned in
/// entry order, starting at 1.
pub fn build_campaign(
    doc: &toml::Table,
    registered: &[&str],
    subcampaigns: &[(&str, &[&str])],
) -> Result<Campaign, CampaignError> {
    let settings = settings(doc)?;
    let entries = workflow_entries(doc, subcampaigns)?;

    let mut workflows = Vec::new();
    for (name, table) in entries {
        if !registered.contains(&name.as_str()) {
            continue;
        }
        let parsed: WorkflowTable =
            Value::Table(table)
                .try_into()
                .map_err(|err| CampaignError::Config {
                    reason: format!("workflow {name:?}: {err}"),
                })?;
        workflows.push(Workflow {
            id: workflows.len() as u32 + 1,
            name,
            executable: parsed.executable,
            subcommand: parsed.subcommand,
            arguments: parsed.arguments.map(StringOrList::into_vec).unwrap_or_default(),
            environment: parsed.environment,
            resources: ResourceRequest {
                ranks: parsed.ranks,
                threads: parsed.threads,
                memory_mb: parsed.memory,
                runtime_minutes: parsed.runtime,
            },
            depends: parsed.depends.map(StringOrList::into_vec).unwrap_or_default(),
        });
    }

    Ok(Campaign {
        id: 1,
        workflows,
        deadline_minutes: settings.deadline_minutes,
        resource: settings.resource,
        execution_schema: settings.execution_schema,
        requested_cores: settings.requested_cores,
        policy: settings.policy,
    })
}
