//! Operation scripts.
//!
//! A script is JSON lines, one command per line. Blank lines and lines
//! starting with `#` are skipped.
//!
//! ```text
//! {"op":"create","path":"/P","kind":"project"}
//! {"op":"create","path":"/P/src/main.rs","kind":"file","contents":"fn main() {}","flags":["force"]}
//! {"op":"batch","rule":"/P","ops":[{"op":"delete","path":"/P/src"},{"op":"create","path":"/P/doc","kind":"folder"}]}
//! ```
//!
//! Every top-level command runs as one operation and is reported as one
//! line of output carrying the `POST_CHANGE` delta it produced. A batch
//! runs all of its commands in a single operation under its rule; batches
//! nested in a batch run inside the enclosing one.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use canopy_kernel::{
    Depth, EventKind, MarkerAttributes, Operation, QualifiedName, ResourceKind, ResourcePath,
    SchedulingRule, UpdateFlags, Workspace, WorkspaceResult,
};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use serde_json::{Value, json};
use tracing::{debug, warn};

/// One scripted command.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    Create {
        path: ResourcePath,
        kind: ResourceKind,
        /// Initial contents; only for files.
        contents: Option<String>,
        #[serde(default = "no_flags", deserialize_with = "flag_names")]
        flags: UpdateFlags,
    },
    Link {
        path: ResourcePath,
        kind: ResourceKind,
        location: PathBuf,
        #[serde(default = "no_flags", deserialize_with = "flag_names")]
        flags: UpdateFlags,
    },
    Delete {
        path: ResourcePath,
        #[serde(default = "no_flags", deserialize_with = "flag_names")]
        flags: UpdateFlags,
    },
    Move {
        from: ResourcePath,
        to: ResourcePath,
        #[serde(default = "no_flags", deserialize_with = "flag_names")]
        flags: UpdateFlags,
    },
    Copy {
        from: ResourcePath,
        to: ResourcePath,
        #[serde(default = "no_flags", deserialize_with = "flag_names")]
        flags: UpdateFlags,
    },
    Write {
        path: ResourcePath,
        contents: String,
        #[serde(default = "no_flags", deserialize_with = "flag_names")]
        flags: UpdateFlags,
    },
    SetDerived {
        path: ResourcePath,
        value: bool,
    },
    SetTeamPrivate {
        path: ResourcePath,
        value: bool,
    },
    SetReadOnly {
        path: ResourcePath,
        value: bool,
    },
    Open {
        path: ResourcePath,
    },
    Close {
        path: ResourcePath,
    },
    Marker {
        path: ResourcePath,
        #[serde(rename = "type")]
        marker_type: String,
        #[serde(default)]
        attributes: MarkerAttributes,
    },
    RemoveMarkers {
        path: ResourcePath,
        #[serde(rename = "type")]
        marker_type: Option<String>,
        #[serde(default = "infinite")]
        depth: Depth,
    },
    SetProperty {
        path: ResourcePath,
        qualifier: String,
        name: String,
        /// `null` or absent removes the property.
        value: Option<String>,
    },
    Batch {
        rule: ResourcePath,
        ops: Vec<Command>,
    },
}

fn no_flags() -> UpdateFlags {
    UpdateFlags::empty()
}

fn infinite() -> Depth {
    Depth::Infinite
}

/// Flags are written by name: `["force", "derived"]`.
fn flag_names<'de, D: Deserializer<'de>>(deserializer: D) -> Result<UpdateFlags, D::Error> {
    let names = Vec::<String>::deserialize(deserializer)?;
    names.iter().try_fold(UpdateFlags::empty(), |flags, name| {
        UpdateFlags::from_name(&name.to_ascii_uppercase())
            .map(|flag| flags | flag)
            .ok_or_else(|| D::Error::custom(format!("unknown flag {name:?}")))
    })
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Create { .. } => "create",
            Command::Link { .. } => "link",
            Command::Delete { .. } => "delete",
            Command::Move { .. } => "move",
            Command::Copy { .. } => "copy",
            Command::Write { .. } => "write",
            Command::SetDerived { .. } => "set_derived",
            Command::SetTeamPrivate { .. } => "set_team_private",
            Command::SetReadOnly { .. } => "set_read_only",
            Command::Open { .. } => "open",
            Command::Close { .. } => "close",
            Command::Marker { .. } => "marker",
            Command::RemoveMarkers { .. } => "remove_markers",
            Command::SetProperty { .. } => "set_property",
            Command::Batch { .. } => "batch",
        }
    }

    /// Rule the command's operation runs under.
    fn rule(&self) -> SchedulingRule {
        match self {
            Command::Batch { rule, .. } => SchedulingRule::new(rule.clone()),
            _ => SchedulingRule::root(),
        }
    }

    /// The non-batch commands, in execution order.
    fn steps(&self) -> Vec<&Command> {
        match self {
            Command::Batch { ops, .. } => ops.iter().flat_map(Command::steps).collect(),
            step => vec![step],
        }
    }
}

/// A command with the line it came from.
#[derive(Debug, Clone)]
pub struct Line {
    pub number: usize,
    pub command: Command,
}

/// Parse script text.
pub fn parse(text: &str) -> Result<Vec<Line>> {
    let mut lines = Vec::new();
    for (index, raw) in text.lines().enumerate() {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let number = index + 1;
        let command = serde_json::from_str(trimmed)
            .with_context(|| format!("line {number}: invalid command"))?;
        lines.push(Line { number, command });
    }
    Ok(lines)
}

async fn apply(op: &mut Operation<'_>, command: &Command) -> WorkspaceResult<Option<Value>> {
    match command {
        Command::Create {
            path,
            kind,
            contents: Some(contents),
            flags,
        } if *kind == ResourceKind::File => {
            op.create_file(path, contents.as_bytes(), *flags).await?;
        }
        Command::Create {
            path, kind, flags, ..
        } => op.create(path, *kind, *flags).await?,
        Command::Link {
            path,
            kind,
            location,
            flags,
        } => op.create_link(path, *kind, location.clone(), *flags).await?,
        Command::Delete { path, flags } => op.delete(path, *flags).await?,
        Command::Move { from, to, flags } => op.move_resource(from, to, *flags).await?,
        Command::Copy { from, to, flags } => op.copy(from, to, *flags).await?,
        Command::Write {
            path,
            contents,
            flags,
        } => op.set_contents(path, contents.as_bytes(), *flags).await?,
        Command::SetDerived { path, value } => op.set_derived(path, *value).await?,
        Command::SetTeamPrivate { path, value } => op.set_team_private(path, *value).await?,
        Command::SetReadOnly { path, value } => op.set_read_only(path, *value).await?,
        Command::Open { path } => op.open_project(path).await?,
        Command::Close { path } => op.close_project(path).await?,
        Command::Marker {
            path,
            marker_type,
            attributes,
        } => {
            let id = op
                .create_marker(path, marker_type, attributes.clone())
                .await?;
            return Ok(Some(json!({ "marker": id })));
        }
        Command::RemoveMarkers {
            path,
            marker_type,
            depth,
        } => {
            let removed = op
                .remove_markers(path, marker_type.as_deref(), true, *depth)
                .await?;
            return Ok(Some(json!({ "removed": removed })));
        }
        Command::SetProperty {
            path,
            qualifier,
            name,
            value,
        } => {
            op.set_property(
                path,
                &QualifiedName::new(qualifier.as_str(), name.as_str()),
                value.as_deref(),
            )
            .await?
        }
        Command::Batch { .. } => {}
    }
    Ok(None)
}

/// Run `lines` against `ws`, writing one JSON object per command to `out`.
///
/// Returns the number of failed commands. Without `keep_going` the first
/// failure ends the run with an error after it has been reported.
pub async fn run(
    ws: &Workspace,
    lines: &[Line],
    keep_going: bool,
    out: &mut impl Write,
) -> Result<usize> {
    let mut changes = ws.subscribe(EventKind::POST_CHANGE);
    let mut failures = 0;

    for line in lines {
        let command = &line.command;
        let mut op = ws.begin(command.rule()).await?;
        let mut results = Vec::new();
        let mut failure = None;
        for step in command.steps() {
            match apply(&mut op, step).await {
                Ok(result) => results.extend(result),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        // A partial success is still published.
        match &failure {
            Some(err) if !err.is_multi_status() => op.abort().await,
            _ => {
                let report = op.commit().await?;
                for failed in &report.listener_failures {
                    warn!(line = line.number, error = %failed.error, "listener failed");
                }
            }
        }

        let deltas: Vec<Value> = changes
            .drain()
            .into_iter()
            .filter_map(|event| event.delta)
            .map(serde_json::to_value)
            .collect::<Result<_, _>>()?;
        let mut record = json!({
            "line": line.number,
            "op": command.name(),
            "deltas": deltas,
        });
        if !results.is_empty() {
            record["results"] = Value::Array(results);
        }
        if let Some(err) = &failure {
            record["error"] = json!({
                "kind": err.kind_name(),
                "message": err.to_string(),
                "paths": err.paths(),
            });
        }
        serde_json::to_writer(&mut *out, &record)?;
        writeln!(out)?;

        if let Some(err) = failure {
            failures += 1;
            if !keep_going {
                bail!("line {}: {} failed: {err}", line.number, command.name());
            }
        } else {
            debug!(line = line.number, op = command.name(), "command applied");
        }
    }
    Ok(failures)
}
