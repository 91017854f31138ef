use crate::output::{print_json, print_table};
use anyhow::{Context, Result};
use flowwatch_core::config::MonitorConfig;
use flowwatch_core::store::{ChangeStore, RedbChangeStore};
use flowwatch_core::StateChange;
use std::path::Path;

/// Print persisted state changes in sequence order.
pub fn run(root: &Path, workflow: Option<&str>, json: bool) -> Result<()> {
    let config = MonitorConfig::load(root).context("failed to load config")?;
    let store_path = config.store_path(root);
    if !store_path.exists() {
        if json {
            print_json(&Vec::<StateChange>::new())?;
        } else {
            println!("No changes recorded.");
        }
        return Ok(());
    }

    let store = RedbChangeStore::open(&store_path)
        .with_context(|| format!("failed to open change store {}", store_path.display()))?;
    let changes = match workflow {
        Some(id) => store.list_for(id)?,
        None => store.list_all()?,
    };

    if json {
        return print_json(&changes);
    }
    if changes.is_empty() {
        println!("No changes recorded.");
        return Ok(());
    }

    let rows: Vec<Vec<String>> = changes.iter().map(row).collect();
    print_table(&["SEQ", "TIME", "WORKFLOW", "EVENT", "FIELDS"], &rows);
    Ok(())
}

fn row(change: &StateChange) -> Vec<String> {
    let fields: Vec<String> = change
        .changed_fields
        .iter()
        .map(|(k, v)| match v {
            serde_json::Value::String(s) => format!("{k}={s}"),
            other => format!("{k}={other}"),
        })
        .collect();
    vec![
        change.sequence.to_string(),
        change.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
        change.workflow_id.clone(),
        change.event_type.to_string(),
        fields.join(" "),
    ]
}
