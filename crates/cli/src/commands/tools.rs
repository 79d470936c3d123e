//! `metricchat tools`: print the tool catalog a script declares.

use std::path::Path;

use crate::replay::Script;

pub fn run(script_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let script = Script::load(script_path)?;
    let catalog = serde_json::json!({ "tools": script.registry().definitions() });
    println!("{}", serde_json::to_string_pretty(&catalog)?);
    Ok(())
}
