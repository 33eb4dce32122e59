use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{anyhow, Result};
use serde_json::Value;

fn facetnav_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_facetnav"))
}

const SNAPSHOT: &str = r#"{
    "entity_type": "product",
    "entities": [
        {"primary_key": 1, "references": {"brand": [10], "category": [101]}},
        {"primary_key": 2, "references": {"brand": [10], "category": [102]}},
        {"primary_key": 3, "references": {"brand": [11], "category": [102]}},
        {"primary_key": 4, "references": {"brand": [11]}}
    ],
    "references": [
        {"name": "brand", "entity_type": "brand", "group_entity_type": "brandGroup",
         "faceted": true, "groups": [{"group": 5, "facets": [10, 11]}]},
        {"name": "category", "entity_type": "category", "hierarchical": true}
    ],
    "collections": {
        "brand": [
            {"primary_key": 10, "attributes": {"name": "Adidas"}},
            {"primary_key": 11, "attributes": {"name": "Nike"}}
        ],
        "category": [
            {"primary_key": 100, "attributes": {"code": "shoes"}},
            {"primary_key": 101, "parent": 100, "attributes": {"code": "running"}},
            {"primary_key": 102, "parent": 100, "attributes": {"code": "hiking"}}
        ]
    }
}"#;

const QUERY: &str = r#"{
    "filter": {"user_filter": [{"facet_having": {"reference": "brand", "facets": [10]}}]},
    "navigation": {
        "hierarchies": [{
            "output_name": "menu",
            "target": {"reference": "category"},
            "traversal": {"kind": "from_root"},
            "statistics": ["queried_entity_count"]
        }],
        "facet_summaries": [{
            "output_name": "brands",
            "reference": "brand",
            "depth": "impact"
        }]
    }
}"#;

fn write(dir: &Path, name: &str, text: &str) -> Result<PathBuf> {
    let path = dir.join(name);
    fs::write(&path, text)?;
    Ok(path)
}

fn run(args: &[&str]) -> Result<Output> {
    Ok(Command::new(facetnav_bin())
        .args(args)
        .env("FACETNAV_LOG", "off")
        .env("NO_COLOR", "1")
        .output()?)
}

fn path_arg(path: &Path) -> Result<&str> {
    path.to_str().ok_or_else(|| anyhow!("non-utf8 temp path"))
}

#[test]
fn eval_prints_navigation_response() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let snapshot = write(dir.path(), "snapshot.json", SNAPSHOT)?;
    let query = write(dir.path(), "query.json", QUERY)?;

    let output = run(&[
        "eval",
        "--snapshot",
        path_arg(&snapshot)?,
        "--query",
        path_arg(&query)?,
        "--threads",
        "2",
    ])?;
    assert!(
        output.status.success(),
        "eval failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let response: Value = serde_json::from_slice(&output.stdout)?;
    let menu = &response["hierarchies"]["menu"];
    assert_eq!(menu[0]["node"], 100);
    assert_eq!(menu[0]["queried_entity_count"], 2);
    // Both subcategories hold an Adidas product.
    assert_eq!(menu[0]["children"].as_array().map(Vec::len), Some(2));

    let brands = &response["facet_summaries"]["brands"][0];
    assert_eq!(brands["group_entity"], 5);
    let nike = &brands["facets"][1];
    assert_eq!(nike["facet_entity"], 11);
    assert_eq!(nike["impact"]["match_count"], 4);
    assert_eq!(nike["impact"]["difference"], 2);
    assert_eq!(nike["impact"]["has_sense"], true);
    Ok(())
}

#[test]
fn eval_reports_configuration_errors() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let snapshot = write(dir.path(), "snapshot.json", SNAPSHOT)?;
    let query = write(
        dir.path(),
        "query.json",
        r#"{"navigation": {"hierarchies": [{
            "output_name": "menu",
            "target": {"reference": "category"},
            "traversal": {"kind": "children"}
        }]}}"#,
    )?;

    let output = run(&[
        "eval",
        "--snapshot",
        path_arg(&snapshot)?,
        "--query",
        path_arg(&query)?,
    ])?;
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("requires the query to filter within a node"), "{stderr}");
    Ok(())
}

#[test]
fn inspect_lists_indexes() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let snapshot = write(dir.path(), "snapshot.json", SNAPSHOT)?;

    let output = run(&["inspect", "--snapshot", path_arg(&snapshot)?])?;
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Entities: 4"), "{stdout}");
    assert!(stdout.contains("3 nodes"), "{stdout}");
    assert!(stdout.contains("2 facets in 1 groups"), "{stdout}");
    Ok(())
}
