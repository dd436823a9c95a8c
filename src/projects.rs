//! Project listing and template scaffolding.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::error::GatewayError;
use crate::paths;

#[derive(Debug, Clone, Serialize)]
pub struct ProjectInfo {
    pub name: String,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

/// Starter layouts for new projects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Template {
    Empty,
    Sveltekit,
    Php,
    Python,
}

impl Template {
    /// Unrecognized names fall back to the empty template.
    pub fn from_name(name: &str) -> Self {
        match name {
            "sveltekit" => Self::Sveltekit,
            "php" => Self::Php,
            "python" => Self::Python,
            _ => Self::Empty,
        }
    }
}

/// One entry per directory under the projects root. The root is created on
/// first use.
pub fn list_projects(projects_dir: &Path) -> Result<Vec<ProjectInfo>, GatewayError> {
    if !projects_dir.exists() {
        fs::create_dir_all(projects_dir)?;
        return Ok(Vec::new());
    }
    let mut projects = Vec::new();
    for entry in fs::read_dir(projects_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let meta = entry.metadata()?;
        let modified = meta.modified()?;
        // Creation time is not available on every filesystem.
        let created = meta.created().unwrap_or(modified);
        projects.push(ProjectInfo {
            name: entry.file_name().to_string_lossy().into_owned(),
            created: created.into(),
            modified: modified.into(),
        });
    }
    Ok(projects)
}

pub fn create_project(
    projects_dir: &Path,
    name: &str,
    template: Template,
) -> Result<(), GatewayError> {
    let root = paths::project_root(projects_dir, name)?;
    if root.exists() {
        return Err(GatewayError::ProjectExists);
    }
    match template {
        Template::Empty => scaffold_empty(&root)?,
        Template::Sveltekit => scaffold_sveltekit(&root)?,
        Template::Php => scaffold_php(&root)?,
        Template::Python => scaffold_python(&root)?,
    }
    info!(project = %name, ?template, "project created");
    Ok(())
}

fn scaffold_empty(root: &Path) -> Result<(), GatewayError> {
    fs::create_dir_all(root)?;
    fs::write(root.join("README.md"), "# My Project\n\nStart coding!")?;
    Ok(())
}

fn scaffold_sveltekit(root: &Path) -> Result<(), GatewayError> {
    fs::create_dir_all(root)?;

    let package_json = serde_json::json!({
        "name": "my-sveltekit-app",
        "version": "0.0.1",
        "private": true,
        "scripts": {
            "dev": "vite dev",
            "build": "vite build",
            "preview": "vite preview"
        },
        "devDependencies": {
            "@sveltejs/adapter-auto": "^2.0.0",
            "@sveltejs/kit": "^1.20.4",
            "svelte": "^4.0.5",
            "vite": "^4.4.2"
        }
    });
    fs::write(
        root.join("package.json"),
        serde_json::to_string_pretty(&package_json).map_err(std::io::Error::other)?,
    )?;
    fs::write(
        root.join("README.md"),
        "# SvelteKit App\n\nRun `npm install` then `npm run dev`",
    )?;

    let routes = root.join("src").join("routes");
    fs::create_dir_all(&routes)?;
    fs::write(
        routes.join("+page.svelte"),
        "<script>\n  let count = 0;\n</script>\n\n<h1>Welcome to SvelteKit!</h1>\n<button on:click={() => count++}>Count: {count}</button>\n",
    )?;
    Ok(())
}

fn scaffold_php(root: &Path) -> Result<(), GatewayError> {
    fs::create_dir_all(root)?;

    let index_php = r#"<?php
// Simple PHP Application
echo "<!DOCTYPE html>";
echo "<html><head><title>PHP App</title></head><body>";
echo "<h1>Hello from PHP!</h1>";
echo "<p>PHP Version: " . phpversion() . "</p>";
echo "</body></html>";
?>"#;
    fs::write(root.join("index.php"), index_php)?;
    fs::write(
        root.join("README.md"),
        "# PHP Project\n\nRun with: `php -S localhost:8000`",
    )?;
    Ok(())
}

fn scaffold_python(root: &Path) -> Result<(), GatewayError> {
    fs::create_dir_all(root)?;

    let main_py = r#"#!/usr/bin/env python3
"""Simple Python Application"""

def main():
    print("Hello from Python!")
    print("Ready to code!")

if __name__ == "__main__":
    main()
"#;
    fs::write(root.join("main.py"), main_py)?;
    fs::write(
        root.join("requirements.txt"),
        "# Add your dependencies here\n",
    )?;
    fs::write(
        root.join("README.md"),
        "# Python Project\n\nRun with: `python main.py`",
    )?;
    Ok(())
}
