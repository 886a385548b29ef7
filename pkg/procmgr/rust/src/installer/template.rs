// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::config::{Home, ManagerConfig};
use crate::error::{Error, Result};
use serde::Serialize;
use std::path::Path;

const LABEL_MAX_LEN: usize = 16;

/// The closed set of values unit files and commands may reference as `{{name}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TemplateVars {
    pub label: String,
    pub name: String,
    pub description: String,
    pub server_path: String,
    pub client_path: String,
    pub config_path: String,
    pub home_path: String,
    pub username: String,
}

impl TemplateVars {
    /// `bin_dir` holds the `procmgrd` and `procmgr` executables.
    pub fn new(home: &Home, config: &ManagerConfig, bin_dir: &Path) -> Self {
        Self {
            label: make_label(&config.name),
            name: config.name.clone(),
            description: config.description.clone(),
            server_path: bin_dir.join("procmgrd").display().to_string(),
            client_path: bin_dir.join("procmgr").display().to_string(),
            config_path: home.config_path().display().to_string(),
            home_path: home.dir().display().to_string(),
            username: config.process_owner.clone().unwrap_or_default(),
        }
    }

    fn lookup(&self, reference: &str) -> Option<&str> {
        let value = match reference {
            "label" => &self.label,
            "name" => &self.name,
            "description" => &self.description,
            "server_path" => &self.server_path,
            "client_path" => &self.client_path,
            "config_path" => &self.config_path,
            "home_path" => &self.home_path,
            "username" => &self.username,
            _ => return None,
        };
        Some(value)
    }
}

/// Lowercase ASCII letters of `name`, at most 16 of them.
pub fn make_label(name: &str) -> String {
    name.chars()
        .map(|c| c.to_ascii_lowercase())
        .filter(char::is_ascii_lowercase)
        .take(LABEL_MAX_LEN)
        .collect()
}

/// Substitute every `{{reference}}` in `template`.
///
/// References must match `[a-z_]+` and name a known variable, anything else
/// is an error. A `{{` without closing `}}` is left as is.
pub fn render(template: &str, vars: &TemplateVars) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start + 2..].find("}}") else {
            break;
        };
        let reference = &rest[start + 2..start + 2 + len];
        if reference.is_empty() || !reference.bytes().all(|b| b.is_ascii_lowercase() || b == b'_') {
            return Err(Error::other(format!(
                "Invalid reference format: \"{reference}\", must match [a-z_]+"
            )));
        }
        let value = vars
            .lookup(reference)
            .ok_or_else(|| Error::other(format!("Unknown reference: \"{reference}\"")))?;

        out.push_str(&rest[..start]);
        out.push_str(value);
        rest = &rest[start + 2 + len + 2..];
    }
    out.push_str(rest);
    Ok(out)
}
