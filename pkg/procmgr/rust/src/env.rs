// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::config::ServiceSpec;
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::path::Path;

/// Parse a `KEY=VALUE` environment file.
/// Supports `KEY="VALUE"`, `KEY='VALUE'`, `export KEY=VALUE`, comments (#), and blank lines.
pub fn parse_environment_file(path: &Path) -> Result<Vec<(String, String)>> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        Error::other(format!("Could not read environment file \"{}\"", path.display())).because_of(&e)
    })?;
    let mut vars = Vec::new();
    for line in contents.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let trimmed = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        if let Some((key, raw_val)) = trimmed.split_once('=') {
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            let val = unquote(raw_val.trim());
            vars.push((key.to_string(), val.to_string()));
        }
    }
    Ok(vars)
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|v| v.strip_suffix(quote))
        {
            return inner;
        }
    }
    value
}

/// Variables a service adds on top of its base environment: the env file
/// first, then the inline `env` map, which wins on conflicts.
pub fn service_overlay(spec: &ServiceSpec, service_home: &Path) -> Result<BTreeMap<String, String>> {
    let mut vars = BTreeMap::new();
    if let Some(ref env_file) = spec.env_file {
        vars.extend(parse_environment_file(&service_home.join(env_file))?);
    }
    vars.extend(spec.env.iter().map(|(k, v)| (k.clone(), v.clone())));
    Ok(vars)
}
